//! `scripthost doctor`: diagnose installation and configuration issues.

use std::path::Path;

use anyhow::{Result, bail};
use serde::Serialize;

use scripthost::config::{Config, ConfigError};
use scripthost::process::Interpreters;

// ============================================================================
// Report Types
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Ok,
    Warn,
    Error,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    status: CheckStatus,
    message: String,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Ok,
            message: message.into(),
        }
    }

    fn warn(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Warn,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Section {
    name: String,
    checks: Vec<CheckResult>,
}

#[derive(Debug, Serialize)]
struct Summary {
    ok: usize,
    warn: usize,
    error: usize,
}

#[derive(Debug, Serialize)]
struct Report {
    status: CheckStatus,
    sections: Vec<Section>,
    summary: Summary,
}

impl Report {
    fn from_sections(sections: Vec<Section>) -> Self {
        let mut summary = Summary {
            ok: 0,
            warn: 0,
            error: 0,
        };
        for check in sections.iter().flat_map(|s| &s.checks) {
            match check.status {
                CheckStatus::Ok => summary.ok += 1,
                CheckStatus::Warn => summary.warn += 1,
                CheckStatus::Error => summary.error += 1,
            }
        }
        let status = if summary.error > 0 {
            CheckStatus::Error
        } else if summary.warn > 0 {
            CheckStatus::Warn
        } else {
            CheckStatus::Ok
        };
        Report {
            status,
            sections,
            summary,
        }
    }

    fn render(&self, format: &str) -> Result<()> {
        match format {
            "json" => println!("{}", serde_json::to_string_pretty(self)?),
            _ => self.render_text(),
        }
        Ok(())
    }

    fn render_text(&self) {
        println!("scripthost doctor");
        println!("{}", "=".repeat(50));

        for section in self.sections.iter().filter(|s| !s.checks.is_empty()) {
            println!();
            println!("{}", section.name);
            println!("{}", "-".repeat(section.name.len()));
            for check in &section.checks {
                let label = match check.status {
                    CheckStatus::Ok => "  OK   ",
                    CheckStatus::Warn => "  WARN ",
                    CheckStatus::Error => "  ERROR",
                };
                println!("{} {}", label, check.message);
            }
        }

        println!();
        let status_label = match self.status {
            CheckStatus::Ok => "PASS",
            CheckStatus::Warn => "PASS (with warnings)",
            CheckStatus::Error => "FAIL",
        };
        println!(
            "{}: {} ok, {} warning(s), {} error(s)",
            status_label, self.summary.ok, self.summary.warn, self.summary.error,
        );
    }
}

// ============================================================================
// Entry Point
// ============================================================================

pub async fn run(config_path: &str, format: &str) -> Result<()> {
    let mut sections = Vec::new();

    if let Some(config) = check_config(&mut sections, config_path).await {
        check_directories(&mut sections, &config, config_path).await;
        sections.push(check_interpreters(&config.interpreters));
        sections.push(check_gateways(&config));
    }

    let report = Report::from_sections(sections);
    report.render(format)?;

    if report.summary.error > 0 {
        bail!("{} error(s) found", report.summary.error);
    }
    Ok(())
}

// ============================================================================
// Check: Configuration
// ============================================================================

async fn check_config(sections: &mut Vec<Section>, config_path: &str) -> Option<Config> {
    let mut checks = Vec::new();

    if Path::new(config_path).exists() {
        checks.push(CheckResult::ok(format!("Config file '{config_path}' found")));
    } else {
        checks.push(CheckResult::warn(format!(
            "Config file '{config_path}' not found, using defaults"
        )));
    }

    let config = match Config::load(config_path).await {
        Ok(config) => Some(config),
        Err(e) => {
            let message = match &e {
                ConfigError::Yaml(_) => format!("Invalid YAML: {e}"),
                ConfigError::MissingEnvVar(var) => {
                    format!("Environment variable '{var}' is not set")
                }
                _ => format!("Failed to load config: {e}"),
            };
            checks.push(CheckResult::error(message));
            None
        }
    };

    if let Some(config) = &config
        && config.supervisor.reap_interval_seconds == 0
    {
        checks.push(CheckResult::warn(
            "Reaper disabled (supervisor.reap_interval_seconds = 0); exited scripts stay listed",
        ));
    }

    sections.push(Section {
        name: "Configuration".to_string(),
        checks,
    });
    config
}

// ============================================================================
// Check: Directories
// ============================================================================

async fn check_directories(sections: &mut Vec<Section>, config: &Config, config_path: &str) {
    let dirs = config.resolve_dirs(Path::new(config_path));
    let mut checks = Vec::new();

    for (label, dir) in [("Uploads", &dirs.uploads_dir), ("Logs", &dirs.logs_dir)] {
        checks.push(match check_writable(dir).await {
            Ok(()) => CheckResult::ok(format!("{label} directory '{}' is writable", dir.display())),
            Err(e) => CheckResult::error(format!(
                "{label} directory '{}' is not writable: {e}",
                dir.display()
            )),
        });
    }

    sections.push(Section {
        name: "Directories".to_string(),
        checks,
    });
}

/// Create `dir` if needed and write then remove a scratch file in it.
async fn check_writable(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let scratch = dir.join(format!(".doctor-{}", ulid::Ulid::new()));
    tokio::fs::write(&scratch, b"").await?;
    tokio::fs::remove_file(&scratch).await
}

// ============================================================================
// Check: Interpreters
// ============================================================================

fn check_interpreters(interpreters: &Interpreters) -> Section {
    let checks = interpreters
        .programs()
        .into_iter()
        .map(|(kind, program)| {
            if which_command(program) {
                CheckResult::ok(format!("{kind} interpreter '{program}' found"))
            } else {
                CheckResult::warn(format!(
                    "{kind} interpreter '{program}' not found; .{} scripts will fail to start",
                    kind.extension()
                ))
            }
        })
        .collect();

    Section {
        name: "Interpreters".to_string(),
        checks,
    }
}

fn which_command(command: &str) -> bool {
    // If command is an absolute/relative path, check directly
    let path = Path::new(command);
    if path.is_absolute() || command.contains('/') {
        return path.exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).is_file()))
        .unwrap_or(false)
}

// ============================================================================
// Check: Gateways
// ============================================================================

fn check_gateways(config: &Config) -> Section {
    let mut checks = Vec::new();

    match &config.gateways.telegram {
        Some(telegram) if !telegram.enabled => {
            checks.push(CheckResult::warn("Telegram gateway disabled"));
        }
        Some(telegram) if telegram.bot_token.trim().is_empty() => {
            checks.push(CheckResult::error("Telegram gateway enabled but bot_token is empty"));
        }
        Some(_) if !cfg!(feature = "gateway-telegram") => {
            checks.push(CheckResult::error(
                "Telegram gateway configured but this build lacks the gateway-telegram feature",
            ));
        }
        Some(_) => checks.push(CheckResult::ok("Telegram gateway configured")),
        None => checks.push(CheckResult::warn(
            "No gateway configured; add gateways.telegram to reach the bot",
        )),
    }

    Section {
        name: "Gateways".to_string(),
        checks,
    }
}

// ============================================================================
// Tests
// ============================================================================
