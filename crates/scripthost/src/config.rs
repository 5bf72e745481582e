use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

use crate::process::Interpreters;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Root for uploads and logs when they are not set explicitly.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub uploads_dir: Option<PathBuf>,
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
    #[serde(default)]
    pub interpreters: Interpreters,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub gateways: GatewaysConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        Ok(serde_saphyr::from_str(&expanded)?)
    }

    /// Resolve the uploads and logs directories against the config file location.
    pub fn resolve_dirs(&self, config_path: &Path) -> ResolvedDirs {
        let workspace_raw = self
            .workspace
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_WORKSPACE));
        let workspace = resolve_path(config_path, workspace_raw);

        let uploads_dir = self
            .uploads_dir
            .as_ref()
            .map(|p| resolve_path(config_path, p))
            .unwrap_or_else(|| workspace.join(DEFAULT_UPLOADS_DIR));
        let logs_dir = self
            .logs_dir
            .as_ref()
            .map(|p| resolve_path(config_path, p))
            .unwrap_or_else(|| workspace.join(DEFAULT_LOGS_DIR));

        ResolvedDirs {
            uploads_dir,
            logs_dir,
        }
    }
}

/// Directories derived from the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDirs {
    pub uploads_dir: PathBuf,
    pub logs_dir: PathBuf,
}

/// Resolve a path relative to the config file directory.
///
/// Absolute paths are returned as-is; relative paths are joined with the
/// config file's parent directory, so behavior does not depend on the
/// current working directory.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    config_dir.join(path)
}

// ============================================================================
// Default Paths
// ============================================================================

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "scripthost.yaml";
/// Default workspace directory (relative to config file).
pub const DEFAULT_WORKSPACE: &str = ".scripthost";
/// Default per-user uploads root (relative to workspace).
pub const DEFAULT_UPLOADS_DIR: &str = "uploads";
/// Default instance log directory (relative to workspace).
pub const DEFAULT_LOGS_DIR: &str = "logs";

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_reap_interval() -> u64 {
    60
}

fn default_handler_timeout() -> u64 {
    60
}

fn default_max_upload_bytes() -> u64 {
    20 * 1024 * 1024
}

fn default_max_extracted_bytes() -> u64 {
    crate::workspace::DEFAULT_MAX_EXTRACTED_BYTES
}

fn default_welcome() -> String {
    "Script Host Bot\n\n\
     Upload .py, .js or .sh scripts (or a .zip of them), then start and stop \
     them from the control panel."
        .to_string()
}

fn default_owner_contact() -> String {
    "No owner contact configured.".to_string()
}

/// Serde default for bool fields that should be `true` (serde's default is `false`).
fn default_true() -> bool {
    true
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports the following syntax (shell-compatible):
/// - `${VAR}` - Required variable, errors if not set
/// - `${VAR:-default}` - Optional variable with default value
/// - `${VAR:-}` - Optional variable, empty string if not set
/// - `$$` - Escaped `$` (only needed before `{` to prevent expansion)
///
/// Nested expansion (`${VAR:-${DEFAULT}}`) is not supported.
///
/// ```yaml
/// gateways:
///   telegram:
///     bot_token: ${TELEGRAM_BOT_TOKEN}
/// interpreters:
///   python: ${PYTHON:-python3}
/// ```
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                result.push('$');
            }
            Some('{') => {
                chars.next();
                let expanded = parse_var_reference(&mut chars)?;
                result.push_str(&expanded);
            }
            _ => result.push('$'),
        }
    }

    Ok(result)
}

/// Parse a variable reference after seeing `${`.
///
/// Handles `VAR}` and `VAR:-default}`. Errors if the closing `}` is missing.
fn parse_var_reference(
    chars: &mut std::iter::Peekable<std::str::Chars>,
) -> Result<String, ConfigError> {
    let mut var_name = String::new();
    let mut default_value: Option<String> = None;
    let mut closed = false;

    while let Some(c) = chars.next() {
        match c {
            '}' => {
                closed = true;
                break;
            }
            ':' if default_value.is_none() && chars.peek() == Some(&'-') => {
                chars.next();
                default_value = Some(String::new());
            }
            _ => match default_value.as_mut() {
                Some(default) => default.push(c),
                None => var_name.push(c),
            },
        }
    }

    if !closed {
        return Err(ConfigError::UnclosedVarReference);
    }

    match std::env::var(&var_name) {
        Ok(value) => Ok(value),
        Err(_) => default_value.ok_or(ConfigError::MissingEnvVar(var_name)),
    }
}

// ============================================================================
// SupervisorConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SupervisorConfig {
    /// Seconds between sweeps that drop exited instances. 0 disables the sweep.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_seconds: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reap_interval_seconds: default_reap_interval(),
        }
    }
}

// ============================================================================
// BotConfig
// ============================================================================

/// Texts and limits for the chat front end.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_welcome")]
    pub welcome: String,
    #[serde(default = "default_owner_contact")]
    pub owner_contact: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    /// Total uncompressed size a single zip upload may expand to.
    #[serde(default = "default_max_extracted_bytes")]
    pub max_extracted_bytes: u64,
    /// Upper bound on handling a single inbound event.
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_seconds: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            welcome: default_welcome(),
            owner_contact: default_owner_contact(),
            max_upload_bytes: default_max_upload_bytes(),
            max_extracted_bytes: default_max_extracted_bytes(),
            handler_timeout_seconds: default_handler_timeout(),
        }
    }
}

// ============================================================================
// GatewaysConfig
// ============================================================================

/// Configuration for all gateways.
#[derive(Debug, Default, Deserialize)]
pub struct GatewaysConfig {
    /// Telegram gateway configuration.
    #[serde(default)]
    pub telegram: Option<TelegramGatewayConfig>,
}

/// Configuration for the Telegram gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramGatewayConfig {
    /// Whether the gateway is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Telegram bot token from @BotFather.
    pub bot_token: String,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    // ========================================================================
    // Config Tests
    // ========================================================================

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.workspace.is_none());
        assert!(config.uploads_dir.is_none());
        assert!(config.logs_dir.is_none());
        assert_eq!(config.interpreters.python, "python3");
        assert_eq!(config.interpreters.node, "node");
        assert_eq!(config.interpreters.shell, "bash");
        assert_eq!(config.supervisor.reap_interval_seconds, 60);
        assert_eq!(config.bot.max_upload_bytes, 20 * 1024 * 1024);
        assert_eq!(config.bot.max_extracted_bytes, 100 * 1024 * 1024);
        assert!(config.gateways.telegram.is_none());
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let missing_path = tmp_dir.path().join("missing-config.yaml");
        let config = Config::load(&missing_path).await.unwrap();
        assert_eq!(config.supervisor.reap_interval_seconds, 60);
        assert_eq!(config.interpreters.python, "python3");
    }

    #[tokio::test]
    async fn test_load_valid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
workspace: "/srv/scripthost"
logs_dir: "/var/log/scripthost"
interpreters:
  python: "/usr/bin/python3.12"
supervisor:
  reap_interval_seconds: 15
bot:
  owner_contact: "@owner"
  max_upload_bytes: 1024
  max_extracted_bytes: 4096
gateways:
  telegram:
    bot_token: "test_token"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.workspace, Some(PathBuf::from("/srv/scripthost")));
        assert_eq!(config.interpreters.python, "/usr/bin/python3.12");
        assert_eq!(config.interpreters.node, "node"); // default
        assert_eq!(config.supervisor.reap_interval_seconds, 15);
        assert_eq!(config.bot.owner_contact, "@owner");
        assert_eq!(config.bot.max_upload_bytes, 1024);
        assert_eq!(config.bot.max_extracted_bytes, 4096);
        assert_eq!(config.bot.handler_timeout_seconds, 60); // default

        let telegram = config
            .gateways
            .telegram
            .as_ref()
            .expect("telegram config should exist");
        assert!(telegram.enabled);
        assert_eq!(telegram.bot_token, "test_token");

        let dirs = config.resolve_dirs(file.path());
        assert_eq!(dirs.uploads_dir, PathBuf::from("/srv/scripthost/uploads"));
        assert_eq!(dirs.logs_dir, PathBuf::from("/var/log/scripthost"));
    }

    #[tokio::test]
    async fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(file.path()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_config_error_display() {
        let io_error = ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "test",
        ));
        assert!(io_error.to_string().contains("failed to read config file"));
    }

    // ========================================================================
    // Path Resolution Tests
    // ========================================================================

    #[test]
    fn test_resolve_dirs_defaults_relative_to_config() {
        let config = Config::default();
        let dirs = config.resolve_dirs(Path::new("/etc/scripthost/scripthost.yaml"));
        assert_eq!(
            dirs.uploads_dir,
            PathBuf::from("/etc/scripthost/.scripthost/uploads")
        );
        assert_eq!(
            dirs.logs_dir,
            PathBuf::from("/etc/scripthost/.scripthost/logs")
        );
    }

    #[test]
    fn test_resolve_path_absolute() {
        let result = resolve_path(
            Path::new("/etc/scripthost/scripthost.yaml"),
            Path::new("/var/data/uploads"),
        );
        assert_eq!(result, PathBuf::from("/var/data/uploads"));
    }

    #[test]
    fn test_resolve_path_config_in_current_dir() {
        let result = resolve_path(Path::new("scripthost.yaml"), Path::new(".scripthost/logs"));
        assert_eq!(result, PathBuf::from(".scripthost/logs"));
    }

    // ========================================================================
    // Environment Variable Expansion Tests
    // ========================================================================

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "plain string without variables";
        assert_eq!(expand_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_expand_env_vars_unclosed_brace() {
        let result = expand_env_vars("value: ${UNCLOSED_VAR");
        assert!(matches!(result, Err(ConfigError::UnclosedVarReference)));

        let result = expand_env_vars("value: ${VAR:-default");
        assert!(matches!(result, Err(ConfigError::UnclosedVarReference)));
    }

    #[test]
    fn test_expand_env_vars_required_var() {
        // SAFETY: test-unique variable name
        unsafe { std::env::set_var("SCRIPTHOST_TEST_REQUIRED", "test_value") };
        let result = expand_env_vars("prefix ${SCRIPTHOST_TEST_REQUIRED} suffix").unwrap();
        assert_eq!(result, "prefix test_value suffix");
        unsafe { std::env::remove_var("SCRIPTHOST_TEST_REQUIRED") };
    }

    #[test]
    fn test_expand_env_vars_missing_required_var() {
        // SAFETY: test-unique variable name
        unsafe { std::env::remove_var("SCRIPTHOST_MISSING_12345") };
        match expand_env_vars("value: ${SCRIPTHOST_MISSING_12345}") {
            Err(ConfigError::MissingEnvVar(name)) => assert_eq!(name, "SCRIPTHOST_MISSING_12345"),
            other => panic!("expected MissingEnvVar error, got {other:?}"),
        }
    }

    #[test]
    fn test_expand_env_vars_defaults() {
        // SAFETY: test-unique variable names
        unsafe {
            std::env::remove_var("SCRIPTHOST_UNSET_DEFAULT");
            std::env::set_var("SCRIPTHOST_SET_DEFAULT", "actual");
        }
        let result = expand_env_vars(
            "a: ${SCRIPTHOST_UNSET_DEFAULT:-fallback} b: ${SCRIPTHOST_UNSET_DEFAULT:-} c: ${SCRIPTHOST_SET_DEFAULT:-ignored}",
        )
        .unwrap();
        assert_eq!(result, "a: fallback b:  c: actual");
        unsafe { std::env::remove_var("SCRIPTHOST_SET_DEFAULT") };
    }

    #[test]
    fn test_expand_env_vars_dollar_handling() {
        assert_eq!(
            expand_env_vars("price: $$100 and ${SCRIPTHOST_ESCAPE:-value}").unwrap(),
            "price: $100 and value"
        );
        assert_eq!(expand_env_vars("cost is $50").unwrap(), "cost is $50");
    }

    #[tokio::test]
    async fn test_config_load_with_env_var() {
        // SAFETY: test-unique variable name
        unsafe { std::env::set_var("SCRIPTHOST_TEST_TOKEN", "env_token_value") };

        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
gateways:
  telegram:
    bot_token: ${{SCRIPTHOST_TEST_TOKEN}}
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        let telegram = config.gateways.telegram.expect("telegram should exist");
        assert_eq!(telegram.bot_token, "env_token_value");

        unsafe { std::env::remove_var("SCRIPTHOST_TEST_TOKEN") };
    }

    #[tokio::test]
    async fn test_config_load_missing_env_var_errors() {
        // SAFETY: test-unique variable name
        unsafe { std::env::remove_var("SCRIPTHOST_DEFINITELY_MISSING") };

        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
gateways:
  telegram:
    bot_token: ${{SCRIPTHOST_DEFINITELY_MISSING}}
"#
        )
        .unwrap();

        let err = Config::load(file.path()).await.unwrap_err();
        assert!(err.to_string().contains("SCRIPTHOST_DEFINITELY_MISSING"));
    }
}
