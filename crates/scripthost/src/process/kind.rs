//! Script kinds and the extension dispatch table.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Extension of the only accepted archive format.
pub const ARCHIVE_EXTENSION: &str = "zip";

// ============================================================================
// ScriptKind
// ============================================================================

/// A runnable script type. The set is closed; adding one means adding a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    Python,
    JavaScript,
    Shell,
}

impl ScriptKind {
    pub const ALL: [ScriptKind; 3] = [
        ScriptKind::Python,
        ScriptKind::JavaScript,
        ScriptKind::Shell,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            ScriptKind::Python => "py",
            ScriptKind::JavaScript => "js",
            ScriptKind::Shell => "sh",
        }
    }

    /// Classify a file by its extension (case-sensitive).
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let ext = Path::new(file_name).extension()?.to_str()?;
        Self::ALL.into_iter().find(|kind| kind.extension() == ext)
    }

    /// Short human-readable name shown next to list entries.
    pub fn label(self) -> &'static str {
        match self {
            ScriptKind::Python => "Python",
            ScriptKind::JavaScript => "JavaScript",
            ScriptKind::Shell => "Shell",
        }
    }

    /// Program and arguments that launch `script`.
    pub fn command(self, interpreters: &Interpreters, script: &Path) -> (String, Vec<String>) {
        let program = match self {
            ScriptKind::Python => &interpreters.python,
            ScriptKind::JavaScript => &interpreters.node,
            ScriptKind::Shell => &interpreters.shell,
        };
        (program.clone(), vec![script.to_string_lossy().into_owned()])
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// UploadKind
// ============================================================================

/// What an uploaded file is, judged by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Script(ScriptKind),
    Archive,
}

impl UploadKind {
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        if let Some(kind) = ScriptKind::from_file_name(file_name) {
            return Some(UploadKind::Script(kind));
        }
        let ext = Path::new(file_name).extension()?.to_str()?;
        (ext == ARCHIVE_EXTENSION).then_some(UploadKind::Archive)
    }
}

// ============================================================================
// Interpreters
// ============================================================================

/// Interpreter programs, looked up on `PATH` unless absolute.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Interpreters {
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_node")]
    pub node: String,
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Interpreters {
    /// Interpreter program for each kind, in dispatch-table order.
    pub fn programs(&self) -> [(ScriptKind, &str); 3] {
        [
            (ScriptKind::Python, self.python.as_str()),
            (ScriptKind::JavaScript, self.node.as_str()),
            (ScriptKind::Shell, self.shell.as_str()),
        ]
    }
}

impl Default for Interpreters {
    fn default() -> Self {
        Self {
            python: default_python(),
            node: default_node(),
            shell: default_shell(),
        }
    }
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_node() -> String {
    "node".to_string()
}

fn default_shell() -> String {
    "bash".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn classifies_runnable_extensions() {
        assert_eq!(ScriptKind::from_file_name("a.py"), Some(ScriptKind::Python));
        assert_eq!(ScriptKind::from_file_name("b.js"), Some(ScriptKind::JavaScript));
        assert_eq!(ScriptKind::from_file_name("job.sh"), Some(ScriptKind::Shell));
        assert_eq!(ScriptKind::from_file_name("notes.txt"), None);
        assert_eq!(ScriptKind::from_file_name("README"), None);
        assert_eq!(ScriptKind::from_file_name("bundle.zip"), None);
    }

    #[test]
    fn upload_kind_accepts_scripts_and_archives() {
        assert_eq!(
            UploadKind::from_file_name("job.sh"),
            Some(UploadKind::Script(ScriptKind::Shell))
        );
        assert_eq!(
            UploadKind::from_file_name("bundle.zip"),
            Some(UploadKind::Archive)
        );
        assert_eq!(UploadKind::from_file_name("image.png"), None);
        assert_eq!(UploadKind::from_file_name("archive.tar.gz"), None);
    }

    #[test]
    fn command_uses_configured_interpreter() {
        let interpreters = Interpreters {
            python: "/opt/py/bin/python".to_string(),
            ..Interpreters::default()
        };
        let script = PathBuf::from("/data/u1/a.py");

        let (program, args) = ScriptKind::Python.command(&interpreters, &script);
        assert_eq!(program, "/opt/py/bin/python");
        assert_eq!(args, vec!["/data/u1/a.py".to_string()]);

        let (program, _) = ScriptKind::Shell.command(&interpreters, &script);
        assert_eq!(program, "bash");
    }
}
