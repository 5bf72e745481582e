//! Per-user upload directories.
//!
//! Each user owns `<uploads_dir>/<user>/`. Only plain file names are accepted;
//! anything that could resolve outside the user directory is rejected before
//! touching the filesystem.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{SupervisorError, SupervisorResult};
use crate::process::{ScriptKind, UploadKind};

/// Prefix of the hidden staging directory used while extracting an archive.
const STAGING_PREFIX: &str = ".extract-";

/// Delimiter reserved for action tokens; never valid inside a file name.
const TOKEN_DELIMITER: &str = "::";

/// Default cap on the uncompressed size of one archive.
pub const DEFAULT_MAX_EXTRACTED_BYTES: u64 = 100 * 1024 * 1024;

/// A runnable file in a user's workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    pub name: String,
    pub kind: ScriptKind,
}

/// Root of all per-user upload directories.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    max_extracted_bytes: u64,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_extracted_bytes: DEFAULT_MAX_EXTRACTED_BYTES,
        }
    }

    /// Limit the total uncompressed size an archive may expand to.
    pub fn with_max_extracted_bytes(mut self, limit: u64) -> Self {
        self.max_extracted_bytes = limit;
        self
    }

    /// Directory for `user`. Not created; see [`Workspace::ensure`].
    pub fn user_dir(&self, user: &str) -> PathBuf {
        self.root.join(user)
    }

    /// Create the user directory if needed and return it.
    pub async fn ensure(&self, user: &str) -> SupervisorResult<PathBuf> {
        validate_name(user)?;
        let dir = self.user_dir(user);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| SupervisorError::storage(&dir, e))?;
        Ok(dir)
    }

    /// Runnable files in the user's directory, sorted by name.
    pub async fn list_scripts(&self, user: &str) -> SupervisorResult<Vec<ScriptFile>> {
        let dir = self.ensure(user).await?;
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| SupervisorError::storage(&dir, e))?;

        let mut scripts = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SupervisorError::storage(&dir, e))?
        {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if validate_name(&name).is_err() {
                continue;
            }
            if let Some(kind) = ScriptKind::from_file_name(&name) {
                scripts.push(ScriptFile { name, kind });
            }
        }

        scripts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(scripts)
    }

    /// Store an uploaded file, replacing any file with the same name.
    ///
    /// Instances already running from a replaced file keep running.
    pub async fn save_upload(
        &self,
        user: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> SupervisorResult<PathBuf> {
        validate_name(file_name)?;
        if UploadKind::from_file_name(file_name).is_none() {
            return Err(SupervisorError::unsupported_type(file_name));
        }

        let path = self.ensure(user).await?.join(file_name);
        fs::write(&path, bytes)
            .await
            .map_err(|e| SupervisorError::storage(&path, e))?;

        info!(user, file = file_name, bytes = bytes.len(), "Saved upload");
        Ok(path)
    }

    /// Unpack a zip archive into the user's directory, then delete it.
    ///
    /// Entries are first written to a hidden staging directory and only moved
    /// into place once the whole archive has been read. On a read failure, or
    /// when the archive expands past the size limit, the archive is left where
    /// it is. Top-level entries that are not valid file names are dropped.
    /// Returns the top-level names that were moved into place.
    pub async fn extract_archive(
        &self,
        user: &str,
        archive: &Path,
    ) -> SupervisorResult<Vec<String>> {
        let user_dir = self.ensure(user).await?;
        let staging = user_dir.join(format!("{STAGING_PREFIX}{}", ulid::Ulid::new()));

        let archive_path = archive.to_path_buf();
        let staging_dir = staging.clone();
        let limit = self.max_extracted_bytes;
        let result = tokio::task::spawn_blocking(move || {
            unpack_to_staging(&archive_path, &staging_dir, limit)
        })
        .await
        .unwrap_or_else(|e| {
            Err(SupervisorError::corrupt_archive(
                archive,
                format!("extraction task failed: {e}"),
            ))
        });

        if let Err(e) = result {
            let _ = fs::remove_dir_all(&staging).await;
            warn!(user, archive = %archive.display(), error = %e, "Archive extraction failed");
            return Err(e);
        }

        let staged = staging.clone();
        let target = user_dir.clone();
        let archive_name = archive.file_name().map(OsStr::to_os_string);
        let moved = tokio::task::spawn_blocking(move || {
            promote_staged(&staged, &target, archive_name.as_deref())
        })
        .await
        .map_err(|e| SupervisorError::storage(&staging, io::Error::other(e)))
        .and_then(|r| r);
        let _ = fs::remove_dir_all(&staging).await;
        let moved = moved?;

        fs::remove_file(archive)
            .await
            .map_err(|e| SupervisorError::storage(archive, e))?;

        info!(user, archive = %archive.display(), entries = moved.len(), "Extracted archive");
        Ok(moved)
    }

    /// Remove a file. Returns whether it existed.
    ///
    /// Running instances are not touched; see `Supervisor::cascade_delete`.
    pub async fn delete_script(&self, user: &str, file_name: &str) -> SupervisorResult<bool> {
        validate_name(file_name)?;
        let path = self.user_dir(user).join(file_name);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(user, file = file_name, "Deleted script");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SupervisorError::storage(&path, e)),
        }
    }

    /// Path to an existing regular file in the user's directory.
    pub async fn script_path(&self, user: &str, file_name: &str) -> Option<PathBuf> {
        if validate_name(user).is_err() || validate_name(file_name).is_err() {
            return None;
        }
        let path = self.user_dir(user).join(file_name);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(path),
            _ => None,
        }
    }
}

/// Reject anything that is not a single plain path component.
fn validate_name(name: &str) -> SupervisorResult<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && !name.contains(TOKEN_DELIMITER);
    if valid {
        Ok(())
    } else {
        Err(SupervisorError::invalid_file_name(name))
    }
}

// ============================================================================
// Archive Extraction (blocking)
// ============================================================================

fn unpack_to_staging(archive_path: &Path, staging: &Path, limit: u64) -> SupervisorResult<()> {
    let file = File::open(archive_path)
        .map_err(|e| SupervisorError::corrupt_archive(archive_path, e))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| SupervisorError::corrupt_archive(archive_path, e))?;

    std::fs::create_dir_all(staging).map_err(|e| SupervisorError::storage(staging, e))?;

    let too_large = || {
        SupervisorError::corrupt_archive(archive_path, format!("expands past {limit} bytes"))
    };
    let mut total: u64 = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| SupervisorError::corrupt_archive(archive_path, e))?;

        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "Skipping archive entry outside the workspace");
            continue;
        };
        let dest = staging.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&dest).map_err(|e| SupervisorError::storage(&dest, e))?;
            continue;
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SupervisorError::storage(parent, e))?;
        }
        // The declared size can lie, so the copy itself is capped too.
        let remaining = limit.saturating_sub(total);
        if entry.size() > remaining {
            return Err(too_large());
        }
        let mut out = File::create(&dest).map_err(|e| SupervisorError::storage(&dest, e))?;
        let copied = io::copy(&mut (&mut entry).take(remaining + 1), &mut out)
            .map_err(|e| SupervisorError::corrupt_archive(archive_path, e))?;
        if copied > remaining {
            return Err(too_large());
        }
        total += copied;
        debug!(entry = %dest.display(), "Unpacked archive entry");
    }

    Ok(())
}

/// Move every top-level entry of `staging` into `target`.
///
/// Entries whose names could not be run or deleted later, and an entry named
/// like the archive itself, stay behind and are removed with the staging dir.
fn promote_staged(
    staging: &Path,
    target: &Path,
    archive_name: Option<&OsStr>,
) -> SupervisorResult<Vec<String>> {
    let mut moved = Vec::new();
    let entries = std::fs::read_dir(staging).map_err(|e| SupervisorError::storage(staging, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SupervisorError::storage(staging, e))?;
        let os_name = entry.file_name();
        let Some(name) = os_name.to_str().filter(|n| validate_name(n).is_ok()) else {
            warn!(entry = ?os_name, "Skipping archive entry with an unusable name");
            continue;
        };
        if Some(os_name.as_os_str()) == archive_name {
            warn!(entry = name, "Skipping archive entry named like the archive");
            continue;
        }
        move_entry(&entry.path(), &target.join(name))?;
        moved.push(name.to_string());
    }
    moved.sort();
    Ok(moved)
}

/// Rename `src` onto `dst`, merging directories that already exist.
fn move_entry(src: &Path, dst: &Path) -> SupervisorResult<()> {
    if src.is_dir() && dst.is_dir() {
        let entries = std::fs::read_dir(src).map_err(|e| SupervisorError::storage(src, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| SupervisorError::storage(src, e))?;
            move_entry(&entry.path(), &dst.join(entry.file_name()))?;
        }
        return Ok(());
    }
    std::fs::rename(src, dst).map_err(|e| SupervisorError::storage(dst, e))
}
