//! Backup planning
//!
//! Walks the notes tree and pairs every regular file with the place it will
//! land under the dated backup folder. Planning never writes to disk, so a
//! plan can be inspected (dry run) or handed to the copy engine unchanged.

use super::error::{BackupError, BackupResult};
use chrono::NaiveDate;
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// One planned file copy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupEntry {
    /// Absolute path of the note file
    pub source: PathBuf,
    /// Absolute destination path under the backup root (not yet created)
    pub destination: PathBuf,
    /// File size in bytes at planning time
    pub size: u64,
}

/// A complete backup job: every file under `source_root`, in walk order
#[derive(Debug, Clone, Default)]
pub struct BackupPlan {
    pub source_root: PathBuf,
    pub destination_root: PathBuf,
    pub entries: Vec<BackupEntry>,
    /// Total bytes to transfer
    pub total_bytes: u64,
}

impl BackupPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Get summary for display
    pub fn summary(&self) -> String {
        format!(
            "{} files ({}) from {} to {}",
            self.entries.len(),
            super::format_bytes(self.total_bytes),
            self.source_root.display(),
            self.destination_root.display(),
        )
    }
}

/// Name of the dated folder a backup is written into
///
/// e.g. `"Backup Notes - 2024-01-01"`
pub fn backup_folder_name(prefix: &str, date: NaiveDate) -> String {
    format!("{} - {}", prefix, date.format("%Y-%m-%d"))
}

/// Replace characters that removable-media filesystems reject
///
/// FAT and exFAT refuse ':' in names; note files are often named after a
/// timestamp, so every colon becomes a hyphen. Names that are not valid
/// UTF-8 are handled byte-wise on unix.
#[cfg(unix)]
pub fn sanitize_component(name: &OsStr) -> OsString {
    use std::os::unix::ffi::{OsStrExt, OsStringExt};

    let bytes = name
        .as_bytes()
        .iter()
        .map(|&b| if b == b':' { b'-' } else { b })
        .collect();
    OsString::from_vec(bytes)
}

#[cfg(not(unix))]
pub fn sanitize_component(name: &OsStr) -> OsString {
    match name.to_str() {
        Some(s) if s.contains(':') => OsString::from(s.replace(':', "-")),
        _ => name.to_os_string(),
    }
}

/// Sanitize every normal component of a relative path
fn sanitize_relative(relative: &Path) -> PathBuf {
    relative
        .components()
        .map(|component| match component {
            Component::Normal(name) => sanitize_component(name),
            other => other.as_os_str().to_os_string(),
        })
        .collect()
}

/// `dir/name (n).ext` for a destination `dir/name.ext`
fn numbered_destination(destination: &Path, n: usize) -> PathBuf {
    let mut name = destination.file_stem().unwrap_or_default().to_os_string();
    name.push(format!(" ({})", n));
    if let Some(ext) = destination.extension() {
        name.push(".");
        name.push(ext);
    }
    destination.with_file_name(name)
}

/// Give every entry its own destination
///
/// Sanitizing can fold two names together (`a:b.txt` and `a-b.txt`). Files
/// whose path needed no change keep it; renamed files that land on a taken
/// destination get the first free ` (n)` suffix.
fn assign_unique_destinations(candidates: Vec<(BackupEntry, bool)>) -> Vec<BackupEntry> {
    let mut taken: HashSet<PathBuf> = candidates
        .iter()
        .filter(|(_, renamed)| !renamed)
        .map(|(entry, _)| entry.destination.clone())
        .collect();

    candidates
        .into_iter()
        .map(|(mut entry, renamed)| {
            if renamed && !taken.insert(entry.destination.clone()) {
                let unique = (1..)
                    .map(|n| numbered_destination(&entry.destination, n))
                    .find(|candidate| !taken.contains(candidate))
                    .unwrap_or_else(|| entry.destination.clone());
                log::warn!(
                    "build_backup_plan: {} would overwrite another note, backing up as {}",
                    entry.source.display(),
                    unique.display()
                );
                taken.insert(unique.clone());
                entry.destination = unique;
            }
            entry
        })
        .collect()
}

/// Build the list of files to copy from `source_root` into `destination_root`
///
/// Directories are descended depth-first with siblings sorted by name; only
/// regular files produce entries. Symlinks are neither followed nor copied.
/// Entries that cannot be read below the root are logged and skipped.
/// Every entry gets a distinct destination, even when sanitizing folds two
/// source names together.
///
/// # Errors
/// Returns [`BackupError::SourceUnreadable`] if the root itself cannot be listed.
pub fn build_backup_plan(source_root: &Path, destination_root: &Path) -> BackupResult<BackupPlan> {
    let source_root = std::path::absolute(source_root)?;

    if let Err(e) = std::fs::read_dir(&source_root) {
        return Err(BackupError::SourceUnreadable {
            path: source_root,
            reason: e.to_string(),
        });
    }

    let mut candidates = Vec::new();
    let mut total_bytes = 0;

    let walker = WalkDir::new(&source_root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("build_backup_plan: skipping unreadable entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let relative = match entry.path().strip_prefix(&source_root) {
            Ok(r) => r,
            Err(_) => continue,
        };

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let sanitized = sanitize_relative(relative);
        let renamed = sanitized.as_path() != relative;
        total_bytes += size;
        candidates.push((
            BackupEntry {
                source: entry.path().to_path_buf(),
                destination: destination_root.join(sanitized),
                size,
            },
            renamed,
        ));
    }

    let plan = BackupPlan {
        source_root,
        destination_root: destination_root.to_path_buf(),
        entries: assign_unique_destinations(candidates),
        total_bytes,
    };

    log::debug!("build_backup_plan: {}", plan.summary());
    Ok(plan)
}
