//! Backup message types for async communication
//!
//! This module defines the message types used between the caller (daemon or
//! UI) and the backup manager thread.
//!
//! # Communication Pattern
//!
//! - Caller sends `BackupCommand` to the manager thread (non-blocking)
//! - Manager sends `BackupMessage` back via channel
//!
//! Device events from the monitor thread arrive on their own channel, so a
//! caller never has to forward hotplug notifications itself.

use super::copy::BackupReport;
use super::error::CopyError;
use super::FilesystemType;
use std::path::PathBuf;

/// Commands sent TO the backup manager thread
#[derive(Debug, Clone)]
pub enum BackupCommand {
    /// Back up the notes tree into `target_root` without waiting for a device
    ///
    /// The dated folder is created under `target_root`; no unmount follows.
    BackupTo { target_root: PathBuf },

    /// Stop the running backup at the next entry boundary
    CancelBackup,

    /// Shutdown the manager thread
    Shutdown,
}

/// Messages sent FROM the backup manager thread
#[derive(Debug, Clone)]
pub enum BackupMessage {
    /// A USB block device appeared
    DeviceAdded { device_path: PathBuf },

    /// A USB block device went away
    DeviceRemoved { device_path: PathBuf },

    /// The device never showed up in the mount table (e.g. a raw disk)
    VolumeNotFound { device_path: PathBuf },

    /// A backup is already running; this insertion was ignored
    Rejected { device_path: PathBuf },

    /// A backup started
    Started {
        /// Dated folder the notes are written into
        destination_root: PathBuf,
        total_files: usize,
        total_bytes: u64,
        /// Filesystem of the target stick; `None` for explicit backups
        filesystem: Option<FilesystemType>,
    },

    /// One file could not be backed up (the batch continues)
    EntryFailed { source: PathBuf, error: CopyError },

    /// Every file has reported; unmount (if any) has been requested
    Complete(BackupReport),

    /// The backup could not start (e.g. unreadable notes directory)
    Error(String),

    /// Manager is shutting down
    Shutdown,
}

impl BackupMessage {
    /// One-line description for status bars and logs
    pub fn status_text(&self) -> String {
        match self {
            BackupMessage::DeviceAdded { device_path } => {
                format!("USB device connected: {}", device_path.display())
            }
            BackupMessage::DeviceRemoved { device_path } => {
                format!("USB device removed: {}", device_path.display())
            }
            BackupMessage::VolumeNotFound { device_path } => {
                format!("{} is not mounted, skipping backup", device_path.display())
            }
            BackupMessage::Rejected { device_path } => {
                format!("Backup already running, ignoring {}", device_path.display())
            }
            BackupMessage::Started {
                total_files,
                filesystem: Some(fs),
                ..
            } => format!("Backing up {} files to USB ({})...", total_files, fs),
            BackupMessage::Started { total_files, .. } => {
                format!("Backing up {} files...", total_files)
            }
            BackupMessage::EntryFailed { source, error } => {
                format!("Could not back up {}: {}", source.display(), error)
            }
            BackupMessage::Complete(report) => report.status_line(),
            BackupMessage::Error(msg) => format!("Backup failed: {}", msg),
            BackupMessage::Shutdown => "Backup service stopped".to_string(),
        }
    }
}
