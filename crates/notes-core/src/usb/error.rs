//! Error types for the USB backup pipeline
//!
//! `BackupError` covers failures that stop an operation (monitor startup,
//! unreadable source tree, worker pool creation). `CopyError` is the
//! per-entry outcome of the copy engine and never aborts a batch.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while setting up or running a backup
#[derive(Debug, Error)]
pub enum BackupError {
    /// The hotplug event channel could not be opened
    #[error("Failed to open device monitor on {path}: {reason}")]
    MonitorUnavailable { path: PathBuf, reason: String },

    /// Hotplug monitoring is not implemented on this platform
    #[error("Device hotplug monitoring is not supported on this platform")]
    Unsupported,

    /// The notes tree could not be read
    #[error("Cannot read source directory '{path}': {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },

    /// The copy worker pool could not be created
    #[error("Failed to build copy worker pool: {0}")]
    WorkerPool(String),

    /// The engine dropped the completion sender without reporting
    #[error("Backup batch ended without a completion report")]
    CompletionLost,

    /// The unmount request could not be issued or returned a failure status
    #[error("Unmount of {device} failed: {reason}")]
    UnmountFailed { device: String, reason: String },

    /// Failed to spawn a background thread
    #[error("Failed to spawn {name} thread: {reason}")]
    ThreadSpawn { name: String, reason: String },

    /// IO error outside of per-entry copy work
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a single backup entry was not copied
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CopyError {
    /// The planned source vanished before the copy ran
    #[error("Source file no longer exists: {0}")]
    SourceMissing(PathBuf),

    /// Destination ancestors could not be created
    #[error("Failed to create directory '{path}': {reason}")]
    DirectoryCreateFailed { path: PathBuf, reason: String },

    /// The byte copy itself failed
    #[error("Failed to copy to '{path}': {reason}")]
    CopyFailed { path: PathBuf, reason: String },

    /// The batch was cancelled before this entry started
    #[error("Backup cancelled")]
    Cancelled,
}

/// Result type for backup operations
pub type BackupResult<T> = Result<T, BackupError>;
