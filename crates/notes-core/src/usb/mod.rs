//! USB backup support for the notes manager
//!
//! This module provides:
//! - USB block device hotplug monitoring (inotify + sysfs rule matching)
//! - Mounted volume lookup for a hotplugged device path
//! - Pure backup planning (no writes) over the notes tree
//! - A parallel copy engine with a per-batch completion future
//! - Best-effort unmount once a batch has finished
//! - A background manager thread wiring the above together
//!
//! # Architecture
//!
//! All backup work runs off the caller's thread:
//!
//! ```text
//! Device monitor thread (inotify on /dev)
//!     │
//!     │ DeviceEvent (crossbeam channel)
//!     ▼
//! BackupManager thread
//!     ├── volume resolver (mount table lookup)
//!     ├── plan builder (walkdir, no I/O writes)
//!     └── copy engine (rayon pool)
//!            │
//!            │ oneshot completion
//!            ▼
//!        finisher thread ── unmount ── BackupMessage::Complete
//!            │
//!            ▼
//!        Caller (daemon / UI)
//! ```

pub mod copy;
pub mod detection;
pub mod error;
pub mod manager;
pub mod message;
pub mod mount;
pub mod plan;
pub mod unmount;

// Re-export main types for convenience
pub use copy::{BackupHandle, BackupReport, CancelToken, CopyEngine, CopyOutcome, CopyProgress};
pub use detection::{DeviceMonitor, MonitorHandle, MonitorRule};
pub use error::{BackupError, BackupResult, CopyError};
pub use manager::{BackupCommand, BackupManager, BackupSettings};
pub use message::BackupMessage;
pub use mount::{MountTable, MountedVolume, ProcMounts, StaticMountTable, SysinfoDisks};
pub use plan::{backup_folder_name, build_backup_plan, BackupEntry, BackupPlan};
pub use unmount::{CommandUnmounter, NoopUnmounter, Unmounter};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What happened to a hotplugged device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceAction {
    /// A device node appeared
    Add,
    /// A device node went away
    Remove,
}

/// A hotplug notification for a USB block device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub action: DeviceAction,
    /// Device node path (e.g., "/dev/sdb1")
    pub device_path: PathBuf,
}

impl DeviceEvent {
    pub fn added(device_path: impl Into<PathBuf>) -> Self {
        Self {
            action: DeviceAction::Add,
            device_path: device_path.into(),
        }
    }

    pub fn removed(device_path: impl Into<PathBuf>) -> Self {
        Self {
            action: DeviceAction::Remove,
            device_path: device_path.into(),
        }
    }
}

/// A hotplugged device matched to the place it is mounted
///
/// Lives for one backup run; the unmount trigger is the last user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVolume {
    /// Device identifier as listed in the mount table (e.g., "/dev/sdb1")
    pub device_path: PathBuf,
    /// Mount point (e.g., "/media/user/SANDISK")
    pub mount_root: PathBuf,
    pub filesystem: FilesystemType,
}

impl ResolvedVolume {
    /// Destination root for a backup started on the given date
    pub fn backup_root(&self, folder_prefix: &str, date: chrono::NaiveDate) -> PathBuf {
        self.mount_root.join(backup_folder_name(folder_prefix, date))
    }
}

/// Format bytes as human-readable string (GB for >= 1GB, MB for >= 1MB, KB otherwise)
pub fn format_bytes(bytes: u64) -> String {
    const GB: u64 = 1_000_000_000;
    const MB: u64 = 1_000_000;
    const KB: u64 = 1_000;

    if bytes >= GB {
        format!("{:.1}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.0}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.0}KB", bytes as f64 / KB as f64)
    }
}

/// Filesystem types reported by the mount table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    /// Linux native filesystem
    Ext4,
    /// Extended FAT, typical for larger sticks
    ExFat,
    /// FAT32, typical for small sticks
    Fat32,
    /// Windows NTFS
    Ntfs,
    /// Anything else
    #[default]
    Unknown,
}

impl FilesystemType {
    /// Parse filesystem type from the mount table's type column
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "ext4" => FilesystemType::Ext4,
            "exfat" => FilesystemType::ExFat,
            "vfat" | "fat32" | "fat" | "msdos" => FilesystemType::Fat32,
            "ntfs" | "ntfs3" | "fuseblk" => FilesystemType::Ntfs,
            _ => FilesystemType::Unknown,
        }
    }

    /// Largest file the filesystem can hold, if it imposes a limit
    pub fn max_file_size(&self) -> Option<u64> {
        match self {
            FilesystemType::Fat32 => Some(u32::MAX as u64),
            _ => None,
        }
    }

    /// Get display name
    pub fn display_name(&self) -> &'static str {
        match self {
            FilesystemType::Ext4 => "ext4",
            FilesystemType::ExFat => "exFAT",
            FilesystemType::Fat32 => "FAT32",
            FilesystemType::Ntfs => "NTFS",
            FilesystemType::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
