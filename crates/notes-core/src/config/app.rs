//! Backup daemon configuration
//!
//! Every section uses `#[serde(default)]`, so a config file only needs to
//! name the settings it changes:
//!
//! ```yaml
//! topics: [Math, History]
//! backup:
//!   copy_threads: 8
//!   unmount:
//!     program: /usr/bin/udisksctl
//!     args: [unmount, -b]
//! ```

use super::paths::default_notes_directory;
use crate::usb::copy::DEFAULT_COPY_THREADS;
use crate::usb::detection::{DEFAULT_DEV_DIRECTORY, DEFAULT_SYSFS_ROOT};
use crate::usb::unmount::DEFAULT_UNMOUNT_PROGRAM;
use crate::usb::{
    BackupResult, BackupSettings, CommandUnmounter, DeviceMonitor, MonitorRule, NoopUnmounter, Unmounter,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root of the notes tree that gets backed up
    pub notes_directory: PathBuf,

    /// Topic folders provisioned under the notes directory at startup
    pub topics: Vec<String>,

    pub backup: BackupConfig,

    pub monitor: MonitorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            notes_directory: default_notes_directory(),
            topics: Vec::new(),
            backup: BackupConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl AppConfig {
    /// Pipeline settings derived from this config
    pub fn backup_settings(&self) -> BackupSettings {
        BackupSettings {
            source_root: self.notes_directory.clone(),
            folder_prefix: self.backup.folder_prefix.clone(),
            copy_threads: self.backup.copy_threads,
            mount_settle: Duration::from_millis(self.backup.mount_settle_ms),
            mount_poll: Duration::from_millis(self.backup.mount_poll_ms),
        }
    }
}

/// Backup run settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Dated folder prefix on the stick
    /// Default: "Backup Notes" → "Backup Notes - 2024-01-01"
    pub folder_prefix: String,

    /// Parallel copy workers
    /// Default: 4
    pub copy_threads: usize,

    /// How long to wait for the automounter after a device appears
    /// 0 checks the mount table once. Default: 5000 ms
    pub mount_settle_ms: u64,

    /// Mount table polling interval during the settle window
    /// Default: 250 ms
    pub mount_poll_ms: u64,

    pub unmount: UnmountConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            folder_prefix: "Backup Notes".to_string(),
            copy_threads: DEFAULT_COPY_THREADS,
            mount_settle_ms: 5000,
            mount_poll_ms: 250,
            unmount: UnmountConfig::default(),
        }
    }
}

/// How the stick is released after a backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnmountConfig {
    /// Leave the stick mounted when false
    pub enabled: bool,

    /// Helper program; the device path is appended as last argument
    pub program: PathBuf,

    /// Arguments placed before the device path
    pub args: Vec<String>,
}

impl Default for UnmountConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: PathBuf::from(DEFAULT_UNMOUNT_PROGRAM),
            args: Vec::new(),
        }
    }
}

impl UnmountConfig {
    pub fn unmounter(&self) -> Arc<dyn Unmounter> {
        if self.enabled {
            Arc::new(CommandUnmounter::new(self.program.clone(), self.args.clone()))
        } else {
            Arc::new(NoopUnmounter)
        }
    }
}

/// Hotplug monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// sysfs mount point used to classify block devices
    pub sysfs_root: PathBuf,

    /// Directory watched for device nodes
    pub dev_directory: PathBuf,

    /// Sleep between empty inotify reads (also bounds shutdown latency)
    /// Default: 100 ms
    pub poll_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            dev_directory: PathBuf::from(DEFAULT_DEV_DIRECTORY),
            poll_interval_ms: 100,
        }
    }
}

impl MonitorConfig {
    /// Open the USB block device monitor, failing if it cannot be armed
    pub fn open_monitor(&self) -> BackupResult<DeviceMonitor> {
        Ok(
            DeviceMonitor::open(MonitorRule::usb_block_rules(), &self.sysfs_root, &self.dev_directory)?
                .with_poll_interval(Duration::from_millis(self.poll_interval_ms)),
        )
    }
}
