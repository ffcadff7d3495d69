//! USB block device hotplug monitoring using inotify and sysfs
//!
//! This module watches the device directory (`/dev`) for node creation and
//! deletion without requiring libudev:
//! - inotify reports `CREATE`/`DELETE` of device nodes
//! - `/sys/class/block/<name>` classifies the node (subsystem, devtype)
//! - the node's sysfs ancestors tell whether it hangs off a USB device
//!
//! Only nodes matching one of the [`MonitorRule`]s are reported. The default
//! rules accept USB disks and partitions.

use super::error::{BackupError, BackupResult};
use super::DeviceEvent;
use crossbeam::channel::Sender;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Default sysfs mount point
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Default device node directory
pub const DEFAULT_DEV_DIRECTORY: &str = "/dev";

/// Which devices produce events
///
/// A device matches when its own subsystem/devtype equal the rule's and one of
/// its sysfs ancestors has the rule's parent subsystem/devtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRule {
    pub subsystem: String,
    pub devtype: String,
    pub parent_subsystem: String,
    pub parent_devtype: String,
}

impl MonitorRule {
    pub fn new(subsystem: &str, devtype: &str, parent_subsystem: &str, parent_devtype: &str) -> Self {
        Self {
            subsystem: subsystem.to_string(),
            devtype: devtype.to_string(),
            parent_subsystem: parent_subsystem.to_string(),
            parent_devtype: parent_devtype.to_string(),
        }
    }

    /// Partitions and whole disks of USB storage devices
    pub fn usb_block_rules() -> Vec<Self> {
        vec![
            Self::new("block", "partition", "usb", "usb_device"),
            Self::new("block", "disk", "usb", "usb_device"),
        ]
    }

    pub fn matches(&self, device: &SysfsDevice) -> bool {
        device.subsystem.as_deref() == Some(self.subsystem.as_str())
            && device.devtype.as_deref() == Some(self.devtype.as_str())
            && device.ancestors.iter().any(|ancestor| {
                ancestor.subsystem.as_deref() == Some(self.parent_subsystem.as_str())
                    && ancestor.devtype.as_deref() == Some(self.parent_devtype.as_str())
            })
    }
}

/// Subsystem and devtype of one sysfs device directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SysfsNode {
    pub subsystem: Option<String>,
    pub devtype: Option<String>,
}

/// A block device as described by sysfs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SysfsDevice {
    /// Kernel name (e.g., "sdb1")
    pub name: String,
    pub subsystem: Option<String>,
    pub devtype: Option<String>,
    /// Device directories above this one, nearest first
    pub ancestors: Vec<SysfsNode>,
}

/// Read subsystem and DEVTYPE for a sysfs device directory
fn read_node(dir: &Path) -> SysfsNode {
    let subsystem = fs::read_link(dir.join("subsystem"))
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()));

    let devtype = fs::read_to_string(dir.join("uevent")).ok().and_then(|uevent| {
        uevent
            .lines()
            .find_map(|line| line.strip_prefix("DEVTYPE="))
            .map(|value| value.trim().to_string())
    });

    SysfsNode { subsystem, devtype }
}

/// Classify a block device by kernel name
///
/// Returns `None` if sysfs has no block device of that name.
pub fn probe_block_device(sysfs_root: &Path, name: &str) -> Option<SysfsDevice> {
    let device_dir = fs::canonicalize(sysfs_root.join("class/block").join(name)).ok()?;
    let root = fs::canonicalize(sysfs_root).unwrap_or_else(|_| sysfs_root.to_path_buf());

    let node = read_node(&device_dir);
    let ancestors = device_dir
        .ancestors()
        .skip(1)
        .take_while(|dir| dir.starts_with(&root) && *dir != root)
        .filter(|dir| dir.join("uevent").is_file())
        .map(read_node)
        .collect();

    Some(SysfsDevice {
        name: name.to_string(),
        subsystem: node.subsystem,
        devtype: node.devtype,
        ancestors,
    })
}

/// Turns raw node creation/deletion into rule-filtered device events
///
/// Remembers which names matched so a later deletion (when sysfs is already
/// gone) can still be reported.
#[derive(Debug)]
pub struct DeviceTracker {
    rules: Vec<MonitorRule>,
    sysfs_root: PathBuf,
    dev_directory: PathBuf,
    known: HashSet<String>,
}

impl DeviceTracker {
    pub fn new(rules: Vec<MonitorRule>, sysfs_root: PathBuf, dev_directory: PathBuf) -> Self {
        Self {
            rules,
            sysfs_root,
            dev_directory,
            known: HashSet::new(),
        }
    }

    fn matches_rules(&self, name: &str) -> bool {
        probe_block_device(&self.sysfs_root, name)
            .map(|device| self.rules.iter().any(|rule| rule.matches(&device)))
            .unwrap_or(false)
    }

    /// Record devices already present so their removal is reported
    ///
    /// Devices present at startup never produce an add event.
    pub fn snapshot_existing(&mut self) {
        let class_dir = self.sysfs_root.join("class/block");
        let names: Vec<String> = match fs::read_dir(&class_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect(),
            Err(e) => {
                log::debug!("Cannot list {}: {}", class_dir.display(), e);
                return;
            }
        };

        for name in names {
            if self.matches_rules(&name) {
                self.known.insert(name);
            }
        }
    }

    pub fn on_created(&mut self, name: &str) -> Option<DeviceEvent> {
        if !self.matches_rules(name) {
            return None;
        }
        self.known.insert(name.to_string());
        Some(DeviceEvent::added(self.dev_directory.join(name)))
    }

    pub fn on_deleted(&mut self, name: &str) -> Option<DeviceEvent> {
        if self.known.remove(name) {
            Some(DeviceEvent::removed(self.dev_directory.join(name)))
        } else {
            None
        }
    }
}

/// The process-wide hotplug subscription
///
/// Opening fails fast if the OS notification channel is unavailable, so a
/// broken setup never looks like "no sticks inserted".
pub struct DeviceMonitor {
    #[cfg(target_os = "linux")]
    inotify: inotify::Inotify,
    tracker: DeviceTracker,
    poll_interval: Duration,
}

impl DeviceMonitor {
    /// Open the monitor on `dev_directory`, classifying through `sysfs_root`
    #[cfg(target_os = "linux")]
    pub fn open(rules: Vec<MonitorRule>, sysfs_root: &Path, dev_directory: &Path) -> BackupResult<Self> {
        use inotify::{Inotify, WatchMask};

        let unavailable = |e: std::io::Error| BackupError::MonitorUnavailable {
            path: dev_directory.to_path_buf(),
            reason: e.to_string(),
        };

        let inotify = Inotify::init().map_err(unavailable)?;
        inotify
            .watches()
            .add(dev_directory, WatchMask::CREATE | WatchMask::DELETE)
            .map_err(unavailable)?;

        let mut tracker = DeviceTracker::new(rules, sysfs_root.to_path_buf(), dev_directory.to_path_buf());
        tracker.snapshot_existing();

        log::info!(
            "Device monitor watching {} ({} USB devices already present)",
            dev_directory.display(),
            tracker.known.len()
        );

        Ok(Self {
            inotify,
            tracker,
            poll_interval: Duration::from_millis(100),
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(_rules: Vec<MonitorRule>, _sysfs_root: &Path, _dev_directory: &Path) -> BackupResult<Self> {
        Err(BackupError::Unsupported)
    }

    /// How long the thread sleeps when no events are pending
    ///
    /// Also bounds how long shutdown takes.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Move the monitor onto its own thread, delivering events to `event_tx`
    pub fn spawn(self, event_tx: Sender<DeviceEvent>) -> BackupResult<MonitorHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("usb-monitor".to_string())
            .spawn(move || {
                log::info!("USB monitor thread started");
                self.run(event_tx, &shutdown_clone);
                log::info!("USB monitor thread exiting");
            })
            .map_err(|e| BackupError::ThreadSpawn {
                name: "usb-monitor".to_string(),
                reason: e.to_string(),
            })?;

        Ok(MonitorHandle {
            shutdown,
            handle: Some(handle),
        })
    }

    #[cfg(target_os = "linux")]
    fn run(mut self, event_tx: Sender<DeviceEvent>, shutdown: &AtomicBool) {
        use inotify::EventMask;

        let mut buffer = [0u8; 4096];

        while !shutdown.load(Ordering::Relaxed) {
            let changes: Vec<(bool, String)> = match self.inotify.read_events(&mut buffer) {
                Ok(events) => events
                    .filter_map(|event| {
                        let name = event.name?.to_string_lossy().to_string();
                        if event.mask.contains(EventMask::CREATE) {
                            Some((true, name))
                        } else if event.mask.contains(EventMask::DELETE) {
                            Some((false, name))
                        } else {
                            None
                        }
                    })
                    .collect(),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(self.poll_interval);
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("USB monitor read error: {}", e);
                    return;
                }
            };

            for (created, name) in changes {
                let event = if created {
                    self.tracker.on_created(&name)
                } else {
                    self.tracker.on_deleted(&name)
                };

                if let Some(event) = event {
                    log::debug!("USB monitor: {:?} {}", event.action, event.device_path.display());
                    if event_tx.send(event).is_err() {
                        log::info!("USB monitor listener disconnected");
                        return;
                    }
                }
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn run(self, _event_tx: Sender<DeviceEvent>, _shutdown: &AtomicBool) {
        log::warn!(
            "USB monitor has no backend on this platform ({} rules ignored)",
            self.tracker.rules.len()
        );
    }
}

/// Owns the monitor thread
///
/// When dropped, signals the thread to stop and waits for it.
pub struct MonitorHandle {
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MonitorHandle {
    /// Check if the monitor loop is still running
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
