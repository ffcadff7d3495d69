//! Mounted volume lookup
//!
//! Maps a hotplugged device node to the directory it is mounted on.
//! - Linux reads `/proc/mounts` directly (no root required)
//! - Other platforms use sysinfo's disk list
//!
//! A device that is not (yet) mounted is not an error: raw disks without a
//! partition table fire hotplug events and never mount.

use super::{DeviceAction, DeviceEvent, FilesystemType, ResolvedVolume};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::Disks;

/// One row of the mounted volume table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    /// Device identifier (e.g., "/dev/sdb1")
    pub device: String,
    /// Mount point (e.g., "/media/user/SANDISK")
    pub mount_point: PathBuf,
    pub filesystem: FilesystemType,
}

/// Source of the currently mounted volumes
pub trait MountTable: Send + Sync {
    fn mounted_volumes(&self) -> Vec<MountedVolume>;
}

/// Mount table parsed from a `/proc/mounts` style file
#[derive(Debug, Clone)]
pub struct ProcMounts {
    path: PathBuf,
}

impl ProcMounts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMounts {
    fn default() -> Self {
        Self::new("/proc/mounts")
    }
}

impl MountTable for ProcMounts {
    fn mounted_volumes(&self) -> Vec<MountedVolume> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => parse_mounts(&content),
            Err(e) => {
                log::warn!("Failed to read mount table {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }
}

/// Parse the `device mount_point fstype options dump pass` lines of a mounts file
pub fn parse_mounts(content: &str) -> Vec<MountedVolume> {
    content
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                return None;
            }
            Some(MountedVolume {
                device: unescape_mount_field(parts[0]),
                mount_point: PathBuf::from(unescape_mount_field(parts[1])),
                filesystem: FilesystemType::from_str(parts[2]),
            })
        })
        .collect()
}

/// Decode the octal escapes the kernel uses for whitespace in mount fields
///
/// e.g. `/media/user/MY\040STICK` → `/media/user/MY STICK`
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            let is_octal = digits[0] <= b'3' && digits.iter().all(|b| (b'0'..=b'7').contains(b));
            if is_octal {
                let value = digits.iter().fold(0u8, |acc, d| acc * 8 + (d - b'0'));
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Mount table from sysinfo's cross-platform disk list
#[derive(Debug, Clone, Default)]
pub struct SysinfoDisks;

impl MountTable for SysinfoDisks {
    fn mounted_volumes(&self) -> Vec<MountedVolume> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .map(|disk| MountedVolume {
                device: disk.name().to_string_lossy().to_string(),
                mount_point: disk.mount_point().to_path_buf(),
                filesystem: FilesystemType::from_str(&disk.file_system().to_string_lossy()),
            })
            .collect()
    }
}

/// Fixed mount table, for tests and dry runs
#[derive(Debug, Clone, Default)]
pub struct StaticMountTable(pub Vec<MountedVolume>);

impl MountTable for StaticMountTable {
    fn mounted_volumes(&self) -> Vec<MountedVolume> {
        self.0.clone()
    }
}

/// The platform's preferred mount table
pub fn default_mount_table() -> Arc<dyn MountTable> {
    if cfg!(target_os = "linux") && Path::new("/proc/mounts").exists() {
        Arc::new(ProcMounts::default())
    } else {
        Arc::new(SysinfoDisks)
    }
}

/// Find the mounted volume for an add event
///
/// Remove events and unmounted devices resolve to `None`. First match wins.
pub fn resolve_volume(event: &DeviceEvent, table: &dyn MountTable) -> Option<ResolvedVolume> {
    if event.action != DeviceAction::Add {
        return None;
    }

    let device = event.device_path.to_string_lossy();
    table
        .mounted_volumes()
        .into_iter()
        .find(|volume| volume.device == device)
        .map(|volume| ResolvedVolume {
            device_path: PathBuf::from(volume.device),
            mount_root: volume.mount_point,
            filesystem: volume.filesystem,
        })
}

/// Resolve an add event, re-checking the table until it appears or `settle` elapses
///
/// Automounters usually mount a stick a moment after its device node shows up.
/// A zero `settle` performs a single lookup.
pub fn wait_for_volume(
    event: &DeviceEvent,
    table: &dyn MountTable,
    settle: Duration,
    poll: Duration,
) -> Option<ResolvedVolume> {
    let deadline = Instant::now() + settle;

    loop {
        if let Some(volume) = resolve_volume(event, table) {
            return Some(volume);
        }
        if event.action != DeviceAction::Add || Instant::now() >= deadline {
            log::debug!("No mounted volume for {}", event.device_path.display());
            return None;
        }
        std::thread::sleep(poll.min(deadline.saturating_duration_since(Instant::now())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SAMPLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
/dev/sdb1 /media/user/MY\\040STICK vfat rw,nosuid,nodev,uid=1000 0 0
/dev/sdc1 /media/user/BACKUP exfat rw,nosuid,nodev 0 0
";

    fn volume(device: &str, mount_point: &str) -> MountedVolume {
        MountedVolume {
            device: device.to_string(),
            mount_point: PathBuf::from(mount_point),
            filesystem: FilesystemType::Fat32,
        }
    }

    #[test]
    fn test_parse_mounts() {
        let volumes = parse_mounts(SAMPLE);
        assert_eq!(volumes.len(), 4);
        assert_eq!(volumes[2].device, "/dev/sdb1");
        assert_eq!(volumes[2].mount_point, PathBuf::from("/media/user/MY STICK"));
        assert_eq!(volumes[2].filesystem, FilesystemType::Fat32);
        assert_eq!(volumes[3].filesystem, FilesystemType::ExFat);
    }

    #[test]
    fn test_unescape_mount_field() {
        assert_eq!(unescape_mount_field("/plain/path"), "/plain/path");
        assert_eq!(unescape_mount_field("a\\040b\\011c"), "a b\tc");
        assert_eq!(unescape_mount_field("trailing\\04"), "trailing\\04");
        assert_eq!(unescape_mount_field("not\\xyzoctal"), "not\\xyzoctal");
    }

    #[test]
    fn test_proc_mounts_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mounts");
        std::fs::write(&path, SAMPLE).unwrap();

        let table = ProcMounts::new(&path);
        let resolved = resolve_volume(&DeviceEvent::added("/dev/sdc1"), &table).unwrap();
        assert_eq!(resolved.mount_root, PathBuf::from("/media/user/BACKUP"));
        assert_eq!(resolved.filesystem, FilesystemType::ExFat);
    }

    #[test]
    fn test_unreadable_table_is_empty() {
        let table = ProcMounts::new("/nonexistent/mounts");
        assert!(table.mounted_volumes().is_empty());
    }

    #[test]
    fn test_resolve_not_found() {
        let table = StaticMountTable(vec![volume("/dev/sdc1", "/media/c")]);
        assert_eq!(resolve_volume(&DeviceEvent::added("/dev/sdb1"), &table), None);
    }

    #[test]
    fn test_resolve_first_match_wins() {
        let table = StaticMountTable(vec![
            volume("/dev/sdb1", "/media/first"),
            volume("/dev/sdb1", "/media/second"),
        ]);
        let resolved = resolve_volume(&DeviceEvent::added("/dev/sdb1"), &table).unwrap();
        assert_eq!(resolved.device_path, PathBuf::from("/dev/sdb1"));
        assert_eq!(resolved.mount_root, PathBuf::from("/media/first"));
    }

    #[test]
    fn test_remove_event_never_resolves() {
        let table = StaticMountTable(vec![volume("/dev/sdb1", "/media/b")]);
        assert_eq!(resolve_volume(&DeviceEvent::removed("/dev/sdb1"), &table), None);
    }

    /// Reports nothing mounted for the first few lookups
    struct LateMount {
        lookups: AtomicUsize,
        mounted_after: usize,
    }

    impl MountTable for LateMount {
        fn mounted_volumes(&self) -> Vec<MountedVolume> {
            if self.lookups.fetch_add(1, Ordering::SeqCst) >= self.mounted_after {
                vec![volume("/dev/sdb1", "/media/late")]
            } else {
                Vec::new()
            }
        }
    }

    #[test]
    fn test_wait_for_late_mount() {
        let table = LateMount {
            lookups: AtomicUsize::new(0),
            mounted_after: 3,
        };
        let resolved = wait_for_volume(
            &DeviceEvent::added("/dev/sdb1"),
            &table,
            Duration::from_secs(2),
            Duration::from_millis(5),
        );
        assert_eq!(resolved.unwrap().mount_root, PathBuf::from("/media/late"));
    }

    #[test]
    fn test_zero_settle_looks_once() {
        let table = LateMount {
            lookups: AtomicUsize::new(0),
            mounted_after: 1,
        };
        let resolved = wait_for_volume(
            &DeviceEvent::added("/dev/sdb1"),
            &table,
            Duration::ZERO,
            Duration::from_millis(5),
        );
        assert!(resolved.is_none());
        assert_eq!(table.lookups.load(Ordering::SeqCst), 1);
    }
}
