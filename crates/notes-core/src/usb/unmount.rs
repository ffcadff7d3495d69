//! Unmount trigger
//!
//! Fired once per finished batch. The request is best effort: the caller logs
//! a failure and moves on, there is no retry.

use super::error::{BackupError, BackupResult};
use super::ResolvedVolume;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Default helper used to release a stick after a backup
pub const DEFAULT_UNMOUNT_PROGRAM: &str = "/usr/bin/udiskie-umount";

/// Issues the unmount/eject request for a volume
pub trait Unmounter: Send + Sync {
    fn unmount(&self, volume: &ResolvedVolume) -> BackupResult<()>;
}

/// Runs an external program with the device path as last argument
///
/// e.g. `udiskie-umount /dev/sdb1` or `udisksctl unmount -b /dev/sdb1`
#[derive(Debug, Clone)]
pub struct CommandUnmounter {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandUnmounter {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Default for CommandUnmounter {
    fn default() -> Self {
        Self::new(DEFAULT_UNMOUNT_PROGRAM, Vec::new())
    }
}

impl Unmounter for CommandUnmounter {
    fn unmount(&self, volume: &ResolvedVolume) -> BackupResult<()> {
        let device = volume.device_path.display().to_string();
        log::info!("Unmounting {} via {}", device, self.program.display());

        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(&volume.device_path)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| BackupError::UnmountFailed {
                device: device.clone(),
                reason: e.to_string(),
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(BackupError::UnmountFailed {
                device,
                reason: format!("{} exited with {}", self.program.display(), status),
            })
        }
    }
}

/// Leaves the volume mounted
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUnmounter;

impl Unmounter for NoopUnmounter {
    fn unmount(&self, volume: &ResolvedVolume) -> BackupResult<()> {
        log::debug!("Unmount disabled, leaving {} mounted", volume.mount_root.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume() -> ResolvedVolume {
        ResolvedVolume {
            device_path: PathBuf::from("/dev/sdb1"),
            mount_root: PathBuf::from("/media/user/STICK"),
            filesystem: crate::usb::FilesystemType::Fat32,
        }
    }

    #[test]
    fn test_missing_program_reports_failure() {
        let unmounter = CommandUnmounter::new("/nonexistent/bin/umount-helper", Vec::new());
        let err = unmounter.unmount(&volume()).unwrap_err();
        assert!(matches!(err, BackupError::UnmountFailed { ref device, .. } if device == "/dev/sdb1"));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_status_is_checked() {
        let ok = CommandUnmounter::new("true", Vec::new());
        assert!(ok.unmount(&volume()).is_ok());

        let failing = CommandUnmounter::new("false", Vec::new());
        assert!(failing.unmount(&volume()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_device_passed_as_last_argument() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args.txt");
        let script = format!("echo \"$@\" > '{}'", out.display());
        let unmounter = CommandUnmounter::new("sh", vec!["-c".to_string(), script, "sh".to_string(), "unmount".to_string()]);

        unmounter.unmount(&volume()).unwrap();

        let args = std::fs::read_to_string(&out).unwrap();
        assert_eq!(args.trim(), "unmount /dev/sdb1");
    }

    #[test]
    fn test_noop_unmounter() {
        assert!(NoopUnmounter.unmount(&volume()).is_ok());
    }
}
