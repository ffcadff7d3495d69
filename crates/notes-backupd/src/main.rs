//! notes-backupd - Back up the notes tree to every USB stick plugged in
//!
//! This is the daemon entry point. It:
//! 1. Loads the config and provisions the topic folders
//! 2. Arms the USB hotplug monitor (fails if it cannot)
//! 3. Runs the backup manager and logs its messages until it shuts down
//!
//! ## Command line flags
//!
//! - `--config <path>`: Use this config file instead of the default location
//! - `--backup-to <dir>`: Back up once into `<dir>` and exit
//! - `--plan <dir>`: Print what a backup into `<dir>` would copy and exit
//! - `--status`: Print the power status and exit

use anyhow::{bail, Context, Result};
use notes_core::config::{default_config_path, load_config, load_or_init_config, AppConfig};
use notes_core::notes::ensure_topic_directories;
use notes_core::power::{read_power_status, DEFAULT_POWER_SUPPLY_DIR};
use notes_core::usb::mount::default_mount_table;
use notes_core::usb::{backup_folder_name, build_backup_plan, format_bytes, BackupManager, BackupMessage, CopyEngine};
use std::path::{Path, PathBuf};

/// Parsed command line
#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    backup_to: Option<PathBuf>,
    plan: Option<PathBuf>,
    status: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| -> Result<PathBuf> {
            args.next()
                .map(PathBuf::from)
                .with_context(|| format!("{} requires a path", flag))
        };
        match arg.as_str() {
            "--config" => parsed.config = Some(value("--config")?),
            "--backup-to" => parsed.backup_to = Some(value("--backup-to")?),
            "--plan" => parsed.plan = Some(value("--plan")?),
            "--status" => parsed.status = true,
            other => bail!("Unknown argument: {}", other),
        }
    }

    Ok(parsed)
}

fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    // Set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    log::info!("notes-backupd starting up");

    let config = read_config(args.config.as_deref())?;

    if args.status {
        println!("{}", read_power_status(Path::new(DEFAULT_POWER_SUPPLY_DIR)));
        return Ok(());
    }

    ensure_topic_directories(&config.notes_directory, &config.topics)
        .context("Failed to provision topic folders")?;

    if let Some(target) = &args.plan {
        return print_plan(&config, target);
    }

    if let Some(target) = &args.backup_to {
        return backup_once(&config, target);
    }

    run_daemon(&config)
}

/// A config named on the command line must exist; the default one is
/// created with the defaults on first run
fn read_config(explicit: Option<&Path>) -> Result<AppConfig> {
    match explicit {
        Some(path) if !path.is_file() => bail!("Config file {:?} does not exist", path),
        Some(path) => Ok(load_config(path)),
        None => Ok(load_or_init_config(&default_config_path())),
    }
}

fn dated_destination(config: &AppConfig, target: &Path) -> PathBuf {
    target.join(backup_folder_name(
        &config.backup.folder_prefix,
        chrono::Local::now().date_naive(),
    ))
}

/// Dry run: list every planned copy
fn print_plan(config: &AppConfig, target: &Path) -> Result<()> {
    let plan = build_backup_plan(&config.notes_directory, &dated_destination(config, target))?;

    for entry in &plan.entries {
        println!("{} -> {}", entry.source.display(), entry.destination.display());
    }
    println!("{}", plan.summary());
    Ok(())
}

/// One-shot backup into a directory, no device involved
fn backup_once(config: &AppConfig, target: &Path) -> Result<()> {
    let plan = build_backup_plan(&config.notes_directory, &dated_destination(config, target))?;
    let engine = CopyEngine::new(config.backup.copy_threads)?;

    let report = engine.start(plan).wait()?;

    for (entry, error) in report.failures() {
        eprintln!("{}: {}", entry.source.display(), error);
    }
    println!(
        "{} ({} copied to {})",
        report.status_line(),
        format_bytes(report.bytes_copied()),
        report.destination_root.display()
    );

    if report.failed() > 0 {
        bail!("{} of {} files failed", report.failed(), report.total());
    }
    Ok(())
}

/// Hotplug daemon: back up on every USB insertion until the manager stops
fn run_daemon(config: &AppConfig) -> Result<()> {
    log::info!("Backing up {:?}", config.notes_directory);
    log::info!("{}", read_power_status(Path::new(DEFAULT_POWER_SUPPLY_DIR)));

    let monitor = config
        .monitor
        .open_monitor()
        .context("USB hotplug monitoring is unavailable")?;

    let manager = BackupManager::spawn(
        config.backup_settings(),
        monitor,
        default_mount_table(),
        config.backup.unmount.unmounter(),
    )?;

    log::info!("Waiting for USB devices");

    for message in manager.messages().iter() {
        match &message {
            BackupMessage::EntryFailed { .. } | BackupMessage::Rejected { .. } => {
                log::warn!("{}", message.status_text())
            }
            BackupMessage::Error(_) => log::error!("{}", message.status_text()),
            BackupMessage::Shutdown => {
                log::info!("{}", message.status_text());
                break;
            }
            _ => log::info!("{}", message.status_text()),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_flags() {
        let parsed = parse_args(args(&["--config", "/tmp/c.yaml", "--backup-to", "/media/stick"])).unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("/tmp/c.yaml")));
        assert_eq!(parsed.backup_to, Some(PathBuf::from("/media/stick")));
        assert!(parsed.plan.is_none());
        assert!(!parsed.status);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(args(&["--plan"])).is_err());
        assert!(parse_args(args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_config(Some(dir.path().join("missing.yaml").as_path())).is_err());

        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "topics: [Math]\n").unwrap();
        let config = read_config(Some(path.as_path())).unwrap();
        assert_eq!(config.topics, vec!["Math".to_string()]);
    }

    #[test]
    fn test_backup_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.notes_directory = dir.path().join("notes");
        std::fs::create_dir_all(config.notes_directory.join("Math")).unwrap();
        std::fs::write(config.notes_directory.join("Math/a.txt"), "alpha").unwrap();

        let target = dir.path().join("stick");
        backup_once(&config, &target).unwrap();

        let destination = dated_destination(&config, &target);
        assert_eq!(std::fs::read_to_string(destination.join("Math/a.txt")).unwrap(), "alpha");
    }
}
