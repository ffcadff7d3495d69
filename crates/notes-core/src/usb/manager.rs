//! Backup Manager - Background thread for the hotplug backup pipeline
//!
//! This module provides a non-blocking interface to USB backups. Device
//! events and caller commands are handled on a manager thread; copies run on
//! the copy engine's pool; a short-lived finisher thread per backup waits for
//! the batch, requests the unmount and reports completion.
//!
//! # Architecture
//!
//! ```text
//! Monitor thread ── DeviceEvent ──┐
//!                                  ▼
//! Caller ── BackupCommand ──► Manager thread
//!                                  ├── resolver thread (settle window)
//!                                  ├── build plan
//!                                  └── CopyEngine::start ──► rayon pool
//!                                                               │
//!                                         finisher thread ◄─────┘ (oneshot)
//!                                              ├── unmount
//!                                              ▼
//! Caller ◄──────────── BackupMessage::Complete
//! ```
//!
//! Only one backup runs at a time. A device inserted while a backup is in
//! flight is rejected with [`BackupMessage::Rejected`].

use super::copy::{BackupHandle, CancelToken, CopyEngine, CopyProgress, DEFAULT_COPY_THREADS};
use super::detection::{DeviceMonitor, MonitorHandle};
use super::error::{BackupError, BackupResult};
use super::mount::{wait_for_volume, MountTable};
use super::plan::build_backup_plan;
use super::unmount::Unmounter;
use super::{DeviceAction, DeviceEvent, ResolvedVolume};

// Re-export for convenience
pub use super::message::{BackupCommand, BackupMessage};

use crossbeam::channel::{never, unbounded, Receiver, SendError, Sender};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Everything the pipeline needs to know about where and how to back up
#[derive(Debug, Clone)]
pub struct BackupSettings {
    /// Notes tree to back up
    pub source_root: PathBuf,
    /// Dated folder prefix ("Backup Notes" → "Backup Notes - 2024-01-01")
    pub folder_prefix: String,
    /// Copy worker count
    pub copy_threads: usize,
    /// How long to wait for an automounter after a device appears
    pub mount_settle: Duration,
    /// Interval between mount table lookups during the settle window
    pub mount_poll: Duration,
}

impl BackupSettings {
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            folder_prefix: "Backup Notes".to_string(),
            copy_threads: DEFAULT_COPY_THREADS,
            mount_settle: Duration::from_secs(5),
            mount_poll: Duration::from_millis(250),
        }
    }
}

/// Single-occupancy flag for "a backup is running"
#[derive(Debug, Clone, Default)]
pub struct BackupSlot(Arc<AtomicBool>);

impl BackupSlot {
    /// Claim the slot, or `None` if a backup already holds it
    pub fn try_acquire(&self) -> Option<SlotGuard> {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SlotGuard(self.0.clone()))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Releases the slot when dropped
#[derive(Debug)]
pub struct SlotGuard(Arc<AtomicBool>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Manages USB backups in a background thread
///
/// Create with [`BackupManager::spawn`] and communicate via channels.
pub struct BackupManager {
    /// Send commands to the manager thread
    command_tx: Sender<BackupCommand>,
    /// Receive messages from the manager thread
    message_rx: Receiver<BackupMessage>,
    /// Handle to the manager thread (joined on drop)
    thread_handle: Option<JoinHandle<()>>,
    /// Handle to the device monitor thread (stopped on drop)
    _monitor: Option<MonitorHandle>,
}

impl BackupManager {
    /// Spawn the manager with a live device monitor
    pub fn spawn(
        settings: BackupSettings,
        monitor: DeviceMonitor,
        mount_table: Arc<dyn MountTable>,
        unmounter: Arc<dyn Unmounter>,
    ) -> BackupResult<Self> {
        let (event_tx, event_rx) = unbounded();
        let monitor = monitor.spawn(event_tx)?;

        let mut manager = Self::spawn_with_events(settings, event_rx, mount_table, unmounter)?;
        manager._monitor = Some(monitor);
        Ok(manager)
    }

    /// Spawn the manager fed by an arbitrary device event channel
    pub fn spawn_with_events(
        settings: BackupSettings,
        events: Receiver<DeviceEvent>,
        mount_table: Arc<dyn MountTable>,
        unmounter: Arc<dyn Unmounter>,
    ) -> BackupResult<Self> {
        let (command_tx, command_rx) = unbounded::<BackupCommand>();
        let (message_tx, message_rx) = unbounded::<BackupMessage>();
        let (resolved_tx, resolved_rx) = unbounded::<Resolution>();

        let worker = ManagerWorker {
            engine: CopyEngine::new(settings.copy_threads)?,
            settings,
            mount_table,
            unmounter,
            message_tx,
            resolved_tx,
            slot: BackupSlot::default(),
            current_cancel: None,
        };

        let thread_handle = thread::Builder::new()
            .name("backup-manager".to_string())
            .spawn(move || worker.run(command_rx, events, resolved_rx))
            .map_err(|e| BackupError::ThreadSpawn {
                name: "backup-manager".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            command_tx,
            message_rx,
            thread_handle: Some(thread_handle),
            _monitor: None,
        })
    }

    /// Send a command to the manager (non-blocking)
    pub fn send(&self, cmd: BackupCommand) -> Result<(), SendError<BackupCommand>> {
        self.command_tx.send(cmd)
    }

    /// Back up into a directory right away
    pub fn backup_to(&self, target_root: PathBuf) {
        let _ = self.send(BackupCommand::BackupTo { target_root });
    }

    /// Cancel the running backup, if any
    pub fn cancel(&self) {
        let _ = self.send(BackupCommand::CancelBackup);
    }

    /// Shutdown the manager
    pub fn shutdown(&self) {
        let _ = self.send(BackupCommand::Shutdown);
    }

    /// Message receiver for event loops and subscriptions
    pub fn messages(&self) -> &Receiver<BackupMessage> {
        &self.message_rx
    }

    /// Try to receive a message (non-blocking)
    pub fn try_recv(&self) -> Option<BackupMessage> {
        self.message_rx.try_recv().ok()
    }
}

impl Drop for BackupManager {
    fn drop(&mut self) {
        let _ = self.command_tx.send(BackupCommand::Shutdown);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Outcome of a background mount table lookup
struct Resolution {
    device_path: PathBuf,
    volume: Option<ResolvedVolume>,
}

/// State owned by the manager thread
struct ManagerWorker {
    settings: BackupSettings,
    engine: CopyEngine,
    mount_table: Arc<dyn MountTable>,
    unmounter: Arc<dyn Unmounter>,
    message_tx: Sender<BackupMessage>,
    resolved_tx: Sender<Resolution>,
    slot: BackupSlot,
    current_cancel: Option<CancelToken>,
}

impl ManagerWorker {
    /// Main manager thread loop
    fn run(
        mut self,
        command_rx: Receiver<BackupCommand>,
        mut events: Receiver<DeviceEvent>,
        resolved_rx: Receiver<Resolution>,
    ) {
        log::info!("Backup manager thread started");
        let mut events_closed = false;

        loop {
            if events_closed {
                events = never();
                events_closed = false;
            }

            crossbeam::select! {
                recv(command_rx) -> cmd => match cmd {
                    Ok(BackupCommand::BackupTo { target_root }) => {
                        let destination = target_root.join(self.folder_name());
                        self.start_backup(None, target_root, destination);
                    }
                    Ok(BackupCommand::CancelBackup) => {
                        if let Some(token) = &self.current_cancel {
                            log::info!("Cancelling running backup");
                            token.cancel();
                        }
                    }
                    Ok(BackupCommand::Shutdown) => {
                        log::info!("Backup manager shutting down");
                        break;
                    }
                    Err(_) => {
                        log::info!("Backup manager command channel disconnected");
                        break;
                    }
                },
                recv(events) -> event => match event {
                    Ok(event) => self.handle_device_event(event),
                    Err(_) => {
                        log::warn!("Device event channel closed, only explicit backups remain available");
                        events_closed = true;
                    }
                },
                recv(resolved_rx) -> resolution => {
                    if let Ok(resolution) = resolution {
                        self.handle_resolution(resolution);
                    }
                },
            }
        }

        if let Some(token) = &self.current_cancel {
            token.cancel();
        }
        let _ = self.message_tx.send(BackupMessage::Shutdown);
        log::info!("Backup manager thread exiting");
    }

    fn folder_name(&self) -> String {
        super::plan::backup_folder_name(&self.settings.folder_prefix, chrono::Local::now().date_naive())
    }

    /// Handle a hotplug notification
    ///
    /// The mount lookup (with its settle window) runs on a short-lived thread
    /// so commands and further events are never held up by a device that
    /// never mounts.
    fn handle_device_event(&mut self, event: DeviceEvent) {
        let device_path = event.device_path.clone();

        if event.action == DeviceAction::Remove {
            let _ = self.message_tx.send(BackupMessage::DeviceRemoved { device_path });
            return;
        }

        let _ = self.message_tx.send(BackupMessage::DeviceAdded {
            device_path: device_path.clone(),
        });

        if self.slot.is_busy() {
            log::warn!("Backup already running, ignoring {}", device_path.display());
            let _ = self.message_tx.send(BackupMessage::Rejected { device_path });
            return;
        }

        let mount_table = self.mount_table.clone();
        let resolved_tx = self.resolved_tx.clone();
        let (settle, poll) = (self.settings.mount_settle, self.settings.mount_poll);
        let lookup = move || Resolution {
            volume: wait_for_volume(&event, mount_table.as_ref(), settle, poll),
            device_path: event.device_path,
        };

        // Spawning consumes the closure, so keep a handle to redo the lookup inline
        let pending = Arc::new(Mutex::new(Some(lookup)));
        let thread_pending = pending.clone();
        let spawned = thread::Builder::new()
            .name("volume-resolver".to_string())
            .spawn(move || {
                if let Some(lookup) = take_pending(&*thread_pending) {
                    let _ = resolved_tx.send(lookup());
                }
            });

        if let Err(e) = spawned {
            log::warn!("Failed to spawn volume resolver ({}), resolving inline", e);
            if let Some(lookup) = take_pending(&*pending) {
                self.handle_resolution(lookup());
            }
        }
    }

    /// Continue an add event once its mount lookup has finished
    fn handle_resolution(&mut self, resolution: Resolution) {
        let Resolution { device_path, volume } = resolution;

        let volume = match volume {
            Some(volume) => volume,
            None => {
                let _ = self.message_tx.send(BackupMessage::VolumeNotFound { device_path });
                return;
            }
        };

        log::info!(
            "{} ({}) mounted at {}",
            volume.device_path.display(),
            volume.filesystem,
            volume.mount_root.display()
        );

        let destination = volume.backup_root(&self.settings.folder_prefix, chrono::Local::now().date_naive());
        self.start_backup(Some(volume), device_path, destination);
    }

    /// Plan and launch one backup; `requester` names the device or target in messages
    fn start_backup(&mut self, volume: Option<ResolvedVolume>, requester: PathBuf, destination: PathBuf) {
        let guard = match self.slot.try_acquire() {
            Some(guard) => guard,
            None => {
                let _ = self.message_tx.send(BackupMessage::Rejected { device_path: requester });
                return;
            }
        };

        let plan = match build_backup_plan(&self.settings.source_root, &destination) {
            Ok(plan) => plan,
            Err(e) => {
                log::error!("Failed to plan backup: {}", e);
                let _ = self.message_tx.send(BackupMessage::Error(e.to_string()));
                return;
            }
        };

        let filesystem = volume.as_ref().map(|v| v.filesystem);
        if let Some(fs) = filesystem {
            if let Some(limit) = fs.max_file_size() {
                for entry in plan.entries.iter().filter(|e| e.size > limit) {
                    log::warn!("{} is too large for a {} stick", entry.source.display(), fs);
                }
            }
        }

        let _ = self.message_tx.send(BackupMessage::Started {
            destination_root: plan.destination_root.clone(),
            total_files: plan.len(),
            total_bytes: plan.total_bytes,
            filesystem,
        });

        let handle = self.engine.start(plan);
        self.current_cancel = Some(handle.cancel_token());

        let job = FinishJob {
            handle,
            guard,
            volume,
            unmounter: self.unmounter.clone(),
            message_tx: self.message_tx.clone(),
        };

        // Spawning consumes the closure, so keep a handle to finish inline
        let pending = Arc::new(Mutex::new(Some(job)));
        let thread_pending = pending.clone();
        let spawned = thread::Builder::new()
            .name("backup-finisher".to_string())
            .spawn(move || {
                if let Some(job) = take_pending(&*thread_pending) {
                    job.run();
                }
            });

        if let Err(e) = spawned {
            log::error!("Failed to spawn backup finisher thread ({}), finishing inline", e);
            if let Some(job) = take_pending(&*pending) {
                job.run();
            }
        }
    }
}

/// Take work out of a shared slot, tolerating a poisoned lock
fn take_pending<T>(pending: &Mutex<Option<T>>) -> Option<T> {
    match pending.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

/// Everything needed to close out one running batch
struct FinishJob {
    handle: BackupHandle,
    guard: SlotGuard,
    volume: Option<ResolvedVolume>,
    unmounter: Arc<dyn Unmounter>,
    message_tx: Sender<BackupMessage>,
}

impl FinishJob {
    /// Forward failures, wait for the batch, unmount once, then report
    fn run(self) {
        let FinishJob {
            handle,
            guard,
            volume,
            unmounter,
            message_tx,
        } = self;

        for progress in handle.progress().clone().iter() {
            if let CopyProgress::Failed { source, error } = progress {
                let _ = message_tx.send(BackupMessage::EntryFailed { source, error });
            }
        }

        let result = handle.wait();

        if let Some(volume) = &volume {
            if let Err(e) = unmounter.unmount(volume) {
                log::warn!("{}", e);
            }
        }
        drop(guard);

        match result {
            Ok(report) => {
                if report.failed() > 0 {
                    log::warn!(
                        "Backup to {} finished with {} of {} files failed",
                        report.destination_root.display(),
                        report.failed(),
                        report.total()
                    );
                }
                let _ = message_tx.send(BackupMessage::Complete(report));
            }
            Err(e) => {
                log::error!("Backup did not report completion: {}", e);
                let _ = message_tx.send(BackupMessage::Error(e.to_string()));
            }
        }
    }
}
