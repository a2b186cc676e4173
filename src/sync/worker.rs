//! Backup scheduling: debounced mutation backups and periodic timers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep_until, Instant, MissedTickBehavior};

use super::backup::{BackupOrchestrator, BackupOutcome};
use super::conflict::ConflictDetector;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::storage::{DatasetStore, SettingsStore};
use crate::types::{BackupReason, LocalDataset, Settings};

/// Quiet period after the last mutation before a backup runs
pub const MUTATION_DEBOUNCE: Duration = Duration::from_millis(4_000);
/// Shortest allowed period for recurring timers
pub const PERIODIC_FLOOR: Duration = Duration::from_secs(15 * 60);
/// Delay before the first fire of a freshly armed recurring timer
pub const WARM_UP: Duration = Duration::from_secs(60);

pub const AUTO_BACKUP_KEY: &str = "auto-backup";
pub const PERIODIC_BACKUP_KEY: &str = "periodic-backup";
pub const REMOTE_CHECK_KEY: &str = "remote-check";

/// Builds one run of a recurring timer
pub type TaskFactory = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Named, cancellable timers.
///
/// Scheduling under a key that is already armed cancels the previous timer.
/// Only the pending delay is cancellable: a task that has started runs to
/// completion on its own.
#[derive(Default)]
pub struct TimerRegistry {
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once after `delay`
    pub fn schedule(&self, key: &str, delay: Duration, task: BoxFuture<'static, ()>) {
        let deadline = Instant::now() + delay;
        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;
            tokio::spawn(task);
        });
        self.replace(key, handle);
    }

    /// Run `factory()` after `first`, then every `period`
    pub fn schedule_repeating(&self, key: &str, first: Duration, period: Duration, factory: TaskFactory) {
        let mut ticker = interval_at(Instant::now() + first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let handle = tokio::spawn(async move {
            loop {
                ticker.tick().await;
                // Dropping the handle on abort detaches the run instead of killing it
                let run = tokio::spawn(factory());
                let _ = run.await;
            }
        });
        self.replace(key, handle);
    }

    fn replace(&self, key: &str, handle: JoinHandle<()>) {
        if let Some(previous) = self.timers.lock().insert(key.to_string(), handle) {
            previous.abort();
        }
    }

    /// Cancel the timer under `key`; returns whether one was pending
    pub fn cancel(&self, key: &str) -> bool {
        match self.timers.lock().remove(key) {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.timers
            .lock()
            .get(key)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn cancel_all(&self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// `max(15 min, hours)`; non-finite or non-positive hours fall back to the floor
pub fn periodic_interval(frequency_hours: f64) -> Duration {
    if !frequency_hours.is_finite() || frequency_hours <= 0.0 {
        return PERIODIC_FLOOR;
    }
    Duration::from_secs_f64(frequency_hours * 3600.0).max(PERIODIC_FLOOR)
}

/// Drives background backups and remote checks from mutations and settings
pub struct Scheduler {
    orchestrator: Arc<BackupOrchestrator>,
    detector: Arc<ConflictDetector>,
    settings: Arc<dyn SettingsStore>,
    dataset: Arc<dyn DatasetStore>,
    events: EventBus,
    timers: TimerRegistry,
    debounce: Duration,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<BackupOrchestrator>,
        detector: Arc<ConflictDetector>,
        settings: Arc<dyn SettingsStore>,
        dataset: Arc<dyn DatasetStore>,
        events: EventBus,
    ) -> Self {
        Self {
            orchestrator,
            detector,
            settings,
            dataset,
            events,
            timers: TimerRegistry::new(),
            debounce: MUTATION_DEBOUNCE,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    /// Observe a local mutation; (re)arms the debounced backup.
    ///
    /// Returns false when the mutation left the dataset empty and nothing
    /// was scheduled.
    pub fn on_mutation(&self, dataset: &LocalDataset) -> bool {
        if dataset.is_empty() {
            tracing::debug!("Mutation left dataset empty, no backup scheduled");
            return false;
        }

        let orchestrator = self.orchestrator.clone();
        let task: BoxFuture<'static, ()> = Box::pin(async move {
            run_background_backup(&orchestrator, BackupReason::MutationTriggered).await;
        });
        self.timers.schedule(AUTO_BACKUP_KEY, self.debounce, task);
        true
    }

    /// Re-arm the recurring timers for `settings`
    pub fn reconcile(&self, settings: &Settings) {
        self.timers.cancel(PERIODIC_BACKUP_KEY);
        if settings.backup.enabled {
            let period = periodic_interval(settings.backup.frequency_hours);
            let orchestrator = self.orchestrator.clone();
            let factory: TaskFactory = Arc::new(move || {
                let orchestrator = orchestrator.clone();
                Box::pin(async move {
                    run_background_backup(&orchestrator, BackupReason::Scheduled).await;
                })
            });
            self.timers
                .schedule_repeating(PERIODIC_BACKUP_KEY, WARM_UP, period, factory);
            tracing::info!(period_secs = period.as_secs(), "Periodic backup armed");
        }

        self.timers.cancel(REMOTE_CHECK_KEY);
        if let Some(minutes) = settings.backup.remote_check_minutes {
            if settings.webdav.is_configured() {
                let period = Duration::from_secs(minutes.saturating_mul(60)).max(PERIODIC_FLOOR);
                let detector = self.detector.clone();
                let settings_store = self.settings.clone();
                let dataset_store = self.dataset.clone();
                let events = self.events.clone();
                let factory: TaskFactory = Arc::new(move || {
                    let detector = detector.clone();
                    let settings_store = settings_store.clone();
                    let dataset_store = dataset_store.clone();
                    let events = events.clone();
                    Box::pin(async move {
                        run_remote_check(&detector, &*settings_store, &*dataset_store, &events).await;
                    })
                });
                self.timers
                    .schedule_repeating(REMOTE_CHECK_KEY, WARM_UP, period, factory);
                tracing::info!(period_secs = period.as_secs(), "Remote check armed");
            }
        }
    }

    pub fn shutdown(&self) {
        self.timers.cancel_all();
    }
}

async fn run_background_backup(orchestrator: &BackupOrchestrator, reason: BackupReason) {
    match orchestrator.backup(reason).await {
        Ok(BackupOutcome::Uploaded { file, .. }) => {
            tracing::debug!(%reason, file = %file, "Background backup finished")
        }
        Ok(BackupOutcome::Skipped { reason: skip }) => {
            tracing::debug!(%reason, skip = ?skip, "Background backup skipped")
        }
        // Already published on the event bus; background failures stay in the logs
        Err(e) => tracing::debug!(%reason, error = %e, "Background backup failed"),
    }
}

async fn run_remote_check(
    detector: &ConflictDetector,
    settings: &dyn SettingsStore,
    dataset: &dyn DatasetStore,
    events: &EventBus,
) {
    let result = async {
        let settings = settings.load()?;
        let local = dataset.load()?;
        detector.check_for_newer_remote(&local, &settings).await
    }
    .await;

    match result {
        Ok(Some(check)) if check.has_newer_data => {
            if let Some(file) = check.file {
                events.publish(SyncEvent::remote_newer(&file.name));
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Periodic remote check failed"),
    }
}

/// Commands for the backup worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// The local dataset changed
    Mutated,
    /// Settings were edited; re-arm timers
    SettingsChanged,
    /// Back up right away
    BackupNow(BackupReason),
    /// Stop the worker
    Stop,
}

/// Background worker that feeds a [`Scheduler`] from commands and from
/// polling the local stores for outside edits
pub struct BackupWorker {
    sender: mpsc::Sender<WorkerCommand>,
    handle: JoinHandle<()>,
}

impl BackupWorker {
    /// Start the worker; `poll` is how often the stores are checked for changes
    pub fn start(
        scheduler: Scheduler,
        orchestrator: Arc<BackupOrchestrator>,
        settings: Arc<dyn SettingsStore>,
        dataset: Arc<dyn DatasetStore>,
        poll: Duration,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<WorkerCommand>(100);

        let handle = tokio::spawn(async move {
            let mut last_settings = settings.load().ok();
            if let Some(s) = &last_settings {
                scheduler.reconcile(s);
            }
            let mut last_modified = dataset.load().map(|d| d.last_modified).ok();
            let mut check_interval = interval(poll);
            check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    cmd = receiver.recv() => {
                        match cmd {
                            Some(WorkerCommand::Mutated) => match dataset.load() {
                                Ok(d) => {
                                    last_modified = Some(d.last_modified);
                                    scheduler.on_mutation(&d);
                                }
                                Err(e) => tracing::warn!(error = %e, "Cannot read local dataset"),
                            },
                            Some(WorkerCommand::SettingsChanged) => match settings.load() {
                                Ok(s) => {
                                    scheduler.reconcile(&s);
                                    last_settings = Some(s);
                                }
                                Err(e) => tracing::warn!(error = %e, "Cannot read settings"),
                            },
                            Some(WorkerCommand::BackupNow(reason)) => {
                                run_background_backup(&orchestrator, reason).await;
                            }
                            Some(WorkerCommand::Stop) | None => break,
                        }
                    }
                    _ = check_interval.tick() => {
                        if let Ok(d) = dataset.load() {
                            if last_modified != Some(d.last_modified) {
                                last_modified = Some(d.last_modified);
                                scheduler.on_mutation(&d);
                            }
                        }
                        if let Ok(s) = settings.load() {
                            if last_settings.as_ref() != Some(&s) {
                                scheduler.reconcile(&s);
                                last_settings = Some(s);
                            }
                        }
                    }
                }
            }

            scheduler.shutdown();
            tracing::info!("Backup worker stopped");
        });

        Self { sender, handle }
    }

    async fn send(&self, cmd: WorkerCommand) -> Result<()> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| SyncError::Internal("Worker channel closed".to_string()))
    }

    pub async fn mutated(&self) -> Result<()> {
        self.send(WorkerCommand::Mutated).await
    }

    pub async fn settings_changed(&self) -> Result<()> {
        self.send(WorkerCommand::SettingsChanged).await
    }

    pub async fn backup_now(&self, reason: BackupReason) -> Result<()> {
        self.send(WorkerCommand::BackupNow(reason)).await
    }

    /// Stop the worker and wait for it to wind down
    pub async fn stop(self) -> Result<()> {
        self.send(WorkerCommand::Stop).await?;
        self.handle
            .await
            .map_err(|e| SyncError::Internal(format!("Worker task failed: {}", e)))
    }
}
