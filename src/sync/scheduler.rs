//! Background Sync Scheduler
//!
//! Runs the sync cycle periodically at a configurable interval (10-3600 s).
//! Uses a Tokio task for non-blocking background execution. The timer only
//! fires a cycle when the connectivity flag says the server is reachable.
//! Stopping cancels the timer between cycles and waits for the task, so a
//! cycle already in flight always runs to completion.

use super::context::SyncContext;
use super::manager::SyncManager;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const MIN_INTERVAL_SECS: u64 = 10;
pub const MAX_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Settings table key for `SyncSettings`
pub const SETTINGS_KEY: &str = "sync_settings";

/// User-facing sync settings stored in the settings table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_true")]
    pub auto_sync_enabled: bool,
    #[serde(default = "default_interval")]
    pub sync_interval_secs: u64,
    /// Disabling local caching also disables periodic sync
    #[serde(default = "default_true")]
    pub local_cache_enabled: bool,
    #[serde(default)]
    pub last_run: Option<String>, // ISO 8601 timestamp
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            auto_sync_enabled: true,
            sync_interval_secs: DEFAULT_INTERVAL_SECS,
            local_cache_enabled: true,
            last_run: None,
        }
    }
}

impl SyncSettings {
    pub fn validate_interval(secs: u64) -> Result<u64, SchedulerError> {
        if (MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&secs) {
            Ok(secs)
        } else {
            Err(SchedulerError::InvalidInterval(format!(
                "Interval must be {}-{} seconds, got {}",
                MIN_INTERVAL_SECS, MAX_INTERVAL_SECS, secs
            )))
        }
    }

    /// Bring a persisted interval back into range
    pub fn clamped(mut self) -> Self {
        self.sync_interval_secs = self.sync_interval_secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);
        self
    }

    pub fn periodic_sync_active(&self) -> bool {
        self.auto_sync_enabled && self.local_cache_enabled
    }
}

/// Spawned timer task and the token that ends it
struct TimerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background scheduler for periodic sync cycles
#[derive(Clone)]
pub struct BackgroundScheduler {
    ctx: SyncContext,
    manager: SyncManager,
    running: Arc<AtomicBool>,
    task: Arc<StdMutex<Option<TimerTask>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Periodic sync is disabled")]
    Disabled,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Sync failed: {0}")]
    Sync(String),
}

impl BackgroundScheduler {
    pub fn new(manager: SyncManager) -> Self {
        Self {
            ctx: manager.context().clone(),
            manager,
            running: Arc::new(AtomicBool::new(false)),
            task: Arc::new(StdMutex::new(None)),
        }
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<TimerTask>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the periodic timer
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let settings = self.ctx.settings().await;
        if !settings.periodic_sync_active() {
            return Err(SchedulerError::Disabled);
        }
        let interval_secs = SyncSettings::validate_interval(settings.sync_interval_secs)?;

        self.running.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let ctx = self.ctx.clone();
        let manager = self.manager.clone();
        let handle = tokio::spawn(async move {
            Self::scheduler_loop(loop_cancel, ctx, manager, interval_secs).await;
        });

        *self.task_slot() = Some(TimerTask { cancel, handle });

        log::info!("Background scheduler started (interval: {} seconds)", interval_secs);
        Ok(())
    }

    /// Stop the periodic timer. Returns once the loop has exited; an
    /// in-flight cycle is awaited, never cancelled.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        let task = self.task_slot().take();
        if let Some(TimerTask { cancel, handle }) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                log::warn!("Scheduler task ended abnormally: {}", e);
            }
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn restart_if_active(&self) -> Result<(), SchedulerError> {
        if self.is_running() {
            let _ = self.stop().await;
        }
        if self.ctx.settings().await.periodic_sync_active() {
            self.start().await?;
        }
        Ok(())
    }

    /// Change the interval; out-of-range values are rejected and the
    /// previous interval stays in effect
    pub async fn update_interval(&self, secs: u64) -> Result<(), SchedulerError> {
        let secs = SyncSettings::validate_interval(secs)?;

        self.ctx
            .update_settings(|s| s.sync_interval_secs = secs)
            .await
            .map_err(|e| SchedulerError::Database(e.to_string()))?;

        if self.is_running() {
            self.restart_if_active().await?;
        }

        log::info!("Sync interval set to {} seconds", secs);
        Ok(())
    }

    pub async fn set_auto_sync(&self, enabled: bool) -> Result<(), SchedulerError> {
        self.ctx
            .update_settings(|s| s.auto_sync_enabled = enabled)
            .await
            .map_err(|e| SchedulerError::Database(e.to_string()))?;

        self.restart_if_active().await?;
        log::info!("Auto sync {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Toggle local caching. Disabling stops periodic sync; enabling
    /// refreshes the cache from the server when it is reachable.
    pub async fn set_local_cache(&self, enabled: bool) -> Result<(), SchedulerError> {
        self.ctx
            .update_settings(|s| s.local_cache_enabled = enabled)
            .await
            .map_err(|e| SchedulerError::Database(e.to_string()))?;

        self.restart_if_active().await?;
        log::info!("Local cache {}", if enabled { "enabled" } else { "disabled" });

        if enabled && self.ctx.is_online() {
            let report = self.manager
                .download_all()
                .await
                .map_err(|e| SchedulerError::Sync(e.to_string()))?;
            if !report.is_success() {
                log::warn!("Cache refresh incomplete: {:?}", report.errors);
            }
        }

        Ok(())
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        cancel: CancellationToken,
        ctx: SyncContext,
        manager: SyncManager,
        interval_secs: u64,
    ) {
        let period = Duration::from_secs(interval_secs);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        log::info!("Scheduler loop started (interval: {} seconds)", interval_secs);

        loop {
            // Cancellation is only observed while waiting for the next tick
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("Scheduler loop: stopping (cancelled)");
                    break;
                }
                _ = interval.tick() => {}
            }

            if !ctx.is_online() {
                log::debug!("Scheduled sync skipped: offline");
                continue;
            }

            log::info!("Background sync triggered by scheduler");

            match manager.run_sync_cycle().await {
                Ok(report) => {
                    log::info!("Background sync finished: {}", report.summary());
                    if !report.errors.is_empty() {
                        log::warn!("Background sync had {} errors: {:?}", report.errors.len(), report.errors);
                    }
                }
                Err(e) => log::error!("Background sync failed: {}", e),
            }
        }

        log::info!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::models::{EntityKind, PatientFields};
    use crate::sync::tests::FakeRemote;
    use serde_json::json;

    async fn setup() -> (SyncContext, BackgroundScheduler) {
        setup_with(Arc::new(FakeRemote::new())).await
    }

    async fn setup_with(remote: Arc<FakeRemote>) -> (SyncContext, BackgroundScheduler) {
        let db = Arc::new(Database::in_memory().unwrap());
        let ctx = SyncContext::open(db, remote).await.unwrap();
        let manager = SyncManager::new(ctx.clone()).unwrap();
        (ctx, BackgroundScheduler::new(manager))
    }

    /// A scheduler whose first cycle (at 10 s) spends 5 s downloading
    async fn slow_download_setup() -> (SyncContext, BackgroundScheduler) {
        let remote = Arc::new(FakeRemote::new());
        remote.seed(EntityKind::Patient, json!({"name": "Kim"}));
        remote.set_list_delay(Duration::from_secs(5));

        let (ctx, scheduler) = setup_with(remote).await;
        ctx.set_online(true);
        scheduler.update_interval(10).await.unwrap();
        scheduler.start().await.unwrap();
        (ctx, scheduler)
    }

    #[test]
    fn test_settings_default() {
        let settings = SyncSettings::default();
        assert!(settings.auto_sync_enabled);
        assert!(settings.local_cache_enabled);
        assert_eq!(settings.sync_interval_secs, 300);
        assert!(settings.last_run.is_none());
    }

    #[test]
    fn test_interval_bounds() {
        assert!(SyncSettings::validate_interval(9).is_err());
        assert_eq!(SyncSettings::validate_interval(10).unwrap(), 10);
        assert_eq!(SyncSettings::validate_interval(3600).unwrap(), 3600);
        assert!(SyncSettings::validate_interval(3601).is_err());
    }

    #[test]
    fn test_persisted_interval_is_clamped() {
        let settings: SyncSettings = serde_json::from_str(r#"{"sync_interval_secs": 5}"#).unwrap();
        assert_eq!(settings.clamped().sync_interval_secs, 10);

        let settings: SyncSettings = serde_json::from_str(r#"{"sync_interval_secs": 99999}"#).unwrap();
        assert_eq!(settings.clamped().sync_interval_secs, 3600);
    }

    #[tokio::test]
    async fn test_rejected_interval_keeps_previous() {
        let (ctx, scheduler) = setup().await;

        scheduler.update_interval(60).await.unwrap();
        assert!(matches!(
            scheduler.update_interval(5).await,
            Err(SchedulerError::InvalidInterval(_))
        ));
        assert!(scheduler.update_interval(7200).await.is_err());

        assert_eq!(ctx.settings().await.sync_interval_secs, 60);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (_ctx, scheduler) = setup().await;

        scheduler.start().await.unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyRunning)));

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
        assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_disabling_cache_stops_periodic_sync() {
        let (ctx, scheduler) = setup().await;
        scheduler.start().await.unwrap();

        scheduler.set_local_cache(false).await.unwrap();
        assert!(!scheduler.is_running());
        assert!(matches!(scheduler.start().await, Err(SchedulerError::Disabled)));

        // Auto sync preference itself is untouched
        assert!(ctx.settings().await.auto_sync_enabled);
    }

    #[tokio::test]
    async fn test_auto_sync_toggle() {
        let (_ctx, scheduler) = setup().await;

        scheduler.set_auto_sync(false).await.unwrap();
        assert!(!scheduler.is_running());

        scheduler.set_auto_sync(true).await.unwrap();
        assert!(scheduler.is_running());
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_runs_cycle_when_online() {
        let (ctx, scheduler) = setup().await;
        ctx.set_online(true);
        scheduler.update_interval(10).await.unwrap();
        scheduler.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        // Let the spawned cycle run to completion
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        assert!(ctx.settings().await.last_run.is_some());
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_running_cycle_finish() {
        let (ctx, scheduler) = slow_download_setup().await;

        // Mid-download
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(ctx.settings().await.last_run.is_none());

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
        assert!(ctx.settings().await.last_run.is_some());
        assert_eq!(ctx.db().get_all::<PatientFields>().unwrap().len(), 1);

        // No further cycles once stopped
        let last_run = ctx.settings().await.last_run;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ctx.settings().await.last_run, last_run);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_does_not_cancel_running_cycle() {
        let (ctx, scheduler) = slow_download_setup().await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        scheduler.update_interval(20).await.unwrap();
        assert!(scheduler.is_running());
        assert!(ctx.settings().await.last_run.is_some());
        assert_eq!(ctx.db().get_all::<PatientFields>().unwrap().len(), 1);

        scheduler.stop().await.unwrap();
    }
}
