//! Connectivity Monitor
//!
//! Tracks whether the remote API is reachable. Link events only hint at a
//! change: "up" is confirmed with a health probe before the flag flips,
//! "down" clears the flag immediately. A background watcher re-probes every
//! 30 seconds, and an offline -> online transition triggers a sync cycle
//! when auto sync is enabled.

use super::manager::{SyncError, SyncManager, SyncReport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(30);

struct WatchTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    manager: SyncManager,
    watch_interval: Duration,
    running: Arc<AtomicBool>,
    task: Arc<StdMutex<Option<WatchTask>>>,
}

impl ConnectivityMonitor {
    pub fn new(manager: SyncManager) -> Self {
        Self {
            manager,
            watch_interval: DEFAULT_WATCH_INTERVAL,
            running: Arc::new(AtomicBool::new(false)),
            task: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<WatchTask>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_online(&self) -> bool {
        self.manager.context().is_online()
    }

    /// Probe the server; updates the connectivity flag
    pub async fn verify(&self) -> bool {
        self.manager.probe().await
    }

    /// The network came back (or the watcher fired). Returns the report of
    /// the sync cycle run on an offline -> online transition.
    pub async fn handle_link_up(&self) -> Result<Option<SyncReport>, SyncError> {
        let ctx = self.manager.context();
        let was_online = ctx.is_online();

        if !self.verify().await {
            if was_online {
                log::warn!("Server unreachable, switching to offline mode");
            }
            return Ok(None);
        }

        if was_online {
            return Ok(None);
        }

        if !ctx.settings().await.auto_sync_enabled {
            log::info!("Back online (auto sync disabled)");
            return Ok(None);
        }

        log::info!("Back online, starting sync");
        self.manager.run_sync_cycle().await.map(Some)
    }

    /// The network went away; no probe needed to believe that
    pub fn handle_link_down(&self) {
        if self.manager.context().set_online(false) {
            log::info!("Network lost, working offline");
        }
    }

    /// Start the periodic re-probe; returns false if already running
    pub fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            monitor.watch_loop(loop_cancel).await;
        });
        *self.task_slot() = Some(WatchTask { cancel, handle });

        log::info!("Connectivity watcher started (every {:?})", self.watch_interval);
        true
    }

    /// Stop the watcher; a health check or reconnect cycle in flight is awaited
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let task = self.task_slot().take();
        if let Some(WatchTask { cancel, handle }) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                log::warn!("Connectivity watcher ended abnormally: {}", e);
            }
        }
        log::info!("Connectivity watcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn watch_loop(&self, cancel: CancellationToken) {
        let period = self.watch_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.handle_link_up().await {
                Ok(Some(report)) => log::info!("Reconnect sync finished: {}", report.summary()),
                Ok(None) => {}
                Err(e) => log::error!("Reconnect sync failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::context::SyncContext;
    use crate::sync::tests::FakeRemote;

    async fn setup() -> (Arc<FakeRemote>, ConnectivityMonitor) {
        let db = Arc::new(Database::in_memory().unwrap());
        let remote = Arc::new(FakeRemote::new());
        let ctx = SyncContext::open(db, remote.clone()).await.unwrap();
        let manager = SyncManager::new(ctx).unwrap();
        (remote, ConnectivityMonitor::new(manager))
    }

    #[tokio::test]
    async fn test_link_up_syncs_on_transition() {
        let (_remote, monitor) = setup().await;
        assert!(!monitor.is_online());

        let report = monitor.handle_link_up().await.unwrap();
        assert!(report.is_some());
        assert!(monitor.is_online());

        // Already online: no second cycle
        assert!(monitor.handle_link_up().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_link_up_unverified_stays_offline() {
        let (remote, monitor) = setup().await;
        remote.set_reachable(false);

        assert!(monitor.handle_link_up().await.unwrap().is_none());
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_link_down_clears_flag() {
        let (_remote, monitor) = setup().await;
        assert!(monitor.verify().await);

        monitor.handle_link_down();
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_auto_sync_off_skips_reconnect_cycle() {
        let (_remote, monitor) = setup().await;
        monitor
            .manager
            .context()
            .update_settings(|s| s.auto_sync_enabled = false)
            .await
            .unwrap();

        assert!(monitor.handle_link_up().await.unwrap().is_none());
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_watcher_start_stop() {
        let (_remote, monitor) = setup().await;
        assert!(monitor.start());
        assert!(!monitor.start());
        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_reconnect_cycle() {
        let (remote, monitor) = setup().await;
        let monitor = monitor.with_watch_interval(Duration::from_secs(10));
        remote.set_health_delay(Duration::from_secs(3));

        assert!(monitor.start());
        // The first health check is in flight
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!monitor.is_online());

        monitor.stop().await;
        assert!(!monitor.is_running());
        assert!(monitor.is_online());
        assert!(monitor.manager.context().settings().await.last_run.is_some());
    }
}
