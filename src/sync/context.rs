//! Sync context - the handles every sync component shares
//!
//! Holds the local store, the remote API, the connectivity flag and the
//! persisted `SyncSettings`. Constructed once at startup with `open` and torn
//! down with `shutdown`; everything else receives a clone.

use super::api::RemoteStore;
use super::scheduler::{SyncSettings, SETTINGS_KEY};
use crate::db::{Database, DbResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct SyncContext {
    db: Arc<Database>,
    remote: Arc<dyn RemoteStore>,
    online: Arc<AtomicBool>,
    settings: Arc<RwLock<SyncSettings>>,
}

impl SyncContext {
    /// Load persisted settings and assemble the context. Starts offline
    /// until the first probe says otherwise.
    pub async fn open(db: Arc<Database>, remote: Arc<dyn RemoteStore>) -> DbResult<Self> {
        let settings = db
            .get_setting::<SyncSettings>(SETTINGS_KEY)?
            .unwrap_or_default()
            .clamped();

        log::info!(
            "Sync settings loaded: auto_sync={}, interval={}s, local_cache={}",
            settings.auto_sync_enabled,
            settings.sync_interval_secs,
            settings.local_cache_enabled
        );

        Ok(Self {
            db,
            remote,
            online: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(RwLock::new(settings)),
        })
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Set the connectivity flag; returns the previous value
    pub fn set_online(&self, online: bool) -> bool {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            log::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        was
    }

    pub async fn settings(&self) -> SyncSettings {
        self.settings.read().await.clone()
    }

    /// Apply `change` and persist; the in-memory copy is only replaced once
    /// the write succeeded
    pub async fn update_settings<F>(&self, change: F) -> DbResult<SyncSettings>
    where
        F: FnOnce(&mut SyncSettings),
    {
        let mut guard = self.settings.write().await;
        let mut updated = guard.clone();
        change(&mut updated);

        self.db.set_setting(SETTINGS_KEY, &updated)?;
        *guard = updated.clone();
        Ok(updated)
    }

    /// Flush the write-ahead log and drop to offline
    pub fn shutdown(&self) -> DbResult<()> {
        self.online.store(false, Ordering::SeqCst);
        self.db.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        log::info!("Sync context shut down");
        Ok(())
    }
}
