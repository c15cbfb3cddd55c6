//! Sync Manager - Orchestrates the sync cycle
//!
//! One cycle runs three phases against the remote API:
//! 1. Upload pending patients, then checkups, then checkup items
//! 2. Replay the legacy offline request queue
//! 3. Download every collection and merge it into the local synced subset
//!
//! Handles:
//! - Temp key -> authoritative key swaps, with child references rewritten
//! - Deferral of children whose parent has not synchronized yet
//! - Per-record and per-collection failure isolation
//! - Degrading to offline mode on network failures
//!
//! Cycles are serialized: a trigger arriving while one runs waits for it.

use super::api::{RemoteError, DEFAULT_PROBE_TIMEOUT};
use super::context::SyncContext;
use super::merge;
use super::models::{
    CheckupFields, CheckupItem, CheckupItemFields, CheckupTypeFields, EntityFields, EntityKind,
    PatientFields, Record, RecordKey, SyncAction, SyncMeta, SyncStatus,
};
use super::queue::{OfflineRequest, QueueError, QueueStats, RequestQueue};
use super::resolver::{DependencyResolver, Resolution};
use super::tracker::{ChangeTracker, PendingSummary, TrackerError};
use crate::db::{DbError, MergeOutcome};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Deferrals before a record waiting on its parent is reported as stalled
pub const DEFAULT_MAX_DEPENDENCY_DEFERRALS: u32 = 10;

/// Sync manager - main orchestrator
#[derive(Clone)]
pub struct SyncManager {
    ctx: SyncContext,
    resolver: DependencyResolver,
    tracker: Arc<ChangeTracker>,
    queue: Arc<RequestQueue>,
    cycle_lock: Arc<Mutex<()>>,
    max_dependency_deferrals: u32,
    probe_timeout: Duration,
}

impl SyncManager {
    pub fn new(ctx: SyncContext) -> Result<Self, SyncError> {
        let db = ctx.db().clone();
        let queue = RequestQueue::new(db.clone())?;

        Ok(Self {
            resolver: DependencyResolver::new(db.clone()),
            tracker: Arc::new(ChangeTracker::new(db)),
            queue: Arc::new(queue),
            cycle_lock: Arc::new(Mutex::new(())),
            max_dependency_deferrals: DEFAULT_MAX_DEPENDENCY_DEFERRALS,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            ctx,
        })
    }

    pub fn with_max_dependency_deferrals(mut self, max: u32) -> Self {
        self.max_dependency_deferrals = max.max(1);
        self
    }

    /// Upper bound on one health probe
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Entry point for local mutations
    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    // ========================================================================
    // Cycle Entry Points
    // ========================================================================

    /// Probe the server and update the connectivity flag
    pub async fn probe(&self) -> bool {
        let reachable = match tokio::time::timeout(self.probe_timeout, self.ctx.remote().health()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::debug!("Health probe failed: {}", e);
                false
            }
            Err(_) => {
                log::debug!("Health probe timed out");
                false
            }
        };

        self.ctx.set_online(reachable);
        reachable
    }

    /// Run a full cycle: upload, queue replay, download
    pub async fn run_sync_cycle(&self) -> Result<SyncReport, SyncError> {
        let _cycle = self.cycle_lock.lock().await;
        log::info!("Starting sync cycle");

        let mut report = SyncReport::default();
        self.upload_phase(&mut report).await?;

        if self.ctx.is_online() {
            self.replay_offline_requests(&mut report).await?;
            self.download_phase(&mut report).await?;
        } else {
            log::warn!("Connection lost during upload, skipping queue replay and download");
            report.errors.push("connection lost: queue replay and download skipped".to_string());
        }

        self.record_last_run().await;

        if !report.has_errors() {
            log::info!("Sync cycle completed: {}", report.summary());
        } else {
            log::warn!("Sync cycle completed with {} errors: {}", report.errors.len(), report.summary());
        }
        Ok(report)
    }

    /// Run a cycle only if the server answers the probe
    pub async fn sync_if_reachable(&self) -> Result<Option<SyncReport>, SyncError> {
        if !self.probe().await {
            log::info!("Server not reachable, skipping sync");
            return Ok(None);
        }
        self.run_sync_cycle().await.map(Some)
    }

    /// Upload pending records and replay the request queue, without downloading
    pub async fn upload_pending(&self) -> Result<SyncReport, SyncError> {
        let _cycle = self.cycle_lock.lock().await;

        let mut report = SyncReport::default();
        self.upload_phase(&mut report).await?;
        self.replay_offline_requests(&mut report).await?;
        Ok(report)
    }

    /// Refresh every collection from the server
    pub async fn download_all(&self) -> Result<SyncReport, SyncError> {
        let _cycle = self.cycle_lock.lock().await;

        let mut report = SyncReport::default();
        self.download_phase(&mut report).await?;
        Ok(report)
    }

    pub fn pending_summary(&self) -> Result<PendingSummary, SyncError> {
        Ok(self.tracker.pending_summary()?)
    }

    pub fn queue_stats(&self) -> Result<QueueStats, SyncError> {
        Ok(self.queue.get_stats()?)
    }

    /// Clear deferral and failure counters so stalled records are retried
    /// from scratch. Returns the number of records reset.
    pub fn retry_stalled(&self) -> Result<usize, SyncError> {
        let count = self.reset_attempts::<PatientFields>()?
            + self.reset_attempts::<CheckupFields>()?
            + self.reset_attempts::<CheckupItemFields>()?;

        log::info!("Reset {} stalled records for retry", count);
        Ok(count)
    }

    /// Re-arm exhausted queued requests
    pub fn retry_failed_requests(&self) -> Result<i32, SyncError> {
        let count = self.queue.retry_failed()?;
        log::info!("Reset {} failed queued requests for retry", count);
        Ok(count)
    }

    /// Send a raw API request, or queue it for replay when offline
    pub async fn submit_or_queue(
        &self,
        method: &str,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>, SyncError> {
        if self.ctx.is_online() {
            match self.ctx.remote().send_raw(method, endpoint, body.clone()).await {
                Ok(value) => return Ok(Some(value)),
                Err(e) if e.is_connectivity() => {
                    self.ctx.set_online(false);
                    log::warn!("{} {} failed ({}), queueing for replay", method, endpoint, e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let id = self.queue.enqueue(OfflineRequest::new(method, endpoint, body))?;
        log::info!("Queued {} {} as request {}", method, endpoint, id);
        Ok(None)
    }

    async fn record_last_run(&self) {
        let now = chrono::Utc::now().to_rfc3339();
        if let Err(e) = self.ctx.update_settings(|s| s.last_run = Some(now)).await {
            log::warn!("Failed to record last sync time: {}", e);
        }
    }

    // ========================================================================
    // Upload Phase
    // ========================================================================

    async fn upload_phase(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        for kind in EntityKind::UPLOAD_ORDER {
            match kind {
                EntityKind::Patient => self.upload_collection::<PatientFields>(report).await?,
                EntityKind::Checkup => self.upload_collection::<CheckupFields>(report).await?,
                EntityKind::CheckupItem => self.upload_items(report).await?,
                EntityKind::CheckupType => {}
            }
        }
        Ok(())
    }

    async fn upload_collection<F: EntityFields>(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let pending = self.ctx.db().list_by_status::<F>(SyncStatus::Pending)?;
        if pending.is_empty() {
            return Ok(());
        }

        log::info!("Uploading {} pending {} records", pending.len(), F::KIND);

        for record in pending {
            let key = record.id.clone();
            let result = match effective_action(&record) {
                SyncAction::Create => self.upload_create(record).await,
                SyncAction::Update => self.upload_update(record).await,
                SyncAction::Delete => self.upload_delete(record).await,
            };
            let result = self.after_attempt::<F>(&key, result)?;
            self.tally(F::KIND, &key, result, report)?;
        }

        Ok(())
    }

    async fn upload_create<F: EntityFields>(&self, record: Record<F>) -> Result<RecordOutcome, SyncError> {
        let Some(temp_key) = record.id.as_temp().map(str::to_string) else {
            return self.upload_update(record).await;
        };

        let mut fields = record.fields.clone();
        if let Some(outcome) = self.resolve_parent(&record, &mut fields)? {
            return Ok(outcome);
        }

        let body = upload_body(&fields, Some(&temp_key))?;
        let created = self.ctx.remote().create(F::KIND, body).await?;

        let mut stored = authoritative_record(created, &fields)?;
        stored.meta = SyncMeta::synced(Some(temp_key.clone()));
        let remote_id = stored
            .id
            .as_remote()
            .ok_or_else(|| SyncError::Decode(format!("{} response carries no id", F::KIND)))?;

        self.ctx.db().swap_key(&temp_key, &stored)?;
        let rewritten = self.rewrite_children(F::KIND, &temp_key, remote_id)?;

        log::info!(
            "Created {} {} -> {} ({} children rewritten)",
            F::KIND, temp_key, remote_id, rewritten
        );
        Ok(RecordOutcome::Created)
    }

    async fn upload_update<F: EntityFields>(&self, record: Record<F>) -> Result<RecordOutcome, SyncError> {
        let Some(id) = record.id.as_remote() else {
            log::debug!("Skipping update of unsynced {} {}", F::KIND, record.id);
            return Ok(RecordOutcome::Skipped);
        };

        let mut fields = record.fields.clone();
        if let Some(outcome) = self.resolve_parent(&record, &mut fields)? {
            return Ok(outcome);
        }

        let body = upload_body(&fields, None)?;
        let response = self.ctx.remote().update(F::KIND, id, body).await?;

        let mut stored = match response {
            Some(value) => authoritative_record(value, &fields)?,
            None => Record::synced(id, fields),
        };
        stored.id = RecordKey::Remote(id);
        stored.meta = SyncMeta::synced(record.meta.temp_id.clone());
        self.ctx.db().put_record(&stored)?;

        log::info!("Updated {} {}", F::KIND, id);
        Ok(RecordOutcome::Updated)
    }

    async fn upload_delete<F: EntityFields>(&self, record: Record<F>) -> Result<RecordOutcome, SyncError> {
        if let Some(id) = record.id.as_remote() {
            match self.ctx.remote().delete(F::KIND, id).await {
                Ok(()) => {}
                Err(RemoteError::NotFound(_)) => {
                    log::debug!("{} {} already gone on server", F::KIND, id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Never-synced records only exist locally
        self.ctx.db().delete_record(F::KIND, &record.id)?;
        log::info!("Deleted {} {}", F::KIND, record.id);
        Ok(RecordOutcome::Deleted)
    }

    /// Point `fields` at the parent's authoritative key. Returns the outcome
    /// to report when the parent is not available yet.
    fn resolve_parent<F: EntityFields>(
        &self,
        record: &Record<F>,
        fields: &mut F,
    ) -> Result<Option<RecordOutcome>, SyncError> {
        let (Some(parent_kind), Some(parent)) = (F::KIND.parent(), fields.parent_ref().cloned()) else {
            return Ok(None);
        };

        match self.resolver.resolve_ref(parent_kind, &parent)? {
            Resolution::Resolved(id) => {
                fields.set_parent_ref(RecordKey::Remote(id));
                Ok(None)
            }
            Resolution::NotYetAvailable => self.defer(record, parent_kind, &parent).map(Some),
        }
    }

    fn defer<F: EntityFields>(
        &self,
        record: &Record<F>,
        parent_kind: EntityKind,
        parent: &RecordKey,
    ) -> Result<RecordOutcome, SyncError> {
        let mut deferred = record.clone();
        deferred.meta.sync_attempts = deferred.meta.sync_attempts.saturating_add(1);
        deferred.meta.last_error = Some(format!("waiting for {} {}", parent_kind, parent));
        self.ctx.db().put_record(&deferred)?;

        if deferred.meta.sync_attempts >= self.max_dependency_deferrals {
            log::warn!(
                "{} {} stalled: {} {} unresolved after {} attempts",
                F::KIND, record.id, parent_kind, parent, deferred.meta.sync_attempts
            );
            Ok(RecordOutcome::Stalled(StalledRecord {
                kind: F::KIND,
                key: record.id.to_string(),
                waiting_for: parent.to_string(),
                attempts: deferred.meta.sync_attempts,
            }))
        } else {
            log::debug!("Deferring {} {} until {} {} syncs", F::KIND, record.id, parent_kind, parent);
            Ok(RecordOutcome::Deferred)
        }
    }

    fn rewrite_children(&self, kind: EntityKind, temp_key: &str, remote_id: i64) -> Result<usize, SyncError> {
        let db = self.ctx.db();
        let count = match kind {
            EntityKind::Patient => db.rewrite_parent_refs::<CheckupFields>(temp_key, remote_id)?,
            EntityKind::Checkup => db.rewrite_parent_refs::<CheckupItemFields>(temp_key, remote_id)?,
            EntityKind::CheckupType | EntityKind::CheckupItem => 0,
        };
        Ok(count)
    }

    // ------------------------------------------------------------------------
    // Checkup items
    // ------------------------------------------------------------------------

    /// Items are written through their checkup: the server replaces the
    /// checkup's whole item list, so every live item of it goes in one batch.
    async fn upload_items(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let pending = self.ctx.db().list_by_status::<CheckupItemFields>(SyncStatus::Pending)?;
        if pending.is_empty() {
            return Ok(());
        }

        log::info!("Uploading {} pending checkup items", pending.len());

        let (deletes, writes): (Vec<CheckupItem>, Vec<CheckupItem>) = pending
            .into_iter()
            .partition(|r| effective_action(r) == SyncAction::Delete);

        for record in deletes {
            let key = record.id.clone();
            let result = self.upload_item_delete(record).await;
            let result = self.after_attempt::<CheckupItemFields>(&key, result)?;
            self.tally(EntityKind::CheckupItem, &key, result, report)?;
        }

        let mut groups: BTreeMap<RecordKey, Vec<CheckupItem>> = BTreeMap::new();
        for record in writes {
            groups.entry(record.fields.checkup_id.clone()).or_default().push(record);
        }

        for (parent, group) in groups {
            self.upload_item_group(parent, group, report).await?;
        }

        Ok(())
    }

    async fn upload_item_delete(&self, record: CheckupItem) -> Result<RecordOutcome, SyncError> {
        let db = self.ctx.db();

        if let Some(id) = record.id.as_remote() {
            match self.resolver.resolve_ref(EntityKind::Checkup, &record.fields.checkup_id)? {
                Resolution::Resolved(checkup_id) => {
                    match self.ctx.remote().delete_item(checkup_id, id).await {
                        Ok(()) | Err(RemoteError::NotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Resolution::NotYetAvailable => {
                    log::debug!("Checkup of item {} never synced, deleting locally", id);
                }
            }
        }

        db.delete_record(EntityKind::CheckupItem, &record.id)?;
        log::info!("Deleted checkup_item {}", record.id);
        Ok(RecordOutcome::Deleted)
    }

    async fn upload_item_group(
        &self,
        parent: RecordKey,
        group: Vec<CheckupItem>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let checkup_id = match self.resolver.resolve_ref(EntityKind::Checkup, &parent)? {
            Resolution::Resolved(id) => id,
            Resolution::NotYetAvailable => {
                for record in group {
                    let outcome = self.defer(&record, EntityKind::Checkup, &parent);
                    self.tally(EntityKind::CheckupItem, &record.id, outcome, report)?;
                }
                return Ok(());
            }
        };

        let db = self.ctx.db();
        let siblings: Vec<CheckupItem> = db
            .list_by_status::<CheckupItemFields>(SyncStatus::Synced)?
            .into_iter()
            .filter(|r| r.fields.checkup_id == RecordKey::Remote(checkup_id))
            .collect();

        let mut batch = Vec::with_capacity(siblings.len() + group.len());
        for record in siblings.iter().chain(group.iter()) {
            batch.push(item_body(record, checkup_id)?);
        }

        let stored = match self.ctx.remote().save_items(checkup_id, batch).await {
            Ok(values) => values
                .into_iter()
                .filter_map(|v| match serde_json::from_value::<CheckupItem>(v) {
                    Ok(item) if !item.id.is_temp() => Some(item),
                    Ok(_) => None,
                    Err(e) => {
                        log::warn!("Ignoring malformed checkup item in response: {}", e);
                        None
                    }
                })
                .collect::<Vec<_>>(),
            Err(e) => {
                if e.is_connectivity() {
                    self.ctx.set_online(false);
                }
                let message = e.to_string();
                for record in &group {
                    self.note_failure::<CheckupItemFields>(&record.id, &message)?;
                }
                report.checkup_items.failed += group.len();
                report.errors.push(format!("checkup_item batch for checkup {}: {}", checkup_id, message));
                return Ok(());
            }
        };

        for record in group {
            let key = record.id.clone();
            let outcome = self.settle_item(record, checkup_id, &stored);
            self.tally(EntityKind::CheckupItem, &key, outcome, report)?;
        }

        log::info!("Saved item batch for checkup {} ({} returned)", checkup_id, stored.len());
        Ok(())
    }

    /// Store the server's copy of an uploaded item, matched by its
    /// idempotency token
    fn settle_item(
        &self,
        record: CheckupItem,
        checkup_id: i64,
        stored: &[CheckupItem],
    ) -> Result<RecordOutcome, SyncError> {
        let db = self.ctx.db();
        let token = idempotency_token(&record);
        let matched = token.as_deref().and_then(|t| {
            stored
                .iter()
                .find(|s| s.meta.local_id.as_deref() == Some(t) || s.meta.temp_id.as_deref() == Some(t))
        });

        match (matched, record.id.as_temp()) {
            (Some(server_copy), Some(temp_key)) => {
                let mut synced = server_copy.clone();
                synced.meta = SyncMeta::synced(Some(temp_key.to_string()));
                db.swap_key(temp_key, &synced)?;
                Ok(RecordOutcome::Created)
            }
            (Some(server_copy), None) => {
                let mut synced = server_copy.clone();
                synced.meta = SyncMeta::synced(token);
                if synced.id != record.id {
                    db.delete_record(EntityKind::CheckupItem, &record.id)?;
                }
                db.put_record(&synced)?;
                Ok(RecordOutcome::Updated)
            }
            (None, Some(temp_key)) => {
                // Accepted but not echoed back; the download phase restores it
                log::debug!("Item {} saved without echo, dropping local copy", temp_key);
                db.delete_record(EntityKind::CheckupItem, &record.id)?;
                Ok(RecordOutcome::Created)
            }
            (None, None) => {
                let mut synced = record.clone();
                synced.fields.checkup_id = RecordKey::Remote(checkup_id);
                synced.meta = SyncMeta::synced(token);
                db.put_record(&synced)?;
                Ok(RecordOutcome::Updated)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------------

    /// Count remote and decode failures against the record
    fn after_attempt<F: EntityFields>(
        &self,
        key: &RecordKey,
        result: Result<RecordOutcome, SyncError>,
    ) -> Result<Result<RecordOutcome, SyncError>, SyncError> {
        if let Err(e @ (SyncError::Remote(_) | SyncError::Decode(_))) = &result {
            self.note_failure::<F>(key, &e.to_string())?;
        }
        Ok(result)
    }

    fn note_failure<F: EntityFields>(&self, key: &RecordKey, message: &str) -> Result<(), SyncError> {
        let db = self.ctx.db();
        if let Some(mut record) = db.get_record::<F>(key)? {
            record.meta.sync_attempts = record.meta.sync_attempts.saturating_add(1);
            record.meta.last_error = Some(message.to_string());
            db.put_record(&record)?;
        }
        Ok(())
    }

    /// Fold one record's outcome into the report. Store failures abort.
    fn tally(
        &self,
        kind: EntityKind,
        key: &RecordKey,
        result: Result<RecordOutcome, SyncError>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let stats = report.stats_mut(kind);
        match result {
            Ok(RecordOutcome::Created) => stats.created += 1,
            Ok(RecordOutcome::Updated) => stats.updated += 1,
            Ok(RecordOutcome::Deleted) => stats.deleted += 1,
            Ok(RecordOutcome::Deferred) => stats.deferred += 1,
            Ok(RecordOutcome::Skipped) => {}
            Ok(RecordOutcome::Stalled(stalled)) => {
                stats.deferred += 1;
                report.stalled.push(stalled);
            }
            Err(SyncError::Remote(e)) => {
                stats.failed += 1;
                if e.is_connectivity() {
                    self.ctx.set_online(false);
                }
                log::warn!("Upload of {} {} failed: {}", kind, key, e);
                report.errors.push(format!("{} {}: {}", kind, key, e));
            }
            Err(SyncError::Decode(message)) => {
                stats.failed += 1;
                log::warn!("Upload of {} {} failed: {}", kind, key, message);
                report.errors.push(format!("{} {}: {}", kind, key, message));
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn reset_attempts<F: EntityFields>(&self) -> Result<usize, SyncError> {
        let db = self.ctx.db();
        let mut count = 0;
        for mut record in db.list_by_status::<F>(SyncStatus::Pending)? {
            if record.meta.sync_attempts > 0 {
                record.meta.sync_attempts = 0;
                record.meta.last_error = None;
                db.put_record(&record)?;
                count += 1;
            }
        }
        Ok(count)
    }

    // ========================================================================
    // Legacy Queue Replay
    // ========================================================================

    async fn replay_offline_requests(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let due = self.queue.due_requests()?;
        if due.is_empty() {
            return Ok(());
        }

        log::info!("Replaying {} queued requests", due.len());

        for request in due {
            let Some(id) = request.id else { continue };

            match self.ctx.remote().send_raw(&request.method, &request.endpoint, request.body.clone()).await {
                Ok(_) => {
                    self.queue.remove(id)?;
                    report.requests_replayed += 1;
                }
                Err(e) => {
                    log::warn!("Queued request {} ({} {}) failed: {}", id, request.method, request.endpoint, e);
                    self.queue.mark_failed_and_retry(id, e.to_string())?;
                    report.requests_failed += 1;
                    report.errors.push(format!("queued {} {}: {}", request.method, request.endpoint, e));

                    if e.is_connectivity() {
                        self.ctx.set_online(false);
                        break;
                    }
                }
            }
        }

        log::info!(
            "Queue replay complete: {} succeeded, {} failed",
            report.requests_replayed, report.requests_failed
        );
        Ok(())
    }

    // ========================================================================
    // Download Phase
    // ========================================================================

    async fn download_phase(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        for kind in EntityKind::DOWNLOAD_ORDER {
            let result = match kind {
                EntityKind::Patient => self.download_collection::<PatientFields>().await,
                EntityKind::CheckupType => self.download_collection::<CheckupTypeFields>().await,
                EntityKind::Checkup => self.download_collection::<CheckupFields>().await,
                EntityKind::CheckupItem => self.download_collection::<CheckupItemFields>().await,
            };

            match result {
                Ok((outcome, rejected)) => {
                    if !rejected.is_empty() {
                        report.errors.push(format!(
                            "download {}: {} rows rejected ({})",
                            kind,
                            rejected.len(),
                            rejected.join("; ")
                        ));
                    }
                    report.downloads.push(outcome);
                }
                Err(SyncError::Store(e)) => return Err(SyncError::Store(e)),
                Err(e) => {
                    if let SyncError::Remote(remote) = &e {
                        if remote.is_connectivity() {
                            self.ctx.set_online(false);
                        }
                    }
                    log::error!("Download of {} failed: {}", kind, e);
                    report.errors.push(format!("download {}: {}", kind, e));
                    report.downloads.push(DownloadOutcome::failed(kind, e.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Fetch one collection and merge the rows that decode. Rows that do
    /// not are returned as messages; they never block the rest.
    async fn download_collection<F: EntityFields>(&self) -> Result<(DownloadOutcome, Vec<String>), SyncError> {
        let values = self.ctx.remote().list(F::KIND).await?;
        let fetched = values.len();

        let mut snapshot = Vec::with_capacity(fetched);
        let mut rejected = Vec::new();
        for value in values {
            let id = value.get("id").cloned().unwrap_or(Value::Null);
            match serde_json::from_value::<Record<F>>(value) {
                Ok(record) => snapshot.push(record),
                Err(e) => {
                    log::warn!("Skipping undecodable {} row {}: {}", F::KIND, id, e);
                    rejected.push(format!("id {}: {}", id, e));
                }
            }
        }

        let outcome = merge::replace_synced(self.ctx.db(), snapshot)?;
        let mut download = DownloadOutcome::merged(F::KIND, fetched, &outcome);
        download.rejected = rejected.len();
        Ok((download, rejected))
    }
}

// ============================================================================
// Body Helpers
// ============================================================================

fn effective_action<F: EntityFields>(record: &Record<F>) -> SyncAction {
    match record.meta.action {
        Some(SyncAction::Delete) => SyncAction::Delete,
        _ if record.id.is_temp() => SyncAction::Create,
        Some(action) => action,
        None => SyncAction::Update,
    }
}

fn idempotency_token<F: EntityFields>(record: &Record<F>) -> Option<String> {
    record
        .meta
        .temp_id
        .clone()
        .or_else(|| record.id.as_temp().map(str::to_string))
}

/// Domain fields as sent to the API: sync metadata stripped, the temp key
/// attached as `uuid` for idempotent creates
fn upload_body<F: EntityFields>(fields: &F, uuid: Option<&str>) -> Result<Value, SyncError> {
    let mut body = serde_json::to_value(fields).map_err(|e| SyncError::Decode(e.to_string()))?;
    if let Value::Object(map) = &mut body {
        map.remove("temp_patient_id");
        if let Some(uuid) = uuid {
            map.insert("uuid".to_string(), Value::String(uuid.to_string()));
        }
    }
    Ok(body)
}

fn item_body(record: &CheckupItem, checkup_id: i64) -> Result<Value, SyncError> {
    let mut fields = record.fields.clone();
    fields.checkup_id = RecordKey::Remote(checkup_id);

    let token = idempotency_token(record);
    let mut body = upload_body(&fields, token.as_deref())?;
    if let (Value::Object(map), Some(id)) = (&mut body, record.id.as_remote()) {
        map.insert("id".to_string(), Value::from(id));
    }
    Ok(body)
}

/// Decode the server's copy of a written record, falling back to the local
/// fields when the response only carries the id
fn authoritative_record<F: EntityFields>(value: Value, fields: &F) -> Result<Record<F>, SyncError> {
    let id = value.get("id").and_then(Value::as_i64);

    match serde_json::from_value::<Record<F>>(value) {
        Ok(record) if !record.id.is_temp() => Ok(record),
        _ => id
            .map(|id| Record::synced(id, fields.clone()))
            .ok_or_else(|| SyncError::Decode(format!("{} response carries no id", F::KIND))),
    }
}

// ============================================================================
// Result Types
// ============================================================================

#[derive(Debug)]
enum RecordOutcome {
    Created,
    Updated,
    Deleted,
    Deferred,
    Stalled(StalledRecord),
    Skipped,
}

/// Per-collection upload counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Waiting for a parent record
    pub deferred: usize,
    pub failed: usize,
}

impl UploadStats {
    pub fn uploaded(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// A record whose parent stayed unresolved past the deferral limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StalledRecord {
    pub kind: EntityKind,
    pub key: String,
    pub waiting_for: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOutcome {
    pub kind: EntityKind,
    pub fetched: usize,
    pub inserted: usize,
    /// Rows that failed to decode and were left out of the merge
    pub rejected: usize,
    pub kept_pending: usize,
    pub full_replace: bool,
    pub error: Option<String>,
}

impl DownloadOutcome {
    fn merged(kind: EntityKind, fetched: usize, outcome: &MergeOutcome) -> Self {
        Self {
            kind,
            fetched,
            inserted: outcome.inserted,
            rejected: 0,
            kept_pending: outcome.kept_pending,
            full_replace: outcome.full_replace,
            error: None,
        }
    }

    fn failed(kind: EntityKind, error: String) -> Self {
        Self {
            kind,
            fetched: 0,
            inserted: 0,
            rejected: 0,
            kept_pending: 0,
            full_replace: false,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub patients: UploadStats,
    pub checkups: UploadStats,
    pub checkup_types: UploadStats,
    pub checkup_items: UploadStats,
    pub stalled: Vec<StalledRecord>,
    pub requests_replayed: usize,
    pub requests_failed: usize,
    pub downloads: Vec<DownloadOutcome>,
    pub errors: Vec<String>,
}

impl SyncReport {
    /// Every collection was downloaded and merged
    pub fn is_success(&self) -> bool {
        self.downloads.len() == EntityKind::DOWNLOAD_ORDER.len() && self.downloads_ok()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Every collection that was downloaded merged cleanly
    pub fn downloads_ok(&self) -> bool {
        self.downloads.iter().all(DownloadOutcome::is_ok)
    }

    fn all_stats(&self) -> [&UploadStats; 4] {
        [&self.patients, &self.checkups, &self.checkup_types, &self.checkup_items]
    }

    pub fn uploaded(&self) -> usize {
        self.all_stats().iter().map(|s| s.uploaded()).sum()
    }

    pub fn stats(&self, kind: EntityKind) -> &UploadStats {
        match kind {
            EntityKind::Patient => &self.patients,
            EntityKind::Checkup => &self.checkups,
            EntityKind::CheckupType => &self.checkup_types,
            EntityKind::CheckupItem => &self.checkup_items,
        }
    }

    fn stats_mut(&mut self, kind: EntityKind) -> &mut UploadStats {
        match kind {
            EntityKind::Patient => &mut self.patients,
            EntityKind::Checkup => &mut self.checkups,
            EntityKind::CheckupType => &mut self.checkup_types,
            EntityKind::CheckupItem => &mut self.checkup_items,
        }
    }

    /// Download rows skipped because they failed to decode
    pub fn rejected(&self) -> usize {
        self.downloads.iter().map(|d| d.rejected).sum()
    }

    pub fn summary(&self) -> String {
        let downloaded: usize = self.downloads.iter().map(|d| d.fetched).sum();
        format!(
            "{} uploaded, {} deferred, {} stalled, {} failed, {} requests replayed, {} records downloaded ({} rejected)",
            self.uploaded(),
            self.all_stats().iter().map(|s| s.deferred).sum::<usize>(),
            self.stalled.len(),
            self.all_stats().iter().map(|s| s.failed).sum::<usize>(),
            self.requests_replayed,
            downloaded,
            self.rejected()
        )
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Local store error: {0}")]
    Store(#[from] DbError),

    #[error("API error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Invalid record data: {0}")]
    Decode(String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_body_strips_breadcrumbs() {
        let mut fields = CheckupFields::new(RecordKey::Remote(7));
        fields.temp_patient_id = Some("temp_patient_1_abc".to_string());

        let body = upload_body(&fields, Some("temp_checkup_1_xyz")).unwrap();
        assert_eq!(body["patient_id"], 7);
        assert_eq!(body["uuid"], "temp_checkup_1_xyz");
        assert!(body.get("temp_patient_id").is_none());
        assert!(body.get("sync_status").is_none());
    }

    #[test]
    fn test_item_body_points_at_resolved_checkup() {
        let record = Record {
            id: RecordKey::Temp("temp_item_1_abc".to_string()),
            fields: CheckupItemFields::new(RecordKey::Temp("temp_checkup_1_x".to_string()), "BP"),
            meta: SyncMeta {
                sync_status: SyncStatus::Pending,
                action: Some(SyncAction::Create),
                temp_id: Some("temp_item_1_abc".to_string()),
                ..SyncMeta::default()
            },
        };

        let body = item_body(&record, 42).unwrap();
        assert_eq!(body["checkup_id"], 42);
        assert_eq!(body["uuid"], "temp_item_1_abc");
        assert!(body.get("id").is_none());
    }

    #[test]
    fn test_effective_action() {
        let mut record = Record::synced(5, PatientFields::default());
        assert_eq!(effective_action(&record), SyncAction::Update);

        record.id = RecordKey::Temp("temp_patient_1_a".to_string());
        record.meta.action = Some(SyncAction::Update);
        assert_eq!(effective_action(&record), SyncAction::Create);

        record.meta.action = Some(SyncAction::Delete);
        assert_eq!(effective_action(&record), SyncAction::Delete);
    }

    #[test]
    fn test_each_kind_has_its_own_counter() {
        let mut report = SyncReport::default();
        report.stats_mut(EntityKind::CheckupType).failed += 1;
        report.stats_mut(EntityKind::CheckupItem).created += 2;

        assert_eq!(report.stats(EntityKind::CheckupType).failed, 1);
        assert_eq!(report.checkup_items.failed, 0);
        assert_eq!(report.checkup_types.created, 0);
        assert_eq!(report.uploaded(), 2);
        assert!(report.summary().contains("1 failed"));
    }

    #[test]
    fn test_authoritative_record_falls_back_to_local_fields() {
        let fields = PatientFields {
            name: "Kim".to_string(),
            ..PatientFields::default()
        };

        let record = authoritative_record::<PatientFields>(serde_json::json!({"id": 9}), &fields).unwrap();
        assert_eq!(record.id, RecordKey::Remote(9));
        assert_eq!(record.fields.name, "Kim");

        assert!(authoritative_record::<PatientFields>(serde_json::json!({}), &fields).is_err());
    }
}
