//! Change-State Tracker - tags local mutations for upload
//!
//! Every record mutated while offline is written with
//! `{sync_status: pending, action, temp_id, offline_timestamp}`.
//!
//! State machine:
//! - pending --(remote success)--> synced
//! - pending --(remote success, action=delete)--> removed
//! - failures leave the record pending for the next cycle

use super::models::{EntityFields, EntityKind, Record, RecordKey, SyncAction, SyncMeta, SyncStatus};
use super::temp_key::TempKeyAllocator;
use crate::db::{Database, DbError};
use chrono::{TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Pending record counts per collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingSummary {
    pub patients: usize,
    pub checkups: usize,
    pub checkup_items: usize,
}

impl PendingSummary {
    pub fn total(&self) -> usize {
        self.patients + self.checkups + self.checkup_items
    }
}

/// Writes sync metadata for locally originated mutations
pub struct ChangeTracker {
    db: Arc<Database>,
    keys: TempKeyAllocator,
}

impl ChangeTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            keys: TempKeyAllocator::new(),
        }
    }

    /// Store a new record under a fresh temp key
    pub fn record_create<F: EntityFields>(&self, mut fields: F) -> Result<Record<F>, TrackerError> {
        if F::KIND.is_reference_data() {
            return Err(TrackerError::ReadOnly(F::KIND));
        }

        let millis = self.keys.observe_millis();
        let temp_id = self.keys.allocate(F::KIND);
        fields.prepare_offline_create(millis);

        let record = Record {
            id: RecordKey::Temp(temp_id.clone()),
            fields,
            meta: SyncMeta {
                sync_status: SyncStatus::Pending,
                action: Some(SyncAction::Create),
                temp_id: Some(temp_id),
                offline_timestamp: Some(offline_timestamp(millis)),
                ..SyncMeta::default()
            },
        };

        self.db.put_record(&record)?;
        log::info!("Saved offline {} create as {}", F::KIND, record.id);
        Ok(record)
    }

    /// Replace the fields of an existing record and mark it for upload.
    /// A record still waiting for its create keeps `action = create`.
    pub fn record_update<F: EntityFields>(&self, key: &RecordKey, fields: F) -> Result<Record<F>, TrackerError> {
        if F::KIND.is_reference_data() {
            return Err(TrackerError::ReadOnly(F::KIND));
        }

        let mut record = self.load::<F>(key)?;
        let action = match record.meta.action {
            Some(SyncAction::Delete) if record.is_pending() => {
                return Err(TrackerError::Deleted(key.to_string()));
            }
            Some(SyncAction::Create) if record.is_pending() => SyncAction::Create,
            _ => SyncAction::Update,
        };

        record.fields = fields;
        self.mark_pending(&mut record, action);
        self.db.put_record(&record)?;

        log::info!("Saved offline {} {} for {}", F::KIND, action.as_str(), key);
        Ok(record)
    }

    /// Hide a record and queue its remote delete
    pub fn record_delete<F: EntityFields>(&self, key: &RecordKey) -> Result<(), TrackerError> {
        if F::KIND.is_reference_data() {
            return Err(TrackerError::ReadOnly(F::KIND));
        }

        let mut record = self.load::<F>(key)?;
        self.mark_pending(&mut record, SyncAction::Delete);
        self.db.put_record(&record)?;

        log::info!("Saved offline {} delete for {}", F::KIND, key);
        Ok(())
    }

    /// Everything waiting for upload in `F`'s collection
    pub fn list_pending<F: EntityFields>(&self) -> Result<Vec<Record<F>>, TrackerError> {
        Ok(self.db.list_by_status::<F>(SyncStatus::Pending)?)
    }

    pub fn pending_summary(&self) -> Result<PendingSummary, TrackerError> {
        Ok(PendingSummary {
            patients: self.db.count_by_status(EntityKind::Patient, SyncStatus::Pending)?,
            checkups: self.db.count_by_status(EntityKind::Checkup, SyncStatus::Pending)?,
            checkup_items: self.db.count_by_status(EntityKind::CheckupItem, SyncStatus::Pending)?,
        })
    }

    fn load<F: EntityFields>(&self, key: &RecordKey) -> Result<Record<F>, TrackerError> {
        self.db
            .get_record::<F>(key)?
            .ok_or_else(|| TrackerError::NotFound(format!("{} {}", F::KIND, key)))
    }

    fn mark_pending<F: EntityFields>(&self, record: &mut Record<F>, action: SyncAction) {
        record.meta.sync_status = SyncStatus::Pending;
        record.meta.action = Some(action);
        record.meta.offline_timestamp = Some(offline_timestamp(self.keys.observe_millis()));
        if record.id.is_temp() && record.meta.temp_id.is_none() {
            record.meta.temp_id = record.id.as_temp().map(str::to_string);
        }
    }
}

fn offline_timestamp(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("{0} is reference data and cannot be changed locally")]
    ReadOnly(EntityKind),

    #[error("Record {0} is already marked for deletion")]
    Deleted(String),
}

// ============================================================================
// Tests
// ============================================================================
