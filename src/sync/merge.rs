//! Reconciliation Merge - replace the synced subset of a collection
//!
//! A downloaded snapshot replaces every `synced` record of the collection;
//! `pending` records are never touched. Remote deletions need no tombstones:
//! a record absent from the snapshot is simply gone after the merge.
//!
//! Collections that lost their `sync_status` index fall back to a destructive
//! full replace.

use super::models::{EntityFields, Record, SyncMeta};
use crate::db::{Database, DbResult, MergeOutcome};

/// Tag a downloaded record as synced, keeping its idempotency token as `temp_id`
pub fn tag_synced<F: EntityFields>(mut record: Record<F>) -> Record<F> {
    let temp_id = record.meta.temp_id.take().or_else(|| record.meta.local_id.take());
    record.meta = SyncMeta::synced(temp_id);
    record
}

/// Replace the synced records of `F`'s collection with `snapshot`
pub fn replace_synced<F: EntityFields>(db: &Database, snapshot: Vec<Record<F>>) -> DbResult<MergeOutcome> {
    let snapshot: Vec<Record<F>> = snapshot.into_iter().map(tag_synced).collect();

    let outcome = if db.has_sync_index(F::KIND)? {
        db.replace_synced_rows(&snapshot)?
    } else {
        log::warn!(
            "{} collection has no sync index, falling back to full replace",
            F::KIND
        );
        db.replace_all_rows(&snapshot)?
    };

    log::info!(
        "Merged {} snapshot: {} inserted, {} removed, {} pending kept, {} skipped",
        F::KIND,
        outcome.inserted,
        outcome.removed,
        outcome.kept_pending,
        outcome.skipped
    );
    Ok(outcome)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::*;

    fn patient(id: RecordKey, name: &str, status: SyncStatus) -> Patient {
        Patient {
            id: id.clone(),
            fields: PatientFields {
                name: name.to_string(),
                ..PatientFields::default()
            },
            meta: SyncMeta {
                sync_status: status,
                action: (status == SyncStatus::Pending).then_some(SyncAction::Create),
                temp_id: id.as_temp().map(str::to_string),
                ..SyncMeta::default()
            },
        }
    }

    #[test]
    fn test_merge_preserves_pending() {
        let db = Database::in_memory().unwrap();
        let pending = patient(RecordKey::Temp("temp_patient_1_a".into()), "Offline", SyncStatus::Pending);
        let stale = patient(RecordKey::Remote(7), "Stale", SyncStatus::Synced);
        db.put_record(&pending).unwrap();
        db.put_record(&stale).unwrap();

        let body_before: String = db
            .query_row("SELECT body FROM patients WHERE key = ?1", ["temp_patient_1_a"], |r| r.get(0))
            .unwrap();

        let fresh = vec![patient(RecordKey::Remote(8), "Fresh", SyncStatus::Synced)];
        let outcome = replace_synced(&db, fresh).unwrap();

        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.kept_pending, 1);
        assert!(!outcome.full_replace);

        let body_after: String = db
            .query_row("SELECT body FROM patients WHERE key = ?1", ["temp_patient_1_a"], |r| r.get(0))
            .unwrap();
        assert_eq!(body_before, body_after);

        assert!(db.get_record::<PatientFields>(&RecordKey::Remote(7)).unwrap().is_none());
        assert!(db.get_record::<PatientFields>(&RecordKey::Remote(8)).unwrap().is_some());
    }

    #[test]
    fn test_snapshot_never_overwrites_pending_update() {
        let db = Database::in_memory().unwrap();
        let mut edited = patient(RecordKey::Remote(5), "Edited offline", SyncStatus::Pending);
        edited.meta.action = Some(SyncAction::Update);
        db.put_record(&edited).unwrap();

        let outcome = replace_synced(&db, vec![patient(RecordKey::Remote(5), "Server", SyncStatus::Synced)]).unwrap();
        assert_eq!(outcome.skipped, 1);

        let stored = db.get_record::<PatientFields>(&RecordKey::Remote(5)).unwrap().unwrap();
        assert_eq!(stored.fields.name, "Edited offline");
        assert!(stored.is_pending());
    }

    #[test]
    fn test_local_id_becomes_temp_id() {
        let db = Database::in_memory().unwrap();
        let mut remote = patient(RecordKey::Remote(42), "Kim", SyncStatus::Synced);
        remote.meta.local_id = Some("temp_patient_1_a".into());

        replace_synced(&db, vec![remote]).unwrap();

        let stored = db.get_record::<PatientFields>(&RecordKey::Remote(42)).unwrap().unwrap();
        assert_eq!(stored.meta.temp_id.as_deref(), Some("temp_patient_1_a"));
        assert_eq!(stored.meta.sync_status, SyncStatus::Synced);
        assert!(stored.meta.synced_at.is_some());
    }

    #[test]
    fn test_missing_index_falls_back_to_full_replace() {
        let db = Database::in_memory().unwrap();
        db.execute_batch("DROP INDEX idx_checkup_types_sync_status;").unwrap();

        let old = CheckupType::synced(
            1,
            CheckupTypeFields {
                type_code: "OLD".into(),
                type_name: "Old".into(),
                description: None,
                duration_minutes: None,
                is_active: true,
            },
        );
        db.put_record(&old).unwrap();

        let fresh = CheckupType::synced(
            2,
            CheckupTypeFields {
                type_code: "BASIC".into(),
                type_name: "Basic".into(),
                description: None,
                duration_minutes: Some(30),
                is_active: true,
            },
        );
        let outcome = replace_synced(&db, vec![fresh]).unwrap();

        assert!(outcome.full_replace);
        let all = db.get_all::<CheckupTypeFields>().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].fields.type_code, "BASIC");
    }
}
