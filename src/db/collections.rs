//! Record collections: keyed JSON documents with sync_status / temp_id indexes

use super::{Database, DbError, DbResult};
use crate::sync::models::{EntityFields, EntityKind, Record, RecordKey, SyncStatus};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;

/// Result of replacing a collection's synced subset with a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Synced rows dropped before inserting the snapshot
    pub removed: usize,
    pub inserted: usize,
    /// Pending rows left untouched
    pub kept_pending: usize,
    /// Snapshot rows whose key is held by a pending row
    pub skipped: usize,
    /// The collection had no sync_status index and was wiped wholesale
    pub full_replace: bool,
}

/// Result of an add-if-absent import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ImportStats {
    pub added: usize,
    pub skipped: usize,
}

#[derive(Clone, Copy)]
enum OnConflict {
    Replace,
    Ignore,
}

fn decode<F: EntityFields>(body: &str) -> DbResult<Record<F>> {
    serde_json::from_str(body).map_err(|e| {
        DbError::Serialization(format!("corrupt {} record: {}", F::KIND, e))
    })
}

/// Write one record row; returns true if a row was inserted or replaced
fn write_row<F: EntityFields>(
    conn: &Connection,
    record: &Record<F>,
    on_conflict: OnConflict,
) -> DbResult<bool> {
    let body = serde_json::to_string(record)
        .map_err(|e| DbError::Serialization(e.to_string()))?;
    let verb = match on_conflict {
        OnConflict::Replace => "INSERT OR REPLACE",
        OnConflict::Ignore => "INSERT OR IGNORE",
    };

    let changed = conn.execute(
        &format!(
            "{} INTO {} (key, sync_status, action, temp_id, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            verb,
            F::KIND.table()
        ),
        params![
            record.id.to_string(),
            record.meta.sync_status.as_str(),
            record.meta.action.map(|a| a.as_str()),
            record.meta.temp_id,
            body,
            Utc::now().to_rfc3339(),
        ],
    )?;

    Ok(changed > 0)
}

impl Database {
    // =========================================================================
    // READS
    // =========================================================================

    fn load_records<F: EntityFields>(
        &self,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> DbResult<Vec<Record<F>>> {
        let bodies: Vec<String> = self.query(
            &format!("SELECT body FROM {} {} ORDER BY rowid ASC", F::KIND.table(), filter),
            params,
            |row| row.get(0),
        )?;

        bodies.iter().map(|body| decode::<F>(body)).collect()
    }

    /// Get one record by store key
    pub fn get_record<F: EntityFields>(&self, key: &RecordKey) -> DbResult<Option<Record<F>>> {
        let conn = self.get_conn()?;
        let body: Option<String> = conn
            .query_row(
                &format!("SELECT body FROM {} WHERE key = ?1", F::KIND.table()),
                [key.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|b| decode::<F>(&b)).transpose()
    }

    /// Every record in the collection, pending deletes included
    pub fn get_all<F: EntityFields>(&self) -> DbResult<Vec<Record<F>>> {
        self.load_records("", [])
    }

    /// Records a listing should show (pending deletes filtered out)
    pub fn list_visible<F: EntityFields>(&self) -> DbResult<Vec<Record<F>>> {
        self.load_records("WHERE action IS NULL OR action != 'delete'", [])
    }

    /// Index-scoped query on `sync_status`
    pub fn list_by_status<F: EntityFields>(&self, status: SyncStatus) -> DbResult<Vec<Record<F>>> {
        self.load_records("WHERE sync_status = ?1", [status.as_str()])
    }

    /// Records created under `temp_id`, in any state
    pub fn find_by_temp_id<F: EntityFields>(&self, temp_id: &str) -> DbResult<Vec<Record<F>>> {
        self.load_records("WHERE temp_id = ?1", [temp_id])
    }

    pub fn count_by_status(&self, kind: EntityKind, status: SyncStatus) -> DbResult<usize> {
        let count: i64 = self.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE sync_status = ?1", kind.table()),
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Remote id recorded for a temp key when its record was swapped
    pub fn resolved_key(&self, kind: EntityKind, temp_id: &str) -> DbResult<Option<i64>> {
        let conn = self.get_conn()?;
        let id = conn
            .query_row(
                "SELECT remote_id FROM key_map WHERE kind = ?1 AND temp_id = ?2",
                params![kind.as_str(), temp_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Whether the collection still has its sync_status index
    pub fn has_sync_index(&self, kind: EntityKind) -> DbResult<bool> {
        self.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND name = ?2",
            params![kind.table(), format!("idx_{}_sync_status", kind.table())],
            |row| row.get(0),
        )
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Insert or overwrite a record under its own key
    pub fn put_record<F: EntityFields>(&self, record: &Record<F>) -> DbResult<()> {
        let conn = self.get_conn()?;
        write_row(&conn, record, OnConflict::Replace)?;
        Ok(())
    }

    /// Delete by store key; returns whether a row existed
    pub fn delete_record(&self, kind: EntityKind, key: &RecordKey) -> DbResult<bool> {
        let deleted = self.execute(
            &format!("DELETE FROM {} WHERE key = ?1", kind.table()),
            [key.to_string()],
        )?;
        Ok(deleted > 0)
    }

    pub fn clear_collection(&self, kind: EntityKind) -> DbResult<usize> {
        self.execute(&format!("DELETE FROM {}", kind.table()), [])
    }

    /// Atomically move a record from its temp key to its authoritative key
    /// and record the mapping in `key_map`.
    pub fn swap_key<F: EntityFields>(&self, temp_key: &str, record: &Record<F>) -> DbResult<()> {
        let remote_id = record.id.as_remote().ok_or_else(|| {
            DbError::NotFound(format!("authoritative key for {} {}", F::KIND, temp_key))
        })?;

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            &format!("DELETE FROM {} WHERE key = ?1", F::KIND.table()),
            [temp_key],
        )?;
        write_row(&tx, record, OnConflict::Replace)?;
        tx.execute(
            "INSERT OR REPLACE INTO key_map (kind, temp_id, remote_id, resolved_at) VALUES (?1, ?2, ?3, ?4)",
            params![F::KIND.as_str(), temp_key, remote_id, Utc::now().to_rfc3339()],
        )?;

        tx.commit()?;
        log::debug!("Swapped {} {} -> {}", F::KIND, temp_key, remote_id);
        Ok(())
    }

    /// Point pending children at their parent's authoritative key.
    /// Returns the number of records rewritten.
    pub fn rewrite_parent_refs<F: EntityFields>(&self, temp_parent: &str, remote_id: i64) -> DbResult<usize> {
        let stale = RecordKey::Temp(temp_parent.to_string());
        let children: Vec<Record<F>> = self
            .list_by_status::<F>(SyncStatus::Pending)?
            .into_iter()
            .filter(|r| r.fields.parent_ref() == Some(&stale))
            .collect();

        if children.is_empty() {
            return Ok(0);
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        for mut child in children.iter().cloned() {
            child.fields.set_parent_ref(RecordKey::Remote(remote_id));
            write_row(&tx, &child, OnConflict::Replace)?;
        }
        tx.commit()?;

        Ok(children.len())
    }

    /// Drop every synced row, then insert `snapshot` in one transaction.
    /// Pending rows, and snapshot rows that would overwrite them, are left alone.
    pub fn replace_synced_rows<F: EntityFields>(&self, snapshot: &[Record<F>]) -> DbResult<MergeOutcome> {
        let table = F::KIND.table();
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let removed = tx.execute(
            &format!("DELETE FROM {} WHERE sync_status = ?1", table),
            [SyncStatus::Synced.as_str()],
        )?;

        let pending_keys: HashSet<String> = {
            let mut stmt = tx.prepare(&format!("SELECT key FROM {}", table))?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<String>>>()?;
            keys
        };

        let mut outcome = MergeOutcome {
            removed,
            kept_pending: pending_keys.len(),
            ..MergeOutcome::default()
        };

        for record in snapshot {
            if pending_keys.contains(&record.id.to_string()) {
                outcome.skipped += 1;
                continue;
            }
            write_row(&tx, record, OnConflict::Replace)?;
            outcome.inserted += 1;
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// Destructive replace of the whole collection
    pub fn replace_all_rows<F: EntityFields>(&self, snapshot: &[Record<F>]) -> DbResult<MergeOutcome> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let removed = tx.execute(&format!("DELETE FROM {}", F::KIND.table()), [])?;
        for record in snapshot {
            write_row(&tx, record, OnConflict::Replace)?;
        }

        tx.commit()?;
        Ok(MergeOutcome {
            removed,
            inserted: snapshot.len(),
            full_replace: true,
            ..MergeOutcome::default()
        })
    }

    /// Add records whose key is not present yet; existing keys are skipped
    pub fn import_missing<F: EntityFields>(&self, records: &[Record<F>]) -> DbResult<ImportStats> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let mut stats = ImportStats::default();
        for record in records {
            if write_row(&tx, record, OnConflict::Ignore)? {
                stats.added += 1;
            } else {
                stats.skipped += 1;
            }
        }

        tx.commit()?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::ImportStats;
    use crate::db::Database;
    use crate::sync::models::*;

    fn pending_patient(key: &str, name: &str) -> Patient {
        Patient {
            id: RecordKey::Temp(key.to_string()),
            fields: PatientFields {
                name: name.to_string(),
                ..PatientFields::default()
            },
            meta: SyncMeta {
                sync_status: SyncStatus::Pending,
                action: Some(SyncAction::Create),
                temp_id: Some(key.to_string()),
                ..SyncMeta::default()
            },
        }
    }

    fn synced_patient(id: i64, name: &str) -> Patient {
        Patient::synced(
            id,
            PatientFields {
                name: name.to_string(),
                ..PatientFields::default()
            },
        )
    }

    #[test]
    fn test_put_get_delete() {
        let db = Database::in_memory().unwrap();
        let patient = synced_patient(1, "Lee");

        db.put_record(&patient).unwrap();
        let loaded = db.get_record::<PatientFields>(&RecordKey::Remote(1)).unwrap();
        assert_eq!(loaded, Some(patient));

        assert!(db.delete_record(EntityKind::Patient, &RecordKey::Remote(1)).unwrap());
        assert!(!db.delete_record(EntityKind::Patient, &RecordKey::Remote(1)).unwrap());
        assert!(db.get_record::<PatientFields>(&RecordKey::Remote(1)).unwrap().is_none());
    }

    #[test]
    fn test_list_by_status_and_visibility() {
        let db = Database::in_memory().unwrap();
        db.put_record(&synced_patient(1, "A")).unwrap();
        db.put_record(&pending_patient("temp_patient_1_a", "B")).unwrap();

        let mut deleted = synced_patient(2, "C");
        deleted.meta.sync_status = SyncStatus::Pending;
        deleted.meta.action = Some(SyncAction::Delete);
        db.put_record(&deleted).unwrap();

        assert_eq!(db.list_by_status::<PatientFields>(SyncStatus::Pending).unwrap().len(), 2);
        assert_eq!(db.count_by_status(EntityKind::Patient, SyncStatus::Synced).unwrap(), 1);
        assert_eq!(db.get_all::<PatientFields>().unwrap().len(), 3);

        let visible = db.list_visible::<PatientFields>().unwrap();
        assert_eq!(visible.len(), 2);
        assert!(visible.iter().all(|p| p.fields.name != "C"));
    }

    #[test]
    fn test_swap_key_records_mapping() {
        let db = Database::in_memory().unwrap();
        let pending = pending_patient("temp_patient_1_a", "Park");
        db.put_record(&pending).unwrap();

        let mut synced = synced_patient(42, "Park");
        synced.meta.temp_id = Some("temp_patient_1_a".into());
        db.swap_key("temp_patient_1_a", &synced).unwrap();

        assert!(db.get_record::<PatientFields>(&pending.id).unwrap().is_none());
        let stored = db.get_record::<PatientFields>(&RecordKey::Remote(42)).unwrap().unwrap();
        assert_eq!(stored.meta.temp_id.as_deref(), Some("temp_patient_1_a"));
        assert_eq!(db.resolved_key(EntityKind::Patient, "temp_patient_1_a").unwrap(), Some(42));
        assert_eq!(db.resolved_key(EntityKind::Checkup, "temp_patient_1_a").unwrap(), None);
    }

    #[test]
    fn test_swap_key_requires_remote_id() {
        let db = Database::in_memory().unwrap();
        let pending = pending_patient("temp_patient_1_a", "Park");
        assert!(db.swap_key("temp_patient_1_a", &pending).is_err());
    }

    #[test]
    fn test_rewrite_parent_refs() {
        let db = Database::in_memory().unwrap();
        let mut fields = CheckupFields::new(RecordKey::Temp("temp_patient_1_a".into()));
        fields.temp_patient_id = Some("temp_patient_1_a".into());
        let checkup = Checkup {
            id: RecordKey::Temp("temp_checkup_2_b".into()),
            fields,
            meta: SyncMeta {
                sync_status: SyncStatus::Pending,
                action: Some(SyncAction::Create),
                temp_id: Some("temp_checkup_2_b".into()),
                ..SyncMeta::default()
            },
        };
        db.put_record(&checkup).unwrap();

        let rewritten = db.rewrite_parent_refs::<CheckupFields>("temp_patient_1_a", 42).unwrap();
        assert_eq!(rewritten, 1);

        let stored = db.get_record::<CheckupFields>(&checkup.id).unwrap().unwrap();
        assert_eq!(stored.fields.patient_id, RecordKey::Remote(42));
        assert_eq!(stored.fields.temp_patient_id.as_deref(), Some("temp_patient_1_a"));
    }

    #[test]
    fn test_import_missing_skips_existing() {
        let db = Database::in_memory().unwrap();
        db.put_record(&synced_patient(1, "Local")).unwrap();

        let stats = db
            .import_missing(&[synced_patient(1, "Remote copy"), synced_patient(2, "New")])
            .unwrap();
        assert_eq!(stats, ImportStats { added: 1, skipped: 1 });

        let kept = db.get_record::<PatientFields>(&RecordKey::Remote(1)).unwrap().unwrap();
        assert_eq!(kept.fields.name, "Local");
    }

}
