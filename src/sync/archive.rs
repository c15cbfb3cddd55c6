//! Local data archive: export to a file, import back, wipe
//!
//! The archive is one JSON document holding the four collections in the
//! same shape as a peer transfer (`patients`, `checkups`, `checkupTypes`,
//! `checkupItems`). Import is add-if-absent per collection, and every row
//! is decoded on its own so one bad row only counts as an error for its
//! collection.

use super::models::{
    CheckupFields, CheckupItemFields, CheckupTypeFields, EntityFields, EntityKind, EntitySet,
    PatientFields, Record, SyncStatus,
};
use crate::db::{Database, DbError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

pub const ARCHIVE_VERSION: &str = "1.0";

/// Import order: reference data and parents before children
const IMPORT_ORDER: [EntityKind; 4] = [
    EntityKind::CheckupType,
    EntityKind::Patient,
    EntityKind::Checkup,
    EntityKind::CheckupItem,
];

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not a data archive: {0}")]
    Format(String),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Archive {
    #[serde(flatten)]
    entities: EntitySet,
    exported_at: String,
    version: String,
}

/// Record counts per collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectionCounts {
    pub patients: usize,
    pub checkups: usize,
    pub checkup_types: usize,
    pub checkup_items: usize,
}

impl CollectionCounts {
    pub fn total(&self) -> usize {
        self.patients + self.checkups + self.checkup_types + self.checkup_items
    }

    fn get_mut(&mut self, kind: EntityKind) -> &mut usize {
        match kind {
            EntityKind::Patient => &mut self.patients,
            EntityKind::Checkup => &mut self.checkups,
            EntityKind::CheckupType => &mut self.checkup_types,
            EntityKind::CheckupItem => &mut self.checkup_items,
        }
    }
}

/// Outcome of importing one collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SheetStats {
    pub added: usize,
    pub skipped: usize,
    /// Rows that could not be decoded
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveImportReport {
    pub patients: SheetStats,
    pub checkups: SheetStats,
    pub checkup_types: SheetStats,
    pub checkup_items: SheetStats,
}

impl ArchiveImportReport {
    fn sheets(&self) -> [&SheetStats; 4] {
        [&self.patients, &self.checkups, &self.checkup_types, &self.checkup_items]
    }

    pub fn stats(&self, kind: EntityKind) -> &SheetStats {
        match kind {
            EntityKind::Patient => &self.patients,
            EntityKind::Checkup => &self.checkups,
            EntityKind::CheckupType => &self.checkup_types,
            EntityKind::CheckupItem => &self.checkup_items,
        }
    }

    fn stats_mut(&mut self, kind: EntityKind) -> &mut SheetStats {
        match kind {
            EntityKind::Patient => &mut self.patients,
            EntityKind::Checkup => &mut self.checkups,
            EntityKind::CheckupType => &mut self.checkup_types,
            EntityKind::CheckupItem => &mut self.checkup_items,
        }
    }

    pub fn total_added(&self) -> usize {
        self.sheets().iter().map(|s| s.added).sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.sheets().iter().map(|s| s.skipped).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.sheets().iter().map(|s| s.errors).sum()
    }
}

// ============================================================================
// Export
// ============================================================================

/// Write every collection, pending rows included, to `path`
pub fn export_to(db: &Database, path: &Path) -> Result<CollectionCounts, ArchiveError> {
    let archive = Archive {
        entities: EntitySet {
            patients: db.get_all::<PatientFields>()?,
            checkups: db.get_all::<CheckupFields>()?,
            checkup_types: db.get_all::<CheckupTypeFields>()?,
            checkup_items: db.get_all::<CheckupItemFields>()?,
        },
        exported_at: chrono::Utc::now().to_rfc3339(),
        version: ARCHIVE_VERSION.to_string(),
    };

    let counts = CollectionCounts {
        patients: archive.entities.patients.len(),
        checkups: archive.entities.checkups.len(),
        checkup_types: archive.entities.checkup_types.len(),
        checkup_items: archive.entities.checkup_items.len(),
    };

    std::fs::write(path, serde_json::to_vec_pretty(&archive)?)?;
    log::info!("Exported {} records to {:?}", counts.total(), path);
    Ok(counts)
}

// ============================================================================
// Import
// ============================================================================

/// Add the archive's records that the store does not have yet.
/// Collections missing from the file are left alone.
pub fn import_from(db: &Database, path: &Path) -> Result<ArchiveImportReport, ArchiveError> {
    let document: Value = serde_json::from_slice(&std::fs::read(path)?)?;
    let Value::Object(mut sheets) = document else {
        return Err(ArchiveError::Format("top level is not an object".to_string()));
    };

    let mut report = ArchiveImportReport::default();
    for kind in IMPORT_ORDER {
        let Some(rows) = sheets.remove(sheet_name(kind)) else {
            continue;
        };
        let Value::Array(rows) = rows else {
            return Err(ArchiveError::Format(format!("{} is not a list", sheet_name(kind))));
        };

        let stats = match kind {
            EntityKind::Patient => import_sheet::<PatientFields>(db, rows)?,
            EntityKind::Checkup => import_sheet::<CheckupFields>(db, rows)?,
            EntityKind::CheckupType => import_sheet::<CheckupTypeFields>(db, rows)?,
            EntityKind::CheckupItem => import_sheet::<CheckupItemFields>(db, rows)?,
        };
        log::info!(
            "Imported {}: {} added, {} skipped, {} errors",
            kind, stats.added, stats.skipped, stats.errors
        );
        *report.stats_mut(kind) = stats;
    }

    Ok(report)
}

fn sheet_name(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Patient => "patients",
        EntityKind::Checkup => "checkups",
        EntityKind::CheckupType => "checkupTypes",
        EntityKind::CheckupItem => "checkupItems",
    }
}

fn import_sheet<F: EntityFields>(db: &Database, rows: Vec<Value>) -> Result<SheetStats, ArchiveError> {
    let mut stats = SheetStats::default();
    let mut records: Vec<Record<F>> = Vec::with_capacity(rows.len());

    for (index, row) in rows.into_iter().enumerate() {
        match serde_json::from_value::<Record<F>>(row) {
            Ok(record) => records.push(record),
            Err(e) => {
                log::warn!("Skipping {} row {}: {}", F::KIND, index, e);
                stats.errors += 1;
            }
        }
    }

    // A temp-keyed row whose record has since synced under its real key
    // is already present
    let mut fresh = Vec::with_capacity(records.len());
    for record in records {
        match record.id.as_temp() {
            Some(temp) if !db.find_by_temp_id::<F>(temp)?.is_empty() => stats.skipped += 1,
            _ => fresh.push(record),
        }
    }

    let written = db.import_missing(&fresh)?;
    stats.added = written.added;
    stats.skipped += written.skipped;
    Ok(stats)
}

// ============================================================================
// Wipe
// ============================================================================

/// Records currently held locally, and how many of them are still pending
pub fn local_counts(db: &Database) -> Result<(CollectionCounts, usize), ArchiveError> {
    let mut counts = CollectionCounts::default();
    let mut pending = 0;
    for kind in IMPORT_ORDER {
        let unsynced = db.count_by_status(kind, SyncStatus::Pending)?;
        *counts.get_mut(kind) = unsynced + db.count_by_status(kind, SyncStatus::Synced)?;
        pending += unsynced;
    }
    Ok((counts, pending))
}

/// Delete every record of every collection, children first. Pending
/// changes are lost with them.
pub fn clear_local(db: &Database) -> Result<CollectionCounts, ArchiveError> {
    let mut removed = CollectionCounts::default();
    for kind in IMPORT_ORDER.iter().rev() {
        *removed.get_mut(*kind) = db.clear_collection(*kind)?;
    }

    log::warn!("Cleared {} local records", removed.total());
    Ok(removed)
}

// ============================================================================
// Tests
// ============================================================================
