//! Dependency Resolver - temp parent key -> authoritative parent id
//!
//! Looks in the `key_map` side index first (written when the parent's key was
//! swapped), then scans the parent collection for a synced record carrying
//! the temp key as its `temp_id` breadcrumb. The scan also covers parents
//! that arrived through a download rather than through this client's upload.

use super::models::{EntityKind, RecordKey, SyncStatus};
use crate::db::{Database, DbResult};
use std::sync::Arc;

/// Outcome of resolving a parent reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved(i64),
    /// The parent has not synchronized yet; retry on a later pass
    NotYetAvailable,
}

#[derive(Clone)]
pub struct DependencyResolver {
    db: Arc<Database>,
}

impl DependencyResolver {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Resolve a temp key of `parent_kind` to the id the remote assigned
    pub fn resolve_parent(&self, parent_kind: EntityKind, temp_parent_id: &str) -> DbResult<Resolution> {
        if let Some(id) = self.db.resolved_key(parent_kind, temp_parent_id)? {
            return Ok(Resolution::Resolved(id));
        }

        let keys: Vec<String> = self.db.query(
            &format!(
                "SELECT key FROM {} WHERE temp_id = ?1 AND sync_status = ?2",
                parent_kind.table()
            ),
            [temp_parent_id, SyncStatus::Synced.as_str()],
            |row| row.get(0),
        )?;

        let resolved = keys
            .iter()
            .find_map(|key| RecordKey::from_db_key(key).as_remote());

        Ok(match resolved {
            Some(id) => {
                log::debug!("Resolved {} {} -> {} by scan", parent_kind, temp_parent_id, id);
                Resolution::Resolved(id)
            }
            None => Resolution::NotYetAvailable,
        })
    }

    /// Resolve any parent reference; authoritative keys pass through unchanged
    pub fn resolve_ref(&self, parent_kind: EntityKind, key: &RecordKey) -> DbResult<Resolution> {
        match key {
            RecordKey::Remote(id) => Ok(Resolution::Resolved(*id)),
            RecordKey::Temp(temp) => self.resolve_parent(parent_kind, temp),
        }
    }
}
