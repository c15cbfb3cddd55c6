//! Temp-key allocation for records created offline
//!
//! Keys look like `temp_patient_1700000000123_k3x9q0abc`: a kind namespace,
//! the observed wall-clock millis, and a 9-character base36 random suffix.

use super::models::EntityKind;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

const SUFFIX_LEN: usize = 9;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Allocates collision-resistant placeholder keys.
///
/// The timestamp component never goes backwards within one allocator, even if
/// the system clock does.
#[derive(Debug, Default)]
pub struct TempKeyAllocator {
    last_millis: AtomicI64,
}

impl TempKeyAllocator {
    pub const fn new() -> Self {
        Self {
            last_millis: AtomicI64::new(0),
        }
    }

    /// Allocate a fresh temp key for `kind`
    pub fn allocate(&self, kind: EntityKind) -> String {
        let millis = self.observe_millis();
        format!("{}{}_{}", prefix(kind), millis, random_suffix())
    }

    /// Current millis, clamped to be >= every value handed out before
    pub fn observe_millis(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self.last_millis.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }
}

/// Namespace prefix of temp keys for `kind`
pub fn prefix(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Patient => "temp_patient_",
        EntityKind::Checkup => "temp_checkup_",
        EntityKind::CheckupItem => "temp_item_",
        EntityKind::CheckupType => "temp_type_",
    }
}

/// True if `key` was allocated for `kind`
pub fn is_temp_key_for(kind: EntityKind, key: &str) -> bool {
    key.starts_with(prefix(kind))
}

/// Provisional business id for a patient registered offline
pub fn provisional_patient_no(millis: i64) -> String {
    format!("TEMP_P{}", millis)
}

/// Provisional checkup number for a checkup scheduled offline
pub fn provisional_checkup_no(millis: i64) -> String {
    format!("TEMP_CHK{}", millis)
}

fn random_suffix() -> String {
    let mut n = uuid::Uuid::new_v4().as_u128();
    let mut out = String::with_capacity(SUFFIX_LEN);
    for _ in 0..SUFFIX_LEN {
        out.push(BASE36[(n % 36) as usize] as char);
        n /= 36;
    }
    out
}
