//! Sync Data Models - Client-Side Records
//!
//! Defines the four synchronized collections and the per-record sync metadata.
//!
//! Data Categories:
//! - Patient: identity and contact data, created offline or downloaded
//! - Checkup: a visit for a patient, references a Patient key
//! - CheckupItem: a measured value, references a Checkup key
//! - CheckupType: read-only reference data (download only)
//!
//! Every record is stored as `Record<F>`: a store key (temporary or
//! authoritative), the domain fields `F`, and a flattened `SyncMeta`.

use super::temp_key::{is_temp_key_for, provisional_checkup_no, provisional_patient_no};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

// ============================================================================
// Entity Kinds
// ============================================================================

/// The synchronized collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Patient,
    Checkup,
    CheckupType,
    CheckupItem,
}

impl EntityKind {
    /// Upload order: parents strictly before children, reference data never
    pub const UPLOAD_ORDER: [EntityKind; 3] = [Self::Patient, Self::Checkup, Self::CheckupItem];

    /// Download order used by a full refresh
    pub const DOWNLOAD_ORDER: [EntityKind; 4] = [
        Self::Patient,
        Self::CheckupType,
        Self::Checkup,
        Self::CheckupItem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Checkup => "checkup",
            Self::CheckupType => "checkup_type",
            Self::CheckupItem => "checkup_item",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "patient" => Ok(Self::Patient),
            "checkup" => Ok(Self::Checkup),
            "checkup_type" => Ok(Self::CheckupType),
            "checkup_item" => Ok(Self::CheckupItem),
            _ => Err(format!("Invalid entity kind: {}", s)),
        }
    }

    /// Backing table in the local store
    pub fn table(&self) -> &'static str {
        match self {
            Self::Patient => "patients",
            Self::Checkup => "checkups",
            Self::CheckupType => "checkup_types",
            Self::CheckupItem => "checkup_items",
        }
    }

    /// Kind of the record this kind references through its parent key
    pub fn parent(&self) -> Option<EntityKind> {
        match self {
            Self::Checkup => Some(Self::Patient),
            Self::CheckupItem => Some(Self::Checkup),
            Self::Patient | Self::CheckupType => None,
        }
    }

    /// Reference data is never created, changed or deleted locally
    pub fn is_reference_data(&self) -> bool {
        matches!(self, Self::CheckupType)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Record Keys
// ============================================================================

/// Store key of a record: the remote-assigned id, or a temp key allocated
/// while offline. Serializes as a JSON number or string respectively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Remote(i64),
    Temp(String),
}

impl RecordKey {
    pub fn is_temp(&self) -> bool {
        matches!(self, Self::Temp(_))
    }

    pub fn as_remote(&self) -> Option<i64> {
        match self {
            Self::Remote(id) => Some(*id),
            Self::Temp(_) => None,
        }
    }

    pub fn as_temp(&self) -> Option<&str> {
        match self {
            Self::Temp(key) => Some(key),
            Self::Remote(_) => None,
        }
    }

    /// Parse the text form used by the store's `key` column
    pub fn from_db_key(s: &str) -> Self {
        match s.parse::<i64>() {
            Ok(id) => Self::Remote(id),
            Err(_) => Self::Temp(s.to_string()),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(id) => write!(f, "{}", id),
            Self::Temp(key) => f.write_str(key),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(id: i64) -> Self {
        Self::Remote(id)
    }
}

// ============================================================================
// Sync Metadata
// ============================================================================

/// Whether the local copy has been durably applied remotely
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    #[default]
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            _ => Err(format!("Invalid sync status: {}", s)),
        }
    }
}

/// Local mutation waiting to be uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Per-record synchronization metadata, flattened into the stored document
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncMeta {
    #[serde(default, deserialize_with = "null_as_synced")]
    pub sync_status: SyncStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<SyncAction>,

    /// Temp key the record was created under; kept after sync as a breadcrumb
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,

    /// Idempotency token echoed back by the remote API
    #[serde(default, skip_serializing)]
    pub local_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<String>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub sync_attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncMeta {
    pub fn is_pending(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }

    /// Metadata for a record confirmed by the remote system
    pub fn synced(temp_id: Option<String>) -> Self {
        Self {
            sync_status: SyncStatus::Synced,
            temp_id,
            synced_at: Some(chrono::Utc::now().to_rfc3339()),
            ..Self::default()
        }
    }
}

fn null_as_synced<'de, D>(deserializer: D) -> Result<SyncStatus, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<SyncStatus>::deserialize(deserializer)?.unwrap_or_default())
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

// ============================================================================
// Records
// ============================================================================

/// Domain payload of one collection
pub trait EntityFields:
    Serialize + DeserializeOwned + Clone + PartialEq + fmt::Debug + Send + Sync + 'static
{
    const KIND: EntityKind;

    /// Key of the parent record this entity references, if any
    fn parent_ref(&self) -> Option<&RecordKey> {
        None
    }

    fn set_parent_ref(&mut self, _key: RecordKey) {}

    /// Fill provisional fields on a record created offline at `millis`
    fn prepare_offline_create(&mut self, _millis: i64) {}
}

/// A stored record: key + domain fields + sync metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<F> {
    pub id: RecordKey,

    #[serde(flatten)]
    pub fields: F,

    #[serde(flatten)]
    pub meta: SyncMeta,
}

impl<F: EntityFields> Record<F> {
    /// Record as written by a successful remote call
    pub fn synced(id: i64, fields: F) -> Self {
        Self {
            id: RecordKey::Remote(id),
            fields,
            meta: SyncMeta::synced(None),
        }
    }

    pub fn kind(&self) -> EntityKind {
        F::KIND
    }

    pub fn is_pending(&self) -> bool {
        self.meta.is_pending()
    }

    /// Pending deletes stay in the store but are hidden from listings
    pub fn is_visible(&self) -> bool {
        self.meta.action != Some(SyncAction::Delete)
    }
}

pub type Patient = Record<PatientFields>;
pub type Checkup = Record<CheckupFields>;
pub type CheckupType = Record<CheckupTypeFields>;
pub type CheckupItem = Record<CheckupItemFields>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PatientFields {
    /// Human-facing business identifier (`TEMP_P...` until synced)
    #[serde(default)]
    pub patient_id: String,
    #[serde(default)]
    pub name: String,
    pub birth_date: Option<String>,
    /// `M` or `F`
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub emergency_contact: Option<String>,
}

impl EntityFields for PatientFields {
    const KIND: EntityKind = EntityKind::Patient;

    fn prepare_offline_create(&mut self, millis: i64) {
        if self.patient_id.is_empty() {
            self.patient_id = provisional_patient_no(millis);
        }
    }
}

/// Checkup lifecycle: scheduled -> in_progress -> completed, or cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckupStatus {
    #[default]
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckupFields {
    #[serde(default)]
    pub checkup_no: String,
    #[serde(deserialize_with = "patient_ref")]
    pub patient_id: RecordKey,
    pub checkup_type_id: Option<i64>,
    pub checkup_date: Option<String>,
    pub checkup_time: Option<String>,
    #[serde(default)]
    pub status: CheckupStatus,
    pub doctor_name: Option<String>,
    pub notes: Option<String>,
    pub total_score: Option<f64>,
    pub risk_level: Option<String>,
    pub result_summary: Option<String>,
    pub recommendations: Option<String>,
    pub next_checkup_date: Option<String>,
    /// Set when the checkup was created against a not-yet-synced patient
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_patient_id: Option<String>,
}

/// Shapes the checkup listing uses for its patient reference. The server
/// joins `patients.patient_id` onto `checkups.*`, so the duplicate column
/// can arrive as `[3, "P2025001"]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum PatientRefRepr {
    Id(i64),
    Text(String),
    Joined(Vec<serde_json::Value>),
}

/// Decode a checkup's patient reference. Only the numeric record id or a
/// patient temp key is a usable key; a business id such as `P2025001` is
/// rejected rather than stored as a bogus temp parent.
fn patient_ref<'de, D>(deserializer: D) -> Result<RecordKey, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    fn from_text(text: &str) -> Option<RecordKey> {
        if let Ok(id) = text.trim().parse::<i64>() {
            return Some(RecordKey::Remote(id));
        }
        is_temp_key_for(EntityKind::Patient, text).then(|| RecordKey::Temp(text.to_string()))
    }

    match PatientRefRepr::deserialize(deserializer)? {
        PatientRefRepr::Id(id) => Ok(RecordKey::Remote(id)),
        PatientRefRepr::Text(text) => from_text(&text)
            .ok_or_else(|| D::Error::custom(format!("patient_id {:?} is not a record key", text))),
        PatientRefRepr::Joined(values) => values
            .iter()
            .find_map(|v| v.as_i64().map(RecordKey::Remote))
            .or_else(|| values.iter().filter_map(|v| v.as_str()).find_map(from_text))
            .ok_or_else(|| D::Error::custom(format!("patient_id {:?} holds no record key", values))),
    }
}

impl CheckupFields {
    pub fn new(patient_id: RecordKey) -> Self {
        Self {
            checkup_no: String::new(),
            patient_id,
            checkup_type_id: None,
            checkup_date: None,
            checkup_time: None,
            status: CheckupStatus::default(),
            doctor_name: None,
            notes: None,
            total_score: None,
            risk_level: None,
            result_summary: None,
            recommendations: None,
            next_checkup_date: None,
            temp_patient_id: None,
        }
    }
}

impl EntityFields for CheckupFields {
    const KIND: EntityKind = EntityKind::Checkup;

    fn parent_ref(&self) -> Option<&RecordKey> {
        Some(&self.patient_id)
    }

    fn set_parent_ref(&mut self, key: RecordKey) {
        self.patient_id = key;
    }

    fn prepare_offline_create(&mut self, millis: i64) {
        if self.checkup_no.is_empty() {
            self.checkup_no = provisional_checkup_no(millis);
        }
        if let RecordKey::Temp(parent) = &self.patient_id {
            self.temp_patient_id = Some(parent.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckupTypeFields {
    #[serde(default)]
    pub type_code: String,
    #[serde(default)]
    pub type_name: String,
    pub description: Option<String>,
    pub duration_minutes: Option<i64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl EntityFields for CheckupTypeFields {
    const KIND: EntityKind = EntityKind::CheckupType;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckupItemFields {
    pub checkup_id: RecordKey,
    pub item_category: Option<String>,
    #[serde(default)]
    pub item_name: String,
    pub item_value: Option<String>,
    pub reference_range: Option<String>,
    pub unit: Option<String>,
    pub status: Option<String>,
    pub notes: Option<String>,
    pub measured_at: Option<String>,
}

impl CheckupItemFields {
    pub fn new(checkup_id: RecordKey, item_name: impl Into<String>) -> Self {
        Self {
            checkup_id,
            item_category: None,
            item_name: item_name.into(),
            item_value: None,
            reference_range: None,
            unit: None,
            status: None,
            notes: None,
            measured_at: None,
        }
    }
}

impl EntityFields for CheckupItemFields {
    const KIND: EntityKind = EntityKind::CheckupItem;

    fn parent_ref(&self) -> Option<&RecordKey> {
        Some(&self.checkup_id)
    }

    fn set_parent_ref(&mut self, key: RecordKey) {
        self.checkup_id = key;
    }
}

// ============================================================================
// Collections
// ============================================================================

/// The full four-collection data set, as downloaded or peer-transferred
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySet {
    #[serde(default)]
    pub patients: Vec<Patient>,
    #[serde(default)]
    pub checkups: Vec<Checkup>,
    #[serde(default)]
    pub checkup_types: Vec<CheckupType>,
    #[serde(default)]
    pub checkup_items: Vec<CheckupItem>,
}

impl EntitySet {
    pub fn total_records(&self) -> usize {
        self.patients.len() + self.checkups.len() + self.checkup_types.len() + self.checkup_items.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
