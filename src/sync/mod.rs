//! Sync Module - Offline-first synchronization of clinical records
//!
//! Provides:
//! - Change tracking for records mutated while offline (temp keys)
//! - Ordered upload with dependency resolution (patient -> checkup -> item)
//! - Snapshot download merged into the synced subset of each collection
//! - Legacy offline request queue with exponential backoff
//! - Connectivity monitoring and a periodic background scheduler
//! - File export/import and wipe of the local collections
//!
//! Architecture:
//! - Local store is authoritative for pending records
//! - Remote API is authoritative for everything synced
//! - Temp keys double as idempotency tokens for creates

pub mod api;
pub mod archive;
pub mod connectivity;
pub mod context;
pub mod manager;
pub mod merge;
pub mod models;
pub mod queue;
pub mod resolver;
pub mod scheduler;
pub mod temp_key;
pub mod tracker;


// Re-export commonly used types
pub use models::{
    Checkup, CheckupFields, CheckupItem, CheckupItemFields, CheckupStatus, CheckupType,
    CheckupTypeFields, EntityFields, EntityKind, EntitySet, Patient, PatientFields, Record,
    RecordKey, SyncAction, SyncMeta, SyncStatus,
};

pub use api::{RemoteApiClient, RemoteError, RemoteStore, DEFAULT_PROBE_TIMEOUT};
pub use archive::{ArchiveError, ArchiveImportReport, CollectionCounts, SheetStats};
pub use connectivity::ConnectivityMonitor;
pub use context::SyncContext;
pub use manager::{DownloadOutcome, StalledRecord, SyncError, SyncManager, SyncReport, UploadStats};
pub use queue::{OfflineRequest, QueueError, QueueStats, QueueStatus, RequestQueue};
pub use resolver::{DependencyResolver, Resolution};
pub use scheduler::{BackgroundScheduler, SchedulerError, SyncSettings};
pub use tracker::{ChangeTracker, PendingSummary, TrackerError};
