//! Transfer Module - Direct device-to-device data handoff
//!
//! Provides:
//! - Manual offer/answer signaling (copy-paste between devices)
//! - Chunked framing with back-pressure on the sending side
//! - Reassembly with checksum verification on the receiving side
//! - Add-if-absent merge of the received data set
//!
//! No server is involved; the sync engine is untouched by a transfer.

pub mod channel;
pub mod frame;
pub mod session;
pub mod signal;

pub use frame::{Progress, TransferFrame, CHUNK_SIZE};
pub use session::{
    ImportReport, ReceiverSession, SendSummary, SenderSession, TransferPayload, TransferState,
    TransferStatus,
};
pub use signal::{SessionDescription, SignalMessage, SignalType};

use crate::db::DbError;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid signal: {0}")]
    Signal(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Chunk {0} never arrived")]
    MissingChunk(usize),

    #[error("Payload checksum mismatch")]
    ChecksumMismatch,

    #[error("Timed out waiting for peer")]
    Timeout,

    #[error("Data channel closed")]
    ChannelClosed,

    #[error("Nothing to send: no patients or checkups stored locally")]
    EmptyPayload,

    #[error("Invalid state: expected {expected}, currently {actual}")]
    InvalidState {
        expected: TransferState,
        actual: TransferState,
    },
}
