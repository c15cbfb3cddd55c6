//! Peer transfer sessions: sender and receiver state machines
//!
//! Flow:
//! 1. Sender gathers addresses and emits an offer
//! 2. Receiver answers with a one-time token and dials the sender
//! 3. Sender accepts only the connection presenting that token
//! 4. Sender streams metadata, chunks and a completion marker
//! 5. Receiver reassembles, decodes and merges add-if-absent

use super::channel::{FrameReader, FrameWriter, BUFFER_THRESHOLD};
use super::frame::{chunk_frames, ChunkAssembler, Progress, TransferFrame};
use super::signal::{gather_candidates, SessionDescription, SignalMessage, SignalType, GATHER_TIMEOUT};
use super::TransferError;
use crate::db::{Database, ImportStats};
use crate::sync::models::{
    CheckupFields, CheckupItemFields, CheckupTypeFields, EntitySet, PatientFields,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;

pub const PAYLOAD_VERSION: &str = "1.0";

/// How long the sender waits for the receiver to dial in
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(120);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest gap between frames before the receiver gives up
const FRAME_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    OfferCreated,
    AnswerCreated,
    ChannelOpen,
    Transferring,
    Complete,
    Error,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Idle => "idle",
            TransferState::OfferCreated => "offer_created",
            TransferState::AnswerCreated => "answer_created",
            TransferState::ChannelOpen => "channel_open",
            TransferState::Transferring => "transferring",
            TransferState::Complete => "complete",
            TransferState::Error => "error",
        }
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published to observers on every change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferStatus {
    pub state: TransferState,
    pub progress: Progress,
    pub error: Option<String>,
}

impl Default for TransferStatus {
    fn default() -> Self {
        Self {
            state: TransferState::Idle,
            progress: Progress::default(),
            error: None,
        }
    }
}

/// First line the receiver writes after connecting
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    session_id: String,
    token: String,
}

struct StatusCell {
    tx: watch::Sender<TransferStatus>,
}

impl StatusCell {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(TransferStatus::default());
        Self { tx }
    }

    fn state(&self) -> TransferState {
        self.tx.borrow().state
    }

    fn set_state(&self, state: TransferState) {
        log::debug!("Transfer state -> {}", state);
        self.tx.send_modify(|status| {
            status.state = state;
            if state != TransferState::Error {
                status.error = None;
            }
        });
    }

    fn set_progress(&self, progress: Progress) {
        self.tx.send_modify(|status| status.progress = progress);
    }

    fn fail(&self, err: TransferError) -> TransferError {
        log::error!("Transfer failed: {}", err);
        self.tx.send_modify(|status| {
            status.state = TransferState::Error;
            status.error = Some(err.to_string());
        });
        err
    }

    fn reset(&self) {
        self.tx.send_replace(TransferStatus::default());
    }

    fn require(&self, expected: TransferState) -> Result<(), TransferError> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(TransferError::InvalidState { expected, actual })
        }
    }
}

// ============================================================================
// Payload
// ============================================================================

/// Full local data set as shipped to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferPayload {
    #[serde(flatten)]
    pub entities: EntitySet,
    pub timestamp: String,
    pub version: String,
}

/// Per-collection counts from merging a received payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub checkup_types: ImportStats,
    pub patients: ImportStats,
    pub checkups: ImportStats,
    pub checkup_items: ImportStats,
}

impl ImportReport {
    pub fn total_added(&self) -> usize {
        self.checkup_types.added + self.patients.added + self.checkups.added + self.checkup_items.added
    }

    pub fn total_skipped(&self) -> usize {
        self.checkup_types.skipped
            + self.patients.skipped
            + self.checkups.skipped
            + self.checkup_items.skipped
    }
}

impl TransferPayload {
    /// Snapshot every collection, pending rows included
    pub fn collect(db: &Database) -> Result<Self, TransferError> {
        Ok(Self {
            entities: EntitySet {
                patients: db.get_all::<PatientFields>()?,
                checkups: db.get_all::<CheckupFields>()?,
                checkup_types: db.get_all::<CheckupTypeFields>()?,
                checkup_items: db.get_all::<CheckupItemFields>()?,
            },
            timestamp: chrono::Utc::now().to_rfc3339(),
            version: PAYLOAD_VERSION.to_string(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entities.patients.is_empty() && self.entities.checkups.is_empty()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransferError> {
        let payload: TransferPayload = serde_json::from_slice(bytes)?;
        let major = payload.version.split('.').next().unwrap_or_default();
        if major != "1" {
            return Err(TransferError::Protocol(format!(
                "unsupported payload version {}",
                payload.version
            )));
        }
        Ok(payload)
    }

    /// Add records the local store does not have; parents before children
    pub fn import_into(&self, db: &Database) -> Result<ImportReport, TransferError> {
        let report = ImportReport {
            checkup_types: db.import_missing(&self.entities.checkup_types)?,
            patients: db.import_missing(&self.entities.patients)?,
            checkups: db.import_missing(&self.entities.checkups)?,
            checkup_items: db.import_missing(&self.entities.checkup_items)?,
        };

        log::info!(
            "Imported peer data: {} added, {} already present",
            report.total_added(),
            report.total_skipped()
        );
        Ok(report)
    }
}

// ============================================================================
// Sender
// ============================================================================

pub struct SenderSession {
    db: Arc<Database>,
    status: StatusCell,
    listener: Option<TcpListener>,
    session_id: Option<String>,
}

/// What the sender shipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSummary {
    pub records: usize,
    pub bytes: usize,
    pub chunks: usize,
}

impl SenderSession {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            status: StatusCell::new(),
            listener: None,
            session_id: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.status.tx.subscribe()
    }

    pub fn state(&self) -> TransferState {
        self.status.state()
    }

    /// Bind a listener and describe how to reach it
    pub async fn create_offer(&mut self) -> Result<SignalMessage, TransferError> {
        self.status.require(TransferState::Idle)?;
        self.create_offer_inner().await.map_err(|e| self.status.fail(e))
    }

    async fn create_offer_inner(&mut self) -> Result<SignalMessage, TransferError> {
        if TransferPayload::collect(&self.db)?.is_empty() {
            return Err(TransferError::EmptyPayload);
        }

        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        let candidates = gather_candidates(port, GATHER_TIMEOUT).await;

        let description = SessionDescription {
            session_id: uuid::Uuid::new_v4().to_string(),
            token: None,
            candidates,
        };
        let offer = SignalMessage::new(SignalType::Offer, &description)?;

        log::info!(
            "Transfer offer ready on port {} ({} candidates)",
            port,
            description.candidates.len()
        );
        self.listener = Some(listener);
        self.session_id = Some(description.session_id);
        self.status.set_state(TransferState::OfferCreated);
        Ok(offer)
    }

    /// Apply the receiver's answer, wait for it to connect and stream the data
    pub async fn send(&mut self, answer: &SignalMessage) -> Result<SendSummary, TransferError> {
        self.status.require(TransferState::OfferCreated)?;
        let result = self.send_inner(answer).await;
        self.listener = None;
        result.map_err(|e| self.status.fail(e))
    }

    async fn send_inner(&mut self, answer: &SignalMessage) -> Result<SendSummary, TransferError> {
        if answer.kind != SignalType::Answer {
            return Err(TransferError::Signal(format!("expected an answer, got an {}", answer.kind)));
        }
        let description = answer.description()?;
        let session_id = self.session_id.clone().unwrap_or_default();
        if description.session_id != session_id {
            return Err(TransferError::Signal("answer belongs to another session".to_string()));
        }
        let token = description
            .token
            .ok_or_else(|| TransferError::Signal("answer carries no token".to_string()))?;

        let listener = self.listener.as_ref().ok_or(TransferError::ChannelClosed)?;
        let write = accept_peer(listener, &session_id, &token).await?;
        self.status.set_state(TransferState::ChannelOpen);

        let payload = TransferPayload::collect(&self.db)?;
        if payload.is_empty() {
            return Err(TransferError::EmptyPayload);
        }
        let records = payload.entities.total_records();
        let bytes = serde_json::to_vec(&payload)?;

        let writer = FrameWriter::spawn(write);

        let metadata = TransferFrame::metadata_for(&bytes);
        let chunks = match &metadata {
            TransferFrame::Metadata { total_chunks, .. } => *total_chunks,
            _ => 0,
        };

        self.status.set_state(TransferState::Transferring);
        self.status.set_progress(Progress::new(0, chunks));
        writer.send(&metadata)?;

        for (sent, frame) in chunk_frames(&bytes).enumerate() {
            writer.wait_for_drain(BUFFER_THRESHOLD).await?;
            writer.send(&frame)?;
            let progress = Progress::new(sent + 1, chunks);
            log::debug!("Sent chunk {}/{} ({}%)", progress.current, chunks, progress.percentage);
            self.status.set_progress(progress);
        }

        writer.send(&TransferFrame::Complete)?;
        writer.finish().await?;

        log::info!("Sent {} records ({} bytes, {} chunks)", records, bytes.len(), chunks);
        self.status.set_state(TransferState::Complete);
        Ok(SendSummary {
            records,
            bytes: bytes.len(),
            chunks,
        })
    }

    /// Drop the listener and return to idle
    pub fn reset(&mut self) {
        self.listener = None;
        self.session_id = None;
        self.status.reset();
    }
}

/// Accept connections until one presents the session token; returns its write half
async fn accept_peer(
    listener: &TcpListener,
    session_id: &str,
    token: &str,
) -> Result<OwnedWriteHalf, TransferError> {
    let deadline = Instant::now() + ACCEPT_TIMEOUT;

    loop {
        let (stream, peer) = tokio::time::timeout_at(deadline, listener.accept())
            .await
            .map_err(|_| TransferError::Timeout)??;

        let (read, write) = stream.into_split();
        let mut reader = FrameReader::new(read);
        let hello = tokio::time::timeout(HELLO_TIMEOUT, reader.recv_json::<Hello>()).await;

        match hello {
            Ok(Ok(Some(hello))) if hello.session_id == session_id && hello.token == token => {
                log::info!("Peer {} authenticated", peer);
                return Ok(write);
            }
            _ => log::warn!("Rejected connection from {}", peer),
        }
    }
}

// ============================================================================
// Receiver
// ============================================================================

pub struct ReceiverSession {
    db: Arc<Database>,
    status: StatusCell,
    pending: Option<(SessionDescription, String)>,
}

impl ReceiverSession {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            status: StatusCell::new(),
            pending: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.status.tx.subscribe()
    }

    pub fn state(&self) -> TransferState {
        self.status.state()
    }

    /// Accept an offer and produce the answer to send back
    pub fn create_answer(&mut self, offer: &SignalMessage) -> Result<SignalMessage, TransferError> {
        self.status.require(TransferState::Idle)?;
        self.create_answer_inner(offer).map_err(|e| self.status.fail(e))
    }

    fn create_answer_inner(&mut self, offer: &SignalMessage) -> Result<SignalMessage, TransferError> {
        if offer.kind != SignalType::Offer {
            return Err(TransferError::Signal(format!("expected an offer, got an {}", offer.kind)));
        }
        let description = offer.description()?;
        if description.candidates.is_empty() {
            return Err(TransferError::Signal("offer lists no addresses".to_string()));
        }

        let token = uuid::Uuid::new_v4().to_string();
        let answer = SignalMessage::new(
            SignalType::Answer,
            &SessionDescription {
                session_id: description.session_id.clone(),
                token: Some(token.clone()),
                candidates: Vec::new(),
            },
        )?;

        self.pending = Some((description, token));
        self.status.set_state(TransferState::AnswerCreated);
        Ok(answer)
    }

    /// Dial the sender, receive the payload and merge it locally
    pub async fn receive(&mut self) -> Result<ImportReport, TransferError> {
        self.status.require(TransferState::AnswerCreated)?;
        let result = self.receive_inner().await;
        self.pending = None;
        result.map_err(|e| self.status.fail(e))
    }

    async fn receive_inner(&mut self) -> Result<ImportReport, TransferError> {
        let (description, token) = self.pending.clone().ok_or(TransferError::ChannelClosed)?;

        let stream = connect_any(&description.candidates).await?;
        let (read, mut write) = stream.into_split();

        let mut hello = serde_json::to_vec(&Hello {
            session_id: description.session_id.clone(),
            token,
        })?;
        hello.push(b'\n');
        write.write_all(&hello).await?;
        write.flush().await?;
        self.status.set_state(TransferState::ChannelOpen);

        let mut reader = FrameReader::new(read);
        let mut assembler: Option<ChunkAssembler> = None;

        let bytes = loop {
            let frame = tokio::time::timeout(FRAME_TIMEOUT, reader.recv())
                .await
                .map_err(|_| TransferError::Timeout)??
                .ok_or(TransferError::ChannelClosed)?;

            match frame {
                TransferFrame::Metadata {
                    total_chunks,
                    total_size,
                    checksum,
                } => {
                    log::info!("Receiving {} bytes in {} chunks", total_size, total_chunks);
                    assembler = Some(ChunkAssembler::new(total_chunks, total_size, checksum)?);
                    self.status.set_state(TransferState::Transferring);
                    self.status.set_progress(Progress::new(0, total_chunks));
                }
                TransferFrame::Chunk { index, data } => {
                    let slots = assembler.as_mut().ok_or_else(|| {
                        TransferError::Protocol("chunk received before metadata".to_string())
                    })?;
                    slots.insert(index, data)?;
                    let progress = slots.progress();
                    log::debug!("Received chunk {} ({}%)", index, progress.percentage);
                    self.status.set_progress(progress);
                }
                TransferFrame::Complete => {
                    let slots = assembler.take().ok_or_else(|| {
                        TransferError::Protocol("completion received before metadata".to_string())
                    })?;
                    break slots.finish()?;
                }
            }
        };

        let payload = TransferPayload::decode(&bytes)?;
        let report = payload.import_into(&self.db)?;
        self.status.set_state(TransferState::Complete);
        Ok(report)
    }

    pub fn reset(&mut self) {
        self.pending = None;
        self.status.reset();
    }
}

/// First candidate that accepts a connection, in offer order
async fn connect_any(candidates: &[SocketAddr]) -> Result<TcpStream, TransferError> {
    for addr in candidates {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                log::info!("Connected to sender at {}", addr);
                return Ok(stream);
            }
            Ok(Err(e)) => log::debug!("Candidate {} unreachable: {}", addr, e),
            Err(_) => log::debug!("Candidate {} timed out", addr),
        }
    }
    Err(TransferError::Signal("no offered address is reachable".to_string()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{Checkup, CheckupItem, Patient};
    use serde_json::json;

    fn patient(id: i64, name: &str) -> Patient {
        serde_json::from_value(json!({
            "id": id, "patient_id": format!("P{:03}", id), "name": name,
            "sync_status": "synced"
        }))
        .unwrap()
    }

    fn checkup(id: i64, patient_id: i64) -> Checkup {
        serde_json::from_value(json!({
            "id": id, "checkup_no": format!("C{}", id), "patient_id": patient_id,
            "status": "completed", "sync_status": "synced"
        }))
        .unwrap()
    }

    fn item(id: i64, checkup_id: i64) -> CheckupItem {
        serde_json::from_value(json!({
            "id": id, "checkup_id": checkup_id, "item_name": "bp", "item_value": "120/80",
            "sync_status": "synced"
        }))
        .unwrap()
    }

    fn seeded_db() -> Arc<Database> {
        let db = Database::in_memory().unwrap();
        db.put_record(&patient(1, "Alice")).unwrap();
        db.put_record(&patient(2, "Bob")).unwrap();
        db.put_record(&checkup(10, 1)).unwrap();
        db.put_record(&item(100, 10)).unwrap();
        Arc::new(db)
    }

    #[test]
    fn test_payload_shape() {
        let payload = TransferPayload::collect(&seeded_db()).unwrap();
        let value = serde_json::to_value(&payload).unwrap();

        for key in ["patients", "checkups", "checkupTypes", "checkupItems", "timestamp", "version"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(value["version"], "1.0");
        assert_eq!(value["patients"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_decode_rejects_unknown_major_version() {
        let mut payload = TransferPayload::collect(&seeded_db()).unwrap();
        payload.version = "2.0".to_string();
        let bytes = serde_json::to_vec(&payload).unwrap();
        assert!(matches!(TransferPayload::decode(&bytes), Err(TransferError::Protocol(_))));
    }

    #[test]
    fn test_import_is_add_if_absent() {
        let payload = TransferPayload::collect(&seeded_db()).unwrap();

        let target = Database::in_memory().unwrap();
        target.put_record(&patient(1, "Alice (local edit)")).unwrap();

        let report = payload.import_into(&target).unwrap();
        assert_eq!(report.patients, ImportStats { added: 1, skipped: 1 });
        assert_eq!(report.checkups.added, 1);
        assert_eq!(report.checkup_items.added, 1);
        assert_eq!(report.total_added(), 3);

        let kept: Patient = target
            .get_record(&crate::sync::RecordKey::Remote(1))
            .unwrap()
            .unwrap();
        assert_eq!(kept.fields.name, "Alice (local edit)");
    }

    #[tokio::test]
    async fn test_sender_refuses_empty_store() {
        let mut sender = SenderSession::new(Arc::new(Database::in_memory().unwrap()));
        let result = sender.create_offer().await;

        assert!(matches!(result, Err(TransferError::EmptyPayload)));
        assert_eq!(sender.state(), TransferState::Error);

        sender.reset();
        assert_eq!(sender.state(), TransferState::Idle);
    }

    #[test]
    fn test_receiver_rejects_answer_as_offer() {
        let mut receiver = ReceiverSession::new(Arc::new(Database::in_memory().unwrap()));
        let answer = SignalMessage::new(
            SignalType::Answer,
            &SessionDescription {
                session_id: "x".to_string(),
                token: Some("t".to_string()),
                candidates: Vec::new(),
            },
        )
        .unwrap();

        assert!(receiver.create_answer(&answer).is_err());
        assert_eq!(receiver.state(), TransferState::Error);
        assert!(receiver.subscribe().borrow().error.is_some());
    }

    #[tokio::test]
    async fn test_receive_requires_answer_first() {
        let mut receiver = ReceiverSession::new(Arc::new(Database::in_memory().unwrap()));
        assert!(matches!(
            receiver.receive().await,
            Err(TransferError::InvalidState { expected: TransferState::AnswerCreated, .. })
        ));
        assert_eq!(receiver.state(), TransferState::Idle);
    }

    #[tokio::test]
    async fn test_loopback_transfer() {
        let source = seeded_db();
        let target = Arc::new(Database::in_memory().unwrap());

        let mut sender = SenderSession::new(source);
        let mut receiver = ReceiverSession::new(target.clone());
        let progress = receiver.subscribe();

        let offer = sender.create_offer().await.unwrap();
        assert_eq!(sender.state(), TransferState::OfferCreated);

        let pasted = SignalMessage::parse(&offer.to_json().unwrap(), SignalType::Offer).unwrap();
        let answer = receiver.create_answer(&pasted).unwrap();
        assert_eq!(receiver.state(), TransferState::AnswerCreated);

        let (sent, received) = tokio::join!(sender.send(&answer), receiver.receive());
        let sent = sent.unwrap();
        let report = received.unwrap();

        assert_eq!(sent.records, 4);
        assert_eq!(report.patients.added, 2);
        assert_eq!(report.checkups.added, 1);
        assert_eq!(report.checkup_items.added, 1);
        assert_eq!(target.get_all::<PatientFields>().unwrap().len(), 2);

        assert_eq!(sender.state(), TransferState::Complete);
        assert_eq!(receiver.state(), TransferState::Complete);
        assert_eq!(progress.borrow().progress.percentage, 100);
    }

    #[tokio::test]
    async fn test_wrong_token_is_rejected() {
        let mut sender = SenderSession::new(seeded_db());
        let offer = sender.create_offer().await.unwrap();
        let description = offer.description().unwrap();

        // An intruder dials first with a guessed token and gets dropped
        let intruder_target = description.candidates.last().copied().unwrap();
        let intruder = tokio::spawn(async move {
            let Ok(mut stream) = TcpStream::connect(intruder_target).await else {
                return Ok(None);
            };
            let line = format!(
                "{}\n",
                json!({"session_id": description.session_id, "token": "guess"})
            );
            let _ = stream.write_all(line.as_bytes()).await;
            let mut reader = FrameReader::new(stream);
            reader.recv().await
        });

        let mut receiver = ReceiverSession::new(Arc::new(Database::in_memory().unwrap()));
        let answer = receiver.create_answer(&offer).unwrap();

        let (sent, received) = tokio::join!(sender.send(&answer), receiver.receive());
        sent.unwrap();
        assert_eq!(received.unwrap().patients.added, 2);

        // The intruder saw the stream end without a single frame
        assert!(matches!(intruder.await.unwrap(), Ok(None) | Err(_)));
    }
}
