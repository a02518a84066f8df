//! Chunked file-transfer protocol.
//!
//! Moves one file's bytes over a peer's channel, multiplexed against other
//! concurrent transfers on the same channel, with progress tracking and
//! cooperative cancellation.
//!
//! Control messages travel as JSON text frames. File data travels as binary
//! frames carrying a fixed 24-byte header (16-byte transfer id + 8-byte
//! big-endian sequence number) followed by the chunk payload, so every frame
//! is self-describing and interleaving across transfers needs no pairing
//! rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{ChannelMessage, DataChannel};
use crate::events::PeerEvent;
use crate::flow::{FlowAbort, FlowConfig};
use crate::signaling::PeerId;

/// Transfer id (16 bytes) + big-endian sequence number (8 bytes).
pub const FRAME_HEADER_LEN: usize = 24;

pub type TransferId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Sending,
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Active,
    Completed,
    Cancelled,
    Failed,
}

/// Snapshot of one transfer, as exposed to the embedding application.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: TransferId,
    pub peer_id: PeerId,
    pub direction: TransferDirection,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: TransferId,
    pub peer_id: PeerId,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub percentage: f32,
}

/// Protocol control messages carried as JSON text frames on the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    FileStart {
        transfer_id: TransferId,
        file_name: String,
        file_size: u64,
        file_type: String,
    },
    #[serde(rename_all = "camelCase")]
    FileEnd {
        transfer_id: TransferId,
        /// Hex SHA-256 of the whole file; verified before a received file
        /// is materialized.
        checksum: String,
    },
    #[serde(rename_all = "camelCase")]
    FileCancel { transfer_id: TransferId },
}

/// A file handed to the engine for sending.
#[derive(Debug, Clone)]
pub struct OutboundFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

/// Materialized output of a completed receiving transfer. Persists in
/// memory until the embedding application clears it.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub size: u64,
    pub file_type: String,
    pub sender: PeerId,
    pub received_at: DateTime<Utc>,
    /// The user has flushed this file to the local filesystem at least once.
    pub downloaded: bool,
    pub data: Bytes,
}

// ============================================================================
// Binary frame codec
// ============================================================================

pub fn encode_frame(transfer_id: &TransferId, sequence: u64, payload: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(transfer_id.as_bytes());
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(payload);
    Bytes::from(buf)
}

pub fn decode_frame(data: &[u8]) -> Result<(TransferId, u64, &[u8]), String> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(format!(
            "data frame too short: {} bytes, need at least {}",
            data.len(),
            FRAME_HEADER_LEN
        ));
    }
    let transfer_id = Uuid::from_slice(&data[..16])
        .map_err(|e| format!("invalid transfer id in data frame: {}", e))?;
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&data[16..24]);
    Ok((
        transfer_id,
        u64::from_be_bytes(seq),
        &data[FRAME_HEADER_LEN..],
    ))
}

// ============================================================================
// Transfer table
// ============================================================================

struct TransferRecord {
    peer_id: PeerId,
    direction: TransferDirection,
    file_name: String,
    file_size: u64,
    file_type: String,
    bytes_transferred: u64,
    cancel: Arc<AtomicBool>,
    /// Receiving side only: bytes accumulated so far.
    accumulator: Option<Vec<u8>>,
    /// Receiving side only: next expected frame sequence number.
    expected_seq: u64,
}

impl TransferRecord {
    fn snapshot(&self, id: TransferId, status: TransferStatus) -> Transfer {
        Transfer {
            id,
            peer_id: self.peer_id.clone(),
            direction: self.direction,
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            file_type: self.file_type.clone(),
            bytes_transferred: self.bytes_transferred,
            status,
        }
    }

    fn progress(&self, id: TransferId) -> TransferProgress {
        let percentage = if self.file_size == 0 {
            100.0
        } else {
            (self.bytes_transferred as f32 / self.file_size as f32) * 100.0
        };
        TransferProgress {
            transfer_id: id,
            peer_id: self.peer_id.clone(),
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.file_size,
            percentage,
        }
    }
}

struct TableInner {
    active: HashMap<TransferId, TransferRecord>,
    /// Ids that reached a terminal state. Never reused; late frames or
    /// control messages naming one are dropped.
    retired: HashSet<TransferId>,
}

#[derive(Debug)]
pub enum AppendOutcome {
    Progress(TransferProgress),
    UnknownId,
    NotReceiving,
    SequenceGap { expected: u64, got: u64 },
    /// More bytes arrived than the sender declared; the transfer has been
    /// failed and retired.
    Overflow { transfer: Transfer },
}

#[derive(Debug)]
pub enum CompleteOutcome {
    Completed {
        file: ReceivedFile,
        transfer: Transfer,
    },
    ChecksumMismatch {
        transfer: Transfer,
    },
    SizeMismatch {
        transfer: Transfer,
        declared: u64,
        got: u64,
    },
    UnknownId,
    NotReceiving,
}

#[derive(Debug)]
pub enum CancelOutcome {
    /// Sending transfer: the cooperative flag is set; the sender task
    /// finalizes between chunks and notifies the remote peer.
    FlagSet,
    /// Receiving transfer: local state discarded and the transfer retired;
    /// the caller notifies the remote peer.
    Cancelled { transfer: Transfer },
    Unknown,
}

/// Process-wide registry of active transfers, keyed by transfer id.
///
/// Every mutation goes through this table's lock, so concurrent triggers
/// (a remote cancel racing a local cancel racing completion) resolve to
/// exactly one terminal state per transfer.
pub struct TransferTable {
    inner: Mutex<TableInner>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                active: HashMap::new(),
                retired: HashSet::new(),
            }),
        }
    }

    pub async fn register_sending(
        &self,
        id: TransferId,
        peer_id: &str,
        file: &OutboundFile,
    ) -> (Arc<AtomicBool>, Transfer) {
        let cancel = Arc::new(AtomicBool::new(false));
        let record = TransferRecord {
            peer_id: peer_id.to_string(),
            direction: TransferDirection::Sending,
            file_name: file.name.clone(),
            file_size: file.bytes.len() as u64,
            file_type: file.mime_type.clone(),
            bytes_transferred: 0,
            cancel: cancel.clone(),
            accumulator: None,
            expected_seq: 0,
        };
        let snapshot = record.snapshot(id, TransferStatus::Active);
        self.inner.lock().await.active.insert(id, record);
        (cancel, snapshot)
    }

    /// Register an announced incoming transfer. Rejects an id that is
    /// already active or was already retired — ids are never reused.
    pub async fn register_receiving(
        &self,
        id: TransferId,
        peer_id: &str,
        file_name: &str,
        file_size: u64,
        file_type: &str,
    ) -> Result<Transfer, String> {
        let mut inner = self.inner.lock().await;
        if inner.active.contains_key(&id) || inner.retired.contains(&id) {
            return Err(format!("transfer id {} already in use", id));
        }
        let record = TransferRecord {
            peer_id: peer_id.to_string(),
            direction: TransferDirection::Receiving,
            file_name: file_name.to_string(),
            file_size,
            file_type: file_type.to_string(),
            bytes_transferred: 0,
            cancel: Arc::new(AtomicBool::new(false)),
            accumulator: Some(Vec::new()),
            expected_seq: 0,
        };
        let snapshot = record.snapshot(id, TransferStatus::Active);
        inner.active.insert(id, record);
        Ok(snapshot)
    }

    /// Advance a sending transfer's progress after a chunk went out.
    /// Returns `None` if the transfer reached a terminal state concurrently.
    pub async fn record_sent(&self, id: TransferId, bytes: u64) -> Option<TransferProgress> {
        let mut inner = self.inner.lock().await;
        let record = inner.active.get_mut(&id)?;
        record.bytes_transferred = (record.bytes_transferred + bytes).min(record.file_size);
        Some(record.progress(id))
    }

    /// Append a received frame's payload to its transfer's accumulator.
    pub async fn append_received(
        &self,
        id: TransferId,
        sequence: u64,
        payload: &[u8],
    ) -> AppendOutcome {
        let mut inner = self.inner.lock().await;
        let record = match inner.active.get_mut(&id) {
            Some(r) => r,
            None => return AppendOutcome::UnknownId,
        };
        if record.direction != TransferDirection::Receiving {
            return AppendOutcome::NotReceiving;
        }
        if sequence != record.expected_seq {
            return AppendOutcome::SequenceGap {
                expected: record.expected_seq,
                got: sequence,
            };
        }
        let would_be = record.bytes_transferred + payload.len() as u64;
        if would_be > record.file_size {
            let Some(record) = inner.active.remove(&id) else {
                return AppendOutcome::UnknownId;
            };
            record.cancel.store(true, Ordering::Relaxed);
            inner.retired.insert(id);
            return AppendOutcome::Overflow {
                transfer: record.snapshot(id, TransferStatus::Failed),
            };
        }
        record.expected_seq += 1;
        record.bytes_transferred = would_be;
        if let Some(acc) = record.accumulator.as_mut() {
            acc.extend_from_slice(payload);
        }
        AppendOutcome::Progress(record.progress(id))
    }

    /// Close out a receiving transfer on `file-end`, verifying the declared
    /// size and checksum before materializing the file.
    pub async fn complete_received(&self, id: TransferId, checksum: &str) -> CompleteOutcome {
        let mut inner = self.inner.lock().await;
        let record = match inner.active.get(&id) {
            Some(r) => r,
            None => return CompleteOutcome::UnknownId,
        };
        if record.direction != TransferDirection::Receiving {
            return CompleteOutcome::NotReceiving;
        }
        let Some(mut record) = inner.active.remove(&id) else {
            return CompleteOutcome::UnknownId;
        };
        record.cancel.store(true, Ordering::Relaxed);
        inner.retired.insert(id);

        let data = record.accumulator.take().unwrap_or_default();
        if data.len() as u64 != record.file_size {
            let got = data.len() as u64;
            return CompleteOutcome::SizeMismatch {
                declared: record.file_size,
                got,
                transfer: record.snapshot(id, TransferStatus::Failed),
            };
        }
        let digest = hex::encode(Sha256::digest(&data));
        if !digest.eq_ignore_ascii_case(checksum) {
            return CompleteOutcome::ChecksumMismatch {
                transfer: record.snapshot(id, TransferStatus::Failed),
            };
        }
        let transfer = record.snapshot(id, TransferStatus::Completed);
        let file = ReceivedFile {
            transfer_id: id,
            file_name: record.file_name.clone(),
            size: record.file_size,
            file_type: record.file_type.clone(),
            sender: record.peer_id.clone(),
            received_at: Utc::now(),
            downloaded: false,
            data: Bytes::from(data),
        };
        CompleteOutcome::Completed { file, transfer }
    }

    /// Move a transfer to a terminal state exactly once. Returns `None` if
    /// it already reached one.
    pub async fn finish(&self, id: TransferId, status: TransferStatus) -> Option<Transfer> {
        debug_assert!(status != TransferStatus::Active);
        let mut inner = self.inner.lock().await;
        let record = inner.active.remove(&id)?;
        record.cancel.store(true, Ordering::Relaxed);
        inner.retired.insert(id);
        Some(record.snapshot(id, status))
    }

    /// Locally-initiated cancellation.
    pub async fn cancel_local(&self, id: TransferId) -> CancelOutcome {
        let mut inner = self.inner.lock().await;
        let direction = match inner.active.get(&id) {
            Some(r) => r.direction,
            None => return CancelOutcome::Unknown,
        };
        match direction {
            TransferDirection::Sending => {
                if let Some(record) = inner.active.get(&id) {
                    record.cancel.store(true, Ordering::Relaxed);
                }
                CancelOutcome::FlagSet
            }
            TransferDirection::Receiving => {
                let Some(record) = inner.active.remove(&id) else {
                    return CancelOutcome::Unknown;
                };
                record.cancel.store(true, Ordering::Relaxed);
                inner.retired.insert(id);
                CancelOutcome::Cancelled {
                    transfer: record.snapshot(id, TransferStatus::Cancelled),
                }
            }
        }
    }

    /// Remote peer sent `file-cancel`. Applies to either direction: a
    /// receiving transfer drops its accumulator; a sending transfer has its
    /// flag set so the sender task stops without echoing another cancel.
    pub async fn cancel_remote(&self, id: TransferId) -> Option<Transfer> {
        let mut inner = self.inner.lock().await;
        let record = inner.active.remove(&id)?;
        record.cancel.store(true, Ordering::Relaxed);
        inner.retired.insert(id);
        Some(record.snapshot(id, TransferStatus::Cancelled))
    }

    /// Fail every active transfer for one peer (its connection died).
    pub async fn fail_peer(&self, peer_id: &str) -> Vec<Transfer> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<TransferId> = inner
            .active
            .iter()
            .filter(|(_, r)| r.peer_id == peer_id)
            .map(|(id, _)| *id)
            .collect();
        let mut failed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = inner.active.remove(&id) {
                record.cancel.store(true, Ordering::Relaxed);
                inner.retired.insert(id);
                failed.push(record.snapshot(id, TransferStatus::Failed));
            }
        }
        failed
    }

    /// Fail everything and forget retired ids. Used by `cleanup()`.
    pub async fn clear(&self) -> Vec<Transfer> {
        let mut inner = self.inner.lock().await;
        let failed: Vec<Transfer> = inner
            .active
            .drain()
            .map(|(id, record)| {
                record.cancel.store(true, Ordering::Relaxed);
                record.snapshot(id, TransferStatus::Failed)
            })
            .collect();
        inner.retired.clear();
        failed
    }

    pub async fn get(&self, id: TransferId) -> Option<Transfer> {
        let inner = self.inner.lock().await;
        inner
            .active
            .get(&id)
            .map(|r| r.snapshot(id, TransferStatus::Active))
    }

    pub async fn snapshot_all(&self) -> Vec<Transfer> {
        let inner = self.inner.lock().await;
        inner
            .active
            .iter()
            .map(|(id, r)| r.snapshot(*id, TransferStatus::Active))
            .collect()
    }

    pub async fn is_retired(&self, id: TransferId) -> bool {
        self.inner.lock().await.retired.contains(&id)
    }
}

impl Default for TransferTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Per-peer transfer engine
// ============================================================================

/// Runs the transfer protocol over one peer's channel: spawns sender tasks
/// for outgoing files and dispatches inbound control/data frames.
///
/// Inbound messages for one channel must be fed in arrival order (the
/// service drains them through a single pump task per channel).
pub struct TransferEngine {
    peer_id: PeerId,
    channel: Arc<dyn DataChannel>,
    table: Arc<TransferTable>,
    received: Arc<Mutex<Vec<ReceivedFile>>>,
    events: mpsc::Sender<PeerEvent>,
    chunk_size: usize,
    flow: FlowConfig,
}

impl TransferEngine {
    pub fn new(
        peer_id: PeerId,
        channel: Arc<dyn DataChannel>,
        table: Arc<TransferTable>,
        received: Arc<Mutex<Vec<ReceivedFile>>>,
        events: mpsc::Sender<PeerEvent>,
        chunk_size: usize,
        flow: FlowConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_id,
            channel,
            table,
            received,
            events,
            chunk_size,
            flow,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Start sending a file. Fails immediately when the channel is not
    /// open; otherwise registers the transfer, announces it with
    /// `file-start`, and spawns the chunking task.
    pub async fn send_file(self: &Arc<Self>, file: OutboundFile) -> Result<TransferId, String> {
        if !self.channel.is_open() {
            return Err(format!("no open channel to peer {}", self.peer_id));
        }
        let id = Uuid::new_v4();
        let (cancel, snapshot) = self.table.register_sending(id, &self.peer_id, &file).await;

        let start = ControlMessage::FileStart {
            transfer_id: id,
            file_name: file.name.clone(),
            file_size: file.bytes.len() as u64,
            file_type: file.mime_type.clone(),
        };
        if let Err(e) = self.send_control(&start).await {
            if let Some(t) = self.table.finish(id, TransferStatus::Failed).await {
                self.emit(PeerEvent::TransferFailed {
                    transfer: t,
                    error: e.clone(),
                })
                .await;
            }
            return Err(e);
        }
        self.emit(PeerEvent::TransferStarted { transfer: snapshot })
            .await;

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_sender(id, file, cancel).await;
        });
        Ok(id)
    }

    async fn run_sender(self: Arc<Self>, id: TransferId, file: OutboundFile, cancel: Arc<AtomicBool>) {
        let mut hasher = Sha256::new();
        let mut sequence: u64 = 0;

        for chunk in file.bytes.chunks(self.chunk_size) {
            // Cancellation is cooperative: it takes effect between chunks.
            if cancel.load(Ordering::Relaxed) {
                self.finish_cancelled_send(id).await;
                return;
            }
            match self.flow.wait_for_capacity(&*self.channel, &cancel).await {
                Ok(()) => {}
                Err(FlowAbort::Cancelled) => {
                    self.finish_cancelled_send(id).await;
                    return;
                }
                Err(abort) => {
                    self.fail_send(id, abort.to_string()).await;
                    return;
                }
            }
            let frame = encode_frame(&id, sequence, chunk);
            if let Err(e) = self.channel.send_binary(frame).await {
                self.fail_send(id, e).await;
                return;
            }
            hasher.update(chunk);
            sequence += 1;
            if let Some(progress) = self.table.record_sent(id, chunk.len() as u64).await {
                // Progress is advisory; drop it rather than stall the
                // transfer when the event queue is full.
                let _ = self
                    .events
                    .try_send(PeerEvent::TransferProgress { progress });
            }
        }

        if cancel.load(Ordering::Relaxed) {
            self.finish_cancelled_send(id).await;
            return;
        }
        let end = ControlMessage::FileEnd {
            transfer_id: id,
            checksum: hex::encode(hasher.finalize()),
        };
        if let Err(e) = self.send_control(&end).await {
            self.fail_send(id, e).await;
            return;
        }
        if let Some(t) = self.table.finish(id, TransferStatus::Completed).await {
            self.emit(PeerEvent::TransferCompleted { transfer: t }).await;
        }
    }

    async fn finish_cancelled_send(&self, id: TransferId) {
        // `finish` returning None means the remote cancelled first and
        // already retired the id; no echo in that case.
        if let Some(t) = self.table.finish(id, TransferStatus::Cancelled).await {
            let _ = self
                .send_control(&ControlMessage::FileCancel { transfer_id: id })
                .await;
            self.emit(PeerEvent::TransferCancelled { transfer: t }).await;
        }
    }

    async fn fail_send(&self, id: TransferId, error: String) {
        warn!(
            "sending transfer {} to {} failed: {}",
            id, self.peer_id, error
        );
        if let Some(t) = self.table.finish(id, TransferStatus::Failed).await {
            self.emit(PeerEvent::TransferFailed { transfer: t, error })
                .await;
        }
    }

    /// Tell the remote peer a receiving transfer was cancelled locally.
    pub async fn notify_cancel(&self, id: TransferId) {
        let _ = self
            .send_control(&ControlMessage::FileCancel { transfer_id: id })
            .await;
    }

    /// Dispatch one inbound channel message.
    pub async fn handle_message(&self, msg: ChannelMessage) {
        if msg.is_binary {
            self.handle_frame(&msg.data).await;
            return;
        }
        let text = match std::str::from_utf8(&msg.data) {
            Ok(t) => t,
            Err(_) => {
                warn!(
                    "non-UTF8 text frame from peer {} ({} bytes)",
                    self.peer_id,
                    msg.data.len()
                );
                return;
            }
        };
        match serde_json::from_str::<ControlMessage>(text) {
            Ok(control) => self.handle_control(control).await,
            Err(e) => {
                let preview = if text.len() > 200 { &text[..200] } else { text };
                warn!(
                    "unparseable control message from peer {}: {} ({})",
                    self.peer_id, e, preview
                );
            }
        }
    }

    async fn handle_control(&self, control: ControlMessage) {
        match control {
            ControlMessage::FileStart {
                transfer_id,
                file_name,
                file_size,
                file_type,
            } => {
                match self
                    .table
                    .register_receiving(transfer_id, &self.peer_id, &file_name, file_size, &file_type)
                    .await
                {
                    Ok(transfer) => {
                        debug!(
                            "incoming transfer {} from {}: {} ({} bytes)",
                            transfer_id, self.peer_id, file_name, file_size
                        );
                        self.emit(PeerEvent::TransferStarted { transfer }).await;
                    }
                    Err(e) => warn!("rejected file-start from {}: {}", self.peer_id, e),
                }
            }
            ControlMessage::FileEnd {
                transfer_id,
                checksum,
            } => match self.table.complete_received(transfer_id, &checksum).await {
                CompleteOutcome::Completed { file, transfer } => {
                    let event = PeerEvent::FileReceived {
                        transfer_id,
                        peer_id: self.peer_id.clone(),
                        file_name: file.file_name.clone(),
                        size: file.size,
                    };
                    self.received.lock().await.push(file);
                    self.emit(event).await;
                    self.emit(PeerEvent::TransferCompleted { transfer }).await;
                }
                CompleteOutcome::SizeMismatch {
                    transfer,
                    declared,
                    got,
                } => {
                    let error =
                        format!("received {} bytes, sender declared {}", got, declared);
                    warn!("transfer {} from {}: {}", transfer_id, self.peer_id, error);
                    self.emit(PeerEvent::TransferFailed { transfer, error }).await;
                }
                CompleteOutcome::ChecksumMismatch { transfer } => {
                    let error = "file checksum mismatch".to_string();
                    warn!("transfer {} from {}: {}", transfer_id, self.peer_id, error);
                    self.emit(PeerEvent::TransferFailed { transfer, error }).await;
                }
                CompleteOutcome::UnknownId => {
                    debug!(
                        "file-end for unknown or retired transfer {} from {}",
                        transfer_id, self.peer_id
                    );
                }
                CompleteOutcome::NotReceiving => {
                    warn!(
                        "file-end from {} names our sending transfer {}",
                        self.peer_id, transfer_id
                    );
                }
            },
            ControlMessage::FileCancel { transfer_id } => {
                if let Some(transfer) = self.table.cancel_remote(transfer_id).await {
                    debug!("transfer {} cancelled by {}", transfer_id, self.peer_id);
                    self.emit(PeerEvent::TransferCancelled { transfer }).await;
                }
            }
        }
    }

    async fn handle_frame(&self, data: &Bytes) {
        let (transfer_id, sequence, payload) = match decode_frame(data) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("bad data frame from peer {}: {}", self.peer_id, e);
                return;
            }
        };
        match self
            .table
            .append_received(transfer_id, sequence, payload)
            .await
        {
            AppendOutcome::Progress(progress) => {
                let _ = self
                    .events
                    .try_send(PeerEvent::TransferProgress { progress });
            }
            AppendOutcome::UnknownId => {
                debug!(
                    "data frame for unknown or retired transfer {} from {}",
                    transfer_id, self.peer_id
                );
            }
            AppendOutcome::NotReceiving => {
                warn!(
                    "data frame from {} names our sending transfer {}",
                    self.peer_id, transfer_id
                );
            }
            AppendOutcome::SequenceGap { expected, got } => {
                warn!(
                    "out-of-order frame for transfer {} from {}: expected seq {}, got {}",
                    transfer_id, self.peer_id, expected, got
                );
            }
            AppendOutcome::Overflow { transfer } => {
                let error = "sender exceeded declared file size".to_string();
                warn!("transfer {} from {}: {}", transfer_id, self.peer_id, error);
                self.emit(PeerEvent::TransferFailed { transfer, error }).await;
            }
        }
    }

    async fn send_control(&self, msg: &ControlMessage) -> Result<(), String> {
        let json = serde_json::to_string(msg)
            .map_err(|e| format!("failed to serialize control message: {}", e))?;
        self.channel.send_text(json).await
    }

    async fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(bytes: &'static [u8]) -> OutboundFile {
        OutboundFile {
            name: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            bytes: Bytes::from_static(bytes),
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let id = Uuid::new_v4();
        let frame = encode_frame(&id, 7, b"payload bytes");
        assert_eq!(frame.len(), FRAME_HEADER_LEN + 13);

        let (decoded_id, seq, payload) = decode_frame(&frame).unwrap();
        assert_eq!(decoded_id, id);
        assert_eq!(seq, 7);
        assert_eq!(payload, b"payload bytes");
    }

    #[test]
    fn test_frame_too_short_rejected() {
        assert!(decode_frame(&[0u8; 10]).is_err());
        // Exactly a header with no payload is valid.
        let id = Uuid::new_v4();
        let frame = encode_frame(&id, 0, b"");
        let (_, _, payload) = decode_frame(&frame).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_control_message_wire_shape() {
        let id = Uuid::new_v4();
        let msg = ControlMessage::FileStart {
            transfer_id: id,
            file_name: "photo.png".to_string(),
            file_size: 40000,
            file_type: "image/png".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"fileStart\""));
        assert!(json.contains("\"fileName\":\"photo.png\""));
        assert!(json.contains("\"fileSize\":40000"));

        let parsed: ControlMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ControlMessage::FileStart { transfer_id, .. } => assert_eq!(transfer_id, id),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receiving_appends_in_sequence() {
        let table = TransferTable::new();
        let id = Uuid::new_v4();
        table
            .register_receiving(id, "peer-a", "f.bin", 10, "application/octet-stream")
            .await
            .unwrap();

        match table.append_received(id, 0, b"hello").await {
            AppendOutcome::Progress(p) => {
                assert_eq!(p.bytes_transferred, 5);
                assert_eq!(p.total_bytes, 10);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // A gap is dropped without advancing state.
        match table.append_received(id, 2, b"zzzzz").await {
            AppendOutcome::SequenceGap { expected, got } => {
                assert_eq!(expected, 1);
                assert_eq!(got, 2);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        match table.append_received(id, 1, b"world").await {
            AppendOutcome::Progress(p) => assert_eq!(p.bytes_transferred, 10),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_overflow_fails_transfer() {
        let table = TransferTable::new();
        let id = Uuid::new_v4();
        table
            .register_receiving(id, "peer-a", "f.bin", 4, "application/octet-stream")
            .await
            .unwrap();

        match table.append_received(id, 0, b"too many bytes").await {
            AppendOutcome::Overflow { transfer } => {
                assert_eq!(transfer.status, TransferStatus::Failed);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(table.is_retired(id).await);
        assert!(table.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_complete_verifies_checksum_and_size() {
        let table = TransferTable::new();
        let id = Uuid::new_v4();
        table
            .register_receiving(id, "peer-a", "f.bin", 5, "application/octet-stream")
            .await
            .unwrap();
        table.append_received(id, 0, b"hello").await;

        let good = hex::encode(Sha256::digest(b"hello"));
        match table.complete_received(id, &good).await {
            CompleteOutcome::Completed { file, transfer } => {
                assert_eq!(&file.data[..], b"hello");
                assert_eq!(file.size, 5);
                assert!(!file.downloaded);
                assert_eq!(transfer.status, TransferStatus::Completed);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // Retired ids never complete twice.
        match table.complete_received(id, &good).await {
            CompleteOutcome::UnknownId => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails() {
        let table = TransferTable::new();
        let id = Uuid::new_v4();
        table
            .register_receiving(id, "peer-a", "f.bin", 5, "application/octet-stream")
            .await
            .unwrap();
        table.append_received(id, 0, b"hello").await;

        match table.complete_received(id, "deadbeef").await {
            CompleteOutcome::ChecksumMismatch { transfer } => {
                assert_eq!(transfer.status, TransferStatus::Failed);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_transfer_is_size_mismatch() {
        let table = TransferTable::new();
        let id = Uuid::new_v4();
        table
            .register_receiving(id, "peer-a", "f.bin", 100, "application/octet-stream")
            .await
            .unwrap();
        table.append_received(id, 0, b"only this").await;

        let checksum = hex::encode(Sha256::digest(b"only this"));
        match table.complete_received(id, &checksum).await {
            CompleteOutcome::SizeMismatch { declared, got, .. } => {
                assert_eq!(declared, 100);
                assert_eq!(got, 9);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transfer_id_never_reused() {
        let table = TransferTable::new();
        let id = Uuid::new_v4();
        table
            .register_receiving(id, "peer-a", "f.bin", 1, "text/plain")
            .await
            .unwrap();
        table.cancel_remote(id).await.unwrap();

        assert!(table
            .register_receiving(id, "peer-a", "f.bin", 1, "text/plain")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_finish_is_exactly_once() {
        let table = TransferTable::new();
        let id = Uuid::new_v4();
        let (_, _) = table.register_sending(id, "peer-a", &outbound(b"abc")).await;

        assert!(table.finish(id, TransferStatus::Cancelled).await.is_some());
        assert!(table.finish(id, TransferStatus::Failed).await.is_none());
        assert!(table.finish(id, TransferStatus::Completed).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_local_sets_flag_on_sending() {
        let table = TransferTable::new();
        let id = Uuid::new_v4();
        let (cancel, _) = table.register_sending(id, "peer-a", &outbound(b"abc")).await;

        match table.cancel_local(id).await {
            CancelOutcome::FlagSet => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(cancel.load(Ordering::Relaxed));
        // The sender task performs the terminal transition.
        assert!(table.get(id).await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_local_retires_receiving() {
        let table = TransferTable::new();
        let id = Uuid::new_v4();
        table
            .register_receiving(id, "peer-a", "f.bin", 100, "text/plain")
            .await
            .unwrap();
        table.append_received(id, 0, b"some").await;

        match table.cancel_local(id).await {
            CancelOutcome::Cancelled { transfer } => {
                assert_eq!(transfer.status, TransferStatus::Cancelled);
                assert_eq!(transfer.peer_id, "peer-a");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        // Accumulator is gone with the record; late frames are ignored.
        match table.append_received(id, 1, b"late").await {
            AppendOutcome::UnknownId => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_cancel_beats_local_finish() {
        let table = TransferTable::new();
        let id = Uuid::new_v4();
        let (cancel, _) = table.register_sending(id, "peer-a", &outbound(b"abc")).await;

        let transfer = table.cancel_remote(id).await.unwrap();
        assert_eq!(transfer.status, TransferStatus::Cancelled);
        assert!(cancel.load(Ordering::Relaxed));

        // The sender task's own finalization observes the retired id and
        // does not produce a second terminal state.
        assert!(table.finish(id, TransferStatus::Cancelled).await.is_none());
    }

    #[tokio::test]
    async fn test_fail_peer_scopes_to_one_peer() {
        let table = TransferTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        table.register_sending(a, "peer-a", &outbound(b"abc")).await;
        table
            .register_receiving(b, "peer-b", "f.bin", 3, "text/plain")
            .await
            .unwrap();

        let failed = table.fail_peer("peer-a").await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, a);
        assert!(table.get(b).await.is_some());
    }

    #[tokio::test]
    async fn test_clear_retires_everything() {
        let table = TransferTable::new();
        let id = Uuid::new_v4();
        table.register_sending(id, "peer-a", &outbound(b"abc")).await;

        let failed = table.clear().await;
        assert_eq!(failed.len(), 1);
        assert!(table.snapshot_all().await.is_empty());

        // A second clear finds nothing.
        assert!(table.clear().await.is_empty());
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_bounded() {
        let table = TransferTable::new();
        let id = Uuid::new_v4();
        table
            .register_receiving(id, "peer-a", "f.bin", 12, "text/plain")
            .await
            .unwrap();

        let mut last = 0u64;
        for (seq, part) in [&b"aaaa"[..], &b"bbbb"[..], &b"cccc"[..]].iter().enumerate() {
            match table.append_received(id, seq as u64, part).await {
                AppendOutcome::Progress(p) => {
                    assert!(p.bytes_transferred >= last);
                    assert!(p.bytes_transferred <= p.total_bytes);
                    last = p.bytes_transferred;
                }
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        assert_eq!(last, 12);
    }
}
