//! The engine service.
//!
//! One spawned task owns all connection bookkeeping and drains an internal
//! command queue: public API calls and transport callbacks both become
//! commands, so negotiation handling is serialized while transfers run in
//! their own tasks. Events flow out on a separate queue for the embedding
//! application to drain.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::channel::{ChannelMessage, DataChannel, RtcChannel};
use crate::config::{EngineConfig, DATA_CHANNEL_LABEL};
use crate::connection::{ConnectionState, PeerRegistry};
use crate::events::PeerEvent;
use crate::reconnect::{ReconnectSupervisor, RetryDecision};
use crate::signaling::{PeerId, Signal};
use crate::transfer::{
    CancelOutcome, OutboundFile, ReceivedFile, Transfer, TransferEngine, TransferId, TransferTable,
};

type InboundQueue = mpsc::UnboundedReceiver<ChannelMessage>;
type PendingInbound = Arc<Mutex<Option<InboundQueue>>>;

enum Command {
    ConnectToPeer {
        peer_id: PeerId,
    },
    IncomingOffer {
        peer_id: PeerId,
        sdp: String,
    },
    IncomingAnswer {
        peer_id: PeerId,
        sdp: String,
    },
    IncomingCandidate {
        peer_id: PeerId,
        candidate: String,
    },
    LocalCandidate {
        peer_id: PeerId,
        epoch: u64,
        candidate: String,
    },
    PeerStateChanged {
        peer_id: PeerId,
        epoch: u64,
        state: RTCPeerConnectionState,
    },
    ChannelOpen {
        peer_id: PeerId,
        epoch: u64,
        channel: Arc<dyn DataChannel>,
        inbound: InboundQueue,
    },
    ChannelClosed {
        peer_id: PeerId,
        epoch: u64,
    },
    DisconnectTimeout {
        peer_id: PeerId,
        epoch: u64,
    },
}

/// Peer-connection and chunked-transfer engine for one room session.
///
/// Owns every peer connection, channel, transfer, and received file until
/// [`RoomDropService::cleanup`] is called on leaving the room.
pub struct RoomDropService {
    cmd_tx: mpsc::Sender<Command>,
    event_rx: Arc<Mutex<mpsc::Receiver<PeerEvent>>>,
    core: Arc<ServiceCore>,
}

impl RoomDropService {
    /// Spawn the engine task. Must be called within a tokio runtime.
    pub fn new(config: EngineConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);

        let core = Arc::new(ServiceCore {
            supervisor: ReconnectSupervisor::new(config.retry.clone()),
            config,
            cmd_tx: cmd_tx.clone(),
            event_tx,
            registry: Mutex::new(PeerRegistry::new()),
            engines: Mutex::new(HashMap::new()),
            transfers: Arc::new(TransferTable::new()),
            received: Arc::new(Mutex::new(Vec::new())),
        });

        let runner = core.clone();
        tokio::spawn(async move {
            runner.run(cmd_rx).await;
        });

        Self {
            cmd_tx,
            event_rx: Arc::new(Mutex::new(event_rx)),
            core,
        }
    }

    /// Start negotiating a direct connection to a peer. No-op when a
    /// connection is already connecting or connected.
    pub async fn connect_to_peer(&self, peer_id: &str) -> Result<(), String> {
        self.send_cmd(Command::ConnectToPeer {
            peer_id: peer_id.to_string(),
        })
        .await
    }

    /// Feed a relay-delivered signal from `sender` into the engine.
    pub async fn handle_signal(&self, signal: Signal, sender: &str) -> Result<(), String> {
        let peer_id = sender.to_string();
        let cmd = match signal {
            Signal::Offer { sdp } => Command::IncomingOffer { peer_id, sdp },
            Signal::Answer { sdp } => Command::IncomingAnswer { peer_id, sdp },
            Signal::IceCandidate { candidate } => Command::IncomingCandidate { peer_id, candidate },
        };
        self.send_cmd(cmd).await
    }

    /// Next engine event; `None` once the engine task has stopped.
    pub async fn next_event(&self) -> Option<PeerEvent> {
        self.event_rx.lock().await.recv().await
    }

    /// Send a file to a peer. Fails immediately when no open channel
    /// exists; otherwise returns the new transfer's id.
    pub async fn send_file(&self, file: OutboundFile, target: &str) -> Result<TransferId, String> {
        let engine = self.core.engines.lock().await.get(target).cloned();
        match engine {
            Some(engine) => engine.send_file(file).await,
            None => {
                warn!("send_file: no open channel to peer {}", target);
                Err(format!("no open channel to peer {}", target))
            }
        }
    }

    /// Cancel a transfer in either direction. Sending transfers stop
    /// cooperatively between chunks; receiving transfers drop their
    /// accumulated state immediately and notify the sender.
    pub async fn cancel_transfer(&self, id: TransferId) -> Result<(), String> {
        match self.core.transfers.cancel_local(id).await {
            CancelOutcome::FlagSet => Ok(()),
            CancelOutcome::Cancelled { transfer } => {
                let engine = self.core.engines.lock().await.get(&transfer.peer_id).cloned();
                if let Some(engine) = engine {
                    engine.notify_cancel(id).await;
                }
                self.core
                    .emit(PeerEvent::TransferCancelled { transfer })
                    .await;
                Ok(())
            }
            CancelOutcome::Unknown => Err(format!("unknown transfer id {}", id)),
        }
    }

    /// Close one peer's connection and release everything owned for it.
    pub async fn teardown_peer(&self, peer_id: &str) {
        self.core.teardown(peer_id).await;
    }

    /// Close all peer connections and clear all engine-owned state.
    /// Idempotent; called on leaving a room.
    pub async fn cleanup(&self) {
        self.core.cleanup().await;
    }

    // ------------------------------------------------------------------
    // Observable state
    // ------------------------------------------------------------------

    pub async fn active_transfers(&self) -> Vec<Transfer> {
        self.core.transfers.snapshot_all().await
    }

    pub async fn open_channels(&self) -> Vec<PeerId> {
        self.core.engines.lock().await.keys().cloned().collect()
    }

    pub async fn connection_states(&self) -> HashMap<PeerId, ConnectionState> {
        self.core.registry.lock().await.states()
    }

    pub async fn received_files(&self) -> Vec<ReceivedFile> {
        self.core.received.lock().await.clone()
    }

    /// Flag a received file as flushed to the local filesystem.
    pub async fn mark_downloaded(&self, id: TransferId) -> bool {
        let mut files = self.core.received.lock().await;
        match files.iter_mut().find(|f| f.transfer_id == id) {
            Some(file) => {
                file.downloaded = true;
                true
            }
            None => false,
        }
    }

    pub async fn clear_received(&self) {
        self.core.received.lock().await.clear();
    }

    async fn send_cmd(&self, cmd: Command) -> Result<(), String> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| "engine task stopped".to_string())
    }
}

// ============================================================================
// Service core
// ============================================================================

struct ServiceCore {
    config: EngineConfig,
    cmd_tx: mpsc::Sender<Command>,
    event_tx: mpsc::Sender<PeerEvent>,
    registry: Mutex<PeerRegistry>,
    engines: Mutex<HashMap<PeerId, Arc<TransferEngine>>>,
    transfers: Arc<TransferTable>,
    received: Arc<Mutex<Vec<ReceivedFile>>>,
    supervisor: ReconnectSupervisor,
}

impl ServiceCore {
    async fn run(self: Arc<Self>, mut cmd_rx: mpsc::Receiver<Command>) {
        debug!("engine service task started");
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::ConnectToPeer { peer_id } => self.handle_connect(peer_id).await,
                Command::IncomingOffer { peer_id, sdp } => self.handle_offer(peer_id, sdp).await,
                Command::IncomingAnswer { peer_id, sdp } => self.handle_answer(peer_id, sdp).await,
                Command::IncomingCandidate { peer_id, candidate } => {
                    self.handle_candidate(peer_id, candidate).await
                }
                Command::LocalCandidate {
                    peer_id,
                    epoch,
                    candidate,
                } => {
                    let current = self.registry.lock().await.epoch_matches(&peer_id, epoch);
                    if current {
                        self.emit(PeerEvent::SignalOut {
                            target: peer_id,
                            signal: Signal::IceCandidate { candidate },
                        })
                        .await;
                    }
                }
                Command::PeerStateChanged {
                    peer_id,
                    epoch,
                    state,
                } => self.handle_peer_state(peer_id, epoch, state).await,
                Command::ChannelOpen {
                    peer_id,
                    epoch,
                    channel,
                    inbound,
                } => self.handle_channel_open(peer_id, epoch, channel, inbound).await,
                Command::ChannelClosed { peer_id, epoch } => {
                    self.handle_channel_closed(peer_id, epoch).await
                }
                Command::DisconnectTimeout { peer_id, epoch } => {
                    self.handle_disconnect_timeout(peer_id, epoch).await
                }
            }
        }
        debug!("engine service task stopped");
    }

    // ------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------

    async fn handle_connect(&self, peer_id: PeerId) {
        if self.registry.lock().await.has_live(&peer_id) {
            debug!("connect_to_peer: connection to {} already underway", peer_id);
            return;
        }
        info!("connecting to peer {}", peer_id);

        let rtc = match self.new_peer_connection().await {
            Ok(rtc) => rtc,
            Err(e) => {
                self.fail_peer(&peer_id, &e).await;
                return;
            }
        };
        let epoch = self
            .registry
            .lock()
            .await
            .register(peer_id.clone(), rtc.clone());
        self.install_rtc_callbacks(&peer_id, epoch, &rtc);
        self.emit(PeerEvent::ConnectionStateChanged {
            peer_id: peer_id.clone(),
            state: ConnectionState::Connecting,
        })
        .await;

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = match rtc.create_data_channel(DATA_CHANNEL_LABEL, Some(init)).await {
            Ok(dc) => dc,
            Err(e) => {
                self.fail_peer(&peer_id, &format!("failed to create data channel: {}", e))
                    .await;
                return;
            }
        };
        Self::install_channel_callbacks(&self.cmd_tx, &peer_id, epoch, &dc);

        let offer = match rtc.create_offer(None).await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail_peer(&peer_id, &format!("failed to create offer: {}", e))
                    .await;
                return;
            }
        };
        if let Err(e) = rtc.set_local_description(offer).await {
            self.fail_peer(&peer_id, &format!("failed to set local offer: {}", e))
                .await;
            return;
        }
        let local = match rtc.local_description().await {
            Some(local) => local,
            None => {
                self.fail_peer(&peer_id, "local description missing after offer")
                    .await;
                return;
            }
        };
        match serde_json::to_string(&local) {
            Ok(sdp) => {
                self.emit(PeerEvent::SignalOut {
                    target: peer_id,
                    signal: Signal::Offer { sdp },
                })
                .await;
            }
            Err(e) => {
                self.fail_peer(&peer_id, &format!("failed to serialize offer: {}", e))
                    .await;
            }
        }
    }

    async fn handle_offer(&self, peer_id: PeerId, sdp: String) {
        let offer = match serde_json::from_str::<RTCSessionDescription>(&sdp) {
            Ok(offer) => offer,
            Err(e) => {
                error!("malformed offer from {}: {}", peer_id, e);
                return;
            }
        };

        // Simultaneous-offer race: an existing connection wins and the
        // later offer is answered against it instead of spawning a
        // duplicate.
        let existing = self.registry.lock().await.live_rtc(&peer_id);
        if let Some((rtc, _)) = existing {
            debug!(
                "offer from {} races an existing connection; answering on it",
                peer_id
            );
            if let Err(e) = self.apply_offer(&peer_id, &rtc, offer).await {
                self.fail_peer(&peer_id, &e).await;
            }
            return;
        }

        info!("incoming offer from peer {}", peer_id);
        let rtc = match self.new_peer_connection().await {
            Ok(rtc) => rtc,
            Err(e) => {
                self.fail_peer(&peer_id, &e).await;
                return;
            }
        };
        let epoch = self
            .registry
            .lock()
            .await
            .register(peer_id.clone(), rtc.clone());
        self.install_rtc_callbacks(&peer_id, epoch, &rtc);
        self.emit(PeerEvent::ConnectionStateChanged {
            peer_id: peer_id.clone(),
            state: ConnectionState::Connecting,
        })
        .await;

        if let Err(e) = self.apply_offer(&peer_id, &rtc, offer).await {
            self.fail_peer(&peer_id, &e).await;
        }
    }

    /// Apply a remote offer, flush queued candidates, and answer.
    async fn apply_offer(
        &self,
        peer_id: &str,
        rtc: &Arc<RTCPeerConnection>,
        offer: RTCSessionDescription,
    ) -> Result<(), String> {
        rtc.set_remote_description(offer)
            .await
            .map_err(|e| format!("failed to set remote offer: {}", e))?;
        let queued = self.registry.lock().await.mark_remote_description(peer_id);
        for candidate in queued {
            self.apply_candidate(peer_id, rtc, &candidate).await;
        }

        let answer = rtc
            .create_answer(None)
            .await
            .map_err(|e| format!("failed to create answer: {}", e))?;
        rtc.set_local_description(answer)
            .await
            .map_err(|e| format!("failed to set local answer: {}", e))?;
        let local = rtc
            .local_description()
            .await
            .ok_or_else(|| "local description missing after answer".to_string())?;
        let sdp = serde_json::to_string(&local)
            .map_err(|e| format!("failed to serialize answer: {}", e))?;
        self.emit(PeerEvent::SignalOut {
            target: peer_id.to_string(),
            signal: Signal::Answer { sdp },
        })
        .await;
        Ok(())
    }

    async fn handle_answer(&self, peer_id: PeerId, sdp: String) {
        let rtc = match self.registry.lock().await.live_rtc(&peer_id) {
            Some((rtc, _)) => rtc,
            None => {
                warn!("answer from {} without a matching connection", peer_id);
                return;
            }
        };
        let answer = match serde_json::from_str::<RTCSessionDescription>(&sdp) {
            Ok(answer) => answer,
            Err(e) => {
                self.fail_peer(&peer_id, &format!("malformed answer: {}", e))
                    .await;
                return;
            }
        };
        if let Err(e) = rtc.set_remote_description(answer).await {
            self.fail_peer(&peer_id, &format!("failed to set remote answer: {}", e))
                .await;
            return;
        }
        let queued = self.registry.lock().await.mark_remote_description(&peer_id);
        for candidate in queued {
            self.apply_candidate(&peer_id, &rtc, &candidate).await;
        }
    }

    async fn handle_candidate(&self, peer_id: PeerId, candidate: String) {
        let rtc = {
            let mut reg = self.registry.lock().await;
            if !(reg.has_live(&peer_id) && reg.remote_description_set(&peer_id)) {
                debug!(
                    "queueing ICE candidate from {} until a remote description is set",
                    peer_id
                );
                reg.queue_candidate(&peer_id, candidate);
                return;
            }
            match reg.live_rtc(&peer_id) {
                Some((rtc, _)) => rtc,
                None => return,
            }
        };
        self.apply_candidate(&peer_id, &rtc, &candidate).await;
    }

    async fn apply_candidate(&self, peer_id: &str, rtc: &Arc<RTCPeerConnection>, candidate: &str) {
        let init = match serde_json::from_str::<RTCIceCandidateInit>(candidate) {
            Ok(init) => init,
            Err(e) => {
                error!("malformed ICE candidate from {}: {}", peer_id, e);
                return;
            }
        };
        if let Err(e) = rtc.add_ice_candidate(init).await {
            error!("failed to add ICE candidate from {}: {}", peer_id, e);
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    async fn handle_peer_state(&self, peer_id: PeerId, epoch: u64, state: RTCPeerConnectionState) {
        if !self.registry.lock().await.epoch_matches(&peer_id, epoch) {
            return;
        }
        let state = match ConnectionState::from_rtc(state) {
            Some(state) => state,
            None => return,
        };
        match state {
            ConnectionState::Connected => {
                let changed = self
                    .registry
                    .lock()
                    .await
                    .set_state(&peer_id, ConnectionState::Connected)
                    .is_some();
                if changed {
                    info!("peer connection established with {}", peer_id);
                    self.supervisor.on_connected(&peer_id).await;
                    self.emit(PeerEvent::ConnectionStateChanged {
                        peer_id,
                        state: ConnectionState::Connected,
                    })
                    .await;
                }
            }
            ConnectionState::Disconnected => {
                let changed = self
                    .registry
                    .lock()
                    .await
                    .set_state(&peer_id, ConnectionState::Disconnected)
                    .is_some();
                if changed {
                    warn!(
                        "peer {} disconnected; waiting {:?} for recovery",
                        peer_id, self.config.disconnect_grace
                    );
                    self.emit(PeerEvent::ConnectionStateChanged {
                        peer_id: peer_id.clone(),
                        state: ConnectionState::Disconnected,
                    })
                    .await;
                    let cmd_tx = self.cmd_tx.clone();
                    let grace = self.config.disconnect_grace;
                    tokio::spawn(async move {
                        sleep(grace).await;
                        let _ = cmd_tx
                            .send(Command::DisconnectTimeout { peer_id, epoch })
                            .await;
                    });
                }
            }
            ConnectionState::Failed => {
                self.fail_peer(&peer_id, "transport reported failure").await;
            }
            ConnectionState::Closed => {
                self.fail_peer(&peer_id, "transport closed unexpectedly")
                    .await;
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    async fn handle_disconnect_timeout(&self, peer_id: PeerId, epoch: u64) {
        let still_disconnected = {
            let reg = self.registry.lock().await;
            reg.epoch_matches(&peer_id, epoch)
                && reg.state(&peer_id) == Some(ConnectionState::Disconnected)
        };
        if still_disconnected {
            self.fail_peer(&peer_id, "disconnected beyond grace window")
                .await;
        }
    }

    /// Tear down a failed connection, fail its transfers, and consult the
    /// reconnection policy.
    async fn fail_peer(&self, peer_id: &str, error: &str) {
        error!("connection to {} failed: {}", peer_id, error);

        // Clean slate before any retry: close the transport and drop the
        // channel so negotiation starts fresh.
        let transport = self.registry.lock().await.mark_failed(peer_id);
        if let Some((rtc, channel)) = transport {
            if let Some(channel) = channel {
                channel.close().await;
            }
            if let Some(rtc) = rtc {
                let _ = rtc.close().await;
            }
        }
        self.engines.lock().await.remove(peer_id);
        for transfer in self.transfers.fail_peer(peer_id).await {
            self.emit(PeerEvent::TransferFailed {
                transfer,
                error: format!("peer connection failed: {}", error),
            })
            .await;
        }
        self.emit(PeerEvent::ConnectionStateChanged {
            peer_id: peer_id.to_string(),
            state: ConnectionState::Failed,
        })
        .await;

        match self.supervisor.on_failure(peer_id, error).await {
            RetryDecision::Retry { attempt, delay } => {
                info!(
                    "retrying connection to {} in {:?} (attempt {}/{})",
                    peer_id,
                    delay,
                    attempt,
                    self.supervisor.config().max_attempts
                );
                self.emit(PeerEvent::PeerRetrying {
                    peer_id: peer_id.to_string(),
                    attempt,
                    max_attempts: self.supervisor.config().max_attempts,
                    next_retry_ms: delay.as_millis() as u64,
                })
                .await;
                let cmd_tx = self.cmd_tx.clone();
                let peer_id = peer_id.to_string();
                tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = cmd_tx.send(Command::ConnectToPeer { peer_id }).await;
                });
            }
            RetryDecision::GiveUp {
                attempts,
                last_error,
            } => {
                self.emit(PeerEvent::PeerUnreachable {
                    peer_id: peer_id.to_string(),
                    attempts,
                    last_error,
                })
                .await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    async fn handle_channel_open(
        &self,
        peer_id: PeerId,
        epoch: u64,
        channel: Arc<dyn DataChannel>,
        inbound: InboundQueue,
    ) {
        let attached = self
            .registry
            .lock()
            .await
            .attach_channel(&peer_id, epoch, channel.clone());
        if !attached {
            debug!("discarding channel for a stale connection to {}", peer_id);
            channel.close().await;
            return;
        }

        let engine = TransferEngine::new(
            peer_id.clone(),
            channel,
            self.transfers.clone(),
            self.received.clone(),
            self.event_tx.clone(),
            self.config.chunk_size,
            self.config.flow.clone(),
        );
        self.engines
            .lock()
            .await
            .insert(peer_id.clone(), engine.clone());

        // One pump per channel keeps inbound handling serialized in
        // arrival order, which the frame sequencing depends on.
        tokio::spawn(async move {
            let mut inbound = inbound;
            while let Some(msg) = inbound.recv().await {
                engine.handle_message(msg).await;
            }
        });

        info!("data channel open with peer {}", peer_id);
        self.emit(PeerEvent::ChannelOpened { peer_id }).await;
    }

    async fn handle_channel_closed(&self, peer_id: PeerId, epoch: u64) {
        let detached = self
            .registry
            .lock()
            .await
            .detach_channel(&peer_id, epoch)
            .is_some();
        if !detached {
            return;
        }
        self.engines.lock().await.remove(&peer_id);
        for transfer in self.transfers.fail_peer(&peer_id).await {
            self.emit(PeerEvent::TransferFailed {
                transfer,
                error: "data channel closed".to_string(),
            })
            .await;
        }
        info!("data channel closed with peer {}", peer_id);
        self.emit(PeerEvent::ChannelClosed { peer_id }).await;
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    async fn teardown(&self, peer_id: &str) {
        let entry = self.registry.lock().await.remove(peer_id);
        self.engines.lock().await.remove(peer_id);
        let Some(entry) = entry else {
            return;
        };
        info!("tearing down connection to {}", peer_id);
        if let Some(channel) = entry.channel {
            channel.close().await;
        }
        if let Some(rtc) = entry.rtc {
            let _ = rtc.close().await;
        }
        for transfer in self.transfers.fail_peer(peer_id).await {
            self.emit(PeerEvent::TransferFailed {
                transfer,
                error: "peer connection closed".to_string(),
            })
            .await;
        }
        self.supervisor.forget(peer_id).await;
        self.emit(PeerEvent::ConnectionStateChanged {
            peer_id: peer_id.to_string(),
            state: ConnectionState::Closed,
        })
        .await;
    }

    async fn cleanup(&self) {
        let entries = self.registry.lock().await.clear();
        self.engines.lock().await.clear();
        join_all(entries.into_iter().map(|entry| async move {
            if let Some(channel) = entry.channel {
                channel.close().await;
            }
            if let Some(rtc) = entry.rtc {
                let _ = rtc.close().await;
            }
        }))
        .await;
        for transfer in self.transfers.clear().await {
            self.emit(PeerEvent::TransferFailed {
                transfer,
                error: "engine cleanup".to_string(),
            })
            .await;
        }
        self.received.lock().await.clear();
        self.supervisor.clear().await;
    }

    // ------------------------------------------------------------------
    // Transport wiring
    // ------------------------------------------------------------------

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, String> {
        let api = APIBuilder::new().build();
        let rtc = api
            .new_peer_connection(self.config.rtc_configuration())
            .await
            .map_err(|e| format!("failed to create peer connection: {}", e))?;
        Ok(Arc::new(rtc))
    }

    fn install_rtc_callbacks(&self, peer_id: &str, epoch: u64, rtc: &Arc<RTCPeerConnection>) {
        let cmd_tx = self.cmd_tx.clone();
        let pid = peer_id.to_string();
        rtc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let cmd_tx = cmd_tx.clone();
            let peer_id = pid.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete for {}", peer_id);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        if let Ok(candidate) = serde_json::to_string(&init) {
                            let _ = cmd_tx
                                .send(Command::LocalCandidate {
                                    peer_id,
                                    epoch,
                                    candidate,
                                })
                                .await;
                        }
                    }
                    Err(e) => warn!("failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let cmd_tx = self.cmd_tx.clone();
        let pid = peer_id.to_string();
        rtc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let cmd_tx = cmd_tx.clone();
            let peer_id = pid.clone();
            Box::pin(async move {
                let _ = cmd_tx
                    .send(Command::PeerStateChanged {
                        peer_id,
                        epoch,
                        state,
                    })
                    .await;
            })
        }));

        // Answering side: the remote peer created the channel. Wire it
        // immediately in the callback so no early message is missed.
        let cmd_tx = self.cmd_tx.clone();
        let pid = peer_id.to_string();
        rtc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let cmd_tx = cmd_tx.clone();
            let peer_id = pid.clone();
            Box::pin(async move {
                let pending = Self::install_channel_callbacks(&cmd_tx, &peer_id, epoch, &dc);
                // The channel may already be open by the time callbacks
                // are wired; the pending slot makes the handoff happen
                // exactly once either way.
                if dc.ready_state() == RTCDataChannelState::Open {
                    if let Some(inbound) = pending.lock().await.take() {
                        let channel: Arc<dyn DataChannel> = Arc::new(RtcChannel::new(dc.clone()));
                        let _ = cmd_tx
                            .send(Command::ChannelOpen {
                                peer_id,
                                epoch,
                                channel,
                                inbound,
                            })
                            .await;
                    }
                }
            })
        }));
    }

    /// Wire a data channel's callbacks: inbound messages feed an ordered
    /// queue that is handed to the transfer engine once the channel opens.
    fn install_channel_callbacks(
        cmd_tx: &mpsc::Sender<Command>,
        peer_id: &str,
        epoch: u64,
        dc: &Arc<RTCDataChannel>,
    ) -> PendingInbound {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let pending: PendingInbound = Arc::new(Mutex::new(Some(in_rx)));

        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = in_tx.send(ChannelMessage {
                is_binary: !msg.is_string,
                data: msg.data,
            });
            Box::pin(async {})
        }));

        let open_tx = cmd_tx.clone();
        let pid = peer_id.to_string();
        let slot = pending.clone();
        let weak = Arc::downgrade(dc);
        dc.on_open(Box::new(move || {
            let cmd_tx = open_tx.clone();
            let peer_id = pid.clone();
            let slot = slot.clone();
            let weak = weak.clone();
            Box::pin(async move {
                let inbound = slot.lock().await.take();
                if let (Some(inbound), Some(dc)) = (inbound, weak.upgrade()) {
                    let channel: Arc<dyn DataChannel> = Arc::new(RtcChannel::new(dc));
                    let _ = cmd_tx
                        .send(Command::ChannelOpen {
                            peer_id,
                            epoch,
                            channel,
                            inbound,
                        })
                        .await;
                }
            })
        }));

        let close_tx = cmd_tx.clone();
        let pid = peer_id.to_string();
        dc.on_close(Box::new(move || {
            let cmd_tx = close_tx.clone();
            let peer_id = pid.clone();
            Box::pin(async move {
                let _ = cmd_tx.send(Command::ChannelClosed { peer_id, epoch }).await;
            })
        }));

        pending
    }

    async fn emit(&self, event: PeerEvent) {
        let _ = self.event_tx.send(event).await;
    }
}
