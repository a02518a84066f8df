//! Peer connection registry.
//!
//! One entry per remote peer, owned exclusively by the service. The registry
//! is plain bookkeeping — the negotiation state machine, the per-peer ICE
//! candidate queue, and the single-channel slot — so it can be exercised
//! without a network. The service drives the actual WebRTC objects against
//! it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::channel::DataChannel;
use crate::signaling::PeerId;

/// Negotiation/connectivity state of one peer connection.
///
/// `New → Connecting → Connected`; `Connecting|Connected → Failed`;
/// `Connected → Disconnected` is transient and escalates to `Failed` after a
/// grace window; any state moves to `Closed` on explicit teardown. `Failed`
/// and `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    /// Map the transport's connection state onto ours.
    pub fn from_rtc(state: RTCPeerConnectionState) -> Option<Self> {
        match state {
            RTCPeerConnectionState::New => Some(ConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
            RTCPeerConnectionState::Unspecified => None,
        }
    }
}

/// Bookkeeping for one peer connection.
pub struct PeerEntry {
    pub peer_id: PeerId,
    /// Generation counter; callbacks and timers from a torn-down connection
    /// carry a stale epoch and are ignored.
    pub epoch: u64,
    pub state: ConnectionState,
    pub created_at: Instant,
    /// Set once a remote description (offer or answer) has been applied;
    /// candidates arriving before that are queued.
    pub remote_description_set: bool,
    pub rtc: Option<Arc<RTCPeerConnection>>,
    pub channel: Option<Arc<dyn DataChannel>>,
}

/// Owned map of PeerId to connection bookkeeping plus the per-peer ICE
/// candidate queues. Candidate queues are keyed independently of entries so
/// a candidate racing ahead of its offer is not lost.
pub struct PeerRegistry {
    entries: HashMap<PeerId, PeerEntry>,
    candidate_queues: HashMap<PeerId, Vec<String>>,
    next_epoch: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            candidate_queues: HashMap::new(),
            next_epoch: 0,
        }
    }

    /// True if a non-terminal entry exists for this peer. `connect_to_peer`
    /// is a no-op in that case, and an incoming offer is answered against
    /// the existing connection instead of spawning a duplicate.
    pub fn has_live(&self, peer_id: &str) -> bool {
        self.entries
            .get(peer_id)
            .map(|e| !e.state.is_terminal())
            .unwrap_or(false)
    }

    /// Register a fresh connection in `Connecting` state, replacing any
    /// terminal leftover for the same peer. Returns the new entry's epoch.
    pub fn register(&mut self, peer_id: PeerId, rtc: Arc<RTCPeerConnection>) -> u64 {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        if let Some(old) = self.entries.insert(
            peer_id.clone(),
            PeerEntry {
                peer_id,
                epoch,
                state: ConnectionState::Connecting,
                created_at: Instant::now(),
                remote_description_set: false,
                rtc: Some(rtc),
                channel: None,
            },
        ) {
            debug!(
                "replaced {:?} connection entry for {} (epoch {} -> {})",
                old.state, old.peer_id, old.epoch, epoch
            );
        }
        epoch
    }

    pub fn entry(&self, peer_id: &str) -> Option<&PeerEntry> {
        self.entries.get(peer_id)
    }

    pub fn epoch_matches(&self, peer_id: &str, epoch: u64) -> bool {
        self.entries
            .get(peer_id)
            .map(|e| e.epoch == epoch)
            .unwrap_or(false)
    }

    /// Live RTC handle for a peer, if its entry is non-terminal.
    pub fn live_rtc(&self, peer_id: &str) -> Option<(Arc<RTCPeerConnection>, u64)> {
        self.entries.get(peer_id).and_then(|e| {
            if e.state.is_terminal() {
                None
            } else {
                e.rtc.clone().map(|rtc| (rtc, e.epoch))
            }
        })
    }

    /// Apply a state transition. Terminal states never transition further;
    /// repeated observations of the same state are ignored. Returns the
    /// previous state when the transition took effect.
    pub fn set_state(&mut self, peer_id: &str, state: ConnectionState) -> Option<ConnectionState> {
        let entry = self.entries.get_mut(peer_id)?;
        if entry.state.is_terminal() || entry.state == state {
            return None;
        }
        let old = entry.state;
        entry.state = state;
        Some(old)
    }

    pub fn state(&self, peer_id: &str) -> Option<ConnectionState> {
        self.entries.get(peer_id).map(|e| e.state)
    }

    // ------------------------------------------------------------------
    // ICE candidate queue
    // ------------------------------------------------------------------

    /// Queue a candidate that arrived before the peer's remote description.
    pub fn queue_candidate(&mut self, peer_id: &str, candidate: String) {
        self.candidate_queues
            .entry(peer_id.to_string())
            .or_default()
            .push(candidate);
    }

    /// True once a remote description has been applied for this peer and
    /// candidates can be applied directly.
    pub fn remote_description_set(&self, peer_id: &str) -> bool {
        self.entries
            .get(peer_id)
            .map(|e| e.remote_description_set)
            .unwrap_or(false)
    }

    /// Record that a remote description was applied and drain the peer's
    /// queued candidates in arrival order. Called exactly once per applied
    /// description.
    pub fn mark_remote_description(&mut self, peer_id: &str) -> Vec<String> {
        if let Some(entry) = self.entries.get_mut(peer_id) {
            entry.remote_description_set = true;
        }
        self.candidate_queues.remove(peer_id).unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Channel slot
    // ------------------------------------------------------------------

    /// Attach the negotiated channel. Exactly one channel is active per
    /// entry; a stale epoch means the connection was torn down while the
    /// channel was opening, and the attach is refused.
    pub fn attach_channel(
        &mut self,
        peer_id: &str,
        epoch: u64,
        channel: Arc<dyn DataChannel>,
    ) -> bool {
        match self.entries.get_mut(peer_id) {
            Some(entry) if entry.epoch == epoch && !entry.state.is_terminal() => {
                if entry.channel.is_some() {
                    warn!("replacing active channel for peer {}", peer_id);
                }
                entry.channel = Some(channel);
                true
            }
            _ => false,
        }
    }

    pub fn detach_channel(&mut self, peer_id: &str, epoch: u64) -> Option<Arc<dyn DataChannel>> {
        match self.entries.get_mut(peer_id) {
            Some(entry) if entry.epoch == epoch => entry.channel.take(),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Mark a peer failed in place, handing back the transport objects to
    /// close. The entry stays visible (callers observe `Failed` until a
    /// retry or explicit teardown replaces it); its candidate queue is
    /// discarded and its epoch bumped so in-flight callbacks are ignored.
    #[allow(clippy::type_complexity)]
    pub fn mark_failed(
        &mut self,
        peer_id: &str,
    ) -> Option<(Option<Arc<RTCPeerConnection>>, Option<Arc<dyn DataChannel>>)> {
        self.candidate_queues.remove(peer_id);
        let entry = self.entries.get_mut(peer_id)?;
        if entry.state == ConnectionState::Closed {
            return None;
        }
        entry.state = ConnectionState::Failed;
        entry.remote_description_set = false;
        self.next_epoch += 1;
        entry.epoch = self.next_epoch;
        Some((entry.rtc.take(), entry.channel.take()))
    }

    /// Remove a peer entirely (explicit teardown), discarding its candidate
    /// queue. Returns the removed entry so the caller can close its
    /// transport objects.
    pub fn remove(&mut self, peer_id: &str) -> Option<PeerEntry> {
        self.candidate_queues.remove(peer_id);
        self.entries.remove(peer_id)
    }

    /// Remove every entry and candidate queue. Returns the removed entries
    /// for closing.
    pub fn clear(&mut self) -> Vec<PeerEntry> {
        self.candidate_queues.clear();
        self.entries.drain().map(|(_, e)| e).collect()
    }

    pub fn states(&self) -> HashMap<PeerId, ConnectionState> {
        self.entries
            .iter()
            .map(|(id, e)| (id.clone(), e.state))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.candidate_queues.is_empty()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    async fn new_rtc() -> Arc<RTCPeerConnection> {
        let api = APIBuilder::new().build();
        Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_register_makes_live_entry() {
        let mut reg = PeerRegistry::new();
        assert!(!reg.has_live("peer-a"));

        let epoch = reg.register("peer-a".to_string(), new_rtc().await);
        assert!(reg.has_live("peer-a"));
        assert!(reg.epoch_matches("peer-a", epoch));
        assert_eq!(reg.state("peer-a"), Some(ConnectionState::Connecting));
    }

    #[tokio::test]
    async fn test_simultaneous_offer_keeps_single_entry() {
        // Offer arrives for a peer we already started connecting to: the
        // existing entry wins, no duplicate is created.
        let mut reg = PeerRegistry::new();
        let epoch = reg.register("peer-a".to_string(), new_rtc().await);

        assert!(reg.has_live("peer-a"));
        let (_, live_epoch) = reg.live_rtc("peer-a").unwrap();
        assert_eq!(live_epoch, epoch);
        assert_eq!(reg.states().len(), 1);
    }

    #[tokio::test]
    async fn test_candidates_queue_before_remote_description() {
        let mut reg = PeerRegistry::new();

        // Candidates can race ahead of the offer itself.
        reg.queue_candidate("peer-a", "cand-1".to_string());

        reg.register("peer-a".to_string(), new_rtc().await);
        assert!(!reg.remote_description_set("peer-a"));
        reg.queue_candidate("peer-a", "cand-2".to_string());
        reg.queue_candidate("peer-a", "cand-3".to_string());

        let drained = reg.mark_remote_description("peer-a");
        assert_eq!(drained, vec!["cand-1", "cand-2", "cand-3"]);
        assert!(reg.remote_description_set("peer-a"));

        // Queue is consumed exactly once.
        assert!(reg.mark_remote_description("peer-a").is_empty());
    }

    #[tokio::test]
    async fn test_mark_failed_bumps_epoch_and_discards_queue() {
        let mut reg = PeerRegistry::new();
        let epoch = reg.register("peer-a".to_string(), new_rtc().await);
        reg.queue_candidate("peer-a", "late".to_string());

        let (rtc, _channel) = reg.mark_failed("peer-a").unwrap();
        assert!(rtc.is_some());
        assert_eq!(reg.state("peer-a"), Some(ConnectionState::Failed));
        assert!(!reg.has_live("peer-a"));
        assert!(!reg.epoch_matches("peer-a", epoch));

        // Abandoned negotiation discards its queue.
        assert!(reg.mark_remote_description("peer-a").is_empty());
    }

    #[tokio::test]
    async fn test_terminal_states_do_not_transition() {
        let mut reg = PeerRegistry::new();
        reg.register("peer-a".to_string(), new_rtc().await);
        reg.mark_failed("peer-a");

        assert!(reg.set_state("peer-a", ConnectionState::Connected).is_none());
        assert_eq!(reg.state("peer-a"), Some(ConnectionState::Failed));
    }

    #[tokio::test]
    async fn test_channel_attach_respects_epoch() {
        let mut reg = PeerRegistry::new();
        let epoch = reg.register("peer-a".to_string(), new_rtc().await);
        let (a, _b) = MemoryChannel::pair("file-transfer");

        assert!(!reg.attach_channel("peer-a", epoch + 1, a.channel.clone()));
        assert!(reg.attach_channel("peer-a", epoch, a.channel.clone()));
        assert!(reg.detach_channel("peer-a", epoch).is_some());
        assert!(reg.detach_channel("peer-a", epoch).is_none());
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let mut reg = PeerRegistry::new();
        reg.register("peer-a".to_string(), new_rtc().await);
        reg.queue_candidate("peer-b", "cand".to_string());

        assert_eq!(reg.clear().len(), 1);
        assert!(reg.is_empty());
        assert!(reg.clear().is_empty());
        assert!(reg.is_empty());
    }
}
