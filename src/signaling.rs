//! Relay message schema.
//!
//! The relay is an external collaborator: a publish/forward message bus keyed
//! by peer and room identifiers. The engine only needs "send signal to peer X"
//! and "signal arrived from peer Y" semantics; everything here is the logical
//! schema of those messages, independent of the relay's transport framing.

use serde::{Deserialize, Serialize};

/// Opaque, room-scoped identifier for a remote participant.
/// Equality is exact string match.
pub type PeerId = String;

/// Connection-setup payload forwarded through the relay between two peers.
///
/// `sdp` carries a JSON-serialized session description; `candidate` carries a
/// JSON-serialized ICE candidate init. Both are opaque to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: String },
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// A room participant as reported by the relay roster events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUser {
    pub peer_id: PeerId,
    pub display_name: String,
}

/// Messages exchanged with the relay.
///
/// `JoinRoom` flows client to relay; `RoomUsers`, `UserJoined` and `UserLeft`
/// flow relay to client; the `Offer`/`Answer`/`IceCandidate` triple is
/// client to relay to target client, with the relay stamping `sender`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String, display_name: String },
    #[serde(rename_all = "camelCase")]
    RoomUsers { users: Vec<RoomUser> },
    #[serde(rename_all = "camelCase")]
    UserJoined { user: RoomUser },
    #[serde(rename_all = "camelCase")]
    UserLeft { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    Offer {
        target: PeerId,
        #[serde(default)]
        sender: PeerId,
        offer: String,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        target: PeerId,
        #[serde(default)]
        sender: PeerId,
        answer: String,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target: PeerId,
        #[serde(default)]
        sender: PeerId,
        candidate: String,
    },
}

impl RelayMessage {
    /// Wrap an outbound signal for the relay, addressed to `target`.
    pub fn from_signal(target: PeerId, signal: Signal) -> Self {
        match signal {
            Signal::Offer { sdp } => RelayMessage::Offer {
                target,
                sender: PeerId::new(),
                offer: sdp,
            },
            Signal::Answer { sdp } => RelayMessage::Answer {
                target,
                sender: PeerId::new(),
                answer: sdp,
            },
            Signal::IceCandidate { candidate } => RelayMessage::IceCandidate {
                target,
                sender: PeerId::new(),
                candidate,
            },
        }
    }

    /// Unwrap a relay-delivered message into the signal and its sender.
    /// Returns `None` for roster/room messages, which the engine does not
    /// consume directly.
    pub fn into_signal(self) -> Option<(Signal, PeerId)> {
        match self {
            RelayMessage::Offer { sender, offer, .. } => {
                Some((Signal::Offer { sdp: offer }, sender))
            }
            RelayMessage::Answer { sender, answer, .. } => {
                Some((Signal::Answer { sdp: answer }, sender))
            }
            RelayMessage::IceCandidate {
                sender, candidate, ..
            } => Some((Signal::IceCandidate { candidate }, sender)),
            _ => None,
        }
    }
}
