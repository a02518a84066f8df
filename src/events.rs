//! Events emitted by the engine.
//!
//! Everything the engine observes or decides surfaces here as a state
//! change; nothing is thrown across component boundaries. `SignalOut`
//! events are the outbound half of the signaling contract — the embedder
//! forwards them to the relay addressed to `target`.

use crate::connection::ConnectionState;
use crate::signaling::{PeerId, Signal};
use crate::transfer::{Transfer, TransferId, TransferProgress};

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Forward this signal to `target` via the relay.
    SignalOut { target: PeerId, signal: Signal },

    ConnectionStateChanged {
        peer_id: PeerId,
        state: ConnectionState,
    },
    ChannelOpened {
        peer_id: PeerId,
    },
    ChannelClosed {
        peer_id: PeerId,
    },

    /// A failed connection is being retried after a backoff delay.
    PeerRetrying {
        peer_id: PeerId,
        attempt: u32,
        max_attempts: u32,
        next_retry_ms: u64,
    },
    /// Reconnection attempts are exhausted; the peer stays failed until the
    /// caller re-initiates.
    PeerUnreachable {
        peer_id: PeerId,
        attempts: u32,
        last_error: String,
    },

    TransferStarted {
        transfer: Transfer,
    },
    TransferProgress {
        progress: TransferProgress,
    },
    TransferCompleted {
        transfer: Transfer,
    },
    TransferCancelled {
        transfer: Transfer,
    },
    TransferFailed {
        transfer: Transfer,
        error: String,
    },

    /// A receiving transfer completed and its file was added to the
    /// received list.
    FileReceived {
        transfer_id: TransferId,
        peer_id: PeerId,
        file_name: String,
        size: u64,
    },
}
