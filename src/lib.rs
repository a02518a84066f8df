//! Roomdrop engine: direct peer-to-peer file transfer for room-based
//! sharing.
//!
//! A lightweight relay forwards connection-setup signals between peers in a
//! room; once a direct data channel is negotiated, file bytes flow
//! peer-to-peer through a chunked transfer protocol with flow control,
//! multiplexing, progress tracking, and cancellation.
//!
//! [`service::RoomDropService`] is the entry point. The embedding
//! application forwards relay signals in via `handle_signal`, forwards
//! `SignalOut` events back to the relay, and drives transfers with
//! `send_file`/`cancel_transfer`.

pub mod channel;
pub mod config;
pub mod connection;
pub mod events;
pub mod flow;
pub mod reconnect;
pub mod service;
pub mod signaling;
pub mod transfer;

pub use channel::{ChannelMessage, DataChannel, MemoryChannel, MemoryEndpoint, RtcChannel};
pub use config::{EngineConfig, IceServer};
pub use connection::ConnectionState;
pub use events::PeerEvent;
pub use flow::FlowConfig;
pub use reconnect::{ReconnectSupervisor, RetryConfig, RetryDecision, RetryStats};
pub use service::RoomDropService;
pub use signaling::{PeerId, RelayMessage, RoomUser, Signal};
pub use transfer::{
    OutboundFile, ReceivedFile, Transfer, TransferDirection, TransferId, TransferProgress,
    TransferStatus,
};
