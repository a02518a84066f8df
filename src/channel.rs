//! Data channel abstraction.
//!
//! One ordered, reliable channel per peer pair carries both JSON control
//! messages (text frames) and chunk payloads (binary frames). `RtcChannel`
//! wraps a live WebRTC data channel; `MemoryChannel` is an in-process
//! loopback pair used by tests and by embedders that want to exercise the
//! transfer protocol without a network.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// One message received on a channel. Text frames carry protocol control
/// JSON; binary frames carry chunk data.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub is_binary: bool,
    pub data: Bytes,
}

/// The ordered byte-message transport between two peers.
///
/// Implementations must deliver messages in send order; the transfer
/// protocol's framing depends on it.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), String>;

    async fn send_binary(&self, data: Bytes) -> Result<(), String>;

    /// Bytes queued for send but not yet handed to the transport.
    /// The flow controller polls this against its high-water mark.
    async fn buffered_amount(&self) -> usize;

    async fn close(&self);
}

// ============================================================================
// WebRTC-backed channel
// ============================================================================

/// `DataChannel` backed by a live `RTCDataChannel`.
pub struct RtcChannel {
    inner: Arc<RTCDataChannel>,
}

impl RtcChannel {
    pub fn new(inner: Arc<RTCDataChannel>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), String> {
        self.inner
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| format!("data channel text send failed: {}", e))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), String> {
        self.inner
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| format!("data channel binary send failed: {}", e))
    }

    async fn buffered_amount(&self) -> usize {
        self.inner.buffered_amount().await
    }

    async fn close(&self) {
        let _ = self.inner.close().await;
    }
}

// ============================================================================
// In-memory loopback channel
// ============================================================================

/// One endpoint of an in-process channel pair plus its inbound message queue.
pub struct MemoryEndpoint {
    pub channel: Arc<MemoryChannel>,
    pub inbound: mpsc::UnboundedReceiver<ChannelMessage>,
}

/// In-process `DataChannel`: whatever one endpoint sends arrives, in order,
/// on the other endpoint's inbound queue. The simulated outbound buffer is
/// test-controlled via [`MemoryChannel::set_buffered`].
pub struct MemoryChannel {
    label: String,
    to_peer: mpsc::UnboundedSender<ChannelMessage>,
    open: Arc<AtomicBool>,
    buffered: AtomicUsize,
}

impl MemoryChannel {
    /// Build a connected pair of endpoints sharing one open/closed state.
    pub fn pair(label: &str) -> (MemoryEndpoint, MemoryEndpoint) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let a = Arc::new(MemoryChannel {
            label: label.to_string(),
            to_peer: a_tx,
            open: open.clone(),
            buffered: AtomicUsize::new(0),
        });
        let b = Arc::new(MemoryChannel {
            label: label.to_string(),
            to_peer: b_tx,
            open,
            buffered: AtomicUsize::new(0),
        });

        (
            MemoryEndpoint {
                channel: a,
                inbound: a_rx,
            },
            MemoryEndpoint {
                channel: b,
                inbound: b_rx,
            },
        )
    }

    /// Simulate outstanding unsent bytes on this endpoint.
    pub fn set_buffered(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }

    fn deliver(&self, msg: ChannelMessage) -> Result<(), String> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(format!("channel '{}' is closed", self.label));
        }
        self.to_peer
            .send(msg)
            .map_err(|_| format!("channel '{}' peer endpoint dropped", self.label))
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<(), String> {
        self.deliver(ChannelMessage {
            is_binary: false,
            data: Bytes::from(text),
        })
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), String> {
        self.deliver(ChannelMessage {
            is_binary: true,
            data,
        })
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_delivers_in_order() {
        let (a, mut b) = MemoryChannel::pair("file-transfer");

        a.channel.send_text("first".to_string()).await.unwrap();
        a.channel
            .send_binary(Bytes::from_static(b"\x01\x02"))
            .await
            .unwrap();
        a.channel.send_text("last".to_string()).await.unwrap();

        let m1 = b.inbound.recv().await.unwrap();
        assert!(!m1.is_binary);
        assert_eq!(&m1.data[..], b"first");

        let m2 = b.inbound.recv().await.unwrap();
        assert!(m2.is_binary);
        assert_eq!(&m2.data[..], &[1, 2]);

        let m3 = b.inbound.recv().await.unwrap();
        assert_eq!(&m3.data[..], b"last");
    }

    #[tokio::test]
    async fn test_close_is_shared_and_stops_sends() {
        let (a, b) = MemoryChannel::pair("file-transfer");
        assert!(a.channel.is_open());
        assert!(b.channel.is_open());

        b.channel.close().await;

        assert!(!a.channel.is_open());
        assert!(a.channel.send_text("late".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_buffered_amount_is_settable() {
        let (a, _b) = MemoryChannel::pair("file-transfer");
        assert_eq!(a.channel.buffered_amount().await, 0);
        a.channel.set_buffered(512 * 1024);
        assert_eq!(a.channel.buffered_amount().await, 512 * 1024);
    }
}
