//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::flow::FlowConfig;
use crate::reconnect::RetryConfig;

/// Chunk payload size for outgoing data frames (16 KiB). Tunable, not a
/// protocol contract — the receiver accepts whatever payload lengths arrive.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// How long an ICE-disconnected connection may try to recover before it is
/// escalated to failed.
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Label of the single data channel per peer pair.
pub const DATA_CHANNEL_LABEL: &str = "file-transfer";

/// One STUN/TURN server entry. Empty credentials mean STUN-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// STUN/TURN servers for NAT traversal. Without these, connections fail
    /// for peers behind NAT.
    pub ice_servers: Vec<IceServer>,
    pub chunk_size: usize,
    pub flow: FlowConfig,
    pub retry: RetryConfig,
    pub disconnect_grace: Duration,
    /// Capacity of the outbound event queue.
    pub event_capacity: usize,
    /// Capacity of the internal command queue.
    pub command_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                username: String::new(),
                credential: String::new(),
            }],
            chunk_size: DEFAULT_CHUNK_SIZE,
            flow: FlowConfig::default(),
            retry: RetryConfig::default(),
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            event_capacity: 1000,
            command_capacity: 100,
        }
    }
}

impl EngineConfig {
    /// Build the transport configuration from the configured ICE servers.
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| {
                    if server.credential.is_empty() {
                        RTCIceServer {
                            urls: server.urls.clone(),
                            ..Default::default()
                        }
                    } else {
                        RTCIceServer {
                            urls: server.urls.clone(),
                            username: server.username.clone(),
                            credential: server.credential.clone(),
                            credential_type: RTCIceCredentialType::Password,
                        }
                    }
                })
                .collect(),
            ..Default::default()
        }
    }
}
