//! Typed event variants delivered to caller-supplied sinks.
//!
//! The transport and every peer session each get exactly one sink: an
//! unbounded mpsc sender the caller drains at its own pace. Event delivery
//! never blocks and never errors into the session; a dropped receiver simply
//! discards further events.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::protocol::PeerId;

pub type TransportEventSink = mpsc::UnboundedSender<TransportEvent>;
pub type PeerEventSink = mpsc::UnboundedSender<PeerEvent>;

/// Lifecycle and traffic events for the relay control channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The control channel is open and usable.
    Connected,
    /// A payload relayed from another client.
    Message(Value),
    /// Informational text pushed by the relay, forwarded verbatim.
    Notice(String),
    /// The control channel closed; `reconnecting` says whether the bounded
    /// retry loop is taking over.
    Closed { reconnecting: bool },
    /// A connection attempt failed, or reconnection was exhausted.
    Error(String),
}

/// One normalized event from a peer session, stamped with the peer it
/// concerns and the moment it was observed.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub target: PeerId,
    pub timestamp_ms: u64,
    pub kind: PeerEventKind,
}

impl PeerEvent {
    pub fn new(target: PeerId, kind: PeerEventKind) -> Self {
        Self {
            target,
            timestamp_ms: now_ms(),
            kind,
        }
    }
}

/// Every underlying connection and channel event, as one tagged union.
#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// A remote media track arrived.
    Track { track_id: String, kind: String },
    /// A local candidate was gathered (`None` marks end of gathering).
    IceCandidate { candidate: Option<String> },
    /// A remote candidate could not be applied.
    IceCandidateError { reason: String },
    IceConnectionStateChange { state: RTCIceConnectionState },
    IceGatheringStateChange { state: RTCIceGathererState },
    SignalingStateChange { state: RTCSignalingState },
    NegotiationNeeded,
    ConnectionStateChange { state: RTCPeerConnectionState },
    ChannelOpen { label: String },
    ChannelMessage {
        label: String,
        data: Bytes,
        is_string: bool,
    },
    ChannelClose { label: String },
    ChannelError { label: String, reason: String },
    ChannelBufferedAmountLow { label: String },
    /// A session-scoped failure that does not map to a platform event.
    Error { reason: String },
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
