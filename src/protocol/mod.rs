//! Wire protocol spoken with the signaling relay.
//!
//! Frames are JSON text. Outbound envelopes carry an `action` discriminant
//! and a bearer token; inbound frames are either a `#notice` pushed by the
//! relay or an arbitrary payload relayed from another client, in which case
//! `sender_cid` names the originating peer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type PeerId = String;
pub type GroupId = String;

/// Prefix every pending-connection identifier carries.
pub const CID_PREFIX: &str = "cid:";

/// Generates a fresh pending-connection identifier.
pub fn new_cid() -> PeerId {
    format!("{CID_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Outbound signaling envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum RelayRequest {
    /// Join a broadcast group; `rid: None` leaves the current one.
    JoinGroup { rid: Option<GroupId>, token: String },
    /// Deliver `content` to one peer.
    SendMessage {
        uid: PeerId,
        content: Value,
        token: String,
    },
    /// Deliver `content` to every member of a group.
    Broadcast {
        rid: GroupId,
        content: Value,
        token: String,
    },
    /// Connection-negotiation traffic for one peer.
    Rtc {
        uid: PeerId,
        content: RtcContent,
        token: String,
    },
}

impl RelayRequest {
    /// Recipient the relay must resolve, if the action addresses one.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            RelayRequest::JoinGroup { .. } => None,
            RelayRequest::SendMessage { uid, .. } | RelayRequest::Rtc { uid, .. } => Some(uid),
            RelayRequest::Broadcast { rid, .. } => Some(rid),
        }
    }
}

/// Session description payload (`type` is `"offer"` or `"answer"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// Trickled ICE candidate payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Call-control payload carried in an `rtc` envelope. The wire shape is a
/// single-key object; the key selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RtcContent {
    Offer { sdpoffer: SdpPayload },
    Answer { sdpanswer: SdpPayload },
    Candidate { candidate: CandidatePayload },
    Pickup { pickup: String },
    Hungup { hungup: String },
}

/// A frame received from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayInbound {
    /// `{"#notice": "..."}` pushed by the relay itself.
    Notice(String),
    /// Anything else: a payload relayed from another client.
    Message(Value),
}

impl RelayInbound {
    /// Parses one text frame. Returns `None` for non-JSON input, which the
    /// transport logs and ignores.
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        if let Some(notice) = value.get("#notice").and_then(Value::as_str) {
            return Some(RelayInbound::Notice(notice.to_string()));
        }
        Some(RelayInbound::Message(value))
    }
}

/// An rtc-action message relayed from a remote peer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RtcInbound {
    pub sender_cid: PeerId,
    #[serde(flatten)]
    pub content: RtcContent,
}

impl RtcInbound {
    /// Extracts rtc traffic from a relayed payload; `None` when the payload
    /// is ordinary application traffic.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}
