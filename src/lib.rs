//! lagoon — relayed realtime messaging and peer-to-peer RTC sessions.
//!
//! One persistent WebSocket control channel to a signaling relay carries
//! application messages and connection-negotiation traffic; per-peer WebRTC
//! sessions (labeled data channels plus optional media) are negotiated over
//! it with ringing/pickup call semantics. The control channel survives
//! transient drops with bounded exponential reconnection, re-establishing
//! group membership on the way back up; negotiation messages that arrive
//! before a peer session can consume them are buffered per peer and flushed
//! in arrival order.
//!
//! ```no_run
//! use std::sync::Arc;
//! use lagoon::{
//!     CallParams, ChannelRequest, RealtimeClient, RealtimeConfig, StaticTokenProvider,
//! };
//!
//! # async fn demo() -> lagoon::Result<()> {
//! let config = RealtimeConfig::new("wss://relay.example.com/realtime");
//! let auth = Arc::new(StaticTokenProvider::new("<jwt>", "user-1"));
//! let client = RealtimeClient::new(config, auth)?;
//!
//! let (events, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
//! client.connect_realtime(events).await?;
//!
//! let (peer_events, mut peer_rx) = tokio::sync::mpsc::unbounded_channel();
//! let call = client
//!     .connect_rtc(
//!         "cid:remote",
//!         CallParams::default().with_channel(ChannelRequest::labeled("text-chat")),
//!         peer_events,
//!     )
//!     .await?;
//! if let Some(session) = call.connection().await {
//!     // connected: session.channel("text-chat") is live
//!     session.hangup().await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod call;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod transport;

pub use auth::{StaticTokenProvider, TokenProvider};
pub use call::{Answerer, CallParams, OutboundCall, Session};
pub use client::{CloseTarget, RealtimeClient, Recipient};
pub use config::{DEFAULT_ICE_SERVER, RealtimeConfig};
pub use error::{RealtimeError, Result};
pub use events::{PeerEvent, PeerEventKind, PeerEventSink, TransportEvent, TransportEventSink};
pub use protocol::{new_cid, CID_PREFIX, GroupId, PeerId};
pub use session::channel::{ChannelOptions, ChannelProfile, ChannelRequest};
pub use session::media::LocalMedia;
pub use transport::TransportState;
