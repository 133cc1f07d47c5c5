//! Public facade composing the transport, the session registry, and the call
//! orchestrator for one client instance. Nothing here is process-global: two
//! clients in one process share no state.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::TokenProvider;
use crate::call::{Answerer, CallOrchestrator, CallParams, OutboundCall};
use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, Result};
use crate::events::{PeerEventSink, TransportEventSink};
use crate::protocol::RelayRequest;
use crate::session::PeerSessionRegistry;
use crate::session::buffer::SignalingBuffer;
use crate::transport::{SignalSender, SignalingTransport, TransportState};

/// Where a posted message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    User(String),
    Group(String),
}

/// Which sessions `close_rtc` tears down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseTarget {
    Peer(String),
    All,
}

pub struct RealtimeClient {
    auth: Arc<dyn TokenProvider>,
    transport: Arc<SignalingTransport>,
    calls: Arc<CallOrchestrator>,
    router_task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeClient {
    pub fn new(config: RealtimeConfig, auth: Arc<dyn TokenProvider>) -> Result<Self> {
        let transport = SignalingTransport::new(config.clone(), auth.clone());
        let signaler: Arc<dyn SignalSender> = transport.clone();
        let registry = PeerSessionRegistry::new(
            signaler.clone(),
            Arc::new(SignalingBuffer::new()),
            config.ice_server_url.clone(),
            auth.user_id(),
        )?;
        let calls = CallOrchestrator::new(registry, signaler, config, auth.user_id());
        Ok(Self {
            auth,
            transport,
            calls,
            router_task: Mutex::new(None),
        })
    }

    pub fn user_id(&self) -> &str {
        self.auth.user_id()
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    /// Opens the relay control channel and starts routing inbound rtc
    /// traffic. Idempotent while a connection is in flight or open.
    pub async fn connect_realtime(&self, sink: TransportEventSink) -> Result<()> {
        self.ensure_router();
        self.transport.connect(sink).await
    }

    /// Cleanly closes the control channel and every peer session.
    pub async fn close_realtime(&self) {
        self.transport.close().await;
        self.calls.close_all().await;
    }

    /// Joins a broadcast group; `None` leaves the current one. Membership is
    /// re-established automatically after a reconnect.
    pub async fn join_realtime(&self, group: Option<String>) -> Result<()> {
        self.transport.join_group(group).await
    }

    /// Posts an application payload to one user or one group.
    pub async fn post_realtime(&self, message: Value, recipient: Recipient) -> Result<()> {
        let token = self.auth.get_jwt_token().await?;
        let envelope = match recipient {
            Recipient::User(uid) => {
                if uid.is_empty() {
                    return Err(RealtimeError::invalid_parameter(
                        "message recipient is empty",
                    ));
                }
                RelayRequest::SendMessage {
                    uid,
                    content: message,
                    token,
                }
            }
            Recipient::Group(rid) => {
                if rid.is_empty() {
                    return Err(RealtimeError::invalid_parameter(
                        "broadcast group is empty",
                    ));
                }
                RelayRequest::Broadcast {
                    rid,
                    content: message,
                    token,
                }
            }
        };
        self.transport.send(envelope).await
    }

    /// Places a call to `cid`. The transport must be open: the initial offer
    /// travels over it.
    pub async fn connect_rtc(
        &self,
        cid: &str,
        params: CallParams,
        sink: PeerEventSink,
    ) -> Result<OutboundCall> {
        if self.transport.state() != TransportState::Open {
            return Err(RealtimeError::invalid_request(
                "signaling transport is not open",
            ));
        }
        self.calls.place_call(cid, params, sink).await
    }

    /// Hands out the answering half of a pending ring, keyed by the
    /// message's `sender_cid`. `None` once the ring expired or was consumed.
    pub fn respond_rtc(&self, message: &Value) -> Option<Answerer> {
        self.calls.respond(message)
    }

    /// Tears down one peer session or all of them. Idempotent.
    pub async fn close_rtc(&self, target: CloseTarget) {
        match target {
            CloseTarget::Peer(cid) => self.calls.close(&cid).await,
            CloseTarget::All => self.calls.close_all().await,
        }
    }

    fn ensure_router(&self) {
        let mut slot = self.router_task.lock();
        if slot.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.transport.set_router(tx);
        let calls = Arc::clone(&self.calls);
        *slot = Some(tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                calls.handle_rtc(inbound).await;
            }
        }));
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if let Some(task) = self.router_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use serde_json::json;

    fn client() -> RealtimeClient {
        let config = RealtimeConfig::new("wss://relay.example.com/realtime");
        let auth = Arc::new(StaticTokenProvider::new("tok", "user-1"));
        RealtimeClient::new(config, auth).unwrap()
    }

    #[tokio::test]
    async fn posting_without_a_transport_fails_fast() {
        let client = client();
        let err = client
            .post_realtime(json!({"text": "hi"}), Recipient::User("u2".into()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn empty_recipients_are_parameter_errors() {
        let client = client();
        let err = client
            .post_realtime(json!("hi"), Recipient::User(String::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETER");
        let err = client
            .post_realtime(json!("hi"), Recipient::Group(String::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETER");
    }

    #[tokio::test]
    async fn calls_require_an_open_transport() {
        let client = client();
        let (sink, _events) = mpsc::unbounded_channel();
        let err = client
            .connect_rtc("cid:abc", CallParams::default(), sink)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn responding_with_no_ring_is_none() {
        let client = client();
        let message = json!({
            "sender_cid": "cid:x",
            "sdpoffer": {"type": "offer", "sdp": "v=0\r\n"}
        });
        assert!(client.respond_rtc(&message).is_none());
    }

    #[tokio::test]
    async fn close_rtc_on_a_fresh_client_is_a_noop() {
        let client = client();
        client.close_rtc(CloseTarget::Peer("cid:never".into())).await;
        client.close_rtc(CloseTarget::All).await;
    }
}
