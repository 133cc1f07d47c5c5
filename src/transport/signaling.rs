//! The persistent control channel to the signaling relay.
//!
//! One logical WebSocket connection per client. A writer task owns the sink
//! half, a reader task owns the stream half, and a heartbeat task keeps NATs
//! from expiring the mapping. An unclean close hands the connection to a
//! bounded exponential reconnect loop that re-runs the full connect sequence,
//! including group re-join; a clean close resets everything to initial.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};

use super::{SignalSender, TransportState, backoff_delay};
use crate::auth::TokenProvider;
use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, Result};
use crate::events::{TransportEvent, TransportEventSink};
use crate::protocol::{GroupId, RelayInbound, RelayRequest, RtcContent, RtcInbound};

pub struct SignalingTransport {
    config: RealtimeConfig,
    auth: Arc<dyn TokenProvider>,
    state_tx: watch::Sender<TransportState>,
    state_rx: watch::Receiver<TransportState>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    group: Mutex<Option<GroupId>>,
    sink: Mutex<Option<TransportEventSink>>,
    router: Mutex<Option<mpsc::UnboundedSender<RtcInbound>>>,
    connect_gate: AsyncMutex<()>,
    intentional_close: AtomicBool,
    exhausted: AtomicBool,
    attempts: AtomicU32,
    // Bumped for every socket (and on close) so a superseded reader cannot
    // trigger reconnection against a state it no longer owns.
    generation: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    weak: Weak<Self>,
}

impl SignalingTransport {
    pub fn new(config: RealtimeConfig, auth: Arc<dyn TokenProvider>) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(TransportState::Closed);
        Arc::new_cyclic(|weak| Self {
            config,
            auth,
            state_tx,
            state_rx,
            writer: Mutex::new(None),
            group: Mutex::new(None),
            sink: Mutex::new(None),
            router: Mutex::new(None),
            connect_gate: AsyncMutex::new(()),
            intentional_close: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            weak: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("transport is alive while borrowed")
    }

    pub fn state(&self) -> TransportState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state_rx.clone()
    }

    /// Route inbound rtc-action messages into the call layer.
    pub(crate) fn set_router(&self, router: mpsc::UnboundedSender<RtcInbound>) {
        *self.router.lock() = Some(router);
    }

    /// Opens the control channel. Idempotent: concurrent callers serialize on
    /// an internal gate, and whoever finds the channel already open simply
    /// keeps it. Lifecycle events are reported to `sink` until the next
    /// `connect` replaces it.
    pub async fn connect(&self, sink: TransportEventSink) -> Result<()> {
        let _gate = self.connect_gate.lock().await;
        if self.exhausted.load(Ordering::SeqCst) {
            return Err(RealtimeError::invalid_request(
                "signaling transport closed after reconnect exhaustion",
            ));
        }
        *self.sink.lock() = Some(sink);
        if self.state() == TransportState::Open {
            return Ok(());
        }
        self.intentional_close.store(false, Ordering::SeqCst);
        match self.open_socket().await {
            Ok(()) => Ok(()),
            Err(err) => {
                // A failed first attempt leaves the transport back at rest;
                // reconnection only kicks in for an established channel.
                self.set_state(TransportState::Closed);
                Err(err)
            }
        }
    }

    /// Cleanly closes the control channel and resets transport state and
    /// group membership to initial. Never reconnects, never errors, safe to
    /// call repeatedly.
    pub async fn close(&self) {
        self.intentional_close.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        let was_active = self.state() != TransportState::Closed;
        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.send(Message::Close(None));
        }
        {
            let mut tasks = self.tasks.lock();
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.set_state(TransportState::Closed);
        *self.group.lock() = None;
        self.attempts.store(0, Ordering::SeqCst);
        self.exhausted.store(false, Ordering::SeqCst);
        if was_active {
            tracing::debug!(target: "signaling", "control channel closed by caller");
            self.emit(TransportEvent::Closed {
                reconnecting: false,
            });
        }
    }

    /// Sends one envelope. The caller is responsible for the envelope being
    /// well-formed; the transport only checks that the recipient is
    /// resolvable and that the channel is open.
    pub async fn send(&self, envelope: RelayRequest) -> Result<()> {
        if let Some(recipient) = envelope.recipient() {
            if recipient.is_empty() {
                return Err(RealtimeError::invalid_parameter(
                    "envelope recipient is empty",
                ));
            }
        }
        if self.state() != TransportState::Open {
            return Err(RealtimeError::invalid_request(
                "signaling transport is not open",
            ));
        }
        let text = serde_json::to_string(&envelope).map_err(RealtimeError::transport)?;
        let writer = self.writer.lock().clone();
        match writer {
            Some(writer) => writer
                .send(Message::Text(text))
                .map_err(|_| RealtimeError::transport("control channel writer is gone")),
            None => Err(RealtimeError::invalid_request(
                "signaling transport is not open",
            )),
        }
    }

    /// Joins a group (`None` leaves the current one). Membership is recorded
    /// only after the send succeeds, and is replayed automatically whenever
    /// the channel is re-established.
    pub async fn join_group(&self, group: Option<GroupId>) -> Result<()> {
        let token = self.auth.get_jwt_token().await?;
        self.send(RelayRequest::JoinGroup {
            rid: group.clone(),
            token,
        })
        .await?;
        *self.group.lock() = group;
        Ok(())
    }

    /// Current group membership, if any.
    pub fn group(&self) -> Option<GroupId> {
        self.group.lock().clone()
    }

    fn set_state(&self, state: TransportState) {
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(sink) = &*self.sink.lock() {
            let _ = sink.send(event);
        }
    }
}

// `open_socket` lives in a child module so its opaque future's auto-traits can
// be fetched from `reconnect_loop` in the parent module (rustc cannot query the
// hidden type of an opaque within its own defining scope).
mod socket {
    use std::future::Future;
    use std::pin::Pin;

    use super::*;

    impl SignalingTransport {
    /// One connection attempt: auth, socket, tasks, group replay.
    pub(super) fn open_socket(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
        self.set_state(TransportState::Connecting);
        let token = match self.auth.get_jwt_token().await {
            Ok(token) => token,
            Err(err) => {
                self.emit(TransportEvent::Error(format!(
                    "authentication failed: {err}"
                )));
                return Err(err);
            }
        };
        let (stream, _) = match connect_async(self.config.relay_url.as_str()).await {
            Ok(connected) => connected,
            Err(err) => {
                self.emit(TransportEvent::Error(format!("relay connect failed: {err}")));
                return Err(RealtimeError::transport(err));
            }
        };
        tracing::debug!(
            target: "signaling",
            url = %self.config.relay_url,
            "control channel connected"
        );
        let (mut ws_write, mut ws_read) = stream.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.writer.lock() = Some(writer_tx.clone());

        let writer_task = tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                if ws_write.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = self.arc();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader.handle_frame(&text),
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data) {
                            reader.handle_frame(&text);
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target: "signaling",
                                    "control channel closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target: "signaling",
                                    "control channel error: {err}"
                                );
                            }
                        }
                        break;
                    }
                }
            }
            reader.on_socket_closed(generation).await;
        });

        let heartbeat_writer = writer_tx;
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_writer.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
        });

        {
            let mut tasks = self.tasks.lock();
            tasks.retain(|task| !task.is_finished());
            tasks.push(writer_task);
            tasks.push(reader_task);
            tasks.push(heartbeat_task);
        }

        self.attempts.store(0, Ordering::SeqCst);
        self.set_state(TransportState::Open);
        self.emit(TransportEvent::Connected);

        let group = self.group.lock().clone();
        if let Some(rid) = group {
            tracing::debug!(target: "signaling", group = %rid, "re-joining group");
            if let Err(err) = self
                .send(RelayRequest::JoinGroup {
                    rid: Some(rid),
                    token,
                })
                .await
            {
                self.emit(TransportEvent::Error(format!("group re-join failed: {err}")));
            }
        }
        Ok(())
        })
    }
    }
}

impl SignalingTransport {
    fn handle_frame(&self, text: &str) {
        match RelayInbound::parse(text) {
            Some(RelayInbound::Notice(notice)) => {
                tracing::debug!(target: "signaling", notice = %notice, "relay notice");
                self.emit(TransportEvent::Notice(notice));
            }
            Some(RelayInbound::Message(value)) => {
                if let Some(rtc) = RtcInbound::from_value(&value) {
                    if let Some(router) = &*self.router.lock() {
                        if router.send(rtc).is_err() {
                            tracing::debug!(
                                target: "signaling",
                                "rtc router dropped; call-control payload ignored"
                            );
                        }
                    }
                }
                self.emit(TransportEvent::Message(value));
            }
            None => {
                tracing::warn!(
                    target: "signaling",
                    len = text.len(),
                    "discarding malformed relay frame"
                );
            }
        }
    }

    async fn on_socket_closed(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.writer.lock().take();
        if self.intentional_close.load(Ordering::SeqCst) || self.state() == TransportState::Closed
        {
            return;
        }
        tracing::debug!(target: "signaling", "control channel dropped; reconnecting");
        self.emit(TransportEvent::Closed { reconnecting: true });
        self.set_state(TransportState::Reconnecting);
        let transport = self.arc();
        tokio::spawn(async move { transport.reconnect_loop().await });
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            if self.intentional_close.load(Ordering::SeqCst) {
                return;
            }
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt >= self.config.max_reconnect_attempts {
                tracing::warn!(
                    target: "signaling",
                    attempts = attempt,
                    "reconnect attempts exhausted"
                );
                self.exhausted.store(true, Ordering::SeqCst);
                self.set_state(TransportState::Closed);
                self.emit(TransportEvent::Error(
                    "signaling transport closed: reconnect attempts exhausted".to_string(),
                ));
                return;
            }
            let delay = backoff_delay(
                attempt,
                self.config.reconnect_base_ms,
                self.config.reconnect_cap_ms,
            );
            tracing::debug!(
                target: "signaling",
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::time::sleep(delay).await;
            if self.intentional_close.load(Ordering::SeqCst) {
                return;
            }
            let _gate = self.connect_gate.lock().await;
            if self.state() == TransportState::Open {
                return;
            }
            match self.open_socket().await {
                Ok(()) => {
                    tracing::info!(target: "signaling", attempt, "control channel re-established");
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        target: "signaling",
                        attempt,
                        error = %err,
                        "reconnect attempt failed"
                    );
                    self.set_state(TransportState::Reconnecting);
                }
            }
        }
    }
}

#[async_trait]
impl SignalSender for SignalingTransport {
    async fn send_rtc(&self, uid: &str, content: RtcContent) -> Result<()> {
        let token = self.auth.get_jwt_token().await?;
        self.send(RelayRequest::Rtc {
            uid: uid.to_string(),
            content,
            token,
        })
        .await
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    struct RelayConn {
        frames: mpsc::UnboundedReceiver<String>,
        out: mpsc::UnboundedSender<String>,
        close: Option<oneshot::Sender<()>>,
    }

    impl RelayConn {
        async fn next_frame(&mut self) -> Value {
            let text = timeout(Duration::from_secs(5), self.frames.recv())
                .await
                .expect("frame timeout")
                .expect("relay connection gone");
            serde_json::from_str(&text).expect("relay frames are json")
        }

        fn drop_socket(&mut self) {
            if let Some(close) = self.close.take() {
                let _ = close.send(());
            }
        }
    }

    struct TestRelay {
        url: String,
        conns: mpsc::UnboundedReceiver<RelayConn>,
        accept_task: JoinHandle<()>,
    }

    impl TestRelay {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (conn_tx, conns) = mpsc::unbounded_channel();
            let accept_task = tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        continue;
                    };
                    let (mut write, mut read) = ws.split();
                    let (frame_tx, frames) = mpsc::unbounded_channel();
                    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
                    let (close_tx, mut close_rx) = oneshot::channel::<()>();
                    if conn_tx
                        .send(RelayConn {
                            frames,
                            out: out_tx,
                            close: Some(close_tx),
                        })
                        .is_err()
                    {
                        break;
                    }
                    tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                frame = read.next() => match frame {
                                    Some(Ok(Message::Text(text))) => {
                                        let _ = frame_tx.send(text);
                                    }
                                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                },
                                pushed = out_rx.recv() => match pushed {
                                    Some(text) => {
                                        if write.send(Message::Text(text)).await.is_err() {
                                            break;
                                        }
                                    }
                                    None => break,
                                },
                                _ = &mut close_rx => break,
                            }
                        }
                    });
                }
            });
            Self {
                url: format!("ws://{addr}/realtime"),
                conns,
                accept_task,
            }
        }

        async fn accept(&mut self) -> RelayConn {
            timeout(Duration::from_secs(5), self.conns.recv())
                .await
                .expect("accept timeout")
                .expect("accept loop gone")
        }
    }

    impl Drop for TestRelay {
        fn drop(&mut self) {
            self.accept_task.abort();
        }
    }

    fn transport_for(relay: &TestRelay) -> Arc<SignalingTransport> {
        let config = RealtimeConfig::new(relay.url.clone()).with_reconnect(10, 1, 10);
        let auth = Arc::new(StaticTokenProvider::new("tok", "user-1"));
        SignalingTransport::new(config, auth)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timeout")
            .expect("event sink gone")
    }

    #[tokio::test]
    async fn send_before_connect_fails_fast() {
        let relay = TestRelay::start().await;
        let transport = transport_for(&relay);
        let err = transport
            .send(RelayRequest::SendMessage {
                uid: "u1".into(),
                content: json!("hi"),
                token: "tok".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn connect_opens_and_delivers_traffic() {
        let mut relay = TestRelay::start().await;
        let transport = transport_for(&relay);
        let (sink, mut events) = mpsc::unbounded_channel();
        transport.connect(sink).await.unwrap();
        let mut conn = relay.accept().await;
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected
        ));
        assert_eq!(transport.state(), TransportState::Open);

        transport
            .send(RelayRequest::SendMessage {
                uid: "u1".into(),
                content: json!({"text": "hello"}),
                token: "tok".into(),
            })
            .await
            .unwrap();
        let frame = conn.next_frame().await;
        assert_eq!(frame["action"], "sendMessage");
        assert_eq!(frame["uid"], "u1");

        conn.out
            .send(r##"{"#notice": "welcome"}"##.to_string())
            .unwrap();
        match next_event(&mut events).await {
            TransportEvent::Notice(notice) => assert_eq!(notice, "welcome"),
            other => panic!("unexpected event: {other:?}"),
        }

        conn.out
            .send(r#"{"sender": "u2", "text": "yo"}"#.to_string())
            .unwrap();
        match next_event(&mut events).await {
            TransportEvent::Message(value) => assert_eq!(value["text"], "yo"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_open() {
        let mut relay = TestRelay::start().await;
        let transport = transport_for(&relay);
        let (sink, mut events) = mpsc::unbounded_channel();
        transport.connect(sink.clone()).await.unwrap();
        let _conn = relay.accept().await;
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected
        ));
        transport.connect(sink).await.unwrap();
        assert_eq!(transport.state(), TransportState::Open);
        // No second socket was opened for the second connect call.
        assert!(
            timeout(Duration::from_millis(200), relay.conns.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn unclean_close_reconnects_and_rejoins_group() {
        let mut relay = TestRelay::start().await;
        let transport = transport_for(&relay);
        let (sink, mut events) = mpsc::unbounded_channel();
        transport.connect(sink).await.unwrap();
        let mut conn = relay.accept().await;
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected
        ));

        transport.join_group(Some("lobby".into())).await.unwrap();
        let frame = conn.next_frame().await;
        assert_eq!(frame["action"], "joinGroup");
        assert_eq!(frame["rid"], "lobby");

        conn.drop_socket();
        match next_event(&mut events).await {
            TransportEvent::Closed { reconnecting } => assert!(reconnecting),
            other => panic!("unexpected event: {other:?}"),
        }

        // The reconnect loop opens a fresh socket and replays membership.
        let mut conn = relay.accept().await;
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected
        ));
        let frame = conn.next_frame().await;
        assert_eq!(frame["action"], "joinGroup");
        assert_eq!(frame["rid"], "lobby");
        assert_eq!(transport.group(), Some("lobby".to_string()));
    }

    #[tokio::test]
    async fn exhausted_reconnects_close_the_transport_for_good() {
        let mut relay = TestRelay::start().await;
        let config = RealtimeConfig::new(relay.url.clone()).with_reconnect(2, 1, 10);
        let auth = Arc::new(StaticTokenProvider::new("tok", "user-1"));
        let transport = SignalingTransport::new(config, auth);
        let (sink, mut events) = mpsc::unbounded_channel();
        transport.connect(sink).await.unwrap();
        let mut conn = relay.accept().await;
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected
        ));

        // Take the relay down entirely, then drop the socket: attempt 1
        // fails, attempt 2 hits the bound.
        relay.accept_task.abort();
        conn.drop_socket();

        let mut saw_terminal_error = false;
        for _ in 0..4 {
            match next_event(&mut events).await {
                TransportEvent::Error(message)
                    if message.contains("reconnect attempts exhausted") =>
                {
                    saw_terminal_error = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_terminal_error);
        assert_eq!(transport.state(), TransportState::Closed);

        let err = transport
            .send(RelayRequest::SendMessage {
                uid: "u1".into(),
                content: json!("hi"),
                token: "tok".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
        let (sink, _events) = mpsc::unbounded_channel();
        let err = transport.connect(sink).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn clean_close_is_idempotent_and_resets_group() {
        let mut relay = TestRelay::start().await;
        let transport = transport_for(&relay);
        let (sink, mut events) = mpsc::unbounded_channel();
        transport.connect(sink).await.unwrap();
        let mut conn = relay.accept().await;
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected
        ));
        transport.join_group(Some("lobby".into())).await.unwrap();
        let _ = conn.next_frame().await;

        transport.close().await;
        match next_event(&mut events).await {
            TransportEvent::Closed { reconnecting } => assert!(!reconnecting),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(transport.state(), TransportState::Closed);
        assert_eq!(transport.group(), None);

        // Second close is a no-op.
        transport.close().await;
        assert_eq!(transport.state(), TransportState::Closed);

        // No reconnect was scheduled.
        assert!(
            timeout(Duration::from_millis(200), relay.conns.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn empty_recipient_is_rejected_before_send() {
        let relay = TestRelay::start().await;
        let transport = transport_for(&relay);
        let err = transport
            .send(RelayRequest::Broadcast {
                rid: "".into(),
                content: json!("hi"),
                token: "tok".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETER");
    }
}
