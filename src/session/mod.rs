//! Peer sessions and the registry that owns them.
//!
//! One session per peer id: one underlying connection, one event sink, one
//! set of labeled data channels, one list of local media senders. The
//! registry is the single entry point for creating, looking up, and
//! destroying sessions, and owns the buffer of early-arriving negotiation
//! payloads on their behalf.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::error::{RealtimeError, Result};
use crate::events::{PeerEvent, PeerEventKind, PeerEventSink};
use crate::protocol::{CandidatePayload, PeerId, RtcContent, SdpPayload};
use crate::transport::SignalSender;

pub mod buffer;
pub mod channel;
pub mod media;

use buffer::SignalingBuffer;
use channel::ChannelRequest;
use media::LocalMedia;

/// One peer's connection, channels, sink, and media senders.
pub struct PeerSession {
    id: PeerId,
    pc: Arc<RTCPeerConnection>,
    channels: Mutex<HashMap<String, Arc<RTCDataChannel>>>,
    sink: Mutex<Option<PeerEventSink>>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    ringing: Mutex<Option<oneshot::Sender<bool>>>,
    auto_negotiate: AtomicBool,
    closed: AtomicBool,
    weak: Weak<Self>,
}

impl PeerSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Replaces any previously attached sink; there is no fan-out.
    pub fn attach_sink(&self, sink: PeerEventSink) {
        *self.sink.lock() = Some(sink);
    }

    pub fn channel_labels(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<RTCDataChannel>> {
        self.channels.lock().get(label).cloned()
    }

    pub fn has_channel(&self, label: &str) -> bool {
        self.channels.lock().contains_key(label)
    }

    pub(crate) fn emit(&self, kind: PeerEventKind) {
        if let Some(sink) = &*self.sink.lock() {
            let _ = sink.send(PeerEvent::new(self.id.clone(), kind));
        }
    }

    pub(crate) fn set_ringing(&self, resolver: oneshot::Sender<bool>) {
        *self.ringing.lock() = Some(resolver);
    }

    pub(crate) fn resolve_ringing(&self, picked_up: bool) {
        if let Some(resolver) = self.ringing.lock().take() {
            let _ = resolver.send(picked_up);
        }
    }

    pub(crate) fn enable_auto_negotiation(&self) {
        self.auto_negotiate.store(true, Ordering::SeqCst);
    }

    pub(crate) fn auto_negotiation_enabled(&self) -> bool {
        self.auto_negotiate.load(Ordering::SeqCst)
    }

    pub(crate) fn push_sender(&self, sender: Arc<RTCRtpSender>) {
        self.senders.lock().push(sender);
    }

    pub(crate) fn sender_count(&self) -> usize {
        self.senders.lock().len()
    }

    /// Registers a channel and wires its events to the sink. Returns false
    /// when a channel with the same label is already present, leaving the
    /// existing one untouched.
    pub(crate) async fn register_channel(&self, dc: Arc<RTCDataChannel>) -> bool {
        let label = dc.label().to_string();
        {
            let mut channels = self.channels.lock();
            if channels.contains_key(&label) {
                return false;
            }
            channels.insert(label.clone(), dc.clone());
        }
        self.wire_channel(label, dc).await;
        true
    }

    async fn wire_channel(&self, label: String, dc: Arc<RTCDataChannel>) {
        let weak = self.weak.clone();
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            let weak = weak.clone();
            let label = open_label.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    session.emit(PeerEventKind::ChannelOpen { label });
                }
            })
        }));

        let weak = self.weak.clone();
        let close_label = label.clone();
        dc.on_close(Box::new(move || {
            let weak = weak.clone();
            let label = close_label.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    session.emit(PeerEventKind::ChannelClose { label });
                }
            })
        }));

        let weak = self.weak.clone();
        let error_label = label.clone();
        dc.on_error(Box::new(move |err| {
            let weak = weak.clone();
            let label = error_label.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    session.emit(PeerEventKind::ChannelError {
                        label,
                        reason: err.to_string(),
                    });
                }
            })
        }));

        let weak = self.weak.clone();
        let message_label = label.clone();
        dc.on_message(Box::new(move |message| {
            let weak = weak.clone();
            let label = message_label.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    session.emit(PeerEventKind::ChannelMessage {
                        label,
                        data: message.data,
                        is_string: message.is_string,
                    });
                }
            })
        }));

        let weak = self.weak.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let weak = weak.clone();
            let label = label.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    session.emit(PeerEventKind::ChannelBufferedAmountLow { label });
                }
            })
        }))
        .await;
    }
}

/// Owner of every active peer session for one client instance.
pub struct PeerSessionRegistry {
    api: API,
    sessions: AsyncMutex<HashMap<PeerId, Arc<PeerSession>>>,
    signaler: Arc<dyn SignalSender>,
    buffers: Arc<SignalingBuffer>,
    default_ice_server: String,
    local_user: String,
    weak: Weak<Self>,
}

impl PeerSessionRegistry {
    pub fn new(
        signaler: Arc<dyn SignalSender>,
        buffers: Arc<SignalingBuffer>,
        default_ice_server: impl Into<String>,
        local_user: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(RealtimeError::transport)?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(RealtimeError::transport)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Arc::new_cyclic(|weak| Self {
            api,
            sessions: AsyncMutex::new(HashMap::new()),
            signaler,
            buffers,
            default_ice_server: default_ice_server.into(),
            local_user: local_user.into(),
            weak: weak.clone(),
        }))
    }

    pub fn buffers(&self) -> &Arc<SignalingBuffer> {
        &self.buffers
    }

    /// Returns the existing session for `id`, or builds a new connection
    /// configured with the single ICE server URL. The session map lock is
    /// held across construction so concurrent callers always converge on one
    /// instance.
    pub async fn create_or_get(
        &self,
        id: &str,
        ice_server_url: Option<&str>,
    ) -> Result<Arc<PeerSession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(id) {
            return Ok(existing.clone());
        }
        let ice = ice_server_url.unwrap_or(&self.default_ice_server);
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![ice.to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|err| RealtimeError::negotiation(id, err))?,
        );
        let session = Arc::new_cyclic(|weak| PeerSession {
            id: id.to_string(),
            pc,
            channels: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
            senders: Mutex::new(Vec::new()),
            ringing: Mutex::new(None),
            auto_negotiate: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            weak: weak.clone(),
        });
        self.wire_connection(&session);
        sessions.insert(id.to_string(), session.clone());
        tracing::debug!(target: "rtc", peer = %id, ice = %ice, "peer session created");
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<PeerId> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// One active sink per id; overwrites any prior sink.
    pub async fn attach_event_sink(&self, id: &str, sink: PeerEventSink) -> Result<()> {
        let session = self.get(id).await.ok_or_else(|| {
            RealtimeError::invalid_request(format!("no peer session for {id}"))
        })?;
        session.attach_sink(sink);
        Ok(())
    }

    /// Opens a labeled data channel on `id`'s session. Fails when the label
    /// is already taken, leaving the existing channel intact.
    pub async fn create_channel(
        &self,
        session: &Arc<PeerSession>,
        request: &ChannelRequest,
    ) -> Result<Arc<RTCDataChannel>> {
        if session.has_channel(&request.label) {
            return Err(RealtimeError::invalid_request(format!(
                "data channel '{}' already exists on {}",
                request.label, session.id
            )));
        }
        let init = request.init()?;
        let dc = session
            .pc
            .create_data_channel(&request.label, Some(init))
            .await
            .map_err(|err| RealtimeError::negotiation(&session.id, err))?;
        if !session.register_channel(dc.clone()).await {
            let _ = dc.close().await;
            return Err(RealtimeError::invalid_request(format!(
                "data channel '{}' already exists on {}",
                request.label, session.id
            )));
        }
        Ok(dc)
    }

    /// Adds each local track to the connection and records the senders for
    /// teardown. Senders belong to this session only.
    pub async fn attach_media(
        &self,
        session: &Arc<PeerSession>,
        media: &LocalMedia,
    ) -> Result<()> {
        for track in media.tracks() {
            let sender = session
                .pc
                .add_track(Arc::clone(track))
                .await
                .map_err(|err| RealtimeError::negotiation(&session.id, err))?;
            session.push_sender(sender);
        }
        Ok(())
    }

    /// Creates and sends a fresh offer for `session`.
    pub async fn send_offer(&self, session: &Arc<PeerSession>) -> Result<()> {
        let offer = session
            .pc
            .create_offer(None)
            .await
            .map_err(|err| RealtimeError::negotiation(&session.id, err))?;
        session
            .pc
            .set_local_description(offer)
            .await
            .map_err(|err| RealtimeError::negotiation(&session.id, err))?;
        let desc = session.pc.local_description().await.ok_or_else(|| {
            RealtimeError::negotiation(&session.id, "missing local description")
        })?;
        tracing::debug!(target: "rtc", peer = %session.id, "sending offer");
        self.signaler
            .send_rtc(
                &session.id,
                RtcContent::Offer {
                    sdpoffer: payload_from_description(&desc),
                },
            )
            .await
    }

    /// Creates and sends an answer for the remote description already set on
    /// `session`.
    pub async fn send_answer(&self, session: &Arc<PeerSession>) -> Result<()> {
        let answer = session
            .pc
            .create_answer(None)
            .await
            .map_err(|err| RealtimeError::negotiation(&session.id, err))?;
        session
            .pc
            .set_local_description(answer)
            .await
            .map_err(|err| RealtimeError::negotiation(&session.id, err))?;
        let desc = session.pc.local_description().await.ok_or_else(|| {
            RealtimeError::negotiation(&session.id, "missing local description")
        })?;
        tracing::debug!(target: "rtc", peer = %session.id, "sending answer");
        self.signaler
            .send_rtc(
                &session.id,
                RtcContent::Answer {
                    sdpanswer: payload_from_description(&desc),
                },
            )
            .await
    }

    pub async fn apply_remote_description(
        &self,
        session: &Arc<PeerSession>,
        payload: &SdpPayload,
    ) -> Result<()> {
        let desc = description_from_payload(payload)?;
        session
            .pc
            .set_remote_description(desc)
            .await
            .map_err(|err| RealtimeError::negotiation(&session.id, err))
    }

    pub async fn apply_candidate(
        &self,
        session: &Arc<PeerSession>,
        payload: CandidatePayload,
    ) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: None,
        };
        session
            .pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| RealtimeError::negotiation(&session.id, err))
    }

    /// Candidates may only be applied once a remote description is in place.
    pub async fn has_remote_description(&self, session: &Arc<PeerSession>) -> bool {
        session.pc.remote_description().await.is_some()
    }

    /// Tears down `id`'s session: channels, media senders, the connection
    /// (with a `hungup` notice when it was still alive), buffers, ringing.
    /// Idempotent; unknown ids only have their buffers cleared.
    pub async fn close(&self, id: &str) {
        let session = { self.sessions.lock().await.remove(id) };
        match session {
            Some(session) => self.teardown(session).await,
            None => self.buffers.clear_peer(id),
        }
    }

    /// Applies `close` to every registered id.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<PeerSession>> = {
            let mut map = self.sessions.lock().await;
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            self.teardown(session).await;
        }
    }

    async fn teardown(&self, session: Arc<PeerSession>) {
        if session.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channels: Vec<Arc<RTCDataChannel>> = {
            let mut map = session.channels.lock();
            map.drain().map(|(_, dc)| dc).collect()
        };
        for dc in channels {
            if dc.ready_state() != RTCDataChannelState::Closed {
                let _ = dc.close().await;
            }
        }
        let senders: Vec<Arc<RTCRtpSender>> = {
            let mut list = session.senders.lock();
            list.drain(..).collect()
        };
        for sender in senders {
            let _ = sender.stop().await;
        }
        if session.pc.connection_state() != RTCPeerConnectionState::Closed {
            if let Err(err) = self
                .signaler
                .send_rtc(
                    &session.id,
                    RtcContent::Hungup {
                        hungup: self.local_user.clone(),
                    },
                )
                .await
            {
                tracing::debug!(
                    target: "rtc",
                    peer = %session.id,
                    error = %err,
                    "hangup notice not delivered"
                );
            }
            let _ = session.pc.close().await;
        }
        session.resolve_ringing(false);
        self.buffers.clear_peer(&session.id);
        session.emit(PeerEventKind::ConnectionStateChange {
            state: RTCPeerConnectionState::Closed,
        });
        tracing::debug!(target: "rtc", peer = %session.id, "peer session closed");
    }

    /// Normalizes every connection-level event into the session's sink, and
    /// hooks the two events with side effects: gathered candidates go out
    /// over the transport, and terminal connection states tear the session
    /// down.
    fn wire_connection(&self, session: &Arc<PeerSession>) {
        let weak_session = Arc::downgrade(session);
        let weak_registry = self.weak.clone();
        session.pc.on_ice_candidate(Box::new(move |candidate| {
            let weak_session = weak_session.clone();
            let weak_registry = weak_registry.clone();
            Box::pin(async move {
                let Some(session) = weak_session.upgrade() else {
                    return;
                };
                let Some(candidate) = candidate else {
                    session.emit(PeerEventKind::IceCandidate { candidate: None });
                    return;
                };
                let payload = match candidate.to_json() {
                    Ok(init) => CandidatePayload {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    },
                    Err(err) => {
                        session.emit(PeerEventKind::IceCandidateError {
                            reason: err.to_string(),
                        });
                        return;
                    }
                };
                session.emit(PeerEventKind::IceCandidate {
                    candidate: Some(payload.candidate.clone()),
                });
                let Some(registry) = weak_registry.upgrade() else {
                    return;
                };
                if let Err(err) = registry
                    .signaler
                    .send_rtc(&session.id, RtcContent::Candidate { candidate: payload })
                    .await
                {
                    tracing::warn!(
                        target: "rtc",
                        peer = %session.id,
                        error = %err,
                        "candidate not delivered"
                    );
                    session.emit(PeerEventKind::Error {
                        reason: format!("candidate not delivered: {err}"),
                    });
                }
            })
        }));

        let weak_session = Arc::downgrade(session);
        let weak_registry = self.weak.clone();
        session
            .pc
            .on_peer_connection_state_change(Box::new(move |state| {
                let weak_session = weak_session.clone();
                let weak_registry = weak_registry.clone();
                Box::pin(async move {
                    let Some(session) = weak_session.upgrade() else {
                        return;
                    };
                    if session.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    session.emit(PeerEventKind::ConnectionStateChange { state });
                    if matches!(
                        state,
                        RTCPeerConnectionState::Disconnected
                            | RTCPeerConnectionState::Failed
                            | RTCPeerConnectionState::Closed
                    ) {
                        let Some(registry) = weak_registry.upgrade() else {
                            return;
                        };
                        tracing::debug!(
                            target: "rtc",
                            peer = %session.id,
                            ?state,
                            "terminal connection state"
                        );
                        registry.close(&session.id).await;
                    }
                })
            }));

        let weak_session = Arc::downgrade(session);
        session
            .pc
            .on_ice_connection_state_change(Box::new(move |state| {
                let weak_session = weak_session.clone();
                Box::pin(async move {
                    if let Some(session) = weak_session.upgrade() {
                        session.emit(PeerEventKind::IceConnectionStateChange { state });
                    }
                })
            }));

        let weak_session = Arc::downgrade(session);
        session
            .pc
            .on_ice_gathering_state_change(Box::new(move |state| {
                let weak_session = weak_session.clone();
                Box::pin(async move {
                    if let Some(session) = weak_session.upgrade() {
                        session.emit(PeerEventKind::IceGatheringStateChange { state });
                    }
                })
            }));

        let weak_session = Arc::downgrade(session);
        session.pc.on_signaling_state_change(Box::new(move |state| {
            let weak_session = weak_session.clone();
            Box::pin(async move {
                if let Some(session) = weak_session.upgrade() {
                    session.emit(PeerEventKind::SignalingStateChange { state });
                }
            })
        }));

        let weak_session = Arc::downgrade(session);
        session.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak_session = weak_session.clone();
            Box::pin(async move {
                if let Some(session) = weak_session.upgrade() {
                    session.emit(PeerEventKind::Track {
                        track_id: track.id(),
                        kind: track.kind().to_string(),
                    });
                }
            })
        }));

        let weak_session = Arc::downgrade(session);
        session.pc.on_data_channel(Box::new(move |dc| {
            let weak_session = weak_session.clone();
            Box::pin(async move {
                let Some(session) = weak_session.upgrade() else {
                    return;
                };
                tracing::debug!(
                    target: "rtc",
                    peer = %session.id,
                    label = %dc.label(),
                    "inbound data channel"
                );
                session.register_channel(dc).await;
            })
        }));

        let weak_session = Arc::downgrade(session);
        let weak_registry = self.weak.clone();
        session.pc.on_negotiation_needed(Box::new(move || {
            let weak_session = weak_session.clone();
            let weak_registry = weak_registry.clone();
            Box::pin(async move {
                let Some(session) = weak_session.upgrade() else {
                    return;
                };
                session.emit(PeerEventKind::NegotiationNeeded);
                if !session.auto_negotiate.load(Ordering::SeqCst) {
                    return;
                }
                let Some(registry) = weak_registry.upgrade() else {
                    return;
                };
                if let Err(err) = registry.send_offer(&session).await {
                    session.emit(PeerEventKind::Error {
                        reason: format!("renegotiation failed: {err}"),
                    });
                }
            })
        }));
    }
}

pub(crate) fn payload_from_description(desc: &RTCSessionDescription) -> SdpPayload {
    SdpPayload {
        kind: desc.sdp_type.to_string(),
        sdp: desc.sdp.clone(),
    }
}

pub(crate) fn description_from_payload(payload: &SdpPayload) -> Result<RTCSessionDescription> {
    match payload.kind.as_str() {
        "offer" => RTCSessionDescription::offer(payload.sdp.clone()),
        "answer" => RTCSessionDescription::answer(payload.sdp.clone()),
        other => {
            return Err(RealtimeError::invalid_parameter(format!(
                "unsupported sdp type: {other}"
            )));
        }
    }
    .map_err(|err| RealtimeError::invalid_parameter(format!("invalid sdp payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct RecordingSignaler {
        sent: Mutex<Vec<(String, RtcContent)>>,
    }

    impl RecordingSignaler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(String, RtcContent)> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl SignalSender for RecordingSignaler {
        async fn send_rtc(&self, uid: &str, content: RtcContent) -> Result<()> {
            self.sent.lock().push((uid.to_string(), content));
            Ok(())
        }
    }

    fn registry_with(signaler: Arc<RecordingSignaler>) -> Arc<PeerSessionRegistry> {
        PeerSessionRegistry::new(
            signaler,
            Arc::new(SignalingBuffer::new()),
            crate::config::DEFAULT_ICE_SERVER,
            "user-1",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_or_get_is_idempotent() {
        let registry = registry_with(RecordingSignaler::new());
        let first = registry.create_or_get("cid:a", None).await.unwrap();
        let second = registry.create_or_get("cid:a", None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        registry.close_all().await;
    }

    #[tokio::test]
    async fn concurrent_create_or_get_yields_one_session() {
        let registry = registry_with(RecordingSignaler::new());
        let (a, b) = tokio::join!(
            registry.create_or_get("cid:a", None),
            registry.create_or_get("cid:a", None)
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(registry.ids().await.len(), 1);
        registry.close_all().await;
    }

    #[tokio::test]
    async fn duplicate_channel_label_is_rejected() {
        let registry = registry_with(RecordingSignaler::new());
        let session = registry.create_or_get("cid:a", None).await.unwrap();
        let request = ChannelRequest::labeled("text-chat");
        registry.create_channel(&session, &request).await.unwrap();
        let err = registry
            .create_channel(&session, &request)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "INVALID_REQUEST");
        assert_eq!(session.channel_labels(), vec!["text-chat".to_string()]);
        registry.close_all().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_everything() {
        let signaler = RecordingSignaler::new();
        let registry = registry_with(signaler.clone());
        let session = registry.create_or_get("cid:a", None).await.unwrap();
        registry
            .create_channel(&session, &ChannelRequest::labeled("text-chat"))
            .await
            .unwrap();
        registry
            .attach_media(&session, &LocalMedia::dummy_video())
            .await
            .unwrap();
        assert_eq!(session.sender_count(), 1);

        registry.close("cid:a").await;
        assert!(registry.is_empty().await);
        assert!(session.channel_labels().is_empty());
        assert_eq!(session.sender_count(), 0);
        // The connection was still alive, so the remote side was notified.
        assert!(signaler.sent().iter().any(|(uid, content)| {
            uid == "cid:a" && matches!(content, RtcContent::Hungup { hungup } if hungup == "user-1")
        }));

        // Closing again, or closing an unknown id, is a no-op.
        registry.close("cid:a").await;
        registry.close("cid:never-opened").await;
    }

    #[tokio::test]
    async fn close_emits_a_final_state_change() {
        let registry = registry_with(RecordingSignaler::new());
        let session = registry.create_or_get("cid:a", None).await.unwrap();
        let (sink, mut events) = mpsc::unbounded_channel();
        session.attach_sink(sink);
        registry.close("cid:a").await;
        let mut saw_final = false;
        while let Ok(event) = events.try_recv() {
            if matches!(
                event.kind,
                PeerEventKind::ConnectionStateChange {
                    state: RTCPeerConnectionState::Closed
                }
            ) {
                saw_final = true;
            }
        }
        assert!(saw_final);
    }

    #[tokio::test]
    async fn close_all_empties_the_registry() {
        let registry = registry_with(RecordingSignaler::new());
        let a = registry.create_or_get("cid:a", None).await.unwrap();
        let b = registry.create_or_get("cid:b", None).await.unwrap();
        registry
            .create_channel(&a, &ChannelRequest::labeled("text-chat"))
            .await
            .unwrap();
        registry
            .create_channel(&b, &ChannelRequest::labeled("gaming"))
            .await
            .unwrap();
        registry.close_all().await;
        assert!(registry.is_empty().await);
        assert!(a.channel_labels().is_empty());
        assert!(b.channel_labels().is_empty());
    }

    #[tokio::test]
    async fn offers_go_out_through_the_signaler() {
        let signaler = RecordingSignaler::new();
        let registry = registry_with(signaler.clone());
        let session = registry.create_or_get("cid:a", None).await.unwrap();
        registry
            .create_channel(&session, &ChannelRequest::labeled("text-chat"))
            .await
            .unwrap();
        registry.send_offer(&session).await.unwrap();
        // Candidate traffic may already be interleaved; look for the offer.
        let offer = signaler
            .sent()
            .into_iter()
            .find_map(|(uid, content)| match content {
                RtcContent::Offer { sdpoffer } if uid == "cid:a" => Some(sdpoffer),
                _ => None,
            })
            .expect("offer was sent");
        assert_eq!(offer.kind, "offer");
        assert!(offer.sdp.contains("v=0"));
        registry.close_all().await;
    }

    #[test]
    fn sdp_payload_roundtrip_rejects_unknown_types() {
        let err = description_from_payload(&SdpPayload {
            kind: "rollback".into(),
            sdp: String::new(),
        })
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETER");
    }
}
