//! Caller- and receiver-facing call flow: ringing, pickup, teardown.
//!
//! A placed call sends an offer and pends until the callee picks up; the
//! callee's side buffers whatever negotiation traffic arrives before it
//! answers, then flushes offers first and candidates second. Either side can
//! hang up at any point, which funnels into the registry's teardown.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use webrtc::data_channel::RTCDataChannel;

use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, Result};
use crate::events::{PeerEventKind, PeerEventSink};
use crate::protocol::{CID_PREFIX, CandidatePayload, PeerId, RtcContent, RtcInbound, SdpPayload};
use crate::session::buffer::BufferKind;
use crate::session::channel::ChannelRequest;
use crate::session::media::LocalMedia;
use crate::session::{PeerSession, PeerSessionRegistry};
use crate::transport::SignalSender;

/// Parameters for placing or answering a call.
#[derive(Debug, Clone, Default)]
pub struct CallParams {
    pub ice_server_url: Option<String>,
    pub media: LocalMedia,
    pub channels: Vec<ChannelRequest>,
}

impl CallParams {
    pub fn with_ice_server(mut self, url: impl Into<String>) -> Self {
        self.ice_server_url = Some(url.into());
        self
    }

    pub fn with_media(mut self, media: LocalMedia) -> Self {
        self.media = media;
        self
    }

    pub fn with_channel(mut self, request: ChannelRequest) -> Self {
        self.channels.push(request);
        self
    }
}

/// A connected (or answered) call.
pub struct Session {
    target: PeerId,
    session: Arc<PeerSession>,
    media: LocalMedia,
    orchestrator: Arc<CallOrchestrator>,
}

impl Session {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn channels(&self) -> Vec<String> {
        self.session.channel_labels()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<RTCDataChannel>> {
        self.session.channel(label)
    }

    pub fn media(&self) -> &LocalMedia {
        &self.media
    }

    pub async fn hangup(&self) {
        self.orchestrator.close(&self.target).await;
    }
}

/// A placed call that has not been picked up yet.
pub struct OutboundCall {
    target: PeerId,
    media: LocalMedia,
    connected: oneshot::Receiver<bool>,
    orchestrator: Arc<CallOrchestrator>,
}

impl std::fmt::Debug for OutboundCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundCall")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl OutboundCall {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Rejects the call locally and tears down the half-open session. The
    /// `connection` future then resolves to `None`.
    pub async fn hangup(&self) {
        self.orchestrator.close(&self.target).await;
    }

    /// Resolves once the callee signals pickup; `None` when the call was
    /// hung up or the session died first. There is no ringing timeout.
    pub async fn connection(self) -> Option<Session> {
        match self.connected.await {
            Ok(true) => {
                let session = self.orchestrator.registry.get(&self.target).await?;
                Some(Session {
                    target: self.target,
                    session,
                    media: self.media,
                    orchestrator: self.orchestrator,
                })
            }
            _ => None,
        }
    }
}

/// The answering side of a pending ring, handed out by `respond` exactly
/// once per ring.
pub struct Answerer {
    target: PeerId,
    orchestrator: Arc<CallOrchestrator>,
}

impl Answerer {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Picks up: applies everything buffered for the caller (offers first,
    /// then candidates), notifies the caller, and hands back the live
    /// session.
    pub async fn answer(self, params: CallParams, sink: PeerEventSink) -> Result<Session> {
        let orchestrator = self.orchestrator;
        let media = orchestrator.resolve_media(params.media)?;
        let session = orchestrator
            .registry
            .create_or_get(&self.target, params.ice_server_url.as_deref())
            .await?;
        session.attach_sink(sink);
        let pickup = async {
            orchestrator.registry.attach_media(&session, &media).await?;
            for request in &params.channels {
                orchestrator.registry.create_channel(&session, request).await?;
            }
            orchestrator.flush_offers(&session).await;
            orchestrator.flush_candidates(&session).await;
            orchestrator
                .signaler
                .send_rtc(
                    &self.target,
                    RtcContent::Pickup {
                        pickup: orchestrator.local_user.clone(),
                    },
                )
                .await
        };
        if let Err(err) = pickup.await {
            orchestrator.close(&self.target).await;
            return Err(err);
        }
        session.enable_auto_negotiation();
        tracing::info!(target: "rtc", peer = %self.target, "call answered");
        Ok(Session {
            target: self.target,
            session,
            media,
            orchestrator: Arc::clone(&orchestrator),
        })
    }

    /// Declines the ring; equivalent to closing the half-open session.
    pub async fn reject(self) {
        self.orchestrator.close(&self.target).await;
    }
}

pub struct CallOrchestrator {
    registry: Arc<PeerSessionRegistry>,
    signaler: Arc<dyn SignalSender>,
    config: RealtimeConfig,
    local_user: String,
    pending_rings: Mutex<HashSet<PeerId>>,
    weak: Weak<Self>,
}

impl CallOrchestrator {
    pub fn new(
        registry: Arc<PeerSessionRegistry>,
        signaler: Arc<dyn SignalSender>,
        config: RealtimeConfig,
        local_user: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry,
            signaler,
            config,
            local_user: local_user.into(),
            pending_rings: Mutex::new(HashSet::new()),
            weak: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("orchestrator is alive while borrowed")
    }

    pub fn registry(&self) -> &Arc<PeerSessionRegistry> {
        &self.registry
    }

    /// Places a call to `cid`. Sends the initial offer and returns a handle
    /// whose `connection` future pends until pickup. Auto-renegotiation stays
    /// off until the callee picks up.
    pub async fn place_call(
        &self,
        cid: &str,
        params: CallParams,
        sink: PeerEventSink,
    ) -> Result<OutboundCall> {
        if !cid.starts_with(CID_PREFIX) {
            return Err(RealtimeError::invalid_parameter(format!(
                "connection id must be prefixed '{CID_PREFIX}'"
            )));
        }
        let media = self.resolve_media(params.media)?;
        let session = self
            .registry
            .create_or_get(cid, params.ice_server_url.as_deref())
            .await?;
        session.attach_sink(sink);
        let (resolver, connected) = oneshot::channel();
        session.set_ringing(resolver);
        if let Err(err) = self.setup_and_offer(&session, &media, &params.channels).await {
            // Leave no half-open session behind a failed placement.
            self.close(cid).await;
            return Err(err);
        }
        tracing::info!(target: "rtc", peer = %cid, "call placed; ringing");
        Ok(OutboundCall {
            target: cid.to_string(),
            media,
            connected,
            orchestrator: self.arc(),
        })
    }

    /// Consumes a pending ring for the message's sender. `None` when the
    /// message is not an offer or no ring is pending (already consumed,
    /// rejected, or never rang) — with no side effects.
    pub fn respond(&self, message: &Value) -> Option<Answerer> {
        let inbound = RtcInbound::from_value(message)?;
        if !matches!(inbound.content, RtcContent::Offer { .. }) {
            return None;
        }
        if !self.pending_rings.lock().remove(&inbound.sender_cid) {
            return None;
        }
        Some(Answerer {
            target: inbound.sender_cid,
            orchestrator: self.arc(),
        })
    }

    /// Closes one peer's session (ring included). Idempotent.
    pub async fn close(&self, cid: &str) {
        self.pending_rings.lock().remove(cid);
        self.registry.close(cid).await;
    }

    /// Closes every session and forgets every pending ring.
    pub async fn close_all(&self) {
        self.pending_rings.lock().clear();
        self.registry.close_all().await;
    }

    /// Routes one inbound rtc-action message.
    pub(crate) async fn handle_rtc(&self, inbound: RtcInbound) {
        let sender = inbound.sender_cid.clone();
        match inbound.content {
            RtcContent::Offer { sdpoffer } => self.handle_offer(&sender, sdpoffer).await,
            RtcContent::Answer { sdpanswer } => self.handle_answer(&sender, sdpanswer).await,
            RtcContent::Candidate { candidate } => self.handle_candidate(&sender, candidate).await,
            RtcContent::Pickup { pickup } => self.handle_pickup(&sender, &pickup).await,
            RtcContent::Hungup { hungup } => {
                tracing::info!(target: "rtc", peer = %sender, user = %hungup, "remote hangup");
                self.close(&sender).await;
            }
        }
    }

    async fn setup_and_offer(
        &self,
        session: &Arc<PeerSession>,
        media: &LocalMedia,
        channels: &[ChannelRequest],
    ) -> Result<()> {
        self.registry.attach_media(session, media).await?;
        for request in channels {
            self.registry.create_channel(session, request).await?;
        }
        self.registry.send_offer(session).await
    }

    async fn handle_offer(&self, sender: &str, payload: SdpPayload) {
        if let Some(session) = self.registry.get(sender).await {
            // Renegotiation on a picked-up session is applied and answered
            // right away; anything earlier waits for the callee.
            if session.auto_negotiation_enabled() {
                if let Err(err) = self.apply_offer_and_answer(&session, &payload).await {
                    session.emit(PeerEventKind::Error {
                        reason: format!("renegotiation offer failed: {err}"),
                    });
                }
                return;
            }
        }
        self.registry.buffers().enqueue(
            BufferKind::Offer,
            sender,
            serde_json::to_value(&payload).unwrap_or(Value::Null),
        );
        let newly_ringing = self.pending_rings.lock().insert(sender.to_string());
        if newly_ringing {
            tracing::info!(target: "rtc", peer = %sender, "incoming call ringing");
        }
    }

    async fn apply_offer_and_answer(
        &self,
        session: &Arc<PeerSession>,
        payload: &SdpPayload,
    ) -> Result<()> {
        self.registry.apply_remote_description(session, payload).await?;
        self.registry.send_answer(session).await?;
        self.flush_candidates(session).await;
        Ok(())
    }

    async fn handle_answer(&self, sender: &str, payload: SdpPayload) {
        let Some(session) = self.registry.get(sender).await else {
            tracing::warn!(target: "rtc", peer = %sender, "answer for unknown session; dropped");
            return;
        };
        if let Err(err) = self
            .registry
            .apply_remote_description(&session, &payload)
            .await
        {
            session.emit(PeerEventKind::Error {
                reason: format!("answer could not be applied: {err}"),
            });
            return;
        }
        self.flush_candidates(&session).await;
    }

    async fn handle_candidate(&self, sender: &str, payload: CandidatePayload) {
        if let Some(session) = self.registry.get(sender).await {
            if self.registry.has_remote_description(&session).await {
                if let Err(err) = self.registry.apply_candidate(&session, payload).await {
                    session.emit(PeerEventKind::IceCandidateError {
                        reason: err.to_string(),
                    });
                }
                return;
            }
        }
        // No session yet, or no remote description: hold the candidate.
        self.registry.buffers().enqueue(
            BufferKind::Ice,
            sender,
            serde_json::to_value(&payload).unwrap_or(Value::Null),
        );
    }

    async fn handle_pickup(&self, sender: &str, user: &str) {
        let Some(session) = self.registry.get(sender).await else {
            tracing::warn!(target: "rtc", peer = %sender, "pickup for unknown session; dropped");
            return;
        };
        tracing::info!(target: "rtc", peer = %sender, user = %user, "call picked up");
        session.enable_auto_negotiation();
        session.resolve_ringing(true);
    }

    /// Applies every buffered offer for `session` in arrival order, sending
    /// one answer per applied offer.
    async fn flush_offers(&self, session: &Arc<PeerSession>) {
        let registry = Arc::clone(&self.registry);
        let session_ref = Arc::clone(session);
        let results = self
            .registry
            .buffers()
            .drain_into(BufferKind::Offer, session.id(), move |item| {
                let registry = Arc::clone(&registry);
                let session = Arc::clone(&session_ref);
                async move {
                    let payload: SdpPayload = serde_json::from_value(item).map_err(|err| {
                        RealtimeError::invalid_parameter(format!(
                            "malformed buffered offer: {err}"
                        ))
                    })?;
                    registry.apply_remote_description(&session, &payload).await?;
                    registry.send_answer(&session).await
                }
            })
            .await;
        for err in results.into_iter().filter_map(Result::err) {
            session.emit(PeerEventKind::Error {
                reason: format!("buffered offer failed: {err}"),
            });
        }
    }

    /// Applies every buffered candidate for `session` in arrival order. Only
    /// called after a remote description is in place.
    async fn flush_candidates(&self, session: &Arc<PeerSession>) {
        let registry = Arc::clone(&self.registry);
        let session_ref = Arc::clone(session);
        let results = self
            .registry
            .buffers()
            .drain_into(BufferKind::Ice, session.id(), move |item| {
                let registry = Arc::clone(&registry);
                let session = Arc::clone(&session_ref);
                async move {
                    let payload: CandidatePayload =
                        serde_json::from_value(item).map_err(|err| {
                            RealtimeError::invalid_parameter(format!(
                                "malformed buffered candidate: {err}"
                            ))
                        })?;
                    registry.apply_candidate(&session, payload).await
                }
            })
            .await;
        for err in results.into_iter().filter_map(Result::err) {
            session.emit(PeerEventKind::IceCandidateError {
                reason: err.to_string(),
            });
        }
    }

    /// Applies the secure-context gate to caller media and substitutes the
    /// placeholder track when configured and nothing was requested.
    fn resolve_media(&self, media: LocalMedia) -> Result<LocalMedia> {
        if !media.is_empty() {
            if !self.config.is_secure_context() {
                return Err(RealtimeError::invalid_request(
                    "media requires a secure relay context (wss or loopback)",
                ));
            }
            return Ok(media);
        }
        if self.config.use_dummy_track_if_no_media {
            Ok(LocalMedia::dummy_video())
        } else {
            Ok(LocalMedia::none())
        }
    }
}
