//! Local media attached to a peer session.
//!
//! Actual capture and encoding live outside this crate; callers hand over
//! ready-made local tracks. When a call requests no media at all, a silent
//! placeholder video track can stand in so both sides negotiate a symmetric
//! SDP (see `RealtimeConfig::use_dummy_track_if_no_media`).

use std::sync::Arc;

use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub const DUMMY_TRACK_ID: &str = "lagoon-dummy-video";

/// The tracks one session will offer to its remote peer.
#[derive(Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    dummy: bool,
}

impl LocalMedia {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_tracks(tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self {
            tracks,
            dummy: false,
        }
    }

    /// A 1x1 silent video placeholder: the track advertises a video section
    /// in the SDP but never produces samples.
    pub fn dummy_video() -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: Vec::new(),
            },
            DUMMY_TRACK_ID.to_owned(),
            "lagoon-dummy".to_owned(),
        ));
        Self {
            tracks: vec![track],
            dummy: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn is_dummy(&self) -> bool {
        self.dummy
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("tracks", &self.tracks.len())
            .field("dummy", &self.dummy)
            .finish()
    }
}
