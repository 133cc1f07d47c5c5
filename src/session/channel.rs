//! Labeled data-channel configuration.
//!
//! Six named presets cover the common traffic shapes; a caller-supplied
//! options object bypasses presets entirely.

use webrtc::data_channel::data_channel_init::RTCDataChannelInit;

use crate::error::{RealtimeError, Result};

/// Delivery profile for a labeled data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelReliability {
    /// Ordered, fully retransmitted (TCP-like).
    Reliable,
    /// Unordered, bounded loss (UDP-like).
    Unreliable {
        max_retransmits: Option<u16>,
        max_packet_lifetime: Option<u16>,
    },
}

/// Named channel presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelProfile {
    TextChat,
    FileTransfer,
    VideoChat,
    VoiceChat,
    Gaming,
    Default,
}

impl ChannelProfile {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelProfile::TextChat => "text-chat",
            ChannelProfile::FileTransfer => "file-transfer",
            ChannelProfile::VideoChat => "video-chat",
            ChannelProfile::VoiceChat => "voice-chat",
            ChannelProfile::Gaming => "gaming",
            ChannelProfile::Default => "default",
        }
    }

    /// Profile for a label; unrecognized labels get the default profile.
    pub fn from_label(label: &str) -> Self {
        match label {
            "text-chat" => ChannelProfile::TextChat,
            "file-transfer" => ChannelProfile::FileTransfer,
            "video-chat" => ChannelProfile::VideoChat,
            "voice-chat" => ChannelProfile::VoiceChat,
            "gaming" => ChannelProfile::Gaming,
            _ => ChannelProfile::Default,
        }
    }

    pub fn reliability(&self) -> ChannelReliability {
        match self {
            ChannelProfile::TextChat | ChannelProfile::FileTransfer | ChannelProfile::Default => {
                ChannelReliability::Reliable
            }
            // Frames are useless once stale; bound their lifetime instead of
            // retransmitting.
            ChannelProfile::VideoChat => ChannelReliability::Unreliable {
                max_retransmits: None,
                max_packet_lifetime: Some(120),
            },
            ChannelProfile::VoiceChat => ChannelReliability::Unreliable {
                max_retransmits: None,
                max_packet_lifetime: Some(60),
            },
            ChannelProfile::Gaming => ChannelReliability::Unreliable {
                max_retransmits: Some(0),
                max_packet_lifetime: None,
            },
        }
    }

    pub fn init(&self) -> RTCDataChannelInit {
        match self.reliability() {
            ChannelReliability::Reliable => RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            },
            ChannelReliability::Unreliable {
                max_retransmits,
                max_packet_lifetime,
            } => RTCDataChannelInit {
                ordered: Some(false),
                max_retransmits,
                max_packet_life_time: max_packet_lifetime,
                ..Default::default()
            },
        }
    }
}

/// Caller-supplied channel options; when present, presets are ignored.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    pub ordered: Option<bool>,
    pub max_retransmits: Option<u16>,
    pub max_packet_lifetime: Option<u16>,
}

impl ChannelOptions {
    /// Retransmit count and packet lifetime are mutually exclusive bounds.
    pub fn validate(&self) -> Result<()> {
        if self.max_retransmits.is_some() && self.max_packet_lifetime.is_some() {
            return Err(RealtimeError::invalid_parameter(
                "channel options cannot set both max_retransmits and max_packet_lifetime",
            ));
        }
        Ok(())
    }

    pub fn into_init(self) -> RTCDataChannelInit {
        RTCDataChannelInit {
            ordered: self.ordered,
            max_retransmits: self.max_retransmits,
            max_packet_life_time: self.max_packet_lifetime,
            ..Default::default()
        }
    }
}

/// Request to open one labeled channel on a session.
#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub label: String,
    pub options: Option<ChannelOptions>,
}

impl ChannelRequest {
    pub fn preset(profile: ChannelProfile) -> Self {
        Self {
            label: profile.label().to_string(),
            options: None,
        }
    }

    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            options: None,
        }
    }

    pub fn custom(label: impl Into<String>, options: ChannelOptions) -> Self {
        Self {
            label: label.into(),
            options: Some(options),
        }
    }

    /// Resolved channel init: explicit options win, otherwise the preset for
    /// the label.
    pub fn init(&self) -> Result<RTCDataChannelInit> {
        match &self.options {
            Some(options) => {
                options.validate()?;
                Ok(options.clone().into_init())
            }
            None => Ok(ChannelProfile::from_label(&self.label).init()),
        }
    }
}
