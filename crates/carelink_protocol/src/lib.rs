/*
 * SPDX-FileCopyrightText: 2026 CareLink Health - CARELINK Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// Media profile of a call, fixed at session creation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    Audio,
    Video,
}

impl CallMode {
    pub fn wants_video(&self) -> bool {
        matches!(self, CallMode::Video)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// One side's proposed media configuration, as relayed over signaling.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// A discovered network path proposed for the peer-to-peer connection.
/// Field names follow the browser `RTCIceCandidateInit` JSON shape so the
/// two ends can interoperate regardless of which produced the record.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// In-call signaling, one topic per conversation.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer {
        from: String,
        sdp: SessionDescription,
    },
    Answer {
        from: String,
        sdp: SessionDescription,
    },
    Ice {
        from: String,
        candidate: IceCandidate,
    },
    Bye {
        from: String,
    },
}

impl SignalMessage {
    /// Sender identity, used for echo suppression on the receiving side.
    pub fn from_id(&self) -> &str {
        match self {
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::Ice { from, .. }
            | SignalMessage::Bye { from } => from,
        }
    }
}

/// Out-of-band notifications on a participant's personal topic. These are
/// distinct from in-call signaling: the sender subscribes, publishes and
/// leaves rather than staying joined.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum RingMessage {
    Invite {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "fromId")]
        from_id: String,
        #[serde(rename = "fromName")]
        from_name: String,
        mode: CallMode,
    },
    Bye {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "fromId")]
        from_id: String,
    },
}
