/*
 * SPDX-FileCopyrightText: 2026 CareLink Health - CARELINK Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use thiserror::Error;

/// Media acquisition failures surfaced to the user. Everything else the
/// acquisition ladder can degrade around (missing camera, no devices at
/// all) is not an error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,
    #[error("requested capture device not found")]
    DeviceNotFound,
    #[error("capture device is busy or unreadable")]
    DeviceBusy,
    #[error("media acquisition failed: {0}")]
    Unknown(String),
}

impl MediaError {
    /// Remedial message shown on the call screen.
    pub fn user_message(&self) -> String {
        match self {
            MediaError::PermissionDenied => {
                "Camera and microphone access denied. Please allow access and try again."
                    .to_string()
            }
            MediaError::DeviceNotFound => {
                "No camera or microphone found. Please connect your devices and try again."
                    .to_string()
            }
            MediaError::DeviceBusy => {
                "Camera or microphone is being used by another application. Please close other apps and try again."
                    .to_string()
            }
            MediaError::Unknown(detail) => format!("Unable to access camera or microphone: {detail}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("timed out waiting for subscribe acknowledgment on {topic}")]
    SubscribeTimeout { topic: String },
    #[error("relay error: {0}")]
    Relay(#[from] anyhow::Error),
}

/// Failures of the native negotiation object. The repair pipeline keeps
/// malformed descriptions out of here; what remains is state or transport
/// level and handled by the session's own recovery paths.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer connection is closed")]
    Closed,
    #[error("negotiation failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

impl CallError {
    /// The human-readable reason recorded on a `Failed` transition.
    pub fn user_reason(&self) -> String {
        match self {
            CallError::Media(e) => e.user_message(),
            CallError::Signal(SignalError::SubscribeTimeout { .. }) => {
                "Could not reach the call service. Please check your connection and try again."
                    .to_string()
            }
            CallError::Signal(e) => format!("Call service error: {e}"),
            CallError::Negotiation(_) => {
                "Failed to establish connection. Please try again.".to_string()
            }
        }
    }
}
