/*
 * SPDX-FileCopyrightText: 2026 CareLink Health - CARELINK Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Seam around the native negotiation object.
//!
//! The session state machine talks to this trait, never to webrtc types
//! directly; `rtc` provides the production implementation and tests
//! substitute a scripted one. The link is created exactly once per
//! session and closed exactly once, always by the session's teardown
//! path - observers (the connection monitor) never close it.

use std::sync::Arc;

use async_trait::async_trait;
use carelink_protocol::{IceCandidate, SdpKind};
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::media::{MediaStream, MediaTrack, TrackKind};

#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Overall connection state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// State of the negotiation-transport sub-component. Failure here is
/// recoverable with an in-place restart, unlike overall link failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub id: String,
}

/// Everything the link reports back to its owning session.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Link(LinkState),
    Ice(IceState),
    Candidate(IceCandidate),
    Track(RemoteTrack),
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Produces a raw offer description. `ice_restart` requests new
    /// transport credentials for an in-place recovery.
    async fn create_offer(&self, ice_restart: bool) -> Result<String, NegotiationError>;
    async fn create_answer(&self) -> Result<String, NegotiationError>;
    async fn set_local(&self, kind: SdpKind, sdp: &str) -> Result<(), NegotiationError>;
    async fn set_remote(&self, kind: SdpKind, sdp: &str) -> Result<(), NegotiationError>;
    /// Best-effort: the session logs and ignores individual failures.
    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError>;
    async fn attach_local_tracks(&self, stream: &MediaStream) -> Result<(), NegotiationError>;
    /// Swaps the outgoing video sender's source without renegotiating.
    async fn replace_video_sender(&self, track: Arc<MediaTrack>) -> Result<(), NegotiationError>;
    async fn stop_senders(&self);
    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn open(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError>;
}
