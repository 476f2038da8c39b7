/*
 * SPDX-FileCopyrightText: 2026 CareLink Health - CARELINK Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! `PeerLink` over webrtc-rs.

use std::sync::Arc;

use async_trait::async_trait;
use carelink_protocol::{IceCandidate, SdpKind};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::NegotiationError;
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::peer::{IceServer, IceState, LinkState, PeerEvent, PeerFactory, PeerLink, RemoteTrack};

fn map_link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => LinkState::New,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        RTCIceConnectionState::New | RTCIceConnectionState::Unspecified => IceState::New,
    }
}

fn to_rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone(),
            credential: s.credential.clone(),
            ..Default::default()
        })
        .collect()
}

fn codec_capability(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn nerr(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Failed(e.to_string())
}

pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

pub struct WebRtcFactory;

#[async_trait]
impl PeerFactory for WebRtcFactory {
    async fn open(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(nerr)?;
        let registry = Registry::new();
        let registry = register_default_interceptors(registry, &mut media_engine).map_err(nerr)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: to_rtc_ice_servers(ice_servers),
                ..Default::default()
            })
            .await
            .map_err(nerr)?;
        let pc = Arc::new(pc);

        {
            let tx = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(PeerEvent::Link(map_link_state(state))).await;
                })
            }));
        }
        {
            let tx = events.clone();
            pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(PeerEvent::Ice(map_ice_state(state))).await;
                })
            }));
        }
        {
            let tx = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx
                                .send(PeerEvent::Candidate(IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                    username_fragment: init.username_fragment,
                                }))
                                .await;
                        }
                        Err(e) => warn!(error = %e, "could not serialize local candidate"),
                    }
                })
            }));
        }
        {
            let tx = events;
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let tx = tx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        RTPCodecType::Unspecified => return,
                    };
                    let _ = tx
                        .send(PeerEvent::Track(RemoteTrack {
                            kind,
                            id: track.ssrc().to_string(),
                        }))
                        .await;
                })
            }));
        }

        Ok(Arc::new(WebRtcLink {
            pc,
            senders: Mutex::new(Vec::new()),
        }))
    }
}

impl WebRtcLink {
    fn sample_track(track: &MediaTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            codec_capability(track.kind()),
            track.label().to_string(),
            stream_id.to_string(),
        ))
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self, ice_restart: bool) -> Result<String, NegotiationError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await.map_err(nerr)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(nerr)?;
        Ok(answer.sdp)
    }

    async fn set_local(&self, kind: SdpKind, sdp: &str) -> Result<(), NegotiationError> {
        let desc = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(nerr)?;
        self.pc.set_local_description(desc).await.map_err(nerr)
    }

    async fn set_remote(&self, kind: SdpKind, sdp: &str) -> Result<(), NegotiationError> {
        let desc = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(nerr)?;
        self.pc.set_remote_description(desc).await.map_err(nerr)
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc.add_ice_candidate(init).await.map_err(nerr)
    }

    async fn attach_local_tracks(&self, stream: &MediaStream) -> Result<(), NegotiationError> {
        let mut senders = self.senders.lock().await;
        for track in stream.tracks() {
            let local = Self::sample_track(track, stream.id());
            let sender = self
                .pc
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(nerr)?;
            debug!(label = track.label(), "attached local track");
            senders.push(sender);
        }
        Ok(())
    }

    async fn replace_video_sender(&self, track: Arc<MediaTrack>) -> Result<(), NegotiationError> {
        if track.kind() != TrackKind::Video {
            return Err(NegotiationError::Failed(
                "replacement track is not video".to_string(),
            ));
        }
        let senders = self.senders.lock().await;
        for sender in senders.iter() {
            let is_video = match sender.track().await {
                Some(t) => t.kind() == RTPCodecType::Video,
                None => false,
            };
            if is_video {
                let local = Self::sample_track(&track, "replacement");
                sender
                    .replace_track(Some(local as Arc<dyn TrackLocal + Send + Sync>))
                    .await
                    .map_err(nerr)?;
                return Ok(());
            }
        }
        Err(NegotiationError::Failed(
            "no video sender to replace".to_string(),
        ))
    }

    async fn stop_senders(&self) {
        let senders = self.senders.lock().await;
        for sender in senders.iter() {
            if let Err(e) = sender.stop().await {
                debug!(error = %e, "sender stop");
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "peer connection close");
        }
    }
}
