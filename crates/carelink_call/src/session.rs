/*
 * SPDX-FileCopyrightText: 2026 CareLink Health - CARELINK Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The call session state machine.
//!
//! One actor task per call page. Everything reaches the session as an
//! event: handle commands, decoded signals, peer link events and the
//! single pending timer. The session exclusively owns the local stream
//! and the peer link; teardown is idempotent and is the only path that
//! closes either.

use std::sync::Arc;

use carelink_protocol::{
    CallMode, IceCandidate, RingMessage, SdpKind, SessionDescription, SignalMessage,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::CallConfig;
use crate::error::{CallError, NegotiationError};
use crate::history::{track_event, track_status, CallPhase, CallRecord, CallTracker};
use crate::media::{Acquired, AudioLevelMeter, MediaDevices, MediaManager, MediaTrack};
use crate::metrics::CallMetrics;
use crate::monitor::{LinkMonitor, Verdict};
use crate::peer::{PeerEvent, PeerFactory, PeerLink, RemoteTrack};
use crate::sdp;
use crate::signaling::{notify_user, CallChannel, SignalingRelay};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Caller initiates the offer; callee only answers. Fixed for the
/// session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing,
    Connecting,
    Connected,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }
}

/// Externally visible session snapshot; the UI is a pure subscriber.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub state: CallState,
    /// Human-readable reason, set on `Failed`.
    pub reason: Option<String>,
    pub muted: bool,
    pub camera_off: bool,
    pub degraded_media: bool,
    pub placeholder_media: bool,
    pub connected_at_ms: Option<u64>,
    pub remote_tracks: usize,
}

impl CallSnapshot {
    fn idle() -> Self {
        Self {
            state: CallState::Idle,
            reason: None,
            muted: false,
            camera_off: false,
            degraded_media: false,
            placeholder_media: false,
            connected_at_ms: None,
            remote_tracks: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub conversation_id: String,
    pub self_id: String,
    pub self_name: String,
    pub peer_id: String,
    pub peer_name: String,
    pub role: CallRole,
    pub mode: CallMode,
}

enum Command {
    ToggleMute,
    ToggleCamera,
    ReplaceVideoTrack(Arc<MediaTrack>),
    HangUp,
}

/// UI-facing handle. Dropping it triggers the same idempotent teardown
/// as `hang_up`, which is how page unload is wired.
pub struct CallHandle {
    cmd_tx: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    pub async fn toggle_mute(&self) {
        let _ = self.cmd_tx.send(Command::ToggleMute).await;
    }

    pub async fn toggle_camera(&self) {
        let _ = self.cmd_tx.send(Command::ToggleCamera).await;
    }

    pub async fn replace_video_track(&self, track: Arc<MediaTrack>) {
        let _ = self.cmd_tx.send(Command::ReplaceVideoTrack(track)).await;
    }

    /// Safe from any state; a second call is a no-op.
    pub async fn hang_up(&self) {
        let _ = self.cmd_tx.send(Command::HangUp).await;
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_rx.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Caller: answer/transport-connect wait.
    Connect,
    /// Callee: initial offer wait.
    Offer,
}

pub struct CallSession;

impl CallSession {
    /// Joins the conversation's signaling topic and spawns the session
    /// actor. A subscribe timeout on the in-call topic is fatal to
    /// session start, unlike the ring notification's.
    pub async fn start(
        params: SessionParams,
        config: CallConfig,
        relay: Arc<dyn SignalingRelay>,
        peers: Arc<dyn PeerFactory>,
        devices: Arc<dyn MediaDevices>,
        tracker: Arc<dyn CallTracker>,
        metrics: Arc<CallMetrics>,
    ) -> Result<CallHandle, CallError> {
        let channel =
            CallChannel::join(relay.clone(), &params.conversation_id, config.subscribe_timeout())
                .await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (peer_tx, peer_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::idle());

        let session = Session {
            params,
            config,
            relay,
            channel,
            channel_open: true,
            peers,
            media: MediaManager::new(devices),
            tracker,
            metrics,
            peer: None,
            peer_tx,
            local: None,
            remote: Vec::new(),
            meter: None,
            monitor: LinkMonitor::new(),
            pending: None,
            snapshot: CallSnapshot::idle(),
            snapshot_tx,
            bye_sent: false,
            torn_down: false,
        };
        tokio::spawn(session.run(cmd_rx, peer_rx));

        Ok(CallHandle {
            cmd_tx,
            snapshot_rx,
        })
    }
}

struct Session {
    params: SessionParams,
    config: CallConfig,
    relay: Arc<dyn SignalingRelay>,
    channel: CallChannel,
    channel_open: bool,
    peers: Arc<dyn PeerFactory>,
    media: MediaManager,
    tracker: Arc<dyn CallTracker>,
    metrics: Arc<CallMetrics>,
    peer: Option<Arc<dyn PeerLink>>,
    peer_tx: mpsc::Sender<PeerEvent>,
    local: Option<Acquired>,
    remote: Vec<RemoteTrack>,
    meter: Option<AudioLevelMeter>,
    monitor: LinkMonitor,
    pending: Option<(TimerKind, Instant)>,
    snapshot: CallSnapshot,
    snapshot_tx: watch::Sender<CallSnapshot>,
    bye_sent: bool,
    torn_down: bool,
}

impl Session {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut peer_rx: mpsc::Receiver<PeerEvent>,
    ) {
        if let Err(e) = self.begin().await {
            let reason = e.user_reason();
            warn!(error = %e, "session start failed");
            self.fail(reason, CallPhase::Ended).await;
        }

        while !self.snapshot.state.is_terminal() {
            let deadline = self.pending.map(|(_, at)| at);
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    // Handle dropped: page unload. Same teardown, with a
                    // best-effort bye on the way out.
                    None => self.end(true).await,
                },
                msg = self.channel.recv(), if self.channel_open => match msg {
                    Some(msg) => self.on_signal(msg).await,
                    None => {
                        warn!("signaling subscription lost");
                        self.channel_open = false;
                    }
                },
                Some(event) = peer_rx.recv() => self.on_peer_event(event).await,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() => self.on_timeout().await,
            }
        }
        debug!(state = ?self.snapshot.state, "session loop finished");
    }

    // ---- start -----------------------------------------------------------

    async fn begin(&mut self) -> Result<(), CallError> {
        self.metrics.session_started();
        match self.params.role {
            CallRole::Caller => self.begin_caller().await,
            CallRole::Callee => {
                self.arm_timer(TimerKind::Offer, self.config.offer_timeout());
                info!(conversation = %self.params.conversation_id, "waiting for offer");
                Ok(())
            }
        }
    }

    async fn begin_caller(&mut self) -> Result<(), CallError> {
        track_event(
            self.tracker.clone(),
            CallRecord {
                conversation_id: self.params.conversation_id.clone(),
                caller_id: self.params.self_id.clone(),
                callee_id: self.params.peer_id.clone(),
                caller_name: self.params.self_name.clone(),
                callee_name: self.params.peer_name.clone(),
                call_type: self.params.mode,
                status: CallPhase::Initiated,
                started_at_ms: now_ms(),
            },
        );
        self.set_state(CallState::Connecting, None);

        let acquired = self.media.acquire(self.params.mode).await?;
        let peer = self.ensure_peer().await?;
        peer.attach_local_tracks(&acquired.stream).await?;
        self.snapshot.degraded_media = acquired.degraded;
        self.snapshot.placeholder_media = acquired.placeholder;
        self.local = Some(acquired);
        self.push_snapshot();

        self.send_offer(false).await?;
        self.ring_peer().await;
        self.arm_timer(TimerKind::Connect, self.config.connect_timeout());
        self.set_state(CallState::Ringing, None);
        track_status(
            self.tracker.clone(),
            self.params.conversation_id.clone(),
            CallPhase::Ringing,
        );
        Ok(())
    }

    /// The link is created once; afterwards this is a pure accessor.
    async fn ensure_peer(&mut self) -> Result<Arc<dyn PeerLink>, CallError> {
        if let Some(peer) = &self.peer {
            return Ok(peer.clone());
        }
        let peer = self
            .peers
            .open(&self.config.ice_servers(), self.peer_tx.clone())
            .await?;
        self.peer = Some(peer.clone());
        Ok(peer)
    }

    async fn ring_peer(&self) {
        let invite = RingMessage::Invite {
            conversation_id: self.params.conversation_id.clone(),
            from_id: self.params.self_id.clone(),
            from_name: self.params.self_name.clone(),
            mode: self.params.mode,
        };
        if let Err(e) = notify_user(
            &self.relay,
            &self.params.peer_id,
            &invite,
            self.config.subscribe_timeout(),
        )
        .await
        {
            // The callee may already be on the call page listening on the
            // conversation topic, so the call continues without the ring.
            warn!(error = %e, "ring notification failed");
        }
    }

    // ---- negotiation -----------------------------------------------------

    fn repair(&self, raw: &str) -> String {
        let report = sdp::validate_and_fix(raw);
        for error in &report.errors {
            warn!(error = %error, "repaired session description");
        }
        for warning in &report.warnings {
            debug!(warning = %warning, "session description warning");
        }
        report.fixed
    }

    async fn apply_local(
        &self,
        peer: &Arc<dyn PeerLink>,
        kind: SdpKind,
        fixed: &str,
    ) -> Result<String, NegotiationError> {
        match peer.set_local(kind, fixed).await {
            Ok(()) => Ok(fixed.to_string()),
            Err(first) => {
                warn!(error = %first, "local description rejected; applying minimal fallback");
                let minimal = sdp::minimal_description(kind, self.params.mode.wants_video());
                peer.set_local(kind, &minimal).await?;
                Ok(minimal)
            }
        }
    }

    async fn apply_remote(
        &self,
        peer: &Arc<dyn PeerLink>,
        kind: SdpKind,
        raw: &str,
    ) -> Result<(), NegotiationError> {
        let fixed = self.repair(raw);
        match peer.set_remote(kind, &fixed).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "remote description rejected; applying minimal fallback");
                let minimal = sdp::minimal_description(kind, self.params.mode.wants_video());
                peer.set_remote(kind, &minimal).await
            }
        }
    }

    async fn send_offer(&mut self, ice_restart: bool) -> Result<(), CallError> {
        let peer = self.ensure_peer().await?;
        let raw = peer.create_offer(ice_restart).await?;
        let fixed = self.repair(&raw);
        let applied = self.apply_local(&peer, SdpKind::Offer, &fixed).await?;
        self.channel
            .send(&SignalMessage::Offer {
                from: self.params.self_id.clone(),
                sdp: SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: applied,
                },
            })
            .await;
        self.metrics.signal_tx_add();
        Ok(())
    }

    async fn send_answer(&mut self, peer: &Arc<dyn PeerLink>) -> Result<(), CallError> {
        let raw = peer.create_answer().await?;
        let fixed = self.repair(&raw);
        let applied = self.apply_local(peer, SdpKind::Answer, &fixed).await?;
        self.channel
            .send(&SignalMessage::Answer {
                from: self.params.self_id.clone(),
                sdp: SessionDescription {
                    kind: SdpKind::Answer,
                    sdp: applied,
                },
            })
            .await;
        self.metrics.signal_tx_add();
        Ok(())
    }

    // ---- inbound signals -------------------------------------------------

    async fn on_signal(&mut self, msg: SignalMessage) {
        if msg.from_id() == self.params.self_id {
            return; // echo suppression
        }
        self.metrics.signal_rx_add();
        match msg {
            SignalMessage::Offer { sdp, .. } => self.on_offer(sdp).await,
            SignalMessage::Answer { sdp, .. } => self.on_answer(sdp).await,
            SignalMessage::Ice { candidate, .. } => self.on_candidate(candidate).await,
            SignalMessage::Bye { .. } => {
                info!("peer hung up");
                self.end(false).await;
            }
        }
    }

    async fn on_offer(&mut self, sdp: SessionDescription) {
        if self.peer.is_some() {
            // Renegotiation (the peer's transport restart). Either role
            // answers it in place.
            if !matches!(
                self.snapshot.state,
                CallState::Connecting | CallState::Connected
            ) {
                debug!(state = ?self.snapshot.state, "ignoring renegotiation offer");
                return;
            }
            let peer = match &self.peer {
                Some(p) => p.clone(),
                None => return,
            };
            if let Err(e) = self.answer_offer(&peer, &sdp.sdp).await {
                warn!(error = %e, "renegotiation failed");
            }
            return;
        }

        if self.params.role != CallRole::Callee {
            debug!("caller ignoring unexpected offer");
            return;
        }
        info!("offer received; answering");
        self.clear_timer();
        self.set_state(CallState::Connecting, None);

        let setup = async {
            let acquired = self.media.acquire(self.params.mode).await?;
            let peer = self.ensure_peer().await?;
            peer.attach_local_tracks(&acquired.stream).await?;
            self.snapshot.degraded_media = acquired.degraded;
            self.snapshot.placeholder_media = acquired.placeholder;
            self.local = Some(acquired);
            self.push_snapshot();
            self.arm_timer(TimerKind::Connect, self.config.connect_timeout());
            Ok::<Arc<dyn PeerLink>, CallError>(peer)
        }
        .await;
        let peer = match setup {
            Ok(peer) => peer,
            Err(e) => {
                let reason = e.user_reason();
                warn!(error = %e, "failed to prepare answer");
                self.fail(reason, CallPhase::Ended).await;
                return;
            }
        };
        if let Err(e) = self.answer_offer(&peer, &sdp.sdp).await {
            let reason = e.user_reason();
            warn!(error = %e, "failed to answer offer");
            self.fail(reason, CallPhase::Ended).await;
        }
    }

    async fn answer_offer(
        &mut self,
        peer: &Arc<dyn PeerLink>,
        offer_sdp: &str,
    ) -> Result<(), CallError> {
        self.apply_remote(peer, SdpKind::Offer, offer_sdp).await?;
        self.send_answer(peer).await
    }

    async fn on_answer(&mut self, sdp: SessionDescription) {
        if self.params.role != CallRole::Caller {
            debug!("callee ignoring unexpected answer");
            return;
        }
        if !matches!(
            self.snapshot.state,
            CallState::Ringing | CallState::Connecting
        ) {
            debug!(state = ?self.snapshot.state, "ignoring answer");
            return;
        }
        let peer = match &self.peer {
            Some(p) => p.clone(),
            None => {
                debug!("answer before offer was sent; ignoring");
                return;
            }
        };
        match self.apply_remote(&peer, SdpKind::Answer, &sdp.sdp).await {
            Ok(()) => {
                info!("answer applied");
                self.set_state(CallState::Connecting, None);
            }
            Err(e) => {
                warn!(error = %e, "failed to apply answer");
                self.fail(
                    "Failed to establish connection. Please try again.".to_string(),
                    CallPhase::Ended,
                )
                .await;
            }
        }
    }

    /// Best-effort: a single bad candidate is never fatal, more keep
    /// coming while gathering continues.
    async fn on_candidate(&mut self, candidate: IceCandidate) {
        let Some(peer) = self.peer.clone() else {
            debug!("candidate before connection exists; dropped");
            self.metrics.ice_dropped();
            return;
        };
        match peer.add_remote_candidate(&candidate).await {
            Ok(()) => self.metrics.ice_added(),
            Err(e) => {
                warn!(error = %e, "failed to add candidate");
                self.metrics.ice_dropped();
            }
        }
    }

    // ---- link events -----------------------------------------------------

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Candidate(candidate) => {
                self.channel
                    .send(&SignalMessage::Ice {
                        from: self.params.self_id.clone(),
                        candidate,
                    })
                    .await;
                self.metrics.signal_tx_add();
            }
            PeerEvent::Track(track) => {
                debug!(kind = ?track.kind, id = %track.id, "remote track");
                self.remote.push(track);
                self.snapshot.remote_tracks = self.remote.len();
                self.push_snapshot();
            }
            PeerEvent::Link(state) => {
                let verdict = self.monitor.on_link_state(state);
                self.apply_verdict(verdict).await;
            }
            PeerEvent::Ice(state) => {
                let verdict = self.monitor.on_ice_state(state);
                self.apply_verdict(verdict).await;
            }
        }
    }

    async fn apply_verdict(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Nothing => {}
            Verdict::Connecting => {
                if !matches!(
                    self.snapshot.state,
                    CallState::Connected | CallState::Ended | CallState::Failed
                ) {
                    self.set_state(CallState::Connecting, None);
                }
            }
            Verdict::Connected => {
                if self.snapshot.state != CallState::Connected {
                    self.clear_timer();
                    self.snapshot.connected_at_ms = Some(now_ms());
                    if let Some(local) = &self.local {
                        self.meter = Some(AudioLevelMeter::start(&local.stream));
                    }
                    self.set_state(CallState::Connected, None);
                    self.metrics.session_connected();
                    track_status(
                        self.tracker.clone(),
                        self.params.conversation_id.clone(),
                        CallPhase::Connected,
                    );
                    info!("call connected");
                }
            }
            Verdict::RestartTransport => {
                warn!("transport failed; attempting in-place restart");
                self.metrics.transport_restart();
                if let Err(e) = self.send_offer(true).await {
                    // Leave escalation to the overall link state.
                    warn!(error = %e, "transport restart failed");
                }
            }
            Verdict::Terminal { reached_connected } => {
                if reached_connected {
                    info!("connection closed");
                    self.end(false).await;
                } else {
                    self.fail(
                        "Connection failed. Please check your network and try again.".to_string(),
                        CallPhase::Ended,
                    )
                    .await;
                }
            }
        }
    }

    // ---- timers ----------------------------------------------------------

    /// Arming always replaces the previous timer: at most one pending
    /// timeout exists per session.
    fn arm_timer(&mut self, kind: TimerKind, after: Duration) {
        self.pending = Some((kind, Instant::now() + after));
    }

    fn clear_timer(&mut self) {
        self.pending = None;
    }

    async fn on_timeout(&mut self) {
        let Some((kind, _)) = self.pending.take() else {
            return;
        };
        match kind {
            TimerKind::Connect => {
                warn!("connection timeout");
                self.fail(
                    "Connection timeout: no response from peer. They may be unavailable or offline."
                        .to_string(),
                    CallPhase::Missed,
                )
                .await;
            }
            TimerKind::Offer => {
                warn!("no offer received");
                self.fail(
                    "No incoming call received. The caller may have cancelled or lost connection."
                        .to_string(),
                    CallPhase::Missed,
                )
                .await;
            }
        }
    }

    // ---- commands --------------------------------------------------------

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::ToggleMute => {
                let Some(local) = &self.local else {
                    warn!("no local stream; mute toggle ignored");
                    return;
                };
                let muted = !self.snapshot.muted;
                for track in local.stream.audio_tracks() {
                    track.set_enabled(!muted);
                }
                self.snapshot.muted = muted;
                self.push_snapshot();
            }
            Command::ToggleCamera => {
                if !self.params.mode.wants_video() {
                    warn!("camera toggle ignored in audio-only call");
                    return;
                }
                let Some(local) = &self.local else {
                    warn!("no local stream; camera toggle ignored");
                    return;
                };
                let off = !self.snapshot.camera_off;
                for track in local.stream.video_tracks() {
                    track.set_enabled(!off);
                }
                self.snapshot.camera_off = off;
                self.push_snapshot();
            }
            Command::ReplaceVideoTrack(track) => {
                let Some(peer) = self.peer.clone() else {
                    warn!("no connection; video track replacement ignored");
                    return;
                };
                if let Err(e) = peer.replace_video_sender(track).await {
                    warn!(error = %e, "video track replacement failed");
                }
            }
            Command::HangUp => {
                info!("hanging up");
                self.end(true).await;
            }
        }
    }

    // ---- teardown --------------------------------------------------------

    async fn send_bye(&mut self) {
        if self.bye_sent {
            return;
        }
        self.bye_sent = true;
        self.channel
            .send(&SignalMessage::Bye {
                from: self.params.self_id.clone(),
            })
            .await;
        self.metrics.signal_tx_add();
        // Out-of-band bye for a peer that never joined the conversation
        // topic. Fire-and-forget, never blocks teardown.
        let relay = self.relay.clone();
        let peer_id = self.params.peer_id.clone();
        let notice = RingMessage::Bye {
            conversation_id: self.params.conversation_id.clone(),
            from_id: self.params.self_id.clone(),
        };
        let timeout = self.config.subscribe_timeout();
        tokio::spawn(async move {
            if let Err(e) = notify_user(&relay, &peer_id, &notice, timeout).await {
                debug!(error = %e, "out-of-band bye failed");
            }
        });
    }

    /// Release order: local tracks, sender tracks, link, timer. Runs at
    /// most once regardless of how many paths reach it.
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(local) = &self.local {
            local.stream.stop_all();
        }
        if let Some(meter) = self.meter.take() {
            meter.stop();
        }
        if let Some(peer) = &self.peer {
            peer.stop_senders().await;
            peer.close().await;
        }
        self.clear_timer();
    }

    async fn end(&mut self, notify_peer: bool) {
        if self.snapshot.state.is_terminal() {
            return;
        }
        if notify_peer {
            self.send_bye().await;
        }
        self.teardown().await;
        self.set_state(CallState::Ended, None);
        track_status(
            self.tracker.clone(),
            self.params.conversation_id.clone(),
            CallPhase::Ended,
        );
    }

    async fn fail(&mut self, reason: String, phase: CallPhase) {
        if self.snapshot.state.is_terminal() {
            return;
        }
        self.teardown().await;
        self.metrics.session_failed();
        self.set_state(CallState::Failed, Some(reason));
        track_status(self.tracker.clone(), self.params.conversation_id.clone(), phase);
    }

    // ---- snapshot --------------------------------------------------------

    fn set_state(&mut self, state: CallState, reason: Option<String>) {
        if self.snapshot.state == state && reason.is_none() {
            return;
        }
        debug!(from = ?self.snapshot.state, to = ?state, "state transition");
        self.snapshot.state = state;
        self.snapshot.reason = reason;
        self.push_snapshot();
    }

    fn push_snapshot(&self) {
        let _ = self.snapshot_tx.send(self.snapshot.clone());
    }
}
