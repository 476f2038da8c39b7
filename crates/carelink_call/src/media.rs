/*
 * SPDX-FileCopyrightText: 2026 CareLink Health - CARELINK Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Local media acquisition with graceful degradation.
//!
//! The capture backend is a collaborator supplied by the host (desktop
//! capture, test fixture, ...). This module owns the policy: enumerate
//! first, request only what exists, fall back from tuned to basic
//! constraints, and synthesize a placeholder stream when no device is
//! present so the transport can still reach `Connected`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use carelink_protocol::CallMode;
use rand::Rng as _;
use tracing::{debug, info, warn};

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
}

#[derive(Debug, Clone)]
pub struct MediaDeviceInfo {
    pub kind: DeviceKind,
    pub device_id: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Default)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

#[derive(Debug, Clone)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// First rung of the acquisition ladder.
    pub fn tuned(audio: bool, video: bool) -> Self {
        Self {
            audio: audio.then(|| AudioConstraints {
                echo_cancellation: true,
                noise_suppression: true,
                auto_gain_control: true,
            }),
            video: video.then(|| VideoConstraints {
                width: 1280,
                height: 720,
                frame_rate: 30,
            }),
        }
    }

    /// Second rung: bare requests, no processing hints.
    pub fn basic(audio: bool, video: bool) -> Self {
        Self {
            audio: audio.then(AudioConstraints::default),
            video: video.then(|| VideoConstraints {
                width: 640,
                height: 480,
                frame_rate: 30,
            }),
        }
    }
}

/// One capture track. Mute/camera-off flip `enabled`; tracks are never
/// removed from a live stream, so toggling never forces renegotiation.
#[derive(Debug)]
pub struct MediaTrack {
    kind: TrackKind,
    label: String,
    synthetic: bool,
    enabled: AtomicBool,
    stopped: AtomicBool,
    /// Last observed input level (0-255), fed by the backend. UI only.
    level: AtomicU64,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            label: label.into(),
            synthetic: false,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            level: AtomicU64::new(0),
        })
    }

    /// Silent audio source: keeps negotiation and the transport alive on
    /// machines with no microphone.
    pub fn silent_audio() -> Arc<Self> {
        Arc::new(Self {
            kind: TrackKind::Audio,
            label: "silent-audio".to_string(),
            synthetic: true,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            level: AtomicU64::new(0),
        })
    }

    /// Static placeholder frame source, the no-camera analog of the above.
    pub fn placeholder_video() -> Arc<Self> {
        Arc::new(Self {
            kind: TrackKind::Video,
            label: "placeholder-video".to_string(),
            synthetic: true,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            level: AtomicU64::new(0),
        })
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn observe_level(&self, level: u8) {
        self.level.store(level as u64, Ordering::Relaxed);
    }

    pub fn level(&self) -> u8 {
        self.level.load(Ordering::Relaxed) as u8
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        let id: String = {
            let mut rng = rand::thread_rng();
            (0..16).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
        };
        Self { id, tracks }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Capture backend contract. `open` resolves constraints to live tracks
/// or fails with a classified error.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate(&self) -> Vec<MediaDeviceInfo>;
    async fn open(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError>;
}

/// Backend for hosts with no capture hardware at all; `acquire` never
/// calls `open` on it because enumeration comes back empty.
pub struct NoDevices;

#[async_trait]
impl MediaDevices for NoDevices {
    async fn enumerate(&self) -> Vec<MediaDeviceInfo> {
        Vec::new()
    }

    async fn open(&self, _constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        Err(MediaError::DeviceNotFound)
    }
}

/// Acquisition result with the degradation flags the call UI surfaces.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub stream: MediaStream,
    /// Video was requested but only audio could be captured.
    pub degraded: bool,
    /// No device existed; the stream is fully synthetic.
    pub placeholder: bool,
}

pub struct MediaManager {
    devices: Arc<dyn MediaDevices>,
}

impl MediaManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    fn placeholder_stream(mode: CallMode) -> MediaStream {
        let mut tracks = vec![MediaTrack::silent_audio()];
        if mode.wants_video() {
            tracks.push(MediaTrack::placeholder_video());
        }
        MediaStream::new(tracks)
    }

    /// Obtains a local stream for `mode`, degrading rather than stalling:
    /// a missing camera downgrades to audio-only, no devices at all yields
    /// a placeholder stream, and constraint failures retry once with basic
    /// constraints before the classified error is surfaced.
    pub async fn acquire(&self, mode: CallMode) -> Result<Acquired, MediaError> {
        let devices = self.devices.enumerate().await;
        let has_mic = devices.iter().any(|d| d.kind == DeviceKind::AudioInput);
        let has_cam = devices.iter().any(|d| d.kind == DeviceKind::VideoInput);

        if !has_mic && !has_cam {
            info!("no capture devices present; using placeholder stream");
            return Ok(Acquired {
                stream: Self::placeholder_stream(mode),
                degraded: false,
                placeholder: true,
            });
        }

        let want_video = mode.wants_video() && has_cam;
        let degraded = mode.wants_video() && !has_cam;
        if degraded {
            info!("no camera present; downgrading to audio-only capture");
        }

        let tuned = MediaConstraints::tuned(has_mic, want_video);
        match self.devices.open(&tuned).await {
            Ok(stream) => Ok(Acquired {
                stream,
                degraded,
                placeholder: false,
            }),
            Err(first) => {
                warn!(error = %first, "tuned constraints failed; retrying with basic constraints");
                let basic = MediaConstraints::basic(has_mic, want_video);
                match self.devices.open(&basic).await {
                    Ok(stream) => Ok(Acquired {
                        stream,
                        degraded,
                        placeholder: false,
                    }),
                    Err(second) => {
                        warn!(error = %second, "basic constraints failed; giving up");
                        Err(second)
                    }
                }
            }
        }
    }
}

/// Smoothed local input level for UI feedback while connected. Not a
/// correctness concern; the meter reads whatever the backend feeds into
/// the tracks and keeps an EMA the snapshot can expose.
pub struct AudioLevelMeter {
    value: Arc<AtomicU64>,
    task: tokio::task::JoinHandle<()>,
}

impl AudioLevelMeter {
    const SAMPLE_EVERY_MS: u64 = 200;

    pub fn start(stream: &MediaStream) -> Self {
        let tracks: Vec<Arc<MediaTrack>> = stream.audio_tracks().cloned().collect();
        let value = Arc::new(AtomicU64::new(0));
        let out = Arc::clone(&value);
        let task = tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_millis(Self::SAMPLE_EVERY_MS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let sample = tracks
                    .iter()
                    .filter(|t| t.is_enabled() && !t.is_stopped())
                    .map(|t| t.level() as u64)
                    .max()
                    .unwrap_or(0);
                let prev = out.load(Ordering::Relaxed);
                let next = (prev.saturating_mul(7).saturating_add(sample)) / 8;
                out.store(next, Ordering::Relaxed);
            }
        });
        debug!("audio level meter started");
        Self { value, task }
    }

    pub fn level(&self) -> u8 {
        self.value.load(Ordering::Relaxed) as u8
    }

    pub fn stop(self) {
        self.task.abort();
        debug!("audio level meter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted backend: a fixed device list and a queue of `open` results.
    struct FakeDevices {
        devices: Vec<MediaDeviceInfo>,
        responses: Mutex<Vec<Result<MediaStream, MediaError>>>,
        opened_with: Mutex<Vec<MediaConstraints>>,
    }

    impl FakeDevices {
        fn new(mic: bool, cam: bool, responses: Vec<Result<MediaStream, MediaError>>) -> Self {
            let mut devices = Vec::new();
            if mic {
                devices.push(MediaDeviceInfo {
                    kind: DeviceKind::AudioInput,
                    device_id: "mic0".into(),
                    label: "Internal Microphone".into(),
                });
            }
            if cam {
                devices.push(MediaDeviceInfo {
                    kind: DeviceKind::VideoInput,
                    device_id: "cam0".into(),
                    label: "Integrated Camera".into(),
                });
            }
            Self {
                devices,
                responses: Mutex::new(responses),
                opened_with: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MediaDevices for FakeDevices {
        async fn enumerate(&self) -> Vec<MediaDeviceInfo> {
            self.devices.clone()
        }

        async fn open(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
            self.opened_with.lock().unwrap().push(constraints.clone());
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn av_stream() -> MediaStream {
        MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, "mic"),
            MediaTrack::new(TrackKind::Video, "cam"),
        ])
    }

    #[tokio::test]
    async fn zero_devices_yields_placeholder_stream() {
        let mgr = MediaManager::new(Arc::new(NoDevices));
        let got = mgr.acquire(CallMode::Video).await.unwrap();
        assert!(got.placeholder);
        assert!(!got.degraded);
        assert_eq!(got.stream.audio_tracks().count(), 1);
        assert_eq!(got.stream.video_tracks().count(), 1);
        assert!(got.stream.tracks().iter().all(|t| t.is_synthetic()));
    }

    #[tokio::test]
    async fn missing_camera_degrades_video_call_to_audio() {
        let backend = Arc::new(FakeDevices::new(
            true,
            false,
            vec![Ok(MediaStream::new(vec![MediaTrack::new(
                TrackKind::Audio,
                "mic",
            )]))],
        ));
        let got = MediaManager::new(backend.clone())
            .acquire(CallMode::Video)
            .await
            .unwrap();
        assert!(got.degraded);
        assert!(!got.placeholder);
        let asked = backend.opened_with.lock().unwrap();
        assert!(asked[0].video.is_none(), "must not request absent camera");
    }

    #[tokio::test]
    async fn tuned_failure_retries_once_with_basic_constraints() {
        let backend = Arc::new(FakeDevices::new(
            true,
            true,
            vec![Err(MediaError::DeviceBusy), Ok(av_stream())],
        ));
        let got = MediaManager::new(backend.clone())
            .acquire(CallMode::Video)
            .await
            .unwrap();
        assert!(!got.degraded);
        let asked = backend.opened_with.lock().unwrap();
        assert_eq!(asked.len(), 2);
        assert!(asked[0].audio.as_ref().unwrap().echo_cancellation);
        assert!(!asked[1].audio.as_ref().unwrap().echo_cancellation);
    }

    #[tokio::test]
    async fn second_failure_surfaces_the_classified_error() {
        let backend = Arc::new(FakeDevices::new(
            true,
            true,
            vec![
                Err(MediaError::PermissionDenied),
                Err(MediaError::PermissionDenied),
            ],
        ));
        let err = MediaManager::new(backend)
            .acquire(CallMode::Audio)
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::PermissionDenied);
        assert!(err.user_message().contains("denied"));
    }

    #[test]
    fn toggling_enabled_never_removes_tracks() {
        let stream = av_stream();
        for t in stream.audio_tracks() {
            t.set_enabled(false);
        }
        assert_eq!(stream.tracks().len(), 2);
        assert!(!stream.audio_tracks().next().unwrap().is_enabled());
        assert!(stream.video_tracks().next().unwrap().is_enabled());
    }
}
