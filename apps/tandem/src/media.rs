use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "tandem";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("media access denied: {0}")]
    Denied(String),
    #[error("no such {kind} device: {device}")]
    NoDevice { kind: MediaKind, device: String },
}

/// Which devices to capture from. `None` means the default device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio_device: Option<String>,
    pub video_device: Option<String>,
}

/// One outgoing track. Muting disables the track without removing it, so
/// the sender slot on the peer connection stays in place.
#[derive(Clone)]
pub struct MediaTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(kind: MediaKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// The local capture: zero or more tracks from one acquisition.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<MediaTrack>,
    stopped: Arc<AtomicBool>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            tracks,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|track| track.kind == kind)
    }

    pub fn set_muted(&self, kind: MediaKind, muted: bool) {
        for track in self.tracks.iter().filter(|track| track.kind == kind) {
            track.set_enabled(!muted);
        }
    }

    /// True when there is a track of `kind` and all of them are disabled.
    pub fn is_muted(&self, kind: MediaKind) -> bool {
        let mut tracks = self.tracks.iter().filter(|track| track.kind == kind).peekable();
        tracks.peek().is_some() && tracks.all(|track| !track.is_enabled())
    }

    /// Releases the capture. Tracks stay readable but are disabled.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            for track in &self.tracks {
                track.set_enabled(false);
            }
            debug!(tracks = self.tracks.len(), "local media stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Where local media comes from: a camera/microphone stack, a screen grabber,
/// or a test double.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Produces sample tracks with no capture device behind them. Each
/// acquisition yields fresh track ids.
pub struct SyntheticMediaSource {
    audio: bool,
    video: bool,
    generation: AtomicU64,
}

impl SyntheticMediaSource {
    pub fn new(audio: bool, video: bool) -> Self {
        Self {
            audio,
            video,
            generation: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        for (kind, produced, requested) in [
            (MediaKind::Audio, self.audio, &constraints.audio_device),
            (MediaKind::Video, self.video, &constraints.video_device),
        ] {
            if let (false, Some(device)) = (produced, requested) {
                return Err(MediaError::NoDevice {
                    kind,
                    device: device.clone(),
                });
            }
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut tracks = Vec::new();
        if self.audio {
            let device = constraints.audio_device.as_deref().unwrap_or("default");
            tracks.push(MediaTrack::new(
                MediaKind::Audio,
                Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        ..Default::default()
                    },
                    format!("audio-{device}-{generation}"),
                    STREAM_ID.to_owned(),
                )),
            ));
        }
        if self.video {
            let device = constraints.video_device.as_deref().unwrap_or("default");
            tracks.push(MediaTrack::new(
                MediaKind::Video,
                Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        ..Default::default()
                    },
                    format!("video-{device}-{generation}"),
                    STREAM_ID.to_owned(),
                )),
            ));
        }
        Ok(LocalMedia::new(tracks))
    }
}
