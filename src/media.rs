use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Where a local track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackSource {
    Camera,
    Microphone,
    Screen,
    ScreenAudio,
}

impl TrackSource {
    pub fn kind(self) -> MediaKind {
        match self {
            TrackSource::Camera | TrackSource::Screen => MediaKind::Video,
            TrackSource::Microphone | TrackSource::ScreenAudio => MediaKind::Audio,
        }
    }

    pub fn is_screen(self) -> bool {
        matches!(self, TrackSource::Screen | TrackSource::ScreenAudio)
    }
}

/// Camera facing mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

impl FacingMode {
    pub fn flipped(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

/// A local track shared by every peer session.
///
/// Muting clears the enabled flag; samples written while muted or after
/// `stop` are dropped instead of reaching the RTP track.
pub struct MediaTrack {
    id: String,
    stream_id: String,
    source: TrackSource,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

impl MediaTrack {
    pub fn new(source: TrackSource, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let id = id.into();
        let stream_id = stream_id.into();

        let codec = match source.kind() {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        let rtp = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.clone(),
        ));

        Self {
            id,
            stream_id,
            source,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtp,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn kind(&self) -> MediaKind {
        self.source.kind()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!("Track {} stopped", self.id);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.rtp) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Push one encoded sample. Returns false when the sample was dropped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        self.rtp.write_sample(sample).await?;
        Ok(true)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Local camera/microphone plus an optional screen-share stream
#[derive(Debug, Clone, Default)]
pub struct MediaBundle {
    pub camera: Option<Arc<MediaTrack>>,
    pub microphone: Option<Arc<MediaTrack>>,
    pub screen: Vec<Arc<MediaTrack>>,
}

impl MediaBundle {
    /// Camera and microphone tracks
    pub fn user_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.camera
            .iter()
            .chain(self.microphone.iter())
            .cloned()
            .collect()
    }

    pub fn all_tracks(&self) -> Vec<Arc<MediaTrack>> {
        let mut tracks = self.user_tracks();
        tracks.extend(self.screen.iter().cloned());
        tracks
    }

    pub fn is_screen_sharing(&self) -> bool {
        !self.screen.is_empty()
    }

    pub fn audio_enabled(&self) -> bool {
        self.microphone.as_ref().is_some_and(|t| t.is_enabled())
    }

    pub fn video_enabled(&self) -> bool {
        self.camera.as_ref().is_some_and(|t| t.is_enabled())
    }

    pub fn stop_all(&self) {
        for track in self.all_tracks() {
            track.stop();
        }
    }
}

/// Acquires local capture tracks
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open_camera(&self, facing: FacingMode) -> Result<Arc<MediaTrack>>;
    async fn open_microphone(&self) -> Result<Arc<MediaTrack>>;
    async fn open_screen(&self) -> Result<Vec<Arc<MediaTrack>>>;
}

/// Source producing tracks with no capture device behind them.
///
/// Track and stream ids follow the `camera-` / `microphone-` / `screen-`
/// prefixes that remote classification recognises.
pub struct SyntheticMediaSource {
    user_stream: String,
}

impl SyntheticMediaSource {
    pub fn new(local_id: &str) -> Self {
        Self {
            user_stream: format!("user-{}", local_id),
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn open_camera(&self, facing: FacingMode) -> Result<Arc<MediaTrack>> {
        let facing = match facing {
            FacingMode::User => "user",
            FacingMode::Environment => "environment",
        };
        Ok(Arc::new(MediaTrack::new(
            TrackSource::Camera,
            format!("camera-{}-{}", facing, uuid::Uuid::new_v4()),
            self.user_stream.clone(),
        )))
    }

    async fn open_microphone(&self) -> Result<Arc<MediaTrack>> {
        Ok(Arc::new(MediaTrack::new(
            TrackSource::Microphone,
            format!("microphone-{}", uuid::Uuid::new_v4()),
            self.user_stream.clone(),
        )))
    }

    async fn open_screen(&self) -> Result<Vec<Arc<MediaTrack>>> {
        let stream = format!("screen-{}", uuid::Uuid::new_v4());
        Ok(vec![Arc::new(MediaTrack::new(
            TrackSource::Screen,
            format!("screen-video-{}", uuid::Uuid::new_v4()),
            stream,
        ))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample() -> Sample {
        Sample {
            data: vec![0u8; 16].into(),
            duration: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_muted_track_drops_samples() {
        let track = MediaTrack::new(TrackSource::Microphone, "mic", "user-a");
        track.set_enabled(false);
        assert!(!track.write_sample(&sample()).await.unwrap());

        track.set_enabled(true);
        track.stop();
        assert!(!track.write_sample(&sample()).await.unwrap());
        assert!(track.is_stopped());
    }

    #[test]
    fn test_track_kind_follows_source() {
        let track = MediaTrack::new(TrackSource::Screen, "screen-1", "screen-a");
        assert_eq!(track.kind(), MediaKind::Video);
        assert_eq!(track.rtp_track().id(), "screen-1");
        assert_eq!(track.rtp_track().stream_id(), "screen-a");
        assert_eq!(TrackSource::ScreenAudio.kind(), MediaKind::Audio);
    }

    #[tokio::test]
    async fn test_bundle_state() {
        let source = SyntheticMediaSource::new("alice");
        let mut bundle = MediaBundle {
            camera: Some(source.open_camera(FacingMode::User).await.unwrap()),
            microphone: Some(source.open_microphone().await.unwrap()),
            screen: vec![],
        };
        assert_eq!(bundle.user_tracks().len(), 2);
        assert!(bundle.audio_enabled() && bundle.video_enabled());
        assert!(!bundle.is_screen_sharing());

        bundle.screen = source.open_screen().await.unwrap();
        assert!(bundle.is_screen_sharing());
        assert_eq!(bundle.all_tracks().len(), 3);
        assert!(bundle.screen[0].id().starts_with("screen-"));

        bundle.stop_all();
        assert!(bundle.all_tracks().iter().all(|t| t.is_stopped()));
    }
}
