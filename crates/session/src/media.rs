use relay::CallKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("capture unavailable: {0}")]
    Unavailable(String),
}

/// Locally captured media, attached to one or more peer links.
///
/// Track handles are shared by reference across every link they are added
/// to, so flipping an enabled flag mutes the media on all of them at once
/// without any extra signaling. `stop()` is the single teardown point and
/// may be called any number of times.
#[derive(Clone)]
pub struct LocalMedia {
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    unavailable: bool,
}

impl LocalMedia {
    pub fn with_tracks(
        audio: Option<Arc<TrackLocalStaticSample>>,
        video: Option<Arc<TrackLocalStaticSample>>,
    ) -> Self {
        Self {
            audio,
            video,
            audio_enabled: Arc::new(AtomicBool::new(true)),
            video_enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
            unavailable: false,
        }
    }

    /// Degraded mode: no tracks exist, but the session proceeds. The flag is
    /// surfaced to the application so the UI can say so instead of showing a
    /// silent, media-less call as healthy.
    pub fn unavailable() -> Self {
        Self { unavailable: true, ..Self::with_tracks(None, None) }
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable
    }

    pub fn audio_track(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.audio.as_ref()
    }

    pub fn video_track(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.video.as_ref()
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst) && !self.is_stopped()
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst) && !self.is_stopped()
    }

    /// Signals the capture feeders to cease writing samples. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.audio_enabled.store(false, Ordering::SeqCst);
        self.video_enabled.store(false, Ordering::SeqCst);
        debug!("Local media stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// The platform capability seam: something that can hand out local media.
///
/// The session controllers never talk to devices; they ask a capture for
/// tracks and degrade when it refuses.
pub trait MediaCapture: Send + Sync {
    fn acquire(&self, kind: CallKind) -> Result<LocalMedia, CaptureError>;
}

/// Production capture: creates Opus/VP8 sample tracks for the hosting
/// application to feed from its capture pipeline.
pub struct SampleCapture;

impl MediaCapture for SampleCapture {
    fn acquire(&self, kind: CallKind) -> Result<LocalMedia, CaptureError> {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "astra-media".to_string(),
        ));

        let video = if kind.wants_video() {
            Some(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90_000,
                    ..Default::default()
                },
                "video".to_string(),
                "astra-media".to_string(),
            )))
        } else {
            None
        };

        Ok(LocalMedia::with_tracks(Some(audio), video))
    }
}
