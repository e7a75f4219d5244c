use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::MediaAcquisitionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// One outgoing track, shared read-only by every session
#[derive(Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
    pub track: Arc<dyn TrackLocal + Send + Sync>,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

struct LocalMedia {
    tracks: Vec<LocalTrack>,
    release: Mutex<Option<ReleaseHook>>,
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        let hook = match self.release.get_mut() {
            Ok(hook) => hook.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        tracing::info!("Releasing local media ({} tracks)", self.tracks.len());
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Reference-counted handle to the local capture source.
///
/// The orchestrator holds one clone and every live session holds another.
/// The release hook runs once, when the last clone is dropped.
#[derive(Clone)]
pub struct LocalMediaHandle(Arc<LocalMedia>);

impl LocalMediaHandle {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self(Arc::new(LocalMedia {
            tracks,
            release: Mutex::new(None),
        }))
    }

    pub fn with_release_hook(tracks: Vec<LocalTrack>, hook: impl FnOnce() + Send + 'static) -> Self {
        Self(Arc::new(LocalMedia {
            tracks,
            release: Mutex::new(Some(Box::new(hook))),
        }))
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.0.tracks
    }

    /// Number of live references, orchestrator included
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl fmt::Debug for LocalMediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMediaHandle")
            .field("tracks", &self.0.tracks)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Local capture provider
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMediaHandle, MediaAcquisitionError>;
}

/// Sample-fed Opus/VP8 tracks for an external capture pipeline to write into
#[derive(Debug, Clone)]
pub struct SampleMediaSource {
    pub audio: bool,
    pub video: bool,
    pub stream_id: String,
}

impl Default for SampleMediaSource {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            stream_id: "meshcall-local".into(),
        }
    }
}

impl SampleMediaSource {
    fn sample_track(&self, kind: MediaKind) -> LocalTrack {
        let (mime_type, id) = match kind {
            MediaKind::Audio => (MIME_TYPE_OPUS, "audio"),
            MediaKind::Video => (MIME_TYPE_VP8, "video"),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            self.stream_id.clone(),
        ));
        LocalTrack {
            id: id.to_owned(),
            kind,
            track,
        }
    }
}

#[async_trait]
impl MediaSource for SampleMediaSource {
    async fn acquire(&self) -> Result<LocalMediaHandle, MediaAcquisitionError> {
        if !self.audio && !self.video {
            return Err(MediaAcquisitionError::NoTracks);
        }

        let mut tracks = Vec::new();
        if self.audio {
            tracks.push(self.sample_track(MediaKind::Audio));
        }
        if self.video {
            tracks.push(self.sample_track(MediaKind::Video));
        }

        let stream_id = self.stream_id.clone();
        Ok(LocalMediaHandle::with_release_hook(tracks, move || {
            tracing::debug!("Local stream {stream_id} stopped");
        }))
    }
}

/// Remote track surfaced to the UI layer
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: Option<MediaKind>,
    pub track: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}
