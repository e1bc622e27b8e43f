use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{MediaError, PeerError};
use crate::utils::random_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        })
    }
}

#[derive(Clone)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub track: Arc<TrackLocalStaticSample>,
}

struct StreamInner {
    id: String,
    tracks: Vec<LocalTrack>,
    stopped: AtomicBool,
    stop_calls: AtomicU64,
}

/// Captured camera + microphone. Clones share the same tracks and the
/// same stopped flag.
#[derive(Clone)]
pub struct LocalStream {
    inner: Arc<StreamInner>,
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                tracks,
                stopped: AtomicBool::new(false),
                stop_calls: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.inner.tracks
    }

    /// Stops every track. Returns `true` only for the call that actually
    /// stopped the stream.
    pub fn stop(&self) -> bool {
        self.inner.stop_calls.fetch_add(1, Ordering::SeqCst);
        let first = !self.inner.stopped.swap(true, Ordering::SeqCst);
        if first {
            debug!(stream = %self.inner.id, "local media stopped");
        }
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// How many times `stop` was invoked, including no-op repeats.
    pub fn stop_calls(&self) -> u64 {
        self.inner.stop_calls.load(Ordering::SeqCst)
    }

    /// Feeds one encoded frame from the capture pipeline into the track of
    /// `kind`. Frames written after `stop` are discarded.
    pub async fn write_sample(
        &self,
        kind: MediaKind,
        data: Bytes,
        duration: Duration,
    ) -> Result<(), PeerError> {
        if self.is_stopped() {
            return Ok(());
        }
        let track = self
            .inner
            .tracks
            .iter()
            .find(|t| t.kind == kind)
            .ok_or(PeerError::NoMedia)?;
        track
            .track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

/// Access to the local capture devices.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalStream, MediaError>;
}

/// Default source: an Opus audio track and a VP8 video track that an
/// external capture pipeline feeds through [`LocalStream::write_sample`].
#[derive(Debug, Clone)]
pub struct TrackMediaSource {
    pub audio: bool,
    pub video: bool,
}

impl Default for TrackMediaSource {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[async_trait]
impl MediaSource for TrackMediaSource {
    async fn acquire(&self) -> Result<LocalStream, MediaError> {
        if !self.audio && !self.video {
            return Err(MediaError::Unavailable("no audio or video requested".into()));
        }
        let stream_id = format!("parley-{}", random_id());
        let mut tracks = Vec::new();
        if self.audio {
            tracks.push(LocalTrack {
                kind: MediaKind::Audio,
                track: Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        ..Default::default()
                    },
                    "audio".to_owned(),
                    stream_id.clone(),
                )),
            });
        }
        if self.video {
            tracks.push(LocalTrack {
                kind: MediaKind::Video,
                track: Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        ..Default::default()
                    },
                    "video".to_owned(),
                    stream_id.clone(),
                )),
            });
        }
        info!(stream = %stream_id, tracks = tracks.len(), "local media acquired");
        Ok(LocalStream::new(stream_id, tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reports_first_transition_only() {
        let stream = LocalStream::new("s1", Vec::new());
        assert!(stream.stop());
        assert!(!stream.stop());
        assert!(stream.is_stopped());
        assert_eq!(stream.stop_calls(), 2);
    }

    #[test]
    fn clones_share_stop_state() {
        let stream = LocalStream::new("s1", Vec::new());
        let other = stream.clone();
        other.stop();
        assert!(stream.is_stopped());
    }

    #[tokio::test]
    async fn default_source_builds_audio_and_video() {
        let stream = TrackMediaSource::default().acquire().await.expect("media");
        let kinds: Vec<_> = stream.tracks().iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);
    }

    #[tokio::test]
    async fn empty_source_is_unavailable() {
        let src = TrackMediaSource {
            audio: false,
            video: false,
        };
        assert!(matches!(src.acquire().await, Err(MediaError::Unavailable(_))));
    }

    #[tokio::test]
    async fn writing_missing_kind_fails() {
        let stream = LocalStream::new("s1", Vec::new());
        let res = stream
            .write_sample(MediaKind::Video, Bytes::from_static(b"\0"), Duration::from_millis(33))
            .await;
        assert!(matches!(res, Err(PeerError::NoMedia)));
    }
}
