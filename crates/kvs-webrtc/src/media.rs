//! Local media sources

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use log::{debug, trace};
use tokio::task::JoinHandle;
use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    media::Sample,
    rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};

const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(33);
/// Opus frame of silence
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

#[derive(thiserror::Error, Debug)]
pub enum MediaError {
    #[error("No media device available!")]
    Unavailable,
    #[error("Media constraints request neither audio nor video!")]
    NothingRequested,
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

/// Requested local media, mirrors `getUserMedia` constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    /// Ideal video width
    pub width: u32,
    /// Ideal video height
    pub height: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            width: 1280,
            height: 720,
        }
    }
}

/// Provider of local audio/video tracks.
///
/// Failing to acquire media is never fatal to a session, it continues receive-only.
pub trait MediaSource: Send + Sync {
    fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Local tracks plus whatever feeds them. Feeding stops when dropped.
pub struct LocalMedia {
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    feed: Option<JoinHandle<()>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>, feed: Option<JoinHandle<()>>) -> Self {
        Self { tracks, feed }
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }

    pub fn has_kind(&self, kind: RTPCodecType) -> bool {
        self.tracks.iter().any(|track| track.kind() == kind)
    }

    /// Stop feeding the tracks
    pub fn stop(&mut self) {
        if let Some(feed) = self.feed.take() {
            debug!("stopping local media");
            feed.abort();
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

/// No camera, no microphone
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMedia;

impl MediaSource for NoMedia {
    fn acquire(&self, _constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        Err(MediaError::Unavailable)
    }
}

/// Generated media: opus silence and blank VP8 key frames at the requested resolution
#[derive(Debug, Clone)]
pub struct SyntheticMedia {
    stream_id: String,
}

impl Default for SyntheticMedia {
    fn default() -> Self {
        Self {
            stream_id: "kvs-webrtc-synthetic".to_string(),
        }
    }
}

impl SyntheticMedia {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

/// Uncompressed VP8 key frame header (RFC 6386 section 9.1) with an empty first partition
fn blank_vp8_frame(width: u32, height: u32) -> Bytes {
    let width = (width & 0x3fff) as u16;
    let height = (height & 0x3fff) as u16;
    // key frame, version 0, show frame, partition size 0
    let mut frame = vec![0x10, 0x00, 0x00, 0x9d, 0x01, 0x2a];
    frame.extend_from_slice(&width.to_le_bytes());
    frame.extend_from_slice(&height.to_le_bytes());
    Bytes::from(frame)
}

impl MediaSource for SyntheticMedia {
    fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaError::NothingRequested);
        }
        let audio = constraints.audio.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    ..Default::default()
                },
                "audio".to_owned(),
                self.stream_id.clone(),
            ))
        });
        let video = constraints.video.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    ..Default::default()
                },
                "video".to_owned(),
                self.stream_id.clone(),
            ))
        });

        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> = vec![];
        if let Some(audio) = &audio {
            tracks.push(audio.clone());
        }
        if let Some(video) = &video {
            tracks.push(video.clone());
        }

        let frame = blank_vp8_frame(constraints.width, constraints.height);
        let feed = tokio::spawn(async move {
            let mut audio_ticks = tokio::time::interval(AUDIO_FRAME);
            let mut video_ticks = tokio::time::interval(VIDEO_FRAME);
            loop {
                tokio::select! {
                    _ = audio_ticks.tick(), if audio.is_some() => {
                        if let Some(audio) = &audio {
                            let sample = Sample {
                                data: Bytes::from_static(&OPUS_SILENCE),
                                duration: AUDIO_FRAME,
                                ..Default::default()
                            };
                            if let Err(e) = audio.write_sample(&sample).await {
                                trace!("audio sample dropped ({e})");
                            }
                        }
                    }
                    _ = video_ticks.tick(), if video.is_some() => {
                        if let Some(video) = &video {
                            let sample = Sample {
                                data: frame.clone(),
                                duration: VIDEO_FRAME,
                                ..Default::default()
                            };
                            if let Err(e) = video.write_sample(&sample).await {
                                trace!("video sample dropped ({e})");
                            }
                        }
                    }
                }
            }
        });
        Ok(LocalMedia::new(tracks, Some(feed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_constraints_request_hd_audio_video() {
        let constraints = MediaConstraints::default();
        assert!(constraints.audio && constraints.video);
        assert_eq!((constraints.width, constraints.height), (1280, 720));
    }

    #[test]
    fn no_media_is_unavailable() {
        assert!(matches!(
            NoMedia.acquire(&MediaConstraints::default()),
            Err(MediaError::Unavailable)
        ));
    }

    #[test]
    fn vp8_header_carries_dimensions() {
        let frame = blank_vp8_frame(1280, 720);
        assert_eq!(&frame[3..6], &[0x9d, 0x01, 0x2a]);
        assert_eq!(u16::from_le_bytes([frame[6], frame[7]]), 1280);
        assert_eq!(u16::from_le_bytes([frame[8], frame[9]]), 720);
    }

    #[tokio::test]
    async fn synthetic_media_tracks_follow_constraints() {
        let media = SyntheticMedia::default();
        let mut local = media.acquire(&MediaConstraints::default()).unwrap();
        assert_eq!(local.tracks().len(), 2);
        assert!(local.has_kind(RTPCodecType::Audio));
        assert!(local.has_kind(RTPCodecType::Video));
        local.stop();
        local.stop();

        let audio_only = MediaConstraints {
            video: false,
            ..Default::default()
        };
        let local = media.acquire(&audio_only).unwrap();
        assert!(!local.has_kind(RTPCodecType::Video));

        let nothing = MediaConstraints {
            audio: false,
            video: false,
            ..Default::default()
        };
        assert!(matches!(media.acquire(&nothing), Err(MediaError::NothingRequested)));
    }
}
