//! Segmented delivery over HTTP
//!
//! Each segmented session muxes its video (and MPEG audio, when present)
//! into MPEG-TS segments. The most recent segments are listed by an HLS
//! playlist at `/<name>.m3u8` and an MPEG-DASH manifest at `/<name>.mpd`.

pub mod http;
pub mod manifest;
pub mod segmenter;
pub mod ts;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::session::{DeliveryLeg, Session};
use crate::stream::framing::profile_level_id;
use crate::stream::{MediaFrame, StreamReplicator};
use crate::utils::LogThrottler;
use crate::video::format::CodecFamily;

pub use http::create_router;
pub use segmenter::{Segment, SegmentWindow, Segmenter, WINDOW_SIZE};

struct PublishedSession {
    name: String,
    video: Arc<StreamReplicator>,
    audio: Option<Arc<StreamReplicator>>,
    segment: Duration,
    window: RwLock<SegmentWindow>,
    available_since: DateTime<Utc>,
}

impl PublishedSession {
    fn codecs(&self) -> String {
        match self.video.family() {
            CodecFamily::H264 => {
                let profile = self
                    .video
                    .parameter_sets()
                    .sps
                    .as_deref()
                    .and_then(profile_level_id)
                    .unwrap_or_else(|| "42e01f".to_string());
                format!("avc1.{}", profile)
            }
            _ => "hev1.1.6.L93.B0".to_string(),
        }
    }
}

/// Registry of segmented sessions and the tasks producing their segments
#[derive(Default)]
pub struct SegmentedPublisher {
    sessions: RwLock<HashMap<String, Arc<PublishedSession>>>,
}

impl SegmentedPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a session with one segmented leg over H.264 or H.265 video.
    /// Audio is muxed only when it is MPEG audio.
    pub fn add_session(&self, session: &Session) -> Result<()> {
        let Some(DeliveryLeg::Segmented {
            video,
            audio,
            segment,
        }) = session
            .legs
            .iter()
            .find(|leg| matches!(leg, DeliveryLeg::Segmented { .. }))
        else {
            return Err(AppError::SessionRegistration(format!(
                "{}: no segmented leg",
                session.name
            )));
        };

        if video.family() == CodecFamily::Generic {
            return Err(AppError::SessionRegistration(format!(
                "{}: {} cannot be segmented, H.264 or H.265 is required",
                session.name,
                video.info().rtp_mime
            )));
        }
        if segment.is_zero() {
            return Err(AppError::SessionRegistration(format!(
                "{}: segment duration must be positive",
                session.name
            )));
        }

        let audio = match audio {
            Some(audio) if audio.info().encoding_name() == "MPEG" => Some(audio.clone()),
            Some(audio) => {
                info!(
                    "{}: {} is not muxed into segments, publishing video only",
                    session.name,
                    audio.info().rtp_mime
                );
                None
            }
            None => None,
        };

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.name) {
            return Err(AppError::SessionRegistration(format!(
                "{}: already published",
                session.name
            )));
        }
        sessions.insert(
            session.name.clone(),
            Arc::new(PublishedSession {
                name: session.name.clone(),
                video: video.clone(),
                audio,
                segment: *segment,
                window: RwLock::new(SegmentWindow::new(*segment, WINDOW_SIZE)),
                available_since: Utc::now(),
            }),
        );
        Ok(())
    }

    pub fn has_sessions(&self) -> bool {
        !self.sessions.read().is_empty()
    }

    /// Spawn one segmenting task per session
    pub fn start(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.sessions
            .read()
            .values()
            .filter_map(|session| {
                let segmenter = Segmenter::new(
                    session.video.family(),
                    session.audio.is_some(),
                    session.segment,
                )?;
                let video_rx = session.video.subscribe();
                let audio_rx = session.audio.as_ref().map(|audio| audio.subscribe());
                Some(tokio::spawn(run_segmenter(
                    session.clone(),
                    segmenter,
                    video_rx,
                    audio_rx,
                    cancel.clone(),
                )))
            })
            .collect()
    }

    pub fn playlist(&self, name: &str) -> Option<String> {
        let session = self.sessions.read().get(name).cloned()?;
        let window = session.window.read();
        Some(manifest::media_playlist(&session.name, &window))
    }

    pub fn dash_manifest(&self, name: &str) -> Option<String> {
        let session = self.sessions.read().get(name).cloned()?;
        let codecs = session.codecs();
        let window = session.window.read();
        Some(manifest::dash_manifest(
            &session.name,
            &window,
            &codecs,
            session.available_since,
        ))
    }

    pub fn segment(&self, name: &str, sequence: u64) -> Option<Bytes> {
        let session = self.sessions.read().get(name).cloned()?;
        let window = session.window.read();
        window.get(sequence).map(|segment| segment.data.clone())
    }
}

async fn recv_frame(
    rx: &mut Receiver<MediaFrame>,
    name: &str,
    throttler: &LogThrottler,
) -> Option<MediaFrame> {
    loop {
        match rx.recv().await {
            Ok(frame) => return Some(frame),
            Err(RecvError::Lagged(skipped)) => {
                if throttler.should_log(name) {
                    warn!("Segmenter for {} lagged, skipped {} frames", name, skipped);
                }
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn next_audio(
    rx: &mut Option<Receiver<MediaFrame>>,
    name: &str,
    throttler: &LogThrottler,
) -> Option<MediaFrame> {
    match rx {
        Some(rx) => recv_frame(rx, name, throttler).await,
        None => std::future::pending().await,
    }
}

async fn run_segmenter(
    session: Arc<PublishedSession>,
    mut segmenter: Segmenter,
    mut video_rx: Receiver<MediaFrame>,
    mut audio_rx: Option<Receiver<MediaFrame>>,
    cancel: CancellationToken,
) {
    let throttler = LogThrottler::with_secs(5);
    info!(
        "Segmenting {} into {:?} segments",
        session.name, session.segment
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = recv_frame(&mut video_rx, &session.name, &throttler) => {
                let Some(frame) = frame else {
                    warn!("{}: video stream ended, segmenting stopped", session.name);
                    break;
                };
                let params = session.video.parameter_sets();
                if let Some(segment) = segmenter.push_video(&frame, &params) {
                    debug!(
                        "{}: segment {} ({:?}, {} bytes)",
                        session.name,
                        segment.sequence,
                        segment.duration,
                        segment.data.len()
                    );
                    session.window.write().push(segment);
                }
            }
            frame = next_audio(&mut audio_rx, &session.name, &throttler) => {
                match frame {
                    Some(frame) => segmenter.push_audio(&frame),
                    None => {
                        debug!("{}: audio stream ended", session.name);
                        audio_rx = None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DeliveryMode;
    use crate::stream::reader::testing::ScriptedReader;
    use crate::stream::{CaptureSourceFactory, StreamInfo};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn stream(mime: &str, frames: &[&'static [u8]]) -> Arc<StreamReplicator> {
        let family = match mime {
            "video/H264" => CodecFamily::H264,
            "video/H265" => CodecFamily::Hevc,
            _ => CodecFamily::Generic,
        };
        let source = CaptureSourceFactory::default().create_source(
            family,
            StreamInfo::video(mime, 4096),
            ScriptedReader::frames(frames),
        );
        StreamReplicator::new(source)
    }

    fn segmented(video: Arc<StreamReplicator>) -> Session {
        Session::new(
            "ts",
            DeliveryMode::Segmented,
            vec![DeliveryLeg::Segmented {
                video,
                audio: None,
                segment: Duration::from_secs(2),
            }],
        )
    }

    #[test]
    fn jpeg_video_is_rejected() {
        let publisher = SegmentedPublisher::new();
        let err = publisher
            .add_session(&segmented(stream("video/JPEG", &[])))
            .unwrap_err();
        assert!(matches!(err, AppError::SessionRegistration(_)));
        assert!(!publisher.has_sessions());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let publisher = SegmentedPublisher::new();
        let video = stream("video/H264", &[]);
        publisher.add_session(&segmented(video.clone())).unwrap();
        assert!(publisher.add_session(&segmented(video)).is_err());
        assert!(publisher.has_sessions());
    }

    #[tokio::test]
    async fn routes_serve_playlist_and_reject_unknown() {
        let publisher = Arc::new(SegmentedPublisher::new());
        publisher
            .add_session(&segmented(stream("video/H264", &[])))
            .unwrap();
        let router = create_router(publisher.clone());

        let response = router
            .clone()
            .oneshot(Request::get("/ts.m3u8").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "application/vnd.apple.mpegurl"
        );

        let response = router
            .clone()
            .oneshot(Request::get("/ts.mpd").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        for uri in ["/other.m3u8", "/ts/0.ts", "/ts/x.ts", "/ts.txt"] {
            let response = router
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }

    #[tokio::test]
    async fn segments_are_published_from_key_frames() {
        const IDR: &[u8] = &[
            0, 0, 0, 1, 0x67, 0x42, 0xe0, 0x1f, 0, 0, 0, 1, 0x68, 0xce, 0x06, 0xe2, 0, 0, 0, 1,
            0x65, 0x88, 0x84,
        ];
        let video = stream("video/H264", &[IDR; 6]);
        let publisher = SegmentedPublisher::new();
        let mut session = segmented(video.clone());
        if let DeliveryLeg::Segmented { segment, .. } = &mut session.legs[0] {
            *segment = Duration::from_nanos(1);
        }
        publisher.add_session(&session).unwrap();

        let cancel = CancellationToken::new();
        let tasks = publisher.start(&cancel);
        assert_eq!(tasks.len(), 1);
        video.start(&cancel);

        let mut published = false;
        for _ in 0..50 {
            if publisher.segment("ts", 0).is_some() {
                published = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        assert!(published);
        let data = publisher.segment("ts", 0).unwrap();
        assert_eq!(data[0], 0x47);
        assert!(publisher.playlist("ts").unwrap().contains("ts/0.ts"));
    }
}
