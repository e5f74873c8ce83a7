//! Cuts muxed transport stream into segments on key frames

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use super::ts::{StreamType, TsMuxer};
use crate::stream::framing::{h264_nal_type, h265_nal_type, split_annexb_nal_units};
use crate::stream::{MediaFrame, ParameterSets};
use crate::video::format::CodecFamily;

/// Segments kept available to clients
pub const WINDOW_SIZE: usize = 5;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// A finished segment
#[derive(Debug, Clone)]
pub struct Segment {
    pub sequence: u64,
    pub duration: Duration,
    pub data: Bytes,
    pub published: DateTime<Utc>,
}

/// Sliding window of the most recent segments
#[derive(Debug, Clone)]
pub struct SegmentWindow {
    segments: VecDeque<Segment>,
    capacity: usize,
    target: Duration,
}

impl SegmentWindow {
    pub fn new(target: Duration, capacity: usize) -> Self {
        Self {
            segments: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            target,
        }
    }

    pub fn push(&mut self, segment: Segment) {
        if self.segments.len() == self.capacity {
            self.segments.pop_front();
        }
        self.segments.push_back(segment);
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    pub fn get(&self, sequence: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.sequence == sequence)
    }

    pub fn first_sequence(&self) -> u64 {
        self.segments.front().map(|s| s.sequence).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Configured segment duration
    pub fn target(&self) -> Duration {
        self.target
    }

    /// Longest segment, rounded up to whole seconds
    pub fn target_duration_secs(&self) -> u64 {
        let longest = self
            .segments
            .iter()
            .map(|s| s.duration)
            .max()
            .unwrap_or(self.target)
            .max(self.target);
        let secs = longest.as_secs();
        if longest.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

struct OpenSegment {
    data: BytesMut,
    start: Duration,
    last: Duration,
}

/// Turns video (and optionally MPEG audio) frames into segments
pub struct Segmenter {
    family: CodecFamily,
    muxer: TsMuxer,
    target: Duration,
    open: Option<OpenSegment>,
    next_sequence: u64,
}

impl Segmenter {
    /// `None` when the video codec cannot be carried in a transport stream
    pub fn new(family: CodecFamily, with_audio: bool, target: Duration) -> Option<Self> {
        let video = match family {
            CodecFamily::H264 => StreamType::H264,
            CodecFamily::Hevc => StreamType::H265,
            CodecFamily::Generic => return None,
        };
        let audio = with_audio.then_some(StreamType::MpegAudio);
        Some(Self {
            family,
            muxer: TsMuxer::new(video, audio),
            target,
            open: None,
            next_sequence: 0,
        })
    }

    /// Mux one video frame. Returns the segment closed by this frame, if any.
    /// Nothing is written before the first key frame.
    pub fn push_video(&mut self, frame: &MediaFrame, params: &ParameterSets) -> Option<Segment> {
        let mut finished = None;
        match &self.open {
            None if !frame.key_frame => return None,
            Some(open) if frame.key_frame && frame.pts.saturating_sub(open.start) >= self.target => {
                finished = self.close(frame.pts);
            }
            _ => {}
        }

        let segment = self.open.get_or_insert_with(|| OpenSegment {
            data: BytesMut::new(),
            start: frame.pts,
            last: frame.pts,
        });
        if segment.data.is_empty() {
            self.muxer.write_tables(&mut segment.data);
        }

        let data = if frame.key_frame {
            with_parameter_sets(self.family, params, &frame.data)
        } else {
            frame.data.clone()
        };
        self.muxer
            .write_video(&mut segment.data, &data, frame.pts, frame.key_frame);
        segment.last = frame.pts;
        finished
    }

    /// Mux one audio frame into the open segment
    pub fn push_audio(&mut self, frame: &MediaFrame) {
        if let Some(segment) = self.open.as_mut() {
            self.muxer.write_audio(&mut segment.data, &frame.data, frame.pts);
        }
    }

    fn close(&mut self, end: Duration) -> Option<Segment> {
        let open = self.open.take()?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Some(Segment {
            sequence,
            duration: end.saturating_sub(open.start).max(open.last.saturating_sub(open.start)),
            data: open.data.freeze(),
            published: Utc::now(),
        })
    }
}

/// Prefix a key frame with the cached parameter sets unless it carries them
fn with_parameter_sets(family: CodecFamily, params: &ParameterSets, data: &Bytes) -> Bytes {
    let first = split_annexb_nal_units(data).first().copied().unwrap_or_default();
    let carries_config = match family {
        CodecFamily::H264 => h264_nal_type(first) == Some(7),
        CodecFamily::Hevc => matches!(h265_nal_type(first), Some(32) | Some(33)),
        CodecFamily::Generic => true,
    };
    if carries_config {
        return data.clone();
    }

    let sets: Vec<&Bytes> = [&params.vps, &params.sps, &params.pps]
        .into_iter()
        .flatten()
        .collect();
    if sets.is_empty() {
        return data.clone();
    }
    let mut out = BytesMut::with_capacity(data.len() + 64);
    for nal in sets {
        out.put_slice(&START_CODE);
        out.put_slice(nal);
    }
    out.put_slice(data);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::ts::TS_PACKET_SIZE;

    fn frame(pts_ms: u64, key_frame: bool) -> MediaFrame {
        let mut frame = MediaFrame::new(
            Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88, 0x84]),
            pts_ms,
            Duration::from_millis(pts_ms),
        );
        frame.key_frame = key_frame;
        frame
    }

    fn params() -> ParameterSets {
        ParameterSets {
            vps: None,
            sps: Some(Bytes::from_static(&[0x67, 0x42, 0xe0, 0x1f])),
            pps: Some(Bytes::from_static(&[0x68, 0xce, 0x06, 0xe2])),
        }
    }

    #[test]
    fn waits_for_first_key_frame() {
        let mut segmenter = Segmenter::new(CodecFamily::H264, false, Duration::from_secs(1)).unwrap();
        assert!(segmenter.push_video(&frame(0, false), &params()).is_none());
        assert!(segmenter.open.is_none());
        segmenter.push_audio(&frame(0, true));
        assert!(segmenter.open.is_none());
    }

    #[test]
    fn cuts_on_key_frame_after_target() {
        let mut segmenter = Segmenter::new(CodecFamily::H264, false, Duration::from_secs(1)).unwrap();
        let p = params();
        assert!(segmenter.push_video(&frame(0, true), &p).is_none());
        assert!(segmenter.push_video(&frame(500, false), &p).is_none());
        // Key frame before the target keeps the segment open
        assert!(segmenter.push_video(&frame(800, true), &p).is_none());
        assert!(segmenter.push_video(&frame(1000, false), &p).is_none());

        let segment = segmenter.push_video(&frame(1200, true), &p).unwrap();
        assert_eq!(segment.sequence, 0);
        assert_eq!(segment.duration, Duration::from_millis(1200));
        assert_eq!(segment.data.len() % TS_PACKET_SIZE, 0);
        assert_eq!(segment.data[0], 0x47);

        let next = segmenter.push_video(&frame(2500, true), &p).unwrap();
        assert_eq!(next.sequence, 1);
    }

    #[test]
    fn key_frames_gain_parameter_sets() {
        let data = Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]);
        let out = with_parameter_sets(CodecFamily::H264, &params(), &data);
        let nals = split_annexb_nal_units(&out);
        assert_eq!(nals.len(), 3);
        assert_eq!(h264_nal_type(nals[0]), Some(7));
        assert_eq!(h264_nal_type(nals[1]), Some(8));
        assert_eq!(h264_nal_type(nals[2]), Some(5));

        let already = with_parameter_sets(CodecFamily::H264, &params(), &out);
        assert_eq!(already.len(), out.len());
    }

    #[test]
    fn generic_video_is_not_segmentable() {
        assert!(Segmenter::new(CodecFamily::Generic, false, Duration::from_secs(2)).is_none());
    }

    #[test]
    fn window_keeps_latest_segments() {
        let mut window = SegmentWindow::new(Duration::from_secs(2), 3);
        for sequence in 0..5 {
            window.push(Segment {
                sequence,
                duration: Duration::from_millis(2100),
                data: Bytes::new(),
                published: Utc::now(),
            });
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.first_sequence(), 2);
        assert!(window.get(1).is_none());
        assert!(window.get(4).is_some());
        assert_eq!(window.target_duration_secs(), 3);
    }
}
