//! Frame data structures shared by sources, replicators and delivery legs

use bytes::Bytes;
use std::fmt;
use std::time::{Duration, Instant};

/// Media type of an elementary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// Static description of an elementary stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub media: MediaKind,
    /// RTP mime, e.g. `video/H264` or `audio/L16/44100/2`
    pub rtp_mime: String,
    /// RTP clock rate in Hz
    pub clock_rate: u32,
    /// Audio channel count (1 for video)
    pub channels: u32,
    /// Largest frame the source can produce
    pub max_frame_size: usize,
    /// Sample width of little-endian PCM that must be swapped to network order
    pub pcm_swap_width: Option<usize>,
}

impl StreamInfo {
    pub fn video(rtp_mime: &str, max_frame_size: usize) -> Self {
        Self {
            media: MediaKind::Video,
            rtp_mime: rtp_mime.to_string(),
            clock_rate: 90_000,
            channels: 1,
            max_frame_size,
            pcm_swap_width: None,
        }
    }

    /// Encoding name as used in `a=rtpmap` (`H264`, `JPEG`, `L16`, ...)
    pub fn encoding_name(&self) -> &str {
        self.rtp_mime.split('/').nth(1).unwrap_or_default()
    }
}

/// A captured frame after framing
#[derive(Debug, Clone)]
pub struct MediaFrame {
    /// Frame payload (Annex B for H.264/H.265, raw otherwise)
    pub data: Bytes,
    /// Whether decoding can start at this frame
    pub key_frame: bool,
    /// Frame sequence number
    pub sequence: u64,
    /// Presentation time relative to the start of the source
    pub pts: Duration,
    /// Timestamp when frame was captured
    pub capture_ts: Instant,
}

impl MediaFrame {
    pub fn new(data: Bytes, sequence: u64, pts: Duration) -> Self {
        Self {
            data,
            key_frame: true,
            sequence,
            pts,
            capture_ts: Instant::now(),
        }
    }

    /// Get data length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if frame is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// RTP timestamp for a clock rate
    pub fn rtp_timestamp(&self, clock_rate: u32) -> u32 {
        ((self.pts.as_micros() as u64 * clock_rate as u64) / 1_000_000) as u32
    }
}

/// A raw buffer as it left the capture device
#[derive(Debug, Clone)]
pub struct CapturedBuffer {
    pub data: Bytes,
    pub capture_ts: Instant,
}

impl CapturedBuffer {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            capture_ts: Instant::now(),
        }
    }
}
