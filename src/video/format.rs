//! Pixel format definitions and conversions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Four-character code identifying a V4L2 pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const fn new(repr: &[u8; 4]) -> Self {
        Self(*repr)
    }

    /// Decode a user supplied format string.
    ///
    /// Only the first four bytes are significant, shorter strings are padded
    /// with zero bytes (so "H264" and "H2640" decode to the same code).
    pub fn from_name(name: &str) -> Self {
        let mut repr = [0u8; 4];
        for (dst, src) in repr.iter_mut().zip(name.as_bytes()) {
            *dst = *src;
        }
        Self(repr)
    }

    /// Little-endian numeric value, as used by the kernel headers
    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn from_u32(code: u32) -> Self {
        Self(code.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().take_while(|b| **b != 0) {
            write!(f, "{}", *byte as char)?;
        }
        Ok(())
    }
}

impl From<v4l::FourCC> for FourCc {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCc> for v4l::FourCC {
    fn from(fourcc: FourCc) -> Self {
        v4l::FourCC::new(&fourcc.0)
    }
}

/// Known pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// H.264 elementary stream (hardware encoder cameras)
    H264,
    /// H.265/HEVC elementary stream
    Hevc,
    /// VP8 compressed frames
    Vp8,
    /// VP9 compressed frames
    Vp9,
    /// MJPEG compressed format
    Mjpeg,
    /// JPEG compressed format
    Jpeg,
    /// YUYV 4:2:2 packed format
    Yuyv,
    /// UYVY 4:2:2 packed format
    Uyvy,
    /// NV12 semi-planar format
    Nv12,
    /// YUV420 planar format
    Yuv420,
    /// RGB24 format (3 bytes per pixel)
    Rgb24,
    /// Grayscale format
    Grey,
}

/// Codec family, used to pick a framing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecFamily {
    H264,
    Hevc,
    Generic,
}

impl PixelFormat {
    /// Try to convert from FourCC
    pub fn from_fourcc(fourcc: FourCc) -> Option<Self> {
        match &fourcc.0 {
            b"H264" => Some(PixelFormat::H264),
            b"HEVC" | b"H265" => Some(PixelFormat::Hevc),
            b"VP80" => Some(PixelFormat::Vp8),
            b"VP90" => Some(PixelFormat::Vp9),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"JPEG" => Some(PixelFormat::Jpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"UYVY" => Some(PixelFormat::Uyvy),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YU12" | b"I420" => Some(PixelFormat::Yuv420),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"GREY" | b"Y800" => Some(PixelFormat::Grey),
            _ => None,
        }
    }

    /// Codec family for framing selection
    pub fn family(&self) -> CodecFamily {
        match self {
            PixelFormat::H264 => CodecFamily::H264,
            PixelFormat::Hevc => CodecFamily::Hevc,
            _ => CodecFamily::Generic,
        }
    }

    /// RTP mime type for the format, `None` when it cannot be streamed
    pub fn rtp_mime(&self) -> Option<&'static str> {
        match self {
            PixelFormat::Hevc => Some("video/H265"),
            PixelFormat::H264 => Some("video/H264"),
            PixelFormat::Mjpeg | PixelFormat::Jpeg => Some("video/JPEG"),
            PixelFormat::Vp8 => Some("video/VP8"),
            PixelFormat::Vp9 => Some("video/VP9"),
            PixelFormat::Yuyv => Some("video/RAW"),
            _ => None,
        }
    }
}

/// RTP mime for an arbitrary four-character code
pub fn video_rtp_mime(fourcc: FourCc) -> Option<&'static str> {
    PixelFormat::from_fourcc(fourcc).and_then(|f| f.rtp_mime())
}

/// Codec family for an arbitrary four-character code
pub fn codec_family(fourcc: FourCc) -> CodecFamily {
    PixelFormat::from_fourcc(fourcc)
        .map(|f| f.family())
        .unwrap_or(CodecFamily::Generic)
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::H264 => "H264",
            PixelFormat::Hevc => "HEVC",
            PixelFormat::Vp8 => "VP8",
            PixelFormat::Vp9 => "VP9",
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Jpeg => "JPEG",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Grey => "GREY",
        };
        write!(f, "{}", name)
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}
