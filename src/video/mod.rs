//! Video capture devices
//!
//! Capability validation, format negotiation and the mmap frame reader.

pub mod capability;
pub mod capture;
pub mod device;
pub mod format;
pub mod negotiate;

pub use capability::CapabilityMask;
pub use capture::V4l2FrameReader;
pub use device::{CaptureHandle, DeviceControl, VideoDevice};
pub use format::{CodecFamily, FourCc, PixelFormat, Resolution};
pub use negotiate::{negotiate, packet_budget, DeviceParameters, NegotiatedFormat, Negotiation};
