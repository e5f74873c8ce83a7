//! v4l2-relay
//!
//! Negotiates V4L2 capture formats, captures video and ALSA audio, and
//! serves the streams as unicast and multicast RTSP sessions plus
//! segmented HLS/MPEG-DASH over HTTP.

pub mod app;
pub mod audio;
pub mod config;
pub mod error;
pub mod hls;
pub mod rtsp;
pub mod session;
pub mod stream;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
