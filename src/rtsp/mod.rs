//! RTSP delivery: payloaders, session descriptions and the server

pub mod h265;
pub mod jpeg;
pub mod multicast;
pub mod payload;
pub mod protocol;
pub mod pump;
pub mod sdp;
pub mod server;

pub use payload::{RtpDescriptor, RtpTrack};
pub use server::RtspServer;
