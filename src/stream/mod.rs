//! Elementary streams: capture queueing, framing and fan-out

pub mod frame;
pub mod framing;
pub mod queue;
pub mod reader;
pub mod replicator;
pub mod source;

pub use frame::{CapturedBuffer, MediaFrame, MediaKind, StreamInfo};
pub use framing::{Framer, ParameterSets};
pub use queue::FrameQueue;
pub use reader::{run_capture_loop, CaptureExit, FrameReader};
pub use replicator::StreamReplicator;
pub use source::{CaptureSourceFactory, ElementaryStreamSource, SourceOptions};
