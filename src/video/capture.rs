//! V4L2 capture through memory-mapped buffers

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};
use v4l::buffer::Type;
use v4l::device::Handle;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::{CaptureStream, Stream};

use super::device::{CaptureHandle, VideoDevice};
use super::negotiate::NegotiatedFormat;
use crate::error::{AppError, Result};
use crate::stream::FrameReader;

/// Default number of capture buffers
pub const DEFAULT_BUFFER_COUNT: u32 = 4;

/// One buffer is always held by the reader, so at least one more must be
/// queued for the driver to fill
const MIN_BUFFER_COUNT: u32 = 2;

/// Buffer ring operations the reader drives
pub(crate) trait BufferRing: Send {
    /// Queue every buffer but the held one and turn streaming on
    fn start(&mut self) -> io::Result<()>;

    /// Wait up to `timeout` for a filled buffer. Never touches the queue.
    fn poll_ready(&self, timeout: Duration) -> io::Result<bool>;

    /// Give back the held buffer and take the filled one. Only called after
    /// `poll_ready` said a buffer is waiting.
    fn swap(&mut self) -> io::Result<(Bytes, u32)>;
}

/// `v4l` mmap stream driven through readiness polling.
///
/// `CaptureStream::next` re-queues the held buffer before it waits; if that
/// wait timed out the buffer would be queued twice on the next call. The
/// ring therefore only calls `next` once the device is readable.
struct MmapRing {
    stream: MmapStream<'static>,
    handle: Arc<Handle>,
    buffer_count: u32,
}

impl BufferRing for MmapRing {
    fn start(&mut self) -> io::Result<()> {
        // Index 0 stays out: `next` queues it before its first dequeue
        let mut queued = 0;
        for index in 1..self.buffer_count as usize {
            match CaptureStream::queue(&mut self.stream, index) {
                Ok(()) => queued += 1,
                // The driver allocated fewer buffers than requested
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) && queued > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Stream::start(&mut self.stream)
    }

    fn poll_ready(&self, timeout: Duration) -> io::Result<bool> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        Ok(self.handle.poll(libc::POLLIN, timeout_ms)? > 0)
    }

    fn swap(&mut self) -> io::Result<(Bytes, u32)> {
        let (buf, meta) = CaptureStream::next(&mut self.stream)?;
        let used = (meta.bytesused as usize).min(buf.len());
        Ok((Bytes::copy_from_slice(&buf[..used]), meta.sequence))
    }
}

/// Reads frames from a negotiated V4L2 capture device
pub struct V4l2FrameReader {
    name: String,
    format: NegotiatedFormat,
    verbose: u8,
    streaming: bool,
    ring: Box<dyn BufferRing>,
    // Keeps the device open for as long as the stream exists
    _handle: Option<CaptureHandle<VideoDevice>>,
}

impl V4l2FrameReader {
    /// Map `buffer_count` buffers on the device. Streaming starts on the first read.
    pub fn new(handle: CaptureHandle<VideoDevice>, buffer_count: u32) -> Result<Self> {
        let name = handle.device().path.display().to_string();
        let buffer_count = buffer_count.max(MIN_BUFFER_COUNT);
        let stream =
            MmapStream::with_buffers(handle.device().inner(), Type::VideoCapture, buffer_count)
                .map_err(|e| AppError::SourceCreation {
                    media: name.clone(),
                    reason: format!("cannot map capture buffers: {}", e),
                })?;

        info!(
            "{}: mapped {} buffers for {}",
            name,
            buffer_count,
            handle.format()
        );

        let ring = MmapRing {
            handle: stream.handle(),
            stream,
            buffer_count,
        };
        Ok(Self {
            format: handle.format(),
            verbose: handle.params().verbose,
            streaming: false,
            ring: Box::new(ring),
            name,
            _handle: Some(handle),
        })
    }

    pub fn format(&self) -> NegotiatedFormat {
        self.format
    }
}

impl FrameReader for V4l2FrameReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_frame(&mut self, timeout: Duration) -> io::Result<Option<Bytes>> {
        if !self.streaming {
            self.ring.start()?;
            self.streaming = true;
            debug!("{}: streaming on", self.name);
        }

        if !self.ring.poll_ready(timeout)? {
            return Ok(None);
        }

        let (data, sequence) = self.ring.swap()?;
        if self.verbose > 1 {
            debug!("{}: frame seq:{} size:{}", self.name, sequence, data.len());
        }
        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::FourCc;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Models the driver queue: a buffer may never be queued twice
    #[derive(Default)]
    struct RingState {
        started: bool,
        held: Option<usize>,
        queued: Vec<usize>,
        filled: VecDeque<(usize, &'static [u8])>,
        double_queue: bool,
    }

    struct FakeRing(Arc<Mutex<RingState>>);

    impl BufferRing for FakeRing {
        fn start(&mut self) -> io::Result<()> {
            let mut state = self.0.lock();
            state.started = true;
            state.held = Some(0);
            state.queued = vec![1, 2, 3];
            Ok(())
        }

        fn poll_ready(&self, _timeout: Duration) -> io::Result<bool> {
            Ok(!self.0.lock().filled.is_empty())
        }

        fn swap(&mut self) -> io::Result<(Bytes, u32)> {
            let mut state = self.0.lock();
            if let Some(held) = state.held.take() {
                if state.queued.contains(&held) {
                    state.double_queue = true;
                    return Err(io::Error::from_raw_os_error(libc::EINVAL));
                }
                state.queued.push(held);
            }
            let (index, data) = state
                .filled
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
            state.queued.retain(|i| *i != index);
            state.held = Some(index);
            Ok((Bytes::from_static(data), index as u32))
        }
    }

    fn reader(state: Arc<Mutex<RingState>>) -> V4l2FrameReader {
        V4l2FrameReader {
            name: "fake0".to_string(),
            format: NegotiatedFormat {
                fourcc: FourCc::new(b"MJPG"),
                width: 640,
                height: 480,
                buffer_size: 614_400,
            },
            verbose: 2,
            streaming: false,
            ring: Box::new(FakeRing(state)),
            _handle: None,
        }
    }

    #[test]
    fn timeout_then_frame_keeps_the_ring_consistent() {
        let state = Arc::new(Mutex::new(RingState::default()));
        let mut reader = reader(state.clone());

        assert!(reader.read_frame(Duration::ZERO).unwrap().is_none());
        assert!(reader.read_frame(Duration::from_millis(500)).unwrap().is_none());
        assert!(state.lock().started);

        state.lock().filled.push_back((1, b"first"));
        let frame = reader.read_frame(Duration::ZERO).unwrap().unwrap();
        assert_eq!(frame.as_ref(), b"first");

        assert!(reader.read_frame(Duration::ZERO).unwrap().is_none());
        state.lock().filled.push_back((2, b"second"));
        let frame = reader.read_frame(Duration::ZERO).unwrap().unwrap();
        assert_eq!(frame.as_ref(), b"second");

        let state = state.lock();
        assert!(!state.double_queue);
        assert_eq!(state.held, Some(2));
        assert!(state.queued.contains(&1));
    }

    #[test]
    fn ring_is_started_once() {
        let state = Arc::new(Mutex::new(RingState::default()));
        let mut reader = reader(state.clone());
        reader.read_frame(Duration::ZERO).unwrap();
        state.lock().started = false;
        reader.read_frame(Duration::ZERO).unwrap();
        assert!(!state.lock().started);
    }
}
