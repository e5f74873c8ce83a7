//! Elementary stream sources and the factory that builds them

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{MediaFrame, StreamInfo};
use super::framing::{Framer, ParameterSets};
use super::queue::FrameQueue;
use super::reader::{is_device_lost, run_capture_loop, CaptureExit, FrameReader};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::video::format::{codec_family, video_rtp_mime, CodecFamily};
use crate::video::negotiate::NegotiatedFormat;

/// Interval between reads when capture runs inside the serving loop
const POLL_TICK: Duration = Duration::from_millis(5);

/// Options shared by every source built in one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOptions {
    pub queue_size: usize,
    pub use_thread: bool,
    pub repeat_config: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            queue_size: 10,
            use_thread: true,
            repeat_config: true,
        }
    }
}

/// Wraps negotiated capture handles into stream sources
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureSourceFactory {
    options: SourceOptions,
}

impl CaptureSourceFactory {
    pub fn new(options: SourceOptions) -> Self {
        Self { options }
    }

    /// Build a video source. Framing is picked from the negotiated format;
    /// unknown formats get pass-through framing. Fails only when the format
    /// has no RTP mapping at all.
    pub fn create_video_source<R: FrameReader>(
        &self,
        format: &NegotiatedFormat,
        reader: R,
    ) -> Result<ElementaryStreamSource> {
        let mime = video_rtp_mime(format.fourcc).ok_or_else(|| AppError::SourceCreation {
            media: "video".to_string(),
            reason: format!("no streaming format supported for {}", format.fourcc),
        })?;
        let info = StreamInfo::video(mime, format.buffer_size as usize);
        Ok(self.create_source(codec_family(format.fourcc), info, reader))
    }

    /// Build a source with an explicit framing family
    pub fn create_source<R: FrameReader>(
        &self,
        family: CodecFamily,
        info: StreamInfo,
        reader: R,
    ) -> ElementaryStreamSource {
        debug!(
            "Creating {} source {} ({:?} framing, queue {}, thread {})",
            info.media, info.rtp_mime, family, self.options.queue_size, self.options.use_thread
        );
        ElementaryStreamSource {
            framer: Framer::for_family(family, self.options.repeat_config),
            queue: Arc::new(FrameQueue::new(self.options.queue_size)),
            driver: if self.options.use_thread {
                Driver::Background {
                    reader: Some(Box::new(reader)),
                    task: None,
                }
            } else {
                Driver::Polled(Box::new(reader))
            },
            info,
            sequence: 0,
            started: Instant::now(),
            throttler: LogThrottler::with_secs(5),
        }
    }
}

enum Driver {
    /// Reader moves to a blocking thread on `start`
    Background {
        reader: Option<Box<dyn FrameReader>>,
        task: Option<JoinHandle<CaptureExit>>,
    },
    /// Reader is polled from `next_frame`
    Polled(Box<dyn FrameReader>),
}

/// One logical stream (video or audio) fed by one capture handle
pub struct ElementaryStreamSource {
    info: StreamInfo,
    framer: Framer,
    queue: Arc<FrameQueue>,
    driver: Driver,
    sequence: u64,
    started: Instant,
    throttler: LogThrottler,
}

impl ElementaryStreamSource {
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn family(&self) -> CodecFamily {
        self.framer.family()
    }

    pub fn parameter_sets(&self) -> Option<&ParameterSets> {
        self.framer.parameter_sets()
    }

    pub fn is_threaded(&self) -> bool {
        matches!(self.driver, Driver::Background { .. })
    }

    /// Start the background capture context, if this source uses one.
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, cancel: &CancellationToken) {
        self.started = Instant::now();
        let Driver::Background { reader, task } = &mut self.driver else {
            return;
        };
        let Some(reader) = reader.take() else {
            return;
        };

        let queue = self.queue.clone();
        let cancel = cancel.clone();
        let name = reader.name().to_string();
        info!("{}: starting capture thread", name);
        *task = Some(tokio::task::spawn_blocking(move || {
            let exit = run_capture_loop(reader, queue.clone(), cancel);
            queue.close();
            exit
        }));
    }

    /// Next framed frame. `None` once the capture context has ended.
    pub async fn next_frame(&mut self) -> Option<MediaFrame> {
        let buffer = match &mut self.driver {
            Driver::Background { .. } => self.queue.pop().await?,
            Driver::Polled(reader) => loop {
                if self.queue.is_closed() && self.queue.is_empty() {
                    return None;
                }
                match reader.read_frame(Duration::ZERO) {
                    Ok(Some(data)) => self.queue.push(super::frame::CapturedBuffer::new(data)),
                    Ok(None) => {}
                    Err(e) if is_device_lost(&e) => {
                        warn!("{}: device lost: {}", reader.name(), e);
                        self.queue.close();
                    }
                    Err(e) => match self.throttler.check("read_error") {
                        Some(0) => warn!("{}: read failed: {}", reader.name(), e),
                        Some(repeats) => warn!(
                            "{}: read failed: {} (suppressed {} repeats)",
                            reader.name(),
                            e,
                            repeats
                        ),
                        None => {}
                    },
                }
                if let Some(buffer) = self.queue.try_pop() {
                    break buffer;
                }
                tokio::time::sleep(POLL_TICK).await;
            },
        };

        let framed = self.framer.frame(buffer.data);
        let frame = MediaFrame {
            data: framed.data,
            key_frame: framed.key_frame,
            sequence: self.sequence,
            pts: buffer.capture_ts.saturating_duration_since(self.started),
            capture_ts: buffer.capture_ts,
        };
        self.sequence += 1;
        Some(frame)
    }

    /// Wait for the capture thread to exit
    pub async fn join(&mut self) -> Option<CaptureExit> {
        if let Driver::Background { task, .. } = &mut self.driver {
            if let Some(task) = task.take() {
                return task.await.ok();
            }
        }
        None
    }
}
