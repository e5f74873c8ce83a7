//! Frame readers and the background capture loop

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::frame::CapturedBuffer;
use super::queue::FrameQueue;
use crate::utils::LogThrottler;

/// Poll interval used by the background capture loop
pub const CAPTURE_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Anything that yields captured buffers: a V4L2 mmap stream, an ALSA PCM,
/// or a scripted reader in tests.
pub trait FrameReader: Send + 'static {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Wait up to `timeout` for the next buffer. `Ok(None)` means nothing
    /// was ready in time; a zero timeout never blocks.
    fn read_frame(&mut self, timeout: Duration) -> io::Result<Option<Bytes>>;
}

impl FrameReader for Box<dyn FrameReader> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read_frame(&mut self, timeout: Duration) -> io::Result<Option<Bytes>> {
        (**self).read_frame(timeout)
    }
}

/// Errors after which a device will not come back on its own
pub fn is_device_lost(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENXIO) | Some(libc::ENODEV) | Some(libc::EIO) | Some(libc::ESHUTDOWN)
    )
}

fn classify_error(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(code) => format!("capture_errno_{}", code),
        None => format!("capture_{:?}", err.kind()),
    }
}

/// Why a capture loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureExit {
    Cancelled,
    DeviceLost(String),
}

/// Read frames until cancelled or the device disappears.
///
/// Runs on a blocking thread. Every buffer goes into `queue`, which drops
/// its oldest entry when the consumer is behind.
pub fn run_capture_loop<R: FrameReader>(
    mut reader: R,
    queue: Arc<FrameQueue>,
    cancel: CancellationToken,
) -> CaptureExit {
    let throttler = LogThrottler::with_secs(5);
    let mut no_signal = false;

    info!("{}: capture started", reader.name());

    while !cancel.is_cancelled() {
        match reader.read_frame(CAPTURE_POLL_TIMEOUT) {
            Ok(Some(data)) => {
                if no_signal {
                    info!("{}: frames resumed", reader.name());
                    no_signal = false;
                    throttler.clear("no_signal");
                }
                queue.push(CapturedBuffer::new(data));
            }
            Ok(None) => {
                if throttler.should_log("no_signal") {
                    warn!("{}: capture timeout - no signal?", reader.name());
                }
                no_signal = true;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_device_lost(&e) => {
                error!("{}: device lost: {}", reader.name(), e);
                return CaptureExit::DeviceLost(e.to_string());
            }
            Err(e) => {
                match throttler.check(&classify_error(&e)) {
                    Some(0) => error!("{}: capture error: {}", reader.name(), e),
                    Some(repeats) => error!(
                        "{}: capture error: {} (suppressed {} repeats)",
                        reader.name(),
                        e,
                        repeats
                    ),
                    None => {}
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    debug!("{}: capture stopped", reader.name());
    CaptureExit::Cancelled
}
