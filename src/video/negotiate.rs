//! Capture format negotiation
//!
//! Drives a device into the first acceptable (format, width, height)
//! configuration from a ranked candidate list. The device's answers are
//! authoritative: a silently adjusted size is accepted, a substituted pixel
//! format is not.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::device::DeviceControl;
use super::format::{FourCc, Resolution};
use crate::error::{AppError, Result};

/// Smallest packet buffer handed to the delivery layer
pub const DEFAULT_PACKET_BUFFER: usize = 100_000;

/// Requested device configuration. Immutable input to negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceParameters {
    pub device_path: PathBuf,
    /// 0 keeps the current width
    pub width: u32,
    /// 0 keeps the current height
    pub height: u32,
    /// 0 leaves the frame rate untouched
    pub fps: u32,
    /// Ranked candidates, empty accepts whatever is current
    pub formats: Vec<FourCc>,
    /// 0 quiet, 1 verbose, 2 very verbose
    pub verbose: u8,
}

impl DeviceParameters {
    pub fn new(device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
            width: 0,
            height: 0,
            fps: 0,
            formats: Vec::new(),
            verbose: 0,
        }
    }

    pub fn with_format(mut self, fourcc: FourCc) -> Self {
        self.formats.push(fourcc);
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }
}

/// Format actually applied by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NegotiatedFormat {
    pub fourcc: FourCc,
    pub width: u32,
    pub height: u32,
    /// Bytes needed to hold one captured frame
    pub buffer_size: u32,
}

impl NegotiatedFormat {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    fn matches(&self, request: &FormatRequest) -> bool {
        self.fourcc == request.fourcc && self.width == request.width && self.height == request.height
    }
}

impl fmt::Display for NegotiatedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} bufferSize:{}",
            self.fourcc, self.width, self.height, self.buffer_size
        )
    }
}

/// A single set-format attempt. Field order is always "any".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub fourcc: FourCc,
    pub width: u32,
    pub height: u32,
}

/// Frame interval (seconds per frame as a fraction)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameInterval {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameInterval {
    pub fn from_fps(fps: u32) -> Self {
        Self {
            numerator: 1,
            denominator: fps,
        }
    }
}

impl fmt::Display for FrameInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Why a candidate was passed over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The set call itself failed
    DeviceRejected(String),
    /// The device answered with another pixel format
    FormatSubstituted { reported: FourCc },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::DeviceRejected(reason) => write!(f, "device rejected format: {}", reason),
            Rejection::FormatSubstituted { reported } => write!(f, "device picked {}", reported),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRejection {
    pub candidate: FourCc,
    pub reason: Rejection,
}

/// Result of the advisory frame-rate request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRateOutcome {
    NotRequested,
    Applied(FrameInterval),
    /// Hardware accepted the call but settled on another interval
    Altered { requested: FrameInterval, actual: FrameInterval },
    Rejected(String),
}

/// Full negotiation report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    pub format: NegotiatedFormat,
    /// The current configuration already satisfied the request
    pub reused_current: bool,
    /// Candidates tried before the accepted one, in rank order
    pub rejections: Vec<CandidateRejection>,
    /// Requested size when the device picked another one
    pub size_adjusted_from: Option<Resolution>,
    pub frame_rate: FrameRateOutcome,
}

/// Resolve target size and candidate list against the device baseline
fn plan(baseline: &NegotiatedFormat, params: &DeviceParameters) -> Vec<FormatRequest> {
    let width = if params.width != 0 {
        params.width
    } else {
        baseline.width
    };
    let height = if params.height != 0 {
        params.height
    } else {
        baseline.height
    };

    let candidates: Vec<FourCc> = if params.formats.is_empty() {
        vec![baseline.fourcc]
    } else {
        params.formats.clone()
    };

    candidates
        .into_iter()
        .map(|fourcc| FormatRequest {
            fourcc,
            width,
            height,
        })
        .collect()
}

/// Try one candidate
fn attempt<D: DeviceControl + ?Sized>(
    device: &mut D,
    request: &FormatRequest,
) -> std::result::Result<NegotiatedFormat, Rejection> {
    let applied = device
        .set_format(request)
        .map_err(|e| Rejection::DeviceRejected(e.to_string()))?;

    if applied.fourcc != request.fourcc {
        return Err(Rejection::FormatSubstituted {
            reported: applied.fourcc,
        });
    }

    Ok(applied)
}

/// Negotiate the capture format of an opened device.
///
/// Candidates are considered in rank order. When the active configuration
/// already equals one of them no device write is issued. Otherwise each
/// candidate is applied in turn until the device accepts one; the format is
/// then re-queried so the stored values are the device's own.
pub fn negotiate<D: DeviceControl + ?Sized>(
    device: &mut D,
    params: &DeviceParameters,
) -> Result<Negotiation> {
    let name = device.name().to_string();
    let baseline = device.query_format().map_err(|e| AppError::Format {
        device: name.clone(),
        reason: format!("cannot query current format: {}", e),
    })?;
    info!("{}: current format {}", name, baseline);

    let requests = plan(&baseline, params);

    if let Some(request) = requests.iter().find(|r| baseline.matches(r)) {
        debug!(
            "{}: current format {} {}x{} already satisfies the request",
            name, request.fourcc, request.width, request.height
        );
        let frame_rate = apply_frame_rate(device, &name, params.fps);
        return Ok(Negotiation {
            format: baseline,
            reused_current: true,
            rejections: Vec::new(),
            size_adjusted_from: None,
            frame_rate,
        });
    }

    let mut rejections = Vec::new();
    for request in &requests {
        match attempt(device, request) {
            Ok(applied) => {
                let requested = Resolution::new(request.width, request.height);
                let size_adjusted_from = if applied.resolution() != requested {
                    warn!(
                        "{}: cannot set size to {}, size is {}",
                        name,
                        requested,
                        applied.resolution()
                    );
                    Some(requested)
                } else {
                    None
                };

                let format = match device.query_format() {
                    Ok(current) => current,
                    Err(e) => {
                        debug!("{}: re-query after set failed, using set reply: {}", name, e);
                        applied
                    }
                };
                info!("{}: negotiated {}", name, format);

                let frame_rate = apply_frame_rate(device, &name, params.fps);
                return Ok(Negotiation {
                    format,
                    reused_current: false,
                    rejections,
                    size_adjusted_from,
                    frame_rate,
                });
            }
            Err(reason) => {
                if params.verbose > 0 {
                    info!("{}: candidate {} rejected: {}", name, request.fourcc, reason);
                } else {
                    debug!("{}: candidate {} rejected: {}", name, request.fourcc, reason);
                }
                rejections.push(CandidateRejection {
                    candidate: request.fourcc,
                    reason,
                });
            }
        }
    }

    let tried: Vec<String> = rejections
        .iter()
        .map(|r| format!("{} ({})", r.candidate, r.reason))
        .collect();
    Err(AppError::Format {
        device: name,
        reason: format!("no candidate format accepted: {}", tried.join(", ")),
    })
}

/// Best-effort frame-rate request. Never fails negotiation.
fn apply_frame_rate<D: DeviceControl + ?Sized>(
    device: &mut D,
    name: &str,
    fps: u32,
) -> FrameRateOutcome {
    if fps == 0 {
        return FrameRateOutcome::NotRequested;
    }

    let requested = FrameInterval::from_fps(fps);
    match device.set_frame_rate(fps) {
        Ok(actual) if actual == requested => {
            info!("{}: fps {}", name, actual);
            FrameRateOutcome::Applied(actual)
        }
        Ok(actual) => {
            warn!("{}: requested fps {}, device uses {}", name, requested, actual);
            FrameRateOutcome::Altered { requested, actual }
        }
        Err(e) => {
            warn!("{}: cannot set fps {}: {}", name, fps, e);
            FrameRateOutcome::Rejected(e.to_string())
        }
    }
}

/// Packet buffer size the delivery layer needs for the final frame sizes
/// of every source. Depends only on what the devices settled on, never on
/// the requests.
pub fn packet_budget(frame_sizes: impl IntoIterator<Item = usize>) -> usize {
    frame_sizes
        .into_iter()
        .fold(DEFAULT_PACKET_BUFFER, usize::max)
}
