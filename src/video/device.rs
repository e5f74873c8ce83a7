//! V4L2 device control and the capture handle

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use v4l::capability::Flags;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Format;

use super::capability::{self, CapabilityMask};
use super::format::{FourCc, PixelFormat};
use super::negotiate::{
    self, DeviceParameters, FormatRequest, FrameInterval, Negotiation, NegotiatedFormat,
};
use crate::error::{AppError, Result};

/// Control operations negotiation needs from a device
pub trait DeviceControl {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    fn query_capabilities(&self) -> io::Result<CapabilityMask>;

    /// Currently active format
    fn query_format(&self) -> io::Result<NegotiatedFormat>;

    /// Request a format; returns what the device actually applied
    fn set_format(&mut self, request: &FormatRequest) -> io::Result<NegotiatedFormat>;

    /// Request a frame rate; returns the interval the device settled on
    fn set_frame_rate(&mut self, fps: u32) -> io::Result<FrameInterval>;
}

/// Wrapper around a V4L2 video device
pub struct VideoDevice {
    pub path: PathBuf,
    name: String,
    device: Device,
}

impl VideoDevice {
    /// Open a video device by path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening video device: {:?}", path);

        let meta = std::fs::metadata(&path).map_err(|e| {
            AppError::VideoError(format!("Cannot stat device {:?}: {}", path, e))
        })?;
        if !meta.file_type().is_char_device() {
            return Err(AppError::VideoError(format!(
                "{:?} is not a character device",
                path
            )));
        }

        let device = Device::with_path(&path).map_err(|e| {
            AppError::VideoError(format!("Failed to open device {:?}: {}", path, e))
        })?;

        Ok(Self {
            name: path.display().to_string(),
            path,
            device,
        })
    }

    /// Get the inner device reference
    pub fn inner(&self) -> &Device {
        &self.device
    }
}

fn to_negotiated(format: &Format) -> NegotiatedFormat {
    NegotiatedFormat {
        fourcc: FourCc::from(format.fourcc),
        width: format.width,
        height: format.height,
        buffer_size: format.size,
    }
}

impl DeviceControl for VideoDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_capabilities(&self) -> io::Result<CapabilityMask> {
        let caps = self.device.query_caps()?;
        let flags = caps.capabilities;
        debug!("{}: driver {} card {}", self.name, caps.driver, caps.card);

        let mut mask = CapabilityMask::empty();
        mask.set(
            CapabilityMask::CAPTURE,
            flags.contains(Flags::VIDEO_CAPTURE) || flags.contains(Flags::VIDEO_CAPTURE_MPLANE),
        );
        mask.set(
            CapabilityMask::OUTPUT,
            flags.contains(Flags::VIDEO_OUTPUT) || flags.contains(Flags::VIDEO_OUTPUT_MPLANE),
        );
        mask.set(CapabilityMask::READ_WRITE, flags.contains(Flags::READ_WRITE));
        mask.set(CapabilityMask::STREAMING, flags.contains(Flags::STREAMING));

        // Frame interval control is reported through the stream parameters
        if mask.contains(CapabilityMask::CAPTURE) {
            match self.device.params() {
                Ok(params) => mask.set(
                    CapabilityMask::TIME_PER_FRAME,
                    params
                        .capabilities
                        .contains(v4l::parameters::Capabilities::TIME_PER_FRAME),
                ),
                Err(e) => debug!("{}: cannot read stream parameters: {}", self.name, e),
            }
        }

        Ok(mask)
    }

    fn query_format(&self) -> io::Result<NegotiatedFormat> {
        self.device.format().map(|f| to_negotiated(&f))
    }

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<NegotiatedFormat> {
        // Format::new leaves the field order as "any"
        let fmt = Format::new(request.width, request.height, request.fourcc.into());
        self.device.set_format(&fmt).map(|f| to_negotiated(&f))
    }

    fn set_frame_rate(&mut self, fps: u32) -> io::Result<FrameInterval> {
        let applied = self.device.set_params(&Parameters::with_fps(fps))?;
        Ok(FrameInterval {
            numerator: applied.interval.numerator,
            denominator: applied.interval.denominator,
        })
    }
}

/// Exclusive owner of one opened, negotiated device.
///
/// Holds at most one negotiated format; renegotiation replaces it whole.
pub struct CaptureHandle<D: DeviceControl = VideoDevice> {
    device: D,
    params: DeviceParameters,
    format: NegotiatedFormat,
}

impl CaptureHandle<VideoDevice> {
    /// Open the device at `params.device_path`, validate and negotiate it
    pub fn open(params: &DeviceParameters, mandatory: CapabilityMask) -> Result<Self> {
        let device = VideoDevice::open(&params.device_path)?;
        Self::init(device, params, mandatory).map(|(handle, _)| handle)
    }
}

impl<D: DeviceControl> CaptureHandle<D> {
    /// Validate capabilities, then negotiate. On any failure the device is
    /// dropped (closed) before the error is returned.
    pub fn init(
        mut device: D,
        params: &DeviceParameters,
        mandatory: CapabilityMask,
    ) -> Result<(Self, Negotiation)> {
        capability::validate(&device, mandatory, params.verbose)?;
        let negotiation = negotiate::negotiate(&mut device, params)?;

        info!(
            "{}: {} size:{}",
            device.name(),
            negotiation.format.fourcc,
            negotiation.format.resolution()
        );

        Ok((
            Self {
                device,
                params: params.clone(),
                format: negotiation.format,
            },
            negotiation,
        ))
    }

    /// Negotiate again with new parameters
    pub fn renegotiate(&mut self, params: &DeviceParameters) -> Result<Negotiation> {
        let negotiation = negotiate::negotiate(&mut self.device, params)?;
        self.format = negotiation.format;
        self.params = params.clone();
        Ok(negotiation)
    }

    pub fn format(&self) -> NegotiatedFormat {
        self.format
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_fourcc(self.format.fourcc)
    }

    pub fn params(&self) -> &DeviceParameters {
        &self.params
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::Cell;
    use std::collections::HashMap;

    use super::*;

    /// In-memory device that records every mutating call
    pub struct FakeDevice {
        pub caps: CapabilityMask,
        pub fail_capability_query: bool,
        pub current: NegotiatedFormat,
        /// Formats whose set call fails outright
        pub rejected: Vec<FourCc>,
        /// (requested, reported) pixel format substitutions
        pub substitutions: Vec<(FourCc, FourCc)>,
        /// Size the device settles on regardless of the request
        pub size_override: Option<(u32, u32)>,
        pub buffer_sizes: HashMap<FourCc, u32>,
        pub reject_frame_rate: bool,
        pub frame_rate_override: Option<u32>,
        pub format_writes: Vec<FormatRequest>,
        pub frame_rate_writes: Vec<u32>,
        queries: Cell<usize>,
    }

    impl FakeDevice {
        pub fn new(caps: CapabilityMask) -> Self {
            Self {
                caps,
                fail_capability_query: false,
                current: NegotiatedFormat {
                    fourcc: FourCc::new(b"YUYV"),
                    width: 640,
                    height: 480,
                    buffer_size: 640 * 480 * 2,
                },
                rejected: Vec::new(),
                substitutions: Vec::new(),
                size_override: None,
                buffer_sizes: HashMap::new(),
                reject_frame_rate: false,
                frame_rate_override: None,
                format_writes: Vec::new(),
                frame_rate_writes: Vec::new(),
                queries: Cell::new(0),
            }
        }

        pub fn with_current(mut self, current: NegotiatedFormat) -> Self {
            self.current = current;
            self
        }

        pub fn capability_queries(&self) -> usize {
            self.queries.get()
        }
    }

    impl DeviceControl for FakeDevice {
        fn name(&self) -> &str {
            "fake0"
        }

        fn query_capabilities(&self) -> io::Result<CapabilityMask> {
            self.queries.set(self.queries.get() + 1);
            if self.fail_capability_query {
                return Err(io::Error::from_raw_os_error(25));
            }
            Ok(self.caps)
        }

        fn query_format(&self) -> io::Result<NegotiatedFormat> {
            Ok(self.current)
        }

        fn set_format(&mut self, request: &FormatRequest) -> io::Result<NegotiatedFormat> {
            self.format_writes.push(*request);
            if self.rejected.contains(&request.fourcc) {
                return Err(io::Error::from_raw_os_error(22));
            }
            let fourcc = self
                .substitutions
                .iter()
                .find(|(requested, _)| *requested == request.fourcc)
                .map(|(_, reported)| *reported)
                .unwrap_or(request.fourcc);
            let (width, height) = self.size_override.unwrap_or((request.width, request.height));
            let buffer_size = self
                .buffer_sizes
                .get(&fourcc)
                .copied()
                .unwrap_or(width * height * 2);
            self.current = NegotiatedFormat {
                fourcc,
                width,
                height,
                buffer_size,
            };
            Ok(self.current)
        }

        fn set_frame_rate(&mut self, fps: u32) -> io::Result<FrameInterval> {
            self.frame_rate_writes.push(fps);
            if self.reject_frame_rate {
                return Err(io::Error::from_raw_os_error(25));
            }
            Ok(FrameInterval::from_fps(self.frame_rate_override.unwrap_or(fps)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeDevice;
    use super::*;

    #[test]
    fn init_stops_before_negotiation_when_capabilities_are_missing() {
        let device = FakeDevice::new(CapabilityMask::CAPTURE);
        let params = DeviceParameters::new("/dev/video0")
            .with_format(FourCc::new(b"H264"))
            .with_resolution(1280, 720);

        let err = CaptureHandle::init(device, &params, CapabilityMask::capture_streaming())
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Capability { .. }));
    }

    #[test]
    fn init_stores_negotiated_format() {
        let device = FakeDevice::new(CapabilityMask::capture_streaming());
        let params = DeviceParameters::new("/dev/video0")
            .with_format(FourCc::new(b"H264"))
            .with_resolution(1280, 720);

        let (handle, negotiation) =
            CaptureHandle::init(device, &params, CapabilityMask::capture_streaming()).unwrap();
        assert_eq!(handle.format(), negotiation.format);
        assert_eq!(handle.pixel_format(), Some(PixelFormat::H264));
        assert_eq!(handle.device().format_writes.len(), 1);
    }

    #[test]
    fn renegotiation_replaces_the_format() {
        let device = FakeDevice::new(CapabilityMask::capture_streaming());
        let params = DeviceParameters::new("/dev/video0").with_format(FourCc::new(b"H264"));
        let (mut handle, _) =
            CaptureHandle::init(device, &params, CapabilityMask::empty()).unwrap();

        let next = DeviceParameters::new("/dev/video0")
            .with_format(FourCc::new(b"MJPG"))
            .with_resolution(1280, 720);
        handle.renegotiate(&next).unwrap();
        assert_eq!(handle.format().fourcc, FourCc::new(b"MJPG"));
        assert_eq!(handle.format().width, 1280);
        assert_eq!(handle.params(), &next);
    }

    #[test]
    fn opening_a_regular_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(VideoDevice::open(file.path()).is_err());
    }
}
