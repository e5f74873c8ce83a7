//! Device capability mask and mandatory-capability validation

use bitflags::bitflags;
use tracing::{debug, info, warn};

use super::device::DeviceControl;
use crate::error::{AppError, Result};

bitflags! {
    /// Capabilities a device can report.
    ///
    /// Bit values follow `linux/videodev2.h` (`V4L2_CAP_*`, and
    /// `V4L2_CAP_TIMEPERFRAME` for the frame-rate capability).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CapabilityMask: u32 {
        const CAPTURE = 0x0000_0001;
        const OUTPUT = 0x0000_0002;
        const TIME_PER_FRAME = 0x0000_1000;
        const READ_WRITE = 0x0100_0000;
        const STREAMING = 0x0400_0000;
    }
}

impl CapabilityMask {
    /// Default requirement for a capture device driven through mmap buffers
    pub fn capture_streaming() -> Self {
        Self::CAPTURE | Self::STREAMING
    }

    /// Bits of `mandatory` that are absent from `self`
    pub fn missing(&self, mandatory: CapabilityMask) -> CapabilityMask {
        mandatory - *self
    }

    /// Whether every bit of `mandatory` is present
    pub fn satisfies(&self, mandatory: CapabilityMask) -> bool {
        (*self & mandatory) == mandatory
    }
}

/// Check that an opened device exposes every mandatory capability.
///
/// The capability query is issued exactly once. Absence is permanent, so
/// there is no retry.
pub fn validate<D: DeviceControl + ?Sized>(
    device: &D,
    mandatory: CapabilityMask,
    verbose: u8,
) -> Result<CapabilityMask> {
    let name = device.name();
    let reported = device.query_capabilities().map_err(|e| AppError::Capability {
        device: name.to_string(),
        reason: format!("cannot get capabilities: {}", e),
    })?;

    debug!(
        "{}: capabilities {:#010x} mandatory {:#010x}",
        name,
        reported.bits(),
        mandatory.bits()
    );
    if verbose > 0 {
        for (flag, label) in [
            (CapabilityMask::OUTPUT, "output"),
            (CapabilityMask::CAPTURE, "capture"),
            (CapabilityMask::READ_WRITE, "read/write"),
            (CapabilityMask::STREAMING, "streaming"),
            (CapabilityMask::TIME_PER_FRAME, "timeperframe"),
        ] {
            if reported.contains(flag) {
                info!("{} supports {}", name, label);
            }
        }
    }

    if !reported.satisfies(mandatory) {
        let missing = reported.missing(mandatory);
        warn!("Mandatory capability not available for {}: {:?}", name, missing);
        return Err(AppError::Capability {
            device: name.to_string(),
            reason: format!("missing mandatory capabilities {:?}", missing),
        });
    }

    Ok(reported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::device::testing::FakeDevice;

    #[test]
    fn satisfies_iff_all_mandatory_bits_present() {
        let all = [
            CapabilityMask::CAPTURE,
            CapabilityMask::OUTPUT,
            CapabilityMask::TIME_PER_FRAME,
            CapabilityMask::READ_WRITE,
            CapabilityMask::STREAMING,
        ];
        // Exhaustive over every (reported, mandatory) pair of subsets
        for c in 0u32..32 {
            for m in 0u32..32 {
                let build = |bits: u32| {
                    all.iter()
                        .enumerate()
                        .filter(|(i, _)| bits & (1 << i) != 0)
                        .fold(CapabilityMask::empty(), |acc, (_, f)| acc | *f)
                };
                let reported = build(c);
                let mandatory = build(m);
                assert_eq!(
                    reported.satisfies(mandatory),
                    (reported.bits() & mandatory.bits()) == mandatory.bits()
                );
            }
        }
    }

    #[test]
    fn flag_order_does_not_matter() {
        let a = CapabilityMask::STREAMING | CapabilityMask::CAPTURE;
        let b = CapabilityMask::CAPTURE | CapabilityMask::STREAMING;
        let reported = CapabilityMask::CAPTURE | CapabilityMask::STREAMING | CapabilityMask::READ_WRITE;
        assert_eq!(reported.satisfies(a), reported.satisfies(b));
    }

    #[test]
    fn capture_only_device_fails_streaming_requirement() {
        let device = FakeDevice::new(CapabilityMask::CAPTURE);
        let err = validate(&device, CapabilityMask::capture_streaming(), 0).unwrap_err();
        assert!(matches!(err, AppError::Capability { .. }));
        assert_eq!(device.capability_queries(), 1);
    }

    #[test]
    fn failing_capability_query_is_an_error() {
        let mut device = FakeDevice::new(CapabilityMask::all());
        device.fail_capability_query = true;
        let err = validate(&device, CapabilityMask::empty(), 0).unwrap_err();
        assert!(matches!(err, AppError::Capability { .. }));
    }

    #[test]
    fn empty_mask_always_passes() {
        let device = FakeDevice::new(CapabilityMask::empty());
        assert!(validate(&device, CapabilityMask::empty(), 2).is_ok());
    }
}
