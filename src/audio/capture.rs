//! ALSA audio capture

use std::io;
use std::time::Duration;

use alsa::pcm::{Access, Frames, HwParams, State, IO};
use alsa::{Direction, ValueOr, PCM};
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::format::SampleFormat;
use crate::error::{AppError, Result};
use crate::stream::{FrameReader, MediaKind, StreamInfo};

/// Audio capture parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioParameters {
    /// ALSA device name (e.g. "hw:1,0" or "plughw:CARD=USB,DEV=0")
    pub device: String,
    /// Ranked sample formats; empty means S16_BE then S16_LE
    pub formats: Vec<SampleFormat>,
    pub sample_rate: u32,
    pub channels: u32,
    pub verbose: u8,
}

impl AudioParameters {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            formats: Vec::new(),
            sample_rate: 44100,
            channels: 2,
            verbose: 0,
        }
    }

    fn candidates(&self) -> Vec<SampleFormat> {
        if self.formats.is_empty() {
            vec![SampleFormat::S16Be, SampleFormat::S16Le]
        } else {
            self.formats.clone()
        }
    }
}

/// Period length requested from ALSA
const PERIOD: Duration = Duration::from_millis(20);

fn alsa_err(context: &str, device: &str, e: alsa::Error) -> AppError {
    AppError::AudioError(format!("{} {}: {}", context, device, e))
}

fn to_io(e: alsa::Error) -> io::Error {
    io::Error::from_raw_os_error(e.errno())
}

/// An opened, configured ALSA capture PCM
pub struct AlsaCapture {
    name: String,
    pcm: PCM,
    format: SampleFormat,
    sample_rate: u32,
    channels: u32,
    period_frames: usize,
    buffer: Vec<u8>,
    verbose: u8,
}

impl AlsaCapture {
    /// Open the device and settle on the first sample format it accepts
    pub fn open(params: &AudioParameters) -> Result<Self> {
        let device = params.device.as_str();
        let pcm = PCM::new(device, Direction::Capture, false)
            .map_err(|e| alsa_err("Failed to open audio device", device, e))?;

        let (format, sample_rate, channels, period_frames) = {
            let hwp = HwParams::any(&pcm).map_err(|e| alsa_err("No hw params for", device, e))?;
            hwp.set_access(Access::RWInterleaved)
                .map_err(|e| alsa_err("Failed to set access on", device, e))?;

            let mut chosen = None;
            for candidate in params.candidates() {
                match hwp.set_format(candidate.to_alsa()) {
                    Ok(()) => {
                        chosen = Some(candidate);
                        break;
                    }
                    Err(e) => {
                        if params.verbose > 0 {
                            info!("{}: format {} rejected: {}", device, candidate, e);
                        }
                    }
                }
            }
            let format = chosen.ok_or_else(|| {
                AppError::AudioError(format!("{}: no requested sample format accepted", device))
            })?;

            hwp.set_channels(params.channels)
                .map_err(|e| alsa_err("Failed to set channels on", device, e))?;
            hwp.set_rate(params.sample_rate, ValueOr::Nearest)
                .map_err(|e| alsa_err("Failed to set sample rate on", device, e))?;

            let rate = hwp.get_rate().unwrap_or(params.sample_rate);
            let period = (rate as u64 * PERIOD.as_millis() as u64 / 1000).max(1) as Frames;
            hwp.set_period_size_near(period, ValueOr::Nearest)
                .map_err(|e| alsa_err("Failed to set period size on", device, e))?;
            hwp.set_buffer_size_near(period * 4)
                .map_err(|e| alsa_err("Failed to set buffer size on", device, e))?;

            pcm.hw_params(&hwp)
                .map_err(|e| alsa_err("Failed to apply hw params on", device, e))?;
            (format, rate, params.channels, period as usize)
        };

        let (sample_rate, channels, period_frames) = match pcm.hw_params_current() {
            Ok(current) => (
                current.get_rate().unwrap_or(sample_rate),
                current.get_channels().unwrap_or(channels),
                current
                    .get_period_size()
                    .map(|p| p as usize)
                    .unwrap_or(period_frames),
            ),
            Err(_) => (sample_rate, channels, period_frames),
        };

        if sample_rate != params.sample_rate {
            warn!(
                "{}: sample rate {} requested, device uses {}",
                device, params.sample_rate, sample_rate
            );
        }

        pcm.prepare()
            .map_err(|e| alsa_err("Failed to prepare", device, e))?;

        info!(
            "{}: {} {}Hz {}ch period {} frames",
            device, format, sample_rate, channels, period_frames
        );

        let frame_bytes = format.physical_width() * channels as usize;
        Ok(Self {
            name: device.to_string(),
            pcm,
            format,
            sample_rate,
            channels,
            period_frames,
            buffer: vec![0u8; period_frames * frame_bytes],
            verbose: params.verbose,
        })
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Bytes delivered per read
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn rtp_mime(&self) -> String {
        self.format.rtp_mime(self.sample_rate, self.channels)
    }

    pub fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            media: MediaKind::Audio,
            rtp_mime: self.rtp_mime(),
            clock_rate: self.sample_rate,
            channels: self.channels,
            max_frame_size: self.buffer_size(),
            pcm_swap_width: self.format.network_swap_width(),
        }
    }

    /// Bring the PCM back after an overrun or a suspend
    fn recover(&self) -> io::Result<()> {
        match self.pcm.state() {
            State::XRun => {
                warn!("{}: buffer overrun, recovering", self.name);
                self.pcm.prepare().map_err(to_io)
            }
            State::Suspended => {
                warn!("{}: device suspended, recovering", self.name);
                if let Err(e) = self.pcm.resume() {
                    debug!("{}: resume failed ({}), preparing instead", self.name, e);
                    self.pcm.prepare().map_err(to_io)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Turn a failed wait or read into "no data yet" when ALSA can recover
    fn handle_error(&self, e: alsa::Error) -> io::Result<Option<Bytes>> {
        match classify_errno(e.errno()) {
            PcmCondition::Overrun => {
                warn!("{}: buffer overrun", self.name);
                self.pcm.prepare().map_err(to_io)?;
                Ok(None)
            }
            PcmCondition::Suspended => {
                self.recover()?;
                Ok(None)
            }
            PcmCondition::NotReady => Ok(None),
            PcmCondition::Failed => Err(to_io(e)),
        }
    }
}

/// How a PCM error errno is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PcmCondition {
    Overrun,
    Suspended,
    NotReady,
    Failed,
}

fn classify_errno(errno: i32) -> PcmCondition {
    match errno {
        libc::EPIPE => PcmCondition::Overrun,
        libc::ESTRPIPE => PcmCondition::Suspended,
        libc::EAGAIN | libc::EINTR => PcmCondition::NotReady,
        _ => PcmCondition::Failed,
    }
}

impl FrameReader for AlsaCapture {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_frame(&mut self, timeout: Duration) -> io::Result<Option<Bytes>> {
        self.recover()?;

        // A stopped PCM never becomes readable, so kick it first
        if self.pcm.state() == State::Prepared {
            self.pcm.start().map_err(to_io)?;
        }
        match self.pcm.wait(Some(timeout.as_millis() as u32)) {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) => return self.handle_error(e),
        }

        let io: IO<u8> = self.pcm.io_bytes();
        match io.readi(&mut self.buffer) {
            Ok(0) => Ok(None),
            Ok(frames) => {
                let bytes = frames.min(self.period_frames)
                    * self.format.physical_width()
                    * self.channels as usize;
                if self.verbose > 1 {
                    debug!("{}: read {} frames ({} bytes)", self.name, frames, bytes);
                }
                Ok(Some(Bytes::copy_from_slice(&self.buffer[..bytes])))
            }
            Err(e) => self.handle_error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::reader::is_device_lost;

    #[test]
    fn overrun_and_suspend_are_recoverable() {
        assert_eq!(classify_errno(libc::EPIPE), PcmCondition::Overrun);
        assert_eq!(classify_errno(libc::ESTRPIPE), PcmCondition::Suspended);
        assert_eq!(classify_errno(libc::EAGAIN), PcmCondition::NotReady);
        assert_eq!(classify_errno(libc::ENODEV), PcmCondition::Failed);
    }

    #[test]
    fn overrun_errno_is_not_device_loss() {
        assert!(!is_device_lost(&io::Error::from_raw_os_error(libc::EPIPE)));
        assert!(!is_device_lost(&io::Error::from_raw_os_error(libc::ESTRPIPE)));
        assert!(is_device_lost(&io::Error::from_raw_os_error(libc::ENODEV)));
    }

    #[test]
    fn default_formats_prefer_big_endian() {
        let params = AudioParameters::new("hw:1,0");
        assert_eq!(
            params.candidates(),
            vec![SampleFormat::S16Be, SampleFormat::S16Le]
        );
    }
}
