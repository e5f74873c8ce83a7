//! Startup sequence
//!
//! The server is created first; failing to bind it is fatal. Video and audio
//! sources are then opened independently: a device that fails validation,
//! negotiation or source creation is logged and left out of the run. The
//! orchestrator registers sessions for whatever remains and serves them.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audio::{find_alsa_device, parse_sample_formats, split_device, AlsaCapture, AudioParameters};
use crate::config::{AppConfig, AudioConfig, DeliveryConfig, VideoConfig};
use crate::error::{AppError, Result};
use crate::rtsp::RtspServer;
use crate::session::{DeliveryPlan, SessionOrchestrator};
use crate::stream::{CaptureSourceFactory, SourceOptions, StreamReplicator};
use crate::video::capture::DEFAULT_BUFFER_COUNT;
use crate::video::{
    packet_budget, CapabilityMask, CaptureHandle, CodecFamily, DeviceParameters, FourCc,
    V4l2FrameReader,
};

/// Capture device request built from the video section
pub fn device_parameters(video: &VideoConfig, device_path: &str) -> DeviceParameters {
    DeviceParameters {
        device_path: device_path.into(),
        width: video.width,
        height: video.height,
        fps: video.fps,
        formats: video.formats.iter().map(|f| FourCc::from_name(f)).collect(),
        verbose: video.verbose,
    }
}

pub fn source_options(delivery: &DeliveryConfig) -> SourceOptions {
    SourceOptions {
        queue_size: delivery.queue_size.max(1),
        use_thread: delivery.use_thread,
        repeat_config: delivery.repeat_config,
    }
}

/// ALSA device to capture from: the configured one, then the one named in
/// the device string, then the card matching the video device
pub fn resolve_audio_device<F>(
    audio: &AudioConfig,
    from_device_string: Option<String>,
    video_path: &str,
    find: F,
) -> String
where
    F: FnOnce(&str) -> String,
{
    if !audio.device.is_empty() {
        return audio.device.clone();
    }
    from_device_string.unwrap_or_else(|| find(video_path))
}

/// Packet budget covering the largest frame of every opened source
pub fn source_packet_budget<'a>(
    streams: impl IntoIterator<Item = &'a Arc<StreamReplicator>>,
) -> usize {
    packet_budget(streams.into_iter().map(|s| s.info().max_frame_size))
}

fn open_video(
    config: &VideoConfig,
    device_path: &str,
    factory: &CaptureSourceFactory,
) -> Result<Arc<StreamReplicator>> {
    let params = device_parameters(config, device_path);
    let handle = CaptureHandle::open(&params, CapabilityMask::capture_streaming())?;
    let format = handle.format();
    let reader = V4l2FrameReader::new(handle, DEFAULT_BUFFER_COUNT)?;
    let source = factory.create_video_source(&format, reader)?;
    Ok(StreamReplicator::new(source))
}

fn open_audio(
    config: &AudioConfig,
    device: String,
    verbose: u8,
    factory: &CaptureSourceFactory,
) -> Result<Arc<StreamReplicator>> {
    let formats = parse_sample_formats(&config.formats);
    if formats.is_empty() && !config.formats.is_empty() {
        return Err(AppError::SourceCreation {
            media: "audio".to_string(),
            reason: format!("no known sample format in {:?}", config.formats),
        });
    }
    let params = AudioParameters {
        device,
        formats,
        sample_rate: config.sample_rate,
        channels: config.channels,
        verbose,
    };
    let capture = AlsaCapture::open(&params)?;
    let info = capture.stream_info();
    info!("Audio {} on {}", info.rtp_mime, params.device);
    let source = factory.create_source(CodecFamily::Generic, info, capture);
    Ok(StreamReplicator::new(source))
}

/// Open sources, register sessions and serve until `cancel` fires
pub async fn run(config: AppConfig, cancel: CancellationToken) -> Result<()> {
    let server = RtspServer::bind(&config.rtsp, config.delivery.http_port)?;
    let factory = CaptureSourceFactory::new(source_options(&config.delivery));
    let (video_path, audio_from_device) = split_device(&config.video.device);

    let video = if config.video.enabled {
        match open_video(&config.video, &video_path, &factory) {
            Ok(stream) => {
                info!("Video {} from {}", stream.info().rtp_mime, video_path);
                Some(stream)
            }
            Err(e) => {
                error!("Video source on {} unavailable: {}", video_path, e);
                None
            }
        }
    } else {
        None
    };

    let audio = if config.audio.enabled {
        let device =
            resolve_audio_device(&config.audio, audio_from_device, &video_path, find_alsa_device);
        match open_audio(&config.audio, device.clone(), config.video.verbose, &factory) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("Audio source on {} unavailable: {}", device, e);
                None
            }
        }
    } else {
        None
    };

    let budget = source_packet_budget(video.iter().chain(audio.iter()));
    let orchestrator =
        SessionOrchestrator::new(DeliveryPlan::from(&config.delivery), video, audio);
    if !orchestrator.has_sources() {
        return Err(AppError::SourceCreation {
            media: "video and audio".to_string(),
            reason: "no source could be opened".to_string(),
        });
    }

    server.set_packet_budget(budget);
    orchestrator.run(&server, cancel).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::reader::testing::ScriptedReader;
    use crate::stream::{MediaKind, StreamInfo};

    #[test]
    fn device_parameters_decode_format_names() {
        let video = VideoConfig {
            formats: vec!["H264".to_string(), "MJPG".to_string(), "YU".to_string()],
            width: 640,
            height: 480,
            fps: 25,
            verbose: 1,
            ..VideoConfig::default()
        };
        let params = device_parameters(&video, "/dev/video2");
        assert_eq!(params.device_path.to_str(), Some("/dev/video2"));
        assert_eq!(params.formats.len(), 3);
        assert_eq!(params.formats[0], FourCc::new(b"H264"));
        assert_eq!(params.formats[2], FourCc::new(b"YU\0\0"));
        assert_eq!((params.width, params.height, params.fps), (640, 480, 25));
    }

    #[test]
    fn audio_device_precedence() {
        let mut audio = AudioConfig::default();
        let found = |video: &str| format!("found-for-{}", video);

        assert_eq!(
            resolve_audio_device(&audio, None, "/dev/video0", found),
            "found-for-/dev/video0"
        );
        assert_eq!(
            resolve_audio_device(&audio, Some("hw:1,0".to_string()), "/dev/video0", found),
            "hw:1,0"
        );
        audio.device = "plughw:2".to_string();
        assert_eq!(
            resolve_audio_device(&audio, Some("hw:1,0".to_string()), "/dev/video0", found),
            "plughw:2"
        );
    }

    fn replicator(info: StreamInfo) -> Arc<StreamReplicator> {
        let source = CaptureSourceFactory::default().create_source(
            CodecFamily::Generic,
            info,
            ScriptedReader::frames(&[]),
        );
        StreamReplicator::new(source)
    }

    fn pcm(max_frame_size: usize) -> StreamInfo {
        StreamInfo {
            media: MediaKind::Audio,
            rtp_mime: "audio/L16/48000/2".to_string(),
            clock_rate: 48000,
            channels: 2,
            max_frame_size,
            pcm_swap_width: Some(2),
        }
    }

    #[test]
    fn packet_budget_counts_audio_sources() {
        let video = replicator(StreamInfo::video("video/JPEG", 150_000));
        let audio = replicator(pcm(262_144));

        assert_eq!(source_packet_budget([&audio]), 262_144);
        assert_eq!(source_packet_budget([&video, &audio]), 262_144);
        assert_eq!(source_packet_budget([&video]), 150_000);
        assert_eq!(source_packet_budget([&replicator(pcm(3_840))]), 100_000);
    }

    #[test]
    fn queue_size_is_never_zero() {
        let delivery = DeliveryConfig {
            queue_size: 0,
            use_thread: false,
            ..DeliveryConfig::default()
        };
        let options = source_options(&delivery);
        assert_eq!(options.queue_size, 1);
        assert!(!options.use_thread);
        assert!(options.repeat_config);
    }
}
