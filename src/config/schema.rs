use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Video capture settings
    pub video: VideoConfig,
    /// Audio capture settings
    pub audio: AudioConfig,
    /// RTSP server settings
    pub rtsp: RtspConfig,
    /// Session and delivery settings
    pub delivery: DeliveryConfig,
}

/// Video capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoConfig {
    /// Capture video
    pub enabled: bool,
    /// Video device path, optionally followed by `,<alsa device>`
    pub device: String,
    /// Acceptable pixel formats in preference order (e.g. "H264", "MJPG").
    /// Empty keeps whatever the device is set to.
    pub formats: Vec<String>,
    /// Resolution width (0 = keep current)
    pub width: u32,
    /// Resolution height (0 = keep current)
    pub height: u32,
    /// Frame rate (0 = leave unset)
    pub fps: u32,
    /// Per-device log detail: 0, 1 or 2
    pub verbose: u8,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: "/dev/video0".to_string(),
            formats: vec!["H264".to_string()],
            width: 1280,
            height: 720,
            fps: 30,
            verbose: 0,
        }
    }
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture audio
    pub enabled: bool,
    /// ALSA device. Empty derives it from the video device.
    pub device: String,
    /// Acceptable sample formats in preference order (e.g. "S16_LE")
    pub formats: Vec<String>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: String::new(),
            formats: vec!["S16_LE".to_string(), "S16_BE".to_string()],
            sample_rate: 44100,
            channels: 2,
        }
    }
}

/// RTSP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RtspConfig {
    /// Bind IP address
    pub bind: String,
    /// RTSP listen port
    pub port: u16,
    /// Seconds of client silence before a session is dropped
    pub session_timeout_secs: u64,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8554,
            session_timeout_secs: 65,
        }
    }
}

/// Delivery session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Unicast session path
    pub unicast_path: String,
    /// Multicast session path
    pub multicast_path: String,
    /// Segmented session path; manifests live at `<path>.m3u8` and `<path>.mpd`
    pub segmented_path: String,
    /// Register the multicast session
    pub multicast_enabled: bool,
    /// Multicast `<ipv4>:<rtp port>`; random SSM group and port 20000 when unset
    pub multicast_endpoint: Option<String>,
    /// Multicast time-to-live
    pub multicast_ttl: u8,
    /// Segment duration in seconds (0 = no segmented session)
    pub segment_secs: u64,
    /// Frame queue depth per source
    pub queue_size: usize,
    /// Capture on a dedicated thread per device
    pub use_thread: bool,
    /// Repeat H.264/H.265 parameter sets before key frames
    pub repeat_config: bool,
    /// HTTP port for segmented delivery
    pub http_port: u16,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            unicast_path: "unicast".to_string(),
            multicast_path: "multicast".to_string(),
            segmented_path: "ts".to_string(),
            multicast_enabled: true,
            multicast_endpoint: None,
            multicast_ttl: 5,
            segment_secs: 0,
            queue_size: 10,
            use_thread: true,
            repeat_config: true,
            http_port: 8080,
        }
    }
}
