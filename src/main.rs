use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use v4l2_relay::app;
use v4l2_relay::config::{AppConfig, ConfigStore};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// v4l2-relay command line arguments
#[derive(Parser, Debug)]
#[command(name = "v4l2-relay")]
#[command(version, about = "Serve V4L2 and ALSA capture devices over RTSP and HLS", long_about = None)]
struct CliArgs {
    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Capture device, optionally followed by `,<alsa device>`
    #[arg(value_name = "DEVICE")]
    device: Option<String>,

    /// Acceptable video formats in preference order (repeatable)
    #[arg(short = 'f', long = "format", value_name = "FOURCC")]
    formats: Vec<String>,

    /// Capture width
    #[arg(short = 'W', long, value_name = "PIXELS")]
    width: Option<u32>,

    /// Capture height
    #[arg(short = 'H', long, value_name = "PIXELS")]
    height: Option<u32>,

    /// Capture frame rate
    #[arg(short = 'F', long, value_name = "FPS")]
    fps: Option<u32>,

    /// RTSP port
    #[arg(short = 'P', long, value_name = "PORT")]
    port: Option<u16>,

    /// Segment duration in seconds, enables HLS and MPEG-DASH
    #[arg(short = 'S', long, value_name = "SECONDS")]
    segment: Option<u64>,

    /// Multicast group and port, `<ipv4>:<port>`
    #[arg(short = 'M', long, value_name = "ENDPOINT")]
    multicast: Option<String>,

    /// Do not capture audio
    #[arg(long)]
    no_audio: bool,

    /// Per-device log detail (0, 1 or 2)
    #[arg(long, value_name = "LEVEL")]
    device_verbose: Option<u8>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print the resolved configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Write the resolved configuration back to the configuration file
    #[arg(long, requires = "config")]
    save_config: bool,
}

impl CliArgs {
    /// Command line values take precedence over the file
    fn apply(&self, config: &mut AppConfig) {
        if let Some(device) = &self.device {
            config.video.device = device.clone();
        }
        if !self.formats.is_empty() {
            config.video.formats = self.formats.clone();
        }
        if let Some(width) = self.width {
            config.video.width = width;
        }
        if let Some(height) = self.height {
            config.video.height = height;
        }
        if let Some(fps) = self.fps {
            config.video.fps = fps;
        }
        if let Some(port) = self.port {
            config.rtsp.port = port;
        }
        if let Some(segment) = self.segment {
            config.delivery.segment_secs = segment;
        }
        if let Some(multicast) = &self.multicast {
            config.delivery.multicast_enabled = true;
            config.delivery.multicast_endpoint = Some(multicast.clone());
        }
        if self.no_audio {
            config.audio.enabled = false;
        }
        if let Some(verbose) = self.device_verbose {
            config.video.verbose = verbose.min(2);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    let store = ConfigStore::load(args.config.as_deref())?;
    store.update(|config| args.apply(config));

    if args.save_config {
        store.save()?;
    }
    if args.print_config {
        print!("{}", store.to_toml()?);
        return Ok(());
    }

    tracing::info!("Starting v4l2-relay v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = store.path() {
        tracing::info!("Configuration file: {}", path.display());
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    let config = (*store.get()).clone();
    app::run(config, cancel).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "v4l2_relay=error,tower_http=error",
        LogLevel::Warn => "v4l2_relay=warn,tower_http=warn",
        LogLevel::Info => "v4l2_relay=info,tower_http=info",
        LogLevel::Verbose => "v4l2_relay=debug,tower_http=info",
        LogLevel::Debug => "v4l2_relay=debug,tower_http=debug",
        LogLevel::Trace => "v4l2_relay=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
