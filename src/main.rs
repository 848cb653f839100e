use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pixel_streamer::config::ConfigStore;
use pixel_streamer::encoder::{available_backends, default_encoder_creator};
use pixel_streamer::rhi::{Texture, TextureDesc, TextureRef};
use pixel_streamer::session::LoggingInputHandler;
use pixel_streamer::Streamer;

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

/// pixel-streamer command line arguments
#[derive(Parser, Debug)]
#[command(name = "pixel-streamer")]
#[command(version, about = "Stream rendered frames to browsers over WebRTC", long_about = None)]
struct CliArgs {
    /// Configuration file (created with defaults when missing)
    #[arg(short = 'c', long, value_name = "FILE", default_value = "pixel-streamer.toml")]
    config: PathBuf,

    /// Signalling server URL (overrides config)
    #[arg(short = 's', long, value_name = "URL")]
    signalling_url: Option<String>,

    /// Streamer id announced to the signalling server (overrides config)
    #[arg(long, value_name = "ID")]
    streamer_id: Option<String>,

    /// Capture frame rate (overrides config)
    #[arg(long, value_name = "FPS")]
    fps: Option<u32>,

    /// Print the stats overlay to the log
    #[arg(long)]
    hud: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting pixel-streamer v{}", env!("CARGO_PKG_VERSION"));

    let store = ConfigStore::load(&args.config).await?;
    tracing::info!("Configuration: {}", args.config.display());

    // Apply CLI argument overrides to config (only if explicitly specified)
    if args.signalling_url.is_some() || args.streamer_id.is_some() || args.fps.is_some() || args.hud {
        store
            .update(|config| {
                if let Some(url) = args.signalling_url.clone() {
                    config.signalling.url = url;
                }
                if let Some(id) = args.streamer_id.clone() {
                    config.signalling.streamer_id = id;
                }
                if let Some(fps) = args.fps {
                    config.capture.fps = fps;
                }
                if args.hud {
                    config.stats.hud_enabled = true;
                }
            })
            .await?;
    }

    let backends = available_backends();
    if backends.is_empty() {
        tracing::warn!("No encoder backend compiled in; players will be refused");
    } else {
        tracing::info!("Encoder backends: {}", backends.join(", "));
    }

    let streamer = Streamer::new(
        store.clone(),
        default_encoder_creator(),
        Arc::new(LoggingInputHandler),
    )?;
    streamer.start().await?;

    let shutdown = CancellationToken::new();
    let renderer = tokio::spawn(run_test_pattern(
        streamer.clone(),
        store.clone(),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
    let _ = renderer.await;
    streamer.stop().await;

    tracing::info!("Streamer shutdown complete");
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "pixel_streamer=error,webrtc=error",
        LogLevel::Warn => "pixel_streamer=warn,webrtc=warn",
        LogLevel::Info => "pixel_streamer=info,webrtc=warn",
        LogLevel::Verbose => "pixel_streamer=debug,webrtc=warn",
        LogLevel::Debug => "pixel_streamer=debug,webrtc=info",
        LogLevel::Trace => "pixel_streamer=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Stand-in renderer: colour bars with a sweeping white column
async fn run_test_pattern(streamer: Arc<Streamer>, store: ConfigStore, shutdown: CancellationToken) {
    let config = store.get();
    let (width, height) = config
        .capture
        .capture_size
        .map(|s| (s.width, s.height))
        .unwrap_or((1280, 720));
    let fps = config.capture.fps.max(1);

    let backbuffer: TextureRef = Arc::new(Texture::new(TextureDesc::rgba(width, height)));
    let mut pixels = vec![0u8; backbuffer.desc().size_bytes()];
    let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / fps as u64));
    let mut frame: u64 = 0;

    tracing::info!("Rendering {}x{} test pattern at {} fps", width, height, fps);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        draw_test_pattern(&mut pixels, width, height, frame);
        backbuffer.upload(&pixels);
        streamer.on_backbuffer_ready(&backbuffer);
        frame += 1;
    }
}

const BARS: [[u8; 3]; 7] = [
    [192, 192, 192],
    [192, 192, 0],
    [0, 192, 192],
    [0, 192, 0],
    [192, 0, 192],
    [192, 0, 0],
    [0, 0, 192],
];

fn draw_test_pattern(pixels: &mut [u8], width: u32, height: u32, frame: u64) {
    let width = width as usize;
    let sweep = (frame as usize * 4) % width.max(1);
    for (y, row) in pixels.chunks_exact_mut(width * 4).enumerate().take(height as usize) {
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            let rgb = if x.abs_diff(sweep) < 4 {
                [255, 255, 255]
            } else {
                BARS[x * BARS.len() / width]
            };
            let shade = if y % 64 == 0 { 0 } else { 1 };
            px[0] = rgb[0] * shade;
            px[1] = rgb[1] * shade;
            px[2] = rgb[2] * shade;
            px[3] = 255;
        }
    }
}
