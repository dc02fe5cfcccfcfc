use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camstream::config::{self, ConfigOverrides};
use camstream::state::AppState;
use camstream::stream::FrameDistributor;
use camstream::video::{BackendFactory, CaptureEngine, SimConfig, SimFactory, V4l2Factory};
use camstream::web;

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

/// camstream command line arguments
#[derive(Parser, Debug)]
#[command(name = "camstream")]
#[command(version, about = "V4L2 camera capture with MJPEG and snapshot HTTP endpoints", long_about = None)]
struct CliArgs {
    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Video device path
    #[arg(short = 'd', long, value_name = "PATH", env = "CAM_DEVICE")]
    device: Option<String>,

    /// Capture width
    #[arg(long, value_name = "PIXELS", env = "CAM_WIDTH")]
    width: Option<u32>,

    /// Capture height
    #[arg(long, value_name = "PIXELS", env = "CAM_HEIGHT")]
    height: Option<u32>,

    /// Pixel format (MJPEG, YUYV, RAW)
    #[arg(short = 'f', long, value_name = "FORMAT", env = "CAM_FORMAT")]
    format: Option<String>,

    /// Requested frame rate
    #[arg(long, value_name = "FPS", env = "CAM_FPS")]
    fps: Option<u32>,

    /// Number of mmap buffers to request
    #[arg(long, value_name = "COUNT")]
    buffers: Option<u32>,

    /// Consecutive acquire failures tolerated before the device is treated as lost
    #[arg(long, value_name = "COUNT")]
    retry_budget: Option<u32>,

    /// Listen address
    #[arg(short = 'a', long, value_name = "ADDRESS", env = "HTTP_HOST")]
    address: Option<String>,

    /// HTTP port
    #[arg(short = 'p', long, value_name = "PORT", env = "HTTP_PORT")]
    http_port: Option<u16>,

    /// Do not start capturing until POST /camera/start
    #[arg(long)]
    no_start: bool,

    /// Use the built-in synthetic camera instead of a V4L2 device
    #[arg(long)]
    simulate: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl CliArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            device: self.device.clone(),
            width: self.width,
            height: self.height,
            format: self.format.clone(),
            fps: self.fps,
            buffer_count: self.buffers,
            retry_budget: self.retry_budget,
            start_on_boot: self.no_start.then_some(false),
            bind_address: self.address.clone(),
            http_port: self.http_port,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting camstream v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load(args.config.as_deref(), &args.overrides())?;
    let capture_config = config
        .capture
        .to_capture_config()
        .map_err(anyhow::Error::msg)?;

    let factory: Arc<dyn BackendFactory> = if args.simulate {
        tracing::info!("Using simulated camera");
        Arc::new(SimFactory::new(SimConfig::default()))
    } else {
        Arc::new(V4l2Factory::new())
    };

    let distributor = FrameDistributor::new(config.stream.snapshot_staleness());
    let engine = Arc::new(
        CaptureEngine::spawn(capture_config, factory, distributor)
            .context("Failed to spawn capture thread")?,
    );

    if config.capture.start_on_boot {
        match engine.start(None).await {
            Ok(format) => tracing::info!("Capture started: {}", format),
            // Keep serving; /camera/start can retry and /health reports the state
            Err(e) => tracing::warn!("Failed to start capture on boot: {}", e),
        }
    } else {
        tracing::info!("Capture not started (start_on_boot disabled)");
    }

    let bind_ip: IpAddr = config
        .web
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.web.bind_address))?;
    let addr = SocketAddr::new(bind_ip, config.web.http_port);

    let state = AppState::new(config, engine.clone());
    let app = web::create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let server = axum::serve(listener, app);

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
        }
        result = server => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
    }

    engine.shutdown().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
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
        LogLevel::Error => "camstream=error,tower_http=error",
        LogLevel::Warn => "camstream=warn,tower_http=warn",
        LogLevel::Info => "camstream=info,tower_http=info",
        LogLevel::Verbose => "camstream=debug,tower_http=info",
        LogLevel::Debug => "camstream=debug,tower_http=debug",
        LogLevel::Trace => "camstream=trace,tower_http=debug",
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
