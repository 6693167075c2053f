use aerialsync::{
    ConnectionPhase, GlobalIncidentFeed, ReconnectPolicy, StreamSession, SyncConfig,
    TransportChannel, WallClockPlayback, WebSocketConnector,
};
use anyhow::{anyhow, Result};
use clap::Parser;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

#[cfg(feature = "diagnostics")]
use aerialsync::DiagnosticsServerBuilder;
#[cfg(feature = "raster")]
use aerialsync::ImageSurface;
#[cfg(not(feature = "raster"))]
use aerialsync::RecordingSurface;

#[derive(Parser, Debug)]
#[command(name = "aerialsync")]
#[command(about = "Live telemetry synchronization for AI-annotated video streams")]
#[command(version)]
#[command(long_about = "Subscribes to a stream's detection telemetry over WebSocket, buffers it \
per frame and keeps an overlay aligned with the playback clock. Incidents, stream status and \
priority signals are tracked alongside and can be inspected over HTTP.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "aerialsync.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Stream to subscribe to
    #[arg(short, long, default_value = "default", help = "Stream identifier to follow")]
    stream: String,

    /// Override the telemetry server URL
    #[arg(long, value_name = "URL", help = "WebSocket URL of the telemetry server")]
    url: Option<String>,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write JSON logs to a daily rolling file in this directory
    #[arg(long, value_name = "DIR", help = "Directory for rolling log files")]
    log_dir: Option<PathBuf>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Serve the diagnostics endpoints regardless of configuration
    #[arg(long, help = "Enable the diagnostics HTTP server")]
    diagnostics: bool,

    /// Write the last rendered overlay to a PNG on shutdown
    #[arg(long, value_name = "PATH", help = "Save the final overlay frame as PNG")]
    snapshot: Option<PathBuf>,

    /// Seconds between status log lines, 0 to disable
    #[arg(long, default_value_t = 30, help = "Interval for periodic status logging")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    let _log_guard = init_logging(&args)?;

    info!("Starting aerialsync v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let mut config = match SyncConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Some(url) = &args.url {
        config.transport.url = url.clone();
    }
    if args.diagnostics {
        config.diagnostics.enabled = true;
    }

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    config.validate().map_err(|e| {
        error!("Configuration validation failed: {}", e);
        e
    })?;

    run(config, &args).await
}

async fn run(config: SyncConfig, args: &Args) -> Result<()> {
    let channel = Arc::new(TransportChannel::new(
        WebSocketConnector::new(config.transport.url.clone()),
        ReconnectPolicy::from(&config.transport),
    ));
    channel.connect();

    let session = Arc::new(StreamSession::open(&channel, args.stream.clone(), &config)?);
    let feed = Arc::new(GlobalIncidentFeed::attach(&channel, &config.incidents));

    #[cfg(feature = "raster")]
    let surface = Arc::new(Mutex::new(ImageSurface::from_config(&config.overlay)?));
    #[cfg(not(feature = "raster"))]
    let surface = Arc::new(Mutex::new(
        RecordingSurface::new(config.overlay.width, config.overlay.height).with_history(1),
    ));

    let playback = Arc::new(WallClockPlayback::start());
    let clock = session.mount_playback(playback, Arc::clone(&surface));

    let shutdown = CancellationToken::new();

    #[cfg(feature = "diagnostics")]
    let diagnostics = if config.diagnostics.enabled {
        let server = DiagnosticsServerBuilder::new()
            .config(config.diagnostics.clone())
            .session(Arc::clone(&session))
            .transport(Arc::clone(&channel))
            .global_feed(Arc::clone(&feed))
            .build()?;
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.serve(shutdown).await {
                error!("Diagnostics server failed: {}", e);
            }
        }))
    } else {
        None
    };

    #[cfg(not(feature = "diagnostics"))]
    if config.diagnostics.enabled {
        warn!("Diagnostics requested but this build has no diagnostics support");
    }

    let mut connection = channel.watch_state();
    let mut status_timer = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    status_timer.tick().await;

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break Ok(());
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break Err(anyhow!("Transport channel closed unexpectedly"));
                }
                let state = connection.borrow_and_update().clone();
                match state.phase {
                    ConnectionPhase::Connected => info!(url = %config.transport.url, "Connected to telemetry server"),
                    ConnectionPhase::Reconnecting => warn!(attempt = state.attempt, "Reconnecting to telemetry server"),
                    ConnectionPhase::Failed => {
                        let message = state
                            .connection_error()
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "connection failed".to_string());
                        error!("{}", message);
                        break Err(anyhow!(message));
                    }
                    phase => debug!(?phase, "Connection state changed"),
                }
            }
            _ = status_timer.tick(), if args.status_interval > 0 => {
                let snapshot = session.snapshot();
                let playback = clock.stats();
                let global = feed.snapshot();
                info!(
                    stream_id = %snapshot.stream_id,
                    connected = snapshot.connected,
                    buffered = snapshot.buffer_size,
                    latest_frame = ?snapshot.latest_frame,
                    vehicles = snapshot.stats.count,
                    priority = snapshot.priority_active,
                    global_incidents = global.incidents_seen,
                    hit_rate = %format!("{:.1}%", playback.hit_rate() * 100.0),
                    "Session status"
                );
            }
        }
    };

    shutdown.cancel();
    clock.stop().await;

    #[cfg(feature = "raster")]
    if let Some(path) = &args.snapshot {
        if let Err(e) = surface.lock().save_png(path) {
            error!("Failed to save overlay snapshot: {}", e);
        }
    }
    #[cfg(not(feature = "raster"))]
    if args.snapshot.is_some() {
        warn!("Overlay snapshots need the raster feature");
    }

    session.close();
    channel.disconnect().await;

    #[cfg(feature = "diagnostics")]
    if let Some(handle) = diagnostics {
        let _ = handle.await;
    }

    info!("aerialsync stopped");
    outcome
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("aerialsync={}", log_level)));

    let mut layers = Vec::new();

    layers.push(match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    });

    let guard = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "aerialsync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# aerialsync configuration file");
    println!("# Every key can also be set through AERIALSYNC_<SECTION>__<KEY>");
    println!();
    print!("{}", toml::to_string_pretty(&SyncConfig::default())?);
    Ok(())
}
