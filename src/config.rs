use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Render ticks faster than this are rejected
pub const MAX_TICK_RATE_HZ: u32 = 1_000;
/// Longest accepted priority signal lifetime (one day)
pub const MAX_PRIORITY_TIMEOUT_SECONDS: u64 = 86_400;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SyncConfig {
    pub transport: TransportConfig,
    pub buffer: BufferConfig,
    pub playback: PlaybackConfig,
    pub incidents: IncidentConfig,
    pub overlay: OverlayConfig,
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TransportConfig {
    /// WebSocket endpoint of the telemetry server
    #[serde(default = "default_transport_url")]
    pub url: String,

    /// Reconnection attempts after an unexpected disconnect
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Fixed delay before each reconnection attempt, in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BufferConfig {
    /// Samples retained per stream
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PlaybackConfig {
    /// Assumed sample rate used to convert playback time into frame indices
    #[serde(default = "default_frames_per_second")]
    pub frames_per_second: u32,

    /// Render ticks per second
    #[serde(default = "default_tick_rate_hz")]
    pub tick_rate_hz: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IncidentConfig {
    /// Seconds before a raised priority signal clears itself
    #[serde(default = "default_priority_timeout_seconds")]
    pub priority_timeout_seconds: u64,

    /// Recent incidents kept, newest first
    #[serde(default = "default_max_recent")]
    pub max_recent: usize,

    /// Broadcast incidents kept by the channel-wide feed, newest first
    #[serde(default = "default_max_global")]
    pub max_global: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct OverlayConfig {
    /// Draw surface width in pixels
    #[serde(default = "default_overlay_width")]
    pub width: u32,

    /// Draw surface height in pixels
    #[serde(default = "default_overlay_height")]
    pub height: u32,

    /// TrueType font for labels; labels are skipped on raster surfaces without one
    #[serde(default)]
    pub font_path: Option<String>,

    /// Label font size
    #[serde(default = "default_font_size")]
    pub font_size: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DiagnosticsConfig {
    /// Serve the diagnostics HTTP endpoints
    #[serde(default)]
    pub enabled: bool,

    /// IP address to bind to
    #[serde(default = "default_diagnostics_ip")]
    pub ip: String,

    /// Port to listen on
    #[serde(default = "default_diagnostics_port")]
    pub port: u16,
}

impl TransportConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl PlaybackConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(1_000_000u64 / self.tick_rate_hz.max(1) as u64)
            .max(Duration::from_micros(1))
    }
}

impl IncidentConfig {
    pub fn priority_timeout(&self) -> Duration {
        Duration::from_secs(self.priority_timeout_seconds)
    }
}

impl SyncConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("aerialsync.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("transport.url", default_transport_url())?
            .set_default("transport.reconnect_attempts", default_reconnect_attempts())?
            .set_default(
                "transport.reconnect_delay_ms",
                default_reconnect_delay_ms() as i64,
            )?
            .set_default("buffer.capacity", default_buffer_capacity() as i64)?
            .set_default("playback.frames_per_second", default_frames_per_second())?
            .set_default("playback.tick_rate_hz", default_tick_rate_hz())?
            .set_default(
                "incidents.priority_timeout_seconds",
                default_priority_timeout_seconds() as i64,
            )?
            .set_default("incidents.max_recent", default_max_recent() as i64)?
            .set_default("incidents.max_global", default_max_global() as i64)?
            .set_default("overlay.width", default_overlay_width())?
            .set_default("overlay.height", default_overlay_height())?
            .set_default("overlay.font_size", default_font_size() as f64)?
            .set_default("diagnostics.enabled", false)?
            .set_default("diagnostics.ip", default_diagnostics_ip())?
            .set_default("diagnostics.port", default_diagnostics_port())?
            .add_source(File::with_name(&path_str).required(false))
            // AERIALSYNC_BUFFER__CAPACITY=600
            .add_source(
                Environment::with_prefix("AERIALSYNC")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: SyncConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.url.trim().is_empty() {
            return Err(ConfigError::Message(
                "Transport url must not be empty".to_string(),
            ));
        }

        if self.transport.reconnect_delay_ms == 0 {
            return Err(ConfigError::Message(
                "Transport reconnect_delay_ms must be greater than 0".to_string(),
            ));
        }

        if self.buffer.capacity == 0 {
            return Err(ConfigError::Message(
                "Buffer capacity must be greater than 0".to_string(),
            ));
        }

        if self.playback.frames_per_second == 0 {
            return Err(ConfigError::Message(
                "Playback frames_per_second must be greater than 0".to_string(),
            ));
        }

        if self.playback.tick_rate_hz == 0 || self.playback.tick_rate_hz > MAX_TICK_RATE_HZ {
            return Err(ConfigError::Message(format!(
                "Playback tick_rate_hz must be between 1 and {}",
                MAX_TICK_RATE_HZ
            )));
        }

        if self.incidents.priority_timeout_seconds == 0
            || self.incidents.priority_timeout_seconds > MAX_PRIORITY_TIMEOUT_SECONDS
        {
            return Err(ConfigError::Message(format!(
                "Incident priority_timeout_seconds must be between 1 and {}",
                MAX_PRIORITY_TIMEOUT_SECONDS
            )));
        }

        if self.incidents.max_recent == 0 || self.incidents.max_global == 0 {
            return Err(ConfigError::Message(
                "Incident max_recent and max_global must be greater than 0".to_string(),
            ));
        }

        if self.overlay.width == 0 || self.overlay.height == 0 {
            return Err(ConfigError::Message(
                "Overlay resolution must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig {
                url: default_transport_url(),
                reconnect_attempts: default_reconnect_attempts(),
                reconnect_delay_ms: default_reconnect_delay_ms(),
            },
            buffer: BufferConfig {
                capacity: default_buffer_capacity(),
            },
            playback: PlaybackConfig {
                frames_per_second: default_frames_per_second(),
                tick_rate_hz: default_tick_rate_hz(),
            },
            incidents: IncidentConfig {
                priority_timeout_seconds: default_priority_timeout_seconds(),
                max_recent: default_max_recent(),
                max_global: default_max_global(),
            },
            overlay: OverlayConfig {
                width: default_overlay_width(),
                height: default_overlay_height(),
                font_path: None,
                font_size: default_font_size(),
            },
            diagnostics: DiagnosticsConfig {
                enabled: false,
                ip: default_diagnostics_ip(),
                port: default_diagnostics_port(),
            },
        }
    }
}

// Default value functions
fn default_transport_url() -> String {
    "ws://127.0.0.1:5000/telemetry".to_string()
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_buffer_capacity() -> usize {
    300
}

fn default_frames_per_second() -> u32 {
    30
}
fn default_tick_rate_hz() -> u32 {
    60
}

fn default_priority_timeout_seconds() -> u64 {
    10
}
fn default_max_recent() -> usize {
    50
}
fn default_max_global() -> usize {
    100
}

fn default_overlay_width() -> u32 {
    1280
}
fn default_overlay_height() -> u32 {
    720
}
fn default_font_size() -> f32 {
    12.0
}

fn default_diagnostics_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_diagnostics_port() -> u16 {
    8089
}
