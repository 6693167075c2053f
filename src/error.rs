use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl SyncError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Failures of the event channel to the telemetry server
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Invalid server URL '{url}': {details}")]
    InvalidUrl { url: String, details: String },

    #[error("Failed to connect to {url}: {details}")]
    ConnectFailed { url: String, details: String },

    #[error("Connection dropped: {reason}")]
    Disconnected { reason: String },

    #[error("Failed to send message: {details}")]
    SendFailed { details: String },

    #[error("Connection failed after {attempts} reconnection attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Channel is not connected")]
    NotConnected,
}

impl TransportError {
    /// Whether a connect failure should consume the reconnection budget
    /// rather than stop the channel outright.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TransportError::InvalidUrl { .. })
    }
}

/// Failures decoding a frame received from the wire
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown event type '{event}'")]
    UnknownEvent { event: String },

    #[error("Invalid payload for '{event}': {details}")]
    InvalidPayload { event: String, details: String },
}

pub type Result<T> = std::result::Result<T, SyncError>;
