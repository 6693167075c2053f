use crate::error::TransportError;
use async_trait::async_trait;

/// Opens physical connections to the telemetry server.
///
/// The channel calls `connect` once per attempt, so each call must start a
/// fresh handshake.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Endpoint description used in logs
    fn endpoint(&self) -> &str;

    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError>;
}

/// One open text-frame connection.
///
/// `recv` is polled inside `tokio::select!` and must be cancel safe.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text frame; `None` once the peer has closed the connection
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}
