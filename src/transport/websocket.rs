use super::connector::{Connection, Connector};
use crate::error::TransportError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

/// Connector for `ws://` and `wss://` endpoints
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        debug!(url = %self.url, "Opening websocket");

        match connect_async(self.url.as_str()).await {
            Ok((stream, response)) => {
                debug!(status = %response.status(), "Websocket handshake complete");
                Ok(Box::new(WebSocketConnection { stream }))
            }
            Err(e @ (WsError::Url(_) | WsError::HttpFormat(_))) => {
                Err(TransportError::InvalidUrl {
                    url: self.url.clone(),
                    details: e.to_string(),
                })
            }
            Err(e) => Err(TransportError::ConnectFailed {
                url: self.url.clone(),
                details: e.to_string(),
            }),
        }
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed {
                details: e.to_string(),
            })
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => {
                    return Some(Err(TransportError::Disconnected {
                        reason: e.to_string(),
                    }))
                }
            };

            match message {
                Message::Text(text) => return Some(Ok(text)),
                // Passed on so the codec can reject it like any other bad frame
                Message::Binary(bytes) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Message::Close(frame) => {
                    debug!(?frame, "Server closed websocket");
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("Skipping control frame");
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Websocket close handshake failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_not_recoverable() {
        let connector = WebSocketConnector::new("ftp://example.invalid/telemetry");
        let err = match connector.connect().await {
            Ok(_) => panic!("connect should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, TransportError::InvalidUrl { .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_refused_connection_is_recoverable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WebSocketConnector::new(format!("ws://{}/telemetry", addr));
        let err = match connector.connect().await {
            Ok(_) => panic!("connect should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
        assert!(err.is_recoverable());
    }
}
