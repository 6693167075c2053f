use super::connector::{Connection, Connector};
use crate::error::TransportError;
use crate::protocol::ClientMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Accept,
    Refuse,
    /// Accept, then panic on the first read
    Panic,
}

/// In-memory connector with a scripted sequence of outcomes.
///
/// Attempts past the end of the script are refused.
pub struct MockConnector {
    script: Mutex<VecDeque<Outcome>>,
    attempts: AtomicU32,
    attempt_times: Mutex<Vec<Instant>>,
    accepted: mpsc::UnboundedSender<MockServerEnd>,
}

/// Server side of one accepted mock connection
pub struct MockServerEnd {
    /// Frames to deliver to the client; dropping it closes the connection
    pub inbound: mpsc::UnboundedSender<Result<String, TransportError>>,
    /// Frames the client sent
    pub outbound: mpsc::UnboundedReceiver<String>,
}

impl MockServerEnd {
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.inbound.send(Ok(text.into()));
    }

    /// Next room command sent by the client
    pub async fn next_command(&mut self) -> Option<ClientMessage> {
        let text = self.outbound.recv().await?;
        serde_json::from_str(&text).ok()
    }
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockServerEnd>) {
        let (accepted, servers) = mpsc::unbounded_channel();
        (
            Self {
                script: Mutex::new(VecDeque::new()),
                attempts: AtomicU32::new(0),
                attempt_times: Mutex::new(Vec::new()),
                accepted,
            },
            servers,
        )
    }

    pub fn accept_next(&self, count: usize) -> &Self {
        self.script.lock().extend(std::iter::repeat(Outcome::Accept).take(count));
        self
    }

    pub fn refuse_next(&self, count: usize) -> &Self {
        self.script.lock().extend(std::iter::repeat(Outcome::Refuse).take(count));
        self
    }

    /// Accept the next attempt with a connection that panics when read
    pub fn panic_next(&self) -> &Self {
        self.script.lock().push_back(Outcome::Panic);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn endpoint(&self) -> &str {
        "mock://telemetry"
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.attempt_times.lock().push(Instant::now());

        let outcome = self.script.lock().pop_front().unwrap_or(Outcome::Refuse);
        if outcome == Outcome::Refuse {
            return Err(TransportError::ConnectFailed {
                url: self.endpoint().to_string(),
                details: "connection refused".to_string(),
            });
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let _ = self.accepted.send(MockServerEnd {
            inbound: inbound_tx,
            outbound: outbound_rx,
        });

        Ok(Box::new(MockConnection {
            inbound: inbound_rx,
            outbound: outbound_tx,
            panic_on_recv: outcome == Outcome::Panic,
        }))
    }
}

struct MockConnection {
    inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    outbound: mpsc::UnboundedSender<String>,
    panic_on_recv: bool,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(text)
            .map_err(|_| TransportError::SendFailed {
                details: "mock server gone".to_string(),
            })
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        if self.panic_on_recv {
            panic!("mock connection read failure");
        }
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}
