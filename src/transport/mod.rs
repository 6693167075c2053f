mod channel;
mod connector;
#[cfg(test)]
pub(crate) mod mock;
mod websocket;

pub use channel::{
    BroadcastSubscriber, ConnectionPhase, ConnectionState, ReconnectPolicy, StreamSubscriber,
    TransportChannel, TransportStatsSnapshot,
};
pub use connector::{Connection, Connector};
pub use websocket::WebSocketConnector;
