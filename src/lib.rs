pub mod aggregator;
pub mod config;
pub mod error;
pub mod feed;
pub mod overlay;
pub mod playback;
pub mod protocol;
pub mod resolver;
pub mod ring_buffer;
pub mod session;
pub mod telemetry;
pub mod transport;

#[cfg(feature = "diagnostics")]
pub mod diagnostics;

pub use aggregator::{AggregateSnapshot, DerivedIncidentSignal, IncidentAggregator};
pub use config::SyncConfig;
pub use error::{CodecError, Result, SyncError, TransportError};
pub use feed::{GlobalFeedSnapshot, GlobalIncidentFeed};
pub use overlay::{OverlayFrame, OverlayRenderer, OverlaySurface, RecordingSurface, RenderInstruction};
pub use playback::{
    ClockBridge, ExternalPlayback, PlaybackClock, PlaybackPosition, PlaybackSource, PlaybackStats,
    TickOutcome, WallClockPlayback,
};
pub use protocol::{decode_event, encode_event, ClientMessage, EventKind, ServerEvent};
pub use resolver::{resolve_nearest, FrameSnapshot};
pub use ring_buffer::{FrameRingBuffer, FrameRingBufferBuilder};
pub use session::{SessionSnapshot, StreamSession};
pub use telemetry::{
    AggregateStats, DetectionBox, FlowStatus, Incident, ProgressUpdate, StreamStatus,
    TelemetrySample,
};
pub use transport::{
    BroadcastSubscriber, ConnectionPhase, ConnectionState, Connector, ReconnectPolicy,
    StreamSubscriber, TransportChannel, WebSocketConnector,
};

#[cfg(feature = "raster")]
pub use overlay::ImageSurface;

#[cfg(feature = "diagnostics")]
pub use diagnostics::{DiagnosticsServer, DiagnosticsServerBuilder};
