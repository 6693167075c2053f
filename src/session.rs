use crate::aggregator::{AggregateSnapshot, IncidentAggregator};
use crate::config::{PlaybackConfig, SyncConfig};
use crate::error::Result;
use crate::overlay::{OverlayRenderer, OverlaySurface};
use crate::playback::{ClockBridge, PlaybackClock, PlaybackSource, RenderGate};
use crate::protocol::{EventKind, ServerEvent};
use crate::ring_buffer::{FrameRingBuffer, FrameRingBufferBuilder, RingBufferStatsSnapshot};
use crate::telemetry::{AggregateStats, Incident, ProgressUpdate, StreamStatus, TelemetrySample};
use crate::transport::{ConnectionPhase, ConnectionState, StreamSubscriber, TransportChannel};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Live view of one stream: buffered telemetry, derived state and the
/// connection status, as consumed by a presentation layer.
pub struct StreamSession {
    stream_id: RwLock<String>,
    subscriber: StreamSubscriber,
    connection: watch::Receiver<ConnectionState>,
    buffer: Arc<FrameRingBuffer>,
    aggregator: Arc<IncidentAggregator>,
    renderer: OverlayRenderer,
    playback: PlaybackConfig,
    /// Cancelled when the session closes
    lifetime: CancellationToken,
    /// Cancelled on every stream switch; playback clocks hang off it
    epoch: Mutex<CancellationToken>,
    /// Held by clocks while drawing
    render_gate: RenderGate,
}

/// Serializable point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub stream_id: String,
    pub connection: ConnectionPhase,
    pub connected: bool,
    pub connection_error: Option<String>,
    pub buffer_size: usize,
    pub buffer_capacity: usize,
    pub buffered_frames: Option<(u64, u64)>,
    pub latest_frame: Option<u64>,
    pub stats: AggregateStats,
    pub stream_status: StreamStatus,
    pub analysis_progress: Option<ProgressUpdate>,
    pub recent_incidents: Vec<Incident>,
    pub priority_active: bool,
    pub buffer_stats: RingBufferStatsSnapshot,
}

impl StreamSession {
    /// Subscribe to `stream_id` on `channel` and start tracking its events
    pub fn open(
        channel: &TransportChannel,
        stream_id: impl Into<String>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let stream_id = stream_id.into();
        let buffer = Arc::new(
            FrameRingBufferBuilder::new()
                .capacity(config.buffer.capacity)
                .build()?,
        );
        let aggregator = Arc::new(IncidentAggregator::new(&config.incidents));
        let subscriber = channel.subscriber();

        {
            let buffer = Arc::clone(&buffer);
            let aggregator = Arc::clone(&aggregator);
            subscriber.on(EventKind::Telemetry, move |event| {
                if let ServerEvent::Telemetry(sample) = event {
                    let sample = Arc::new(sample.clone());
                    buffer.push(Arc::clone(&sample));
                    aggregator.record_sample(sample);
                }
            });
        }

        for kind in [
            EventKind::StreamStatus,
            EventKind::Incident,
            EventKind::PrioritySignal,
            EventKind::Progress,
        ] {
            let aggregator = Arc::clone(&aggregator);
            subscriber.on(kind, move |event| aggregator.handle_event(event));
        }

        subscriber.subscribe(stream_id.clone());
        info!(stream_id = %stream_id, capacity = config.buffer.capacity, "Stream session opened");

        let lifetime = CancellationToken::new();
        let epoch = lifetime.child_token();

        Ok(Self {
            stream_id: RwLock::new(stream_id),
            subscriber,
            connection: channel.watch_state(),
            buffer,
            aggregator,
            renderer: OverlayRenderer::new(&config.overlay),
            playback: config.playback.clone(),
            lifetime,
            epoch: Mutex::new(epoch),
            render_gate: RenderGate::default(),
        })
    }

    pub fn stream_id(&self) -> String {
        self.stream_id.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.borrow().connected()
    }

    /// Terminal connection failure, if the channel gave up
    pub fn connection_error(&self) -> Option<String> {
        self.connection
            .borrow()
            .connection_error()
            .map(|e| e.to_string())
    }

    pub fn latest_sample(&self) -> Option<Arc<TelemetrySample>> {
        self.aggregator.snapshot().latest_sample
    }

    pub fn aggregate_stats(&self) -> AggregateStats {
        self.aggregator.stats()
    }

    pub fn stream_status(&self) -> StreamStatus {
        self.aggregator.snapshot().stream_status
    }

    pub fn analysis_progress(&self) -> Option<ProgressUpdate> {
        self.aggregator.snapshot().progress
    }

    /// Newest first
    pub fn recent_incidents(&self) -> Arc<VecDeque<Incident>> {
        self.aggregator.recent_incidents()
    }

    pub fn priority_active(&self) -> bool {
        self.aggregator.priority_active()
    }

    /// Observe derived state changes
    pub fn watch_aggregate(&self) -> watch::Receiver<AggregateSnapshot> {
        self.aggregator.subscribe()
    }

    /// Buffered sample nearest to `frame_index`
    pub fn lookup(&self, frame_index: u64) -> Option<Arc<TelemetrySample>> {
        self.buffer.snapshot().resolve(frame_index)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.size()
    }

    /// Drop buffered samples, recent incidents and the priority signal
    pub fn reset(&self) {
        info!(stream_id = %self.stream_id.read(), "Resetting stream session");
        self.buffer.clear();
        self.aggregator.reset();
    }

    /// Move the session to another stream.
    ///
    /// Playback clocks mounted for the previous stream stop, and nothing
    /// buffered or derived for it survives.
    pub fn switch_stream(&self, stream_id: impl Into<String>) {
        let stream_id = stream_id.into();
        let mut current = self.stream_id.write();
        if *current == stream_id {
            debug!(stream_id = %stream_id, "Already on stream");
            return;
        }

        let mut epoch = self.epoch.lock();
        epoch.cancel();

        {
            let _quiesced = self.render_gate.write();
            self.subscriber.subscribe_with(stream_id.clone(), || {
                self.buffer.clear();
                self.aggregator.clear();
            });
        }

        *epoch = self.lifetime.child_token();
        info!(from = %current, to = %stream_id, "Stream session switched");
        *current = stream_id;
    }

    /// Start a playback clock drawing onto `surface` until the session
    /// closes or switches stream
    pub fn mount_playback<S>(
        &self,
        source: Arc<dyn PlaybackSource>,
        surface: Arc<Mutex<S>>,
    ) -> PlaybackClock
    where
        S: OverlaySurface + 'static,
    {
        let bridge = ClockBridge::new(
            Arc::clone(&self.buffer),
            Arc::clone(&self.aggregator),
            self.renderer.clone(),
            self.playback.frames_per_second,
        )
        .with_render_gate(Arc::clone(&self.render_gate));
        let cancel = self.epoch.lock().child_token();
        PlaybackClock::spawn(bridge, source, surface, self.playback.tick_interval(), cancel)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let connection = self.connection.borrow().clone();
        let aggregate = self.aggregator.snapshot();
        let frames = self.buffer.snapshot();

        SessionSnapshot {
            stream_id: self.stream_id(),
            connection: connection.phase,
            connected: connection.connected(),
            connection_error: connection.connection_error().map(|e| e.to_string()),
            buffer_size: frames.len(),
            buffer_capacity: self.buffer.capacity(),
            buffered_frames: frames.frame_range(),
            latest_frame: aggregate.latest_sample.as_ref().map(|s| s.frame_index),
            stats: aggregate.stats,
            stream_status: aggregate.stream_status,
            analysis_progress: aggregate.progress,
            recent_incidents: aggregate.recent_incidents.iter().cloned().collect(),
            priority_active: aggregate.priority_active,
            buffer_stats: self.buffer.stats(),
        }
    }

    /// Leave the stream, stop playback clocks and timers
    pub fn close(&self) {
        let stream_id = self.stream_id.read().clone();
        self.lifetime.cancel();

        let _quiesced = self.render_gate.write();
        self.subscriber.unsubscribe(&stream_id);
        self.buffer.clear();
        self.aggregator.clear();
        info!(stream_id = %stream_id, "Stream session closed");
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::RecordingSurface;
    use crate::playback::ExternalPlayback;
    use crate::protocol::encode_event;
    use crate::telemetry::{IncidentAlert, PrioritySignalUpdate, StreamStatusUpdate};
    use crate::transport::mock::{MockConnector, MockServerEnd};
    use crate::transport::ReconnectPolicy;
    use std::time::Duration;

    async fn connected_channel() -> (TransportChannel, MockServerEnd) {
        let (connector, mut servers) = MockConnector::new();
        connector.accept_next(1);
        let channel = TransportChannel::new(connector, ReconnectPolicy::default());
        channel.connect();
        channel.connected().await.unwrap();
        let server = servers.recv().await.unwrap();
        (channel, server)
    }

    fn frame(stream_id: &str, frame_index: u64) -> String {
        encode_event(&ServerEvent::Telemetry(TelemetrySample::new(stream_id, frame_index))).unwrap()
    }

    async fn wait_for_frame(session: &StreamSession, stream_id: &str, frame_index: u64) {
        let mut aggregate = session.watch_aggregate();
        aggregate
            .wait_for(|s| {
                s.latest_sample
                    .as_ref()
                    .map_or(false, |x| x.stream_id == stream_id && x.frame_index == frame_index)
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_buffer_and_lookup() {
        let (channel, server) = connected_channel().await;
        let session = StreamSession::open(&channel, "cam-1", &SyncConfig::default()).unwrap();

        for frame_index in 0..310 {
            server.push(frame("cam-1", frame_index));
        }
        wait_for_frame(&session, "cam-1", 309).await;

        assert!(session.is_connected());
        assert_eq!(session.buffer_size(), 300);
        assert_eq!(session.lookup(305).unwrap().frame_index, 305);
        assert_eq!(session.lookup(1).unwrap().frame_index, 10);
        assert_eq!(session.latest_sample().unwrap().frame_index, 309);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.buffered_frames, Some((10, 309)));
        assert_eq!(snapshot.buffer_stats.samples_evicted, 10);
    }

    #[tokio::test]
    async fn test_switch_stream_isolates_state() {
        let (channel, server) = connected_channel().await;
        let session = StreamSession::open(&channel, "cam-a", &SyncConfig::default()).unwrap();

        server.push(frame("cam-a", 1));
        server.push(frame("cam-a", 2));
        wait_for_frame(&session, "cam-a", 2).await;

        session.switch_stream("cam-b");
        assert_eq!(session.buffer_size(), 0);
        assert!(session.latest_sample().is_none());

        server.push(frame("cam-a", 3));
        server.push(frame("cam-b", 50));
        wait_for_frame(&session, "cam-b", 50).await;

        assert_eq!(session.buffer_size(), 1);
        assert_eq!(session.lookup(3).unwrap().stream_id, "cam-b");
        assert_eq!(session.stream_id(), "cam-b");
        assert_eq!(channel.joined_rooms(), vec!["cam-b".to_string()]);
    }

    #[tokio::test]
    async fn test_derived_state_and_reset() {
        let (channel, server) = connected_channel().await;
        let session = StreamSession::open(&channel, "cam-1", &SyncConfig::default()).unwrap();

        let events = [
            ServerEvent::StreamStatus(StreamStatusUpdate {
                stream_id: "cam-1".to_string(),
                status: StreamStatus::Analyzing,
            }),
            ServerEvent::Incident(IncidentAlert {
                stream_id: "cam-1".to_string(),
                incident: Incident {
                    kind: Some("STALL".to_string()),
                    ..Incident::default()
                },
            }),
            ServerEvent::PrioritySignal(PrioritySignalUpdate {
                stream_id: "cam-1".to_string(),
                active: true,
                message: None,
                frame: None,
            }),
        ];
        for event in &events {
            server.push(encode_event(event).unwrap());
        }
        server.push(frame("cam-1", 1));
        wait_for_frame(&session, "cam-1", 1).await;

        assert_eq!(session.stream_status(), StreamStatus::Analyzing);
        assert_eq!(session.recent_incidents().len(), 1);
        assert!(session.priority_active());

        session.reset();
        assert_eq!(session.buffer_size(), 0);
        assert!(session.recent_incidents().is_empty());
        assert!(!session.priority_active());
        assert_eq!(session.stream_status(), StreamStatus::Analyzing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_error_surfaces() {
        let (connector, _servers) = MockConnector::new();
        let channel = TransportChannel::new(connector, ReconnectPolicy::default());
        let session = StreamSession::open(&channel, "cam-1", &SyncConfig::default()).unwrap();

        assert!(session.connection_error().is_none());
        channel.connect();
        assert!(channel.connected().await.is_err());

        assert!(!session.is_connected());
        let error = session.connection_error().unwrap();
        assert!(error.contains("5 reconnection attempts"), "{}", error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_stops_mounted_playback() {
        let (channel, server) = connected_channel().await;
        let session = StreamSession::open(&channel, "cam-a", &SyncConfig::default()).unwrap();
        server.push(frame("cam-a", 0));
        wait_for_frame(&session, "cam-a", 0).await;

        let source = Arc::new(ExternalPlayback::new());
        let surface = Arc::new(Mutex::new(RecordingSurface::new(320, 240)));
        let clock = session.mount_playback(source, Arc::clone(&surface));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(clock.stats().draws > 0);

        session.switch_stream("cam-b");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!clock.is_running());

        let draws = surface.lock().draws();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(surface.lock().draws(), draws);
    }

    #[tokio::test]
    async fn test_close_leaves_room() {
        let (channel, _server) = connected_channel().await;
        let session = StreamSession::open(&channel, "cam-1", &SyncConfig::default()).unwrap();
        assert_eq!(channel.joined_rooms(), vec!["cam-1".to_string()]);

        session.close();
        assert!(channel.joined_rooms().is_empty());
    }

    fn priority(stream_id: &str) -> String {
        encode_event(&ServerEvent::PrioritySignal(PrioritySignalUpdate {
            stream_id: stream_id.to_string(),
            active: true,
            message: None,
            frame: None,
        }))
        .unwrap()
    }

    async fn wait_for_priority(session: &StreamSession) {
        session
            .watch_aggregate()
            .wait_for(|s| s.priority_active)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_ends_previous_priority_timer() {
        let (channel, server) = connected_channel().await;
        let session = StreamSession::open(&channel, "cam-a", &SyncConfig::default()).unwrap();

        server.push(priority("cam-a"));
        wait_for_priority(&session).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        session.switch_stream("cam-b");
        assert!(!session.priority_active());

        tokio::time::sleep(Duration::from_secs(1)).await;
        server.push(priority("cam-b"));
        wait_for_priority(&session).await;

        // Past the deadline cam-a's timer would have had
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(session.priority_active());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!session.priority_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_ends_priority_timer() {
        let (channel, server) = connected_channel().await;
        let session = StreamSession::open(&channel, "cam-1", &SyncConfig::default()).unwrap();

        server.push(priority("cam-1"));
        wait_for_priority(&session).await;

        session.close();
        let mut aggregate = session.watch_aggregate();
        aggregate.borrow_and_update();
        assert!(!aggregate.borrow().priority_active);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(!aggregate.has_changed().unwrap());
        assert!(!session.priority_active());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_switch_waits_for_inflight_draw() {
        use crate::overlay::OverlayFrame;

        struct SlowSurface {
            log: Arc<Mutex<Vec<&'static str>>>,
        }

        impl OverlaySurface for SlowSurface {
            fn size(&self) -> (u32, u32) {
                (320, 240)
            }

            fn clear(&mut self) {}

            fn draw(&mut self, _frame: &OverlayFrame) {
                self.log.lock().push("draw-start");
                std::thread::sleep(Duration::from_millis(50));
                self.log.lock().push("draw-end");
            }
        }

        let (channel, server) = connected_channel().await;
        let session = Arc::new(StreamSession::open(&channel, "cam-a", &SyncConfig::default()).unwrap());
        server.push(frame("cam-a", 0));
        wait_for_frame(&session, "cam-a", 0).await;

        let log = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(ExternalPlayback::new());
        let surface = Arc::new(Mutex::new(SlowSurface { log: Arc::clone(&log) }));
        let clock = session.mount_playback(source, surface);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !log.lock().contains(&"draw-start") {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        let switching = Arc::clone(&session);
        let switch_log = Arc::clone(&log);
        tokio::task::spawn_blocking(move || {
            switching.switch_stream("cam-b");
            switch_log.lock().push("switched");
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!clock.is_running());

        let log = log.lock().clone();
        let switched = log.iter().position(|e| *e == "switched").unwrap();
        assert_eq!(log[switched - 1], "draw-end");
        assert_eq!(log.len(), switched + 1, "drawn after switch: {:?}", log);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let (connector, _servers) = MockConnector::new();
        let channel = TransportChannel::new(connector, ReconnectPolicy::default());
        let mut config = SyncConfig::default();
        config.buffer.capacity = 0;

        assert!(StreamSession::open(&channel, "cam-1", &config).is_err());
    }
}
