use crate::config::IncidentConfig;
use crate::protocol::ServerEvent;
use crate::telemetry::{
    AggregateStats, Incident, IncidentAlert, PrioritySignalUpdate, ProgressUpdate,
    StreamStatus, StreamStatusUpdate, TelemetrySample,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Transient priority-corridor signal derived from the event stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedIncidentSignal {
    pub active: bool,
    pub raised_at: Option<SystemTime>,
    deadline: Option<Instant>,
}

impl DerivedIncidentSignal {
    /// An active signal without a deadline stays up until cleared
    fn is_active_at(&self, now: Instant) -> bool {
        self.active && self.deadline.map_or(true, |deadline| now < deadline)
    }
}

/// Read-only view of everything the aggregator tracks
#[derive(Debug, Clone, Default)]
pub struct AggregateSnapshot {
    pub latest_sample: Option<Arc<TelemetrySample>>,
    pub stats: AggregateStats,
    pub stream_status: StreamStatus,
    pub progress: Option<ProgressUpdate>,
    /// Newest first
    pub recent_incidents: Arc<VecDeque<Incident>>,
    pub priority_active: bool,
    pub priority_raised_at: Option<SystemTime>,
}

#[derive(Default)]
struct AggregateState {
    latest_sample: Option<Arc<TelemetrySample>>,
    stats: AggregateStats,
    stream_status: StreamStatus,
    progress: Option<ProgressUpdate>,
    recent_incidents: Arc<VecDeque<Incident>>,
    priority: DerivedIncidentSignal,
    priority_generation: u64,
}

impl AggregateState {
    fn snapshot(&self, now: Instant) -> AggregateSnapshot {
        AggregateSnapshot {
            latest_sample: self.latest_sample.clone(),
            stats: self.stats.clone(),
            stream_status: self.stream_status,
            progress: self.progress.clone(),
            recent_incidents: Arc::clone(&self.recent_incidents),
            priority_active: self.priority.is_active_at(now),
            priority_raised_at: self.priority.raised_at,
        }
    }
}

struct Shared {
    state: Mutex<AggregateState>,
    observer: watch::Sender<AggregateSnapshot>,
}

impl Shared {
    fn publish(&self, state: &AggregateState) {
        self.observer.send_replace(state.snapshot(Instant::now()));
    }

    fn expire_priority(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.priority_generation != generation || !state.priority.active {
            return;
        }
        state.priority.active = false;
        state.priority.deadline = None;
        info!("Priority signal expired");
        self.publish(&state);
    }
}

/// Maintains live derived state for one stream: latest sample, flow stats,
/// lifecycle status, progress, recent incidents and the priority signal.
///
/// Only the aggregator's own event handlers and timers mutate this state.
pub struct IncidentAggregator {
    shared: Arc<Shared>,
    priority_timeout: Duration,
    max_recent: usize,
    expiry_timer: Mutex<Option<JoinHandle<()>>>,
}

impl IncidentAggregator {
    pub fn new(config: &IncidentConfig) -> Self {
        Self::with_limits(config.priority_timeout(), config.max_recent)
    }

    pub fn with_limits(priority_timeout: Duration, max_recent: usize) -> Self {
        let (observer, _) = watch::channel(AggregateSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(AggregateState::default()),
                observer,
            }),
            priority_timeout,
            max_recent: max_recent.max(1),
            expiry_timer: Mutex::new(None),
        }
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<AggregateSnapshot> {
        self.shared.observer.subscribe()
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        self.shared.state.lock().snapshot(Instant::now())
    }

    /// Whether the priority signal is raised right now
    pub fn priority_active(&self) -> bool {
        self.shared.state.lock().priority.is_active_at(Instant::now())
    }

    /// Priority signal with `active` evaluated against the current time
    pub fn priority_signal(&self) -> DerivedIncidentSignal {
        let state = self.shared.state.lock();
        DerivedIncidentSignal {
            active: state.priority.is_active_at(Instant::now()),
            ..state.priority.clone()
        }
    }

    pub fn stats(&self) -> AggregateStats {
        self.shared.state.lock().stats.clone()
    }

    pub fn recent_incidents(&self) -> Arc<VecDeque<Incident>> {
        Arc::clone(&self.shared.state.lock().recent_incidents)
    }

    pub(crate) fn handle_event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::Telemetry(sample) => self.record_sample(Arc::new(sample.clone())),
            ServerEvent::StreamStatus(update) => self.apply_status(update),
            ServerEvent::Incident(alert) => self.record_incident(alert),
            ServerEvent::PrioritySignal(update) => self.apply_priority(update),
            ServerEvent::Progress(update) => self.record_progress(update),
            ServerEvent::GlobalIncident(_) | ServerEvent::GlobalPriorityAlert(_) => {
                trace!("Broadcast event ignored by stream aggregator");
            }
        }
    }

    pub(crate) fn record_sample(&self, sample: Arc<TelemetrySample>) {
        let mut state = self.shared.state.lock();
        trace!(frame_index = sample.frame_index, "Tracking latest sample");
        state.stats = sample.stats.clone();
        state.latest_sample = Some(sample);
        self.shared.publish(&state);
    }

    pub(crate) fn apply_status(&self, update: &StreamStatusUpdate) {
        let mut state = self.shared.state.lock();
        debug!(stream_id = %update.stream_id, status = ?update.status, "Stream status changed");
        state.stream_status = update.status;
        if update.status.is_finished() {
            state.progress = None;
        }
        self.shared.publish(&state);
    }

    pub(crate) fn record_incident(&self, alert: &IncidentAlert) {
        let mut state = self.shared.state.lock();
        info!(
            stream_id = %alert.stream_id,
            kind = alert.incident.kind.as_deref().unwrap_or("UNKNOWN"),
            "Incident alert received"
        );
        let incidents = Arc::make_mut(&mut state.recent_incidents);
        incidents.push_front(alert.incident.clone());
        incidents.truncate(self.max_recent);
        self.shared.publish(&state);
    }

    pub(crate) fn record_progress(&self, update: &ProgressUpdate) {
        let mut state = self.shared.state.lock();
        state.progress = Some(update.clone());
        self.shared.publish(&state);
    }

    /// Raise (or re-raise) the signal with a fresh expiry, or clear it.
    pub(crate) fn apply_priority(&self, update: &PrioritySignalUpdate) {
        if !update.active {
            info!(stream_id = %update.stream_id, "Priority signal cleared by server");
            self.clear_priority();
            return;
        }

        // Timeouts too large for the clock leave the signal up until cleared
        let deadline = Instant::now().checked_add(self.priority_timeout);
        let generation = {
            let mut state = self.shared.state.lock();
            state.priority_generation += 1;
            state.priority = DerivedIncidentSignal {
                active: true,
                raised_at: Some(SystemTime::now()),
                deadline,
            };
            self.shared.publish(&state);
            state.priority_generation
        };

        info!(
            stream_id = %update.stream_id,
            message = update.message.as_deref().unwrap_or(""),
            "Priority signal raised"
        );

        match deadline {
            Some(deadline) => self.schedule_expiry(generation, deadline),
            None => {
                warn!(
                    timeout_s = self.priority_timeout.as_secs(),
                    "Priority timeout out of range; signal will not auto-clear"
                );
                self.cancel_expiry();
            }
        }
    }

    /// Clear incidents and the priority signal, keeping live stats
    pub(crate) fn reset(&self) {
        self.cancel_expiry();
        let mut state = self.shared.state.lock();
        state.priority_generation += 1;
        state.priority = DerivedIncidentSignal::default();
        state.recent_incidents = Arc::new(VecDeque::new());
        self.shared.publish(&state);
    }

    /// Forget everything tracked for the current stream
    pub(crate) fn clear(&self) {
        self.cancel_expiry();
        let mut state = self.shared.state.lock();
        let generation = state.priority_generation + 1;
        *state = AggregateState {
            priority_generation: generation,
            ..AggregateState::default()
        };
        self.shared.publish(&state);
    }

    fn clear_priority(&self) {
        self.cancel_expiry();
        let mut state = self.shared.state.lock();
        state.priority_generation += 1;
        state.priority.active = false;
        state.priority.deadline = None;
        self.shared.publish(&state);
    }

    fn schedule_expiry(&self, generation: u64, deadline: Instant) {
        // Without a runtime the deadline is still honoured by queries;
        // only the push notification to observers is lost.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime; priority expiry evaluated on query");
            return;
        };

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = shared.upgrade() {
                shared.expire_priority(generation);
            }
        });

        if let Some(previous) = self.expiry_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_expiry(&self) {
        if let Some(timer) = self.expiry_timer.lock().take() {
            timer.abort();
        }
    }
}

impl Drop for IncidentAggregator {
    fn drop(&mut self) {
        self.cancel_expiry();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::FlowStatus;

    fn aggregator() -> IncidentAggregator {
        IncidentAggregator::with_limits(Duration::from_secs(10), 50)
    }

    fn raise(stream_id: &str) -> PrioritySignalUpdate {
        PrioritySignalUpdate {
            stream_id: stream_id.to_string(),
            active: true,
            message: Some("AMBULANCE DETECTED".to_string()),
            frame: None,
        }
    }

    fn alert(n: usize) -> IncidentAlert {
        IncidentAlert {
            stream_id: "cam-1".to_string(),
            incident: Incident {
                id: Some(format!("i-{}", n)),
                ..Incident::default()
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_auto_expires() {
        let aggregator = aggregator();
        aggregator.apply_priority(&raise("cam-1"));
        assert!(aggregator.priority_active());

        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert!(aggregator.priority_active());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(!aggregator.priority_active());

        let signal = aggregator.priority_signal();
        assert!(!signal.active);
        assert!(signal.raised_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_expiry_notifies_observers() {
        let aggregator = aggregator();
        let mut observer = aggregator.subscribe();

        aggregator.apply_priority(&raise("cam-1"));
        assert!(observer.borrow_and_update().priority_active);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(observer.has_changed().unwrap());
        assert!(!observer.borrow_and_update().priority_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reraise_restarts_timer() {
        let aggregator = aggregator();
        aggregator.apply_priority(&raise("cam-1"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        aggregator.apply_priority(&raise("cam-1"));

        // 12s after the first raise, 6s after the second
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(aggregator.priority_active());
        assert!(aggregator.snapshot().priority_active);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!aggregator.priority_active());
        assert!(!aggregator.snapshot().priority_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_timeout_keeps_signal_until_cleared() {
        let aggregator = IncidentAggregator::with_limits(Duration::from_secs(u64::MAX), 50);
        aggregator.apply_priority(&raise("cam-1"));
        assert!(aggregator.priority_active());

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert!(aggregator.priority_active());

        let mut clear = raise("cam-1");
        clear.active = false;
        aggregator.apply_priority(&clear);
        assert!(!aggregator.priority_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_event_clears_immediately() {
        let aggregator = aggregator();
        aggregator.apply_priority(&raise("cam-1"));

        let mut clear = raise("cam-1");
        clear.active = false;
        aggregator.apply_priority(&clear);

        assert!(!aggregator.priority_active());
    }

    #[test]
    fn test_priority_without_runtime_still_expires_on_query() {
        let aggregator = IncidentAggregator::with_limits(Duration::from_millis(0), 50);
        aggregator.apply_priority(&raise("cam-1"));
        assert!(!aggregator.priority_active());
    }

    #[test]
    fn test_recent_incidents_capped_newest_first() {
        let aggregator = aggregator();
        for n in 0..60 {
            aggregator.record_incident(&alert(n));
        }

        let incidents = aggregator.recent_incidents();
        assert_eq!(incidents.len(), 50);
        assert_eq!(incidents[0].id.as_deref(), Some("i-59"));
        assert_eq!(incidents[49].id.as_deref(), Some("i-10"));
    }

    #[test]
    fn test_snapshot_not_affected_by_later_incidents() {
        let aggregator = aggregator();
        aggregator.record_incident(&alert(1));
        let before = aggregator.snapshot();

        aggregator.record_incident(&alert(2));

        assert_eq!(before.recent_incidents.len(), 1);
        assert_eq!(aggregator.snapshot().recent_incidents.len(), 2);
    }

    #[test]
    fn test_finished_status_clears_progress() {
        let aggregator = aggregator();
        aggregator.record_progress(&ProgressUpdate {
            stream_id: "cam-1".to_string(),
            fields: serde_json::Map::new(),
        });
        aggregator.apply_status(&StreamStatusUpdate {
            stream_id: "cam-1".to_string(),
            status: StreamStatus::Analyzing,
        });
        assert!(aggregator.snapshot().progress.is_some());

        aggregator.apply_status(&StreamStatusUpdate {
            stream_id: "cam-1".to_string(),
            status: StreamStatus::Completed,
        });
        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.stream_status, StreamStatus::Completed);
        assert!(snapshot.progress.is_none());
    }

    #[test]
    fn test_sample_updates_stats() {
        let aggregator = aggregator();
        let sample = TelemetrySample::new("cam-1", 4).with_stats(AggregateStats {
            count: 9,
            status: FlowStatus::Slow,
            priority_signal: false,
        });
        aggregator.handle_event(&ServerEvent::Telemetry(sample));

        assert_eq!(aggregator.stats().count, 9);
        assert_eq!(
            aggregator.snapshot().latest_sample.unwrap().frame_index,
            4
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_incidents_and_priority() {
        let aggregator = aggregator();
        aggregator.record_incident(&alert(1));
        aggregator.apply_priority(&raise("cam-1"));
        aggregator.record_sample(Arc::new(TelemetrySample::new("cam-1", 1)));

        aggregator.reset();

        assert!(aggregator.recent_incidents().is_empty());
        assert!(!aggregator.priority_active());
        assert!(aggregator.snapshot().latest_sample.is_some());

        aggregator.clear();
        assert!(aggregator.snapshot().latest_sample.is_none());
    }
}
