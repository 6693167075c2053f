//! Channel-wide incident feed, fed by broadcasts that reach every
//! connection regardless of which room it has joined.

use crate::config::IncidentConfig;
use crate::protocol::{EventKind, ServerEvent};
use crate::telemetry::{IncidentAlert, PrioritySignalUpdate};
use crate::transport::{BroadcastSubscriber, TransportChannel};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Read-only view of the feed
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalFeedSnapshot {
    /// Newest first
    pub incidents: Arc<VecDeque<IncidentAlert>>,
    pub last_priority_alert: Option<PrioritySignalUpdate>,
    pub incidents_seen: u64,
    pub priority_alerts_seen: u64,
}

struct FeedShared {
    state: Mutex<GlobalFeedSnapshot>,
    observer: watch::Sender<GlobalFeedSnapshot>,
    max_global: usize,
}

impl FeedShared {
    fn record_incident(&self, alert: &IncidentAlert) {
        let mut state = self.state.lock();
        let incidents = Arc::make_mut(&mut state.incidents);
        incidents.push_front(alert.clone());
        incidents.truncate(self.max_global);
        state.incidents_seen += 1;
        debug!(
            stream_id = %alert.stream_id,
            kind = alert.incident.kind.as_deref().unwrap_or("UNKNOWN"),
            "Global incident"
        );
        self.observer.send_replace(state.clone());
    }

    fn record_priority_alert(&self, update: &PrioritySignalUpdate) {
        let mut state = self.state.lock();
        state.last_priority_alert = Some(update.clone());
        state.priority_alerts_seen += 1;
        info!(
            stream_id = %update.stream_id,
            active = update.active,
            message = update.message.as_deref().unwrap_or(""),
            "Global priority alert"
        );
        self.observer.send_replace(state.clone());
    }
}

/// Bounded, newest-first list of incidents across every stream, plus the
/// last priority alert. Unaffected by stream switches.
pub struct GlobalIncidentFeed {
    shared: Arc<FeedShared>,
    _subscriber: BroadcastSubscriber,
}

impl GlobalIncidentFeed {
    pub fn attach(channel: &TransportChannel, config: &IncidentConfig) -> Self {
        let (observer, _) = watch::channel(GlobalFeedSnapshot::default());
        let shared = Arc::new(FeedShared {
            state: Mutex::new(GlobalFeedSnapshot::default()),
            observer,
            max_global: config.max_global.max(1),
        });

        let subscriber = channel.broadcast_subscriber();
        let incidents = Arc::clone(&shared);
        subscriber.on(EventKind::GlobalIncident, move |event| {
            if let ServerEvent::GlobalIncident(alert) = event {
                incidents.record_incident(alert);
            }
        });
        let alerts = Arc::clone(&shared);
        subscriber.on(EventKind::GlobalPriorityAlert, move |event| {
            if let ServerEvent::GlobalPriorityAlert(update) = event {
                alerts.record_priority_alert(update);
            }
        });

        Self {
            shared,
            _subscriber: subscriber,
        }
    }

    pub fn snapshot(&self) -> GlobalFeedSnapshot {
        self.shared.state.lock().clone()
    }

    /// Newest first
    pub fn incidents(&self) -> Arc<VecDeque<IncidentAlert>> {
        Arc::clone(&self.shared.state.lock().incidents)
    }

    pub fn last_priority_alert(&self) -> Option<PrioritySignalUpdate> {
        self.shared.state.lock().last_priority_alert.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GlobalFeedSnapshot> {
        self.shared.observer.subscribe()
    }
}
