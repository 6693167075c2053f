//! Wire codec for the telemetry channel.
//!
//! Server frames are JSON envelopes `{"event": <name>, "data": {...}}`.
//! Client frames are room commands `{"op": "join" | "leave", "streamId": ...}`.

use crate::error::CodecError;
use crate::telemetry::{
    IncidentAlert, PrioritySignalUpdate, ProgressUpdate, StreamStatusUpdate, TelemetrySample,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TELEMETRY_EVENT: &str = "telemetry_update";
pub const STATUS_EVENT: &str = "stream_status";
pub const INCIDENT_EVENT: &str = "incident_alert";
pub const PRIORITY_EVENT: &str = "green_wave";
pub const PROGRESS_EVENT: &str = "analysis_progress";
pub const GLOBAL_INCIDENT_EVENT: &str = "new_incident";
pub const GLOBAL_PRIORITY_EVENT: &str = "green_wave_alert";

/// Room commands sent from the client to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        #[serde(rename = "streamId")]
        stream_id: String,
    },
    Leave {
        #[serde(rename = "streamId")]
        stream_id: String,
    },
}

impl ClientMessage {
    pub fn stream_id(&self) -> &str {
        match self {
            ClientMessage::Join { stream_id } | ClientMessage::Leave { stream_id } => stream_id,
        }
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Closed set of event kinds a handler can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Telemetry,
    StreamStatus,
    Incident,
    PrioritySignal,
    Progress,
    /// Incident broadcast to every connection regardless of room
    GlobalIncident,
    /// Priority alert broadcast to every connection regardless of room
    GlobalPriorityAlert,
}

impl EventKind {
    /// Canonical wire name
    pub fn wire_name(&self) -> &'static str {
        match self {
            EventKind::Telemetry => TELEMETRY_EVENT,
            EventKind::StreamStatus => STATUS_EVENT,
            EventKind::Incident => INCIDENT_EVENT,
            EventKind::PrioritySignal => PRIORITY_EVENT,
            EventKind::Progress => PROGRESS_EVENT,
            EventKind::GlobalIncident => GLOBAL_INCIDENT_EVENT,
            EventKind::GlobalPriorityAlert => GLOBAL_PRIORITY_EVENT,
        }
    }

    /// Sent to all connections rather than to one room
    pub fn is_broadcast(&self) -> bool {
        matches!(self, EventKind::GlobalIncident | EventKind::GlobalPriorityAlert)
    }

    /// Resolve a wire name, including legacy aliases
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            TELEMETRY_EVENT | "telemetry" => Some(EventKind::Telemetry),
            STATUS_EVENT => Some(EventKind::StreamStatus),
            INCIDENT_EVENT => Some(EventKind::Incident),
            PRIORITY_EVENT | "priority_signal" => Some(EventKind::PrioritySignal),
            PROGRESS_EVENT | "progress" => Some(EventKind::Progress),
            GLOBAL_INCIDENT_EVENT => Some(EventKind::GlobalIncident),
            GLOBAL_PRIORITY_EVENT => Some(EventKind::GlobalPriorityAlert),
            _ => None,
        }
    }
}

/// Events delivered by the server, scoped to a room unless broadcast
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Telemetry(TelemetrySample),
    StreamStatus(StreamStatusUpdate),
    Incident(IncidentAlert),
    PrioritySignal(PrioritySignalUpdate),
    Progress(ProgressUpdate),
    GlobalIncident(IncidentAlert),
    GlobalPriorityAlert(PrioritySignalUpdate),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Telemetry(_) => EventKind::Telemetry,
            ServerEvent::StreamStatus(_) => EventKind::StreamStatus,
            ServerEvent::Incident(_) => EventKind::Incident,
            ServerEvent::PrioritySignal(_) => EventKind::PrioritySignal,
            ServerEvent::Progress(_) => EventKind::Progress,
            ServerEvent::GlobalIncident(_) => EventKind::GlobalIncident,
            ServerEvent::GlobalPriorityAlert(_) => EventKind::GlobalPriorityAlert,
        }
    }

    /// Stream the event concerns; for broadcasts, the originating stream
    pub fn stream_id(&self) -> &str {
        match self {
            ServerEvent::Telemetry(sample) => &sample.stream_id,
            ServerEvent::StreamStatus(update) => &update.stream_id,
            ServerEvent::Incident(alert) | ServerEvent::GlobalIncident(alert) => &alert.stream_id,
            ServerEvent::PrioritySignal(update) | ServerEvent::GlobalPriorityAlert(update) => {
                &update.stream_id
            }
            ServerEvent::Progress(update) => &update.stream_id,
        }
    }

    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            ServerEvent::Telemetry(sample) => format!(
                "Frame {} on {} ({} boxes)",
                sample.frame_index,
                sample.stream_id,
                sample.boxes.len()
            ),
            ServerEvent::StreamStatus(update) => {
                format!("Stream {} is {:?}", update.stream_id, update.status)
            }
            ServerEvent::Incident(alert) => format!(
                "Incident {} on {}",
                alert.incident.kind.as_deref().unwrap_or("UNKNOWN"),
                alert.stream_id
            ),
            ServerEvent::PrioritySignal(update) => format!(
                "Priority signal {} on {}",
                if update.active { "raised" } else { "cleared" },
                update.stream_id
            ),
            ServerEvent::Progress(update) => format!("Progress on {}", update.stream_id),
            ServerEvent::GlobalIncident(alert) => format!(
                "Broadcast incident {} from {}",
                alert.incident.kind.as_deref().unwrap_or("UNKNOWN"),
                alert.stream_id
            ),
            ServerEvent::GlobalPriorityAlert(update) => {
                format!("Broadcast priority alert from {}", update.stream_id)
            }
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T: Serialize> {
    event: &'a str,
    data: &'a T,
}

/// Decode one server frame.
///
/// Telemetry samples are stamped with their local arrival time.
pub fn decode_event(text: &str) -> Result<ServerEvent, CodecError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let kind = EventKind::from_wire_name(&envelope.event).ok_or_else(|| {
        CodecError::UnknownEvent {
            event: envelope.event.clone(),
        }
    })?;

    let invalid = |e: serde_json::Error| CodecError::InvalidPayload {
        event: envelope.event.clone(),
        details: e.to_string(),
    };

    let event = match kind {
        EventKind::Telemetry => {
            let mut sample: TelemetrySample =
                serde_json::from_value(envelope.data).map_err(invalid)?;
            if !sample.has_finite_values() {
                return Err(CodecError::InvalidPayload {
                    event: envelope.event,
                    details: "non-finite box coordinates or confidence".to_string(),
                });
            }
            sample.mark_received();
            ServerEvent::Telemetry(sample)
        }
        EventKind::StreamStatus => {
            ServerEvent::StreamStatus(serde_json::from_value(envelope.data).map_err(invalid)?)
        }
        EventKind::Incident => {
            ServerEvent::Incident(serde_json::from_value(envelope.data).map_err(invalid)?)
        }
        EventKind::PrioritySignal => {
            ServerEvent::PrioritySignal(serde_json::from_value(envelope.data).map_err(invalid)?)
        }
        EventKind::Progress => {
            ServerEvent::Progress(serde_json::from_value(envelope.data).map_err(invalid)?)
        }
        EventKind::GlobalIncident => {
            ServerEvent::GlobalIncident(serde_json::from_value(envelope.data).map_err(invalid)?)
        }
        EventKind::GlobalPriorityAlert => ServerEvent::GlobalPriorityAlert(
            serde_json::from_value(envelope.data).map_err(invalid)?,
        ),
    };

    Ok(event)
}

/// Encode a server frame under its canonical event name
pub fn encode_event(event: &ServerEvent) -> Result<String, CodecError> {
    let name = event.kind().wire_name();
    let text = match event {
        ServerEvent::Telemetry(data) => serde_json::to_string(&EnvelopeRef { event: name, data })?,
        ServerEvent::StreamStatus(data) => {
            serde_json::to_string(&EnvelopeRef { event: name, data })?
        }
        ServerEvent::Incident(data) => serde_json::to_string(&EnvelopeRef { event: name, data })?,
        ServerEvent::PrioritySignal(data) => {
            serde_json::to_string(&EnvelopeRef { event: name, data })?
        }
        ServerEvent::Progress(data) => serde_json::to_string(&EnvelopeRef { event: name, data })?,
        ServerEvent::GlobalIncident(data) => {
            serde_json::to_string(&EnvelopeRef { event: name, data })?
        }
        ServerEvent::GlobalPriorityAlert(data) => {
            serde_json::to_string(&EnvelopeRef { event: name, data })?
        }
    };
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::StreamStatus;
    use serde_json::json;

    #[test]
    fn test_join_leave_wire_format() {
        let join = ClientMessage::Join {
            stream_id: "cam-7".to_string(),
        };
        let value: Value = serde_json::from_str(&join.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"op": "join", "streamId": "cam-7"}));

        let leave: ClientMessage =
            serde_json::from_str(r#"{"op":"leave","streamId":"cam-7"}"#).unwrap();
        assert_eq!(leave.stream_id(), "cam-7");
        assert!(matches!(leave, ClientMessage::Leave { .. }));
    }

    #[test]
    fn test_decode_telemetry_stamps_arrival() {
        let text = json!({
            "event": "telemetry_update",
            "data": {
                "streamId": "cam-1",
                "frameIndex": 12,
                "boxes": [{"coords": [0.1, 0.1, 0.2, 0.2], "label": "car", "confidence": 0.5}],
                "stats": {"count": 1, "status": "FLOW", "prioritySignal": false}
            }
        })
        .to_string();

        let event = decode_event(&text).unwrap();
        assert_eq!(event.kind(), EventKind::Telemetry);
        assert_eq!(event.stream_id(), "cam-1");
        match event {
            ServerEvent::Telemetry(sample) => {
                assert_eq!(sample.frame_index, 12);
                assert!(sample.received_at.is_some());
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_priority_alias_defaults_active() {
        let event = decode_event(
            r#"{"event":"priority_signal","data":{"streamId":"cam-1","message":"AMBULANCE"}}"#,
        )
        .unwrap();
        match event {
            ServerEvent::PrioritySignal(update) => assert!(update.active),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_status_and_progress() {
        let status =
            decode_event(r#"{"event":"stream_status","data":{"streamId":"s","status":"COMPLETED"}}"#)
                .unwrap();
        assert_eq!(
            status,
            ServerEvent::StreamStatus(StreamStatusUpdate {
                stream_id: "s".to_string(),
                status: StreamStatus::Completed,
            })
        );

        let progress = decode_event(
            r#"{"event":"analysis_progress","data":{"streamId":"s","progress":{"frame":30},"status":"Processed 30 frames"}}"#,
        )
        .unwrap();
        match progress {
            ServerEvent::Progress(update) => {
                assert_eq!(update.fields["progress"]["frame"], json!(30));
                assert_eq!(update.fields["status"], json!("Processed 30 frames"));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert!(matches!(decode_event("{not json"), Err(CodecError::Malformed(_))));
        assert!(matches!(
            decode_event(r#"{"event":"chat_message","data":{}}"#),
            Err(CodecError::UnknownEvent { .. })
        ));
        assert!(matches!(
            decode_event(r#"{"event":"telemetry_update","data":{"streamId":"s"}}"#),
            Err(CodecError::InvalidPayload { .. })
        ));
        assert!(matches!(
            decode_event(r#"{"event":"stream_status","data":{"streamId":"s","status":"PAUSED"}}"#),
            Err(CodecError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_decode_broadcasts() {
        let incident = decode_event(
            r#"{"event":"new_incident","data":{"streamId":"cam-4","incident":{"type":"CRASH"}}}"#,
        )
        .unwrap();
        assert_eq!(incident.kind(), EventKind::GlobalIncident);
        assert!(incident.kind().is_broadcast());
        assert_eq!(incident.stream_id(), "cam-4");

        let alert =
            decode_event(r#"{"event":"green_wave_alert","data":{"streamId":"cam-4"}}"#).unwrap();
        match alert {
            ServerEvent::GlobalPriorityAlert(update) => assert!(update.active),
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(!EventKind::PrioritySignal.is_broadcast());
    }

    #[test]
    fn test_encode_uses_canonical_names() {
        let event = ServerEvent::PrioritySignal(PrioritySignalUpdate {
            stream_id: "cam-1".to_string(),
            active: true,
            message: None,
            frame: Some(3),
        });
        let value: Value = serde_json::from_str(&encode_event(&event).unwrap()).unwrap();
        assert_eq!(value["event"], json!("green_wave"));
        assert_eq!(value["data"]["streamId"], json!("cam-1"));
        assert_eq!(decode_event(&value.to_string()).unwrap(), event);
    }
}
