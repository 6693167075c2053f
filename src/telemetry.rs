use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::SystemTime;

/// Traffic flow classification reported by the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FlowStatus {
    /// Traffic moving freely
    Flow,
    /// Traffic slowing down
    Slow,
    /// Traffic jammed
    Jam,
    /// No classification available
    #[default]
    Unknown,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Flow => "FLOW",
            FlowStatus::Slow => "SLOW",
            FlowStatus::Jam => "JAM",
            FlowStatus::Unknown => "UNKNOWN",
        }
    }
}

impl From<String> for FlowStatus {
    // Detector strings may carry an indicator glyph, e.g. "🟡 SLOW".
    fn from(value: String) -> Self {
        let upper = value.to_ascii_uppercase();
        if upper.contains("FLOW") {
            FlowStatus::Flow
        } else if upper.contains("SLOW") {
            FlowStatus::Slow
        } else if upper.contains("JAM") {
            FlowStatus::Jam
        } else {
            FlowStatus::Unknown
        }
    }
}

impl From<FlowStatus> for String {
    fn from(value: FlowStatus) -> Self {
        value.as_str().to_string()
    }
}

/// Lifecycle of the analysis job behind a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatus {
    #[default]
    Idle,
    Analyzing,
    Completed,
    Error,
}

impl StreamStatus {
    /// Whether the analysis job has stopped producing telemetry
    pub fn is_finished(&self) -> bool {
        matches!(self, StreamStatus::Completed | StreamStatus::Error)
    }
}

/// One detection inside a telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    /// Normalized region `[x1, y1, x2, y2]`, each in `[0, 1]`
    pub coords: [f32; 4],
    /// Class label
    #[serde(default, alias = "class")]
    pub label: String,
    /// Detector confidence in `[0, 1]`
    #[serde(default, alias = "conf")]
    pub confidence: f32,
}

impl DetectionBox {
    pub fn new(coords: [f32; 4], label: impl Into<String>, confidence: f32) -> Self {
        Self {
            coords,
            label: label.into(),
            confidence,
        }
    }

    /// Confidence as a whole percentage, rounded to nearest
    pub fn confidence_percent(&self) -> u32 {
        (self.confidence.clamp(0.0, 1.0) * 100.0).round() as u32
    }

    fn is_finite(&self) -> bool {
        self.coords.iter().all(|c| c.is_finite()) && self.confidence.is_finite()
    }
}

/// Aggregate snapshot carried by every sample
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    /// Vehicles currently in view
    #[serde(default)]
    pub count: u32,
    /// Flow classification
    #[serde(default)]
    pub status: FlowStatus,
    /// Priority corridor requested by the detector
    #[serde(default, alias = "green_wave")]
    pub priority_signal: bool,
}

/// One event produced by the upstream detector for a single analyzed frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    /// Room this sample belongs to
    pub stream_id: String,
    /// Position in the analyzed frame sequence
    #[serde(alias = "frame")]
    pub frame_index: u64,
    /// Detections in draw order
    #[serde(default)]
    pub boxes: Vec<DetectionBox>,
    /// Aggregate snapshot
    #[serde(default)]
    pub stats: AggregateStats,
    /// Server-side emission time, when the server supplied one
    #[serde(
        default,
        rename = "timestamp",
        deserialize_with = "deserialize_wire_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Local arrival time, diagnostics only
    #[serde(skip)]
    pub received_at: Option<SystemTime>,
}

impl TelemetrySample {
    pub fn new(stream_id: impl Into<String>, frame_index: u64) -> Self {
        Self {
            stream_id: stream_id.into(),
            frame_index,
            boxes: Vec::new(),
            stats: AggregateStats::default(),
            source_timestamp: None,
            received_at: None,
        }
    }

    pub fn with_boxes(mut self, boxes: Vec<DetectionBox>) -> Self {
        self.boxes = boxes;
        self
    }

    pub fn with_stats(mut self, stats: AggregateStats) -> Self {
        self.stats = stats;
        self
    }

    /// Stamp the local arrival time
    pub fn mark_received(&mut self) {
        self.received_at = Some(SystemTime::now());
    }

    pub(crate) fn has_finite_values(&self) -> bool {
        self.boxes.iter().all(DetectionBox::is_finite)
    }
}

/// Incident body; typed where the server is consistent, the rest passed through
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Incident {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusUpdate {
    pub stream_id: String,
    pub status: StreamStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentAlert {
    pub stream_id: String,
    pub incident: Incident,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrioritySignalUpdate {
    pub stream_id: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, alias = "frameIndex", skip_serializing_if = "Option::is_none")]
    pub frame: Option<u64>,
}

/// Progress report; opaque beyond the stream id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub stream_id: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

fn default_active() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Millis(i64),
    Text(DateTime<Utc>),
}

fn deserialize_wire_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<WireTimestamp>::deserialize(deserializer)?;
    Ok(raw.and_then(|ts| match ts {
        WireTimestamp::Millis(ms) => Utc.timestamp_millis_opt(ms).single(),
        WireTimestamp::Text(dt) => Some(dt),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flow_status_from_detector_strings() {
        assert_eq!(FlowStatus::from("🟢 FLOW".to_string()), FlowStatus::Flow);
        assert_eq!(FlowStatus::from("🟡 SLOW".to_string()), FlowStatus::Slow);
        assert_eq!(FlowStatus::from("🔴 JAM".to_string()), FlowStatus::Jam);
        assert_eq!(FlowStatus::from("whatever".to_string()), FlowStatus::Unknown);
    }

    #[test]
    fn test_sample_accepts_legacy_field_names() {
        let sample: TelemetrySample = serde_json::from_value(json!({
            "streamId": "cam-1",
            "frame": 42,
            "boxes": [{"coords": [0.1, 0.2, 0.3, 0.4], "class": "car", "conf": 0.87}],
            "stats": {"count": 3, "status": "🔴 JAM", "green_wave": true},
            "timestamp": 1_700_000_000_000i64
        }))
        .unwrap();

        assert_eq!(sample.frame_index, 42);
        assert_eq!(sample.boxes[0].label, "car");
        assert_eq!(sample.boxes[0].confidence_percent(), 87);
        assert_eq!(sample.stats.status, FlowStatus::Jam);
        assert!(sample.stats.priority_signal);
        assert_eq!(
            sample.source_timestamp.unwrap().timestamp_millis(),
            1_700_000_000_000
        );
        assert!(sample.received_at.is_none());
    }

    #[test]
    fn test_sample_accepts_rfc3339_timestamp_and_defaults() {
        let sample: TelemetrySample = serde_json::from_value(json!({
            "streamId": "cam-1",
            "frameIndex": 7,
            "timestamp": "2024-05-01T12:00:00Z"
        }))
        .unwrap();

        assert!(sample.boxes.is_empty());
        assert_eq!(sample.stats, AggregateStats::default());
        assert!(sample.source_timestamp.is_some());
    }

    #[test]
    fn test_negative_frame_index_rejected() {
        let result: Result<TelemetrySample, _> = serde_json::from_value(json!({
            "streamId": "cam-1",
            "frameIndex": -1
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_confidence_percent_rounds() {
        assert_eq!(DetectionBox::new([0.0; 4], "car", 0.875).confidence_percent(), 88);
        assert_eq!(DetectionBox::new([0.0; 4], "car", 0.004).confidence_percent(), 0);
        assert_eq!(DetectionBox::new([0.0; 4], "car", 1.3).confidence_percent(), 100);
    }

    #[test]
    fn test_incident_keeps_unknown_fields() {
        let alert: IncidentAlert = serde_json::from_value(json!({
            "streamId": "cam-1",
            "incident": {"id": "i-1", "type": "STALL", "vehicleCount": 4}
        }))
        .unwrap();

        assert_eq!(alert.incident.kind.as_deref(), Some("STALL"));
        assert_eq!(alert.incident.extra["vehicleCount"], json!(4));
    }

    #[test]
    fn test_stream_status_finished() {
        assert!(StreamStatus::Completed.is_finished());
        assert!(StreamStatus::Error.is_finished());
        assert!(!StreamStatus::Analyzing.is_finished());
    }
}
