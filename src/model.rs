//! Data models for the edge agent.
//!
//! These are the values that flow between pipeline stages: detections coming
//! in from the detector, per-frame metrics snapshots, closed aggregation
//! buckets and the alerts derived from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::geometry::Point;

/// Axis-aligned bounding box in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    /// Horizontal center, vertical center. Robust to occluded feet.
    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Horizontal center at the bottom edge, i.e. where the person stands.
    pub fn foot(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, self.y2)
    }
}

/// A single person detection as produced by the detector.
///
/// `xyxy` is kept in the detector's raw form; a detection whose box does not
/// have exactly four coordinates is unusable and gets skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default)]
    pub xyxy: Option<Vec<f64>>,

    /// Persistent identifier assigned by an upstream tracker, if any.
    /// Integral floats and numeric strings are accepted; anything else
    /// leaves the detection untracked.
    #[serde(default, alias = "id", deserialize_with = "lenient_track_id")]
    pub track_id: Option<i64>,
}

impl Detection {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            xyxy: Some(vec![x1, y1, x2, y2]),
            track_id: None,
        }
    }

    pub fn with_track(mut self, track_id: i64) -> Self {
        self.track_id = Some(track_id);
        self
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        match self.xyxy.as_deref() {
            Some(&[x1, y1, x2, y2]) if [x1, y1, x2, y2].iter().all(|v| v.is_finite()) => {
                Some(BoundingBox { x1, y1, x2, y2 })
            }
            _ => None,
        }
    }
}

fn lenient_track_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(track_id_from_value))
}

fn track_id_from_value(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// One processed frame: capture time (epoch seconds) plus its detections.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Frame {
    pub ts: f64,
    pub detections: Vec<Detection>,
}

/// Wire form of a frame. Detections stay untyped here so one bad entry
/// doesn't reject the rest of the frame.
#[derive(Debug, Deserialize)]
struct RawFrame {
    ts: f64,
    #[serde(default)]
    detections: Option<Vec<Value>>,
}

/// A frame decoded from JSON, with the number of detections that had to be
/// dropped because they did not decode.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub frame: Frame,
    pub dropped: usize,
}

impl Frame {
    /// Decode `{"ts": .., "detections": [..]}`. Only a missing or invalid
    /// `ts` fails the frame; bad detections are dropped one by one.
    pub fn from_json(line: &str) -> serde_json::Result<DecodedFrame> {
        let raw: RawFrame = serde_json::from_str(line)?;
        let values = raw.detections.unwrap_or_default();
        let total = values.len();
        let detections: Vec<Detection> = values
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();

        Ok(DecodedFrame {
            dropped: total - detections.len(),
            frame: Frame {
                ts: raw.ts,
                detections,
            },
        })
    }
}

/// Instantaneous counters for one frame of one camera.
///
/// `checkout_events`, `entries` and `exits` are per-frame increments; every
/// other field is an occupancy count at that instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub people_count: u32,

    // balcao
    pub queue_count: u32,
    pub pay_count: u32,
    pub staff_count: u32,
    pub checkout_events: u32,

    // salao
    pub consumo_count: u32,

    // entrada
    pub entries: u32,
    pub exits: u32,

    pub debug_clients_at_pay: u32,
    pub debug_staff_at_cashier: u32,
}

/// Summary of one closed aggregation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedBucket {
    /// Window start in epoch seconds, aligned to the window size.
    pub ts_bucket: i64,

    /// Number of samples that landed in the window.
    pub count: u64,

    /// `<name>_avg` and `<name>_max` for every numeric field seen.
    pub metrics: BTreeMap<String, f64>,
}

impl ClosedBucket {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
}

/// An alert raised by the rule engine for one closed bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub event_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub metadata: AlertMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMetadata {
    pub ts_bucket: i64,
    pub people_max: f64,
}
