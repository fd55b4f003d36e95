//! Canonical event envelope and idempotency keys.
//!
//! Every event leaving the agent is wrapped in an [`Envelope`]:
//!
//! ```json
//! {
//!     "event_id": "5b0f...",
//!     "event_name": "edge_metric_bucket",
//!     "event_version": 1,
//!     "ts": "2024-01-15T10:30:00Z",
//!     "source": "edge",
//!     "lead_id": null,
//!     "org_id": null,
//!     "data": { "store_id": "...", "camera_id": "...", ... },
//!     "meta": { "agent_id": "..." },
//!     "receipt_id": "9f86d081..."
//! }
//! ```
//!
//! The `receipt_id` is a SHA-256 over `(event_name, store_id, camera_id, ts,
//! event_version)` only, so auxiliary fields in `data` never change it. The
//! collector and the outbox both deduplicate on it.

use std::collections::BTreeMap;
use std::io;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::heartbeat::{CameraIdentity, HealthStatus};
use crate::model::{Alert, ClosedBucket};

pub const EVENT_METRIC_BUCKET: &str = "edge_metric_bucket";
pub const EVENT_ALERT: &str = "alert";
pub const EVENT_HEARTBEAT: &str = "edge_heartbeat";
pub const EVENT_CAMERA_HEARTBEAT: &str = "edge_camera_heartbeat";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: Option<String>,
    pub event_name: String,
    pub event_version: u32,
    /// ISO-8601 UTC.
    pub ts: String,
    pub source: String,
    pub lead_id: Option<String>,
    pub org_id: Option<String>,
    pub data: Value,
    pub meta: Value,
    #[serde(default)]
    pub receipt_id: Option<String>,
}

impl Envelope {
    /// Compute and attach the receipt id.
    pub fn with_receipt(mut self) -> Self {
        self.receipt_id = Some(compute_receipt_id(&self));
        self
    }

    /// Receipt id, computing it if it was never attached.
    pub fn receipt(&self) -> String {
        self.receipt_id
            .clone()
            .unwrap_or_else(|| compute_receipt_id(self))
    }

    fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// ISO timestamp for an epoch second, e.g. a bucket start.
pub fn epoch_iso(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(now_iso)
}

/// Wrap `data` into an envelope. `ts` comes from `data.ts` when present.
pub fn build_envelope(
    event_name: &str,
    source: &str,
    data: Value,
    meta: Value,
    event_version: u32,
) -> Envelope {
    let ts = data
        .get("ts")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(now_iso);
    let event_id = data
        .get("event_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    Envelope {
        event_id: Some(event_id),
        event_name: event_name.to_string(),
        event_version,
        ts,
        source: source.to_string(),
        lead_id: None,
        org_id: None,
        data,
        meta: if meta.is_null() { json!({}) } else { meta },
        receipt_id: None,
    }
}

/// Hex SHA-256 over the event's identity fields.
///
/// The digest input is the identity object with sorted keys, `", "` between
/// members and `": "` after keys, non-ASCII left unescaped. Receipts computed
/// by other agents with that layout match ours byte for byte.
pub fn compute_receipt_id(envelope: &Envelope) -> String {
    let identity: BTreeMap<&str, Value> = BTreeMap::from([
        ("event_name", json!(envelope.event_name)),
        ("store_id", json!(envelope.data_str("store_id"))),
        ("camera_id", json!(envelope.data_str("camera_id"))),
        ("ts", json!(envelope.ts)),
        ("event_version", json!(envelope.event_version)),
    ]);
    let digest = Sha256::digest(spaced_json(&identity));
    hex::encode(digest)
}

/// JSON with a space after every `,` and `:` separator.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

fn spaced_json<T: Serialize>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    match value.serialize(&mut serializer) {
        Ok(()) => buf,
        // Only reachable on writer errors, and a Vec never fails
        Err(_) => serde_json::to_vec(value).unwrap_or_default(),
    }
}

/// `edge_metric_bucket` event for one closed bucket.
pub fn metric_bucket_event(
    store_id: &str,
    camera_id: &str,
    agent_id: &str,
    bucket: &ClosedBucket,
) -> Envelope {
    let data = json!({
        "store_id": store_id,
        "camera_id": camera_id,
        "ts_bucket": bucket.ts_bucket,
        "count": bucket.count,
        "metrics": bucket.metrics,
        "ts": epoch_iso(bucket.ts_bucket),
    });
    build_envelope(
        EVENT_METRIC_BUCKET,
        "edge",
        data,
        json!({ "agent_id": agent_id }),
        1,
    )
    .with_receipt()
}

/// `alert` event raised for a closed bucket.
pub fn alert_event(store_id: &str, camera_id: &str, agent_id: &str, alert: &Alert) -> Envelope {
    let data = json!({
        "store_id": store_id,
        "camera_id": camera_id,
        "event_type": alert.event_type,
        "severity": alert.severity,
        "title": alert.title,
        "description": alert.description,
        "metadata": alert.metadata,
        "ts": epoch_iso(alert.metadata.ts_bucket),
    });
    build_envelope(EVENT_ALERT, "edge", data, json!({ "agent_id": agent_id }), 1).with_receipt()
}

/// Store heartbeat when `camera` is `None`, camera heartbeat otherwise.
/// The receipt id is copied into `data.receipt_id`.
pub fn heartbeat_event(
    store_id: &str,
    agent_id: &str,
    camera: Option<(&CameraIdentity, &HealthStatus)>,
) -> Envelope {
    let online = HealthStatus::Online;
    let (camera_id, name, rtsp_url, health) = match camera {
        Some((id, health)) => (
            Some(id.camera_id.as_str()),
            id.name.as_deref(),
            id.rtsp_url.as_deref(),
            health,
        ),
        None => (None, None, None, &online),
    };
    let data = json!({
        "store_id": store_id,
        "camera_id": camera_id,
        "external_id": camera_id,
        "name": name,
        "rtsp_url": rtsp_url,
        "status": health.as_str(),
        "error": health.error(),
        "agent_id": agent_id,
        "ts": now_iso(),
    });
    let event_name = if camera.is_some() {
        EVENT_CAMERA_HEARTBEAT
    } else {
        EVENT_HEARTBEAT
    };

    let mut envelope = build_envelope(
        event_name,
        &format!("edge-agent:{agent_id}"),
        data,
        json!({}),
        1,
    )
    .with_receipt();
    if let (Some(receipt), Some(data)) = (envelope.receipt_id.clone(), envelope.data.as_object_mut()) {
        data.insert("receipt_id".to_string(), Value::String(receipt));
    }
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertMetadata, Severity};

    #[test]
    fn test_ts_taken_from_data() {
        let env = build_envelope(
            "x",
            "edge",
            json!({"ts": "2024-01-01T00:00:00Z"}),
            Value::Null,
            1,
        );
        assert_eq!(env.ts, "2024-01-01T00:00:00Z");
        assert_eq!(env.meta, json!({}));
        assert!(env.event_id.is_some());
        assert!(env.receipt_id.is_none());
    }

    #[test]
    fn test_ts_defaults_to_now() {
        let env = build_envelope("x", "edge", json!({}), json!({}), 1);
        assert!(env.ts.ends_with('Z'));
        assert!(DateTime::parse_from_rfc3339(&env.ts).is_ok());
    }

    #[test]
    fn test_receipt_ignores_auxiliary_data() {
        let base = json!({"store_id": "s1", "camera_id": "c1", "ts": "2024-01-01T00:01:00Z"});
        let mut extra = base.clone();
        extra["extra"] = json!({"anything": 42});

        let a = build_envelope("edge_metric_bucket", "edge", base, json!({}), 1).with_receipt();
        let b = build_envelope("edge_metric_bucket", "edge", extra, json!({}), 1).with_receipt();

        assert_eq!(a.receipt_id, b.receipt_id);
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.receipt_id.as_ref().map(String::len), Some(64));
    }

    #[test]
    fn test_receipt_known_values() {
        let data = json!({"store_id": "s1", "camera_id": "c1", "ts": "2024-01-01T00:01:00Z"});
        let env = build_envelope("edge_metric_bucket", "edge", data, json!({}), 1);
        assert_eq!(
            compute_receipt_id(&env),
            "25d7ba606eb54206bb47d60593258996eb8c04bc339978fb7fffc8e700634284"
        );

        let data = json!({"store_id": "loja-São", "ts": "2024-01-01T00:01:00Z"});
        let env = build_envelope("edge_heartbeat", "edge", data, json!({}), 1);
        assert_eq!(
            compute_receipt_id(&env),
            "11b25c92a7e89ad2e5c9ec4cad52bfa03d613db949bb7692d468bee10b3dfe5f"
        );
    }

    #[test]
    fn test_spaced_json_layout() {
        let value = json!({"a": {"x": null}, "b": [1, 2]});
        assert_eq!(
            String::from_utf8(spaced_json(&value)).unwrap(),
            r#"{"a": {"x": null}, "b": [1, 2]}"#
        );
    }

    #[test]
    fn test_receipt_changes_with_identity() {
        let data = json!({"store_id": "s1", "camera_id": "c1", "ts": "2024-01-01T00:01:00Z"});
        let base = build_envelope("a", "edge", data.clone(), json!({}), 1);

        let other_name = build_envelope("b", "edge", data.clone(), json!({}), 1);
        let other_version = build_envelope("a", "edge", data.clone(), json!({}), 2);
        let mut moved = data;
        moved["camera_id"] = json!("c2");
        let other_camera = build_envelope("a", "edge", moved, json!({}), 1);

        let r = compute_receipt_id(&base);
        assert_ne!(r, compute_receipt_id(&other_name));
        assert_ne!(r, compute_receipt_id(&other_version));
        assert_ne!(r, compute_receipt_id(&other_camera));
    }

    #[test]
    fn test_metric_bucket_event_shape() {
        let mut metrics = BTreeMap::new();
        metrics.insert("people_count_avg".to_string(), 1.5);
        let bucket = ClosedBucket {
            ts_bucket: 1_704_067_200,
            count: 2,
            metrics,
        };

        let env = metric_bucket_event("store", "cam", "agent", &bucket);
        assert_eq!(env.event_name, EVENT_METRIC_BUCKET);
        assert_eq!(env.ts, "2024-01-01T00:00:00Z");
        assert_eq!(env.data["ts_bucket"], 1_704_067_200_i64);
        assert_eq!(env.data["metrics"]["people_count_avg"], 1.5);
        assert_eq!(env.meta["agent_id"], "agent");
        assert!(env.receipt_id.is_some());

        // Re-closing the same bucket yields the same receipt
        let again = metric_bucket_event("store", "cam", "agent", &bucket);
        assert_eq!(env.receipt_id, again.receipt_id);
    }

    #[test]
    fn test_alert_event_shape() {
        let alert = Alert {
            event_type: "queue_long".to_string(),
            severity: Severity::Warning,
            title: "t".to_string(),
            description: "d".to_string(),
            metadata: AlertMetadata {
                ts_bucket: 60,
                people_max: 7.0,
            },
        };
        let env = alert_event("store", "cam", "agent", &alert);
        assert_eq!(env.event_name, EVENT_ALERT);
        assert_eq!(env.data["severity"], "warning");
        assert_eq!(env.data["metadata"]["people_max"], 7.0);
        assert_eq!(env.ts, "1970-01-01T00:01:00Z");
    }

    #[test]
    fn test_heartbeat_events() {
        let store = heartbeat_event("store", "agent", None);
        assert_eq!(store.event_name, EVENT_HEARTBEAT);
        assert_eq!(store.source, "edge-agent:agent");
        assert!(store.data["camera_id"].is_null());
        assert_eq!(store.data["status"], "online");
        assert_eq!(store.data["receipt_id"], json!(store.receipt_id));

        let identity = CameraIdentity {
            camera_id: "cam-1".to_string(),
            name: Some("Caixa".to_string()),
            rtsp_url: None,
        };
        let health = HealthStatus::Error("no frames".to_string());
        let cam = heartbeat_event("store", "agent", Some((&identity, &health)));
        assert_eq!(cam.event_name, EVENT_CAMERA_HEARTBEAT);
        assert_eq!(cam.data["external_id"], "cam-1");
        assert_eq!(cam.data["name"], "Caixa");
        assert_eq!(cam.data["status"], "error");
        assert_eq!(cam.data["error"], "no frames");
        // Receipt still covers identity only
        assert_eq!(cam.receipt_id, Some(compute_receipt_id(&cam)));
    }

    #[test]
    fn test_wire_shape_round_trips() {
        let env = build_envelope("x", "edge", json!({"store_id": "s"}), json!({}), 1).with_receipt();
        let wire = serde_json::to_value(&env).unwrap();
        for key in [
            "event_id",
            "event_name",
            "event_version",
            "ts",
            "source",
            "lead_id",
            "org_id",
            "data",
            "meta",
            "receipt_id",
        ] {
            assert!(wire.get(key).is_some(), "missing {key}");
        }
        let back: Envelope = serde_json::from_value(wire).unwrap();
        assert_eq!(back, env);
    }
}
