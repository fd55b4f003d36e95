//! Threshold rules evaluated against closed buckets.
//!
//! Each rule is a pure function of one [`ClosedBucket`] producing zero or
//! more alerts; nothing is carried across buckets.

use tracing::debug;

use crate::model::{Alert, AlertMetadata, ClosedBucket, Severity};

/// Default peak head count that raises `queue_long`.
pub const DEFAULT_LONG_QUEUE_THRESHOLD: f64 = 6.0;

pub const ALERT_QUEUE_LONG: &str = "queue_long";

#[derive(Debug, Clone)]
pub struct RuleEngine {
    long_queue_threshold: f64,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(DEFAULT_LONG_QUEUE_THRESHOLD)
    }
}

impl RuleEngine {
    pub fn new(long_queue_threshold: f64) -> Self {
        Self {
            long_queue_threshold,
        }
    }

    pub fn evaluate(&self, camera_id: &str, bucket: &ClosedBucket) -> Vec<Alert> {
        let alerts: Vec<Alert> = [self.queue_long(bucket)].into_iter().flatten().collect();

        if !alerts.is_empty() {
            debug!(
                camera_id,
                ts_bucket = bucket.ts_bucket,
                count = alerts.len(),
                "Rules fired"
            );
        }
        alerts
    }

    fn queue_long(&self, bucket: &ClosedBucket) -> Option<Alert> {
        let peak = bucket.metric("people_count_max")?;
        if peak < self.long_queue_threshold {
            return None;
        }

        Some(Alert {
            event_type: ALERT_QUEUE_LONG.to_string(),
            severity: Severity::Warning,
            title: "Possible long queue".to_string(),
            description: format!("Peak people detected: {peak}"),
            metadata: AlertMetadata {
                ts_bucket: bucket.ts_bucket,
                people_max: peak,
            },
        })
    }
}
