//! Fixed-window aggregation of per-frame metrics.
//!
//! Samples are grouped per camera into buckets of `bucket_seconds`, aligned
//! to the epoch. Closing a bucket yields `<name>_avg` (sum / sample count)
//! and `<name>_max` for every numeric field seen in the window.
//!
//! Starting a later bucket seals the previous one without emitting it; the
//! sealed bucket is handed out by the next [`MetricAggregator::try_close_bucket`]
//! call. Callers drain with `while let Some(bucket) = agg.try_close_bucket(..)`.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde_json::Value;

use crate::model::ClosedBucket;

/// Default window size in seconds.
pub const DEFAULT_BUCKET_SECONDS: u32 = 60;

#[derive(Debug, Clone)]
struct Bucket {
    ts_bucket: i64,
    count: u64,
    sums: BTreeMap<String, f64>,
    maxes: BTreeMap<String, f64>,
}

impl Bucket {
    fn new(ts_bucket: i64) -> Self {
        Self {
            ts_bucket,
            count: 0,
            sums: BTreeMap::new(),
            maxes: BTreeMap::new(),
        }
    }

    fn add(&mut self, metrics: &Value) {
        self.count += 1;

        let Some(fields) = metrics.as_object() else {
            return;
        };

        for (name, value) in fields {
            let v = match value {
                Value::Number(n) => match n.as_f64() {
                    Some(v) => v,
                    None => continue,
                },
                Value::Bool(b) => f64::from(u8::from(*b)),
                _ => continue,
            };
            *self.sums.entry(name.clone()).or_insert(0.0) += v;
            self.maxes
                .entry(name.clone())
                .and_modify(|m| *m = m.max(v))
                .or_insert(v);
        }
    }

    fn close(self) -> ClosedBucket {
        let denom = self.count.max(1) as f64;
        let mut metrics = BTreeMap::new();
        for (name, sum) in self.sums {
            metrics.insert(format!("{name}_avg"), sum / denom);
        }
        for (name, max) in self.maxes {
            metrics.insert(format!("{name}_max"), max);
        }
        ClosedBucket {
            ts_bucket: self.ts_bucket,
            count: self.count,
            metrics,
        }
    }
}

#[derive(Debug, Default)]
struct CameraBuckets {
    open: Option<Bucket>,
    sealed: VecDeque<Bucket>,
}

/// Aggregator keyed by camera id.
#[derive(Debug)]
pub struct MetricAggregator {
    bucket_seconds: i64,
    cameras: HashMap<String, CameraBuckets>,
}

impl Default for MetricAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_SECONDS)
    }
}

impl MetricAggregator {
    pub fn new(bucket_seconds: u32) -> Self {
        Self {
            bucket_seconds: i64::from(bucket_seconds.max(1)),
            cameras: HashMap::new(),
        }
    }

    /// Epoch-aligned start of the bucket containing `ts`.
    pub fn bucket_start(&self, ts: f64) -> i64 {
        let size = self.bucket_seconds as f64;
        ((ts / size).floor() * size) as i64
    }

    /// Add one snapshot. Only numeric and boolean fields are aggregated.
    pub fn add_sample(&mut self, camera_id: &str, ts: f64, metrics: &Value) {
        let start = self.bucket_start(ts);
        let camera = self.cameras.entry(camera_id.to_string()).or_default();

        let needs_new = camera.open.as_ref().is_none_or(|b| b.ts_bucket != start);
        if needs_new {
            if let Some(previous) = camera.open.take() {
                camera.sealed.push_back(previous);
            }
            camera.open = Some(Bucket::new(start));
        }

        if let Some(bucket) = camera.open.as_mut() {
            bucket.add(metrics);
        }
    }

    /// Close and return one finished bucket for `camera_id`, if any.
    ///
    /// Sealed buckets come out first, oldest first. Otherwise the open bucket
    /// is closed only when `ts` maps to a later bucket start.
    pub fn try_close_bucket(&mut self, camera_id: &str, ts: f64) -> Option<ClosedBucket> {
        let start = self.bucket_start(ts);
        let camera = self.cameras.get_mut(camera_id)?;

        if let Some(sealed) = camera.sealed.pop_front() {
            return Some(sealed.close());
        }

        match &camera.open {
            Some(open) if start > open.ts_bucket => camera.open.take().map(Bucket::close),
            _ => None,
        }
    }

    /// Start of the currently open bucket for `camera_id`.
    pub fn open_bucket_start(&self, camera_id: &str) -> Option<i64> {
        self.cameras
            .get(camera_id)
            .and_then(|c| c.open.as_ref())
            .map(|b| b.ts_bucket)
    }
}
