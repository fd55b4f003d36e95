//! Per-camera processing: detections in, envelopes out.
//!
//! A [`CameraWorker`] pulls frames from a [`DetectionFeed`], runs them through
//! its [`CameraPipeline`] (classifier, aggregator, rules) and publishes the
//! resulting bucket and alert events. Each worker owns its pipeline outright;
//! the only state it shares is a [`CameraHealth`] handle read by the
//! heartbeat loop.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregation::MetricAggregator;
use crate::classifier::RoiClassifier;
use crate::envelope::{Envelope, alert_event, metric_bucket_event};
use crate::heartbeat::{CameraIdentity, HealthStatus, HeartbeatSource};
use crate::model::Frame;
use crate::rules::RuleEngine;
use crate::sender::EventPublisher;

/// Silence after which open buckets are closed on wall-clock time.
pub const DEFAULT_IDLE_FLUSH: Duration = Duration::from_secs(5);

pub struct CameraPipeline {
    store_id: String,
    agent_id: String,
    classifier: RoiClassifier,
    aggregator: MetricAggregator,
    rules: RuleEngine,
    last_frame_ts: Option<f64>,
}

impl CameraPipeline {
    pub fn new(
        store_id: impl Into<String>,
        agent_id: impl Into<String>,
        classifier: RoiClassifier,
        aggregator: MetricAggregator,
        rules: RuleEngine,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            agent_id: agent_id.into(),
            classifier,
            aggregator,
            rules,
            last_frame_ts: None,
        }
    }

    pub fn camera_id(&self) -> &str {
        self.classifier.camera_id()
    }

    pub fn last_frame_ts(&self) -> Option<f64> {
        self.last_frame_ts
    }

    /// Classify and aggregate one frame, returning events for every bucket
    /// the frame closed. Frames must arrive in non-decreasing `ts` order.
    pub fn process_frame(&mut self, frame: &Frame) -> Vec<Envelope> {
        let snapshot = self.classifier.classify(&frame.detections, frame.ts);
        let camera_id = self.classifier.camera_id().to_string();
        match serde_json::to_value(snapshot) {
            Ok(metrics) => self.aggregator.add_sample(&camera_id, frame.ts, &metrics),
            Err(e) => warn!(camera_id = %camera_id, error = %e, "Dropping unserializable snapshot"),
        }
        self.last_frame_ts = Some(frame.ts);
        self.close_ready(frame.ts)
    }

    /// Close whatever is finished as of `ts` without adding a sample.
    pub fn flush_at(&mut self, ts: f64) -> Vec<Envelope> {
        self.close_ready(ts)
    }

    fn close_ready(&mut self, ts: f64) -> Vec<Envelope> {
        let camera_id = self.classifier.camera_id().to_string();
        let mut envelopes = Vec::new();

        while let Some(bucket) = self.aggregator.try_close_bucket(&camera_id, ts) {
            info!(
                camera_id = %camera_id,
                ts_bucket = bucket.ts_bucket,
                samples = bucket.count,
                "Bucket closed"
            );
            envelopes.push(metric_bucket_event(
                &self.store_id,
                &camera_id,
                &self.agent_id,
                &bucket,
            ));
            for alert in self.rules.evaluate(&camera_id, &bucket) {
                envelopes.push(alert_event(
                    &self.store_id,
                    &camera_id,
                    &self.agent_id,
                    &alert,
                ));
            }
        }

        envelopes
    }
}

/// Health of a live camera, shared between its worker and the heartbeat loop.
#[derive(Debug)]
pub struct CameraHealth {
    identity: CameraIdentity,
    status: Mutex<HealthStatus>,
}

impl CameraHealth {
    pub fn new(identity: CameraIdentity) -> Self {
        Self {
            identity,
            status: Mutex::new(HealthStatus::Online),
        }
    }

    pub fn set(&self, status: HealthStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

impl HeartbeatSource for CameraHealth {
    fn identify(&self) -> CameraIdentity {
        self.identity.clone()
    }

    fn health_status(&self) -> HealthStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Source of detection frames for one camera.
///
/// `next_frame` is polled inside `select!`, so implementations must be
/// cancel-safe.
#[async_trait]
pub trait DetectionFeed: Send {
    /// Next frame, or `Ok(None)` once the feed is exhausted.
    async fn next_frame(&mut self) -> anyhow::Result<Option<Frame>>;
}

/// Replays frames from a file with one JSON [`Frame`] per line.
/// Blank and malformed lines are skipped; a malformed detection only drops
/// itself, never the rest of its frame.
pub struct JsonLinesFeed {
    path: PathBuf,
    lines: Lines<BufReader<tokio::fs::File>>,
    skipped: u64,
    dropped_detections: u64,
}

impl JsonLinesFeed {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("opening detection feed {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
            skipped: 0,
            dropped_detections: 0,
        })
    }

    /// Lines that could not be decoded as a frame.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn dropped_detections(&self) -> u64 {
        self.dropped_detections
    }
}

#[async_trait]
impl DetectionFeed for JsonLinesFeed {
    async fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match Frame::from_json(line) {
                Ok(decoded) => {
                    if decoded.dropped > 0 {
                        self.dropped_detections += decoded.dropped as u64;
                        debug!(
                            path = %self.path.display(),
                            ts = decoded.frame.ts,
                            dropped = decoded.dropped,
                            "Dropped malformed detections"
                        );
                    }
                    return Ok(Some(decoded.frame));
                }
                Err(e) => {
                    self.skipped += 1;
                    warn!(path = %self.path.display(), error = %e, "Skipping malformed frame");
                }
            }
        }
        Ok(None)
    }
}

pub struct CameraWorker {
    pipeline: CameraPipeline,
    feed: Box<dyn DetectionFeed>,
    health: Arc<CameraHealth>,
    idle_flush: Duration,
}

impl CameraWorker {
    pub fn new(
        pipeline: CameraPipeline,
        feed: Box<dyn DetectionFeed>,
        health: Arc<CameraHealth>,
        idle_flush: Duration,
    ) -> Self {
        Self {
            pipeline,
            feed,
            health,
            idle_flush: idle_flush.max(Duration::from_millis(10)),
        }
    }

    pub async fn run(mut self, publisher: EventPublisher, cancel: CancellationToken) {
        let camera_id = self.pipeline.camera_id().to_string();
        info!(camera_id = %camera_id, "Camera worker started");

        let mut tick = tokio::time::interval(self.idle_flush);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_frame_at: Option<Instant> = None;
        let mut feed_done = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.feed.next_frame(), if !feed_done => match next {
                    Ok(Some(frame)) => {
                        self.health.set(HealthStatus::Online);
                        last_frame_at = Some(Instant::now());
                        for envelope in self.pipeline.process_frame(&frame) {
                            publisher.publish(envelope).await;
                        }
                    }
                    Ok(None) => {
                        info!(camera_id = %camera_id, "Detection feed ended");
                        self.health.set(HealthStatus::Error("feed ended".to_string()));
                        feed_done = true;
                    }
                    Err(e) => {
                        warn!(camera_id = %camera_id, error = %e, "Detection feed failed");
                        self.health.set(HealthStatus::Error(e.to_string()));
                        feed_done = true;
                    }
                },
                _ = tick.tick() => {
                    let Some(at) = last_frame_at else { continue };
                    let Some(last_ts) = self.pipeline.last_frame_ts() else { continue };
                    let silent = at.elapsed();
                    if silent < self.idle_flush {
                        continue;
                    }
                    let envelopes = self.pipeline.flush_at(last_ts + silent.as_secs_f64());
                    if !envelopes.is_empty() {
                        debug!(camera_id = %camera_id, count = envelopes.len(), "Idle flush");
                    }
                    for envelope in envelopes {
                        publisher.publish(envelope).await;
                    }
                }
            }
        }

        info!(camera_id = %camera_id, "Camera worker stopped");
    }
}
