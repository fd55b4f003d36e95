//! Liveness reporting.
//!
//! Every interval the loop publishes one store-level `edge_heartbeat` and one
//! `edge_camera_heartbeat` per configured camera. Cameras are seen through
//! the [`HeartbeatSource`] capability, implemented both by the live pipeline
//! handle and by [`StaticCamera`] in heartbeat-only mode.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::envelope::{Envelope, heartbeat_event};
use crate::sender::EventPublisher;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraIdentity {
    pub camera_id: String,
    pub name: Option<String>,
    pub rtsp_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Online,
    Error(String),
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Online => "online",
            HealthStatus::Error(_) => "error",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            HealthStatus::Online => None,
            HealthStatus::Error(e) => Some(e),
        }
    }
}

/// Something that can report a camera heartbeat.
pub trait HeartbeatSource: Send + Sync {
    fn identify(&self) -> CameraIdentity;
    fn health_status(&self) -> HealthStatus;
}

/// Stand-in for a camera without a vision pipeline. Always online.
#[derive(Debug, Clone)]
pub struct StaticCamera {
    identity: CameraIdentity,
}

impl StaticCamera {
    pub fn new(identity: CameraIdentity) -> Self {
        Self { identity }
    }
}

impl HeartbeatSource for StaticCamera {
    fn identify(&self) -> CameraIdentity {
        self.identity.clone()
    }

    fn health_status(&self) -> HealthStatus {
        HealthStatus::Online
    }
}

pub struct HeartbeatLoop {
    store_id: String,
    agent_id: String,
    interval: Duration,
    sources: Vec<Arc<dyn HeartbeatSource>>,
}

impl HeartbeatLoop {
    /// `interval` is raised to [`MIN_HEARTBEAT_INTERVAL`] when shorter.
    pub fn new(
        store_id: impl Into<String>,
        agent_id: impl Into<String>,
        interval: Duration,
        sources: Vec<Arc<dyn HeartbeatSource>>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            agent_id: agent_id.into(),
            interval: interval.max(MIN_HEARTBEAT_INTERVAL),
            sources,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Envelopes for one beat: the store heartbeat first, then each camera.
    pub fn beat(&self) -> Vec<Envelope> {
        let mut envelopes = Vec::with_capacity(self.sources.len() + 1);
        envelopes.push(heartbeat_event(&self.store_id, &self.agent_id, None));
        for source in &self.sources {
            let identity = source.identify();
            let health = source.health_status();
            envelopes.push(heartbeat_event(
                &self.store_id,
                &self.agent_id,
                Some((&identity, &health)),
            ));
        }
        envelopes
    }

    pub async fn run(self, publisher: EventPublisher, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            cameras = self.sources.len(),
            "Heartbeat loop started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let envelopes = self.beat();
                    debug!(count = envelopes.len(), "Publishing heartbeats");
                    for envelope in envelopes {
                        publisher.publish(envelope).await;
                    }
                }
            }
        }

        info!("Heartbeat loop stopped");
    }
}
