//! Process wiring.
//!
//! [`run`] opens the outbox, starts one worker per camera with a detection
//! feed, the heartbeat loop and the status server, then drives the sender on
//! the current task until shutdown or a fatal delivery error.
//!
//! [`run_once`] is the diagnostic path: one store heartbeat straight to the
//! collector, no outbox, no retries.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregation::MetricAggregator;
use crate::api::{AppState, router};
use crate::classifier::RoiClassifier;
use crate::config::{AgentConfig, CameraConfig};
use crate::envelope::heartbeat_event;
use crate::error::AgentError;
use crate::heartbeat::{HealthStatus, HeartbeatLoop, HeartbeatSource, StaticCamera};
use crate::pipeline::{CameraHealth, CameraPipeline, CameraWorker, DEFAULT_IDLE_FLUSH, JsonLinesFeed};
use crate::roi::RoiConfig;
use crate::rules::RuleEngine;
use crate::sender::{EventPublisher, Sender, SenderConfig, pending_channel};
use crate::state::RuntimeStatus;
use crate::storage::Outbox;
use crate::transport::{ApiClient, EventSink};

pub async fn run(config: AgentConfig, cancel: CancellationToken) -> Result<(), AgentError> {
    info!(
        store_id = %config.store_id,
        agent_id = %config.agent_id,
        base_url = %config.cloud_base_url,
        token = %config.masked_token(),
        heartbeat_only = config.heartbeat_only,
        cameras = config.cameras.len(),
        "Starting edge agent"
    );

    let outbox = Outbox::new(&config.database_url)
        .await
        .with_context(|| format!("opening outbox {}", config.database_url))?;
    let backlog = outbox.pending_count().await?;
    info!(backlog, "Outbox ready");

    let status = Arc::new(RuntimeStatus::new());
    status.set_running(true, config.heartbeat_only);

    let client = ApiClient::new(&config.cloud_base_url, &config.edge_token, config.timeout)?;
    let (publisher, rx) = pending_channel(config.queue_capacity, outbox.clone());

    let mut tasks = JoinSet::new();
    let mut sources: Vec<Arc<dyn HeartbeatSource>> = Vec::with_capacity(config.cameras.len());
    for camera in &config.cameras {
        let source = start_camera(&config, camera, &publisher, &cancel, &mut tasks).await;
        sources.push(source);
    }

    let heartbeat = HeartbeatLoop::new(
        config.store_id.clone(),
        config.agent_id.clone(),
        config.heartbeat_interval,
        sources,
    );
    tasks.spawn(heartbeat.run(publisher, cancel.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.status_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding status server on {addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("reading status server address")?;
    info!(addr = %local_addr, "Status server listening");
    let app = router(AppState {
        status: status.clone(),
        outbox: outbox.clone(),
        store_id: config.store_id.clone(),
        agent_id: config.agent_id.clone(),
    });
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    let sender = Sender::new(
        client,
        outbox.clone(),
        status.clone(),
        SenderConfig {
            flush_interval: config.send_interval,
            ..SenderConfig::default()
        },
    );
    let result = sender.run(rx, cancel.clone()).await;

    // The sender also returns on fatal errors; stop everyone else too
    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Task ended abnormally");
        }
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Status server failed"),
        Err(e) => warn!(error = %e, "Status server task ended abnormally"),
    }

    status.set_stopped();
    let remaining = outbox.pending_count().await.unwrap_or(-1);
    outbox.close().await;
    info!(remaining, "Edge agent stopped");

    result.map_err(AgentError::from)
}

/// Send a single store heartbeat and return the collector's HTTP status.
pub async fn run_once(config: &AgentConfig) -> Result<u16, AgentError> {
    let client = ApiClient::new(&config.cloud_base_url, &config.edge_token, config.timeout)?;
    let envelope = heartbeat_event(&config.store_id, &config.agent_id, None);

    match client.post_event(&envelope).await {
        Ok(status) => {
            info!(url = %client.events_url(), status, "Heartbeat delivered");
            Ok(status)
        }
        Err(e) => {
            error!(
                url = %client.events_url(),
                store_id = %config.store_id,
                status = ?e.status(),
                error = %e,
                "Heartbeat failed"
            );
            Err(AgentError::from(e))
        }
    }
}

/// Start the worker for one camera and return its heartbeat source.
/// Cameras without a usable feed are reported through a stub.
async fn start_camera(
    config: &AgentConfig,
    camera: &CameraConfig,
    publisher: &EventPublisher,
    cancel: &CancellationToken,
    tasks: &mut JoinSet<()>,
) -> Arc<dyn HeartbeatSource> {
    let feed_path = match (&camera.feed, config.heartbeat_only) {
        (Some(path), false) => path,
        _ => {
            info!(camera_id = %camera.camera_id, "Camera in heartbeat-only mode");
            return Arc::new(StaticCamera::new(camera.identity()));
        }
    };

    let health = Arc::new(CameraHealth::new(camera.identity()));
    let feed = match JsonLinesFeed::open(feed_path).await {
        Ok(feed) => feed,
        Err(e) => {
            warn!(camera_id = %camera.camera_id, error = %e, "Detection feed unavailable");
            health.set(HealthStatus::Error(format!("{e:#}")));
            return health;
        }
    };

    let roi = RoiConfig::load_or_empty(camera.roi_config.as_deref(), &camera.camera_id);
    info!(camera_id = %camera.camera_id, role = ?roi.role(), "Starting camera pipeline");
    let pipeline = CameraPipeline::new(
        config.store_id.clone(),
        config.agent_id.clone(),
        RoiClassifier::new(camera.camera_id.clone(), roi),
        MetricAggregator::new(config.bucket_seconds),
        RuleEngine::new(config.long_queue_threshold),
    );
    let worker = CameraWorker::new(pipeline, Box::new(feed), health.clone(), DEFAULT_IDLE_FLUSH);
    tasks.spawn(worker.run(publisher.clone(), cancel.clone()));

    health
}
