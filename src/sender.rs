//! Event delivery: the pending channel, its producers, and the sender loop.
//!
//! Producers (camera pipelines, the heartbeat loop) publish envelopes into a
//! bounded channel through an [`EventPublisher`]. When the channel is full the
//! envelope goes straight to the durable outbox, so memory stays bounded and
//! nothing is dropped.
//!
//! The [`Sender`] is the only consumer. Each received envelope gets one
//! best-effort delivery with up to three quick retries on transport errors;
//! on failure it falls back to the outbox. Independently, the outbox is
//! flushed on a fixed interval using the exponential schedule from
//! [`crate::backoff`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{IMMEDIATE_RETRY_DELAYS, outbox_backoff_seconds};
use crate::envelope::Envelope;
use crate::state::RuntimeStatus;
use crate::storage::Outbox;
use crate::transport::{DeliveryError, EventSink};

/// Consecutive authentication failures after which the sender gives up.
pub const MAX_CONSECUTIVE_AUTH_FAILURES: u32 = 10;

/// Identical failure messages are logged at most this often.
const LOG_THROTTLE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("collector rejected the edge token {consecutive} times in a row (last HTTP {status})")]
    AuthRejected { status: u16, consecutive: u32 },
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// How long one receive waits before the loop checks the outbox.
    pub recv_timeout: Duration,
    pub flush_interval: Duration,
    pub batch_size: u32,
    pub retry_delays: Vec<Duration>,
    pub max_auth_failures: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(1),
            flush_interval: Duration::from_secs(2),
            batch_size: 50,
            retry_delays: IMMEDIATE_RETRY_DELAYS.to_vec(),
            max_auth_failures: MAX_CONSECUTIVE_AUTH_FAILURES,
        }
    }
}

/// Create the bounded pending channel.
pub fn pending_channel(capacity: usize, outbox: Outbox) -> (EventPublisher, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventPublisher { tx, outbox }, rx)
}

/// Producer handle for the pending channel.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<Envelope>,
    outbox: Outbox,
}

impl EventPublisher {
    pub async fn publish(&self, envelope: Envelope) {
        let envelope = match self.tx.try_send(envelope) {
            Ok(()) => return,
            Err(TrySendError::Full(env)) => {
                debug!(event_name = %env.event_name, "Pending queue full, spilling to outbox");
                env
            }
            Err(TrySendError::Closed(env)) => {
                debug!(event_name = %env.event_name, "Sender gone, spilling to outbox");
                env
            }
        };

        if let Err(e) = self.outbox.enqueue(&envelope).await {
            error!(
                event_name = %envelope.event_name,
                error = %e,
                "Failed to persist event"
            );
        }
    }
}

/// Suppresses repeats of the same message within [`LOG_THROTTLE`].
#[derive(Debug, Default)]
struct LogThrottle {
    last_at: Option<Instant>,
    last_msg: Option<String>,
}

impl LogThrottle {
    fn should_log(&mut self, msg: &str) -> bool {
        let fresh = self.last_msg.as_deref() != Some(msg)
            || self.last_at.is_none_or(|t| t.elapsed() >= LOG_THROTTLE);
        if fresh {
            self.last_at = Some(Instant::now());
            self.last_msg = Some(msg.to_string());
        }
        fresh
    }
}

pub struct Sender<S: EventSink> {
    sink: S,
    outbox: Outbox,
    status: Arc<RuntimeStatus>,
    config: SenderConfig,
    throttle: LogThrottle,
}

impl<S: EventSink> Sender<S> {
    pub fn new(sink: S, outbox: Outbox, status: Arc<RuntimeStatus>, config: SenderConfig) -> Self {
        Self {
            sink,
            outbox,
            status,
            config,
            throttle: LogThrottle::default(),
        }
    }

    /// Run until cancelled, the channel closes, or authentication is
    /// rejected too many times. Envelopes still queued in memory at exit are
    /// persisted to the outbox.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<Envelope>,
        cancel: CancellationToken,
    ) -> Result<(), SenderError> {
        info!("Sender started");
        let mut last_flush: Option<Instant> = None;

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            let received = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                r = tokio::time::timeout(self.config.recv_timeout, rx.recv()) => r,
            };

            match received {
                Ok(Some(envelope)) => {
                    if let Err(e) = self.deliver_now(envelope, &cancel).await {
                        break Err(e);
                    }
                }
                Ok(None) => {
                    debug!("Pending channel closed");
                    break self.flush_outbox().await;
                }
                Err(_elapsed) => {}
            }

            if last_flush.is_none_or(|t| t.elapsed() >= self.config.flush_interval) {
                if let Err(e) = self.flush_outbox().await {
                    break Err(e);
                }
                last_flush = Some(Instant::now());
            }
        };

        rx.close();
        let mut persisted = 0usize;
        while let Ok(envelope) = rx.try_recv() {
            match self.outbox.enqueue(&envelope).await {
                Ok(_) => persisted += 1,
                Err(e) => error!(error = %e, "Failed to persist queued event at shutdown"),
            }
        }
        info!(persisted, "Sender stopped");

        result
    }

    /// Best-effort delivery of a fresh envelope, falling back to the outbox.
    pub async fn deliver_now(
        &mut self,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), SenderError> {
        match self.send_with_retry(&envelope, cancel).await {
            Ok(status) => {
                self.status.record_success(status);
                debug!(event_name = %envelope.event_name, status, "Event delivered");
                Ok(())
            }
            Err(err) => {
                let auth_failures =
                    self.status
                        .record_failure(err.status(), &err.to_string(), err.is_auth());
                let msg = format!("send failed status={:?} err={}", err.status(), err);
                if self.throttle.should_log(&msg) {
                    warn!(event_name = %envelope.event_name, error = %err, "Send failed, queued in outbox");
                }

                if let Err(e) = self.outbox.enqueue(&envelope).await {
                    error!(error = %e, "Failed to persist undelivered event");
                }
                self.check_auth(&err, auth_failures)
            }
        }
    }

    /// Deliver due outbox records, oldest first. Stops at the first failure.
    pub async fn flush_outbox(&mut self) -> Result<(), SenderError> {
        let batch = match self.outbox.peek_ready(self.config.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "Failed to read outbox");
                return Ok(());
            }
        };

        for record in batch {
            let envelope = match record.envelope() {
                Ok(env) => env,
                Err(e) => {
                    warn!(id = record.id, error = %e, "Dropping undecodable outbox record");
                    if let Err(e) = self.outbox.mark_sent(record.id).await {
                        warn!(id = record.id, error = %e, "Failed to drop outbox record");
                    }
                    continue;
                }
            };

            match self.sink.post_event(&envelope).await {
                Ok(status) => {
                    self.status.record_success(status);
                    if let Err(e) = self.outbox.mark_sent(record.id).await {
                        warn!(id = record.id, error = %e, "Failed to acknowledge outbox record");
                    }
                }
                Err(err) => {
                    let attempts = record.attempts.saturating_add(1);
                    let backoff = outbox_backoff_seconds(attempts);
                    let auth_failures =
                        self.status
                            .record_failure(err.status(), &err.to_string(), err.is_auth());

                    if let Err(e) = self
                        .outbox
                        .mark_failed(record.id, &err.to_string(), attempts, backoff)
                        .await
                    {
                        warn!(id = record.id, error = %e, "Failed to reschedule outbox record");
                    }

                    let msg = format!("flush failed status={:?} err={}", err.status(), err);
                    if self.throttle.should_log(&msg) {
                        warn!(id = record.id, attempts, backoff, error = %err, "Outbox flush failed");
                    }

                    self.check_auth(&err, auth_failures)?;
                    break;
                }
            }
        }

        Ok(())
    }

    async fn send_with_retry(
        &self,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<u16, DeliveryError> {
        let mut delays = self.config.retry_delays.iter();
        loop {
            match self.sink.post_event(envelope).await {
                Ok(status) => return Ok(status),
                Err(e) if e.is_transport() => {
                    let Some(delay) = delays.next() else {
                        return Err(e);
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(*delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn check_auth(&self, err: &DeliveryError, consecutive: u32) -> Result<(), SenderError> {
        match err {
            DeliveryError::Auth { status } if consecutive >= self.config.max_auth_failures => {
                error!(status, consecutive, "Authentication rejected repeatedly, giving up");
                Err(SenderError::AuthRejected {
                    status: *status,
                    consecutive,
                })
            }
            DeliveryError::Auth { status } => {
                warn!(status, consecutive, "Edge token rejected by collector");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
