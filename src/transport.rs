//! HTTP delivery to the event collector.
//!
//! Contract: `POST {base_url}/api/edge/events/` with the envelope as JSON
//! body and the edge credential in `X-EDGE-TOKEN`. Any 2xx is success,
//! 401/403 is an authentication failure, everything else is retryable.
//!
//! A single call here makes exactly one attempt; retry schedules belong to
//! the sender.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::Envelope;

pub const EVENTS_PATH: &str = "/api/edge/events/";
pub const EDGE_TOKEN_HEADER: &str = "X-EDGE-TOKEN";

/// Error text taken from response bodies is cut to this many characters.
const MAX_BODY_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("timeout")]
    Timeout,

    #[error("connection_error: {0}")]
    Connection(String),

    #[error("HTTP {status}: authentication rejected")]
    Auth { status: u16 },

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),
}

impl DeliveryError {
    /// HTTP status, when the collector answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Auth { status } | DeliveryError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, DeliveryError::Auth { .. })
    }

    /// Failures that never reached a response and may succeed on an
    /// immediate retry.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DeliveryError::Timeout | DeliveryError::Connection(_) | DeliveryError::Request(_)
        )
    }
}

/// Anything that can take an envelope to the backend.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// One delivery attempt; returns the HTTP status on success.
    async fn post_event(&self, envelope: &Envelope) -> Result<u16, DeliveryError>;
}

/// Client for the collector's event endpoint.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    events_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            events_url: format!("{}{}", base_url.trim_end_matches('/'), EVENTS_PATH),
            token: token.to_string(),
        })
    }

    pub fn events_url(&self) -> &str {
        &self.events_url
    }
}

#[async_trait]
impl EventSink for ApiClient {
    async fn post_event(&self, envelope: &Envelope) -> Result<u16, DeliveryError> {
        let response = self
            .client
            .post(&self.events_url)
            .header(EDGE_TOKEN_HEADER, &self.token)
            .json(envelope)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(DeliveryError::Auth {
                status: status.as_u16(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Status {
            status: status.as_u16(),
            body: short_error(&body),
        })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> DeliveryError {
    if e.is_timeout() {
        DeliveryError::Timeout
    } else if e.is_connect() {
        DeliveryError::Connection(short_error(&e.to_string()))
    } else {
        DeliveryError::Request(short_error(&e.to_string()))
    }
}

/// Flatten to one line and cut to a loggable length.
pub fn short_error(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
        .trim()
        .chars()
        .take(MAX_BODY_CHARS)
        .collect()
}
