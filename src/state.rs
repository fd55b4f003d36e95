//! Process-wide runtime status.
//!
//! One [`RuntimeStatus`] is created at startup and handed (as `Arc`) to the
//! sender, the heartbeat loop and the status API. It is only changed through
//! the methods below and read through [`RuntimeStatus::snapshot`].

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time copy of the runtime status.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub agent_running: bool,
    pub heartbeat_only: bool,
    pub last_send_at: Option<DateTime<Utc>>,
    pub last_send_ok: Option<bool>,
    pub last_send_http_status: Option<u16>,
    pub last_send_error: Option<String>,
    pub last_backend_seen_ok_at: Option<DateTime<Utc>>,
    pub sent_ok: u64,
    pub sent_fail: u64,
    pub consecutive_auth_failures: u32,
}

#[derive(Debug, Default)]
pub struct RuntimeStatus {
    inner: Mutex<StatusSnapshot>,
}

impl RuntimeStatus {
    /// Fresh status, everything zeroed.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self, running: bool, heartbeat_only: bool) {
        let mut s = self.lock();
        s.agent_running = running;
        s.heartbeat_only = heartbeat_only;
    }

    pub fn set_stopped(&self) {
        self.lock().agent_running = false;
    }

    pub fn record_success(&self, status: u16) {
        let now = Utc::now();
        let mut s = self.lock();
        s.last_send_at = Some(now);
        s.last_send_ok = Some(true);
        s.last_send_http_status = Some(status);
        s.last_send_error = None;
        s.last_backend_seen_ok_at = Some(now);
        s.sent_ok += 1;
        s.consecutive_auth_failures = 0;
    }

    /// Record a failed delivery. Returns the consecutive auth failure count
    /// after this failure.
    pub fn record_failure(&self, status: Option<u16>, error: &str, auth: bool) -> u32 {
        let mut s = self.lock();
        s.last_send_at = Some(Utc::now());
        s.last_send_ok = Some(false);
        s.last_send_http_status = status;
        s.last_send_error = Some(error.to_string());
        s.sent_fail += 1;
        if auth {
            s.consecutive_auth_failures += 1;
        }
        s.consecutive_auth_failures
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatusSnapshot> {
        // A poisoned lock still holds consistent counters
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
