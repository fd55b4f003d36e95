//! Per-camera ROI classifier.
//!
//! Turns one frame's detections into a [`MetricsSnapshot`]. Which tests run
//! depends on the camera's [`Role`]:
//!
//! - `balcao`: payment and staff zones use the box center, the queue zone
//!   uses the foot point; the checkout state machine runs once per frame.
//! - `salao`: consumption zone by foot point.
//! - `entrada`: line crossings of tracked detections.
//! - `unknown`: only `people_count`.
//!
//! The classifier owns all mutable per-camera state and must see frames in
//! non-decreasing timestamp order.

use tracing::debug;

use crate::checkout::{CheckoutCycle, CheckoutTiming};
use crate::crossing::LineCrossingTracker;
use crate::geometry::point_in_polygon;
use crate::model::{Detection, MetricsSnapshot};
use crate::roi::{RoiConfig, Role, ZONE_CONSUMPTION, ZONE_PAYMENT, ZONE_QUEUE, ZONE_STAFF};

/// Mutable state of one camera. Never shared across cameras.
#[derive(Debug, Default)]
pub struct CameraRoiState {
    pub checkout: CheckoutCycle,
    pub crossings: LineCrossingTracker,
    pub debug_clients_at_pay: u32,
    pub debug_staff_at_cashier: u32,
}

pub struct RoiClassifier {
    camera_id: String,
    roi: RoiConfig,
    state: CameraRoiState,
}

impl RoiClassifier {
    pub fn new(camera_id: impl Into<String>, roi: RoiConfig) -> Self {
        Self {
            camera_id: camera_id.into(),
            roi,
            state: CameraRoiState::default(),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn role(&self) -> Role {
        self.roi.role()
    }

    pub fn state(&self) -> &CameraRoiState {
        &self.state
    }

    /// Classify one frame.
    pub fn classify(&mut self, detections: &[Detection], ts: f64) -> MetricsSnapshot {
        let mut snap = MetricsSnapshot::default();
        let params = *self.roi.params();
        let role = self.roi.role();

        let mut clients_at_pay = 0u32;
        let mut staff_at_cashier = 0u32;

        for det in detections {
            let Some(bbox) = det.bounding_box() else {
                continue;
            };
            snap.people_count += 1;

            match role {
                Role::Balcao => {
                    let center = bbox.center();
                    let foot = bbox.foot();

                    let in_pay = self
                        .roi
                        .zone(ZONE_PAYMENT)
                        .is_some_and(|z| point_in_polygon(center, z));
                    if in_pay {
                        clients_at_pay += 1;
                        snap.pay_count += 1;
                    }

                    if self
                        .roi
                        .zone(ZONE_STAFF)
                        .is_some_and(|z| point_in_polygon(center, z))
                    {
                        staff_at_cashier += 1;
                        snap.staff_count += 1;
                    }

                    let in_queue = self
                        .roi
                        .zone(ZONE_QUEUE)
                        .is_some_and(|z| point_in_polygon(foot, z));
                    // Payment takes priority over queue
                    if in_queue && !(params.exclude_pay_from_queue && in_pay) {
                        snap.queue_count += 1;
                    }
                }
                Role::Salao => {
                    if self
                        .roi
                        .zone(ZONE_CONSUMPTION)
                        .is_some_and(|z| point_in_polygon(bbox.foot(), z))
                    {
                        snap.consumo_count += 1;
                    }
                }
                Role::Entrada => {
                    let Some(track_id) = det.track_id else {
                        continue;
                    };
                    if !self.roi.has_lines() {
                        continue;
                    }
                    let counts = self.state.crossings.observe(
                        track_id,
                        bbox.foot(),
                        ts,
                        self.roi.lines(),
                        params.line_cooldown_seconds,
                    );
                    snap.entries += counts.entries;
                    snap.exits += counts.exits;
                }
                Role::Unknown => {}
            }
        }

        match role {
            Role::Balcao => {
                self.state.debug_clients_at_pay = clients_at_pay;
                self.state.debug_staff_at_cashier = staff_at_cashier;

                let interaction_now = clients_at_pay >= 1 && staff_at_cashier >= 1;
                let timing = CheckoutTiming {
                    dwell_seconds: params.checkout_dwell_seconds,
                    failsafe_seconds: params.checkout_failsafe_seconds,
                };
                if self.state.checkout.step(ts, interaction_now, timing) {
                    snap.checkout_events = 1;
                    debug!(camera_id = %self.camera_id, ts, "Checkout cycle confirmed");
                }
            }
            Role::Entrada => {
                let evicted = self
                    .state
                    .crossings
                    .evict_stale(ts, params.track_ttl_seconds);
                if evicted > 0 {
                    debug!(camera_id = %self.camera_id, evicted, "Evicted stale tracks");
                }
            }
            Role::Salao | Role::Unknown => {}
        }

        snap.debug_clients_at_pay = self.state.debug_clients_at_pay;
        snap.debug_staff_at_cashier = self.state.debug_staff_at_cashier;
        snap
    }
}
