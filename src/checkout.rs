//! Checkout cycle detection for counter (balcao) cameras.
//!
//! A checkout is confirmed when at least one client stands at the payment
//! point while at least one staff member stands at the cashier, continuously,
//! for `dwell` seconds. One sustained interaction counts once; the pair must
//! separate before another cycle can start.

/// Phase of the checkout state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CheckoutPhase {
    Idle,
    /// Interaction observed since `since`, not yet long enough to count.
    Accumulating { since: f64 },
    /// A cycle was counted and the interaction is still going on.
    InCycle,
}

#[derive(Debug, Clone, Copy)]
pub struct CheckoutTiming {
    pub dwell_seconds: f64,
    /// Quiet period after a confirmed cycle during which nothing accumulates.
    pub failsafe_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct CheckoutCycle {
    phase: CheckoutPhase,
    last_checkout_ts: Option<f64>,
}

impl Default for CheckoutCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckoutCycle {
    pub fn new() -> Self {
        Self {
            phase: CheckoutPhase::Idle,
            last_checkout_ts: None,
        }
    }

    pub fn phase(&self) -> CheckoutPhase {
        self.phase
    }

    pub fn last_checkout_ts(&self) -> Option<f64> {
        self.last_checkout_ts
    }

    /// Advance the machine by one frame. Returns `true` when a cycle is
    /// confirmed on this frame.
    pub fn step(&mut self, ts: f64, interaction_now: bool, timing: CheckoutTiming) -> bool {
        if self.in_failsafe(ts, timing.failsafe_seconds) {
            // Only the accumulation is dropped; an open cycle stays open.
            if let CheckoutPhase::Accumulating { .. } = self.phase {
                self.phase = CheckoutPhase::Idle;
            }
            return false;
        }

        match self.phase {
            CheckoutPhase::Idle => {
                if interaction_now {
                    self.phase = CheckoutPhase::Accumulating { since: ts };
                }
                false
            }
            CheckoutPhase::Accumulating { since } => {
                if !interaction_now {
                    self.phase = CheckoutPhase::Idle;
                    return false;
                }
                if ts - since >= timing.dwell_seconds {
                    self.phase = CheckoutPhase::InCycle;
                    self.last_checkout_ts = Some(ts);
                    return true;
                }
                false
            }
            CheckoutPhase::InCycle => {
                if !interaction_now {
                    self.phase = CheckoutPhase::Idle;
                }
                false
            }
        }
    }

    fn in_failsafe(&self, ts: f64, failsafe_seconds: f64) -> bool {
        match self.last_checkout_ts {
            Some(last) => failsafe_seconds > 0.0 && ts - last < failsafe_seconds,
            None => false,
        }
    }
}
