//! Directional line crossing for entrance (entrada) cameras.
//!
//! For each tracked person and each configured line, the tracker remembers
//! which side of the line the person's foot point was on last frame. A strict
//! flip from negative to positive is an entry, positive to negative an exit.
//! A crossing only counts if the same track has not produced the same kind
//! of event on the same line within the cooldown.

use std::collections::HashMap;

use crate::geometry::{Point, line_side};
use crate::roi::LineSegment;

/// How often stale tracks are swept, in seconds of frame time.
const SWEEP_INTERVAL_SECONDS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrossingKind {
    Entry,
    Exit,
}

#[derive(Debug, Default)]
struct TrackState {
    sides: HashMap<String, f64>,
    last_fired: HashMap<(CrossingKind, String), f64>,
    last_seen: f64,
}

/// Per-frame increments produced by the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrossingCounts {
    pub entries: u32,
    pub exits: u32,
}

#[derive(Debug, Default)]
pub struct LineCrossingTracker {
    tracks: HashMap<i64, TrackState>,
    last_sweep: Option<f64>,
}

impl LineCrossingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one track's position against every line.
    pub fn observe<'a>(
        &mut self,
        track_id: i64,
        position: Point,
        ts: f64,
        lines: impl IntoIterator<Item = (&'a str, &'a LineSegment)>,
        cooldown_seconds: f64,
    ) -> CrossingCounts {
        let mut counts = CrossingCounts::default();
        let track = self.tracks.entry(track_id).or_default();
        track.last_seen = ts;

        for (name, line) in lines {
            let side = line_side(line.p1, line.p2, position);
            let previous = track.sides.insert(name.to_string(), side);

            let kind = match previous {
                Some(prev) if prev < 0.0 && side > 0.0 => CrossingKind::Entry,
                Some(prev) if prev > 0.0 && side < 0.0 => CrossingKind::Exit,
                _ => continue,
            };

            let key = (kind, name.to_string());
            let cooled = track
                .last_fired
                .get(&key)
                .is_none_or(|last| ts - last >= cooldown_seconds);

            if cooled {
                track.last_fired.insert(key, ts);
                match kind {
                    CrossingKind::Entry => counts.entries += 1,
                    CrossingKind::Exit => counts.exits += 1,
                }
            }
        }

        counts
    }

    /// Drop tracks not seen for `ttl_seconds`. Runs at most once per sweep
    /// interval; returns how many tracks were evicted.
    pub fn evict_stale(&mut self, now: f64, ttl_seconds: f64) -> usize {
        if let Some(last) = self.last_sweep {
            if now - last < SWEEP_INTERVAL_SECONDS {
                return 0;
            }
        }
        self.last_sweep = Some(now);

        let before = self.tracks.len();
        self.tracks.retain(|_, t| now - t.last_seen < ttl_seconds);
        before - self.tracks.len()
    }

    pub fn tracked(&self) -> usize {
        self.tracks.len()
    }
}
