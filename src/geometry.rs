//! Planar geometry used by the ROI classifier.
//!
//! Coordinates are frame pixels with the origin at the top-left corner, so
//! `y` grows downwards. Nothing here allocates.

use serde::{Deserialize, Serialize};

/// Tolerance used when deciding whether a point lies on a polygon edge.
const EDGE_EPSILON: f64 = 1e-9;

/// A point in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Test whether `point` lies inside `polygon`.
///
/// Points on an edge or vertex count as inside. A polygon with fewer than
/// three vertices contains nothing.
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = polygon.len() - 1;

    for i in 0..polygon.len() {
        let a = polygon[i];
        let b = polygon[j];

        if on_segment(point, a, b) {
            return true;
        }

        // Even-odd rule: count edges crossed by a ray cast towards +x.
        if (a.y > point.y) != (b.y > point.y) {
            let x_cross = (b.x - a.x) * (point.y - a.y) / (b.y - a.y) + a.x;
            if point.x < x_cross {
                inside = !inside;
            }
        }

        j = i;
    }

    inside
}

/// Signed side of `point` relative to the directed line `p1 -> p2`.
///
/// Returns the z component of `(p2 - p1) x (point - p1)`. Only the sign is
/// meaningful to callers; zero means the point is on the line.
pub fn line_side(p1: Point, p2: Point, point: Point) -> f64 {
    (p2.x - p1.x) * (point.y - p1.y) - (p2.y - p1.y) * (point.x - p1.x)
}

fn on_segment(p: Point, a: Point, b: Point) -> bool {
    if line_side(a, b, p).abs() > EDGE_EPSILON {
        return false;
    }
    p.x >= a.x.min(b.x) - EDGE_EPSILON
        && p.x <= a.x.max(b.x) + EDGE_EPSILON
        && p.y >= a.y.min(b.y) - EDGE_EPSILON
        && p.y <= a.y.max(b.y) + EDGE_EPSILON
}
