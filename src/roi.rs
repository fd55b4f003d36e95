//! Per-camera Region-of-Interest configuration.
//!
//! A camera's ROI file is a YAML document with optional `zones`, `lines`,
//! `params` and `role` keys:
//!
//! ```yaml
//! role: balcao
//! zones:
//!   ponto_pagamento: [[100, 100], [300, 100], [300, 300], [100, 300]]
//!   area_atendimento_fila: [[300, 100], [600, 100], [600, 400], [300, 400]]
//! lines:
//!   linha_entrada: [[0, 240], [640, 240]]
//! params:
//!   checkout_dwell_seconds: 2.0
//!   exclude_pay_from_queue: true
//! ```
//!
//! The configuration is immutable once loaded. A missing or unreadable file
//! is never fatal: the camera runs with an empty ROI and role `unknown`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::geometry::Point;

/// Payment point zone; tested with the detection center.
pub const ZONE_PAYMENT: &str = "ponto_pagamento";
/// Queue / service area; tested with the detection foot point.
pub const ZONE_QUEUE: &str = "area_atendimento_fila";
/// Staff side of the cashier; tested with the detection center.
pub const ZONE_STAFF: &str = "zona_funcionario_caixa";
/// Seating / consumption area; tested with the detection foot point.
pub const ZONE_CONSUMPTION: &str = "area_consumo";

#[derive(Debug, Error)]
pub enum RoiError {
    #[error("failed to read ROI file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid ROI document {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Lower bound for `track_ttl_seconds`; anything smaller would evict tracks
/// on the frame that created them.
pub const MIN_TRACK_TTL_SECONDS: f64 = 1.0;

/// Functional interpretation of a camera's ROI set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Counter: payment, queue and staff zones.
    Balcao,
    /// Seating area: consumption zone.
    Salao,
    /// Entrance: line crossings.
    Entrada,
    Unknown,
}

/// Tunable parameters, read from the `params` section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiParams {
    pub checkout_dwell_seconds: f64,
    pub checkout_failsafe_seconds: f64,
    pub line_cooldown_seconds: f64,
    pub exclude_pay_from_queue: bool,
    /// Track state unseen for this long is evicted.
    pub track_ttl_seconds: f64,
}

impl Default for RoiParams {
    fn default() -> Self {
        Self {
            checkout_dwell_seconds: 2.0,
            checkout_failsafe_seconds: 4.0,
            line_cooldown_seconds: 4.0,
            exclude_pay_from_queue: true,
            track_ttl_seconds: 30.0,
        }
    }
}

/// A directed line segment used for crossing detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSegment {
    pub p1: Point,
    pub p2: Point,
}

/// Raw document shape. Lines stay untyped here so one malformed entry
/// doesn't reject the whole file.
#[derive(Debug, Default, Deserialize)]
struct RoiDocument {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    zones: Option<BTreeMap<String, serde_yaml::Value>>,
    #[serde(default)]
    lines: Option<BTreeMap<String, serde_yaml::Value>>,
    #[serde(default)]
    params: Option<RoiParams>,
}

/// Validated ROI configuration for one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct RoiConfig {
    zones: BTreeMap<String, Vec<Point>>,
    lines: BTreeMap<String, LineSegment>,
    params: RoiParams,
    role: Role,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            zones: BTreeMap::new(),
            lines: BTreeMap::new(),
            params: RoiParams::default(),
            role: Role::Unknown,
        }
    }
}

impl RoiConfig {
    /// Build a configuration directly. Lines are already well-formed here.
    pub fn new(
        zones: BTreeMap<String, Vec<Point>>,
        lines: BTreeMap<String, LineSegment>,
        mut params: RoiParams,
        explicit_role: Option<Role>,
    ) -> Self {
        if params.track_ttl_seconds.is_nan() || params.track_ttl_seconds < MIN_TRACK_TTL_SECONDS {
            warn!(
                track_ttl_seconds = params.track_ttl_seconds,
                min = MIN_TRACK_TTL_SECONDS,
                "Clamping ROI track_ttl_seconds"
            );
            params.track_ttl_seconds = MIN_TRACK_TTL_SECONDS;
        }

        let role = explicit_role
            .filter(|r| *r != Role::Unknown)
            .unwrap_or_else(|| infer_role(&zones, &lines));
        Self {
            zones,
            lines,
            params,
            role,
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        let doc: Option<RoiDocument> = serde_yaml::from_str(yaml)?;
        Ok(Self::from_document(doc.unwrap_or_default()))
    }

    pub fn load(path: &Path) -> Result<Self, RoiError> {
        let contents = std::fs::read_to_string(path).map_err(|source| RoiError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&contents).map_err(|source| RoiError::Yaml {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load the ROI file, degrading to an empty configuration on any error.
    pub fn load_or_empty(path: Option<&Path>, camera_id: &str) -> Self {
        let Some(path) = path else {
            debug!(camera_id, "No ROI file configured, running without ROI");
            return Self::default();
        };

        match Self::load(path) {
            Ok(config) => {
                debug!(
                    camera_id,
                    role = ?config.role,
                    zones = config.zones.len(),
                    lines = config.lines.len(),
                    "ROI loaded"
                );
                config
            }
            Err(e) => {
                warn!(camera_id, error = %e, "ROI unavailable, running without ROI");
                Self::default()
            }
        }
    }

    fn from_document(doc: RoiDocument) -> Self {
        let zones: BTreeMap<String, Vec<Point>> = doc
            .zones
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(name, raw)| match parse_points(&raw) {
                Some(points) => Some((name, points)),
                None => {
                    warn!(zone = %name, "Dropping malformed ROI zone (needs a list of [x, y] points)");
                    None
                }
            })
            .collect();

        let lines: BTreeMap<String, LineSegment> = doc
            .lines
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(name, raw)| match parse_points(&raw).as_deref() {
                Some(&[p1, p2]) => Some((name, LineSegment { p1, p2 })),
                _ => {
                    warn!(line = %name, "Dropping malformed ROI line (needs exactly two points)");
                    None
                }
            })
            .collect();

        let explicit_role = doc.role.as_deref().and_then(|r| match r {
            "balcao" => Some(Role::Balcao),
            "salao" => Some(Role::Salao),
            "entrada" => Some(Role::Entrada),
            _ => None,
        });

        Self::new(zones, lines, doc.params.unwrap_or_default(), explicit_role)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn params(&self) -> &RoiParams {
        &self.params
    }

    pub fn zone(&self, name: &str) -> Option<&[Point]> {
        self.zones.get(name).map(Vec::as_slice)
    }

    pub fn lines(&self) -> impl Iterator<Item = (&str, &LineSegment)> {
        self.lines.iter().map(|(name, line)| (name.as_str(), line))
    }

    pub fn has_lines(&self) -> bool {
        !self.lines.is_empty()
    }
}

fn infer_role(zones: &BTreeMap<String, Vec<Point>>, lines: &BTreeMap<String, LineSegment>) -> Role {
    if [ZONE_PAYMENT, ZONE_QUEUE, ZONE_STAFF]
        .iter()
        .any(|z| zones.contains_key(*z))
    {
        Role::Balcao
    } else if zones.contains_key(ZONE_CONSUMPTION) {
        Role::Salao
    } else if !lines.is_empty() {
        Role::Entrada
    } else {
        Role::Unknown
    }
}

/// Parse `[[x, y], ...]`. Returns `None` when the value is not a list of
/// numeric pairs.
fn parse_points(raw: &serde_yaml::Value) -> Option<Vec<Point>> {
    raw.as_sequence()?
        .iter()
        .map(|pt| {
            let coords = pt.as_sequence()?;
            if coords.len() < 2 {
                return None;
            }
            Some(Point::new(coords[0].as_f64()?, coords[1].as_f64()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_role_inferred_from_zones() {
        let config = RoiConfig::from_yaml_str(
            r#"
zones:
  ponto_pagamento: [[0, 0], [10, 0], [10, 10], [0, 10]]
"#,
        )
        .unwrap();
        assert_eq!(config.role(), Role::Balcao);

        let config = RoiConfig::from_yaml_str(
            r#"
zones:
  area_consumo: [[0, 0], [10, 0], [10, 10]]
"#,
        )
        .unwrap();
        assert_eq!(config.role(), Role::Salao);

        let config = RoiConfig::from_yaml_str(
            r#"
lines:
  porta: [[0, 5], [10, 5]]
"#,
        )
        .unwrap();
        assert_eq!(config.role(), Role::Entrada);
    }

    #[test]
    fn test_explicit_role_wins() {
        let config = RoiConfig::from_yaml_str(
            r#"
role: entrada
zones:
  ponto_pagamento: [[0, 0], [10, 0], [10, 10]]
"#,
        )
        .unwrap();
        assert_eq!(config.role(), Role::Entrada);
    }

    #[test]
    fn test_unrecognised_role_falls_back_to_inference() {
        let config = RoiConfig::from_yaml_str(
            r#"
role: cozinha
zones:
  area_consumo: [[0, 0], [10, 0], [10, 10]]
"#,
        )
        .unwrap();
        assert_eq!(config.role(), Role::Salao);
    }

    #[test]
    fn test_malformed_lines_dropped_at_load() {
        let config = RoiConfig::from_yaml_str(
            r#"
lines:
  good: [[0, 5], [10, 5]]
  three_points: [[0, 0], [1, 1], [2, 2]]
  one_point: [[0, 0]]
  not_a_list: "oops"
"#,
        )
        .unwrap();
        let names: Vec<&str> = config.lines().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["good"]);
        assert_eq!(config.role(), Role::Entrada);
    }

    #[test]
    fn test_malformed_zones_dropped_at_load() {
        let config = RoiConfig::from_yaml_str(
            r#"
zones:
  area_consumo: [[0, 0], [10, 0], [10, 10]]
  ponto_pagamento: "nope"
  area_atendimento_fila: [[0, 0], ["x", 1]]
"#,
        )
        .unwrap();
        assert!(config.zone(ZONE_CONSUMPTION).is_some());
        assert!(config.zone(ZONE_PAYMENT).is_none());
        assert!(config.zone(ZONE_QUEUE).is_none());
        assert_eq!(config.role(), Role::Salao);
    }

    #[test]
    fn test_track_ttl_clamped() {
        for raw in ["0", "-5", ".nan"] {
            let yaml = format!("params:\n  track_ttl_seconds: {raw}\n");
            let config = RoiConfig::from_yaml_str(&yaml).unwrap();
            assert_eq!(config.params().track_ttl_seconds, MIN_TRACK_TTL_SECONDS, "{raw}");
        }

        let config = RoiConfig::from_yaml_str("params:\n  track_ttl_seconds: 12.5\n").unwrap();
        assert_eq!(config.params().track_ttl_seconds, 12.5);
    }

    #[test]
    fn test_params_defaults_and_overrides() {
        let config = RoiConfig::from_yaml_str(
            r#"
params:
  checkout_dwell_seconds: 3.5
  exclude_pay_from_queue: false
"#,
        )
        .unwrap();
        let params = config.params();
        assert_eq!(params.checkout_dwell_seconds, 3.5);
        assert!(!params.exclude_pay_from_queue);
        assert_eq!(params.checkout_failsafe_seconds, 4.0);
        assert_eq!(params.line_cooldown_seconds, 4.0);
    }

    #[test]
    fn test_empty_document_is_unknown() {
        let config = RoiConfig::from_yaml_str("").unwrap();
        assert_eq!(config.role(), Role::Unknown);
        assert!(!config.has_lines());
    }

    #[test]
    fn test_missing_file_degrades_to_empty() {
        let config = RoiConfig::load_or_empty(Some(Path::new("/nonexistent/roi.yaml")), "cam-1");
        assert_eq!(config, RoiConfig::default());

        let config = RoiConfig::load_or_empty(None, "cam-1");
        assert_eq!(config.role(), Role::Unknown);
    }

    #[test]
    fn test_invalid_yaml_degrades_to_empty() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "zones: [this is: not valid").unwrap();

        assert!(matches!(RoiConfig::load(file.path()), Err(RoiError::Yaml { .. })));
        let config = RoiConfig::load_or_empty(Some(file.path()), "cam-2");
        assert_eq!(config.role(), Role::Unknown);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "zones:\n  area_atendimento_fila: [[0, 0], [10, 0], [10, 10], [0, 10]]"
        )
        .unwrap();

        let config = RoiConfig::load(file.path()).unwrap();
        assert_eq!(config.role(), Role::Balcao);
        assert_eq!(config.zone(ZONE_QUEUE).map(|z| z.len()), Some(4));
    }
}
