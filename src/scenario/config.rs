use serde::Deserialize;
use serde_json::Value;

use crate::cascade::ParamReader;
use crate::error::ConfigError;

use super::geometry::Point;
use super::history::DEFAULT_HISTORY_CAPACITY;
use super::tracker::TrackerConfig;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.3;
const DEFAULT_MAX_OCCUPANCY: usize = 5;

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LineSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct BoxSpec {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ZoneSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "box")]
    pub bounds: Option<BoxSpec>,
    #[serde(default)]
    pub polygon: Option<Vec<Point>>,
}

/// Control-plane shape: a point list under `label` plus an optional ordering key.
#[derive(Clone, Debug, Deserialize)]
struct LabeledShape {
    #[serde(default)]
    id: Option<String>,
    label: Vec<Point>,
    #[serde(default)]
    order: Option<Value>,
}

impl LabeledShape {
    fn key(&self, prefix: &str, index: usize) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        match &self.order {
            Some(Value::String(s)) if !s.is_empty() => format!("{}-{}", prefix, s),
            Some(Value::Number(n)) => format!("{}-{}", prefix, n),
            _ => format!("{}-{}", prefix, index),
        }
    }
}

fn enabled() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineInfo {
    #[serde(default = "enabled")]
    use_counting_line: bool,
    #[serde(default)]
    counting_lines: Vec<LabeledShape>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZoneInfo {
    #[serde(default = "enabled")]
    use_danger_zone: bool,
    #[serde(default)]
    danger_zones: Vec<LabeledShape>,
}

/// Everything a scenario transform reads from its node configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct ScenarioSettings {
    pub lines: Vec<LineSpec>,
    pub zones: Vec<ZoneSpec>,
    pub confidence_threshold: f64,
    pub labels: Vec<String>,
    pub history_capacity: usize,
    pub tracker: TrackerConfig,
    pub min_occupancy: usize,
    pub max_occupancy: usize,
    pub defect_labels: Vec<String>,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            zones: Vec::new(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            labels: Vec::new(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            tracker: TrackerConfig::default(),
            min_occupancy: 1,
            max_occupancy: DEFAULT_MAX_OCCUPANCY,
            defect_labels: Vec::new(),
        }
    }
}

/// Thresholds above 1 are percentages.
pub fn normalize_threshold(value: f64) -> f64 {
    if value > 1.0 {
        value / 100.0
    } else {
        value
    }
}

impl ScenarioSettings {
    pub fn from_params(params: &ParamReader<'_>) -> Result<Self, ConfigError> {
        let defaults = ScenarioSettings::default();

        let mut lines: Vec<LineSpec> = params.object("lines")?.unwrap_or_default();
        if let Some(info) = params.object::<LineInfo>("line_info")? {
            if info.use_counting_line {
                for (index, shape) in info.counting_lines.iter().enumerate() {
                    if let [a, b, ..] = shape.label.as_slice() {
                        lines.push(LineSpec {
                            id: Some(shape.key("line", index)),
                            x1: a.x,
                            y1: a.y,
                            x2: b.x,
                            y2: b.y,
                        });
                    }
                }
            }
        }

        let mut zones: Vec<ZoneSpec> = params.object("zones")?.unwrap_or_default();
        if let Some(info) = params.object::<ZoneInfo>("zone_info")? {
            if info.use_danger_zone {
                for (index, shape) in info.danger_zones.iter().enumerate() {
                    let id = Some(shape.key("zone", index));
                    let spec = match shape.label.as_slice() {
                        [a, b] => ZoneSpec {
                            id,
                            bounds: Some(BoxSpec {
                                x1: a.x,
                                y1: a.y,
                                x2: b.x,
                                y2: b.y,
                            }),
                            polygon: None,
                        },
                        points => ZoneSpec {
                            id,
                            bounds: None,
                            polygon: Some(points.to_vec()),
                        },
                    };
                    zones.push(spec);
                }
            }
        }

        let confidence_threshold = normalize_threshold(
            params.f64_or("confidence_threshold", defaults.confidence_threshold)?,
        );
        let tracker = TrackerConfig {
            max_distance: params.f64_or("max_distance", defaults.tracker.max_distance)?,
            max_missed: params.u32_or("max_missed", defaults.tracker.max_missed)?,
        };

        Ok(Self {
            lines,
            zones,
            confidence_threshold,
            labels: params.string_list("labels")?,
            history_capacity: params
                .u64_or("history_capacity", defaults.history_capacity as u64)?
                as usize,
            tracker,
            min_occupancy: params.u64_or("min_occupancy", defaults.min_occupancy as u64)? as usize,
            max_occupancy: params.u64_or("max_occupancy", defaults.max_occupancy as u64)? as usize,
            defect_labels: params.string_list("defect_labels")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::{NodeConfig, NodeType};
    use serde_json::json;

    #[test]
    fn native_lines_and_zones() {
        let node = NodeConfig::new("s", NodeType::Transform, "counting_line")
            .with("lines", json!([{"id": "door", "x1": 0.5, "y1": 0.0, "x2": 0.5, "y2": 1.0}]))
            .with(
                "zones",
                json!([
                    {"id": "a", "box": {"x1": 0.0, "y1": 0.0, "x2": 0.2, "y2": 0.2}},
                    {"id": "b", "polygon": [{"x": 0.0, "y": 0.0}, {"x": 1.0, "y": 0.0}, {"x": 0.0, "y": 1.0}]}
                ]),
            )
            .with("confidence_threshold", "45");
        let settings = ScenarioSettings::from_params(&node.params()).expect("settings");
        assert_eq!(settings.lines[0].id.as_deref(), Some("door"));
        assert!(settings.zones[0].bounds.is_some());
        assert_eq!(settings.zones[1].polygon.as_ref().map(Vec::len), Some(3));
        assert!((settings.confidence_threshold - 0.45).abs() < 1e-9);
    }

    #[test]
    fn control_plane_shapes_are_accepted() {
        let line_info = r#"{"useCountingLine": true,
            "countingLines": [{"label": [{"x": 0.1, "y": 0.2}, {"x": 0.9, "y": 0.2}], "order": 3}]}"#;
        let zone_info = json!({"useDangerZone": true, "dangerZones": [
            {"label": [{"x": 0.1, "y": 0.1}, {"x": 0.3, "y": 0.4}]}
        ]});
        let node = NodeConfig::new("s", NodeType::Transform, "danger_zone")
            .with("line_info", line_info)
            .with("zone_info", zone_info);
        let settings = ScenarioSettings::from_params(&node.params()).expect("settings");
        assert_eq!(settings.lines.len(), 1);
        assert_eq!(settings.lines[0].id.as_deref(), Some("line-3"));
        assert_eq!(settings.zones[0].id.as_deref(), Some("zone-0"));
        assert_eq!(
            settings.zones[0].bounds,
            Some(BoxSpec {
                x1: 0.1,
                y1: 0.1,
                x2: 0.3,
                y2: 0.4
            })
        );
    }

    #[test]
    fn disabled_control_plane_lines_are_ignored() {
        let node = NodeConfig::new("s", NodeType::Transform, "counting_line").with(
            "line_info",
            json!({"useCountingLine": false, "countingLines": [
                {"label": [{"x": 0.1, "y": 0.2}, {"x": 0.9, "y": 0.2}]}
            ]}),
        );
        let settings = ScenarioSettings::from_params(&node.params()).expect("settings");
        assert!(settings.lines.is_empty());
    }

    #[test]
    fn malformed_lines_are_config_errors() {
        let node = NodeConfig::new("s", NodeType::Transform, "counting_line")
            .with("lines", "[{\"x1\": 1}]");
        assert!(matches!(
            ScenarioSettings::from_params(&node.params()),
            Err(ConfigError::InvalidParameter { .. })
        ));
    }
}
