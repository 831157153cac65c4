//! Declarative cascade configuration.
//!
//! A cascade is `{nodes, edges}` plus optional identity metadata. Nodes carry a
//! free-form `configurations` map; values may arrive as native JSON types or as
//! their string rendering, and nested objects may arrive JSON-encoded inside a
//! string. `ParamReader` hides those differences and reports failures as
//! `ConfigError::InvalidParameter` naming the node and key.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Source,
    Transform,
    Model,
    Export,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Source => "source",
            NodeType::Transform => "transform",
            NodeType::Model => "model",
            NodeType::Export => "export",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub name: String,
    #[serde(default, alias = "parameters")]
    pub configurations: Params,
}

impl NodeConfig {
    pub fn new(id: &str, node_type: NodeType, name: &str) -> Self {
        Self {
            id: id.to_string(),
            node_type,
            name: name.to_string(),
            configurations: Params::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.configurations.insert(key, value);
        self
    }

    pub fn params(&self) -> ParamReader<'_> {
        ParamReader {
            node: &self.id,
            params: &self.configurations,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub source: String,
    pub target: String,
}

impl EdgeConfig {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
        }
    }
}

/// Who a pipeline runs on behalf of. Stamped onto frames and used for snippet paths.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub instance_id: String,
    pub skill_id: String,
    pub device_id: String,
    pub instance_name: String,
    pub skill_name: String,
    pub device_name: String,
}

impl Identity {
    /// Fill empty fields from `fallback`. Display names fall back to ids.
    pub fn merged_with(&self, fallback: &Identity) -> Identity {
        fn pick(own: &str, other: &str) -> String {
            if own.is_empty() {
                other.to_string()
            } else {
                own.to_string()
            }
        }
        let instance_id = pick(&self.instance_id, &fallback.instance_id);
        let skill_id = pick(&self.skill_id, &fallback.skill_id);
        let device_id = pick(&self.device_id, &fallback.device_id);
        Identity {
            instance_name: pick(&pick(&self.instance_name, &fallback.instance_name), &instance_id),
            skill_name: pick(&pick(&self.skill_name, &fallback.skill_name), &skill_id),
            device_name: pick(&pick(&self.device_name, &fallback.device_name), &device_id),
            instance_id,
            skill_id,
            device_id,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CascadeConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub identity: Identity,
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
}

impl CascadeConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| ConfigError::Malformed(e.to_string()).into())
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ConfigError::Malformed(e.to_string()).into())
    }

    /// Load from disk; `.toml` files are parsed as TOML, anything else as JSON.
    /// An unnamed cascade takes the file stem as its name.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read cascade file {}", path.display()))?;
        let mut cfg = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&raw),
            _ => Self::from_json(&raw),
        }
        .with_context(|| format!("invalid cascade file {}", path.display()))?;
        if cfg.name.is_empty() {
            cfg.name = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .ok_or_else(|| anyhow!("cascade file {} has no usable name", path.display()))?
                .to_string();
        }
        Ok(cfg)
    }

    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|node| node.id == id)
    }
}

/// Typed view over one node's `configurations`.
#[derive(Clone, Copy)]
pub struct ParamReader<'a> {
    node: &'a str,
    params: &'a Params,
}

impl<'a> ParamReader<'a> {
    pub fn node_id(&self) -> &'a str {
        self.node
    }

    fn invalid(&self, key: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidParameter {
            node: self.node.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.contains(key)
    }

    /// String value; numbers and booleans are rendered.
    pub fn string(&self, key: &str) -> Option<String> {
        match self.params.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn f64_opt(&self, key: &str) -> Result<Option<f64>, ConfigError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.invalid(key, "not a finite number")),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| self.invalid(key, format!("'{}' is not a number", s))),
            Some(other) => Err(self.invalid(key, format!("expected a number, got {}", other))),
        }
    }

    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        Ok(self.f64_opt(key)?.unwrap_or(default))
    }

    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.f64_opt(key)? {
            None => Ok(default),
            Some(v) if v >= 0.0 && v.fract() == 0.0 => Ok(v as u64),
            Some(v) => Err(self.invalid(key, format!("{} is not a non-negative integer", v))),
        }
    }

    pub fn u32_or(&self, key: &str, default: u32) -> Result<u32, ConfigError> {
        let v = self.u64_or(key, default as u64)?;
        u32::try_from(v).map_err(|_| self.invalid(key, "value out of range"))
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "" => Ok(default),
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                other => Err(self.invalid(key, format!("'{}' is not a boolean", other))),
            },
            Some(Value::Number(n)) => Ok(n.as_f64().map(|v| v != 0.0).unwrap_or(default)),
            Some(other) => Err(self.invalid(key, format!("expected a boolean, got {}", other))),
        }
    }

    /// Array of strings, a JSON-encoded array, or a comma-separated string.
    pub fn string_list(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    other => Err(self.invalid(key, format!("unexpected list item {}", other))),
                })
                .collect(),
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                if trimmed.starts_with('[') {
                    serde_json::from_str(trimmed).map_err(|e| self.invalid(key, e.to_string()))
                } else {
                    Ok(trimmed
                        .split(',')
                        .map(str::trim)
                        .filter(|entry| !entry.is_empty())
                        .map(str::to_string)
                        .collect())
                }
            }
            Some(other) => Err(self.invalid(key, format!("expected a list, got {}", other))),
        }
    }

    /// Structured value; a string is parsed as embedded JSON.
    pub fn object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        let value = match self.params.get(key) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
            Some(Value::String(s)) => {
                serde_json::from_str::<Value>(s).map_err(|e| self.invalid(key, e.to_string()))?
            }
            Some(value) => value.clone(),
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| self.invalid(key, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CASCADE: &str = r#"{
        "nodes": [
            {"id": "cam", "type": "source", "name": "rtsp",
             "configurations": {"url": "stub://lobby", "fps": "15"}},
            {"id": "export", "type": "export", "name": "mqtt_export",
             "parameters": {"delay_buffer": 2.5, "insights_overlay": "false"}}
        ],
        "edges": [{"source": "cam", "target": "export"}]
    }"#;

    #[test]
    fn parses_cascade_with_both_parameter_spellings() {
        let cfg = CascadeConfig::from_json(CASCADE).expect("parse");
        assert_eq!(cfg.nodes.len(), 2);
        assert_eq!(cfg.nodes[0].node_type, NodeType::Source);
        assert_eq!(cfg.edges, vec![EdgeConfig::new("cam", "export")]);

        let export = cfg.node("export").expect("export node").params();
        assert_eq!(export.f64_or("delay_buffer", 6.0).expect("number"), 2.5);
        assert!(!export.bool_or("insights_overlay", true).expect("bool"));
    }

    #[test]
    fn numeric_strings_are_accepted() {
        let cfg = CascadeConfig::from_json(CASCADE).expect("parse");
        let cam = cfg.node("cam").expect("cam").params();
        assert_eq!(cam.u32_or("fps", 0).expect("fps"), 15);
        assert_eq!(cam.string_or("url", ""), "stub://lobby");
    }

    #[test]
    fn invalid_number_names_node_and_key() {
        let node =
            NodeConfig::new("n1", NodeType::Export, "mqtt_export").with("delay_buffer", "soon");
        let err = node.params().f64_or("delay_buffer", 1.0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "node 'n1': invalid parameter 'delay_buffer': 'soon' is not a number"
        );
    }

    #[test]
    fn string_list_accepts_all_encodings() {
        let node = NodeConfig::new("f", NodeType::Transform, "filter_transform")
            .with("a", serde_json::json!(["person", "car"]))
            .with("b", "[\"person\",\"car\"]")
            .with("c", "person, car");
        for key in ["a", "b", "c"] {
            assert_eq!(
                node.params().string_list(key).expect("list"),
                vec!["person".to_string(), "car".to_string()]
            );
        }
    }

    #[test]
    fn object_accepts_embedded_json_string() {
        #[derive(Deserialize)]
        struct Point {
            x: f64,
        }
        let node =
            NodeConfig::new("z", NodeType::Transform, "danger_zone").with("p", "{\"x\": 0.5}");
        let p: Point = node.params().object("p").expect("object").expect("present");
        assert_eq!(p.x, 0.5);
    }

    #[test]
    fn unknown_node_type_is_malformed() {
        let raw = r#"{"nodes":[{"id":"a","type":"sink","name":"x"}],"edges":[]}"#;
        let err = CascadeConfig::from_json(raw).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[test]
    fn identity_falls_back_to_ids_for_display_names() {
        let own = Identity {
            skill_id: "skill-7".into(),
            ..Identity::default()
        };
        let fallback = Identity {
            instance_id: "inst".into(),
            device_id: "cam-1".into(),
            device_name: "Lobby".into(),
            ..Identity::default()
        };
        let merged = own.merged_with(&fallback);
        assert_eq!(merged.skill_name, "skill-7");
        assert_eq!(merged.instance_name, "inst");
        assert_eq!(merged.device_name, "Lobby");
    }
}
