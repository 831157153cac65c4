//! `(NodeType, name) -> factory` map.
//!
//! Node types are closed; names are open. `builtin()` registers every element
//! shipped with the crate, and `register()` adds or replaces one.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cascade::{Identity, NodeConfig, NodeType, ParamReader};
use crate::context::RuntimeContext;
use crate::element::Stage;
use crate::error::ConfigError;
use crate::export::{DisplayExport, HttpExport, MqttExport, VideoSnippetExport};
use crate::ingest::{RtspSource, SyntheticSource};
use crate::model::{ClassificationModel, FakeModel, ObjectDetectionModel};
use crate::scenario::ScenarioKind;
use crate::transform::{CustomNodeTransform, FilterTransform, ScenarioTransform};

/// Everything a factory may look at while building one element.
#[derive(Clone, Copy)]
pub struct NodeContext<'a> {
    pub runtime: &'a RuntimeContext,
    pub cascade: &'a str,
    /// Cascade identity with the runtime's identity filled in underneath.
    pub identity: &'a Identity,
    pub node: &'a NodeConfig,
}

impl<'a> NodeContext<'a> {
    pub fn params(&self) -> ParamReader<'a> {
        self.node.params()
    }

    pub fn id(&self) -> &'a str {
        &self.node.id
    }

    pub fn missing(&self, collaborator: &str) -> ConfigError {
        ConfigError::MissingCollaborator {
            node: self.node.id.clone(),
            collaborator: collaborator.to_string(),
        }
    }
}

pub type Factory = Arc<dyn Fn(&NodeContext<'_>) -> Result<Stage> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ElementRegistry {
    factories: HashMap<(NodeType, String), Factory>,
}

impl ElementRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.register(NodeType::Source, "synthetic", |ctx| {
            Ok(Stage::source(SyntheticSource::from_node(ctx)?))
        });
        registry.register(NodeType::Source, "rtsp", |ctx| {
            Ok(Stage::source(RtspSource::from_node(ctx)?))
        });

        registry.register(NodeType::Model, "object_detection_model", |ctx| {
            Ok(Stage::transform(ObjectDetectionModel::from_node(ctx)?))
        });
        registry.register(NodeType::Model, "classification_model", |ctx| {
            Ok(Stage::transform(ClassificationModel::from_node(ctx)?))
        });
        registry.register(NodeType::Model, "fake_model", |ctx| {
            Ok(Stage::transform(FakeModel::from_node(ctx)?))
        });

        registry.register(NodeType::Transform, "filter_transform", |ctx| {
            Ok(Stage::transform(FilterTransform::from_node(ctx)?))
        });
        registry.register(NodeType::Transform, "grpc_transform", |ctx| {
            Ok(Stage::transform(CustomNodeTransform::from_node(ctx)?))
        });
        for kind in ScenarioKind::ALL {
            registry.register(NodeType::Transform, kind.as_str(), move |ctx| {
                Ok(Stage::transform(ScenarioTransform::from_node(ctx, kind)?))
            });
        }

        registry.register(NodeType::Export, "mqtt_export", |ctx| {
            Ok(Stage::export(MqttExport::from_node(ctx)?))
        });
        registry.register(NodeType::Export, "http_export", |ctx| {
            Ok(Stage::export(HttpExport::from_node(ctx)?))
        });
        registry.register(NodeType::Export, "video_snippet_export", |ctx| {
            Ok(Stage::export(VideoSnippetExport::from_node(ctx)?))
        });
        registry.register(NodeType::Export, "display_export", |ctx| {
            Ok(Stage::export(DisplayExport::from_node(ctx)?))
        });

        registry
    }

    /// Add or replace the factory for `(node_type, name)`.
    pub fn register<F>(&mut self, node_type: NodeType, name: &str, factory: F)
    where
        F: Fn(&NodeContext<'_>) -> Result<Stage> + Send + Sync + 'static,
    {
        self.factories
            .insert((node_type, name.to_string()), Arc::new(factory));
    }

    pub fn contains(&self, node_type: NodeType, name: &str) -> bool {
        self.factories.contains_key(&(node_type, name.to_string()))
    }

    /// Registered names, sorted by type then name.
    pub fn names(&self) -> Vec<(NodeType, String)> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct the stage for `ctx.node`. The stage must fit the node type.
    pub fn build(&self, ctx: &NodeContext<'_>) -> Result<Stage> {
        let node = ctx.node;
        let factory = self
            .factories
            .get(&(node.node_type, node.name.clone()))
            .ok_or_else(|| ConfigError::UnknownElement {
                node_type: node.node_type,
                name: node.name.clone(),
            })?;
        let stage = factory(ctx)?;
        if !stage.fits(node.node_type) {
            return Err(ConfigError::InvalidParameter {
                node: node.id.clone(),
                key: "type".to_string(),
                reason: format!("'{}' does not produce a {} element", node.name, node.node_type),
            }
            .into());
        }
        Ok(stage)
    }
}
