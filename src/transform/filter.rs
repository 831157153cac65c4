use anyhow::Result;

use crate::element::{Flow, Transform};
use crate::frame::{Frame, ObjectMeta};
use crate::graph::NodeContext;
use crate::scenario::normalize_threshold;

/// Keeps objects by label allow-list and minimum confidence.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterTransform {
    labels: Vec<String>,
    confidence_threshold: f64,
}

impl FilterTransform {
    /// An empty `labels` list keeps every label.
    pub fn new(labels: Vec<String>, confidence_threshold: f64) -> Self {
        Self {
            labels,
            confidence_threshold: normalize_threshold(confidence_threshold),
        }
    }

    pub fn from_node(ctx: &NodeContext<'_>) -> Result<Self> {
        let params = ctx.params();
        Ok(Self::new(
            params.string_list("labels")?,
            params.f64_or("confidence_threshold", 0.0)?,
        ))
    }

    pub fn keeps(&self, object: &ObjectMeta) -> bool {
        object.confidence >= self.confidence_threshold
            && (self.labels.is_empty() || self.labels.iter().any(|l| *l == object.label))
    }
}

impl Transform for FilterTransform {
    fn process(&mut self, frame: &mut Frame) -> Result<Flow> {
        frame.insights.objects.retain(|object| self.keeps(object));
        Ok(Flow::Forward)
    }
}
