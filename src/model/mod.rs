//! Model elements.
//!
//! Models are transforms that ask an inference collaborator about the frame's
//! pixels and append what it returns to `frame.insights`. They are responsible
//! for:
//! - Treating a failed or refused inference call as "no detections this frame"
//! - Clamping returned boxes into the unit square
//!
//! Models MUST NOT:
//! - Drop the frame because the inference endpoint is unreachable

pub mod http;

pub use http::HttpInferenceClient;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::element::{Flow, Transform};
use crate::error::ConfigError;
use crate::frame::{Attribute, Bbox, Frame, Image, ObjectMeta};
use crate::graph::NodeContext;

/// Log one line per this many consecutive inference failures.
const FAILURE_LOG_EVERY: u64 = 100;

/// Request/response contract with a model-serving backend.
pub trait InferenceClient: Send + Sync {
    fn detect(&self, model: &str, image: &Image) -> Result<Vec<ObjectMeta>>;

    fn classify(&self, model: &str, image: &Image) -> Result<Vec<Attribute>>;
}

/// A node-level `endpoint` wins over the runtime's shared client.
fn resolve_client(ctx: &NodeContext<'_>) -> Result<Arc<dyn InferenceClient>> {
    let params = ctx.params();
    if let Some(endpoint) = params.string("endpoint").filter(|e| !e.trim().is_empty()) {
        let timeout_ms = params.u64_or("timeout_ms", http::DEFAULT_TIMEOUT.as_millis() as u64)?;
        let client = HttpInferenceClient::new(&endpoint, Duration::from_millis(timeout_ms))
            .map_err(|err| ConfigError::InvalidParameter {
                node: ctx.id().to_string(),
                key: "endpoint".to_string(),
                reason: format!("{:#}", err),
            })?;
        return Ok(Arc::new(client));
    }
    ctx.runtime
        .inference
        .clone()
        .ok_or_else(|| ctx.missing("inference endpoint").into())
}

/// Consecutive-failure tracker so an unreachable endpoint does not flood the log.
#[derive(Debug, Default)]
struct FailureLog {
    consecutive: u64,
}

impl FailureLog {
    fn failed(&mut self, node: &str, frame_id: u64, err: &anyhow::Error) {
        self.consecutive += 1;
        if self.consecutive == 1 || self.consecutive % FAILURE_LOG_EVERY == 0 {
            log::warn!(
                "{}: inference failed on frame {} ({} in a row): {:#}",
                node,
                frame_id,
                self.consecutive,
                err
            );
        }
    }

    fn succeeded(&mut self, node: &str) {
        if self.consecutive > 0 {
            log::info!("{}: inference recovered after {} failures", node, self.consecutive);
            self.consecutive = 0;
        }
    }
}

pub struct ObjectDetectionModel {
    node: String,
    model: String,
    client: Arc<dyn InferenceClient>,
    failures: FailureLog,
}

impl ObjectDetectionModel {
    pub fn new(node: &str, model: &str, client: Arc<dyn InferenceClient>) -> Self {
        Self {
            node: node.to_string(),
            model: model.to_string(),
            client,
            failures: FailureLog::default(),
        }
    }

    pub fn from_node(ctx: &NodeContext<'_>) -> Result<Self> {
        let model = ctx.params().string_or("model", &ctx.node.name);
        Ok(Self::new(ctx.id(), &model, resolve_client(ctx)?))
    }
}

impl Transform for ObjectDetectionModel {
    fn process(&mut self, frame: &mut Frame) -> Result<Flow> {
        match self.client.detect(&self.model, &frame.image) {
            Ok(objects) => {
                self.failures.succeeded(&self.node);
                frame.insights.objects.extend(objects.into_iter().map(|mut object| {
                    object.bbox = object.bbox.clamped();
                    object
                }));
            }
            Err(err) => self.failures.failed(&self.node, frame.frame_id, &err),
        }
        Ok(Flow::Forward)
    }
}

pub struct ClassificationModel {
    node: String,
    model: String,
    client: Arc<dyn InferenceClient>,
    failures: FailureLog,
}

impl ClassificationModel {
    pub fn new(node: &str, model: &str, client: Arc<dyn InferenceClient>) -> Self {
        Self {
            node: node.to_string(),
            model: model.to_string(),
            client,
            failures: FailureLog::default(),
        }
    }

    pub fn from_node(ctx: &NodeContext<'_>) -> Result<Self> {
        let model = ctx.params().string_or("model", &ctx.node.name);
        Ok(Self::new(ctx.id(), &model, resolve_client(ctx)?))
    }
}

impl Transform for ClassificationModel {
    /// Classifies each object's crop. Empty crops are skipped; the first failed
    /// call ends classification for this frame.
    fn process(&mut self, frame: &mut Frame) -> Result<Flow> {
        let image = &frame.image;
        for object in frame.insights.objects.iter_mut() {
            let Some(crop) = image.crop(&object.bbox) else {
                continue;
            };
            match self.client.classify(&self.model, &crop) {
                Ok(attributes) => {
                    self.failures.succeeded(&self.node);
                    object.attributes.extend(attributes);
                }
                Err(err) => {
                    self.failures.failed(&self.node, frame.frame_id, &err);
                    break;
                }
            }
        }
        Ok(Flow::Forward)
    }
}

/// Appends a fixed detection list to every frame.
pub struct FakeModel {
    objects: Vec<ObjectMeta>,
}

impl FakeModel {
    pub fn new(objects: Vec<ObjectMeta>) -> Self {
        Self { objects }
    }

    pub fn from_node(ctx: &NodeContext<'_>) -> Result<Self> {
        let objects = ctx
            .params()
            .object::<Vec<ObjectMeta>>("objects")?
            .unwrap_or_else(Self::default_objects);
        Ok(Self::new(objects))
    }

    pub fn default_objects() -> Vec<ObjectMeta> {
        vec![
            ObjectMeta::new("person", 0.5, Bbox::new(0.1, 0.1, 0.1, 0.1)),
            ObjectMeta::new("cat", 0.9, Bbox::new(0.4, 0.4, 0.1, 0.1)),
        ]
    }
}

impl Transform for FakeModel {
    fn process(&mut self, frame: &mut Frame) -> Result<Flow> {
        frame.insights.objects.extend(self.objects.iter().cloned());
        Ok(Flow::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;

    struct Scripted {
        detections: Mutex<Vec<Result<Vec<ObjectMeta>>>>,
        crops: Mutex<Vec<(u32, u32)>>,
    }

    impl Scripted {
        fn new(detections: Vec<Result<Vec<ObjectMeta>>>) -> Arc<Self> {
            Arc::new(Self {
                detections: Mutex::new(detections),
                crops: Mutex::new(Vec::new()),
            })
        }
    }

    impl InferenceClient for Scripted {
        fn detect(&self, _model: &str, _image: &Image) -> Result<Vec<ObjectMeta>> {
            self.detections.lock().expect("lock").remove(0)
        }

        fn classify(&self, _model: &str, image: &Image) -> Result<Vec<Attribute>> {
            self.crops.lock().expect("lock").push((image.width, image.height));
            Ok(vec![Attribute {
                name: "color".into(),
                label: "red".into(),
                confidence: 0.8,
            }])
        }
    }

    fn frame() -> Frame {
        Frame::new(Image::synthetic(20, 10, 0), 7)
    }

    #[test]
    fn detections_are_clamped() {
        let client = Scripted::new(vec![Ok(vec![ObjectMeta::new(
            "person",
            0.9,
            Bbox::new(-0.1, 0.8, 0.3, 0.4),
        )])]);
        let mut model = ObjectDetectionModel::new("det", "m", client);
        let mut frame = frame();
        assert_eq!(model.process(&mut frame).expect("process"), Flow::Forward);
        let bbox = frame.insights.objects[0].bbox;
        assert_eq!(bbox.l, 0.0);
        assert!((bbox.w - 0.2).abs() < 1e-9);
        assert!((bbox.bottom() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn inference_failure_forwards_frame_unchanged() {
        let client = Scripted::new(vec![Err(anyhow!("connection refused"))]);
        let mut model = ObjectDetectionModel::new("det", "m", client);
        let mut frame = frame();
        assert_eq!(model.process(&mut frame).expect("process"), Flow::Forward);
        assert!(frame.insights.objects.is_empty());
        assert_eq!(model.failures.consecutive, 1);
    }

    #[test]
    fn classification_attaches_attributes_per_crop() {
        let client = Scripted::new(Vec::new());
        let mut model = ClassificationModel::new("cls", "m", client.clone());
        let mut frame = frame();
        frame.insights.objects = vec![
            ObjectMeta::new("car", 0.9, Bbox::new(0.0, 0.0, 0.5, 0.5)),
            ObjectMeta::new("car", 0.9, Bbox::new(2.0, 2.0, 0.1, 0.1)),
        ];
        model.process(&mut frame).expect("process");
        assert_eq!(frame.insights.objects[0].attributes.len(), 1);
        assert!(frame.insights.objects[1].attributes.is_empty());
        assert_eq!(*client.crops.lock().expect("lock"), vec![(10, 5)]);
    }

    #[test]
    fn fake_model_appends_static_objects() {
        let mut model = FakeModel::new(FakeModel::default_objects());
        let mut frame = frame();
        model.process(&mut frame).expect("process");
        let labels: Vec<_> = frame.insights.objects.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(labels, vec!["person", "cat"]);
    }
}
