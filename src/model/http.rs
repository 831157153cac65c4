//! HTTP inference client.
//!
//! `POST {endpoint}/predict/{model}?width=W&height=H` with a `multipart/form-data`
//! body carrying the JPEG-encoded image in field `file`. Detection responses are
//! `{objects|predictions|inferences: [...]}` or a bare list; classification
//! responses are `{classifications: [{name, label, confidence}]}`.
//!
//! A non-200 status is "nothing this frame" and is not an error. Transport
//! failures are returned so the calling model can log and carry on.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::frame::{Attribute, Bbox, Image, ImageEncoding, ObjectMeta};

use super::InferenceClient;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct WireDetection {
    #[serde(alias = "tagName")]
    label: String,
    #[serde(alias = "probability")]
    confidence: f64,
    #[serde(alias = "boundingBox")]
    bbox: Bbox,
}

#[derive(Debug, Deserialize)]
struct WireClassifications {
    #[serde(default)]
    classifications: Vec<Attribute>,
}

pub struct HttpInferenceClient {
    base: Url,
    agent: ureq::Agent,
}

impl HttpInferenceClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(endpoint)
            .with_context(|| format!("parse inference endpoint {}", endpoint))?;
        match base.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported inference scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { base, agent })
    }

    pub fn endpoint(&self) -> &str {
        self.base.as_str()
    }

    fn predict_url(&self, model: &str, width: u32, height: u32) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("inference endpoint {} cannot take a path", self.base))?
            .pop_if_empty()
            .push("predict")
            .push(model);
        url.query_pairs_mut()
            .append_pair("width", &width.to_string())
            .append_pair("height", &height.to_string());
        Ok(url)
    }

    /// `Ok(None)` for a non-200 answer.
    fn predict(&self, model: &str, image: &Image) -> Result<Option<Value>> {
        let jpeg = image.encode(ImageEncoding::Jpeg)?;
        let url = self.predict_url(model, image.width, image.height)?;
        let boundary = format!("cascade-{:016x}", rand::random::<u64>());
        let content_type = ImageEncoding::Jpeg.content_type();
        let body = multipart_body(&boundary, "file", "frame.jpg", content_type, &jpeg);

        let response = self
            .agent
            .post(url.as_str())
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", boundary),
            )
            .send_bytes(&body);
        match response {
            Ok(response) => {
                let raw = response
                    .into_string()
                    .context("read inference response")?;
                let value = serde_json::from_str(&raw).context("decode inference response")?;
                Ok(Some(value))
            }
            Err(ureq::Error::Status(code, _)) => {
                log::warn!("inference {} answered {}; no detections this frame", url, code);
                Ok(None)
            }
            Err(err) => Err(anyhow!("inference request to {} failed: {}", url, err)),
        }
    }
}

impl InferenceClient for HttpInferenceClient {
    fn detect(&self, model: &str, image: &Image) -> Result<Vec<ObjectMeta>> {
        match self.predict(model, image)? {
            Some(value) => parse_detections(value),
            None => Ok(Vec::new()),
        }
    }

    fn classify(&self, model: &str, image: &Image) -> Result<Vec<Attribute>> {
        match self.predict(model, image)? {
            Some(value) => parse_classifications(value),
            None => Ok(Vec::new()),
        }
    }
}

pub(crate) fn multipart_body(
    boundary: &str,
    field: &str,
    filename: &str,
    content_type: &str,
    content: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

pub(crate) fn parse_detections(value: Value) -> Result<Vec<ObjectMeta>> {
    let list = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => ["objects", "predictions", "inferences"]
            .iter()
            .find_map(|key| map.remove(*key))
            .unwrap_or(Value::Array(Vec::new())),
        other => return Err(anyhow!("unexpected inference response: {}", other)),
    };
    let wire: Vec<WireDetection> =
        serde_json::from_value(list).context("decode detection list")?;
    Ok(wire
        .into_iter()
        .map(|d| ObjectMeta::new(d.label, d.confidence, d.bbox))
        .collect())
}

pub(crate) fn parse_classifications(value: Value) -> Result<Vec<Attribute>> {
    let wire: WireClassifications =
        serde_json::from_value(value).context("decode classification response")?;
    Ok(wire.classifications)
}
