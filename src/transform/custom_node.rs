//! Client side of the custom-node session.
//!
//! A custom node is a transform hosted by another process. The session is:
//!
//! 1. `Handshake {seq: 1, instance_id, skill_id, device_id}` answered with
//!    `{ack: 1, image_type}`; `image_type` picks the pixel encoding (raw/bmp/jpeg).
//! 2. `Process {seq: n, frame}` answered with `{ack: n, insights}` for n = 2, 3, ...
//!
//! Any ack that does not echo the request's `seq` is a protocol violation: the
//! session is closed, the frame is dropped on this branch, and the next frame
//! starts a fresh handshake. The connection itself is opened lazily on the first
//! frame because the peer may not be up when the cascade is compiled.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::cascade::Identity;
use crate::element::{Flow, Transform};
use crate::error::{ConfigError, ProtocolError};
use crate::frame::{Frame, ImageEncoding, ObjectMeta};
use crate::graph::NodeContext;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub seq: u64,
    pub instance_id: String,
    pub skill_id: String,
    pub device_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub ack: u64,
    pub image_type: String,
}

/// One frame as sent to the peer. `image` is encoded as negotiated.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessRequest<'a> {
    pub seq: u64,
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub image_type: ImageEncoding,
    pub image: &'a [u8],
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyInsights {
    #[serde(default)]
    pub objects: Vec<ObjectMeta>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessReply {
    pub ack: u64,
    #[serde(default)]
    pub insights: ReplyInsights,
}

/// Transport for one session. Errors are transport failures; ack checking is
/// done by the caller.
pub trait CustomNodeChannel: Send {
    fn handshake(&mut self, request: &HandshakeRequest) -> Result<HandshakeReply>;

    fn process(&mut self, request: &ProcessRequest<'_>) -> Result<ProcessReply>;
}

/// Opens channels to custom-node peers.
pub trait CustomNodeConnector: Send + Sync {
    fn connect(&self, endpoint: &str) -> Result<Box<dyn CustomNodeChannel>>;
}

/// Handshake and Process over HTTP: JSON for the handshake, an octet body with
/// the frame fields in the query string for Process.
#[derive(Clone, Debug)]
pub struct HttpCustomNodeConnector {
    timeout: Duration,
}

impl Default for HttpCustomNodeConnector {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl HttpCustomNodeConnector {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CustomNodeConnector for HttpCustomNodeConnector {
    fn connect(&self, endpoint: &str) -> Result<Box<dyn CustomNodeChannel>> {
        let base = Url::parse(endpoint)
            .with_context(|| format!("parse custom node endpoint {}", endpoint))?;
        match base.scheme() {
            "http" | "https" => {}
            other => return Err(anyhow!("unsupported custom node scheme '{}'", other)),
        }
        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
        Ok(Box::new(HttpChannel { base, agent }))
    }
}

struct HttpChannel {
    base: Url,
    agent: ureq::Agent,
}

impl HttpChannel {
    fn url(&self, call: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("custom node endpoint {} cannot take a path", self.base))?
            .pop_if_empty()
            .push(call);
        Ok(url)
    }
}

impl CustomNodeChannel for HttpChannel {
    fn handshake(&mut self, request: &HandshakeRequest) -> Result<HandshakeReply> {
        let url = self.url("handshake")?;
        let body = serde_json::to_string(request)?;
        let raw = self
            .agent
            .post(url.as_str())
            .set("Content-Type", "application/json")
            .send_string(&body)
            .map_err(|err| anyhow!("handshake with {} failed: {}", url, err))?
            .into_string()
            .context("read handshake reply")?;
        serde_json::from_str(&raw).context("decode handshake reply")
    }

    fn process(&mut self, request: &ProcessRequest<'_>) -> Result<ProcessReply> {
        let mut url = self.url("process")?;
        url.query_pairs_mut()
            .append_pair("seq", &request.seq.to_string())
            .append_pair("frame_id", &request.frame_id.to_string())
            .append_pair("width", &request.width.to_string())
            .append_pair("height", &request.height.to_string());
        let raw = self
            .agent
            .post(url.as_str())
            .set("Content-Type", request.image_type.content_type())
            .send_bytes(request.image)
            .map_err(|err| anyhow!("process call to {} failed: {}", self.base, err))?
            .into_string()
            .context("read process reply")?;
        serde_json::from_str(&raw).context("decode process reply")
    }
}

struct Session {
    channel: Box<dyn CustomNodeChannel>,
    seq: u64,
    image_type: ImageEncoding,
}

pub struct CustomNodeTransform {
    node: String,
    endpoint: String,
    identity: Identity,
    connector: Arc<dyn CustomNodeConnector>,
    session: Option<Session>,
}

impl CustomNodeTransform {
    pub fn new(
        node: &str,
        endpoint: &str,
        identity: Identity,
        connector: Arc<dyn CustomNodeConnector>,
    ) -> Self {
        Self {
            node: node.to_string(),
            endpoint: endpoint.to_string(),
            identity,
            connector,
            session: None,
        }
    }

    pub fn from_node(ctx: &NodeContext<'_>) -> Result<Self> {
        let params = ctx.params();
        let endpoint = params
            .string("endpoint")
            .or_else(|| params.string("address"))
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| ConfigError::InvalidParameter {
                node: ctx.id().to_string(),
                key: "endpoint".to_string(),
                reason: "custom node endpoint is required".to_string(),
            })?;
        Ok(Self::new(
            ctx.id(),
            &endpoint,
            ctx.identity.clone(),
            ctx.runtime.custom_nodes.clone(),
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn open(&self) -> Result<Session> {
        let mut channel = self.connector.connect(&self.endpoint)?;
        let request = HandshakeRequest {
            seq: 1,
            instance_id: self.identity.instance_id.clone(),
            skill_id: self.identity.skill_id.clone(),
            device_id: self.identity.device_id.clone(),
        };
        let reply = channel.handshake(&request)?;
        if reply.ack != request.seq {
            return Err(ProtocolError::HandshakeAck {
                expected: request.seq,
                got: reply.ack,
            }
            .into());
        }
        let image_type = ImageEncoding::parse(&reply.image_type)
            .ok_or_else(|| ProtocolError::UnsupportedImageType(reply.image_type.clone()))?;
        log::info!(
            "{}: custom node session open at {} ({:?})",
            self.node,
            self.endpoint,
            image_type
        );
        Ok(Session {
            channel,
            seq: request.seq + 1,
            image_type,
        })
    }

    fn exchange(session: &mut Session, frame: &Frame) -> Result<Vec<ObjectMeta>> {
        let image = frame.image.encode(session.image_type)?;
        let request = ProcessRequest {
            seq: session.seq,
            frame_id: frame.frame_id,
            width: frame.image.width,
            height: frame.image.height,
            image_type: session.image_type,
            image: &image,
        };
        let reply = session.channel.process(&request)?;
        if reply.ack != request.seq {
            return Err(ProtocolError::ProcessAck {
                expected: request.seq,
                got: reply.ack,
            }
            .into());
        }
        session.seq += 1;
        Ok(reply.insights.objects)
    }
}

impl Transform for CustomNodeTransform {
    fn process(&mut self, frame: &mut Frame) -> Result<Flow> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => self
                .open()
                .with_context(|| format!("custom node {} handshake", self.endpoint))?,
        };
        let objects = Self::exchange(&mut session, frame).map_err(|err| {
            log::warn!("{}: closing custom node session: {:#}", self.node, err);
            err
        })?;
        self.session = Some(session);
        frame.insights.objects.extend(objects);
        Ok(Flow::Forward)
    }
}
