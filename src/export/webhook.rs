use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;

use crate::element::Export;
use crate::error::ConfigError;
use crate::frame::Frame;
use crate::graph::NodeContext;

use super::{
    seconds_param, worth_exporting, DeliveryQueue, RateLimiter, TelemetryMessage,
    DELIVERY_QUEUE_DEPTH,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// POSTs the telemetry JSON to a webhook.
pub struct HttpExport {
    limiter: RateLimiter,
    queue: DeliveryQueue<Vec<u8>>,
}

impl HttpExport {
    pub fn new(node: &str, url: &str, delay_buffer: Duration, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("parse webhook url {}", url))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(anyhow!("unsupported webhook scheme '{}'", other)),
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let queue = DeliveryQueue::spawn(node, DELIVERY_QUEUE_DEPTH, move |body: Vec<u8>| {
            agent
                .post(url.as_str())
                .set("Content-Type", "application/json")
                .send_bytes(&body)
                .map_err(|err| anyhow!("POST {} failed: {}", url, err))?;
            Ok(())
        })?;
        Ok(Self {
            limiter: RateLimiter::new(delay_buffer),
            queue,
        })
    }

    pub fn from_node(ctx: &NodeContext<'_>) -> Result<Self> {
        let params = ctx.params();
        let url = params
            .string("url")
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ConfigError::InvalidParameter {
                node: ctx.id().to_string(),
                key: "url".to_string(),
                reason: "webhook url is required".to_string(),
            })?;
        let delay_buffer = seconds_param(ctx, "delay_buffer", 0.0)?;
        let timeout_ms = params.u64_or("timeout_ms", DEFAULT_TIMEOUT.as_millis() as u64)?;
        Self::new(ctx.id(), &url, delay_buffer, Duration::from_millis(timeout_ms)).map_err(|err| {
            ConfigError::InvalidParameter {
                node: ctx.id().to_string(),
                key: "url".to_string(),
                reason: format!("{:#}", err),
            }
            .into()
        })
    }

    pub fn queue(&self) -> &DeliveryQueue<Vec<u8>> {
        &self.queue
    }
}

impl Export for HttpExport {
    fn process(&mut self, frame: Frame) -> Result<()> {
        if !worth_exporting(&frame) || !self.limiter.allow() {
            return Ok(());
        }
        let body = serde_json::to_vec(&TelemetryMessage::from_frame(&frame))
            .context("serialize webhook payload")?;
        self.queue.offer(body);
        Ok(())
    }

    fn finish(&mut self) {
        self.queue.close();
    }
}
