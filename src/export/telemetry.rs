//! MQTT telemetry sink.
//!
//! `MqttPublisher` owns one rumqttc v5 client and the thread that drives its
//! event loop. The event loop reconnects on its own the next time it is polled,
//! so connection errors are logged and followed by a backoff sleep rather than
//! ending the thread.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event};
use rumqttc::Transport;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::element::Backoff;
use crate::element::Export;
use crate::frame::Frame;
use crate::graph::NodeContext;

use super::{
    seconds_param, worth_exporting, DeliveryQueue, RateLimiter, TelemetryMessage,
    TelemetryPublisher, DELIVERY_QUEUE_DEPTH,
};

pub const DEFAULT_TOPIC: &str = "mqttmessage";
pub const DEFAULT_DELAY_BUFFER_SECS: f64 = 6.0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// `[mqtt|tcp|mqtts|ssl://]host:port`. IPv6 hosts go in brackets.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub broker: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttSettings {
    pub fn new(broker: &str) -> Self {
        Self {
            broker: broker.to_string(),
            ..Self::default()
        }
    }
}

pub struct MqttPublisher {
    client: Client,
    shutdown: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttPublisher {
    /// Build the client and start its event loop. The broker is not contacted
    /// until the loop first polls, so an unreachable broker is not an error here.
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker)?;
        let client_id = if settings.client_id.is_empty() {
            format!("cascade-{:08x}", rand::random::<u32>())
        } else {
            settings.client_id.clone()
        };
        let mut options = rumqttc::v5::MqttOptions::new(client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, 10);
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_connection(connection, shutdown.clone(), settings.broker.clone())?;
        log::info!(
            "mqtt publisher for {}:{} ready (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );
        Ok(Self {
            client,
            shutdown,
            connection_handle: Some(handle),
        })
    }
}

fn spawn_connection(
    mut connection: Connection,
    shutdown: Arc<AtomicBool>,
    broker: String,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mqtt-connection".to_string())
        .spawn(move || {
            let mut backoff = Backoff::default();
            for event in connection.iter() {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => backoff.reset(),
                    Err(e) => {
                        let delay = backoff.next_delay();
                        log::warn!(
                            "mqtt connection to {} failed: {}; retrying in {:?}",
                            broker,
                            e,
                            delay
                        );
                        std::thread::sleep(delay);
                    }
                }
            }
        })
        .map_err(|err| anyhow!("failed to spawn mqtt connection thread: {}", err))
}

impl TelemetryPublisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .with_context(|| format!("publish to {}", topic))?;
        Ok(())
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.client.try_disconnect();
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Rate-limited JSON telemetry to a bus topic.
pub struct MqttExport {
    limiter: RateLimiter,
    queue: DeliveryQueue<Vec<u8>>,
}

impl MqttExport {
    pub fn new(
        node: &str,
        topic: &str,
        delay_buffer: Duration,
        publisher: Arc<dyn TelemetryPublisher>,
    ) -> Result<Self> {
        let topic = topic.to_string();
        let queue = DeliveryQueue::spawn(node, DELIVERY_QUEUE_DEPTH, move |payload: Vec<u8>| {
            publisher.publish(&topic, &payload)
        })?;
        Ok(Self {
            limiter: RateLimiter::new(delay_buffer),
            queue,
        })
    }

    pub fn from_node(ctx: &NodeContext<'_>) -> Result<Self> {
        let params = ctx.params();
        let delay_buffer = seconds_param(ctx, "delay_buffer", DEFAULT_DELAY_BUFFER_SECS)?;
        let topic = params.string_or(
            "topic",
            ctx.runtime.telemetry_topic.as_deref().unwrap_or(DEFAULT_TOPIC),
        );
        let publisher: Arc<dyn TelemetryPublisher> = match params
            .string("broker_address")
            .filter(|b| !b.trim().is_empty())
        {
            Some(broker) => {
                let settings = MqttSettings {
                    broker,
                    client_id: params.string_or("client_id", ""),
                    username: params.string("username"),
                    password: params.string("password"),
                };
                Arc::new(MqttPublisher::connect(&settings)?)
            }
            None => ctx
                .runtime
                .telemetry
                .clone()
                .ok_or_else(|| ctx.missing("telemetry publisher"))?,
        };
        Self::new(ctx.id(), &topic, delay_buffer, publisher)
    }

    pub fn queue(&self) -> &DeliveryQueue<Vec<u8>> {
        &self.queue
    }

    /// `process` with an explicit clock for the rate limiter.
    pub fn process_at(&mut self, frame: Frame, now: Instant) -> Result<()> {
        if !worth_exporting(&frame) || !self.limiter.allow_at(now) {
            return Ok(());
        }
        let payload = serde_json::to_vec(&TelemetryMessage::from_frame(&frame))
            .context("serialize telemetry message")?;
        self.queue.offer(payload);
        Ok(())
    }
}

impl Export for MqttExport {
    fn process(&mut self, frame: Frame) -> Result<()> {
        self.process_at(frame, Instant::now())
    }

    fn finish(&mut self) {
        self.queue.close();
    }
}
