//! Export sinks.
//!
//! Sinks are terminal elements. `process()` decides whether a frame is worth
//! delivering and hands the delivery to the sink's own `DeliveryQueue`, so the
//! element thread never waits on the network.
//!
//! Sinks are responsible for:
//! - Per-sink sampling (`RateLimiter`) and the has-objects / new-event gate
//! - Dropping, counting and logging deliveries when their queue is full
//! - Closing and draining their queue in `Export::finish()`
//!
//! Sinks MUST NOT:
//! - Propagate a delivery failure back to the element loop
//! - Block `process()` on a full delivery queue

pub mod blob;
pub mod display;
pub mod encode;
mod overlay;
pub mod snippet;
pub mod telemetry;
pub mod webhook;

pub use blob::{HttpBlobStore, LocalBlobStore};
pub use display::DisplayExport;
pub use encode::{MjpegEncoder, SnippetEncoder};
pub use snippet::{SnippetState, VideoSnippetExport};
pub use telemetry::{MqttExport, MqttPublisher, MqttSettings};
pub use webhook::HttpExport;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::ConfigError;
use crate::frame::{Frame, ObjectMeta, ScenarioEvent};
use crate::graph::NodeContext;

/// Delivery queue depth per sink.
pub const DELIVERY_QUEUE_DEPTH: usize = 30;

const DROP_LOG_EVERY: u64 = 100;

/// Publishes payloads to the telemetry bus.
pub trait TelemetryPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;
}

/// Object storage. `put` returns where the object can be found.
pub trait BlobStore: Send + Sync {
    fn put(&self, path: &str, content_type: &str, bytes: &[u8]) -> Result<String>;
}

#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub offered: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliverySnapshot {
    pub offered: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Bounded hand-off to a single named delivery thread.
pub struct DeliveryQueue<T: Send + 'static> {
    name: String,
    tx: Option<Sender<T>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<DeliveryStats>,
}

impl<T: Send + 'static> DeliveryQueue<T> {
    /// Spawn the delivery thread. `deliver` errors are logged and counted there.
    pub fn spawn<F>(name: &str, depth: usize, mut deliver: F) -> Result<Self>
    where
        F: FnMut(T) -> Result<()> + Send + 'static,
    {
        let (tx, rx) = bounded::<T>(depth.max(1));
        let stats = Arc::new(DeliveryStats::default());
        let worker_stats = stats.clone();
        let worker_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("deliver-{}", name))
            .spawn(move || {
                for item in rx.iter() {
                    match deliver(item) {
                        Ok(()) => {
                            worker_stats.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            worker_stats.failed.fetch_add(1, Ordering::Relaxed);
                            log::warn!("{}: delivery failed: {:#}", worker_name, err);
                        }
                    }
                }
            })
            .map_err(|err| anyhow!("failed to spawn delivery thread for {}: {}", name, err))?;
        Ok(Self {
            name: name.to_string(),
            tx: Some(tx),
            handle: Some(handle),
            stats,
        })
    }

    /// Enqueue without blocking. Returns false when the item was dropped.
    pub fn offer(&self, item: T) -> bool {
        self.stats.offered.fetch_add(1, Ordering::Relaxed);
        let Some(tx) = self.tx.as_ref() else {
            self.note_drop("queue closed");
            return false;
        };
        match tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.note_drop("delivery queue full");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.note_drop("delivery thread gone");
                false
            }
        }
    }

    fn note_drop(&self, reason: &str) {
        let count = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 || count % DROP_LOG_EVERY == 0 {
            log::warn!("{}: dropped delivery ({}); {} dropped so far", self.name, reason, count);
        }
    }

    pub fn stats(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            offered: self.stats.offered.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }

    /// Disconnect and wait for queued items to be delivered.
    pub fn close(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("{}: delivery thread panicked", self.name);
            }
        }
    }
}

impl<T: Send + 'static> Drop for DeliveryQueue<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// At most one accepted frame per `interval`.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        let pass = match self.last {
            None => true,
            Some(_) if self.interval.is_zero() => true,
            Some(last) => now.saturating_duration_since(last) > self.interval,
        };
        if pass {
            self.last = Some(now);
        }
        pass
    }
}

/// Wire payload shared by the telemetry and webhook sinks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub instance_id: String,
    pub skill_id: String,
    pub device_id: String,
    pub frame_id: u64,
    pub timestamp: DateTime<Utc>,
    pub objects: Vec<ObjectMeta>,
    /// Sum of the scenario counters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<BTreeMap<String, i64>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<ScenarioEvent>,
}

impl TelemetryMessage {
    pub fn from_frame(frame: &Frame) -> Self {
        let scenario = frame.insights.scenario.as_ref();
        Self {
            instance_id: frame.instance_id.clone(),
            skill_id: frame.skill_id.clone(),
            device_id: frame.device_id.clone(),
            frame_id: frame.frame_id,
            timestamp: frame.timestamp,
            objects: frame.insights.objects.clone(),
            count: scenario.map(|s| s.counters.values().sum()),
            scenario: scenario.map(|s| s.scenario.clone()),
            counters: scenario.map(|s| s.counters.clone()),
            events: scenario.map(|s| s.events.clone()).unwrap_or_default(),
        }
    }
}

/// Frames carrying scenario state go out only on a new event; plain frames
/// only when they carry detections.
pub(crate) fn worth_exporting(frame: &Frame) -> bool {
    match frame.insights.scenario.as_ref() {
        // A scenario event is the detection here: shelf_zone raises out_of_stock
        // on a frame whose objects are all gone, and that frame must still go out.
        Some(scenario) => scenario.new_event,
        None => frame.has_objects(),
    }
}

/// Non-negative seconds parameter as a `Duration`.
pub(crate) fn seconds_param(ctx: &NodeContext<'_>, key: &str, default: f64) -> Result<Duration> {
    let value = ctx.params().f64_or(key, default)?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidParameter {
            node: ctx.id().to_string(),
            key: key.to_string(),
            reason: format!("{} is not a non-negative number of seconds", value),
        }
        .into());
    }
    Ok(Duration::from_secs_f64(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Bbox, Image, ScenarioInsight};
    use crossbeam_channel::unbounded;

    #[test]
    fn limiter_passes_first_then_one_per_interval() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(Duration::from_secs(2));
        let accepted = (0..20)
            .filter(|step| limiter.allow_at(start + Duration::from_millis(500 * step)))
            .count();
        // 0.0s, 2.5s, 5.0s, 7.5s over a 9.5s window.
        assert_eq!(accepted, 4);
        assert!(accepted as f64 <= (9.5f64 / 2.0).ceil());
    }

    #[test]
    fn zero_interval_passes_everything() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(Duration::ZERO);
        assert!((0..5).all(|_| limiter.allow_at(now)));
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (gate_tx, gate_rx) = unbounded::<()>();
        let (seen_tx, seen_rx) = unbounded::<u32>();
        let mut queue = DeliveryQueue::spawn("test", 2, move |item: u32| {
            let _ = gate_rx.recv();
            let _ = seen_tx.send(item);
            Ok(())
        })
        .expect("spawn");

        let started = Instant::now();
        let accepted = (0..10).filter(|i| queue.offer(*i)).count();
        assert!(started.elapsed() < Duration::from_secs(1));
        // One in the worker's hands (maybe), two queued.
        assert!((2..=3).contains(&accepted), "accepted {}", accepted);
        assert_eq!(queue.stats().dropped, 10 - accepted as u64);

        for _ in 0..accepted {
            gate_tx.send(()).expect("gate");
        }
        queue.close();
        assert_eq!(seen_rx.try_iter().count(), accepted);
        assert_eq!(queue.stats().delivered, accepted as u64);
    }

    #[test]
    fn delivery_errors_are_counted_not_raised() {
        let mut queue = DeliveryQueue::spawn("failing", 4, |_item: u8| Err(anyhow!("unreachable")))
            .expect("spawn");
        assert!(queue.offer(1));
        queue.close();
        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 0);
        assert!(!queue.offer(2));
    }

    #[test]
    fn message_sums_scenario_counters() {
        let mut frame = Frame::new(Image::synthetic(2, 2, 0), 9);
        frame
            .insights
            .objects
            .push(ObjectMeta::new("person", 0.9, Bbox::new(0.1, 0.1, 0.1, 0.1)));
        frame.insights.scenario = Some(ScenarioInsight {
            scenario: "counting_line".into(),
            counters: BTreeMap::from([("a".to_string(), 2), ("b".to_string(), 1)]),
            new_event: true,
            events: Vec::new(),
        });
        let message = TelemetryMessage::from_frame(&frame);
        assert_eq!(message.count, Some(3));
        let json = serde_json::to_value(&message).expect("json");
        assert_eq!(json["frame_id"], 9);
        assert!(json.get("events").is_none());
    }

    #[test]
    fn export_gate_follows_scenario_event_flag() {
        let mut frame = Frame::new(Image::synthetic(2, 2, 0), 0);
        assert!(!worth_exporting(&frame));
        frame.insights.scenario = Some(ScenarioInsight {
            scenario: "shelf_zone".into(),
            new_event: true,
            ..ScenarioInsight::default()
        });
        assert!(worth_exporting(&frame));
        if let Some(s) = frame.insights.scenario.as_mut() {
            s.new_event = false;
        }
        frame
            .insights
            .objects
            .push(ObjectMeta::new("person", 0.9, Bbox::default()));
        assert!(!worth_exporting(&frame));
    }
}
