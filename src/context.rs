//! Process-wide collaborators, built once and passed into the compiler.
//!
//! Every external system a node may talk to (telemetry bus, blob storage,
//! inference endpoint, custom-node peers) is reached through a trait object held
//! here. Tests build a context with in-memory recorders; the daemon builds one
//! from `DaemonConfig`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::cascade::Identity;
use crate::export::{BlobStore, TelemetryPublisher};
use crate::model::InferenceClient;
use crate::scenario::ScenarioSnapshot;
use crate::transform::{CustomNodeConnector, HttpCustomNodeConnector};

#[derive(Clone)]
pub struct RuntimeContext {
    /// Fallback identity for cascades that do not carry their own.
    pub identity: Identity,
    pub telemetry: Option<Arc<dyn TelemetryPublisher>>,
    /// Topic for telemetry nodes that do not name one.
    pub telemetry_topic: Option<String>,
    pub blob_store: Option<Arc<dyn BlobStore>>,
    pub inference: Option<Arc<dyn InferenceClient>>,
    pub custom_nodes: Arc<dyn CustomNodeConnector>,
    pub scenarios: ScenarioBoard,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self {
            identity: Identity::default(),
            telemetry: None,
            telemetry_topic: None,
            blob_store: None,
            inference: None,
            custom_nodes: Arc::new(HttpCustomNodeConnector::default()),
            scenarios: ScenarioBoard::default(),
        }
    }
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_telemetry(mut self, publisher: Arc<dyn TelemetryPublisher>) -> Self {
        self.telemetry = Some(publisher);
        self
    }

    pub fn with_telemetry_topic(mut self, topic: &str) -> Self {
        self.telemetry_topic = Some(topic.to_string());
        self
    }

    pub fn with_blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    pub fn with_inference(mut self, client: Arc<dyn InferenceClient>) -> Self {
        self.inference = Some(client);
        self
    }

    pub fn with_custom_nodes(mut self, connector: Arc<dyn CustomNodeConnector>) -> Self {
        self.custom_nodes = connector;
        self
    }
}

/// One scenario transform's published state plus its pending reset request.
#[derive(Debug, Default)]
pub struct ScenarioSlot {
    snapshot: Mutex<ScenarioSnapshot>,
    reset: AtomicBool,
}

impl ScenarioSlot {
    pub fn publish(&self, snapshot: ScenarioSnapshot) {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    pub fn snapshot(&self) -> ScenarioSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn request_reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
    }

    /// Consume a pending reset request. Only the owning transform calls this.
    pub fn take_reset(&self) -> bool {
        self.reset.swap(false, Ordering::SeqCst)
    }
}

/// Registry of scenario slots keyed by `(cascade, node)` and reported as `"{cascade}/{node}"`.
#[derive(Clone, Debug, Default)]
pub struct ScenarioBoard {
    slots: Arc<RwLock<BTreeMap<(String, String), Arc<ScenarioSlot>>>>,
}

impl ScenarioBoard {
    pub fn key(cascade: &str, node: &str) -> String {
        format!("{}/{}", cascade, node)
    }

    /// Fresh slot for a node; an existing slot under the same key is replaced.
    pub fn register(&self, cascade: &str, node: &str) -> Arc<ScenarioSlot> {
        let slot = Arc::new(ScenarioSlot::default());
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((cascade.to_string(), node.to_string()), slot.clone());
        slot
    }

    pub fn remove_cascade(&self, cascade: &str) {
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(owner, _), _| owner != cascade);
    }

    pub fn get(&self, cascade: &str, node: &str) -> Option<ScenarioSnapshot> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(cascade.to_string(), node.to_string()))
            .map(|slot| slot.snapshot())
    }

    pub fn snapshots(&self) -> BTreeMap<String, ScenarioSnapshot> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|((cascade, node), slot)| (Self::key(cascade, node), slot.snapshot()))
            .collect()
    }

    /// Ask every scenario to zero its counters on its next frame.
    pub fn request_reset_all(&self) -> usize {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        for slot in slots.values() {
            slot.request_reset();
        }
        slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_scoped_by_cascade() {
        let board = ScenarioBoard::default();
        let slot = board.register("lobby", "count");
        board.register("dock", "count");
        slot.publish(ScenarioSnapshot {
            scenario: "counting_line".into(),
            ..ScenarioSnapshot::default()
        });
        assert_eq!(
            board.get("lobby", "count").map(|s| s.scenario),
            Some("counting_line".to_string())
        );
        board.remove_cascade("lobby");
        assert!(board.get("lobby", "count").is_none());
        assert_eq!(board.snapshots().len(), 1);
    }

    #[test]
    fn removal_matches_the_cascade_name_exactly() {
        let board = ScenarioBoard::default();
        board.register("lobby", "count");
        board.register("lobby/x", "count");
        board.register("lobbyist", "count");
        board.remove_cascade("lobby");
        let keys: Vec<String> = board.snapshots().into_keys().collect();
        assert_eq!(keys, ["lobby/x/count", "lobbyist/count"]);
    }

    #[test]
    fn reset_request_is_consumed_once() {
        let board = ScenarioBoard::default();
        let slot = board.register("c", "n");
        assert_eq!(board.request_reset_all(), 1);
        assert!(slot.take_reset());
        assert!(!slot.take_reset());
    }
}
