use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::json;

use cascade_runtime::export::{BlobStore, TelemetryMessage, TelemetryPublisher};
use cascade_runtime::{
    compile, CascadeConfig, EdgeConfig, ElementRegistry, NodeConfig, NodeType, RuntimeContext,
};

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
}

impl TelemetryPublisher for Recorder {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
struct MemoryStore {
    paths: Mutex<Vec<String>>,
}

impl BlobStore for MemoryStore {
    fn put(&self, path: &str, _content_type: &str, _bytes: &[u8]) -> Result<String> {
        self.paths.lock().unwrap().push(path.to_string());
        Ok(path.to_string())
    }
}

fn moving_source(frames: u64) -> NodeConfig {
    NodeConfig::new("cam", NodeType::Source, "synthetic")
        .with("frames", frames)
        .with("fps", 0)
        .with(
            "object",
            json!({
                "label": "person",
                "confidence": 0.9,
                "start": {"l": 0.1, "t": 0.1},
                "end": {"l": 0.85, "t": 0.1},
                "w": 0.05,
                "h": 0.05
            }),
        )
}

fn counting_line() -> NodeConfig {
    NodeConfig::new("line", NodeType::Transform, "counting_line").with(
        "lines",
        json!([{"id": "door", "x1": 0.5, "y1": 0.0, "x2": 0.5, "y2": 1.0}]),
    )
}

#[test]
fn one_crossing_yields_one_message_with_count_one() {
    let recorder = Arc::new(Recorder::default());
    let ctx = RuntimeContext::new().with_telemetry(recorder.clone());
    let cfg = CascadeConfig {
        name: "e2e".into(),
        nodes: vec![
            moving_source(100),
            counting_line(),
            NodeConfig::new("bus", NodeType::Export, "mqtt_export").with("delay_buffer", 0),
        ],
        edges: vec![EdgeConfig::new("cam", "line"), EdgeConfig::new("line", "bus")],
        ..CascadeConfig::default()
    };

    let mut graph = compile(&cfg, &ElementRegistry::builtin(), &ctx).expect("compile");
    graph.start().expect("start");
    graph.join().expect("join");

    let snapshot = ctx.scenarios.get("e2e", "line").expect("scenario snapshot");
    assert_eq!(snapshot.counters["door"], 1);
    assert_eq!(snapshot.last_frame_id, Some(99));

    let messages = recorder.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, "mqttmessage");
    let message: TelemetryMessage = serde_json::from_slice(&messages[0].1).expect("payload");
    assert_eq!(message.count, Some(1));
    assert_eq!(message.scenario.as_deref(), Some("counting_line"));
    assert_eq!(message.events.len(), 1);
    assert_eq!(message.objects.len(), 1);

    let stats = graph.snapshot();
    let line = stats.elements.iter().find(|e| e.id == "line").expect("line");
    assert_eq!(line.frames_in, 100);
    assert_eq!(line.frames_out, 100);
    assert_eq!(line.errors, 0);
}

#[test]
fn fan_out_gives_each_branch_every_frame() {
    let recorder = Arc::new(Recorder::default());
    let store = Arc::new(MemoryStore::default());
    let ctx = RuntimeContext::new()
        .with_telemetry(recorder.clone())
        .with_blob_store(store);
    let cfg = CascadeConfig {
        name: "fan".into(),
        nodes: vec![
            moving_source(20),
            NodeConfig::new("detect", NodeType::Model, "fake_model"),
            NodeConfig::new("people", NodeType::Transform, "filter_transform")
                .with("labels", "person")
                .with("confidence_threshold", 0.0),
            NodeConfig::new("bus", NodeType::Export, "mqtt_export").with("delay_buffer", 0),
            NodeConfig::new("clips", NodeType::Export, "video_snippet_export")
                .with("recording_duration", 1),
        ],
        edges: vec![
            EdgeConfig::new("cam", "detect"),
            EdgeConfig::new("detect", "people"),
            EdgeConfig::new("people", "bus"),
            EdgeConfig::new("people", "clips"),
        ],
        ..CascadeConfig::default()
    };

    let mut graph = compile(&cfg, &ElementRegistry::builtin(), &ctx).expect("compile");
    assert_eq!(graph.children_of("people").expect("people"), ["bus", "clips"]);
    graph.start().expect("start");
    graph.join().expect("join");

    let stats = graph.snapshot();
    for id in ["bus", "clips"] {
        let sink = stats.elements.iter().find(|e| e.id == id).expect("sink");
        assert_eq!(sink.frames_in, 20, "{}", id);
    }

    // Synthetic person plus the fake model's person; the cat is filtered out.
    let messages = recorder.messages.lock().unwrap();
    assert_eq!(messages.len(), 20);
    let first: TelemetryMessage = serde_json::from_slice(&messages[0].1).expect("payload");
    assert_eq!(first.objects.len(), 2);
    assert!(first.objects.iter().all(|o| o.label == "person"));
}
