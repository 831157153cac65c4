use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver};

use cascade_runtime::element::ElementSnapshot;
use cascade_runtime::export::{DeliveryQueue, MqttExport, TelemetryPublisher};
use cascade_runtime::{
    compile, Bbox, CascadeConfig, EdgeConfig, ElementRegistry, ElementState, Export, Flow, Frame,
    Graph, Image, NodeConfig, NodeType, ObjectMeta, RuntimeContext, Stage, Transform,
};

struct Slow {
    delay: Duration,
}

impl Transform for Slow {
    fn process(&mut self, _frame: &mut Frame) -> Result<Flow> {
        std::thread::sleep(self.delay);
        Ok(Flow::Forward)
    }
}

struct SlowSink {
    delay: Duration,
    seen: Arc<AtomicU64>,
}

impl Export for SlowSink {
    fn process(&mut self, _frame: Frame) -> Result<()> {
        std::thread::sleep(self.delay);
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn registry(seen: Arc<AtomicU64>) -> ElementRegistry {
    let mut registry = ElementRegistry::builtin();
    registry.register(NodeType::Transform, "slow", |_| {
        Ok(Stage::transform(Slow {
            delay: Duration::from_millis(2),
        }))
    });
    registry.register(NodeType::Export, "slow_sink", move |_| {
        Ok(Stage::export(SlowSink {
            delay: Duration::from_millis(10),
            seen: seen.clone(),
        }))
    });
    registry
}

#[test]
fn blocking_queues_lose_nothing() {
    let seen = Arc::new(AtomicU64::new(0));
    let cfg = CascadeConfig {
        name: "block".into(),
        nodes: vec![
            NodeConfig::new("cam", NodeType::Source, "synthetic").with("frames", 40),
            NodeConfig::new("slow", NodeType::Transform, "slow").with("queue_size", 1),
            NodeConfig::new("sink", NodeType::Export, "slow_sink").with("queue_size", 1),
        ],
        edges: vec![EdgeConfig::new("cam", "slow"), EdgeConfig::new("slow", "sink")],
        ..CascadeConfig::default()
    };
    let mut graph =
        compile(&cfg, &registry(seen.clone()), &RuntimeContext::new()).expect("compile");
    graph.start().expect("start");
    graph.join().expect("join");

    let stats = graph.snapshot();
    for element in &stats.elements {
        assert_eq!(element.dropped, 0, "{}", element.id);
    }
    let slow = stats.elements.iter().find(|e| e.id == "slow").expect("slow");
    assert_eq!(slow.frames_in, 40);
    assert_eq!(slow.frames_out, 40);
    assert_eq!(seen.load(Ordering::SeqCst), 40);
}

/// Holds every frame until the gate's sender is dropped.
struct GatedSink {
    gate: Receiver<()>,
    seen: Arc<AtomicU64>,
}

impl Export for GatedSink {
    fn process(&mut self, _frame: Frame) -> Result<()> {
        let _ = self.gate.recv();
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn element(graph: &Graph, id: &str) -> ElementSnapshot {
    graph
        .snapshot()
        .elements
        .into_iter()
        .find(|e| e.id == id)
        .expect("element")
}

#[test]
fn drop_policy_sheds_load_without_stalling_the_source() {
    let seen = Arc::new(AtomicU64::new(0));
    let (release, gate) = bounded::<()>(0);
    let mut registry = ElementRegistry::builtin();
    let sink_seen = seen.clone();
    registry.register(NodeType::Export, "gated_sink", move |_| {
        Ok(Stage::export(GatedSink {
            gate: gate.clone(),
            seen: sink_seen.clone(),
        }))
    });
    let cfg = CascadeConfig {
        name: "drop".into(),
        nodes: vec![
            NodeConfig::new("cam", NodeType::Source, "synthetic").with("frames", 40),
            NodeConfig::new("sink", NodeType::Export, "gated_sink")
                .with("queue_size", 1)
                .with("queue_policy", "drop"),
        ],
        edges: vec![EdgeConfig::new("cam", "sink")],
        ..CascadeConfig::default()
    };
    let mut graph = compile(&cfg, &registry, &RuntimeContext::new()).expect("compile");
    graph.start().expect("start");

    // The sink is stuck on its first frame, so only a source that never
    // waits on the sink's queue can run to the end.
    let deadline = Instant::now() + Duration::from_secs(10);
    while element(&graph, "cam").state != ElementState::Stopped && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(element(&graph, "cam").state, ElementState::Stopped);
    assert_eq!(seen.load(Ordering::SeqCst), 0);

    drop(release);
    graph.join().expect("join");

    let sink = element(&graph, "sink");
    assert!(sink.dropped >= 38, "{:?}", sink);
    assert_eq!(sink.frames_in + sink.dropped, 40);
    assert_eq!(seen.load(Ordering::SeqCst), sink.frames_in);
}

#[test]
fn full_delivery_queue_drops_without_blocking() {
    let (release_tx, release_rx) = bounded::<()>(0);
    let mut queue = DeliveryQueue::spawn("stuck", 30, move |_item: u32| {
        let _ = release_rx.recv();
        Ok(())
    })
    .expect("spawn");

    let started = Instant::now();
    for i in 0..40 {
        queue.offer(i);
    }
    // Nothing here waits on the worker; a blocking offer would hang forever.
    assert!(started.elapsed() < Duration::from_secs(5));
    let stats = queue.stats();
    assert_eq!(stats.offered, 40);
    // 30 queued plus at most one taken by the worker.
    assert!(stats.dropped >= 9 && stats.dropped <= 10, "{:?}", stats);

    drop(release_tx);
    queue.close();
    assert_eq!(queue.stats().delivered + queue.stats().dropped, 40);
}

struct Counting(AtomicU64);

impl TelemetryPublisher for Counting {
    fn publish(&self, _topic: &str, _payload: &[u8]) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn telemetry_rate_limit_bounds_messages() {
    let publisher = Arc::new(Counting(AtomicU64::new(0)));
    let mut export =
        MqttExport::new("bus", "t", Duration::from_millis(100), publisher.clone()).expect("export");
    let t0 = Instant::now();
    // 70 frames, 5 ms apart: 345 ms of stream time.
    for frame_id in 0..70u64 {
        let mut frame = Frame::new(Image::synthetic(2, 2, frame_id), frame_id);
        frame
            .insights
            .objects
            .push(ObjectMeta::new("car", 0.9, Bbox::new(0.1, 0.1, 0.1, 0.1)));
        let now = t0 + Duration::from_millis(5 * frame_id);
        export.process_at(frame, now).expect("process");
    }
    export.finish();

    // Accepted at 0, 105, 210 and 315 ms.
    assert_eq!(publisher.0.load(Ordering::SeqCst), 4);
    let elapsed = Duration::from_millis(5 * 69);
    let bound = (elapsed.as_secs_f64() / 0.1).ceil() as u64;
    assert!(publisher.0.load(Ordering::SeqCst) <= bound);
}
