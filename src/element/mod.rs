//! Element runtime.
//!
//! An element is one stage of a compiled cascade: a worker thread, an optional
//! bounded input queue, and the queue handles of its children.
//!
//! - Sources have no input queue; their loop calls `next_frame()` and fans out.
//! - Transforms and models pull from their queue, call `process()`, fan out.
//! - Exports pull from their queue and call `process()`; they have no children.
//!
//! The element runtime is responsible for:
//! - Lifecycle `Created -> Running -> Stopping -> Stopped`
//! - Catching `process()` failures (errors and panics) at the loop boundary
//! - Enforcing the per-queue full policy (block with a stop check, or drop)
//! - Retrying source reads with backoff
//!
//! The element runtime MUST NOT:
//! - Hand the same frame instance to two children
//! - Stop a loop in the middle of `process()`

mod backoff;

pub use backoff::Backoff;

use anyhow::{anyhow, Result};
use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cascade::NodeType;
use crate::frame::Frame;

/// Input queue depth when a node does not set `queue_size`.
pub const DEFAULT_QUEUE_SIZE: usize = 2;

/// How long a blocked send or an idle receive waits before re-checking the running flag.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Log one line per this many drops on the same queue.
const DROP_LOG_EVERY: u64 = 100;

/// Produces frames. `Ok(None)` means end of stream.
pub trait Source: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Release capture resources when the loop exits.
    fn close(&mut self) {}
}

/// What a transform decided about the frame it just processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Forward,
    Discard,
}

/// Mutates a frame in place. Models implement this too.
pub trait Transform: Send {
    fn process(&mut self, frame: &mut Frame) -> Result<Flow>;
}

/// Terminal consumer. `process()` must return quickly; slow I/O belongs on a delivery thread.
pub trait Export: Send {
    fn process(&mut self, frame: Frame) -> Result<()>;

    /// Called once when the loop exits. Sinks close their delivery queues here.
    fn finish(&mut self) {}
}

pub enum Stage {
    Source(Box<dyn Source>),
    Transform(Box<dyn Transform>),
    Export(Box<dyn Export>),
}

impl Stage {
    pub fn source(source: impl Source + 'static) -> Self {
        Stage::Source(Box::new(source))
    }

    pub fn transform(transform: impl Transform + 'static) -> Self {
        Stage::Transform(Box::new(transform))
    }

    pub fn export(export: impl Export + 'static) -> Self {
        Stage::Export(Box::new(export))
    }

    /// Whether this stage can back a node of `node_type`.
    pub fn fits(&self, node_type: NodeType) -> bool {
        matches!(
            (self, node_type),
            (Stage::Source(_), NodeType::Source)
                | (Stage::Transform(_), NodeType::Transform)
                | (Stage::Transform(_), NodeType::Model)
                | (Stage::Export(_), NodeType::Export)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ElementState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ElementState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ElementState::Created,
            1 => ElementState::Running,
            2 => ElementState::Stopping,
            _ => ElementState::Stopped,
        }
    }
}

/// Full-queue behaviour for a child's input queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// Wait for space, re-checking the producer's running flag.
    #[default]
    Block,
    /// Drop the frame and count it.
    Drop,
}

impl QueuePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" => Some(QueuePolicy::Block),
            "drop" => Some(QueuePolicy::Drop),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ElementStats {
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub dropped: AtomicU64,
    pub errors: AtomicU64,
}

/// Point-in-time copy of an element's counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ElementSnapshot {
    pub id: String,
    pub name: String,
    pub kind: NodeType,
    pub state: ElementState,
    pub children: Vec<String>,
    pub frames_in: u64,
    pub frames_out: u64,
    pub dropped: u64,
    pub errors: u64,
}

/// A parent's handle on one child's input queue.
#[derive(Clone)]
pub struct ChildLink {
    id: String,
    tx: Sender<Frame>,
    policy: QueuePolicy,
    stats: Arc<ElementStats>,
}

impl ChildLink {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hand `frame` to the child. Returns false when the frame was dropped or the
    /// child is gone. A blocked send gives up once `producer_running` clears.
    pub fn send(&self, frame: Frame, producer_running: &AtomicBool) -> bool {
        match self.policy {
            QueuePolicy::Drop => match self.tx.try_send(frame) {
                Ok(()) => true,
                Err(TrySendError::Full(frame)) => {
                    self.note_drop(frame.frame_id, "queue full");
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
            QueuePolicy::Block => {
                let mut pending = frame;
                loop {
                    match self.tx.send_timeout(pending, POLL_INTERVAL) {
                        Ok(()) => return true,
                        Err(SendTimeoutError::Timeout(frame)) => {
                            if !producer_running.load(Ordering::SeqCst) {
                                self.note_drop(frame.frame_id, "producer stopping");
                                return false;
                            }
                            pending = frame;
                        }
                        Err(SendTimeoutError::Disconnected(_)) => return false,
                    }
                }
            }
        }
    }

    fn note_drop(&self, frame_id: u64, reason: &str) {
        let count = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 || count % DROP_LOG_EVERY == 0 {
            log::warn!(
                "{}: dropped frame {} ({}); {} dropped so far",
                self.id,
                frame_id,
                reason,
                count
            );
        }
    }
}

/// Deliver to every child. All but the last receive a deep copy; the last receives the original.
fn fan_out(children: &[ChildLink], frame: Frame, running: &AtomicBool) -> u64 {
    let Some((last, rest)) = children.split_last() else {
        return 0;
    };
    let mut delivered = 0;
    for child in rest {
        if child.send(frame.clone(), running) {
            delivered += 1;
        }
    }
    if last.send(frame, running) {
        delivered += 1;
    }
    delivered
}

pub struct Element {
    id: String,
    name: String,
    kind: NodeType,
    state: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
    stats: Arc<ElementStats>,
    inbox: Option<(Sender<Frame>, Receiver<Frame>)>,
    policy: QueuePolicy,
    children: Vec<ChildLink>,
    child_ids: Vec<String>,
    stage: Option<Stage>,
    handle: Option<JoinHandle<()>>,
}

impl Element {
    pub fn new(
        id: &str,
        name: &str,
        kind: NodeType,
        stage: Stage,
        queue_size: usize,
        policy: QueuePolicy,
    ) -> Self {
        let inbox = match stage {
            Stage::Source(_) => None,
            _ => Some(bounded(queue_size.max(1))),
        };
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            state: Arc::new(AtomicU8::new(ElementState::Created as u8)),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ElementStats::default()),
            inbox,
            policy,
            children: Vec::new(),
            child_ids: Vec::new(),
            stage: Some(stage),
            handle: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeType {
        self.kind
    }

    pub fn state(&self) -> ElementState {
        ElementState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn children(&self) -> &[String] {
        &self.child_ids
    }

    /// Handle a parent uses to feed this element. `None` for sources, and after start.
    pub fn link(&self) -> Option<ChildLink> {
        self.inbox.as_ref().map(|(tx, _)| ChildLink {
            id: self.id.clone(),
            tx: tx.clone(),
            policy: self.policy,
            stats: self.stats.clone(),
        })
    }

    pub fn add_child(&mut self, link: ChildLink) -> Result<()> {
        if matches!(self.stage, Some(Stage::Export(_))) {
            return Err(anyhow!("export '{}' cannot have children", self.id));
        }
        if self.state() != ElementState::Created {
            return Err(anyhow!("element '{}' is already started", self.id));
        }
        self.child_ids.push(link.id.clone());
        self.children.push(link);
        Ok(())
    }

    pub fn snapshot(&self) -> ElementSnapshot {
        ElementSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            state: self.state(),
            children: self.child_ids.clone(),
            frames_in: self.stats.frames_in.load(Ordering::Relaxed),
            frames_out: self.stats.frames_out.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }

    /// Spawn the worker thread. The element's own copy of its queue sender is
    /// released here, so the queue disconnects once every parent has exited.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != ElementState::Created {
            return Err(anyhow!("element '{}' cannot be started twice", self.id));
        }
        let stage = self
            .stage
            .take()
            .ok_or_else(|| anyhow!("element '{}' has no stage", self.id))?;
        let inbox = self.inbox.take().map(|(_, rx)| rx);
        let worker = Worker {
            id: self.id.clone(),
            running: self.running.clone(),
            state: self.state.clone(),
            stats: self.stats.clone(),
            children: std::mem::take(&mut self.children),
        };

        self.running.store(true, Ordering::SeqCst);
        self.state
            .store(ElementState::Running as u8, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name(format!("element-{}", self.id))
            .spawn(move || worker.run(stage, inbox));
        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                log::info!("{}: started ({} '{}')", self.id, self.kind, self.name);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                self.state
                    .store(ElementState::Stopped as u8, Ordering::SeqCst);
                Err(anyhow!("failed to spawn element '{}': {}", self.id, err))
            }
        }
    }

    /// Ask the loop to exit after its current unit of work.
    pub fn stop(&self) {
        let _ = self.state.compare_exchange(
            ElementState::Running as u8,
            ElementState::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _ = self.state.compare_exchange(
            ElementState::Created as u8,
            ElementState::Stopped as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.running.store(false, Ordering::SeqCst);
    }

    /// Block until the worker thread has exited.
    pub fn join(&mut self) -> Result<()> {
        let result = match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("element '{}' worker thread panicked", self.id)),
            None => Ok(()),
        };
        self.state
            .store(ElementState::Stopped as u8, Ordering::SeqCst);
        result
    }
}

impl Drop for Element {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
            let _ = self.join();
        }
    }
}

struct Worker {
    id: String,
    running: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    stats: Arc<ElementStats>,
    children: Vec<ChildLink>,
}

impl Worker {
    fn run(self, stage: Stage, inbox: Option<Receiver<Frame>>) {
        match (stage, inbox) {
            (Stage::Source(source), _) => self.source_loop(source),
            (Stage::Transform(transform), Some(rx)) => self.transform_loop(transform, rx),
            (Stage::Export(export), Some(rx)) => self.export_loop(export, rx),
            (_, None) => log::error!("{}: element has no input queue", self.id),
        }
        self.state
            .store(ElementState::Stopped as u8, Ordering::SeqCst);
        log::info!(
            "{}: exited (in={}, out={}, dropped={}, errors={})",
            self.id,
            self.stats.frames_in.load(Ordering::Relaxed),
            self.stats.frames_out.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed),
            self.stats.errors.load(Ordering::Relaxed)
        );
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn forward(&self, frame: Frame) {
        let delivered = fan_out(&self.children, frame, &self.running);
        self.stats.frames_out.fetch_add(delivered, Ordering::Relaxed);
    }

    fn record_error(&self, frame_id: u64, message: &str) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        log::warn!("{}: dropping frame {}: {}", self.id, frame_id, message);
    }

    fn source_loop(&self, mut source: Box<dyn Source>) {
        let mut backoff = Backoff::default();
        while self.is_running() {
            let outcome = catch_unwind(AssertUnwindSafe(|| source.next_frame()));
            match outcome {
                Ok(Ok(Some(frame))) => {
                    backoff.reset();
                    self.stats.frames_in.fetch_add(1, Ordering::Relaxed);
                    self.forward(frame);
                }
                Ok(Ok(None)) => {
                    log::info!("{}: end of stream", self.id);
                    break;
                }
                Ok(Err(err)) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff.next_delay();
                    log::warn!(
                        "{}: frame read failed: {:#}; retrying in {:?}",
                        self.id,
                        err,
                        delay
                    );
                    backoff::sleep_while(&self.running, delay);
                }
                Err(_) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff.next_delay();
                    log::error!("{}: frame read panicked; retrying in {:?}", self.id, delay);
                    backoff::sleep_while(&self.running, delay);
                }
            }
        }
        source.close();
    }

    fn transform_loop(&self, mut transform: Box<dyn Transform>, rx: Receiver<Frame>) {
        while self.is_running() {
            let mut frame = match rx.recv_timeout(POLL_INTERVAL) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            self.stats.frames_in.fetch_add(1, Ordering::Relaxed);
            let outcome = catch_unwind(AssertUnwindSafe(|| transform.process(&mut frame)));
            match outcome {
                Ok(Ok(Flow::Forward)) => self.forward(frame),
                Ok(Ok(Flow::Discard)) => {}
                Ok(Err(err)) => self.record_error(frame.frame_id, &format!("{:#}", err)),
                Err(_) => self.record_error(frame.frame_id, "process() panicked"),
            }
        }
    }

    fn export_loop(&self, mut export: Box<dyn Export>, rx: Receiver<Frame>) {
        while self.is_running() {
            let frame = match rx.recv_timeout(POLL_INTERVAL) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            self.stats.frames_in.fetch_add(1, Ordering::Relaxed);
            let frame_id = frame.frame_id;
            let outcome = catch_unwind(AssertUnwindSafe(|| export.process(frame)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => self.record_error(frame_id, &format!("{:#}", err)),
                Err(_) => self.record_error(frame_id, "process() panicked"),
            }
        }
        export.finish();
    }
}
