//! Cascade pipeline runtime
//!
//! Runs declarative video-analytics cascades: a DAG of sources, models,
//! transforms and export sinks, each on its own thread and connected by
//! bounded queues.
//!
//! # Architecture
//!
//! 1. **Compile before start**: `graph::compile` validates and builds every
//!    element of a cascade; nothing runs until the whole graph exists.
//! 2. **Backpressure inside, drop at the edge**: in-pipeline queues block their
//!    producer, sink delivery queues drop and count.
//! 3. **One writer per scenario**: counters belong to the transform thread that
//!    updates them; readers get snapshots from the scenario board.
//! 4. **No process globals**: external collaborators live in `RuntimeContext`.
//!
//! # Module Structure
//!
//! - `cascade`: configuration types and typed parameter access
//! - `frame`: Image, Bbox, ObjectMeta, Frame
//! - `element`: element runtime (threads, queues, lifecycle)
//! - `graph`: compiler, element registry, graph lifecycle
//! - `ingest`, `model`, `transform`, `export`: built-in elements
//! - `scenario`: counting lines, zones, tracker, detection history
//! - `supervisor`, `api`, `config`: daemon plumbing

pub mod api;
pub mod cascade;
pub mod config;
pub mod context;
pub mod element;
pub mod error;
pub mod export;
pub mod frame;
pub mod graph;
pub mod ingest;
pub mod model;
pub mod scenario;
pub mod supervisor;
pub mod transform;

pub use cascade::{CascadeConfig, EdgeConfig, Identity, NodeConfig, NodeType};
pub use context::{RuntimeContext, ScenarioBoard};
pub use element::{ElementState, Export, Flow, QueuePolicy, Source, Stage, Transform};
pub use error::{ConfigError, ProtocolError};
pub use frame::{Attribute, Bbox, Frame, Image, InsightsMeta, ObjectMeta, ScenarioInsight};
pub use graph::{compile, ElementRegistry, Graph, NodeContext};
pub use supervisor::{PipelineStatus, Supervisor};
