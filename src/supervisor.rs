//! Owns the running cascades of one process.
//!
//! The supervisor is responsible for:
//! - The coarse status the control plane polls (`init`, `waiting`, `creating`, `running`)
//! - Replacing the whole set of graphs on `apply()`, all or nothing
//! - Reporting element counters and scenario snapshots
//!
//! The supervisor MUST NOT:
//! - Report an error state for frames dropped by a running graph
//! - Leave a partially started set of graphs running after a failed `apply()`

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::cascade::CascadeConfig;
use crate::context::RuntimeContext;
use crate::error::ConfigError;
use crate::graph::{compile, ElementRegistry, Graph, GraphSnapshot};
use crate::scenario::ScenarioSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Init,
    Waiting,
    Creating,
    Running,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Init => "init",
            PipelineStatus::Waiting => "waiting",
            PipelineStatus::Creating => "creating",
            PipelineStatus::Running => "running",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SupervisorSnapshot {
    pub status: PipelineStatus,
    pub error: Option<String>,
    pub pipelines: Vec<GraphSnapshot>,
    pub scenarios: BTreeMap<String, ScenarioSnapshot>,
}

struct Inner {
    status: PipelineStatus,
    last_error: Option<String>,
    graphs: Vec<Graph>,
}

pub struct Supervisor {
    ctx: RuntimeContext,
    registry: ElementRegistry,
    inner: Mutex<Inner>,
}

impl Supervisor {
    pub fn new(ctx: RuntimeContext, registry: ElementRegistry) -> Self {
        Self {
            ctx,
            registry,
            inner: Mutex::new(Inner {
                status: PipelineStatus::Init,
                last_error: None,
                graphs: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn status(&self) -> PipelineStatus {
        self.lock().status
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Ready for a configuration.
    pub fn mark_waiting(&self) {
        let mut inner = self.lock();
        if inner.status == PipelineStatus::Init {
            inner.status = PipelineStatus::Waiting;
        }
    }

    /// Replace every running cascade with `configs`.
    pub fn apply(&self, configs: &[CascadeConfig]) -> Result<()> {
        let mut inner = self.lock();
        let mut old = std::mem::take(&mut inner.graphs);
        shutdown_all(&mut old);
        drop(old);
        inner.status = PipelineStatus::Creating;
        log::info!("supervisor: creating {} cascade(s)", configs.len());

        match self.build_and_start(configs) {
            Ok(graphs) => {
                inner.graphs = graphs;
                inner.status = PipelineStatus::Running;
                inner.last_error = None;
                Ok(())
            }
            Err(err) => {
                log::error!("supervisor: apply failed: {:#}", err);
                inner.status = PipelineStatus::Waiting;
                inner.last_error = Some(format!("{:#}", err));
                Err(err)
            }
        }
    }

    /// Graphs compiled before a failure are dropped here, which also clears
    /// their scenario board slots.
    fn build_and_start(&self, configs: &[CascadeConfig]) -> Result<Vec<Graph>> {
        check_names(configs)?;
        let mut graphs = Vec::with_capacity(configs.len());
        for cfg in configs {
            graphs.push(compile(cfg, &self.registry, &self.ctx)?);
        }
        for i in 0..graphs.len() {
            if let Err(err) = graphs[i].start() {
                shutdown_all(&mut graphs[..i]);
                return Err(err);
            }
        }
        Ok(graphs)
    }

    /// Stop every cascade and wait for its workers.
    pub fn stop(&self) {
        let mut inner = self.lock();
        shutdown_all(&mut inner.graphs);
        inner.graphs.clear();
        inner.status = PipelineStatus::Waiting;
    }

    /// Names of cascades whose elements have all exited.
    pub fn finished(&self) -> Vec<String> {
        self.lock()
            .graphs
            .iter()
            .filter(|g| g.is_finished())
            .map(|g| g.name().to_string())
            .collect()
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        let inner = self.lock();
        SupervisorSnapshot {
            status: inner.status,
            error: inner.last_error.clone(),
            pipelines: inner.graphs.iter().map(Graph::snapshot).collect(),
            scenarios: self.ctx.scenarios.snapshots(),
        }
    }

    /// Ask every scenario to zero its counters. Returns how many were asked.
    pub fn reset_metrics(&self) -> usize {
        let count = self.ctx.scenarios.request_reset_all();
        log::info!("supervisor: reset requested for {} scenario(s)", count);
        count
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        shutdown_all(&mut inner.graphs);
    }
}

/// Names key the scenario board: non-empty, no `/`, unique within one apply.
fn check_names(configs: &[CascadeConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for cfg in configs {
        let reason = if cfg.name.trim().is_empty() {
            "cascade name is required"
        } else if cfg.name.contains('/') {
            "cascade name must not contain '/'"
        } else if !seen.insert(cfg.name.as_str()) {
            "cascade name is used more than once"
        } else {
            continue;
        };
        return Err(ConfigError::InvalidCascadeName {
            name: cfg.name.clone(),
            reason: reason.to_string(),
        });
    }
    Ok(())
}

fn shutdown_all(graphs: &mut [Graph]) {
    for graph in graphs.iter_mut() {
        if let Err(err) = graph.shutdown() {
            log::warn!("supervisor: cascade '{}' shutdown: {:#}", graph.name(), err);
        }
    }
}
