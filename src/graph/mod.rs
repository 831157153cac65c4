//! Graph compiler and executor.
//!
//! `compile()` turns a `CascadeConfig` into a `Graph` of wired, not yet started
//! elements. Nodes are ordered with Kahn's algorithm; among ready nodes the one
//! declared first goes first, so the same configuration always yields the same
//! order and the same startup log.
//!
//! The graph is responsible for:
//! - Rejecting unknown names, duplicate ids, dangling edges and cycles
//! - Constructing every element before any of them starts
//! - Starting children before parents, stopping and joining parents first
//!
//! The graph MUST NOT:
//! - Start a partially built cascade
//! - Leave scenario board entries behind after shutdown

mod registry;

pub use registry::{ElementRegistry, Factory, NodeContext};

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::cascade::CascadeConfig;
use crate::context::{RuntimeContext, ScenarioBoard};
use crate::element::{Element, ElementSnapshot, ElementState, QueuePolicy, DEFAULT_QUEUE_SIZE};
use crate::error::ConfigError;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GraphSnapshot {
    pub name: String,
    pub elements: Vec<ElementSnapshot>,
}

pub struct Graph {
    name: String,
    /// Topological order.
    elements: Vec<Element>,
    board: ScenarioBoard,
    started: bool,
    /// Board slots registered by this graph's scenario nodes are still present.
    on_board: bool,
}

/// Validate `cfg` and build every element in topological order.
pub fn compile(
    cfg: &CascadeConfig,
    registry: &ElementRegistry,
    runtime: &RuntimeContext,
) -> Result<Graph> {
    let order = topological_order(cfg)?;
    let identity = cfg.identity.merged_with(&runtime.identity);

    let built = build_elements(cfg, &order, registry, runtime, &identity);
    match built {
        Ok(elements) => {
            log::info!(
                "cascade '{}': compiled {} elements in order [{}]",
                cfg.name,
                elements.len(),
                elements
                    .iter()
                    .map(Element::id)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            Ok(Graph {
                name: cfg.name.clone(),
                elements,
                board: runtime.scenarios.clone(),
                started: false,
                on_board: true,
            })
        }
        Err(err) => {
            runtime.scenarios.remove_cascade(&cfg.name);
            Err(err)
        }
    }
}

fn build_elements(
    cfg: &CascadeConfig,
    order: &[usize],
    registry: &ElementRegistry,
    runtime: &RuntimeContext,
    identity: &crate::cascade::Identity,
) -> Result<Vec<Element>> {
    let parents = parent_map(cfg);
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut elements: Vec<Element> = Vec::with_capacity(order.len());

    for &index in order {
        let node = &cfg.nodes[index];
        let ctx = NodeContext {
            runtime,
            cascade: &cfg.name,
            identity,
            node,
        };
        let stage = registry.build(&ctx)?;

        let params = node.params();
        let queue_size = params.u64_or("queue_size", DEFAULT_QUEUE_SIZE as u64)? as usize;
        let policy = match params.string("queue_policy") {
            None => QueuePolicy::default(),
            Some(raw) => QueuePolicy::parse(&raw).ok_or_else(|| ConfigError::InvalidParameter {
                node: node.id.clone(),
                key: "queue_policy".to_string(),
                reason: format!("'{}' is not one of block, drop", raw),
            })?,
        };
        let element = Element::new(&node.id, &node.name, node.node_type, stage, queue_size, policy);

        for parent in parents.get(node.id.as_str()).into_iter().flatten() {
            let parent_pos = *position
                .get(parent)
                .ok_or_else(|| anyhow!("parent '{}' of '{}' not built yet", parent, node.id))?;
            let link = element
                .link()
                .ok_or_else(|| anyhow!("'{}' has no input queue", node.id))?;
            elements[parent_pos].add_child(link)?;
            log::info!("cascade '{}': wired {} -> {}", cfg.name, parent, node.id);
        }
        position.insert(node.id.as_str(), elements.len());
        elements.push(element);
    }
    Ok(elements)
}

/// Deduplicated parents per node id, in edge declaration order.
fn parent_map(cfg: &CascadeConfig) -> HashMap<&str, Vec<&str>> {
    let mut parents: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &cfg.edges {
        let entry = parents.entry(edge.target.as_str()).or_default();
        if !entry.contains(&edge.source.as_str()) {
            entry.push(edge.source.as_str());
        }
    }
    parents
}

/// Kahn's algorithm over declaration indices. Ties go to the earliest declared node.
pub fn topological_order(cfg: &CascadeConfig) -> Result<Vec<usize>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, node) in cfg.nodes.iter().enumerate() {
        if index.insert(node.id.as_str(), i).is_some() {
            return Err(ConfigError::DuplicateNodeId(node.id.clone()).into());
        }
    }

    let n = cfg.nodes.len();
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree = vec![0usize; n];
    let mut seen: BTreeSet<(usize, usize)> = BTreeSet::new();
    for edge in &cfg.edges {
        let lookup = |id: &str| {
            index.get(id).copied().ok_or_else(|| ConfigError::UnknownEdgeEndpoint {
                source: edge.source.clone(),
                target: edge.target.clone(),
                missing: id.to_string(),
            })
        };
        let from = lookup(&edge.source)?;
        let to = lookup(&edge.target)?;
        if cfg.nodes[to].node_type == crate::cascade::NodeType::Source {
            return Err(ConfigError::SourceWithInput(edge.target.clone()).into());
        }
        if !seen.insert((from, to)) {
            log::warn!(
                "cascade '{}': duplicate edge {} -> {} ignored",
                cfg.name,
                edge.source,
                edge.target
            );
            continue;
        }
        outgoing[from].push(to);
        in_degree[to] += 1;
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| in_degree[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &next in &outgoing[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() < n {
        let stuck = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| cfg.nodes[i].id.clone())
            .collect();
        return Err(ConfigError::Cycle(stuck).into());
    }
    Ok(order)
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Node ids in topological order.
    pub fn order(&self) -> Vec<&str> {
        self.elements.iter().map(Element::id).collect()
    }

    pub fn children_of(&self, id: &str) -> Option<&[String]> {
        self.elements
            .iter()
            .find(|element| element.id() == id)
            .map(Element::children)
    }

    /// Start children before parents, so nothing is sent to a queue whose consumer
    /// is not running. On failure the already started elements are stopped again.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(anyhow!("cascade '{}' is already started", self.name));
        }
        self.started = true;
        for i in (0..self.elements.len()).rev() {
            if let Err(err) = self.elements[i].start() {
                log::error!("cascade '{}': start failed: {:#}", self.name, err);
                self.stop();
                let _ = self.join();
                return Err(err);
            }
        }
        log::info!("cascade '{}': running", self.name);
        Ok(())
    }

    /// Ask every element to stop, producers first.
    pub fn stop(&self) {
        for element in &self.elements {
            element.stop();
        }
    }

    /// Wait for every worker, producers first. Returns the first join failure.
    pub fn join(&mut self) -> Result<()> {
        let mut first_err = None;
        for element in self.elements.iter_mut() {
            if let Err(err) = element.join() {
                log::error!("cascade '{}': {:#}", self.name, err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop, join, and drop this cascade's scenario board entries.
    pub fn shutdown(&mut self) -> Result<()> {
        self.stop();
        let joined = self.join();
        self.leave_board();
        self.started = false;
        log::info!("cascade '{}': stopped", self.name);
        joined
    }

    fn leave_board(&mut self) {
        if self.on_board {
            self.board.remove_cascade(&self.name);
            self.on_board = false;
        }
    }

    /// True once every element has exited, e.g. after a finite source drained.
    pub fn is_finished(&self) -> bool {
        self.elements
            .iter()
            .all(|element| element.state() == ElementState::Stopped)
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            name: self.name.clone(),
            elements: self.elements.iter().map(Element::snapshot).collect(),
        }
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        if self.started {
            let _ = self.shutdown();
        } else {
            self.leave_board();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::{EdgeConfig, NodeConfig, NodeType};

    fn node(id: &str, node_type: NodeType, name: &str) -> NodeConfig {
        NodeConfig::new(id, node_type, name)
    }

    fn cascade(nodes: Vec<NodeConfig>, edges: &[(&str, &str)]) -> CascadeConfig {
        CascadeConfig {
            name: "test".into(),
            nodes,
            edges: edges.iter().map(|(s, t)| EdgeConfig::new(s, t)).collect(),
            ..CascadeConfig::default()
        }
    }

    #[test]
    fn ties_break_by_declaration_order() {
        let cfg = cascade(
            vec![
                node("sink", NodeType::Export, "x"),
                node("b", NodeType::Source, "x"),
                node("a", NodeType::Source, "x"),
            ],
            &[("a", "sink"), ("b", "sink")],
        );
        let order = topological_order(&cfg).expect("order");
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let cfg = cascade(vec![node("t", NodeType::Transform, "x")], &[("t", "t")]);
        let err = topological_order(&cfg).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::Cycle(vec!["t".into()]))
        );
    }

    #[test]
    fn dangling_edge_names_missing_node() {
        let cfg = cascade(vec![node("a", NodeType::Source, "x")], &[("a", "ghost")]);
        let err = topological_order(&cfg).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownEdgeEndpoint { missing, .. }) if missing == "ghost"
        ));
    }

    #[test]
    fn source_cannot_be_a_target() {
        let cfg = cascade(
            vec![node("a", NodeType::Source, "x"), node("b", NodeType::Source, "x")],
            &[("a", "b")],
        );
        let err = topological_order(&cfg).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::SourceWithInput("b".into()))
        );
    }

    #[test]
    fn duplicate_edges_are_wired_once() {
        let cfg = cascade(
            vec![
                node("src", NodeType::Source, "synthetic").with("frames", 1),
                node("f", NodeType::Transform, "filter_transform"),
            ],
            &[("src", "f"), ("src", "f")],
        );
        let graph = compile(&cfg, &ElementRegistry::builtin(), &RuntimeContext::default())
            .expect("compile");
        assert_eq!(graph.children_of("src"), Some(&["f".to_string()][..]));
    }

    #[test]
    fn bad_queue_policy_is_config_error() {
        let cfg = cascade(
            vec![node("f", NodeType::Transform, "filter_transform").with("queue_policy", "maybe")],
            &[],
        );
        let err = compile(&cfg, &ElementRegistry::builtin(), &RuntimeContext::default())
            .err()
            .expect("invalid policy");
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidParameter { key, .. }) if key == "queue_policy"
        ));
    }

    fn counting(name: &str) -> CascadeConfig {
        CascadeConfig {
            name: name.into(),
            nodes: vec![
                node("cam", NodeType::Source, "synthetic").with("frames", 1),
                node("line", NodeType::Transform, "counting_line")
                    .with("lines", r#"[{"id":"door","x1":0.5,"y1":0.0,"x2":0.5,"y2":1.0}]"#),
            ],
            edges: vec![EdgeConfig::new("cam", "line")],
            ..CascadeConfig::default()
        }
    }

    #[test]
    fn dropping_an_unstarted_graph_clears_its_board_slots() {
        let ctx = RuntimeContext::default();
        let graph =
            compile(&counting("lobby"), &ElementRegistry::builtin(), &ctx).expect("compile");
        assert!(ctx.scenarios.get("lobby", "line").is_some());
        drop(graph);
        assert!(ctx.scenarios.snapshots().is_empty());
    }

    #[test]
    fn shutdown_then_drop_leaves_a_newer_graph_alone() {
        let ctx = RuntimeContext::default();
        let registry = ElementRegistry::builtin();
        let mut old = compile(&counting("lobby"), &registry, &ctx).expect("compile");
        old.start().expect("start");
        old.shutdown().expect("shutdown");
        let _new = compile(&counting("lobby"), &registry, &ctx).expect("compile");
        drop(old);
        assert!(ctx.scenarios.get("lobby", "line").is_some());
    }
}
