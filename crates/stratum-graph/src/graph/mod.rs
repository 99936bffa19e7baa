//! Immutable workflow graphs.
//!
//! A workflow is a set of named [`Node`]s, an entry point, and at most one
//! outgoing [`Edge`] per node: either a direct hop or a router-driven
//! dispatch table. Graphs are assembled with [`GraphBuilder`], validated
//! once in [`GraphBuilder::build`], and never modified afterwards.

pub mod edge;
pub mod executor;
pub mod fan_out;
pub mod node;
pub mod router;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use stratum_core::context::Context;
use stratum_core::error::{Result, StratumError};

pub use edge::{ConditionalEdge, Edge, Transition, END};
pub use executor::{Executor, RunOutcome, RunReport};
pub use fan_out::FanOut;
pub use node::{Node, NodeEnv, NodeHandler, NodeKind, NodeUpdate, OutputKey};
pub use router::{PriorityRouter, Router};

/// A validated, frozen workflow definition.
pub struct Graph {
    name: String,
    entry: String,
    /// Registration order, kept for stable rendering.
    order: Vec<String>,
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn edge(&self, from: &str) -> Option<&Edge> {
        self.edges.get(from)
    }

    /// Nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|name| self.nodes.get(name))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolve the next hop after `from`. A node without an edge ends the run.
    pub fn next(&self, from: &str, ctx: &Context) -> Result<Transition> {
        match self.edges.get(from) {
            None => Ok(Transition::end()),
            Some(Edge::Direct(target)) => Ok(Transition::to(target, None, false)),
            Some(Edge::Conditional(edge)) => edge.resolve(from, ctx),
        }
    }

    /// Render as Graphviz DOT. Fan-out sub-nodes are drawn as a cluster.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", self.name);
        let _ = writeln!(out, "  rankdir=LR;");
        let _ = writeln!(out, "  \"{}\" [shape=doublecircle];", END);
        for node in self.nodes() {
            let shape = if node.name == self.entry { "box, style=bold" } else { "box" };
            let _ = writeln!(out, "  \"{}\" [shape={}];", node.name, shape);
            if let NodeKind::FanOut(fan_out) = &node.kind {
                let _ = writeln!(out, "  subgraph \"cluster_{}\" {{", node.name);
                for sub in fan_out.sub_nodes() {
                    let _ = writeln!(out, "    \"{}\" [shape=ellipse];", sub.name);
                }
                let _ = writeln!(out, "  }}");
                for sub in fan_out.sub_nodes() {
                    let _ = writeln!(out, "  \"{}\" -> \"{}\" [style=dotted];", node.name, sub.name);
                }
            }
        }
        for name in &self.order {
            match self.edges.get(name) {
                Some(Edge::Direct(target)) => {
                    let _ = writeln!(out, "  \"{}\" -> \"{}\";", name, target);
                }
                Some(Edge::Conditional(edge)) => {
                    for (label, target) in &edge.targets {
                        let _ = writeln!(out, "  \"{}\" -> \"{}\" [label=\"{}\"];", name, target, label);
                    }
                    if let Some(default) = &edge.default {
                        let _ = writeln!(
                            out,
                            "  \"{}\" -> \"{}\" [label=\"*\", style=dashed];",
                            name, default
                        );
                    }
                }
                None => {}
            }
        }
        out.push_str("}\n");
        out
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("nodes", &self.order)
            .finish()
    }
}

/// Collects nodes and edges, then validates them into a [`Graph`].
pub struct GraphBuilder {
    name: String,
    entry: Option<String>,
    nodes: Vec<Node>,
    edges: Vec<(String, Edge)>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn fan_out(self, name: impl Into<String>, fan_out: FanOut) -> Self {
        self.node(Node::fan_out(name, fan_out))
    }

    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Unconditional edge. Use [`END`] as `to` to finish the run.
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), Edge::Direct(to.into())));
        self
    }

    /// Router-driven edge. `targets` maps labels to node names or [`END`].
    pub fn conditional<L, T>(
        mut self,
        from: impl Into<String>,
        router: impl Router + 'static,
        targets: impl IntoIterator<Item = (L, T)>,
        default: Option<&str>,
    ) -> Self
    where
        L: Into<String>,
        T: Into<String>,
    {
        let edge = ConditionalEdge {
            router: Arc::new(router),
            targets: targets
                .into_iter()
                .map(|(label, target)| (label.into(), target.into()))
                .collect::<BTreeMap<_, _>>(),
            default: default.map(str::to_string),
        };
        self.edges.push((from.into(), Edge::Conditional(edge)));
        self
    }

    pub fn build(self) -> Result<Graph> {
        let invalid = |msg: String| Err(StratumError::InvalidGraph(msg));

        let mut nodes = HashMap::new();
        let mut order = Vec::new();
        for node in self.nodes {
            if node.name == END || node.name.is_empty() {
                return invalid(format!("'{}' is not a valid node name", node.name));
            }
            if nodes.contains_key(&node.name) {
                return invalid(format!("duplicate node '{}'", node.name));
            }
            order.push(node.name.clone());
            nodes.insert(node.name.clone(), node);
        }

        let Some(entry) = self.entry else {
            return invalid("no entry node".into());
        };
        if !nodes.contains_key(&entry) {
            return invalid(format!("entry node '{}' does not exist", entry));
        }

        // Sub-node names share the status namespace with graph nodes.
        let mut all_names: HashSet<String> = nodes.keys().cloned().collect();
        for node in order.iter().filter_map(|n| nodes.get(n)) {
            if let NodeKind::FanOut(fan_out) = &node.kind {
                if fan_out.sub_nodes().is_empty() {
                    return invalid(format!("fan-out '{}' has no sub-nodes", node.name));
                }
                for sub in fan_out.sub_nodes() {
                    if sub.is_fan_out() {
                        return invalid(format!(
                            "fan-out '{}' contains nested fan-out '{}'",
                            node.name, sub.name
                        ));
                    }
                    if !all_names.insert(sub.name.clone()) {
                        return invalid(format!(
                            "sub-node '{}' of '{}' collides with another node",
                            sub.name, node.name
                        ));
                    }
                }
            }
        }

        // Singleton keys must have exactly one writer across the graph.
        let mut owners: HashMap<OutputKey, String> = HashMap::new();
        let writers = order.iter().filter_map(|n| nodes.get(n)).flat_map(|node| {
            let subs: Vec<&Node> = match &node.kind {
                NodeKind::FanOut(fan_out) => fan_out.sub_nodes().iter().collect(),
                NodeKind::Task(_) => Vec::new(),
            };
            std::iter::once(node).chain(subs)
        });
        for node in writers {
            for key in node.outputs.iter().filter(|k| k.is_singleton()) {
                if let Some(owner) = owners.insert(*key, node.name.clone()) {
                    if owner != node.name {
                        return invalid(format!(
                            "output key '{}' declared by both '{}' and '{}'",
                            key, owner, node.name
                        ));
                    }
                }
            }
        }

        let mut edges = HashMap::new();
        for (from, edge) in self.edges {
            if !nodes.contains_key(&from) {
                return invalid(format!("edge from unknown node '{}'", from));
            }
            if edges.contains_key(&from) {
                return invalid(format!("node '{}' has more than one outgoing edge", from));
            }
            for target in edge.targets() {
                if target != END && !nodes.contains_key(target) {
                    return invalid(format!("edge '{}' -> unknown node '{}'", from, target));
                }
            }
            if let Edge::Conditional(cond) = &edge {
                if cond.targets.is_empty() {
                    return invalid(format!("conditional edge at '{}' has no targets", from));
                }
                if !edge.targets().contains(&END) {
                    return invalid(format!(
                        "conditional edge at '{}' has no terminal target",
                        from
                    ));
                }
            }
            edges.insert(from, edge);
        }

        Ok(Graph {
            name: self.name,
            entry,
            order,
            nodes,
            edges,
        })
    }
}
