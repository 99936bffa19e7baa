use std::collections::BTreeMap;
use std::sync::Arc;

use stratum_core::context::Context;
use stratum_core::error::{Result, StratumError};

use super::router::Router;

/// Terminal marker: routing here stops the executor.
pub const END: &str = "__end__";

/// Outgoing transition of a node. A node has at most one.
#[derive(Clone)]
pub enum Edge {
    /// Unconditional `source -> target`.
    Direct(String),
    /// `source -> router -> {label: target}`.
    Conditional(ConditionalEdge),
}

impl Edge {
    /// Every target this edge can reach, including [`END`].
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Edge::Direct(target) => vec![target.as_str()],
            Edge::Conditional(edge) => {
                let mut targets: Vec<&str> = edge.targets.values().map(String::as_str).collect();
                if let Some(default) = &edge.default {
                    targets.push(default);
                }
                targets.sort_unstable();
                targets.dedup();
                targets
            }
        }
    }
}

/// Router-driven dispatch table.
#[derive(Clone)]
pub struct ConditionalEdge {
    pub router: Arc<dyn Router>,
    /// Label returned by the router -> target node name or [`END`].
    pub targets: BTreeMap<String, String>,
    /// Used when the router returns a label not in `targets`.
    pub default: Option<String>,
}

/// The resolved next hop after a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Router label, for conditional edges.
    pub label: Option<String>,
    /// Next node, or `None` when the run is over.
    pub target: Option<String>,
    /// True if the router's label was not declared and the default was taken.
    pub defaulted: bool,
}

impl Transition {
    pub(crate) fn to(target: &str, label: Option<String>, defaulted: bool) -> Self {
        Self {
            label,
            target: (target != END).then(|| target.to_string()),
            defaulted,
        }
    }

    pub fn end() -> Self {
        Self {
            label: None,
            target: None,
            defaulted: false,
        }
    }
}

impl ConditionalEdge {
    /// Evaluate the router against `ctx` and map its label to a target.
    pub fn resolve(&self, from: &str, ctx: &Context) -> Result<Transition> {
        let label = self.router.route(ctx);
        if let Some(target) = self.targets.get(&label) {
            return Ok(Transition::to(target, Some(label), false));
        }
        match &self.default {
            Some(default) => Ok(Transition::to(default, Some(label), true)),
            None => Err(StratumError::UnknownRouteLabel {
                node: from.to_string(),
                label,
            }),
        }
    }
}
