use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use stratum_core::context::{Classification, Context, DataRequirements, ExecutionPlan};
use stratum_core::error::{Result, StratumError};
use stratum_core::types::{ErrorKind, NodeStatus};

use super::fan_out::FanOut;
use crate::stream::TokenSink;

/// A context key a node may write.
///
/// `AgentResult` and `RetrievedData` are namespaced by node name; the rest
/// are singletons owned by exactly one node of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKey {
    AgentResult,
    RetrievedData,
    Classification,
    DataRequirements,
    ExecutionPlan,
    FinalResponse,
}

impl OutputKey {
    pub fn is_singleton(&self) -> bool {
        !matches!(self, Self::AgentResult | Self::RetrievedData)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentResult => "agent_results",
            Self::RetrievedData => "retrieved_data",
            Self::Classification => "classification",
            Self::DataRequirements => "data_requirements",
            Self::ExecutionPlan => "execution_plan",
            Self::FinalResponse => "final_response",
        }
    }
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partial context update returned by a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub agent_result: Option<serde_json::Value>,
    pub retrieved_data: Option<Vec<serde_json::Value>>,
    pub classification: Option<Classification>,
    pub data_requirements: Option<DataRequirements>,
    pub execution_plan: Option<ExecutionPlan>,
    pub final_response: Option<String>,
    /// Explicit terminal status; derived from the update when absent.
    pub status: Option<NodeStatus>,
}

impl NodeUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, value: serde_json::Value) -> Self {
        self.agent_result = Some(value);
        self
    }

    pub fn with_data(mut self, items: Vec<serde_json::Value>) -> Self {
        self.retrieved_data = Some(items);
        self
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }

    pub fn with_requirements(mut self, requirements: DataRequirements) -> Self {
        self.data_requirements = Some(requirements);
        self
    }

    pub fn with_plan(mut self, plan: ExecutionPlan) -> Self {
        self.execution_plan = Some(plan);
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.final_response = Some(response.into());
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Keys this update writes.
    pub fn written_keys(&self) -> Vec<OutputKey> {
        let mut keys = Vec::new();
        if self.agent_result.is_some() {
            keys.push(OutputKey::AgentResult);
        }
        if self.retrieved_data.is_some() {
            keys.push(OutputKey::RetrievedData);
        }
        if self.classification.is_some() {
            keys.push(OutputKey::Classification);
        }
        if self.data_requirements.is_some() {
            keys.push(OutputKey::DataRequirements);
        }
        if self.execution_plan.is_some() {
            keys.push(OutputKey::ExecutionPlan);
        }
        if self.final_response.is_some() {
            keys.push(OutputKey::FinalResponse);
        }
        keys
    }

    /// Merge into `ctx` under `node`'s ownership and return its terminal status.
    ///
    /// Writes to keys outside `declared` are dropped and logged as ownership
    /// errors. A node that declares `RetrievedData` but returns nothing (or an
    /// empty list) finishes as `CompletedNoData` unless it says otherwise.
    pub fn apply(self, node: &str, declared: &[OutputKey], ctx: &mut Context) -> NodeStatus {
        for key in self.written_keys() {
            if !declared.contains(&key) {
                warn!(node = %node, key = %key, "Dropping write to undeclared key");
                let err = StratumError::OwnershipViolation {
                    node: node.to_string(),
                    key: key.to_string(),
                };
                ctx.record_error(node, err.to_string(), ErrorKind::Ownership);
            }
        }
        let owns = |key: OutputKey| declared.contains(&key);

        let mut has_data = false;
        if let (true, Some(value)) = (owns(OutputKey::AgentResult), self.agent_result) {
            ctx.agent_results.insert(node.to_string(), value);
        }
        if let (true, Some(items)) = (owns(OutputKey::RetrievedData), self.retrieved_data) {
            if !items.is_empty() {
                has_data = true;
                ctx.retrieved_data.insert(node.to_string(), items);
            }
        }
        if let (true, Some(value)) = (owns(OutputKey::Classification), self.classification) {
            ctx.classification = Some(value);
        }
        if let (true, Some(value)) = (owns(OutputKey::DataRequirements), self.data_requirements) {
            ctx.data_requirements = value;
        }
        if let (true, Some(value)) = (owns(OutputKey::ExecutionPlan), self.execution_plan) {
            ctx.execution_plan = Some(value);
        }
        if let (true, Some(value)) = (owns(OutputKey::FinalResponse), self.final_response) {
            ctx.final_response = Some(value);
        }

        match self.status {
            Some(status) if status.is_terminal() => status,
            Some(status) => {
                warn!(node = %node, status = %status, "Ignoring non-terminal status in update");
                derived_status(declared, has_data)
            }
            None => derived_status(declared, has_data),
        }
    }
}

fn derived_status(declared: &[OutputKey], has_data: bool) -> NodeStatus {
    if declared.contains(&OutputKey::RetrievedData) && !has_data {
        NodeStatus::CompletedNoData
    } else {
        NodeStatus::Completed
    }
}

/// Per-invocation handles given to a node.
#[derive(Debug, Clone)]
pub struct NodeEnv {
    pub name: String,
    pub sink: TokenSink,
    pub cancel: CancellationToken,
}

impl NodeEnv {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The contract every unit of work implements.
///
/// Business failures are returned as `Err`; the executor turns them into an
/// error entry and a `Failed` status, never into a run failure. The returned
/// future may only borrow `self`, so copy what is needed out of `ctx` first.
pub trait NodeHandler: Send + Sync + 'static {
    fn invoke(&self, ctx: &Context, env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>>;
}

#[derive(Clone)]
pub enum NodeKind {
    Task(Arc<dyn NodeHandler>),
    FanOut(FanOut),
}

/// A named unit of work registered in a graph.
#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    /// Keys this node may write.
    pub outputs: Vec<OutputKey>,
    /// Node-level time limit.
    pub timeout: Option<Duration>,
}

impl Node {
    /// A task node owning its own `agent_results` slot.
    pub fn task(name: impl Into<String>, handler: impl NodeHandler) -> Self {
        Self::from_arc(name, Arc::new(handler))
    }

    pub fn from_arc(name: impl Into<String>, handler: Arc<dyn NodeHandler>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Task(handler),
            outputs: vec![OutputKey::AgentResult],
            timeout: None,
        }
    }

    /// A data-source node owning its `agent_results` and `retrieved_data` slots.
    pub fn source(name: impl Into<String>, handler: impl NodeHandler) -> Self {
        Self::task(name, handler)
            .with_outputs(vec![OutputKey::AgentResult, OutputKey::RetrievedData])
    }

    pub fn fan_out(name: impl Into<String>, fan_out: FanOut) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::FanOut(fan_out),
            outputs: vec![OutputKey::AgentResult],
            timeout: None,
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<OutputKey>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_output(mut self, key: OutputKey) -> Self {
        if !self.outputs.contains(&key) {
            self.outputs.push(key);
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_fan_out(&self) -> bool {
        matches!(self.kind, NodeKind::FanOut(_))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            NodeKind::Task(_) => "task".to_string(),
            NodeKind::FanOut(fo) => format!("fan_out({})", fo.sub_node_names().join(", ")),
        };
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("outputs", &self.outputs)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// How a single handler invocation ended.
#[derive(Debug)]
pub(crate) enum Invocation {
    Updated(NodeUpdate),
    Failed { message: String, kind: ErrorKind },
}

/// Invoke a handler with its timeout, converting errors and panics.
pub(crate) async fn invoke_guarded(
    handler: &dyn NodeHandler,
    ctx: &Context,
    env: NodeEnv,
    timeout: Option<Duration>,
) -> Invocation {
    let node = env.name.clone();
    // Handlers do synchronous work before boxing their future; guard both parts.
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(ctx, env))) {
        Ok(future) => future,
        Err(panic) => {
            return Invocation::Failed {
                message: panic_message(panic.as_ref()),
                kind: ErrorKind::Panic,
            }
        }
    };
    let call = AssertUnwindSafe(future).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let err = StratumError::NodeTimeout {
                    node,
                    timeout_ms: limit.as_millis() as u64,
                };
                return Invocation::Failed {
                    message: err.to_string(),
                    kind: ErrorKind::Timeout,
                };
            }
        },
        None => call.await,
    };
    match outcome {
        Ok(Ok(update)) => Invocation::Updated(update),
        Ok(Err(e)) => Invocation::Failed {
            message: e.to_string(),
            kind: ErrorKind::Business,
        },
        Err(panic) => Invocation::Failed {
            message: panic_message(panic.as_ref()),
            kind: ErrorKind::Panic,
        },
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
