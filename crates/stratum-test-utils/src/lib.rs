//! Mock nodes, event recorders, and fixtures shared by stratum tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use stratum_core::config::StratumConfig;
use stratum_core::context::{Context, ExecutionPlan};
use stratum_core::error::{Result, StratumError};
use stratum_core::event::EventHandler;
use stratum_core::types::{CorrelationId, EventKind, GraphEvent, NodeStatus};
use stratum_graph::checkpoint::SqliteCheckpointStore;
use stratum_graph::graph::{NodeEnv, NodeHandler, NodeUpdate};

/// Returns a fixed `agent_results` value.
pub struct StaticNode(pub Value);

impl NodeHandler for StaticNode {
    fn invoke(&self, _ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        Box::pin(async move { Ok(NodeUpdate::new().with_result(self.0.clone())) })
    }
}

/// A data source returning fixed items. Use with `Node::source`.
pub struct DataNode(pub Vec<Value>);

impl NodeHandler for DataNode {
    fn invoke(&self, _ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        Box::pin(async move {
            Ok(NodeUpdate::new()
                .with_result(Value::from(self.0.len()))
                .with_data(self.0.clone()))
        })
    }
}

/// A data source that finds nothing.
pub struct EmptyNode;

impl NodeHandler for EmptyNode {
    fn invoke(&self, _ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        Box::pin(async { Ok(NodeUpdate::new().with_data(Vec::new())) })
    }
}

/// Always fails with a business error.
pub struct FailingNode(pub &'static str);

impl NodeHandler for FailingNode {
    fn invoke(&self, _ctx: &Context, env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        Box::pin(async move { Err(StratumError::node(env.name, self.0)) })
    }
}

/// Panics inside the node future.
pub struct PanicNode;

impl NodeHandler for PanicNode {
    fn invoke(&self, _ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        Box::pin(async {
            let items: Vec<Value> = Vec::new();
            let first = items[0].clone();
            Ok(NodeUpdate::new().with_result(first))
        })
    }
}

/// Sleeps for the given duration, returning early when the run is stopped.
pub struct SlowNode(pub Duration);

impl NodeHandler for SlowNode {
    fn invoke(&self, _ctx: &Context, env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep(self.0) => Ok(NodeUpdate::new().with_result(Value::from("slept"))),
                _ = env.cancel.cancelled() => Ok(NodeUpdate::new().with_status(NodeStatus::Failed)),
            }
        })
    }
}

/// Writes a fixed execution plan.
pub struct PlanNode(pub Vec<&'static str>);

impl NodeHandler for PlanNode {
    fn invoke(&self, _ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        let order = self.0.iter().map(|s| s.to_string()).collect();
        Box::pin(async move { Ok(NodeUpdate::new().with_plan(ExecutionPlan::new(order))) })
    }
}

/// Streams its tokens, then writes them joined as the final response.
pub struct StreamingNode(pub Vec<&'static str>);

impl NodeHandler for StreamingNode {
    fn invoke(&self, _ctx: &Context, env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        Box::pin(async move {
            let mut text = String::new();
            for token in &self.0 {
                if !env.sink.emit(*token).await {
                    break;
                }
                text.push_str(token);
            }
            Ok(NodeUpdate::new().with_response(text))
        })
    }
}

/// Counts invocations and returns the count as its result.
#[derive(Clone, Default)]
pub struct CountingNode {
    calls: Arc<AtomicUsize>,
}

impl CountingNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NodeHandler for CountingNode {
    fn invoke(&self, _ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move { Ok(NodeUpdate::new().with_result(Value::from(n))) })
    }
}

/// One observed event, reduced to what tests assert on.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub kind: EventKind,
    pub node: Option<String>,
    pub status: Option<NodeStatus>,
    pub correlation_id: CorrelationId,
}

/// Event handler that records every event it sees.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }

    /// Statuses reported for `node`, in event order.
    pub fn statuses(&self, node: &str) -> Vec<NodeStatus> {
        self.events()
            .into_iter()
            .filter(|e| e.node.as_deref() == Some(node))
            .filter_map(|e| e.status)
            .collect()
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, event: &GraphEvent, _ctx: &Context) -> Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push(Recorded {
                kind: event.kind,
                node: event.node.clone(),
                status: event.status,
                correlation_id: event.correlation_id.clone(),
            });
        }
        Ok(())
    }
}

pub fn test_context(id: &str, query: &str) -> Context {
    Context::new(CorrelationId::from_str(id), query)
}

/// Default config with checkpoints and logs pointed inside `dir`.
pub fn test_config(dir: &std::path::Path) -> StratumConfig {
    let mut config = StratumConfig::default();
    config.checkpoint.path = dir.join("checkpoints.db").to_string_lossy().into_owned();
    config
}

/// A file-backed SQLite store in a fresh temp directory.
///
/// Keep the returned `TempDir` alive for as long as the store is used.
pub fn temp_store() -> (tempfile::TempDir, SqliteCheckpointStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteCheckpointStore::open(&dir.path().join("checkpoints.db")).expect("open store");
    (dir, store)
}
