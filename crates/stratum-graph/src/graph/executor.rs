use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use stratum_core::config::{ExecutorConfig, RoutingConfig};
use stratum_core::context::Context;
use stratum_core::error::StratumError;
use stratum_core::event::EventBus;
use stratum_core::types::{ErrorKind, EventKind, GraphEvent, NodeStatus};

use super::fan_out::FanOut;
use super::node::{invoke_guarded, Invocation, Node, NodeEnv, NodeKind, NodeUpdate};
use super::Graph;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::stream::RunControl;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The terminal marker was reached.
    Completed,
    /// The stop flag was observed between steps.
    Stopped,
    /// A structural violation ended the run early.
    Aborted { reason: String },
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Aborted { .. } => "aborted",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aborted { reason } => write!(f, "aborted: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Result of executing a graph. The context is always present, even when
/// the run was stopped or aborted.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub context: Context,
    pub outcome: RunOutcome,
    /// Nodes invoked during this call.
    pub steps: usize,
    /// Node names in invocation order.
    pub path: Vec<String>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

/// Walks a [`Graph`] from its entry point (or a checkpoint), invoking nodes,
/// merging their updates, evaluating routers, and checkpointing every step.
pub struct Executor {
    config: ExecutorConfig,
    routing: RoutingConfig,
    bus: Arc<EventBus>,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            routing: RoutingConfig::default(),
            bus,
            store: None,
        }
    }

    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `graph` from its entry node.
    pub async fn run(&self, graph: &Graph, ctx: Context, control: RunControl) -> RunReport {
        let entry = graph.entry().to_string();
        self.walk(graph, ctx, entry, None, 0, control).await
    }

    /// Continue a run from the successor recorded in `checkpoint`.
    ///
    /// A checkpoint of a finished run returns immediately as completed.
    pub async fn resume(
        &self,
        graph: &Graph,
        checkpoint: Checkpoint,
        control: RunControl,
    ) -> RunReport {
        if checkpoint.graph != graph.name() {
            warn!(
                checkpoint_graph = %checkpoint.graph,
                graph = %graph.name(),
                "Resuming checkpoint taken on a different graph"
            );
        }
        let Some(next) = checkpoint.next_node else {
            info!(
                correlation_id = %checkpoint.correlation_id,
                "Checkpoint already finished, nothing to resume"
            );
            return RunReport {
                context: checkpoint.context,
                outcome: RunOutcome::Completed,
                steps: 0,
                path: Vec::new(),
                elapsed_ms: 0,
            };
        };
        info!(
            correlation_id = %checkpoint.correlation_id,
            next = %next,
            step = checkpoint.step,
            "Resuming from checkpoint"
        );
        self.walk(
            graph,
            checkpoint.context,
            next,
            checkpoint.last_node,
            checkpoint.step,
            control,
        )
        .await
    }

    async fn walk(
        &self,
        graph: &Graph,
        mut ctx: Context,
        start: String,
        mut last: Option<String>,
        mut total_steps: usize,
        control: RunControl,
    ) -> RunReport {
        let started = Instant::now();
        let mut path = Vec::new();
        // Nodes invoked by this call; a terminal status is never reopened
        // within one walk, only by a later resume.
        let mut visited: HashSet<String> = HashSet::new();
        let mut steps = 0usize;
        let mut current = Some(start);

        info!(
            graph = %graph.name(),
            correlation_id = %ctx.correlation_id,
            turn = ctx.turn,
            "Graph run started"
        );
        self.emit(EventKind::GraphStart, graph, None, &ctx, total_steps, None);

        let outcome = loop {
            let Some(name) = current.clone() else {
                break RunOutcome::Completed;
            };

            if control.cancel.is_cancelled() {
                info!(correlation_id = %ctx.correlation_id, next = %name, "Run stopped");
                self.checkpoint(graph, &ctx, last.as_deref(), Some(&name), total_steps)
                    .await;
                break RunOutcome::Stopped;
            }

            if steps >= self.config.max_steps {
                let reason = StratumError::StepLimitExceeded(self.config.max_steps).to_string();
                break self
                    .abort(graph, &mut ctx, &name, reason, last.as_deref(), total_steps)
                    .await;
            }

            let Some(node) = graph.node(&name) else {
                let reason = StratumError::NodeNotFound(name.clone()).to_string();
                break self
                    .abort(graph, &mut ctx, &name, reason, last.as_deref(), total_steps)
                    .await;
            };

            if !visited.insert(name.clone()) {
                let reason = StratumError::StatusRegression {
                    node: name.clone(),
                    from: ctx.status(&name).to_string(),
                    to: NodeStatus::Processing.to_string(),
                }
                .to_string();
                break self
                    .abort(graph, &mut ctx, &name, reason, last.as_deref(), total_steps)
                    .await;
            }

            self.step(graph, node, &mut ctx, &control, total_steps).await;
            steps += 1;
            total_steps += 1;
            path.push(name.clone());
            last = Some(name.clone());

            match graph.next(&name, &ctx) {
                Ok(transition) => {
                    if transition.defaulted {
                        warn!(
                            node = %name,
                            label = transition.label.as_deref().unwrap_or(""),
                            target = transition.target.as_deref().unwrap_or("end"),
                            "Router label not declared, taking default"
                        );
                    } else {
                        debug!(
                            node = %name,
                            label = transition.label.as_deref().unwrap_or(""),
                            target = transition.target.as_deref().unwrap_or("end"),
                            "Routed"
                        );
                    }
                    current = transition.target;
                }
                Err(e) => {
                    break self
                        .abort(graph, &mut ctx, &name, e.to_string(), last.as_deref(), total_steps)
                        .await;
                }
            }

            self.checkpoint(graph, &ctx, last.as_deref(), current.as_deref(), total_steps)
                .await;
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            graph = %graph.name(),
            correlation_id = %ctx.correlation_id,
            outcome = %outcome,
            steps,
            elapsed_ms,
            "Graph run finished"
        );
        self.emit(
            EventKind::GraphEnd,
            graph,
            None,
            &ctx,
            total_steps,
            Some(outcome.to_string()),
        );

        RunReport {
            context: ctx,
            outcome,
            steps,
            path,
            elapsed_ms,
        }
    }

    /// Invoke one node and merge its result.
    async fn step(
        &self,
        graph: &Graph,
        node: &Node,
        ctx: &mut Context,
        control: &RunControl,
        step: usize,
    ) {
        if let Err(e) = ctx.begin_node(&node.name) {
            // Only reachable from a hand-edited or foreign checkpoint.
            warn!(node = %node.name, error = %e, "Node was left processing, restarting it");
            ctx.processing_status
                .insert(node.name.clone(), NodeStatus::Processing);
        }
        self.emit(EventKind::NodeStart, graph, Some(&node.name), ctx, step, None);
        let started = Instant::now();

        let status = match &node.kind {
            NodeKind::Task(handler) => {
                let env = NodeEnv {
                    name: node.name.clone(),
                    sink: control.sink.for_node(&ctx.correlation_id, &node.name),
                    cancel: control.cancel.clone(),
                };
                match invoke_guarded(handler.as_ref(), ctx, env, node.timeout).await {
                    Invocation::Updated(update) => update.apply(&node.name, &node.outputs, ctx),
                    Invocation::Failed { message, kind } => {
                        ctx.record_error(&node.name, message, kind);
                        NodeStatus::Failed
                    }
                }
            }
            NodeKind::FanOut(fan_out) => {
                self.fan_out(graph, node, fan_out, ctx, control, step).await
            }
        };

        if let Err(e) = ctx.finish_node(&node.name, status) {
            warn!(node = %node.name, error = %e, "Could not record node status");
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if status == NodeStatus::Failed {
            let message = last_error(ctx, &node.name);
            warn!(node = %node.name, error = %message, elapsed_ms, "Node failed");
            self.emit(
                EventKind::NodeError,
                graph,
                Some(&node.name),
                ctx,
                step,
                Some(message),
            );
        } else {
            info!(node = %node.name, status = %status, elapsed_ms, "Node finished");
        }
        self.emit(EventKind::NodeEnd, graph, Some(&node.name), ctx, step, None);
    }

    async fn fan_out(
        &self,
        graph: &Graph,
        node: &Node,
        fan_out: &FanOut,
        ctx: &mut Context,
        control: &RunControl,
        step: usize,
    ) -> NodeStatus {
        fan_out.begin(ctx);
        for sub in fan_out.sub_nodes() {
            self.emit(EventKind::NodeStart, graph, Some(&sub.name), ctx, step, None);
        }

        let snapshot = Arc::new(ctx.clone());
        let results = fan_out
            .invoke_all(
                snapshot,
                &control.cancel,
                &control.sink,
                self.config.max_concurrency,
            )
            .await;
        let summary = fan_out.merge(&node.name, results, ctx, self.routing.min_usable_sources);

        for sub in fan_out.sub_nodes() {
            if ctx.status(&sub.name) == NodeStatus::Failed {
                let message = last_error(ctx, &sub.name);
                self.emit(
                    EventKind::NodeError,
                    graph,
                    Some(&sub.name),
                    ctx,
                    step,
                    Some(message),
                );
            }
            self.emit(EventKind::NodeEnd, graph, Some(&sub.name), ctx, step, None);
        }

        let record = serde_json::to_value(&summary).unwrap_or_default();
        NodeUpdate::new()
            .with_result(record)
            .apply(&node.name, &node.outputs, ctx);

        if summary.usable_data {
            NodeStatus::Completed
        } else {
            NodeStatus::CompletedNoData
        }
    }

    /// Record a structural error, checkpoint, and produce the aborted outcome.
    async fn abort(
        &self,
        graph: &Graph,
        ctx: &mut Context,
        node: &str,
        reason: String,
        last: Option<&str>,
        step: usize,
    ) -> RunOutcome {
        error!(
            correlation_id = %ctx.correlation_id,
            node = %node,
            reason = %reason,
            "Run aborted"
        );
        ctx.record_error(node, reason.clone(), ErrorKind::Structural);
        self.emit(
            EventKind::NodeError,
            graph,
            Some(node),
            ctx,
            step,
            Some(reason.clone()),
        );
        self.checkpoint(graph, ctx, last, None, step).await;
        RunOutcome::Aborted { reason }
    }

    fn emit(
        &self,
        kind: EventKind,
        graph: &Graph,
        node: Option<&str>,
        ctx: &Context,
        step: usize,
        message: Option<String>,
    ) {
        let mut event = GraphEvent::from_context(kind, graph.name(), node, ctx, step);
        event.message = message;
        self.bus.emit(event, ctx);
    }

    /// Save failures are logged and never change the run's course.
    async fn checkpoint(
        &self,
        graph: &Graph,
        ctx: &Context,
        last: Option<&str>,
        next: Option<&str>,
        step: usize,
    ) {
        let Some(store) = &self.store else {
            return;
        };
        let checkpoint = Checkpoint::new(graph.name(), ctx, last, next, step);
        if let Err(e) = store.save(&checkpoint).await {
            error!(
                correlation_id = %ctx.correlation_id,
                step,
                error = %e,
                "Checkpoint save failed"
            );
        }
    }
}

fn last_error(ctx: &Context, node: &str) -> String {
    ctx.errors_for(node)
        .last()
        .map(|e| e.message.clone())
        .unwrap_or_else(|| "failed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::graph::edge::END;
    use crate::graph::node::{NodeHandler, OutputKey};
    use crate::graph::router::PriorityRouter;
    use crate::graph::GraphBuilder;
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::sync::Mutex;
    use stratum_core::context::ExecutionPlan;
    use stratum_core::error::Result;
    use stratum_core::types::CorrelationId;

    struct Fixed(serde_json::Value);

    impl NodeHandler for Fixed {
        fn invoke(&self, _ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
            Box::pin(async move { Ok(NodeUpdate::new().with_result(self.0.clone())) })
        }
    }

    struct Planner(Vec<&'static str>);

    impl NodeHandler for Planner {
        fn invoke(&self, _ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
            let order = self.0.iter().map(|s| s.to_string()).collect();
            Box::pin(async move { Ok(NodeUpdate::new().with_plan(ExecutionPlan::new(order))) })
        }
    }

    struct Source(Option<&'static str>);

    impl NodeHandler for Source {
        fn invoke(&self, _ctx: &Context, env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
            Box::pin(async move {
                match self.0 {
                    Some(item) => Ok(NodeUpdate::new().with_data(vec![json!(item)])),
                    None => Err(StratumError::node(env.name, "source offline")),
                }
            })
        }
    }

    /// Stops the run from inside a node.
    struct StopAfter;

    impl NodeHandler for StopAfter {
        fn invoke(&self, _ctx: &Context, env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
            env.cancel.cancel();
            Box::pin(async { Ok(NodeUpdate::new()) })
        }
    }

    fn executor() -> Executor {
        Executor::new(ExecutorConfig::default(), Arc::new(EventBus::default()))
    }

    fn ctx(id: &str) -> Context {
        Context::new(CorrelationId::from_str(id), "ACME outlook")
    }

    /// plan -> {stage router} -> retrieve (fan-out) / analyze / fallback / end
    fn staged(plan: Vec<&'static str>, x: Option<&'static str>, y: Option<&'static str>) -> Graph {
        let router = PriorityRouter::stage(&RoutingConfig::default(), "fallback", "done");
        let targets = [
            ("retrieve", "retrieve"),
            ("analyze", "analyze"),
            ("fallback", "fallback"),
            ("done", END),
        ];
        GraphBuilder::new("staged")
            .node(Node::task("plan", Planner(plan)).with_outputs(vec![OutputKey::ExecutionPlan]))
            .fan_out(
                "retrieve",
                FanOut::new(vec![Node::source("x", Source(x)), Node::source("y", Source(y))]),
            )
            .node(Node::task("analyze", Fixed(json!("analysis"))))
            .node(
                Node::task("fallback", Fixed(json!("no data found")))
                    .with_output(OutputKey::FinalResponse),
            )
            .entry("plan")
            .conditional("plan", router.clone(), targets, None)
            .conditional("retrieve", router.clone(), targets, None)
            .conditional("analyze", router, targets, None)
            .edge("fallback", END)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_partial_fan_out_continues_plan() {
        let graph = staged(vec!["retrieve", "analyze"], Some("doc"), None);
        let report = executor().run(&graph, ctx("t-1"), RunControl::new()).await;

        assert!(report.is_completed());
        assert_eq!(report.path, vec!["plan", "retrieve", "analyze"]);
        let c = &report.context;
        assert_eq!(c.status("retrieve"), NodeStatus::Completed);
        assert_eq!(c.status("x"), NodeStatus::Completed);
        assert_eq!(c.status("y"), NodeStatus::Failed);
        assert_eq!(c.retrieved_data.keys().collect::<Vec<_>>(), vec!["x"]);
        assert_eq!(c.errors.len(), 1);
        assert_eq!(c.errors[0].node, "y");
        assert_eq!(c.status("analyze"), NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_empty_plan_routes_to_fallback() {
        let graph = staged(vec![], Some("doc"), Some("doc"));
        let report = executor().run(&graph, ctx("t-2"), RunControl::new()).await;
        assert!(report.is_completed());
        assert_eq!(report.path, vec!["plan", "fallback"]);
        assert_eq!(report.context.status("fallback"), NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_exhausted_fan_out_routes_to_fallback() {
        let graph = staged(vec!["retrieve", "analyze"], None, None);
        let report = executor().run(&graph, ctx("t-3"), RunControl::new()).await;
        assert_eq!(report.path, vec!["plan", "retrieve", "fallback"]);
        assert_eq!(report.context.status("retrieve"), NodeStatus::CompletedNoData);
        assert_eq!(report.context.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_step_limit_aborts() {
        let graph = GraphBuilder::new("chain")
            .node(Node::task("a", Fixed(json!(1))))
            .node(Node::task("b", Fixed(json!(2))))
            .node(Node::task("c", Fixed(json!(3))))
            .entry("a")
            .edge("a", "b")
            .edge("b", "c")
            .edge("c", END)
            .build()
            .unwrap();
        let exec = Executor::new(
            ExecutorConfig::default().with_max_steps(2),
            Arc::new(EventBus::default()),
        );
        let report = exec.run(&graph, ctx("t-4"), RunControl::new()).await;

        assert!(matches!(report.outcome, RunOutcome::Aborted { .. }));
        assert_eq!(report.steps, 2);
        assert_eq!(report.context.status("c"), NodeStatus::NotStarted);
        let last = report.context.errors.last().unwrap();
        assert_eq!(last.kind, ErrorKind::Structural);
        assert!(last.message.contains("Step limit"));
    }

    #[tokio::test]
    async fn test_cycle_never_reopens_a_finished_node() {
        let bus = Arc::new(EventBus::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_all(Arc::new(move |_: &GraphEvent, c: &Context| -> Result<()> {
            let status = c.status("a");
            let mut seen = sink.lock().unwrap();
            if seen.last() != Some(&status) {
                seen.push(status);
            }
            Ok(())
        }));
        let graph = GraphBuilder::new("loop")
            .node(Node::task("a", Fixed(json!(1))))
            .node(Node::task("b", Fixed(json!(2))))
            .entry("a")
            .edge("a", "b")
            .edge("b", "a")
            .build()
            .unwrap();
        let exec = Executor::new(ExecutorConfig::default().with_max_steps(10), bus);
        let report = exec.run(&graph, ctx("t-cycle"), RunControl::new()).await;

        match &report.outcome {
            RunOutcome::Aborted { reason } => assert!(reason.contains("'a'")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(report.path, vec!["a", "b"]);
        assert_eq!(report.context.status("a"), NodeStatus::Completed);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![NodeStatus::NotStarted, NodeStatus::Processing, NodeStatus::Completed]
        );
        assert_eq!(report.context.errors.last().unwrap().kind, ErrorKind::Structural);
    }

    /// Indexes the context before boxing its future.
    struct EagerPanic;

    impl NodeHandler for EagerPanic {
        fn invoke(&self, ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
            let docs = ctx.retrieved_data["documents"].len();
            Box::pin(async move { Ok(NodeUpdate::new().with_result(json!(docs))) })
        }
    }

    #[tokio::test]
    async fn test_panic_while_building_future_fails_only_that_node() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let exec = executor().with_checkpoints(store.clone());
        let graph = GraphBuilder::new("eager")
            .node(Node::task("a", EagerPanic))
            .node(Node::task("b", Fixed(json!("b"))))
            .entry("a")
            .edge("a", "b")
            .edge("b", END)
            .build()
            .unwrap();

        let report = exec.run(&graph, ctx("t-eager"), RunControl::new()).await;
        assert!(report.is_completed());
        assert_eq!(report.path, vec!["a", "b"]);
        let c = &report.context;
        assert_eq!(c.status("a"), NodeStatus::Failed);
        assert_eq!(c.status("b"), NodeStatus::Completed);
        assert_eq!(c.errors.len(), 1);
        assert_eq!(c.errors[0].kind, ErrorKind::Panic);

        let cp = store
            .load(&CorrelationId::from_str("t-eager"))
            .await
            .unwrap()
            .unwrap();
        assert!(cp.is_complete());
    }

    #[tokio::test]
    async fn test_unknown_label_aborts_with_context() {
        let graph = GraphBuilder::new("bad-label")
            .node(Node::task("a", Fixed(json!(1))))
            .entry("a")
            .conditional("a", |_: &Context| "nowhere".to_string(), [("done", END)], None)
            .build()
            .unwrap();
        let report = executor().run(&graph, ctx("t-5"), RunControl::new()).await;
        match &report.outcome {
            RunOutcome::Aborted { reason } => assert!(reason.contains("nowhere")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(report.context.status("a"), NodeStatus::Completed);
        assert!(report.context.result("a").is_some());
    }

    #[tokio::test]
    async fn test_stop_checkpoints_and_resumes() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let exec = executor().with_checkpoints(store.clone());
        let graph = GraphBuilder::new("stoppable")
            .node(Node::task("a", StopAfter))
            .node(Node::task("b", Fixed(json!("b"))))
            .entry("a")
            .edge("a", "b")
            .edge("b", END)
            .build()
            .unwrap();

        let report = exec.run(&graph, ctx("t-6"), RunControl::new()).await;
        assert_eq!(report.outcome, RunOutcome::Stopped);
        assert_eq!(report.path, vec!["a"]);

        let cp = store
            .load(&CorrelationId::from_str("t-6"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cp.last_node.as_deref(), Some("a"));
        assert_eq!(cp.next_node.as_deref(), Some("b"));

        let resumed = exec.resume(&graph, cp, RunControl::new()).await;
        assert!(resumed.is_completed());
        assert_eq!(resumed.path, vec!["b"]);
        assert_eq!(resumed.context.status("a"), NodeStatus::Completed);
        assert_eq!(resumed.context.status("b"), NodeStatus::Completed);

        let done = store
            .load(&CorrelationId::from_str("t-6"))
            .await
            .unwrap()
            .unwrap();
        assert!(done.is_complete());
        let again = exec.resume(&graph, done, RunControl::new()).await;
        assert!(again.is_completed());
        assert_eq!(again.steps, 0);
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let bus = Arc::new(EventBus::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_all(Arc::new(move |e: &GraphEvent, _: &Context| -> Result<()> {
            sink.lock()
                .unwrap()
                .push(format!("{}:{}", e.kind.as_str(), e.node.clone().unwrap_or_default()));
            Ok(())
        }));
        let graph = GraphBuilder::new("one")
            .node(Node::task("a", Fixed(json!(1))))
            .entry("a")
            .edge("a", END)
            .build()
            .unwrap();
        Executor::new(ExecutorConfig::default(), bus)
            .run(&graph, ctx("t-7"), RunControl::new())
            .await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["graph_start:", "node_start:a", "node_end:a", "graph_end:"]
        );
    }
}
