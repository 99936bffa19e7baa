//! Concurrent invocation of independent sub-nodes with a single merge.
//!
//! Sub-nodes see one shared read-only snapshot of the context and each
//! produce a private [`NodeUpdate`]. Nothing touches the live context until
//! every task has finished, at which point all updates are merged in one
//! pass. A failing or panicking sub-node only affects its own slot.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stratum_core::context::{Context, FanOutSummary};
use stratum_core::error::StratumError;
use stratum_core::types::{ErrorKind, NodeStatus};

use super::node::{invoke_guarded, panic_message, Invocation, Node, NodeEnv, NodeKind};
use crate::stream::TokenSink;

/// A batch of sub-nodes run concurrently as one graph step.
#[derive(Debug, Clone)]
pub struct FanOut {
    sub_nodes: Vec<Node>,
    max_concurrency: Option<usize>,
}

impl FanOut {
    pub fn new(sub_nodes: Vec<Node>) -> Self {
        Self {
            sub_nodes,
            max_concurrency: None,
        }
    }

    /// Override the executor-wide concurrency cap for this batch.
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    pub fn sub_nodes(&self) -> &[Node] {
        &self.sub_nodes
    }

    pub fn sub_node_names(&self) -> Vec<&str> {
        self.sub_nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Mark every sub-node as processing.
    pub(crate) fn begin(&self, ctx: &mut Context) {
        for sub in &self.sub_nodes {
            if let Err(e) = ctx.begin_node(&sub.name) {
                warn!(node = %sub.name, error = %e, "Sub-node already processing");
            }
        }
    }

    /// Run every sub-node against `snapshot`, bounded by the concurrency cap.
    ///
    /// Results come back in declaration order regardless of completion order.
    pub(crate) async fn invoke_all(
        &self,
        snapshot: Arc<Context>,
        cancel: &CancellationToken,
        sink: &TokenSink,
        default_concurrency: usize,
    ) -> Vec<(String, Invocation)> {
        let limit = self.max_concurrency.unwrap_or(default_concurrency).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));

        let handles: Vec<_> = self
            .sub_nodes
            .iter()
            .map(|sub| {
                let semaphore = semaphore.clone();
                let snapshot = snapshot.clone();
                let name = sub.name.clone();
                let timeout = sub.timeout;
                let handler = match &sub.kind {
                    NodeKind::Task(handler) => Some(handler.clone()),
                    NodeKind::FanOut(_) => None,
                };
                let env = NodeEnv {
                    name: name.clone(),
                    sink: sink.for_node(&snapshot.correlation_id, &name),
                    cancel: cancel.clone(),
                };
                tokio::spawn(async move {
                    let Some(handler) = handler else {
                        return Invocation::Failed {
                            message: "nested fan-out is not supported".into(),
                            kind: ErrorKind::Structural,
                        };
                    };
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return Invocation::Failed {
                            message: StratumError::Cancelled.to_string(),
                            kind: ErrorKind::Cancelled,
                        };
                    };
                    invoke_guarded(handler.as_ref(), &snapshot, env, timeout).await
                })
            })
            .collect();

        let joined = futures::future::join_all(handles).await;

        self.sub_nodes
            .iter()
            .zip(joined)
            .map(|(sub, joined)| {
                let invocation = match joined {
                    Ok(invocation) => invocation,
                    Err(e) if e.is_panic() => Invocation::Failed {
                        message: panic_message(e.into_panic().as_ref()),
                        kind: ErrorKind::Panic,
                    },
                    Err(e) => Invocation::Failed {
                        message: format!("{}: {}", StratumError::Cancelled, e),
                        kind: ErrorKind::Cancelled,
                    },
                };
                (sub.name.clone(), invocation)
            })
            .collect()
    }

    /// Merge all sub-node results into `ctx` in one pass.
    ///
    /// Sets `fan_out_completed` and `fan_out_summary`. The batch has usable
    /// data when at least `min_usable_sources` sub-nodes completed with data.
    pub(crate) fn merge(
        &self,
        name: &str,
        results: Vec<(String, Invocation)>,
        ctx: &mut Context,
        min_usable_sources: usize,
    ) -> FanOutSummary {
        let mut summary = FanOutSummary {
            node: name.to_string(),
            ..FanOutSummary::default()
        };

        for ((sub_name, invocation), sub) in results.into_iter().zip(&self.sub_nodes) {
            let status = match invocation {
                Invocation::Updated(update) => update.apply(&sub_name, &sub.outputs, ctx),
                Invocation::Failed { message, kind } => {
                    warn!(fan_out = %name, node = %sub_name, error = %message, "Sub-node failed");
                    ctx.record_error(&sub_name, message, kind);
                    NodeStatus::Failed
                }
            };
            if let Err(e) = ctx.finish_node(&sub_name, status) {
                warn!(node = %sub_name, error = %e, "Could not record sub-node status");
            }
            match status {
                NodeStatus::Failed => summary.failed.push(sub_name),
                NodeStatus::CompletedNoData => summary.empty.push(sub_name),
                _ => summary.succeeded.push(sub_name),
            }
        }

        summary.usable_data =
            !summary.succeeded.is_empty() && summary.succeeded.len() >= min_usable_sources;
        debug!(
            fan_out = %name,
            succeeded = summary.succeeded.len(),
            empty = summary.empty.len(),
            failed = summary.failed.len(),
            usable = summary.usable_data,
            "Fan-out merged"
        );

        ctx.fan_out_completed = true;
        ctx.fan_out_summary = Some(summary.clone());
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{NodeHandler, NodeUpdate};
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use stratum_core::error::{Result, StratumError};
    use stratum_core::types::CorrelationId;

    struct Data(&'static str);

    impl NodeHandler for Data {
        fn invoke(&self, _ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
            Box::pin(async move { Ok(NodeUpdate::new().with_data(vec![json!(self.0)])) })
        }
    }

    struct Offline;

    impl NodeHandler for Offline {
        fn invoke(&self, _ctx: &Context, env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
            Box::pin(async move { Err(StratumError::node(env.name, "source offline")) })
        }
    }

    struct Nothing;

    impl NodeHandler for Nothing {
        fn invoke(&self, _ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
            Box::pin(async { Ok(NodeUpdate::new().with_data(vec![])) })
        }
    }

    /// Tracks peak concurrency.
    struct Gauge {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl NodeHandler for Gauge {
        fn invoke(&self, _ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
            Box::pin(async move {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(NodeUpdate::new().with_data(vec![json!(1)]))
            })
        }
    }

    async fn run(fan_out: &FanOut, ctx: &mut Context, limit: usize) -> FanOutSummary {
        fan_out.begin(ctx);
        let cancel = CancellationToken::new();
        let sink = TokenSink::disabled(cancel.clone());
        let results = fan_out
            .invoke_all(Arc::new(ctx.clone()), &cancel, &sink, limit)
            .await;
        fan_out.merge("retrieve", results, ctx, 1)
    }

    fn ctx() -> Context {
        Context::new(CorrelationId::from_str("t-fan"), "ACME filings")
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let fan_out = FanOut::new(vec![
            Node::source("documents", Data("doc")),
            Node::source("filings", Offline),
        ]);
        let mut c = ctx();
        let summary = run(&fan_out, &mut c, 4).await;

        assert_eq!(summary.succeeded, vec!["documents"]);
        assert_eq!(summary.failed, vec!["filings"]);
        assert!(summary.usable_data);
        assert!(c.fan_out_completed);
        assert_eq!(c.status("documents"), NodeStatus::Completed);
        assert_eq!(c.status("filings"), NodeStatus::Failed);
        assert!(c.has_retrieved("documents"));
        assert!(!c.retrieved_data.contains_key("filings"));
        assert_eq!(c.errors_for("filings").count(), 1);
        assert_eq!(c.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_all_empty_or_failed_is_unusable() {
        let fan_out = FanOut::new(vec![
            Node::source("documents", Nothing),
            Node::source("filings", Offline),
        ]);
        let mut c = ctx();
        let summary = run(&fan_out, &mut c, 4).await;

        assert!(!summary.usable_data);
        assert_eq!(summary.empty, vec!["documents"]);
        assert!(c.fan_out_exhausted());
        assert_eq!(c.status("documents"), NodeStatus::CompletedNoData);
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let nodes = (0..6)
            .map(|i| {
                Node::source(
                    format!("source_{}", i),
                    Gauge {
                        active: active.clone(),
                        peak: peak.clone(),
                    },
                )
            })
            .collect();
        let fan_out = FanOut::new(nodes).with_max_concurrency(2);
        let mut c = ctx();
        let summary = run(&fan_out, &mut c, 8).await;

        assert_eq!(summary.succeeded.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_min_usable_sources() {
        let fan_out = FanOut::new(vec![
            Node::source("documents", Data("doc")),
            Node::source("filings", Offline),
        ]);
        let mut c = ctx();
        fan_out.begin(&mut c);
        let cancel = CancellationToken::new();
        let sink = TokenSink::disabled(cancel.clone());
        let results = fan_out
            .invoke_all(Arc::new(c.clone()), &cancel, &sink, 4)
            .await;
        let summary = fan_out.merge("retrieve", results, &mut c, 2);
        assert!(!summary.usable_data);
    }
}
