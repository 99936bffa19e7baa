use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use stratum_core::config::{ExecutorConfig, RoutingConfig};
use stratum_core::context::{Context, RestartSignal};
use stratum_core::event::EventBus;
use stratum_core::types::{CorrelationId, ErrorKind, NodeStatus};
use stratum_graph::graph::{Executor, Graph, GraphBuilder, Node, PriorityRouter, Router, END};
use stratum_graph::{RunControl, RunOutcome};
use stratum_test_utils::StaticNode;

/// For each node, the later nodes it may route to (plus the end marker).
fn acyclic_layout() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..8).prop_flat_map(|n| {
        (0..n)
            .map(|i| proptest::collection::vec(i + 1..=n, 0..4))
            .collect::<Vec<_>>()
    })
}

/// Node `n` of a layout of length `n` stands for the end marker.
fn build(layout: &[Vec<usize>]) -> Graph {
    let n = layout.len();
    let name = |i: usize| {
        if i >= n {
            END.to_string()
        } else {
            format!("n{}", i)
        }
    };

    let mut builder = GraphBuilder::new("random");
    for i in 0..n {
        builder = builder.node(Node::task(name(i), StaticNode(json!(i))));
    }
    builder = builder.entry("n0");

    for (i, successors) in layout.iter().enumerate() {
        let mut targets: Vec<(String, String)> = successors
            .iter()
            .map(|j| (format!("to_{}", j), name(*j)))
            .collect();
        targets.push(("end".to_string(), END.to_string()));
        let labels: Vec<String> = targets.iter().map(|(l, _)| l.clone()).collect();
        let router = move |ctx: &Context| -> String {
            labels[(ctx.agent_results.len() + i) % labels.len()].clone()
        };
        builder = builder.conditional(name(i), router, targets, None);
    }
    builder.build().unwrap()
}

proptest! {
    #[test]
    fn prop_acyclic_graphs_terminate(layout in acyclic_layout()) {
        let graph = build(&layout);
        let n = layout.len();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let exec = Executor::new(
            ExecutorConfig::default().with_max_steps(n),
            Arc::new(EventBus::default()),
        );
        let ctx = Context::new(CorrelationId::from_str("prop"), "q");
        let report = rt.block_on(exec.run(&graph, ctx, RunControl::new()));

        prop_assert_eq!(report.outcome, RunOutcome::Completed);
        prop_assert!(report.steps <= n);
        prop_assert!(report.context.errors.is_empty());
    }

    #[test]
    fn prop_stage_router_is_deterministic(
        errors in 0usize..6,
        finished in proptest::collection::vec(any::<bool>(), 3),
        has_plan in any::<bool>(),
        fan_out_done in any::<bool>(),
        restart in any::<bool>(),
    ) {
        let router = PriorityRouter::stage(&RoutingConfig::default(), "fallback", "done");
        let stages = ["retrieve", "analyze", "respond"];

        let mut ctx = Context::new(CorrelationId::from_str("prop"), "q");
        if has_plan {
            ctx = ctx.with_plan(stages.iter().map(|s| s.to_string()).collect());
        }
        for (stage, done) in stages.iter().zip(&finished) {
            if *done {
                ctx.begin_node(stage).unwrap();
                ctx.finish_node(stage, NodeStatus::Completed).unwrap();
            }
        }
        for i in 0..errors {
            ctx.record_error(&format!("src{}", i), "offline", ErrorKind::Business);
        }
        ctx.fan_out_completed = fan_out_done;
        if restart {
            ctx.restart = Some(RestartSignal {
                target: "analyze".into(),
                reason: "retry".into(),
            });
        }

        let first = router.route(&ctx);
        prop_assert_eq!(&first, &router.route(&ctx.clone()));

        let restored: Context =
            serde_json::from_value(serde_json::to_value(&ctx).unwrap()).unwrap();
        prop_assert_eq!(&first, &router.route(&restored));

        if restart {
            prop_assert_eq!(first.as_str(), "analyze");
        } else if errors >= 3 || !has_plan {
            prop_assert_eq!(first.as_str(), "fallback");
        }
    }
}
