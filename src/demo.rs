//! A small research pipeline wired to the engine for the CLI.
//!
//! classify -> plan -> retrieve {documents, market_data, filings}
//! -> analyze -> respond, with `fallback` taking over whenever the stage
//! router gives up on the plan. Sources read from a built-in corpus; the
//! `offline` option (a list of source names) makes those sources fail.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use stratum_core::config::RoutingConfig;
use stratum_core::context::{Classification, Context, DataRequirements, ExecutionPlan};
use stratum_core::error::{Result, StratumError};
use stratum_graph::graph::{
    FanOut, Graph, GraphBuilder, Node, NodeEnv, NodeHandler, NodeUpdate, OutputKey,
    PriorityRouter, END,
};

pub const SOURCES: [&str; 3] = ["documents", "market_data", "filings"];

const DOCUMENTS: &[(&str, &str)] = &[
    ("acme-annual-letter", "ACME grew revenue 12% on strong cloud demand"),
    ("acme-risk-memo", "ACME supply chain risk concentrated in two vendors"),
    ("globex-outlook", "GLOBEX expects flat margins while it restructures"),
    ("sector-note", "Cloud infrastructure spending keeps rising across the sector"),
];

const QUOTES: &[(&str, f64)] = &[("ACME", 182.40), ("GLOBEX", 47.15), ("INITECH", 12.80)];

const FILINGS: &[(&str, &str)] = &[
    ("ACME", "10-K: revenue $4.1B, operating margin 18%"),
    ("GLOBEX", "10-Q: restructuring charge of $120M"),
];

/// Build the demo graph.
pub fn graph(routing: &RoutingConfig) -> Result<Graph> {
    let router = PriorityRouter::stage(routing, "fallback", "done");
    let targets = [
        ("retrieve", "retrieve"),
        ("analyze", "analyze"),
        ("respond", "respond"),
        ("fallback", "fallback"),
        ("done", END),
    ];

    let sources = SOURCES
        .iter()
        .map(|name| Node::source(*name, Source))
        .collect();

    GraphBuilder::new("research")
        .node(
            Node::task("classify", Classify)
                .with_outputs(vec![OutputKey::Classification, OutputKey::DataRequirements]),
        )
        .node(Node::task("plan", Plan).with_outputs(vec![OutputKey::ExecutionPlan]))
        .fan_out("retrieve", FanOut::new(sources))
        .node(Node::task("analyze", Analyze))
        .node(
            Node::task("respond", Respond)
                .with_outputs(vec![OutputKey::AgentResult, OutputKey::FinalResponse]),
        )
        .node(Node::task("fallback", Fallback))
        .entry("classify")
        .edge("classify", "plan")
        .conditional("plan", router.clone(), targets, Some("fallback"))
        .conditional("retrieve", router.clone(), targets, Some("fallback"))
        .conditional("analyze", router, targets, Some("fallback"))
        .edge("respond", END)
        .edge("fallback", "respond")
        .build()
}

fn tickers(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_ascii_alphanumeric())
        .map(|w| w.to_ascii_uppercase())
        .filter(|w| QUOTES.iter().any(|(t, _)| t == w))
        .collect()
}

fn mentions(query: &str, words: &[&str]) -> bool {
    let q = query.to_lowercase();
    words.iter().any(|w| q.contains(w))
}

struct Classify;

impl NodeHandler for Classify {
    fn invoke(&self, ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        let query = ctx.query.clone();
        let is_follow_up = ctx.turn > 0;
        Box::pin(async move {
            let has_ticker = !tickers(&query).is_empty();
            let wants_market = mentions(&query, &["price", "stock", "market", "quote"]);
            let wants_filings = mentions(&query, &["filing", "10-k", "10-q", "report"]);

            let intent = match (wants_market, wants_filings) {
                (true, _) => "market",
                (_, true) => "filings",
                _ => "research",
            };
            let mut flags = BTreeMap::new();
            flags.insert("has_ticker".to_string(), has_ticker);

            let requirements = DataRequirements::default()
                .with("documents", true)
                .with("market_data", has_ticker && (wants_market || !wants_filings))
                .with("filings", has_ticker && (wants_filings || !wants_market));

            Ok(NodeUpdate::new()
                .with_classification(Classification {
                    intent: intent.to_string(),
                    is_follow_up,
                    flags,
                })
                .with_requirements(requirements))
        })
    }
}

struct Plan;

impl NodeHandler for Plan {
    fn invoke(&self, ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        let follow_up = ctx
            .classification
            .as_ref()
            .map_or(false, |c| c.is_follow_up);
        let have_data = !ctx.retrieved_data.is_empty();
        Box::pin(async move {
            let (order, rationale) = if follow_up && have_data {
                (vec!["analyze", "respond"], "reuse data from earlier turns")
            } else {
                (vec!["retrieve", "analyze", "respond"], "fresh retrieval")
            };
            let mut plan = ExecutionPlan::new(order.into_iter().map(String::from).collect());
            plan.rationale = Some(rationale.to_string());
            Ok(NodeUpdate::new().with_plan(plan))
        })
    }
}

struct Source;

impl NodeHandler for Source {
    fn invoke(&self, ctx: &Context, env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        let required = ctx.data_requirements.requires(&env.name);
        let offline = ctx
            .options
            .get("offline")
            .and_then(Value::as_array)
            .map_or(false, |list| list.iter().any(|v| v.as_str() == Some(env.name.as_str())));
        let query = ctx.query.to_lowercase();
        let tickers = tickers(&ctx.query);
        Box::pin(async move {
            if !required {
                return Ok(NodeUpdate::new().with_data(Vec::new()));
            }
            if offline {
                return Err(StratumError::node(&env.name, format!("{} is unavailable", env.name)));
            }
            let items: Vec<Value> = match env.name.as_str() {
                "documents" => DOCUMENTS
                    .iter()
                    .filter(|(_, text)| {
                        let text = text.to_lowercase();
                        query
                            .split_whitespace()
                            .filter(|w| w.len() > 3)
                            .any(|w| text.contains(w))
                    })
                    .map(|(id, text)| json!({"id": id, "text": text}))
                    .collect(),
                "market_data" => QUOTES
                    .iter()
                    .filter(|(t, _)| tickers.iter().any(|x| x == t))
                    .map(|(t, price)| json!({"ticker": t, "price": price}))
                    .collect(),
                "filings" => FILINGS
                    .iter()
                    .filter(|(t, _)| tickers.iter().any(|x| x == t))
                    .map(|(t, text)| json!({"ticker": t, "filing": text}))
                    .collect(),
                other => return Err(StratumError::node(other, "unknown source")),
            };
            Ok(NodeUpdate::new()
                .with_result(json!({"items": items.len()}))
                .with_data(items))
        })
    }
}

struct Analyze;

impl NodeHandler for Analyze {
    fn invoke(&self, ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        let mut findings = Vec::new();
        for (source, items) in &ctx.retrieved_data {
            for item in items {
                let line = item
                    .get("text")
                    .or_else(|| item.get("filing"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| {
                        let ticker = item.get("ticker")?.as_str()?;
                        let price = item.get("price")?.as_f64()?;
                        Some(format!("{} last traded at {:.2}", ticker, price))
                    });
                if let Some(line) = line {
                    findings.push(json!({"source": source, "finding": line}));
                }
            }
        }
        Box::pin(async move { Ok(NodeUpdate::new().with_result(json!({ "findings": findings }))) })
    }
}

struct Fallback;

impl NodeHandler for Fallback {
    fn invoke(&self, ctx: &Context, _env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        let reasons: Vec<String> = ctx
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.node, e.message))
            .collect();
        Box::pin(async move {
            Ok(NodeUpdate::new().with_result(json!({
                "message": "no data found",
                "errors": reasons,
            })))
        })
    }
}

/// Formats the answer and streams it word by word.
struct Respond;

impl NodeHandler for Respond {
    fn invoke(&self, ctx: &Context, env: NodeEnv) -> BoxFuture<'_, Result<NodeUpdate>> {
        let text = if ctx.status("fallback").is_terminal() {
            format!(
                "I could not find data to answer \"{}\". Try another question or check the data sources.",
                ctx.query
            )
        } else {
            let findings: Vec<String> = ctx
                .result("analyze")
                .and_then(|r| r.get("findings"))
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(|f| {
                            Some(format!(
                                "- {} ({})",
                                f.get("finding")?.as_str()?,
                                f.get("source")?.as_str()?
                            ))
                        })
                        .collect()
                })
                .unwrap_or_default();
            if findings.is_empty() {
                format!("Nothing relevant turned up for \"{}\".", ctx.query)
            } else {
                format!("Findings for \"{}\":\n{}", ctx.query, findings.join("\n"))
            }
        };
        Box::pin(async move {
            for word in text.split_inclusive(' ') {
                if !env.sink.emit(word).await {
                    break;
                }
            }
            Ok(NodeUpdate::new()
                .with_result(json!({"chars": text.len()}))
                .with_response(text))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stratum_core::event::EventBus;
    use stratum_core::types::{CorrelationId, NodeStatus};
    use stratum_graph::graph::Executor;
    use stratum_graph::stream::RunControl;

    fn executor() -> Executor {
        Executor::new(Default::default(), Arc::new(EventBus::default()))
    }

    #[test]
    fn test_graph_builds() {
        let g = graph(&RoutingConfig::default()).unwrap();
        assert_eq!(g.entry(), "classify");
        assert!(g.to_dot().contains("cluster_retrieve"));
    }

    #[tokio::test]
    async fn test_answers_with_data() {
        let g = graph(&RoutingConfig::default()).unwrap();
        let ctx = Context::new(CorrelationId::from_str("d-1"), "ACME stock and cloud revenue");
        let report = executor().run(&g, ctx, RunControl::new()).await;

        assert!(report.is_completed());
        assert_eq!(report.path, vec!["classify", "plan", "retrieve", "analyze", "respond"]);
        let c = &report.context;
        assert!(c.has_retrieved("documents"));
        assert!(c.has_retrieved("market_data"));
        assert!(c.final_response.as_deref().unwrap().contains("182.40"));
    }

    #[tokio::test]
    async fn test_offline_sources_fall_back() {
        let g = graph(&RoutingConfig::default()).unwrap();
        let ctx = Context::new(CorrelationId::from_str("d-2"), "ACME revenue")
            .with_option("offline", json!(["documents", "market_data", "filings"]));
        let report = executor().run(&g, ctx, RunControl::new()).await;

        assert!(report.is_completed());
        assert_eq!(
            report.path,
            vec!["classify", "plan", "retrieve", "fallback", "respond"]
        );
        let c = &report.context;
        assert_eq!(c.status("retrieve"), NodeStatus::CompletedNoData);
        assert!(c.final_response.as_deref().unwrap().starts_with("I could not find data"));
    }
}
