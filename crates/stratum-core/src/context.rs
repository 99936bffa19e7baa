//! The shared, namespaced state threaded through one run.
//!
//! Each node owns its own slots (`agent_results[name]`,
//! `retrieved_data[name]`, `processing_status[name]`) and reads everything
//! else. Singleton keys such as the classification or the execution plan are
//! owned by whichever node declared them when the graph was built.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StratumError};
use crate::types::{CorrelationId, ErrorEntry, ErrorKind, NodeStatus};

/// Structured flags produced early in a run, read by downstream routers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: String,
    #[serde(default)]
    pub is_follow_up: bool,
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
}

impl Classification {
    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }
}

/// Which external data sources the query needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataRequirements {
    #[serde(default)]
    pub sources: BTreeMap<String, bool>,
}

impl DataRequirements {
    pub fn requires(&self, source: &str) -> bool {
        self.sources.get(source).copied().unwrap_or(false)
    }

    pub fn with(mut self, source: impl Into<String>, needed: bool) -> Self {
        self.sources.insert(source.into(), needed);
        self
    }
}

/// Ordered list of stages computed by a planning node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub order: Vec<String>,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl ExecutionPlan {
    pub fn new(order: Vec<String>) -> Self {
        Self {
            order,
            rationale: None,
        }
    }
}

/// Caller-provided request to re-enter the graph at a named recovery target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartSignal {
    pub target: String,
    pub reason: String,
}

/// Outcome of the most recent fan-out batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanOutSummary {
    pub node: String,
    pub succeeded: Vec<String>,
    pub empty: Vec<String>,
    pub failed: Vec<String>,
    pub usable_data: bool,
}

/// One completed user turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: u32,
    pub query: String,
    #[serde(default)]
    pub response: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Live, non-serializable handles supplied by the caller (clients, indexes).
///
/// Never persisted: checkpoints are taken from [`Context::snapshot`].
#[derive(Clone, Default)]
pub struct Attachments {
    items: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Attachments {
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: Arc<T>) {
        self.items.insert(key.into(), value);
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.items.get(key)?.clone().downcast::<T>().ok()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl std::fmt::Debug for Attachments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.items.keys()).finish()
    }
}

/// The single mutable state object of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    pub correlation_id: CorrelationId,
    pub query: String,
    /// Zero for the first message of a conversation.
    #[serde(default)]
    pub turn: u32,
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub data_requirements: DataRequirements,
    #[serde(default)]
    pub retrieved_data: BTreeMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    pub agent_results: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub processing_status: BTreeMap<String, NodeStatus>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub execution_plan: Option<ExecutionPlan>,
    #[serde(default)]
    pub restart: Option<RestartSignal>,
    #[serde(default)]
    pub fan_out_completed: bool,
    #[serde(default)]
    pub fan_out_summary: Option<FanOutSummary>,
    #[serde(default)]
    pub final_response: Option<String>,
    #[serde(default)]
    pub history: Vec<TurnRecord>,
    /// Free-form caller options (`extra_options`).
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    pub attachments: Attachments,
}

impl Context {
    pub fn new(correlation_id: CorrelationId, query: impl Into<String>) -> Self {
        Self {
            correlation_id,
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn with_plan(mut self, order: Vec<String>) -> Self {
        self.execution_plan = Some(ExecutionPlan::new(order));
        self
    }

    pub fn status(&self, node: &str) -> NodeStatus {
        self.processing_status
            .get(node)
            .copied()
            .unwrap_or_default()
    }

    /// Mark a node as processing.
    ///
    /// A node that already reached a terminal status may only be moved back
    /// here by its own re-invocation, which is what calling this means.
    pub fn begin_node(&mut self, node: &str) -> Result<()> {
        let current = self.status(node);
        if current == NodeStatus::Processing {
            return Err(StratumError::StatusRegression {
                node: node.to_string(),
                from: current.to_string(),
                to: NodeStatus::Processing.to_string(),
            });
        }
        self.processing_status
            .insert(node.to_string(), NodeStatus::Processing);
        if self
            .restart
            .as_ref()
            .is_some_and(|signal| signal.target == node)
        {
            self.restart = None;
        }
        Ok(())
    }

    /// Move a processing node to a terminal status.
    pub fn finish_node(&mut self, node: &str, status: NodeStatus) -> Result<()> {
        let current = self.status(node);
        if !status.is_terminal() || current != NodeStatus::Processing {
            return Err(StratumError::StatusRegression {
                node: node.to_string(),
                from: current.to_string(),
                to: status.to_string(),
            });
        }
        self.processing_status.insert(node.to_string(), status);
        Ok(())
    }

    pub fn push_error(&mut self, entry: ErrorEntry) {
        self.errors.push(entry);
    }

    pub fn record_error(&mut self, node: &str, message: impl Into<String>, kind: ErrorKind) {
        self.errors.push(ErrorEntry::new(node, message, kind));
    }

    pub fn errors_for(&self, node: &str) -> impl Iterator<Item = &ErrorEntry> {
        let node = node.to_string();
        self.errors.iter().filter(move |e| e.node == node)
    }

    pub fn result(&self, node: &str) -> Option<&serde_json::Value> {
        self.agent_results.get(node)
    }

    pub fn has_retrieved(&self, source: &str) -> bool {
        self.retrieved_data
            .get(source)
            .is_some_and(|items| !items.is_empty())
    }

    /// A plan is usable only if it lists at least one stage.
    pub fn has_plan(&self) -> bool {
        self.execution_plan
            .as_ref()
            .is_some_and(|plan| !plan.order.is_empty())
    }

    /// True once a fan-out batch finished without any usable data.
    pub fn fan_out_exhausted(&self) -> bool {
        self.fan_out_completed
            && self
                .fan_out_summary
                .as_ref()
                .map_or(true, |summary| !summary.usable_data)
    }

    /// Copy of this context with live attachments stripped, safe to persist.
    pub fn snapshot(&self) -> Context {
        Context {
            attachments: Attachments::default(),
            ..self.clone()
        }
    }

    /// Prepare a persisted context for the next user turn.
    ///
    /// Earlier `agent_results` and `retrieved_data` stay visible so routers
    /// can detect follow-ups; per-run state starts over.
    pub fn next_turn(mut self, query: impl Into<String>) -> Context {
        self.history.push(TurnRecord {
            turn: self.turn,
            query: std::mem::take(&mut self.query),
            response: self.final_response.take(),
            completed_at: Utc::now(),
        });
        self.turn += 1;
        self.query = query.into();
        self.classification = None;
        self.processing_status.clear();
        self.errors.clear();
        self.execution_plan = None;
        self.restart = None;
        self.fan_out_completed = false;
        self.fan_out_summary = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::new(CorrelationId::from_str("t-1"), "revenue of ACME")
    }

    #[test]
    fn test_status_forward_only() {
        let mut c = ctx();
        assert_eq!(c.status("plan"), NodeStatus::NotStarted);
        c.begin_node("plan").unwrap();
        assert!(c.begin_node("plan").is_err());
        c.finish_node("plan", NodeStatus::Completed).unwrap();
        assert!(c.finish_node("plan", NodeStatus::Failed).is_err());
        assert_eq!(c.status("plan"), NodeStatus::Completed);
    }

    #[test]
    fn test_finish_requires_terminal_status() {
        let mut c = ctx();
        c.begin_node("plan").unwrap();
        assert!(c.finish_node("plan", NodeStatus::NotStarted).is_err());
        assert!(c.finish_node("other", NodeStatus::Completed).is_err());
    }

    #[test]
    fn test_begin_consumes_restart_signal() {
        let mut c = ctx();
        c.restart = Some(RestartSignal {
            target: "retrieve".into(),
            reason: "transport reset".into(),
        });
        c.begin_node("plan").unwrap();
        assert!(c.restart.is_some());
        c.begin_node("retrieve").unwrap();
        assert!(c.restart.is_none());
    }

    #[test]
    fn test_has_plan() {
        let mut c = ctx();
        assert!(!c.has_plan());
        c.execution_plan = Some(ExecutionPlan::default());
        assert!(!c.has_plan());
        c = c.with_plan(vec!["retrieve".into()]);
        assert!(c.has_plan());
    }

    #[test]
    fn test_fan_out_exhausted() {
        let mut c = ctx();
        assert!(!c.fan_out_exhausted());
        c.fan_out_completed = true;
        assert!(c.fan_out_exhausted());
        c.fan_out_summary = Some(FanOutSummary {
            node: "retrieve".into(),
            succeeded: vec!["documents".into()],
            usable_data: true,
            ..FanOutSummary::default()
        });
        assert!(!c.fan_out_exhausted());
    }

    #[test]
    fn test_snapshot_strips_attachments() {
        let mut c = ctx();
        c.attachments.insert("index", Arc::new(42u32));
        assert_eq!(c.attachments.get::<u32>("index").as_deref(), Some(&42));

        let snap = c.snapshot();
        assert!(snap.attachments.is_empty());
        assert_eq!(snap.query, c.query);

        let json = serde_json::to_string(&c).unwrap();
        assert!(!json.contains("attachments"));
    }

    #[test]
    fn test_next_turn_keeps_results() {
        let mut c = ctx();
        c.agent_results
            .insert("analyze".into(), serde_json::json!({"summary": "up 4%"}));
        c.begin_node("analyze").unwrap();
        c.finish_node("analyze", NodeStatus::Completed).unwrap();
        c.record_error("filings", "timeout", ErrorKind::Timeout);
        c.final_response = Some("ACME grew".into());

        let next = c.next_turn("and last year?");
        assert_eq!(next.turn, 1);
        assert_eq!(next.query, "and last year?");
        assert!(next.result("analyze").is_some());
        assert!(next.processing_status.is_empty());
        assert!(next.errors.is_empty());
        assert_eq!(next.history.len(), 1);
        assert_eq!(next.history[0].response.as_deref(), Some("ACME grew"));
    }
}
