use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of one logical conversation ("thread").
///
/// Spans every run belonging to the same conversation and keys its checkpoint.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Processing status of a node within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    NotStarted,
    Processing,
    Completed,
    CompletedWithDefaults,
    CompletedNoData,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithDefaults | Self::CompletedNoData | Self::Failed
        )
    }

    /// Position in the forward-only lifecycle. All terminal states share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Processing => 1,
            _ => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::CompletedWithDefaults => "completed_with_defaults",
            Self::CompletedNoData => "completed_no_data",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of an entry in the run's error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Data source unavailable, malformed input, and other node-level failures.
    Business,
    Timeout,
    Panic,
    /// A node tried to write a key it does not own.
    Ownership,
    /// Step overflow, undeclared router label, unreachable target.
    Structural,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Business => "business",
            Self::Timeout => "timeout",
            Self::Panic => "panic",
            Self::Ownership => "ownership",
            Self::Structural => "structural",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One entry in the append-only error log of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub node: String,
    pub message: String,
    pub kind: ErrorKind,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEntry {
    pub fn new(node: impl Into<String>, message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            node: node.into(),
            message: message.into(),
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn business(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(node, message, ErrorKind::Business)
    }
}

/// Lifecycle notification kinds published on the event bus.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    GraphStart,
    NodeStart,
    NodeEnd,
    NodeError,
    GraphEnd,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GraphStart => "graph_start",
            Self::NodeStart => "node_start",
            Self::NodeEnd => "node_end",
            Self::NodeError => "node_error",
            Self::GraphEnd => "graph_end",
        }
    }
}

/// Event broadcast to every observer of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEvent {
    pub kind: EventKind,
    pub correlation_id: CorrelationId,
    pub graph: String,
    /// Node the event refers to; `None` for graph-level events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Status of `node` at the time of publication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    /// Executor step counter.
    pub step: usize,
    /// Error count accumulated in the run so far.
    pub error_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}
