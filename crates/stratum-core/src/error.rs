use thiserror::Error;

#[derive(Debug, Error)]
pub enum StratumError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Graph structure errors
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Router at '{node}' returned undeclared label '{label}'")]
    UnknownRouteLabel { node: String, label: String },

    #[error("Step limit exceeded ({0} steps)")]
    StepLimitExceeded(usize),

    #[error("Node '{node}' wrote undeclared key '{key}'")]
    OwnershipViolation { node: String, key: String },

    #[error("Status of node '{node}' cannot move from {from} to {to}")]
    StatusRegression {
        node: String,
        from: String,
        to: String,
    },

    // Node errors
    #[error("Node failed: {node}: {message}")]
    NodeFailed { node: String, message: String },

    #[error("Node timeout after {timeout_ms}ms: {node}")]
    NodeTimeout { node: String, timeout_ms: u64 },

    // Run control errors
    #[error("Run cancelled")]
    Cancelled,

    #[error("A run is already in progress for {0}")]
    RunInProgress(String),

    #[error("No checkpoint for {0}")]
    CheckpointNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StratumError {
    /// Shorthand for a business failure raised inside a node handler.
    pub fn node(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeFailed {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Whether this error is a structural violation that aborts a run.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidGraph(_)
                | Self::NodeNotFound(_)
                | Self::UnknownRouteLabel { .. }
                | Self::StepLimitExceeded(_)
                | Self::StatusRegression { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StratumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_classification() {
        assert!(StratumError::StepLimitExceeded(25).is_structural());
        assert!(StratumError::UnknownRouteLabel {
            node: "plan".into(),
            label: "nowhere".into(),
        }
        .is_structural());
        assert!(!StratumError::node("retrieve", "source offline").is_structural());
        assert!(StratumError::StatusRegression {
            node: "a".into(),
            from: "completed".into(),
            to: "processing".into(),
        }
        .is_structural());
        assert!(!StratumError::Cancelled.is_structural());
    }

    #[test]
    fn test_display() {
        let err = StratumError::NodeTimeout {
            node: "market_data".into(),
            timeout_ms: 1500,
        };
        assert_eq!(err.to_string(), "Node timeout after 1500ms: market_data");
    }
}
