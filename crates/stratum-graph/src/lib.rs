//! Graph construction and execution for stratum workflows.
//!
//! Build a [`Graph`] with [`GraphBuilder`], then drive it either directly
//! through an [`Executor`] or through a [`WorkflowService`], which adds
//! checkpoint continuity, progress polling and stop requests per
//! correlation id.

pub mod checkpoint;
pub mod graph;
pub mod run_log;
pub mod service;
pub mod session;
pub mod stream;

pub use checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use graph::{
    ConditionalEdge, Edge, Executor, FanOut, Graph, GraphBuilder, Node, NodeEnv, NodeHandler,
    NodeKind, NodeUpdate, OutputKey, PriorityRouter, Router, RunOutcome, RunReport, Transition,
    END,
};
pub use run_log::RunLogger;
pub use service::{RunHandle, StartOptions, WorkflowService};
pub use session::{SessionSnapshot, SessionStateCache};
pub use stream::{token_channel, RunControl, StreamIncrement, TokenSink, TokenStream};
