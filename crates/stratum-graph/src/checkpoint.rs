use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use stratum_core::context::Context;
use stratum_core::error::{Result, StratumError};
use stratum_core::types::CorrelationId;

/// Persisted state of a run after a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub correlation_id: CorrelationId,
    /// Graph the run belongs to.
    pub graph: String,
    /// Context with live attachments stripped.
    pub context: Context,
    /// Last node that finished, `None` if the run stopped before its first step.
    pub last_node: Option<String>,
    /// Resolved successor of `last_node`; `None` means the run is finished.
    pub next_node: Option<String>,
    /// Total steps taken by the run so far.
    pub step: usize,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        graph: &str,
        context: &Context,
        last_node: Option<&str>,
        next_node: Option<&str>,
        step: usize,
    ) -> Self {
        Self {
            correlation_id: context.correlation_id.clone(),
            graph: graph.to_string(),
            context: context.snapshot(),
            last_node: last_node.map(str::to_string),
            next_node: next_node.map(str::to_string),
            step,
            timestamp: Utc::now(),
        }
    }

    /// True if the run reached the terminal marker.
    pub fn is_complete(&self) -> bool {
        self.next_node.is_none()
    }
}

/// Storage for per-conversation checkpoints, one per correlation id.
pub trait CheckpointStore: Send + Sync {
    /// Create or overwrite the checkpoint for its correlation id.
    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>>;

    fn load(&self, id: &CorrelationId) -> BoxFuture<'_, Result<Option<Checkpoint>>>;

    /// Correlation ids with a checkpoint, most recently updated first.
    fn list(&self) -> BoxFuture<'_, Result<Vec<CorrelationId>>>;

    /// Returns false if there was nothing to delete.
    fn delete(&self, id: &CorrelationId) -> BoxFuture<'_, Result<bool>>;
}

/// Persistent checkpoint store backed by SQLite.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| StratumError::Database(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )
        .map_err(|e| StratumError::Database(e.to_string()))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| StratumError::Database(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                 correlation_id TEXT PRIMARY KEY,
                 graph TEXT NOT NULL,
                 last_node TEXT,
                 next_node TEXT,
                 step INTEGER NOT NULL,
                 context_json TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_cp_updated
                 ON checkpoints(updated_at DESC);",
        )
        .map_err(|e| StratumError::Database(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let encoded = serde_json::to_string(&checkpoint.context);
        let cp = checkpoint.clone();
        Box::pin(async move {
            let context_json = encoded?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| StratumError::Database(e.to_string()))?;
            conn.execute(
                "INSERT OR REPLACE INTO checkpoints
                     (correlation_id, graph, last_node, next_node, step, context_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    cp.correlation_id.as_str(),
                    cp.graph,
                    cp.last_node,
                    cp.next_node,
                    cp.step as i64,
                    context_json,
                    cp.timestamp.to_rfc3339(),
                ],
            )
            .map_err(|e| StratumError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn load(&self, id: &CorrelationId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let id = id.clone();
        Box::pin(async move {
            let row = {
                let conn = self
                    .conn
                    .lock()
                    .map_err(|e| StratumError::Database(e.to_string()))?;
                conn.query_row(
                    "SELECT graph, last_node, next_node, step, context_json, updated_at
                     FROM checkpoints WHERE correlation_id = ?1",
                    params![id.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| StratumError::Database(e.to_string()))?
            };

            let Some((graph, last_node, next_node, step, context_json, ts)) = row else {
                return Ok(None);
            };
            let context: Context = serde_json::from_str(&context_json)?;
            Ok(Some(Checkpoint {
                correlation_id: id,
                graph,
                context,
                last_node,
                next_node,
                step: step as usize,
                timestamp: DateTime::parse_from_rfc3339(&ts)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            }))
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<CorrelationId>>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StratumError::Database(e.to_string()))?;
            let mut stmt = conn
                .prepare("SELECT correlation_id FROM checkpoints ORDER BY updated_at DESC")
                .map_err(|e| StratumError::Database(e.to_string()))?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| StratumError::Database(e.to_string()))?
                .filter_map(|r| r.ok())
                .map(CorrelationId)
                .collect();
            Ok(ids)
        })
    }

    fn delete(&self, id: &CorrelationId) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StratumError::Database(e.to_string()))?;
            let deleted = conn
                .execute(
                    "DELETE FROM checkpoints WHERE correlation_id = ?1",
                    params![id.as_str()],
                )
                .map_err(|e| StratumError::Database(e.to_string()))?;
            Ok(deleted > 0)
        })
    }
}

/// Process-local store, used when checkpointing to disk is disabled.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<CorrelationId, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let cp = Checkpoint {
            context: checkpoint.context.snapshot(),
            ..checkpoint.clone()
        };
        Box::pin(async move {
            self.entries
                .lock()
                .map_err(|e| StratumError::Database(e.to_string()))?
                .insert(cp.correlation_id.clone(), cp);
            Ok(())
        })
    }

    fn load(&self, id: &CorrelationId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let id = id.clone();
        Box::pin(async move {
            let entries = self
                .entries
                .lock()
                .map_err(|e| StratumError::Database(e.to_string()))?;
            Ok(entries.get(&id).cloned())
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<CorrelationId>>> {
        Box::pin(async move {
            let entries = self
                .entries
                .lock()
                .map_err(|e| StratumError::Database(e.to_string()))?;
            let mut listed: Vec<(&CorrelationId, DateTime<Utc>)> =
                entries.iter().map(|(id, cp)| (id, cp.timestamp)).collect();
            listed.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
            Ok(listed.into_iter().map(|(id, _)| id.clone()).collect())
        })
    }

    fn delete(&self, id: &CorrelationId) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move {
            Ok(self
                .entries
                .lock()
                .map_err(|e| StratumError::Database(e.to_string()))?
                .remove(&id)
                .is_some())
        })
    }
}
