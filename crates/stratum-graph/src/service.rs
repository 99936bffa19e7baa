//! Caller-facing surface: start, poll, stop, and inspect runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stratum_core::config::StratumConfig;
use stratum_core::context::{Attachments, Context, RestartSignal};
use stratum_core::error::{Result, StratumError};
use stratum_core::event::EventBus;
use stratum_core::hooks::HookRunner;
use stratum_core::types::CorrelationId;

use crate::checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
use crate::graph::{Executor, Graph, RunReport};
use crate::run_log::RunLogger;
use crate::session::{SessionSnapshot, SessionStateCache};
use crate::stream::{token_channel, RunControl, TokenSink, TokenStream};

/// Per-call options for [`WorkflowService::start_run`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Re-enter an unfinished checkpoint instead of starting a new turn.
    pub resume: bool,
    /// Merged into `Context::options`.
    pub options: BTreeMap<String, serde_json::Value>,
    pub attachments: Attachments,
    /// Route to a recovery target at the next decision point.
    pub restart: Option<RestartSignal>,
}

impl StartOptions {
    pub fn resume() -> Self {
        Self {
            resume: true,
            ..Self::default()
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn with_attachments(mut self, attachments: Attachments) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_restart(mut self, target: impl Into<String>, reason: impl Into<String>) -> Self {
        self.restart = Some(RestartSignal {
            target: target.into(),
            reason: reason.into(),
        });
        self
    }
}

/// A run executing in the background with its token stream.
pub struct RunHandle {
    pub correlation_id: CorrelationId,
    pub tokens: TokenStream,
    pub task: JoinHandle<Result<RunReport>>,
}

type ActiveRuns = Arc<Mutex<HashMap<CorrelationId, CancellationToken>>>;

/// Releases the correlation id when the run ends, however it ends.
struct ActiveGuard {
    active: ActiveRuns,
    id: CorrelationId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Owns one graph and everything needed to run it for many conversations.
pub struct WorkflowService {
    graph: Arc<Graph>,
    executor: Executor,
    store: Arc<dyn CheckpointStore>,
    bus: Arc<EventBus>,
    sessions: Arc<SessionStateCache>,
    config: StratumConfig,
    active: ActiveRuns,
}

impl WorkflowService {
    /// Wire a service with an explicit checkpoint store.
    pub fn new(
        graph: Arc<Graph>,
        config: StratumConfig,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        config.validate()?;
        let bus = Arc::new(EventBus::new(config.events.capacity));
        let sessions = Arc::new(SessionStateCache::with_capacity(
            config.events.session_capacity,
        ));
        bus.subscribe_all(sessions.clone());
        if let Some(hooks) = config.hooks.as_ref().filter(|h| !h.is_empty()) {
            bus.subscribe_all(Arc::new(HookRunner::new(hooks.clone())));
        }

        let executor = Executor::new(config.executor.clone(), bus.clone())
            .with_routing(config.routing.clone())
            .with_checkpoints(store.clone());

        Ok(Self {
            graph,
            executor,
            store,
            bus,
            sessions,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Wire a service using the store named in `config`: SQLite when
    /// checkpointing is enabled, process memory otherwise.
    pub fn from_config(graph: Arc<Graph>, config: StratumConfig) -> Result<Self> {
        let store: Arc<dyn CheckpointStore> = if config.checkpoint.enabled {
            Arc::new(SqliteCheckpointStore::open(
                &config.checkpoint.resolved_path(),
            )?)
        } else {
            Arc::new(MemoryCheckpointStore::new())
        };
        Self::new(graph, config, store)
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Run to completion and return the final (or partial) context.
    ///
    /// Fails only before the run starts: another run holds the correlation
    /// id, or a requested resume has no checkpoint. A checkpoint that cannot
    /// be read is logged and treated as absent.
    pub async fn start_run(
        &self,
        query: impl Into<String>,
        correlation_id: Option<CorrelationId>,
        options: StartOptions,
    ) -> Result<RunReport> {
        let id = correlation_id.unwrap_or_default();
        let cancel = CancellationToken::new();
        let guard = self.acquire(&id, &cancel)?;
        let control = RunControl {
            sink: TokenSink::disabled(cancel.clone()),
            cancel,
        };
        let report = self.execute(query.into(), id, options, control).await;
        drop(guard);
        report
    }

    /// Start a run in the background and stream its tokens.
    pub fn start_streaming(
        self: &Arc<Self>,
        query: impl Into<String>,
        correlation_id: Option<CorrelationId>,
        options: StartOptions,
    ) -> Result<RunHandle> {
        let id = correlation_id.unwrap_or_default();
        let cancel = CancellationToken::new();
        let guard = self.acquire(&id, &cancel)?;
        let (sink, tokens) = token_channel(self.config.executor.stream_capacity, cancel.clone());
        let control = RunControl { cancel, sink };

        let service = self.clone();
        let query = query.into();
        let run_id = id.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            service.execute(query, run_id, options, control).await
        });
        Ok(RunHandle {
            correlation_id: id,
            tokens,
            task,
        })
    }

    /// Latest progress snapshot, without touching the checkpoint store.
    pub fn poll_progress(&self, id: &CorrelationId) -> Option<SessionSnapshot> {
        self.sessions.get(id)
    }

    /// Request a cooperative stop. Returns false if no run is active for `id`.
    pub fn stop(&self, id: &CorrelationId) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.get(id) {
            Some(token) => {
                info!(correlation_id = %id, "Stop requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_runs(&self) -> Vec<CorrelationId> {
        let mut ids: Vec<CorrelationId> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub async fn list_checkpoints(&self) -> Result<Vec<CorrelationId>> {
        self.store.list().await
    }

    pub async fn load_checkpoint(&self, id: &CorrelationId) -> Result<Checkpoint> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| StratumError::CheckpointNotFound(id.to_string()))
    }

    pub async fn delete_checkpoint(&self, id: &CorrelationId) -> Result<bool> {
        self.sessions.remove(id);
        self.store.delete(id).await
    }

    fn acquire(&self, id: &CorrelationId, cancel: &CancellationToken) -> Result<ActiveGuard> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(id) {
            return Err(StratumError::RunInProgress(id.to_string()));
        }
        active.insert(id.clone(), cancel.clone());
        Ok(ActiveGuard {
            active: self.active.clone(),
            id: id.clone(),
        })
    }

    async fn execute(
        &self,
        query: String,
        id: CorrelationId,
        options: StartOptions,
        control: RunControl,
    ) -> Result<RunReport> {
        let prior = match self.store.load(&id).await {
            Ok(prior) => prior,
            Err(e) => {
                error!(correlation_id = %id, error = %e, "Checkpoint load failed");
                None
            }
        };

        let StartOptions {
            resume,
            options: extra,
            attachments,
            restart,
        } = options;

        let start = if resume {
            let Some(mut checkpoint) = prior else {
                return Err(StratumError::CheckpointNotFound(id.to_string()));
            };
            if !checkpoint.is_complete() {
                if checkpoint.context.query != query && !query.is_empty() {
                    warn!(correlation_id = %id, "Resuming with the checkpointed query");
                }
                let ctx = &mut checkpoint.context;
                ctx.options.extend(extra);
                ctx.attachments = attachments;
                if restart.is_some() {
                    ctx.restart = restart;
                }
                Start::Resume(checkpoint)
            } else {
                info!(correlation_id = %id, "Checkpoint is finished, starting a new turn");
                let ctx = checkpoint.context.next_turn(query);
                Start::Fresh(prepare(ctx, extra, attachments, restart))
            }
        } else {
            let ctx = match prior {
                Some(checkpoint) => {
                    info!(
                        correlation_id = %id,
                        turn = checkpoint.context.turn + 1,
                        "Continuing conversation"
                    );
                    checkpoint.context.next_turn(query)
                }
                None => Context::new(id.clone(), query),
            };
            Start::Fresh(prepare(ctx, extra, attachments, restart))
        };

        // Spawned only once the run is certain to start: the logger ends on
        // the run's graph-end, so a stopped run is still logged in full.
        if let Some(log) = self.config.log.as_ref().filter(|l| l.enabled) {
            RunLogger::new(log.resolved_dir(), log.level).spawn(
                &self.bus,
                id,
                CancellationToken::new(),
            );
        }

        let report = match start {
            Start::Resume(checkpoint) => {
                self.executor.resume(&self.graph, checkpoint, control).await
            }
            Start::Fresh(ctx) => self.executor.run(&self.graph, ctx, control).await,
        };
        Ok(report)
    }
}

/// Where a run begins once its checkpoint has been consulted.
enum Start {
    Resume(Checkpoint),
    Fresh(Context),
}

fn prepare(
    mut ctx: Context,
    extra: BTreeMap<String, serde_json::Value>,
    attachments: Attachments,
    restart: Option<RestartSignal>,
) -> Context {
    ctx.options.extend(extra);
    ctx.attachments = attachments;
    ctx.restart = restart;
    ctx
}
