use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tracing::warn;

use crate::context::Context;
use crate::error::Result;
use crate::types::{EventKind, GraphEvent};

/// Observer invoked synchronously on publication.
///
/// Handlers run on the executor's path, so they should be quick; anything
/// slow belongs on a task fed from [`EventBus::watch`].
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &GraphEvent, ctx: &Context) -> Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&GraphEvent, &Context) -> Result<()> + Send + Sync,
{
    fn handle(&self, event: &GraphEvent, ctx: &Context) -> Result<()> {
        self(event, ctx)
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    /// `None` receives every kind.
    kind: Option<EventKind>,
    handler: Arc<dyn EventHandler>,
}

/// Lifecycle event dispatch for graph runs.
///
/// Registered handlers receive the event and the context it was published
/// with. Every event is also sent on a tokio broadcast channel for observers
/// that prefer to drain asynchronously.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<GraphEvent>,
    handlers: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self {
            tx,
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for one event kind.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        self.insert(Some(kind), handler)
    }

    /// Register `handler` for every event kind.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        self.insert(None, handler)
    }

    fn insert(&self, kind: Option<EventKind>, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription { id, kind, handler });
        id
    }

    /// Returns false if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|s| s.id != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Receiver for every event published after this call.
    pub fn watch(&self) -> tokio::sync::broadcast::Receiver<GraphEvent> {
        self.tx.subscribe()
    }

    /// Number of live `watch()` receivers.
    pub fn watcher_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish a bare lifecycle notification built from `ctx`.
    pub fn publish(&self, kind: EventKind, node: Option<&str>, ctx: &Context) {
        self.emit(GraphEvent::from_context(kind, "", node, ctx, 0), ctx);
    }

    /// Deliver a fully populated event.
    ///
    /// Handler errors and panics are logged and swallowed.
    pub fn emit(&self, event: GraphEvent, ctx: &Context) {
        // Snapshot the matching handlers so a handler may unsubscribe itself.
        let matching: Vec<(SubscriptionId, Arc<dyn EventHandler>)> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind.map_or(true, |k| k == event.kind))
            .map(|s| (s.id, s.handler.clone()))
            .collect();

        for (id, handler) in matching {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&event, ctx)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    subscription = id.0,
                    event = event.kind.as_str(),
                    error = %e,
                    "Event handler failed"
                ),
                Err(_) => warn!(
                    subscription = id.0,
                    event = event.kind.as_str(),
                    "Event handler panicked"
                ),
            }
        }

        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl GraphEvent {
    pub fn from_context(
        kind: EventKind,
        graph: &str,
        node: Option<&str>,
        ctx: &Context,
        step: usize,
    ) -> Self {
        Self {
            kind,
            correlation_id: ctx.correlation_id.clone(),
            graph: graph.to_string(),
            node: node.map(str::to_string),
            status: node.map(|n| ctx.status(n)),
            step,
            error_count: ctx.errors.len(),
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
