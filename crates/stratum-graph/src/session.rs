use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use stratum_core::context::Context;
use stratum_core::error::Result;
use stratum_core::event::EventHandler;
use stratum_core::types::{CorrelationId, EventKind, GraphEvent, NodeStatus};

/// Latest observed progress of a run. Non-authoritative: the checkpoint
/// store holds the real state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub correlation_id: CorrelationId,
    pub graph: String,
    pub running: bool,
    pub current_node: Option<String>,
    pub last_event: EventKind,
    pub step: usize,
    pub error_count: usize,
    pub processing_status: BTreeMap<String, NodeStatus>,
    #[serde(default)]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    fn new(event: &GraphEvent) -> Self {
        Self {
            correlation_id: event.correlation_id.clone(),
            graph: event.graph.clone(),
            running: true,
            current_node: None,
            last_event: event.kind,
            step: 0,
            error_count: 0,
            processing_status: BTreeMap::new(),
            message: None,
            updated_at: event.timestamp,
        }
    }

    fn observe(&mut self, event: &GraphEvent, ctx: &Context) {
        self.graph = event.graph.clone();
        self.last_event = event.kind;
        self.step = event.step;
        self.error_count = event.error_count;
        self.processing_status = ctx.processing_status.clone();
        self.updated_at = event.timestamp;
        match event.kind {
            EventKind::GraphStart => {
                self.running = true;
                self.current_node = None;
                self.message = None;
            }
            EventKind::NodeStart => self.current_node = event.node.clone(),
            EventKind::NodeEnd | EventKind::NodeError => {}
            EventKind::GraphEnd => {
                self.running = false;
                self.current_node = None;
                self.message = event.message.clone();
            }
        }
    }
}

type Slot = Arc<Mutex<SessionSnapshot>>;

const DEFAULT_FINISHED_CAPACITY: usize = 1024;

/// Progress cache keyed by correlation id, with one lock per id.
///
/// The outer map lock is only held to find or create a slot, so a poller
/// reading one conversation never waits on updates to another. Running
/// sessions are always kept; once more than `finished_capacity` sessions
/// have finished, the least recently updated ones are evicted.
pub struct SessionStateCache {
    sessions: Mutex<HashMap<CorrelationId, Slot>>,
    finished_capacity: usize,
}

impl Default for SessionStateCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FINISHED_CAPACITY)
    }
}

impl SessionStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(finished_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            finished_capacity: finished_capacity.max(1),
        }
    }

    /// Drop the oldest finished sessions beyond the capacity.
    fn evict_finished(&self) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut finished: Vec<(DateTime<Utc>, CorrelationId)> = sessions
            .iter()
            .filter_map(|(id, slot)| {
                let snap = slot.lock().unwrap_or_else(PoisonError::into_inner);
                (!snap.running).then(|| (snap.updated_at, id.clone()))
            })
            .collect();
        if finished.len() <= self.finished_capacity {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.finished_capacity;
        for (_, id) in finished.into_iter().take(excess) {
            sessions.remove(&id);
        }
        debug!(evicted = excess, "Evicted finished sessions");
    }

    fn slot(&self, id: &CorrelationId) -> Option<Slot> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn slot_or_insert(&self, event: &GraphEvent) -> Slot {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.correlation_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SessionSnapshot::new(event))))
            .clone()
    }

    /// Latest snapshot for `id`, if any run has been observed.
    pub fn get(&self, id: &CorrelationId) -> Option<SessionSnapshot> {
        let slot = self.slot(id)?;
        let snapshot = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(snapshot)
    }

    pub fn remove(&self, id: &CorrelationId) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    /// Ids whose most recent run is still in progress.
    pub fn running(&self) -> Vec<CorrelationId> {
        let slots: Vec<(CorrelationId, Slot)> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        let mut ids: Vec<CorrelationId> = slots
            .into_iter()
            .filter(|(_, slot)| slot.lock().unwrap_or_else(PoisonError::into_inner).running)
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventHandler for SessionStateCache {
    fn handle(&self, event: &GraphEvent, ctx: &Context) -> Result<()> {
        let slot = self.slot_or_insert(event);
        slot.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(event, ctx);
        if event.kind == EventKind::GraphEnd {
            self.evict_finished();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, node: Option<&str>, ctx: &Context, step: usize) -> GraphEvent {
        GraphEvent::from_context(kind, "research", node, ctx, step)
    }

    #[test]
    fn test_tracks_progress() {
        let cache = SessionStateCache::new();
        let mut ctx = Context::new(CorrelationId::from_str("t-s"), "q");
        cache
            .handle(&event(EventKind::GraphStart, None, &ctx, 0), &ctx)
            .unwrap();
        ctx.begin_node("plan").unwrap();
        cache
            .handle(&event(EventKind::NodeStart, Some("plan"), &ctx, 0), &ctx)
            .unwrap();

        let snap = cache.get(&ctx.correlation_id).unwrap();
        assert!(snap.running);
        assert_eq!(snap.current_node.as_deref(), Some("plan"));
        assert_eq!(snap.processing_status["plan"], NodeStatus::Processing);

        ctx.finish_node("plan", NodeStatus::Completed).unwrap();
        cache
            .handle(&event(EventKind::NodeEnd, Some("plan"), &ctx, 1), &ctx)
            .unwrap();
        cache
            .handle(
                &event(EventKind::GraphEnd, None, &ctx, 1).with_message("completed"),
                &ctx,
            )
            .unwrap();

        let snap = cache.get(&ctx.correlation_id).unwrap();
        assert!(!snap.running);
        assert_eq!(snap.step, 1);
        assert_eq!(snap.processing_status["plan"], NodeStatus::Completed);
        assert_eq!(snap.message.as_deref(), Some("completed"));
        assert!(cache.running().is_empty());
    }

    #[test]
    fn test_unknown_id() {
        let cache = SessionStateCache::new();
        assert!(cache.get(&CorrelationId::from_str("nope")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicts_oldest_finished_sessions() {
        let cache = SessionStateCache::with_capacity(2);
        let live = Context::new(CorrelationId::from_str("live"), "q");
        cache
            .handle(&event(EventKind::GraphStart, None, &live, 0), &live)
            .unwrap();

        for i in 0..4 {
            let ctx = Context::new(CorrelationId::from_str(&format!("done-{}", i)), "q");
            cache
                .handle(&event(EventKind::GraphStart, None, &ctx, 0), &ctx)
                .unwrap();
            cache
                .handle(&event(EventKind::GraphEnd, None, &ctx, 1), &ctx)
                .unwrap();
        }

        assert_eq!(cache.len(), 3);
        assert!(cache.get(&CorrelationId::from_str("live")).is_some());
        assert!(cache.get(&CorrelationId::from_str("done-0")).is_none());
        assert!(cache.get(&CorrelationId::from_str("done-1")).is_none());
        assert!(cache.get(&CorrelationId::from_str("done-3")).is_some());
    }

    #[test]
    fn test_concurrent_updates_and_polls() {
        let cache = Arc::new(SessionStateCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let id = format!("t-{}", i % 2);
                    let ctx = Context::new(CorrelationId::from_str(&id), "q");
                    for step in 0..100 {
                        let ev = event(EventKind::NodeEnd, Some("plan"), &ctx, step);
                        cache.handle(&ev, &ctx).unwrap();
                        let _ = cache.get(&ctx.correlation_id);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.running().len(), 2);
    }
}
