use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use stratum_core::event::EventBus;
use stratum_core::types::{CorrelationId, EventKind, GraphEvent};

/// JSONL run logger.
///
/// Watches the event bus for one correlation id and writes one JSON object
/// per line. Lines are flushed as they are written, so a crash mid-run
/// leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    correlation_id: String,
    event_type: String,
    step: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Logs are written to `{log_dir}/{correlation_id}/{timestamp}.jsonl`.
    /// `level`: 1 = graph start/end, 2 = plus node errors, 3 = every event.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and write in the background until the run ends.
    ///
    /// Subscribing before the run starts guarantees the graph-start event
    /// is captured.
    pub fn spawn(
        self,
        bus: &EventBus,
        correlation_id: CorrelationId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = bus.watch();
        tokio::spawn(self.run(rx, correlation_id, cancel))
    }

    /// Write entries until cancellation or the run's graph-end event.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<GraphEvent>,
        correlation_id: CorrelationId,
        cancel: CancellationToken,
    ) {
        let run_dir = self.log_dir.join(correlation_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%.3f").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.correlation_id != correlation_id {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if event.kind == EventKind::GraphEnd {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry, or `None` if filtered by level.
    fn event_to_entry(&self, event: &GraphEvent) -> Option<LogEntry> {
        let required = match event.kind {
            EventKind::GraphStart | EventKind::GraphEnd => 1,
            EventKind::NodeError => 2,
            EventKind::NodeStart | EventKind::NodeEnd => 3,
        };
        if self.level < required {
            return None;
        }

        let mut detail = serde_json::Map::new();
        if let Some(status) = event.status {
            detail.insert("status".into(), serde_json::json!(status));
        }
        if let Some(message) = &event.message {
            detail.insert("message".into(), serde_json::json!(message));
        }
        if event.error_count > 0 {
            detail.insert("error_count".into(), serde_json::json!(event.error_count));
        }

        Some(LogEntry {
            timestamp: event.timestamp.to_rfc3339(),
            correlation_id: event.correlation_id.to_string(),
            event_type: event.kind.as_str().to_string(),
            step: event.step,
            node: event.node.clone(),
            detail: (!detail.is_empty()).then(|| serde_json::Value::Object(detail)),
        })
    }
}
