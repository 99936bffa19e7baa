//! Cooperative token streaming and the per-run stop flag.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use stratum_core::types::CorrelationId;

/// One streamed increment produced by a node.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamIncrement {
    pub correlation_id: CorrelationId,
    pub node: String,
    pub token: String,
}

/// Bounded sink a node writes increments to.
///
/// `emit` waits when the caller is slow to drain, and reports `false` once
/// the run is stopped or the receiver is gone. Nodes should stop producing
/// at that point; the increment being emitted is never split.
#[derive(Debug, Clone)]
pub struct TokenSink {
    tx: Option<mpsc::Sender<StreamIncrement>>,
    cancel: CancellationToken,
    correlation_id: CorrelationId,
    node: String,
}

impl TokenSink {
    /// A sink that discards increments but still honors the stop flag.
    pub fn disabled(cancel: CancellationToken) -> Self {
        Self {
            tx: None,
            cancel,
            correlation_id: CorrelationId::from_str(""),
            node: String::new(),
        }
    }

    /// Same channel, attributed to another node.
    pub fn for_node(&self, correlation_id: &CorrelationId, node: &str) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
            correlation_id: correlation_id.clone(),
            node: node.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn emit(&self, token: impl Into<String>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let Some(tx) = &self.tx else {
            return true;
        };
        let increment = StreamIncrement {
            correlation_id: self.correlation_id.clone(),
            node: self.node.clone(),
            token: token.into(),
        };
        tokio::select! {
            sent = tx.send(increment) => sent.is_ok(),
            _ = self.cancel.cancelled() => false,
        }
    }
}

/// Receiving half drained by the caller.
pub type TokenStream = mpsc::Receiver<StreamIncrement>;

/// Create a bounded streaming channel tied to `cancel`.
pub fn token_channel(capacity: usize, cancel: CancellationToken) -> (TokenSink, TokenStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = TokenSink {
        tx: Some(tx),
        cancel,
        correlation_id: CorrelationId::from_str(""),
        node: String::new(),
    };
    (sink, rx)
}

/// Per-run control handles: the stop flag and the streaming sink.
#[derive(Debug, Clone)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub sink: TokenSink,
}

impl RunControl {
    pub fn new() -> Self {
        let cancel = CancellationToken::new();
        Self {
            sink: TokenSink::disabled(cancel.clone()),
            cancel,
        }
    }

    /// Run control that streams into a fresh channel of `capacity`.
    pub fn streaming(capacity: usize) -> (Self, TokenStream) {
        let cancel = CancellationToken::new();
        let (sink, rx) = token_channel(capacity, cancel.clone());
        (Self { cancel, sink }, rx)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_attributes_node() {
        let (control, mut rx) = RunControl::streaming(4);
        let sink = control.sink.for_node(&CorrelationId::from_str("t-1"), "respond");
        assert!(sink.emit("Hello").await);
        let inc = rx.recv().await.unwrap();
        assert_eq!(inc.node, "respond");
        assert_eq!(inc.token, "Hello");
        assert_eq!(inc.correlation_id.as_str(), "t-1");
    }

    #[tokio::test]
    async fn test_emit_stops_after_cancel() {
        let (control, mut rx) = RunControl::streaming(4);
        let sink = control.sink.clone();
        assert!(sink.emit("a").await);
        control.stop();
        assert!(!sink.emit("b").await);
        assert_eq!(rx.recv().await.unwrap().token, "a");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_channel_unblocks_on_cancel() {
        let (control, _rx) = RunControl::streaming(1);
        let sink = control.sink.clone();
        assert!(sink.emit("fills the buffer").await);

        let waiter = tokio::spawn(async move { sink.emit("blocked").await });
        tokio::task::yield_now().await;
        control.stop();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_sink() {
        let control = RunControl::new();
        assert!(control.sink.emit("dropped").await);
        control.stop();
        assert!(!control.sink.emit("dropped").await);
    }
}
