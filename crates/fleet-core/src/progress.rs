//! Progress messages streamed back to operators.
//!
//! Long-running operations (moves, rebalances, auto-scale runs) report
//! progress as newline-delimited JSON, one object per line:
//!
//! ```text
//! {"Message":"Moving 2 units...\n"}
//! {"Error":"unit abc not found"}
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// A single line of a progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressEvent {
    Message(String),
    Error(String),
}

impl ProgressEvent {
    /// Encode as one NDJSON line (trailing newline included).
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }
}

/// Cloneable sink for progress events.
///
/// Sending never blocks and never fails: once the receiving side is
/// gone, messages are only logged.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl Progress {
    /// A sink paired with the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that only logs.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn message(&self, msg: impl Into<String>) {
        let msg = msg.into();
        debug!(progress = %msg.trim_end());
        self.send(ProgressEvent::Message(msg));
    }

    pub fn error(&self, msg: impl Into<String>) {
        let msg = msg.into();
        debug!(progress_error = %msg);
        self.send(ProgressEvent::Error(msg));
    }

    fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Drain everything currently buffered in a receiver.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
