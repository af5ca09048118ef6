//! Progress updates emitted while a workflow runs.
//!
//! Embedders (an SSE endpoint, a TUI, the CLI) install a [`ProgressWriter`]
//! to receive `STDOUT` outputs as they are committed. The engine never prints;
//! the same outputs are also returned in the run summary.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    StepStarted,
    StepCompleted,
    StepFailed,
    LoopIteration,
    LoopFinished,
    Output,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub step: String,
    #[serde(default)]
    pub message: String,
    /// Text destined for `STDOUT`, when this update carries any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
}

impl ProgressUpdate {
    pub fn new(kind: ProgressKind, step: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            step: step.to_string(),
            message: message.into(),
            stdout: None,
        }
    }

    pub fn output(step: &str, text: &str) -> Self {
        Self {
            kind: ProgressKind::Output,
            step: step.to_string(),
            message: String::new(),
            stdout: Some(text.to_string()),
        }
    }
}

/// Sink for progress updates. Sending never blocks and never fails the run.
pub trait ProgressWriter: Send + Sync {
    fn send(&self, update: ProgressUpdate);
}

impl ProgressWriter for broadcast::Sender<ProgressUpdate> {
    fn send(&self, update: ProgressUpdate) {
        // no subscribers is fine
        let _ = broadcast::Sender::send(self, update);
    }
}

impl ProgressWriter for mpsc::UnboundedSender<ProgressUpdate> {
    fn send(&self, update: ProgressUpdate) {
        if mpsc::UnboundedSender::send(self, update).is_err() {
            tracing::debug!("[Workflow] Progress receiver dropped");
        }
    }
}

pub type SharedProgressWriter = Arc<dyn ProgressWriter>;
