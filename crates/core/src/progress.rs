//! Ordered progress event channel.
//!
//! Pipelines push events into an `mpsc` sender; the caller (CLI, or any
//! front end) drains the receiver. Producers never block on a slow or
//! dropped consumer.

use std::sync::mpsc::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Denoise,
    Split,
    Infer,
    Merge,
    RefineFaces,
    TemporalBlend,
    Save,
    Decode,
    Encode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Emitted after a stage transition; `overall` is job completion in [0,1].
    Progress { stage: Stage, overall: f32 },
    /// Non-fatal condition the user should see (device fallback, skipped
    /// blend, skipped face).
    Warning(String),
}

pub type ProgressSender = Sender<ProgressEvent>;

/// Send without caring whether anyone is still listening.
pub(crate) fn emit(progress: Option<&ProgressSender>, event: ProgressEvent) {
    if let Some(tx) = progress {
        let _ = tx.send(event);
    }
}
