//! Progress reporting boundary between a provisioning worker and its caller.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::process::OutputSource;

/// Provisioning stages in the order a task visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    CheckingRuntime,
    EnsuringCredentials,
    QueryingRegistry,
    CreatingInstance,
    StartingInstance,
    ConfiguringRemote,
    Completed,
    Failed,
    Cancelled,
}

impl Stage {
    pub fn title(self) -> &'static str {
        match self {
            Self::CheckingRuntime => "Checking for Multipass",
            Self::EnsuringCredentials => "Preparing SSH credentials",
            Self::QueryingRegistry => "Looking for the Dangerzone VM",
            Self::CreatingInstance => "Creating the Dangerzone VM",
            Self::StartingInstance => "Starting the Dangerzone VM",
            Self::ConfiguringRemote => "Updating the Dangerzone container",
            Self::Completed => "Ready",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// An immutable progress snapshot handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The task entered a new stage.
    Stage(Stage),
    /// Coarse `(stageTitle, detailText)` update.
    Status { title: String, detail: String },
    /// Live status line of a running external command. Replaces, never
    /// appends to, the previous line from the same source.
    Output { source: OutputSource, line: String },
    /// Byte-level download progress; `total` is `None` when indeterminate.
    Download { downloaded: u64, total: Option<u64> },
    /// Terminal notification, carrying the failure message if any.
    Finished { stage: Stage, message: Option<String> },
}

impl ProgressEvent {
    pub fn status(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Status {
            title: title.into(),
            detail: detail.into(),
        }
    }
}

/// Implemented by whoever displays progress (GUI, CLI, tests).
///
/// Events for one task arrive in the order they are generated, from a single
/// producer.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Sink that forwards every event over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        // Receiver gone means nobody is watching anymore; keep working.
        let _ = self.tx.send(event);
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Cooperative cancellation flag shared between a caller and a worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
