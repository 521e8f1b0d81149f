//! Source event callbacks and the shutdown signal they trip.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Something the line source reports about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// Reading from the source failed
    Error { source: String, message: String },
    /// The source closed or was told to stop
    Stopped { source: String },
}

/// Callbacks invoked on the source's own task, never on the batch loop.
/// Implementations must be cheap and thread-safe.
pub trait SourceListener: Send + Sync {
    fn on_error(&self, event: &SourceEvent);
    fn on_stopped(&self, event: &SourceEvent);
}

/// Why the engine left RUNNING
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Timeout,
    SourceStopped,
    SourceError(String),
    Signal,
    Fatal(String),
}

impl StopReason {
    /// Non-error stops exit 0
    pub fn is_graceful(&self) -> bool {
        !matches!(self, StopReason::Fatal(_))
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Timeout => f.write_str("run duration elapsed"),
            StopReason::SourceStopped => f.write_str("source stopped"),
            StopReason::SourceError(e) => write!(f, "source error: {}", e),
            StopReason::Signal => f.write_str("signal received"),
            StopReason::Fatal(e) => write!(f, "fatal error: {}", e),
        }
    }
}

/// Single-fire stop request shared by every trigger. The first reason wins;
/// later requests are no-ops.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: Arc<OnceCell<StopReason>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call was the one that initiated shutdown
    pub fn request(&self, reason: StopReason) -> bool {
        let first = self.reason.set(reason.clone()).is_ok();
        if first {
            info!(reason = %reason, "Shutdown requested");
        }
        self.token.cancel();
        first
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.get().cloned()
    }

    pub async fn requested(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Turns source error/stop events into shutdown requests
pub struct FailureListener {
    shutdown: ShutdownSignal,
}

impl FailureListener {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self { shutdown }
    }
}

impl SourceListener for FailureListener {
    fn on_error(&self, event: &SourceEvent) {
        warn!(event = ?event, "Source error, stopping");
        let message = match event {
            SourceEvent::Error { message, .. } => message.clone(),
            SourceEvent::Stopped { source } => format!("{} stopped", source),
        };
        self.shutdown.request(StopReason::SourceError(message));
    }

    fn on_stopped(&self, event: &SourceEvent) {
        info!(event = ?event, "Source stopped, stopping");
        self.shutdown.request(StopReason::SourceStopped);
    }
}
