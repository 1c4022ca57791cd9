//! Commit progress notifications

use dsvn_core::{NodeKind, Revnum};
use std::sync::Mutex;

/// Event emitted while a commit runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitEvent {
    Added {
        path: String,
        kind: NodeKind,
        copied: bool,
    },
    Deleted {
        path: String,
    },
    Replaced {
        path: String,
        kind: NodeKind,
    },
    Modified {
        path: String,
        text: bool,
        props: bool,
    },
    /// The text delta of one file was sent
    DeltaSent {
        path: String,
    },
    Completed {
        revision: Revnum,
    },
    Failed {
        message: String,
    },
    /// The commit succeeded but local bookkeeping did not
    PostCommitWarning {
        message: String,
    },
}

/// Receiver of commit events
pub trait NotifySink: Send + Sync {
    fn notify(&self, event: &CommitEvent);
}

impl<F> NotifySink for F
where
    F: Fn(&CommitEvent) + Send + Sync,
{
    fn notify(&self, event: &CommitEvent) {
        self(event)
    }
}

/// Discards all events
pub struct NullSink;

impl NotifySink for NullSink {
    fn notify(&self, _event: &CommitEvent) {}
}

/// Logs events through `tracing`
pub struct TracingSink;

impl NotifySink for TracingSink {
    fn notify(&self, event: &CommitEvent) {
        match event {
            CommitEvent::Added { path, kind, copied } => {
                tracing::info!("Adding {} {}{}", kind, path, if *copied { " (copy)" } else { "" })
            }
            CommitEvent::Deleted { path } => tracing::info!("Deleting {}", path),
            CommitEvent::Replaced { path, .. } => tracing::info!("Replacing {}", path),
            CommitEvent::Modified { path, .. } => tracing::info!("Sending {}", path),
            CommitEvent::DeltaSent { path } => tracing::debug!("Transmitted text of {}", path),
            CommitEvent::Completed { revision } => {
                tracing::info!("Committed revision {}", revision)
            }
            CommitEvent::Failed { message } => tracing::error!("Commit failed: {}", message),
            CommitEvent::PostCommitWarning { message } => {
                tracing::warn!("Post-commit processing failed: {}", message)
            }
        }
    }
}

/// Records every event, for inspection in tests and dry runs
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<CommitEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CommitEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl NotifySink for CollectingSink {
    fn notify(&self, event: &CommitEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}
