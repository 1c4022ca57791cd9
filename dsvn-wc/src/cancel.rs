//! Cooperative cancellation

use crate::error::{CommitError, Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type Probe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Shared flag polled at well-defined points of the pipeline.
///
/// Cloning shares the flag; once cancelled it stays cancelled. A token may
/// also carry a probe, asked on every poll, for callers that learn about
/// cancellation from elsewhere (a signal handler, a UI).
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    probe: Option<Probe>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is also cancelled once `probe` returns true
    pub fn with_probe(probe: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self {
            flag: Arc::default(),
            probe: Some(Arc::new(probe)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        if self.probe.as_ref().is_some_and(|probe| probe()) {
            self.cancel();
            return true;
        }
        false
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CommitError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.flag.load(Ordering::SeqCst))
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());
        other.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(CommitError::Cancelled)));
    }

    #[test]
    fn test_probe_latches() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let token = CancelToken::with_probe(move || counter.fetch_add(1, Ordering::SeqCst) == 1);
        assert!(token.check().is_ok());
        assert!(token.check().is_err());
        assert!(token.check().is_err());
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }
}
