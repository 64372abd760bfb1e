//! Per-run flag telling a shutdown handler that a publish watch is running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set while a content library publish is being watched.
///
/// Owned by one run's [`super::RunContext`]; clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct PublishWatch {
    active: Arc<AtomicBool>,
}

impl PublishWatch {
    /// Creates an inactive flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a watch guard is alive.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Marks the watch active until the returned guard is dropped.
    #[must_use = "the watch ends when the guard is dropped"]
    pub fn begin(&self) -> PublishWatchGuard {
        self.active.store(true, Ordering::SeqCst);
        PublishWatchGuard {
            active: Arc::clone(&self.active),
        }
    }
}

/// Clears the [`PublishWatch`] flag on drop.
#[derive(Debug)]
pub struct PublishWatchGuard {
    active: Arc<AtomicBool>,
}

impl Drop for PublishWatchGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_scopes_flag() {
        let watch = PublishWatch::new();
        assert!(!watch.is_active());
        {
            let _guard = watch.begin();
            assert!(watch.is_active());
            assert!(watch.clone().is_active());
        }
        assert!(!watch.is_active());
    }

    #[test]
    fn test_runs_do_not_share_flags() {
        let a = PublishWatch::new();
        let b = PublishWatch::new();
        let _guard = a.begin();
        assert!(!b.is_active());
    }
}
