use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks the most recent submission that referenced a resource.
///
/// The worker marks every resource named by a submitted command buffer with
/// the submission's id; a resource is "in use" while that id is newer than
/// the last submission the device has observed to complete. Producers use
/// this to decide whether a map must wait.
#[derive(Debug, Default)]
pub struct UseTracker {
    last_use: AtomicU64,
}

impl UseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the resource as referenced by `submission`.
    pub fn mark(&self, submission: u64) {
        self.last_use.fetch_max(submission, Ordering::Release);
    }

    /// The id of the most recent submission that referenced the resource.
    pub fn last_use(&self) -> u64 {
        self.last_use.load(Ordering::Acquire)
    }

    /// Whether any submission referencing the resource is still pending,
    /// given the id of the last completed submission.
    pub fn is_in_use(&self, last_completed: u64) -> bool {
        self.last_use() > last_completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_use_until_submission_completes() {
        let tracker = UseTracker::new();
        assert!(!tracker.is_in_use(0));

        tracker.mark(3);
        assert!(tracker.is_in_use(2));
        assert!(!tracker.is_in_use(3));
    }

    #[test]
    fn mark_keeps_newest_submission() {
        let tracker = UseTracker::new();
        tracker.mark(5);
        tracker.mark(2);
        assert_eq!(tracker.last_use(), 5);
    }
}
