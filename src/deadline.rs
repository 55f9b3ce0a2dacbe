use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Expiry and cooperative cancellation for long-running store operations.
///
/// `checkpoint` and `close` take a deadline so the host can bound how long
/// shutdown work may run, for example inside a background-task grant from the
/// operating system. Clones share the cancellation flag: cancelling any clone
/// cancels them all.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    expires_at: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Deadline {
    /// A deadline that never expires on its own. It can still be cancelled.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            expires_at: Some(instant),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// True once the deadline has passed or has been cancelled.
    pub fn is_expired(&self) -> bool {
        self.is_cancelled() || self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before expiry, `None` if the deadline has no expiry.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_expires() {
        let deadline = Deadline::none();
        assert!(!deadline.is_expired());
        assert!(deadline.remaining().is_none());
    }

    #[test]
    fn test_after_expires() {
        let deadline = Deadline::after(Duration::from_millis(10));
        assert!(!deadline.is_expired());
        std::thread::sleep(Duration::from_millis(20));
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let deadline = Deadline::after(Duration::from_secs(3600));
        let clone = deadline.clone();
        clone.cancel();
        assert!(deadline.is_cancelled());
        assert!(deadline.is_expired());
    }
}
