//! Cancellation and deadlines for driver calls.

use super::driver::DriverError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Caller context handed to every driver call.
///
/// Clones share the cancel flag, so a scheduler can keep one clone and
/// cancel the attempt running on a worker thread. A deadline, when set,
/// cancels the token once it passes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    canceled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().with_deadline(Instant::now() + timeout)
    }

    /// Set the deadline, keeping the shared flag.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Cancel this token and every clone of it.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// `Err(Canceled)` once the token is canceled or expired.
    pub fn check(&self) -> Result<(), DriverError> {
        if self.is_canceled() {
            return Err(DriverError::Canceled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_shared_across_clones() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(worker.check().is_ok());
        assert_eq!(token.remaining(), None);

        token.cancel();
        assert!(worker.is_canceled());
        assert!(matches!(worker.check(), Err(DriverError::Canceled)));
    }

    #[test]
    fn test_deadline_expires() {
        let expired = CancelToken::new().with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(expired.is_canceled());
        assert_eq!(expired.remaining(), Some(Duration::ZERO));

        let open = CancelToken::with_timeout(Duration::from_secs(3600));
        assert!(!open.is_canceled());
        assert!(open.remaining().is_some_and(|left| left > Duration::from_secs(3500)));
    }
}
