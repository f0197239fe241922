use std::time::Instant;
use tracing::trace;

use crate::utils::format_instant;

/// A single rearmable deadline. Arming replaces any pending deadline and
/// cancelling suppresses it; the owner polls it from its event loop.
#[derive(Debug, Default)]
pub(crate) struct LossTimer {
    deadline: Option<Instant>,
}

impl LossTimer {
    pub(crate) fn update(&mut self, deadline: Instant, now: Instant) {
        trace!("Loss timer armed at {}", format_instant(deadline, now));
        self.deadline = Some(deadline);
    }

    pub(crate) fn cancel(&mut self) {
        if self.deadline.take().is_some() {
            trace!("Loss timer cancelled");
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Disarms the timer if it has fired and reports whether it did.
    pub(crate) fn take_expired(&mut self, now: Instant) -> bool {
        if self.is_expired(now) {
            self.deadline = None;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rearm_replaces_deadline() {
        let now = Instant::now();
        let mut timer = LossTimer::default();
        timer.update(now + Duration::from_millis(100), now);
        timer.update(now + Duration::from_millis(10), now);
        assert_eq!(timer.deadline(), Some(now + Duration::from_millis(10)));

        assert!(!timer.take_expired(now));
        assert!(timer.take_expired(now + Duration::from_millis(10)));
        assert_eq!(timer.deadline(), None);
    }

    #[test]
    fn test_cancel_suppresses_firing() {
        let now = Instant::now();
        let mut timer = LossTimer::default();
        timer.update(now, now);
        timer.cancel();
        assert!(!timer.is_expired(now + Duration::from_secs(1)));
    }
}
