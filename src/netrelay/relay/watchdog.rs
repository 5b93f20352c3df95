use std::time::{Duration, Instant};

/// How a single readiness wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// At least one event was returned.
    Ready,
    /// Nothing was returned and the requested timeout elapsed.
    TimedOut,
    /// Nothing was returned before the timeout.
    Spurious,
}

/// Detects a multiplexer that keeps returning empty result sets without
/// blocking, the symptom of a broken epoll instance.
///
/// A spurious return only counts once the loop has been waking empty for
/// `window` without interruption; the counter itself is cleared on a fixed
/// schedule by the event loop.
#[derive(Debug)]
pub struct EmptyPollWatchdog {
    threshold: u32,
    window: Duration,
    count: u32,
    empty_since: Option<Instant>,
}

impl EmptyPollWatchdog {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            count: 0,
            empty_since: None,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns `true` when the multiplexer should be rebuilt.
    pub fn observe(&mut self, outcome: PollOutcome, now: Instant) -> bool {
        match outcome {
            PollOutcome::Ready | PollOutcome::TimedOut => {
                self.empty_since = None;
                false
            }
            PollOutcome::Spurious => {
                let since = *self.empty_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= self.window {
                    self.count += 1;
                }
                self.count >= self.threshold
            }
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.empty_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_only_sustained_spurious_wakeups() {
        let mut w = EmptyPollWatchdog::new(3, Duration::from_millis(10));
        let t0 = Instant::now();

        assert!(!w.observe(PollOutcome::Spurious, t0));
        assert!(!w.observe(PollOutcome::Spurious, t0 + Duration::from_millis(5)));
        assert_eq!(w.count(), 0);

        assert!(!w.observe(PollOutcome::Spurious, t0 + Duration::from_millis(10)));
        assert!(!w.observe(PollOutcome::Spurious, t0 + Duration::from_millis(11)));
        assert_eq!(w.count(), 2);
        assert!(w.observe(PollOutcome::Spurious, t0 + Duration::from_millis(12)));

        w.reset();
        assert_eq!(w.count(), 0);
    }

    #[test]
    fn real_events_and_timeouts_break_the_streak() {
        let mut w = EmptyPollWatchdog::new(2, Duration::from_millis(10));
        let t0 = Instant::now();
        w.observe(PollOutcome::Spurious, t0);
        w.observe(PollOutcome::Ready, t0 + Duration::from_millis(20));
        assert!(!w.observe(PollOutcome::Spurious, t0 + Duration::from_millis(21)));
        w.observe(PollOutcome::TimedOut, t0 + Duration::from_millis(40));
        assert!(!w.observe(PollOutcome::Spurious, t0 + Duration::from_millis(41)));
        assert_eq!(w.count(), 0);
    }
}
