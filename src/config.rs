//! Polling and bridge timing configuration

use std::time::{Duration, Instant};

/// Bounded polling policy with exponential backoff
///
/// Used for every "spin until the device says so" loop: capture completion,
/// transceiver ready bits, and any caller-driven [`RemoteClient::poll`].
///
/// [`RemoteClient::poll`]: crate::RemoteClient::poll
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitPolicy {
    /// Give up after this long
    pub timeout: Duration,
    /// Delay before the second poll
    pub poll_interval: Duration,
    /// Multiplier applied to the interval after each unsuccessful poll (>= 1.0)
    pub backoff: f64,
    /// Ceiling for the interval
    pub max_interval: Duration,
}

impl WaitPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Backoff factors below 1.0 are treated as 1.0 (fixed interval)
    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff.max(1.0);
        self
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    /// Start a polling session under this policy
    pub fn start(&self) -> PollTimer {
        PollTimer {
            started: Instant::now(),
            deadline: Instant::now() + self.timeout,
            interval: self.poll_interval,
            policy: *self,
        }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(1),
            backoff: 2.0,
            max_interval: Duration::from_millis(100),
        }
    }
}

/// Running state of one polling loop
#[derive(Debug)]
pub struct PollTimer {
    started: Instant,
    deadline: Instant,
    interval: Duration,
    policy: WaitPolicy,
}

impl PollTimer {
    /// Sleep until the next poll is due.
    ///
    /// Returns `false` once the deadline has passed; the caller should then give up.
    /// The final sleep is shortened so the loop never overshoots the deadline by more
    /// than one poll.
    pub fn wait(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.deadline {
            return false;
        }
        let sleep = self.interval.min(self.deadline - now);
        std::thread::sleep(sleep);

        let next = self.interval.as_secs_f64() * self.policy.backoff;
        self.interval = Duration::from_secs_f64(next).min(self.policy.max_interval);
        true
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Timing configuration for a bridge transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// How long `request` waits for a response before failing with a timeout
    pub response_timeout: Duration,
    /// How long one request may stay outstanding before the watchdog reports the link wedged
    pub inactivity_threshold: Duration,
}

impl BridgeConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_inactivity_threshold(mut self, threshold: Duration) -> Self {
        self.inactivity_threshold = threshold;
        self
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(1),
            inactivity_threshold: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_caps_at_max_interval() {
        let policy = WaitPolicy::new(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(1))
            .with_backoff(4.0)
            .with_max_interval(Duration::from_millis(5));
        let mut timer = policy.start();

        assert!(timer.wait());
        assert_eq!(timer.interval, Duration::from_millis(4));
        assert!(timer.wait());
        assert_eq!(timer.interval, Duration::from_millis(5));
    }

    #[test]
    fn test_timer_expires() {
        let policy = WaitPolicy::new(Duration::from_millis(20))
            .with_poll_interval(Duration::from_millis(5))
            .with_backoff(1.0);
        let mut timer = policy.start();
        let mut polls = 0;
        while timer.wait() {
            polls += 1;
            assert!(polls < 100, "timer never expired");
        }
        assert!(timer.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_backoff_below_one_is_clamped() {
        let policy = WaitPolicy::default().with_backoff(0.5);
        assert_eq!(policy.backoff, 1.0);
    }
}
