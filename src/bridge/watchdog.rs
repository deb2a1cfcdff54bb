//! Link inactivity watchdog for detecting a wedged bridge
//!
//! Each bridge request stores its start time in an atomic; the watchdog
//! periodically scans these timestamps and warns when a request has been
//! outstanding longer than the configured threshold. The time of the last
//! completed request is kept as well so callers can see how long a link has
//! been idle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Timestamp in milliseconds since UNIX_EPOCH
#[inline(always)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Shared state for a single link's request tracking
struct LinkState {
    /// Timestamp (ms since epoch) when the outstanding request started, or 0 if idle
    request_start: AtomicU64,
    /// Timestamp (ms since epoch) when the last request finished
    last_activity: AtomicU64,
    /// Already warned about the outstanding request
    has_warned: AtomicBool,
    link_name: String,
}

/// Handle to a link's watchdog state (held by the transport)
#[derive(Clone)]
pub struct WatchdogHandle {
    state: Arc<LinkState>,
}

impl WatchdogHandle {
    /// Mark the start of a request
    #[inline(always)]
    pub fn start_operation(&self) {
        self.state.request_start.store(now_millis(), Ordering::Relaxed);
        self.state.has_warned.store(false, Ordering::Relaxed);
    }

    /// Mark the end of a request and reset the inactivity timer
    #[inline(always)]
    pub fn finish_operation(&self) {
        if self.state.has_warned.load(Ordering::Relaxed) {
            info!("Link '{}' responsive again", self.state.link_name);
            self.state.has_warned.store(false, Ordering::Relaxed);
        }
        self.state.request_start.store(0, Ordering::Relaxed);
        self.state.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Time since the last request completed
    pub fn idle_for(&self) -> Duration {
        let last = self.state.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    /// Whether a request is currently outstanding
    pub fn is_busy(&self) -> bool {
        self.state.request_start.load(Ordering::Relaxed) != 0
    }
}

/// Shared watchdog state
#[derive(Clone)]
pub struct Watchdog {
    links: Arc<Mutex<Vec<Weak<LinkState>>>>,
    enabled: Arc<AtomicBool>,
    threshold: Duration,
}

impl Watchdog {
    /// Create a new watchdog that flags requests outstanding longer than `threshold`
    pub fn new(threshold: Duration) -> Self {
        Self {
            links: Arc::new(Mutex::new(Vec::new())),
            enabled: Arc::new(AtomicBool::new(true)),
            threshold,
        }
    }

    /// Register a link for monitoring
    pub fn register_link(&self, link_name: &str) -> WatchdogHandle {
        let state = Arc::new(LinkState {
            request_start: AtomicU64::new(0),
            last_activity: AtomicU64::new(now_millis()),
            has_warned: AtomicBool::new(false),
            link_name: link_name.to_string(),
        });

        self.links.lock().unwrap().push(Arc::downgrade(&state));

        WatchdogHandle { state }
    }

    /// Check for wedged links; returns the names of links newly flagged by this scan
    pub fn check_for_blocked(&self) -> Vec<String> {
        let now = now_millis();
        let threshold_ms = self.threshold.as_millis() as u64;
        let mut flagged = Vec::new();

        let mut links = self.links.lock().unwrap();
        links.retain(|weak| {
            let Some(state) = weak.upgrade() else {
                return false;
            };
            let start = state.request_start.load(Ordering::Relaxed);
            if start > 0 {
                let duration_ms = now.saturating_sub(start);
                if duration_ms > threshold_ms && !state.has_warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        "Link '{}' wedged: request outstanding for {:.1}s",
                        state.link_name,
                        duration_ms as f64 / 1000.0
                    );
                    flagged.push(state.link_name.clone());
                }
            }
            true
        });

        flagged
    }

    /// Start the watchdog monitoring thread
    pub fn start_monitoring_thread(&self) -> std::thread::JoinHandle<()> {
        let watchdog = self.clone();
        let period = (self.threshold / 4).max(Duration::from_millis(10));
        std::thread::spawn(move || {
            while watchdog.enabled.load(Ordering::Relaxed) {
                std::thread::sleep(period);
                watchdog.check_for_blocked();
            }
        })
    }

    /// Stop the watchdog monitoring thread
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }
}

/// RAII guard for tracking one request
pub struct OperationGuard<'a> {
    handle: &'a WatchdogHandle,
}

impl<'a> OperationGuard<'a> {
    #[inline(always)]
    pub fn new(handle: &'a WatchdogHandle) -> Self {
        handle.start_operation();
        Self { handle }
    }
}

impl Drop for OperationGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.handle.finish_operation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_marks_busy_then_idle() {
        let wd = Watchdog::new(Duration::from_secs(5));
        let handle = wd.register_link("uart");
        assert!(!handle.is_busy());
        {
            let _guard = OperationGuard::new(&handle);
            assert!(handle.is_busy());
        }
        assert!(!handle.is_busy());
        assert!(handle.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn test_check_for_blocked_flags_once() {
        let wd = Watchdog::new(Duration::from_millis(0));
        let handle = wd.register_link("tcp");
        handle.start_operation();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(wd.check_for_blocked(), vec!["tcp".to_string()]);
        // Second scan does not re-flag the same request
        assert!(wd.check_for_blocked().is_empty());

        handle.finish_operation();
        assert!(wd.check_for_blocked().is_empty());
    }

    #[test]
    fn test_dropped_links_are_forgotten() {
        let wd = Watchdog::new(Duration::from_millis(0));
        {
            let handle = wd.register_link("gone");
            handle.start_operation();
        }
        assert!(wd.check_for_blocked().is_empty());
        assert!(wd.links.lock().unwrap().is_empty());
    }
}
