use std::cell::Cell;
use std::time::{Duration, Instant};

/// Milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Per-loop cached wall clock. An event loop invalidates it once per
/// iteration; every dispatch in that iteration then shares a single
/// `now_millis` computation instead of issuing a syscall per callback.
pub struct CachedClock {
    millis: Cell<i64>, // 0 = invalidated
}

impl Default for CachedClock {
    fn default() -> Self {
        Self::new()
    }
}
impl CachedClock {
    pub fn new() -> Self {
        Self {
            millis: Cell::new(0),
        }
    }
    /// Forget the cached timestamp. The next `now_millis` recomputes it.
    pub fn invalidate(&self) {
        self.millis.set(0);
    }
    /// Cached epoch millis, computed at most once between invalidations.
    pub fn now_millis(&self) -> i64 {
        let cached = self.millis.get();
        if cached != 0 {
            return cached;
        }
        let now = now_millis();
        self.millis.set(now);
        now
    }
}

/// Coarse deadline helper for polling loops in tests and examples.
pub struct Timer {
    start: Instant,
    timeout: Duration,
}

impl Timer {
    pub fn new_millis(timeout_millis: u64) -> Self {
        Self {
            start: Instant::now(),
            timeout: Duration::from_millis(timeout_millis),
        }
    }
    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.timeout
    }
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
    pub fn restart(&mut self) {
        self.start = Instant::now();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_cached_clock() {
        let clock = CachedClock::new();
        let a = clock.now_millis();
        assert!(a > 0);
        // cached until invalidated.
        assert_eq!(a, clock.now_millis());
        clock.invalidate();
        let b = clock.now_millis();
        assert!(b >= a);
    }

    #[test]
    pub fn test_timer() {
        let mut timer = Timer::new_millis(10);
        assert!(!timer.expired());
        std::thread::sleep(Duration::from_millis(20));
        assert!(timer.expired());
        timer.restart();
        assert!(!timer.expired());
    }
}
