/*!
 * Cached monotonic clock
 *
 * One `clock_gettime` per event-loop iteration; everything else reads the
 * cached value. The cache is a static atomic rather than a field of the
 * server value because the signal handler refreshes it too, and a handler
 * may only touch async-signal-safe state.
 */

use std::sync::atomic::{AtomicU64, Ordering};

static CACHED_MS: AtomicU64 = AtomicU64::new(0);

#[cfg(unix)]
fn raw_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime is async-signal-safe, which `update` relies on
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return CACHED_MS.load(Ordering::Relaxed);
    }
    (ts.tv_sec as u64) * 1000 + (ts.tv_nsec as u64) / 1_000_000
}

/// Refresh the cache. Called after every readiness wait and from the signal
/// handler.
pub fn update() {
    CACHED_MS.store(raw_ms(), Ordering::Relaxed);
}

/// Milliseconds from the monotonic clock, as of the last `update`
pub fn now_ms() -> u64 {
    let cached = CACHED_MS.load(Ordering::Relaxed);
    if cached == 0 {
        // First use before any explicit update
        update();
        return CACHED_MS.load(Ordering::Relaxed);
    }
    cached
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_now_is_nonzero_and_monotonic() {
        update();
        let a = now_ms();
        assert!(a > 0);

        thread::sleep(Duration::from_millis(5));
        update();
        let b = now_ms();
        assert!(b >= a + 5, "clock went backwards: {} -> {}", a, b);
    }

    #[test]
    fn test_cache_is_stable_between_updates() {
        update();
        let a = now_ms();
        thread::sleep(Duration::from_millis(5));
        // No update in between: the cached value must not move
        let b = now_ms();
        assert_eq!(a, b);
    }
}
