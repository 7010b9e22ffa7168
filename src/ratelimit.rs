//! Rate limited diagnostics, so a failing device cannot flood the log.

use core::fmt;
use spin::Mutex;

pub use log::Level;

/// Messages allowed per window.
pub const DEFAULT_BURST: u32 = 10;
/// Window length in milliseconds.
pub const DEFAULT_INTERVAL_MS: u64 = 5000;

#[derive(Debug)]
pub struct RateLimit {
    interval_ms: u64,
    burst: u32,
    begin: Option<u64>,
    printed: u32,
    missed: u32,
}

impl RateLimit {
    pub const fn new(interval_ms: u64, burst: u32) -> Self {
        Self {
            interval_ms,
            burst,
            begin: None,
            printed: 0,
            missed: 0,
        }
    }

    /// Whether a message at time `now_ms` may be emitted.
    pub fn allow(&mut self, now_ms: u64) -> bool {
        let begin = *self.begin.get_or_insert(now_ms);
        if now_ms.saturating_sub(begin) >= self.interval_ms {
            if self.missed > 0 {
                log::warn!("dedupcrypt: {} messages suppressed", self.missed);
            }
            self.begin = Some(now_ms);
            self.printed = 0;
            self.missed = 0;
        }
        if self.printed < self.burst {
            self.printed += 1;
            true
        } else {
            self.missed += 1;
            false
        }
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}

static CRYPT_RATELIMIT: Mutex<RateLimit> = Mutex::new(RateLimit::new(DEFAULT_INTERVAL_MS, DEFAULT_BURST));

#[cfg(feature = "std")]
fn now_ms() -> u64 {
    use std::time::Instant;
    static START: spin::Once<Instant> = spin::Once::new();
    START.call_once(Instant::now).elapsed().as_millis() as u64
}

/// Without a clock every message advances time by one tick.
#[cfg(not(feature = "std"))]
fn now_ms() -> u64 {
    use core::sync::atomic::{AtomicU64, Ordering};
    static TICKS: AtomicU64 = AtomicU64::new(0);
    TICKS.fetch_add(1, Ordering::Relaxed)
}

pub fn crypt_msg(level: Level, ino: Option<u64>, args: fmt::Arguments<'_>) {
    if !CRYPT_RATELIMIT.lock().allow(now_ms()) {
        return;
    }
    match ino {
        Some(ino) if ino != 0 => log::log!(level, "dedupcrypt (inode {}): {}", ino, args),
        _ => log::log!(level, "dedupcrypt: {}", args),
    }
}

/// Rate limited error message about an inode.
#[macro_export]
macro_rules! crypt_err {
    ($ino:expr, $($arg:tt)+) => {
        $crate::ratelimit::crypt_msg(
            $crate::ratelimit::Level::Error,
            Some($ino),
            format_args!($($arg)+),
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_suppress_then_reopen() {
        let mut rs = RateLimit::new(100, 3);
        assert!(rs.allow(0));
        assert!(rs.allow(10));
        assert!(rs.allow(20));
        assert!(!rs.allow(30));
        assert!(!rs.allow(99));
        assert_eq!(rs.missed(), 2);
        assert!(rs.allow(100));
        assert_eq!(rs.missed(), 0);
    }
}
