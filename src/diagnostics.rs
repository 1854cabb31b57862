//! Rate-limited diagnostic logging: a per-category counter owned by whichever
//! component needs it, rather than a globally threaded singleton, so
//! independent subsystems don't share a "first 10 messages" budget.

use std::sync::atomic::{AtomicU32, Ordering};

/// Caps a diagnostic category to its first `limit` emissions; further calls
/// to [`RateLimitedLog::log`] are silently dropped (the condition keeps
/// happening, but the user has already seen enough of them).
pub struct RateLimitedLog {
    emitted: AtomicU32,
    limit: u32,
}

impl RateLimitedLog {
    pub const fn new(limit: u32) -> Self {
        RateLimitedLog { emitted: AtomicU32::new(0), limit }
    }

    /// Logs `message` at `warn` level if under the limit; once the limit is
    /// crossed, logs a single "further messages are suppressed" notice and
    /// goes quiet. Use [`RateLimitedLog::count`] to read the total emission
    /// count for this category.
    pub fn warn(&self, message: impl FnOnce() -> String) {
        let prior = self.emitted.fetch_add(1, Ordering::Relaxed);
        if prior < self.limit {
            log::warn!("{}", message());
        } else if prior == self.limit {
            log::warn!("(further messages of this kind are suppressed)");
        }
    }

    pub fn count(&self) -> u32 {
        self.emitted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_past_limit() {
        let log = RateLimitedLog::new(2);
        for i in 0..5 {
            log.warn(|| format!("msg {i}"));
        }
        assert_eq!(log.count(), 5);
    }
}
