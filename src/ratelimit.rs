//! Rate limiter
//!
//! A shared token gate bounding total probe issuance across all workers.
//! Grants are paced continuously: with a ceiling of N per window W, grants
//! are spaced W/N apart, so no sliding window of length W ever observes
//! more than N grants, regardless of caller concurrency. There are no
//! bursty per-window resets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateConfig;
use crate::error::{EngineError, Result};

/// Pacing state: the virtual instant at which the next grant is free.
struct GrantCursor {
    next_free: Instant,
}

/// Token-issuing gate shared by all scan workers
pub struct RateLimiter {
    /// Spacing between grants; None means unlimited pass-through
    interval: Option<Duration>,
    cursor: Mutex<GrantCursor>,
    stopped: AtomicBool,
}

impl RateLimiter {
    /// Build a limiter from a rate configuration
    pub fn new(config: &RateConfig) -> Self {
        match config.ceiling() {
            Some((ceiling, window)) => Self::with_ceiling(ceiling, window),
            None => Self::unlimited(),
        }
    }

    /// Limiter granting at most `ceiling` tokens per `window`
    pub fn with_ceiling(ceiling: u32, window: Duration) -> Self {
        let interval = window / ceiling.max(1);
        debug!(?interval, ceiling, ?window, "rate limiter paced");
        Self {
            interval: Some(interval),
            cursor: Mutex::new(GrantCursor {
                next_free: Instant::now(),
            }),
            stopped: AtomicBool::new(false),
        }
    }

    /// Pass-through limiter that always grants immediately
    pub fn unlimited() -> Self {
        Self {
            interval: None,
            cursor: Mutex::new(GrantCursor {
                next_free: Instant::now(),
            }),
            stopped: AtomicBool::new(false),
        }
    }

    /// Block until a token is granted or the scan is cancelled.
    ///
    /// Reservation happens under the cursor lock, the wait happens outside
    /// it, so concurrent callers queue up behind evenly spaced grant slots.
    /// A cancelled wait gives its slot up for good; the next caller still
    /// honors the configured spacing.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::Stopped("rate limiter"));
        }
        let interval = match self.interval {
            Some(interval) => interval,
            None => return Ok(()),
        };

        let grant_at = {
            let mut cursor = self.cursor.lock();
            let now = Instant::now();
            let grant_at = cursor.next_free.max(now);
            cursor.next_free = grant_at + interval;
            grant_at
        };

        tokio::select! {
            _ = tokio::time::sleep_until(grant_at) => Ok(()),
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }

    /// Release the limiter. Idempotent; pending and future `acquire` calls
    /// observe the stop on their next attempt.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}
