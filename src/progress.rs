//! Progress tracker
//!
//! Lock-free counters sampled by a periodic emission task. The tracker
//! lives entirely off the execution critical path: increment hooks are
//! single atomic adds, emission runs on its own timer, and emission
//! problems are swallowed rather than propagated to workers. Counters are
//! eventually consistent; exact real-time accuracy is not required until
//! `stop()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ProgressConfig;

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    requests: AtomicU64,
    matched: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
    targets: AtomicU64,
}

/// Periodic, non-blocking scan statistics
pub struct ProgressTracker {
    counters: Arc<Counters>,
    period: Option<std::time::Duration>,
    cancel: CancellationToken,
    ticker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ProgressTracker {
    /// Create the tracker. Counters accumulate immediately; the emission
    /// timer runs between `start()` and `stop()` (interval 0 disables it).
    pub fn new(config: &ProgressConfig) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            period: (config.interval_secs > 0)
                .then(|| std::time::Duration::from_secs(config.interval_secs)),
            cancel: CancellationToken::new(),
            ticker: parking_lot::Mutex::new(None),
        }
    }

    /// Spawn the periodic emission task. Must run inside a tokio runtime;
    /// a second call is a no-op.
    pub fn start(&self) {
        let period = match self.period {
            Some(period) => period,
            None => return,
        };
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let counters = self.counters.clone();
        let cancel = self.cancel.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // immediate first tick carries no data
            loop {
                tokio::select! {
                    _ = interval.tick() => emit(&counters),
                    _ = cancel.cancelled() => break,
                }
            }
        }));
    }

    /// Seed counters before scheduling begins
    pub fn init(&self, total: u64, current: u64, skipped: u64) {
        self.counters.total.store(total, Ordering::Relaxed);
        self.counters.requests.store(current, Ordering::Relaxed);
        self.counters.skipped.store(skipped, Ordering::Relaxed);
    }

    /// Grow the expected total (late target discovery)
    pub fn add_to_total(&self, delta: u64) {
        self.counters.total.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn increment_requests(&self) {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_matched(&self) {
        self.counters.matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_errors(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_skipped(&self) {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_targets(&self) {
        self.counters.targets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.counters.requests.load(Ordering::Relaxed)
    }

    pub fn matched(&self) -> u64 {
        self.counters.matched.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.counters.errors.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.counters.skipped.load(Ordering::Relaxed)
    }

    /// Halt periodic emission and log a final summary
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.ticker.lock().take() {
            let _ = handle.await;
        }
        emit(&self.counters);
    }
}

fn emit(counters: &Counters) {
    info!(
        requests = counters.requests.load(Ordering::Relaxed),
        total = counters.total.load(Ordering::Relaxed),
        matched = counters.matched.load(Ordering::Relaxed),
        errors = counters.errors.load(Ordering::Relaxed),
        skipped = counters.skipped.load(Ordering::Relaxed),
        targets = counters.targets.load(Ordering::Relaxed),
        "scan progress"
    );
}
