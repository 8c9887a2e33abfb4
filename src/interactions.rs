//! Interaction correlator
//!
//! Decouples "a probe sent a request carrying an out-of-band marker" from
//! "the callback for that marker arrived on the collaboration channel",
//! which may happen seconds later or never.
//!
//! Workers register markers as they build requests; a background loop polls
//! the collaboration server and attributes delivered events back to the
//! unit that registered the marker. Because delivery is asynchronous
//! relative to the probe's own request, a pending entry survives for a
//! cooldown window after the probe's synchronous execution completes, then
//! evicts. Entries older than the absolute horizon are dropped
//! unconditionally, bounding memory regardless of run length.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::checkpoint::UnitId;
use crate::config::InteractionsConfig;
use crate::error::Result;

/// One delivered out-of-band event, as returned by the collaboration
/// server's poll endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct InteractionEvent {
    /// Marker embedded in the probe request that triggered this callback
    pub unique_id: String,
    /// Interaction protocol (http, dns, smtp, ...)
    #[serde(default)]
    pub protocol: String,
    /// Address the callback arrived from
    #[serde(default)]
    pub remote_address: String,
    /// Raw captured request, when the server provides it
    #[serde(default)]
    pub raw_request: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PollResponse {
    #[serde(default)]
    events: Vec<InteractionEvent>,
}

/// Invoked for every event attributed to a registered marker
pub type MatchCallback = Arc<dyn Fn(&UnitId, &InteractionEvent) + Send + Sync>;

struct PendingEntry {
    unit: UnitId,
    registered_at: Instant,
    /// Set when the probe's synchronous execution returned; starts the
    /// cooldown clock
    completed_at: Option<Instant>,
}

/// Matches delayed collaboration-server callbacks to the probes that
/// triggered them
pub struct InteractionCorrelator {
    config: InteractionsConfig,
    client: reqwest::Client,
    /// Per-run identity sent to the server so polls only return our events
    correlation_id: String,
    pending: DashMap<String, PendingEntry>,
    /// Registration order, for oldest-first eviction at the size bound
    order: Mutex<VecDeque<String>>,
    on_match: MatchCallback,
    scan_finished: AtomicBool,
    late_match: AtomicBool,
    cancel: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl InteractionCorrelator {
    pub fn new(config: InteractionsConfig, on_match: MatchCallback) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent("scanforge/0.1")
            .build()?;
        Ok(Self {
            config,
            client,
            correlation_id: uuid::Uuid::new_v4().simple().to_string(),
            pending: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            on_match,
            scan_finished: AtomicBool::new(false),
            late_match: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            poller: Mutex::new(None),
        })
    }

    /// Spawn the background poll loop. Must run inside a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }
        let correlator = self.clone();
        let cancel = self.cancel.clone();
        *poller = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(correlator.config.poll_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = correlator.poll_once().await {
                            // Transient endpoint failures never abort the scan
                            warn!("interaction poll failed, retrying next interval: {}", e);
                        }
                        correlator.evict_expired();
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }));
    }

    /// Issue a unique marker for a probe request and track it as pending
    /// for the unit that will embed it.
    pub fn register(&self, unit: &UnitId) -> String {
        let marker = uuid::Uuid::new_v4().simple().to_string();
        self.enforce_cache_bound();
        self.pending.insert(
            marker.clone(),
            PendingEntry {
                unit: unit.clone(),
                registered_at: Instant::now(),
                completed_at: None,
            },
        );
        self.order.lock().push_back(marker.clone());
        trace!(marker = %marker, template = %unit.template, "registered interaction marker");
        marker
    }

    /// Note that the probe owning `marker` finished its synchronous
    /// execution without an immediate match; the entry stays alive for the
    /// cooldown window.
    pub fn mark_completed(&self, marker: &str) {
        if let Some(mut entry) = self.pending.get_mut(marker) {
            entry.completed_at = Some(Instant::now());
        }
    }

    /// Number of markers currently pending
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Signal that the main scan loop has finished; matches from here on
    /// count as late and flip the flag `close()` returns.
    pub fn scan_finished(&self) {
        self.scan_finished.store(true, Ordering::Release);
    }

    /// Stop the poll loop, run one final fetch to catch in-flight events,
    /// and report whether any match arrived after the main scan loop had
    /// already finished. Callers OR this into the overall found flag.
    pub async fn close(&self) -> bool {
        self.scan_finished.store(true, Ordering::Release);
        self.cancel.cancel();
        if let Some(handle) = self.poller.lock().take() {
            let _ = handle.await;
        }
        if let Err(e) = self.poll_once().await {
            warn!("final interaction poll failed: {}", e);
        }
        self.pending.clear();
        self.order.lock().clear();
        self.late_match.load(Ordering::Acquire)
    }

    /// Fetch and process one batch of delivered events
    async fn poll_once(&self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let url = format!(
            "{}/poll?id={}",
            self.config.server_url.trim_end_matches('/'),
            self.correlation_id
        );
        let mut request = self.client.get(&url);
        if !self.config.token.is_empty() {
            request = request.header("Authorization", &self.config.token);
        }
        let response: PollResponse = request.send().await?.error_for_status()?.json().await?;
        self.handle_events(response.events);
        Ok(())
    }

    /// Attribute a batch of events to their registering units. Events whose
    /// marker was never registered, or already evicted, are discarded
    /// silently: delivery after the horizon is expected, not an error.
    fn handle_events(&self, events: Vec<InteractionEvent>) {
        for event in events {
            let entry = match self.pending.remove(&event.unique_id) {
                Some((_, entry)) => entry,
                None => {
                    trace!(marker = %event.unique_id, "event for unknown or evicted marker");
                    continue;
                }
            };
            debug!(
                marker = %event.unique_id,
                template = %entry.unit.template,
                protocol = %event.protocol,
                "out-of-band interaction matched"
            );
            if self.scan_finished.load(Ordering::Acquire) {
                self.late_match.store(true, Ordering::Release);
            }
            (self.on_match)(&entry.unit, &event);
        }
    }

    /// Drop entries past the cooldown (post-completion) or the absolute
    /// eviction horizon
    fn evict_expired(&self) {
        let horizon = self.config.eviction();
        let cooldown = self.config.cooldown();
        let now = Instant::now();
        self.pending.retain(|marker, entry| {
            let aged_out = now.duration_since(entry.registered_at) >= horizon;
            let cooled_down = entry
                .completed_at
                .map_or(false, |done| now.duration_since(done) >= cooldown);
            let keep = !aged_out && !cooled_down;
            if !keep {
                trace!(marker = %marker, aged_out, "evicting pending interaction");
            }
            keep
        });
    }

    /// Oldest-first eviction when the pending set reaches its size bound
    fn enforce_cache_bound(&self) {
        if self.config.cache_size == 0 {
            return;
        }
        let mut order = self.order.lock();
        while self.pending.len() >= self.config.cache_size {
            match order.pop_front() {
                Some(oldest) => {
                    self.pending.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn test_config(cooldown_secs: u64, eviction_secs: u64) -> InteractionsConfig {
        InteractionsConfig {
            enabled: true,
            server_url: "https://oob.example.com".into(),
            token: String::new(),
            poll_interval_secs: 1,
            cooldown_secs,
            eviction_secs,
            cache_size: 100,
        }
    }

    fn correlator_with_log(
        config: InteractionsConfig,
    ) -> (Arc<InteractionCorrelator>, Arc<PlMutex<Vec<UnitId>>>) {
        let matches = Arc::new(PlMutex::new(Vec::new()));
        let log = matches.clone();
        let correlator = InteractionCorrelator::new(
            config,
            Arc::new(move |unit: &UnitId, _event: &InteractionEvent| {
                log.lock().push(unit.clone());
            }),
        )
        .unwrap();
        (Arc::new(correlator), matches)
    }

    fn event_for(marker: &str) -> InteractionEvent {
        InteractionEvent {
            unique_id: marker.to_string(),
            protocol: "http".into(),
            remote_address: "203.0.113.9".into(),
            raw_request: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_within_cooldown_matches() {
        let (correlator, matches) = correlator_with_log(test_config(5, 60));
        let unit = UnitId::new("oob-template", 0);
        let marker = correlator.register(&unit);
        correlator.mark_completed(&marker);

        // Delivery 3s later, inside the 5s cooldown
        tokio::time::advance(Duration::from_secs(3)).await;
        correlator.evict_expired();
        correlator.handle_events(vec![event_for(&marker)]);

        assert_eq!(matches.lock().as_slice(), &[unit]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_after_cooldown_discarded() {
        let (correlator, matches) = correlator_with_log(test_config(1, 60));
        let marker = correlator.register(&UnitId::new("oob-template", 0));
        correlator.mark_completed(&marker);

        // 3s > 1s cooldown: the entry evicts before delivery
        tokio::time::advance(Duration::from_secs(3)).await;
        correlator.evict_expired();
        correlator.handle_events(vec![event_for(&marker)]);

        assert!(matches.lock().is_empty());
        assert_eq!(correlator.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_horizon_bounds_uncompleted_entries() {
        let (correlator, matches) = correlator_with_log(test_config(5, 10));
        let marker = correlator.register(&UnitId::new("t", 0));
        // Never marked completed; the absolute horizon still reaps it
        tokio::time::advance(Duration::from_secs(11)).await;
        correlator.evict_expired();
        correlator.handle_events(vec![event_for(&marker)]);
        assert!(matches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_marker_discarded_without_error() {
        let (correlator, matches) = correlator_with_log(test_config(5, 60));
        correlator.handle_events(vec![event_for("never-registered")]);
        assert!(matches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cache_size_evicts_oldest_first() {
        let mut config = test_config(5, 60);
        config.cache_size = 3;
        let (correlator, matches) = correlator_with_log(config);

        let first = correlator.register(&UnitId::new("t", 0));
        correlator.register(&UnitId::new("t", 1));
        correlator.register(&UnitId::new("t", 2));
        // Fourth registration pushes the oldest out
        correlator.register(&UnitId::new("t", 3));

        assert!(correlator.pending_len() <= 3);
        correlator.handle_events(vec![event_for(&first)]);
        assert!(matches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_late_match_flag_folds_into_close() {
        let (correlator, matches) = correlator_with_log(test_config(5, 60));
        let marker = correlator.register(&UnitId::new("t", 0));
        correlator.scan_finished();
        correlator.handle_events(vec![event_for(&marker)]);
        assert_eq!(matches.lock().len(), 1);

        // No server reachable: the final poll fails and is swallowed;
        // the late match is still reported.
        assert!(correlator.close().await);
    }

    #[tokio::test]
    async fn test_close_without_matches_reports_false() {
        let (correlator, _) = correlator_with_log(test_config(5, 60));
        assert!(!correlator.close().await);
    }
}
