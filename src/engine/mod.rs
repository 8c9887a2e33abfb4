//! Orchestration engine
//!
//! Owns the target set, decides which probes run against which target,
//! gates execution through the shared rate limiter, tracks progress,
//! persists resume state, and correlates delayed out-of-band signals back
//! to the probe that triggered them.
//!
//! # Architecture
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Target Set  │────▶│   Strategy   │────▶│ Worker Pool  │
//! │ (mem+sqlite) │     │ (std/smart)  │     │  (N tasks)   │
//! └──────────────┘     └──────────────┘     └──────┬───────┘
//!                                                  │
//!                     ┌──────────────┬─────────────┼─────────────┐
//!                     ▼              ▼             ▼             ▼
//!              ┌────────────┐ ┌────────────┐ ┌───────────┐ ┌──────────┐
//!              │ Rate Gate  │ │ Checkpoint │ │ Progress  │ │  Result  │
//!              │            │ │   Store    │ │  Tracker  │ │   Sink   │
//!              └────────────┘ └────────────┘ └───────────┘ └──────────┘
//!                                                  ▲
//!                                   ┌──────────────┴──┐
//!                                   │   Interaction   │  (async matches,
//!                                   │   Correlator    │   poll loop)
//!                                   └─────────────────┘
//! ```
//!
//! Lifecycle: `new` wires and validates, `run` drives the selected
//! strategy to completion or cancellation, `close` stops the rate limiter,
//! correlator, progress tracker and sink in that order, folding the
//! correlator's late-match flag into the final found flag.

pub mod smart;
pub mod standard;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{Template, TemplateCatalog, TemplateCluster, TemplateFilter};
use crate::checkpoint::{Checkpoint, UnitId};
use crate::config::ScanConfig;
use crate::error::{EngineError, Result};
use crate::executor::{ProbeContext, ProbeExecutor};
use crate::interactions::{InteractionCorrelator, MatchCallback};
use crate::output::{ResultSink, ScanResult};
use crate::progress::ProgressTracker;
use crate::ratelimit::RateLimiter;
use crate::targets::{Target, TargetSet};

/// Unit buffer between the producing strategy and the worker pool. Kept
/// small so stop-at-first-match and the host-error breaker take effect
/// without a long queued tail.
pub(crate) fn unit_buffer(workers: usize) -> usize {
    (workers * 4).max(16)
}

/// One schedulable item: a template cluster against one target
pub(crate) struct ExecutionUnit {
    pub position: usize,
    pub target: Arc<Target>,
    pub cluster: TemplateCluster,
}

impl ExecutionUnit {
    /// Checkpoint identity: clusters are scheduled and checkpointed under
    /// their representative template
    pub fn id(&self) -> UnitId {
        UnitId::new(self.cluster.representative.id.clone(), self.position)
    }
}

/// Scan orchestration engine. One instance drives one run; its components
/// are never shared across engines.
pub struct ScanEngine {
    config: ScanConfig,
    targets: Arc<TargetSet>,
    templates: Vec<Arc<Template>>,
    executor: Arc<dyn ProbeExecutor>,
    sink: Arc<dyn ResultSink>,
    rate_limiter: Arc<RateLimiter>,
    correlator: Option<Arc<InteractionCorrelator>>,
    checkpoint: Arc<Checkpoint>,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
    found: Arc<AtomicBool>,
    ran: AtomicBool,
    closed: AtomicBool,
}

impl ScanEngine {
    /// Wire the engine together and fail fast on configuration problems:
    /// empty target set, empty template selection, or an invalid rate spec.
    pub fn new(
        mut config: ScanConfig,
        seed_targets: Vec<Target>,
        catalog: &dyn TemplateCatalog,
        filter: &TemplateFilter,
        executor: Arc<dyn ProbeExecutor>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        config.expand_env();
        config.validate()?;

        let targets = Arc::new(TargetSet::new(&config.targets));
        for target in seed_targets {
            targets.add(target)?;
        }
        if targets.is_empty() {
            return Err(EngineError::EmptyTargets);
        }

        let templates = catalog.load(filter)?;
        if templates.is_empty() {
            return Err(EngineError::EmptyTemplates);
        }

        let checkpoint = Arc::new(Checkpoint::new());
        if let Some(path) = &config.resume_path {
            if path.exists() {
                checkpoint.load_from(path)?;
            }
        }

        let rate_limiter = Arc::new(RateLimiter::new(&config.rate));
        let progress = Arc::new(ProgressTracker::new(&config.progress));
        let found = Arc::new(AtomicBool::new(false));

        let correlator = if config.interactions.enabled {
            let on_match = oob_match_callback(
                targets.clone(),
                sink.clone(),
                found.clone(),
                progress.clone(),
            );
            Some(Arc::new(InteractionCorrelator::new(
                config.interactions.clone(),
                on_match,
            )?))
        } else {
            None
        };

        Ok(Self {
            config,
            targets,
            templates,
            executor,
            sink,
            rate_limiter,
            correlator,
            checkpoint,
            progress,
            cancel: CancellationToken::new(),
            found,
            ran: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// The engine's target set, exposed so discovery hooks can add late
    /// members before `run`
    pub fn targets(&self) -> &Arc<TargetSet> {
        &self.targets
    }

    /// Token cancelling this run; callers wire interrupt handlers to it
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Persist the current checkpoint position on demand
    pub fn save_resume(&self, path: &std::path::Path) -> Result<()> {
        self.checkpoint.save_to(path)
    }

    #[cfg(test)]
    pub(crate) fn checkpoint(&self) -> &Arc<Checkpoint> {
        &self.checkpoint
    }

    /// Drive the configured execution strategy to completion or
    /// cancellation. Returns whether any synchronous result matched; a
    /// second call on the same instance is rejected.
    pub async fn run(&self) -> Result<bool> {
        if self.ran.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRan);
        }

        self.progress.start();
        if let Some(correlator) = &self.correlator {
            correlator.start();
        }

        info!(
            targets = self.targets.count(),
            templates = self.templates.len(),
            workers = self.config.actual_workers(),
            automatic = self.config.automatic_scan,
            "starting scan"
        );

        let outcome = if self.config.automatic_scan {
            smart::execute(self).await
        } else {
            standard::execute(self).await
        };

        if let Some(correlator) = &self.correlator {
            correlator.scan_finished();
        }

        match outcome {
            Ok(()) => Ok(self.found.load(Ordering::Acquire)),
            Err(e) if e.is_cancelled() => {
                if let Some(path) = &self.config.resume_path {
                    match self.checkpoint.save_to(path) {
                        Ok(()) => info!(path = %path.display(), "saved resume checkpoint"),
                        Err(save_err) => warn!("failed to save resume checkpoint: {}", save_err),
                    }
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop components in order: rate limiter, interaction correlator
    /// (folding its late-match flag in), progress tracker, output sink.
    /// Returns the final found flag. Calling twice is a logged no-op.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("engine close called more than once");
            return self.found.load(Ordering::Acquire);
        }

        self.cancel.cancel();
        self.rate_limiter.stop();
        if let Some(correlator) = &self.correlator {
            if correlator.close().await {
                self.found.store(true, Ordering::Release);
            }
        }
        self.progress.stop().await;
        self.sink.close();
        self.found.load(Ordering::Acquire)
    }
}

/// Attribute an out-of-band interaction to its unit: write the result
/// record and raise the found flag, exactly like a synchronous match.
fn oob_match_callback(
    targets: Arc<TargetSet>,
    sink: Arc<dyn ResultSink>,
    found: Arc<AtomicBool>,
    progress: Arc<ProgressTracker>,
) -> MatchCallback {
    Arc::new(move |unit, event| {
        let target = targets
            .get(unit.target_index)
            .ok()
            .flatten()
            .map(|t| t.input.clone())
            .unwrap_or_default();
        let mut record = ScanResult::new(unit.template.clone(), target);
        record.interaction_protocol = Some(event.protocol.clone());
        if let Err(e) = sink.write(&record) {
            warn!("failed to write interaction result: {}", e);
        }
        found.store(true, Ordering::Release);
        progress.increment_matched();
    })
}

/// State shared by every worker task of one run
#[derive(Clone)]
pub(crate) struct WorkerShared {
    executor: Arc<dyn ProbeExecutor>,
    sink: Arc<dyn ResultSink>,
    rate_limiter: Arc<RateLimiter>,
    correlator: Option<Arc<InteractionCorrelator>>,
    checkpoint: Arc<Checkpoint>,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
    found: Arc<AtomicBool>,
    /// Consecutive failure count per target input, for the host-error
    /// circuit breaker
    pub host_errors: Arc<DashMap<String, u32>>,
}

impl WorkerShared {
    pub fn for_engine(engine: &ScanEngine) -> Self {
        Self {
            executor: engine.executor.clone(),
            sink: engine.sink.clone(),
            rate_limiter: engine.rate_limiter.clone(),
            correlator: engine.correlator.clone(),
            checkpoint: engine.checkpoint.clone(),
            progress: engine.progress.clone(),
            cancel: engine.cancel.clone(),
            found: engine.found.clone(),
            host_errors: Arc::new(DashMap::new()),
        }
    }
}

/// Spawn the fixed-size worker pool consuming execution units. Pool size
/// bounds probe concurrency; the rate limiter separately bounds issuance
/// rate. Workers exit when the unit channel closes or the run cancels.
pub(crate) fn spawn_pool(
    workers: usize,
    shared: WorkerShared,
    rx: mpsc::Receiver<ExecutionUnit>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..workers)
        .map(|worker_id| {
            let shared = shared.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, shared, rx).await;
            })
        })
        .collect()
}

async fn worker_loop(
    worker_id: usize,
    shared: WorkerShared,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ExecutionUnit>>>,
) {
    loop {
        let unit = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(unit) = unit else { break };
        if shared.cancel.is_cancelled() {
            break;
        }

        // Dispatch begins once the token is granted
        if shared.rate_limiter.acquire(&shared.cancel).await.is_err() {
            break;
        }

        let unit_id = unit.id();
        let ctx = ProbeContext::new(
            unit_id.clone(),
            shared.cancel.clone(),
            shared.correlator.clone(),
        );

        let result = tokio::select! {
            r = shared
                .executor
                .execute(&unit.target, &unit.cluster.representative, &ctx) => r,
            _ = shared.cancel.cancelled() => Err(EngineError::Cancelled),
        };
        // The synchronous attempt is over; cooldown starts for any
        // out-of-band markers the probe registered.
        ctx.complete_markers();

        match result {
            Ok(outcome) => {
                shared.progress.increment_requests();
                shared.host_errors.remove(&unit.target.input);
                if outcome.matched {
                    shared.found.store(true, Ordering::Release);
                    shared.progress.increment_matched();
                    // Clustered templates report independently
                    for member in &unit.cluster.members {
                        let mut record =
                            ScanResult::new(member.id.clone(), unit.target.input.clone());
                        record.extracted = outcome.extracted.clone();
                        if let Err(e) = shared.sink.write(&record) {
                            warn!("failed to write result: {}", e);
                        }
                    }
                }
                shared.checkpoint.advance(&unit_id);
            }
            Err(e) if e.is_cancelled() => {
                // Aborted in flight: not complete, a resumed run retries it
                debug!(worker_id, template = %unit_id.template, "unit aborted by cancellation");
                break;
            }
            Err(e) => {
                // Failed-but-completed: the failure is local to this unit
                warn!(
                    template = %unit_id.template,
                    target = %unit.target.input,
                    "probe failed: {}", e
                );
                shared.progress.increment_requests();
                shared.progress.increment_errors();
                *shared
                    .host_errors
                    .entry(unit.target.input.clone())
                    .or_insert(0) += 1;
                shared.checkpoint.advance(&unit_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{test_template, ProtocolClass, StaticCatalog};
    use crate::executor::Outcome;
    use crate::output::testing::MemorySink;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashSet;

    /// Scripted executor: records every invocation, matches on demand,
    /// optionally cancels the run after a fixed number of executions.
    struct ScriptedExecutor {
        executed: PlMutex<Vec<UnitId>>,
        match_targets: HashSet<String>,
        fail_targets: HashSet<String>,
        fingerprints: std::collections::HashMap<String, Vec<String>>,
        cancel_after: PlMutex<Option<(usize, CancellationToken)>>,
    }

    impl ScriptedExecutor {
        fn new() -> Self {
            Self {
                executed: PlMutex::new(Vec::new()),
                match_targets: HashSet::new(),
                fail_targets: HashSet::new(),
                fingerprints: std::collections::HashMap::new(),
                cancel_after: PlMutex::new(None),
            }
        }

        fn executions(&self) -> Vec<UnitId> {
            self.executed.lock().clone()
        }
    }

    #[async_trait]
    impl ProbeExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            target: &Target,
            _template: &Template,
            ctx: &ProbeContext,
        ) -> crate::error::Result<Outcome> {
            let count = {
                let mut executed = self.executed.lock();
                executed.push(ctx.unit().clone());
                executed.len()
            };
            if let Some((limit, token)) = self.cancel_after.lock().as_ref() {
                if count >= *limit {
                    token.cancel();
                }
            }
            if self.fail_targets.contains(&target.input) {
                return Err(EngineError::Catalog("connection refused".into()));
            }
            if self.match_targets.contains(&target.input) {
                Ok(Outcome::matched())
            } else {
                Ok(Outcome::no_match())
            }
        }

        async fn identify(
            &self,
            target: &Target,
            _ctx: &ProbeContext,
        ) -> crate::error::Result<Vec<String>> {
            Ok(self
                .fingerprints
                .get(&target.input)
                .cloned()
                .unwrap_or_default())
        }
    }

    fn quiet_config() -> ScanConfig {
        let mut config = ScanConfig::default();
        config.workers = 2;
        config.rate.per_second = 0; // unlimited in tests unless stated
        config.progress.interval_secs = 0;
        config
    }

    fn hosts(n: usize) -> Vec<Target> {
        (0..n).map(|i| Target::new(format!("host{}:80", i))).collect()
    }

    fn engine_with(
        config: ScanConfig,
        targets: Vec<Target>,
        templates: Vec<Template>,
        executor: Arc<ScriptedExecutor>,
    ) -> (ScanEngine, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let catalog = StaticCatalog::new(templates);
        let engine = ScanEngine::new(
            config,
            targets,
            &catalog,
            &TemplateFilter::default(),
            executor,
            sink.clone(),
        )
        .unwrap();
        (engine, sink)
    }

    #[test]
    fn test_new_rejects_empty_inputs() {
        let sink = Arc::new(MemorySink::default());
        let executor = Arc::new(ScriptedExecutor::new());

        let catalog = StaticCatalog::new(vec![test_template("t", ProtocolClass::Http, "/")]);
        let err = ScanEngine::new(
            quiet_config(),
            Vec::new(),
            &catalog,
            &TemplateFilter::default(),
            executor.clone(),
            sink.clone(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::EmptyTargets));

        let empty_catalog = StaticCatalog::new(Vec::new());
        let err = ScanEngine::new(
            quiet_config(),
            hosts(1),
            &empty_catalog,
            &TemplateFilter::default(),
            executor,
            sink,
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::EmptyTemplates));
    }

    #[tokio::test]
    async fn test_standard_run_covers_all_units() {
        let executor = Arc::new(ScriptedExecutor::new());
        let (engine, _sink) = engine_with(
            quiet_config(),
            hosts(4),
            vec![
                test_template("t1", ProtocolClass::Http, "/a"),
                test_template("t2", ProtocolClass::Http, "/b"),
            ],
            executor.clone(),
        );

        let found = engine.run().await.unwrap();
        assert!(!found);
        assert_eq!(executor.executions().len(), 8);
        assert_eq!(engine.checkpoint().completed_count(), 8);
        assert!(!engine.close().await);
    }

    #[tokio::test]
    async fn test_match_reported_per_cluster_member() {
        let mut executor = ScriptedExecutor::new();
        executor.match_targets.insert("host0:80".into());
        let executor = Arc::new(executor);

        // Identical requests: the two templates cluster and execute once,
        // but both must report the match.
        let (engine, sink) = engine_with(
            quiet_config(),
            hosts(1),
            vec![
                test_template("cve-a", ProtocolClass::Http, "/same"),
                test_template("cve-b", ProtocolClass::Http, "/same"),
            ],
            executor.clone(),
        );

        let found = engine.run().await.unwrap();
        assert!(found);
        assert_eq!(executor.executions().len(), 1);

        let records = sink.records.lock();
        let templates: HashSet<String> =
            records.iter().map(|r| r.template.clone()).collect();
        assert_eq!(records.len(), 2);
        assert!(templates.contains("cve-a"));
        assert!(templates.contains("cve-b"));
        drop(records);
        assert!(engine.close().await);
    }

    #[tokio::test]
    async fn test_protocol_mismatch_skipped_without_checkpoint() {
        let executor = Arc::new(ScriptedExecutor::new());
        let (engine, sink) = engine_with(
            quiet_config(),
            vec![Target::new("https://url-only.example.com")],
            vec![test_template("raw-tcp", ProtocolClass::Tcp, "/")],
            executor.clone(),
        );

        let found = engine.run().await.unwrap();
        assert!(!found);
        assert!(executor.executions().is_empty());
        assert!(sink.records.lock().is_empty());
        // Filtered units never enter the checkpoint
        assert_eq!(engine.checkpoint().completed_count(), 0);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_failed_probe_is_completed_and_run_continues() {
        let mut executor = ScriptedExecutor::new();
        executor.fail_targets.insert("host0:80".into());
        executor.match_targets.insert("host1:80".into());
        let executor = Arc::new(executor);

        let (engine, sink) = engine_with(
            quiet_config(),
            hosts(2),
            vec![test_template("t", ProtocolClass::Http, "/")],
            executor.clone(),
        );

        let found = engine.run().await.unwrap();
        assert!(found);
        // The failing unit still completed: both are checkpointed
        assert_eq!(engine.checkpoint().completed_count(), 2);
        assert_eq!(sink.records.lock().len(), 1);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_run_twice_rejected() {
        let executor = Arc::new(ScriptedExecutor::new());
        let (engine, _sink) = engine_with(
            quiet_config(),
            hosts(1),
            vec![test_template("t", ProtocolClass::Http, "/")],
            executor,
        );
        engine.run().await.unwrap();
        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRan));
        engine.close().await;
    }

    #[tokio::test]
    async fn test_cancellation_mid_run_checkpoints_completed_only() {
        let mut config = quiet_config();
        config.workers = 1; // deterministic completion count

        let executor = Arc::new(ScriptedExecutor::new());
        let (engine, _sink) = engine_with(
            config,
            hosts(100),
            vec![test_template("t", ProtocolClass::Http, "/")],
            executor.clone(),
        );
        // The scripted executor cancels the engine's own token from inside
        // the 10th execution, before that execution returns.
        *executor.cancel_after.lock() = Some((10, engine.cancellation_token()));

        let err = engine.run().await.unwrap_err();
        assert!(err.is_cancelled());

        // Only fully-completed units are recorded. The 10th unit raced the
        // signal it raised itself, so 9 or 10 completions are valid; either
        // way the recorded identities are exactly the first `completed`
        // target indices and nothing beyond ever executed.
        let completed = engine.checkpoint().completed_count();
        assert!((9..=10).contains(&completed), "completed = {}", completed);
        for index in 0..completed {
            assert!(engine.checkpoint().should_skip(&UnitId::new("t", index)));
        }
        assert!(!engine.checkpoint().should_skip(&UnitId::new("t", 10)));
        assert_eq!(executor.executions().len(), 10);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_resume_does_not_rereport_completed_units() {
        let dir = tempfile::tempdir().unwrap();
        let resume_path = dir.path().join("resume.json");

        // First run: complete 2 of 4 targets by hand, save the checkpoint
        let seed = Checkpoint::new();
        seed.advance(&UnitId::new("t", 0));
        seed.advance(&UnitId::new("t", 1));
        seed.save_to(&resume_path).unwrap();

        let mut config = quiet_config();
        config.resume_path = Some(resume_path);

        let executor = Arc::new(ScriptedExecutor::new());
        let (engine, _sink) = engine_with(
            config,
            hosts(4),
            vec![test_template("t", ProtocolClass::Http, "/")],
            executor.clone(),
        );

        engine.run().await.unwrap();
        let executed = executor.executions();
        assert_eq!(executed.len(), 2);
        let indices: HashSet<usize> = executed.iter().map(|u| u.target_index).collect();
        assert_eq!(indices, HashSet::from([2, 3]));
        assert_eq!(engine.checkpoint().completed_count(), 4);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_stop_at_first_match_halts_scheduling() {
        let mut config = quiet_config();
        config.workers = 1;
        config.stop_at_first_match = true;

        let mut executor = ScriptedExecutor::new();
        executor.match_targets.insert("host0:80".into());
        let executor = Arc::new(executor);

        let (engine, _sink) = engine_with(
            config,
            hosts(500),
            vec![test_template("t", ProtocolClass::Http, "/")],
            executor.clone(),
        );
        let found = engine.run().await.unwrap();
        assert!(found);
        // Scheduling stops after the match; only units already buffered
        // past the bounded channel still run.
        assert!(executor.executions().len() < 100);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_host_error_breaker_skips_remaining_units() {
        let mut config = quiet_config();
        config.workers = 1;
        config.max_host_errors = 2;

        let mut executor = ScriptedExecutor::new();
        executor.fail_targets.insert("host0:80".into());
        let executor = Arc::new(executor);

        // Many templates against one broken target: after the breaker
        // trips, remaining units are filtered before dispatch.
        let templates: Vec<Template> = (0..200)
            .map(|i| test_template(&format!("t{}", i), ProtocolClass::Http, &format!("/{}", i)))
            .collect();
        let (engine, _sink) = engine_with(config, hosts(1), templates, executor.clone());

        engine.run().await.unwrap();
        let executed = executor.executions().len();
        assert!(executed >= 2, "breaker needs two failures, saw {}", executed);
        assert!(executed < 100, "breaker never tripped, saw {}", executed);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_smart_mode_schedules_only_fingerprint_matches() {
        let mut config = quiet_config();
        config.automatic_scan = true;

        let mut executor = ScriptedExecutor::new();
        executor
            .fingerprints
            .insert("host0:80".into(), vec!["wordpress".into()]);
        executor
            .fingerprints
            .insert("host1:80".into(), vec!["jenkins".into()]);
        executor.match_targets.insert("host0:80".into());
        let executor = Arc::new(executor);

        let mut wp = test_template("wp-vuln", ProtocolClass::Http, "/wp");
        wp.tags = vec!["wordpress".into()];
        let mut jenkins = test_template("jenkins-vuln", ProtocolClass::Http, "/jk");
        jenkins.tags = vec!["jenkins".into()];
        let mut drupal = test_template("drupal-vuln", ProtocolClass::Http, "/dp");
        drupal.tags = vec!["drupal".into()];

        let (engine, sink) = engine_with(
            config,
            hosts(2),
            vec![wp, jenkins, drupal],
            executor.clone(),
        );

        let found = engine.run().await.unwrap();
        assert!(found);

        // One matching template per target; drupal never runs
        let executed = executor.executions();
        assert_eq!(executed.len(), 2);
        let scheduled: HashSet<String> =
            executed.iter().map(|u| u.template.clone()).collect();
        assert_eq!(
            scheduled,
            HashSet::from(["wp-vuln".to_string(), "jenkins-vuln".to_string()])
        );
        assert_eq!(sink.records.lock().len(), 1);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let executor = Arc::new(ScriptedExecutor::new());
        let (engine, _sink) = engine_with(
            quiet_config(),
            hosts(1),
            vec![test_template("t", ProtocolClass::Http, "/")],
            executor,
        );
        engine.run().await.unwrap();
        let first = engine.close().await;
        let second = engine.close().await;
        assert_eq!(first, second);
    }
}
