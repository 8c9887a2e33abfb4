//! Automatic execution strategy
//!
//! Two pipelined phases instead of the full cross product. Identification
//! workers fingerprint each target through `ProbeExecutor::identify`,
//! then schedule only the templates whose tags intersect the detected
//! technologies. Scheduled units flow into the same worker pool the
//! standard strategy uses, so rate limiting, checkpointing and the
//! host-error breaker behave identically.
//!
//! The unit total is unknown up front; it grows as identification
//! discovers work.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{spawn_pool, unit_buffer, ExecutionUnit, ScanEngine, WorkerShared};
use crate::catalog::{cluster_templates, Template};
use crate::checkpoint::UnitId;
use crate::error::{EngineError, Result};
use crate::executor::ProbeContext;
use crate::targets::Target;

pub(crate) async fn execute(engine: &ScanEngine) -> Result<()> {
    let workers = engine.config.actual_workers();
    engine
        .progress
        .init(0, engine.checkpoint.completed_count() as u64, 0);

    let (unit_tx, unit_rx) = mpsc::channel(unit_buffer(workers));
    let shared = WorkerShared::for_engine(engine);
    let pool = spawn_pool(workers, shared.clone(), unit_rx);

    let (target_tx, target_rx) = mpsc::channel::<(usize, Arc<Target>)>(unit_buffer(workers));
    let target_rx = Arc::new(tokio::sync::Mutex::new(target_rx));
    let identifiers: Vec<JoinHandle<()>> = (0..workers)
        .map(|_| {
            let shared = shared.clone();
            let target_rx = target_rx.clone();
            let unit_tx = unit_tx.clone();
            let templates = engine.templates.clone();
            let no_clustering = engine.config.no_clustering;
            let max_host_errors = engine.config.max_host_errors;
            tokio::spawn(async move {
                identify_loop(
                    shared,
                    target_rx,
                    unit_tx,
                    templates,
                    no_clustering,
                    max_host_errors,
                )
                .await;
            })
        })
        .collect();

    let targets = engine.targets.clone();
    let cancel = engine.cancel.clone();
    let found = engine.found.clone();
    let stop_at_first_match = engine.config.stop_at_first_match;
    let producer = tokio::task::spawn_blocking(move || -> Result<()> {
        targets.iterate(|position, target| {
            if cancel.is_cancelled() {
                return false;
            }
            if stop_at_first_match && found.load(Ordering::Acquire) {
                return false;
            }
            target_tx.blocking_send((position, target)).is_ok()
        })
    });

    let produced = producer
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)));
    for handle in identifiers {
        let _ = handle.await;
    }
    // Identification is done; dropping the last unit sender drains the pool
    drop(unit_tx);
    for handle in pool {
        let _ = handle.await;
    }
    produced??;

    if engine.cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    Ok(())
}

/// Fingerprint targets off the shared channel and turn tag intersections
/// into execution units
async fn identify_loop(
    shared: WorkerShared,
    target_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<(usize, Arc<Target>)>>>,
    unit_tx: mpsc::Sender<ExecutionUnit>,
    templates: Vec<Arc<Template>>,
    no_clustering: bool,
    max_host_errors: u32,
) {
    loop {
        let next = {
            let mut rx = target_rx.lock().await;
            rx.recv().await
        };
        let Some((position, target)) = next else { break };
        if shared.cancel.is_cancelled() {
            break;
        }

        if shared.rate_limiter.acquire(&shared.cancel).await.is_err() {
            break;
        }
        let ctx = ProbeContext::new(
            UnitId::new("identify", position),
            shared.cancel.clone(),
            None,
        );
        let fingerprints = tokio::select! {
            r = shared.executor.identify(&target, &ctx) => r,
            _ = shared.cancel.cancelled() => Err(EngineError::Cancelled),
        };
        let fingerprints = match fingerprints {
            Ok(tags) => tags,
            Err(e) if e.is_cancelled() => break,
            Err(e) => {
                warn!(target = %target.input, "identification failed: {}", e);
                shared.progress.increment_errors();
                continue;
            }
        };

        shared.progress.increment_targets();
        let matched: Vec<Arc<Template>> = templates
            .iter()
            .filter(|t| fingerprints.iter().any(|tag| t.has_tag(tag)))
            .cloned()
            .collect();
        if matched.is_empty() {
            debug!(target = %target.input, "no template matches the fingerprint");
            shared.progress.increment_skipped();
            continue;
        }

        for cluster in cluster_templates(&matched, no_clustering) {
            if !cluster.representative.protocol.applies_to(&target) {
                shared.progress.increment_skipped();
                continue;
            }
            if max_host_errors > 0 {
                let tripped = shared
                    .host_errors
                    .get(&target.input)
                    .map_or(false, |errors| *errors >= max_host_errors);
                if tripped {
                    shared.progress.increment_skipped();
                    continue;
                }
            }
            let unit_id = UnitId::new(cluster.representative.id.clone(), position);
            if shared.checkpoint.should_skip(&unit_id) {
                continue;
            }
            shared.progress.add_to_total(1);
            let unit = ExecutionUnit {
                position,
                target: target.clone(),
                cluster,
            };
            if unit_tx.send(unit).await.is_err() {
                return;
            }
        }
    }
}
