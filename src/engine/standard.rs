//! Standard execution strategy
//!
//! Deterministic full cross product: every template cluster runs against
//! every target, cluster-major. Target iteration happens on a blocking
//! task because the spilled tier of the target set reads sqlite; units
//! flow to the async worker pool over a bounded channel, so a slow pool
//! backpressures the producer instead of buffering the whole product.

use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use super::{spawn_pool, unit_buffer, ExecutionUnit, ScanEngine, WorkerShared};
use crate::catalog::cluster_templates;
use crate::checkpoint::UnitId;
use crate::error::{EngineError, Result};

pub(crate) async fn execute(engine: &ScanEngine) -> Result<()> {
    let clusters = cluster_templates(&engine.templates, engine.config.no_clustering);

    let total = (engine.targets.count() * clusters.len()) as u64;
    engine
        .progress
        .init(total, engine.checkpoint.completed_count() as u64, 0);

    let workers = engine.config.actual_workers();
    let (tx, rx) = mpsc::channel(unit_buffer(workers));
    let shared = WorkerShared::for_engine(engine);
    let pool = spawn_pool(workers, shared.clone(), rx);

    let targets = engine.targets.clone();
    let checkpoint = engine.checkpoint.clone();
    let progress = engine.progress.clone();
    let cancel = engine.cancel.clone();
    let found = engine.found.clone();
    let host_errors = shared.host_errors.clone();
    let stop_at_first_match = engine.config.stop_at_first_match;
    let max_host_errors = engine.config.max_host_errors;

    let producer = tokio::task::spawn_blocking(move || -> Result<()> {
        for cluster in clusters {
            if cancel.is_cancelled() {
                break;
            }
            if stop_at_first_match && found.load(Ordering::Acquire) {
                break;
            }
            targets.iterate(|position, target| {
                if cancel.is_cancelled() {
                    return false;
                }
                if stop_at_first_match && found.load(Ordering::Acquire) {
                    return false;
                }
                if !cluster.representative.protocol.applies_to(&target) {
                    progress.increment_skipped();
                    return true;
                }
                if max_host_errors > 0 {
                    let tripped = host_errors
                        .get(&target.input)
                        .map_or(false, |errors| *errors >= max_host_errors);
                    if tripped {
                        progress.increment_skipped();
                        return true;
                    }
                }
                // Resumed positions were counted as current at init time,
                // not as skipped
                let unit_id = UnitId::new(cluster.representative.id.clone(), position);
                if checkpoint.should_skip(&unit_id) {
                    return true;
                }
                tx.blocking_send(ExecutionUnit {
                    position,
                    target,
                    cluster: cluster.clone(),
                })
                .is_ok()
            })?;
        }
        Ok(())
    });

    // The producer owns the only sender; once it finishes the channel
    // drains and the pool exits on its own.
    let produced = producer
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)));
    for handle in pool {
        let _ = handle.await;
    }
    produced??;

    if engine.cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    Ok(())
}
