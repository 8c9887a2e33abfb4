//! Checkpoint store
//!
//! Resumable cursor over the (target x template) execution space. The
//! cursor records, per template, which target positions have completed:
//! a contiguous prefix (`skip_under`) plus a sparse set of out-of-order
//! completions that collapses into the prefix as gaps fill. Advancing
//! happens only after a unit fully completes, so a cancelled run resumes
//! by re-attempting anything in flight at the time of the signal.
//!
//! Resume is best-effort positional, not content-addressed: it assumes the
//! same target ordering and template set as the interrupted run. If either
//! changed in between, a resumed run may skip or repeat units. That is an
//! accepted, documented limitation, not detected as an error.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

/// Identity of one execution unit: a (target, template) pair, with the
/// target addressed by its position in the run's iteration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitId {
    pub template: String,
    pub target_index: usize,
}

impl UnitId {
    pub fn new(template: impl Into<String>, target_index: usize) -> Self {
        Self {
            template: template.into(),
            target_index,
        }
    }
}

/// Per-template completion cursor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TemplateCursor {
    /// Every target position below this completed
    skip_under: usize,
    /// Out-of-order completions at or above `skip_under`
    #[serde(default)]
    completed: BTreeSet<usize>,
}

impl TemplateCursor {
    fn record(&mut self, index: usize) -> bool {
        if self.contains(index) {
            return false;
        }
        self.completed.insert(index);
        self.collapse();
        true
    }

    fn contains(&self, index: usize) -> bool {
        index < self.skip_under || self.completed.contains(&index)
    }

    /// Fold the contiguous prefix of the sparse set into `skip_under`
    fn collapse(&mut self) {
        while self.completed.remove(&self.skip_under) {
            self.skip_under += 1;
        }
    }

    fn count(&self) -> usize {
        self.skip_under + self.completed.len()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    cursors: HashMap<String, TemplateCursor>,
}

/// Thread-safe checkpoint shared across scan workers
#[derive(Default)]
pub struct Checkpoint {
    inner: Mutex<Snapshot>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record completion of a unit. Returns false if it was already
    /// recorded, so every unit lands in the checkpoint at most once.
    pub fn advance(&self, unit: &UnitId) -> bool {
        let mut inner = self.inner.lock();
        inner
            .cursors
            .entry(unit.template.clone())
            .or_default()
            .record(unit.target_index)
    }

    /// O(1) pre-dispatch check used by the scheduler
    pub fn should_skip(&self, unit: &UnitId) -> bool {
        let inner = self.inner.lock();
        inner
            .cursors
            .get(&unit.template)
            .map_or(false, |cursor| cursor.contains(unit.target_index))
    }

    /// Total completed units recorded
    pub fn completed_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.cursors.values().map(|c| c.count()).sum()
    }

    /// Serialize the current position. Round-trips exactly through `load`.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        Ok(serde_json::to_vec_pretty(&*inner)?)
    }

    /// Restore a cursor from a serialized snapshot and compile it for O(1)
    /// skip checks. Replaces any current position.
    pub fn load(&self, bytes: &[u8]) -> Result<()> {
        let mut snapshot: Snapshot = serde_json::from_slice(bytes)?;
        for cursor in snapshot.cursors.values_mut() {
            cursor.collapse();
        }
        let completed: usize = snapshot.cursors.values().map(|c| c.count()).sum();
        info!(completed, "resuming from checkpoint");
        *self.inner.lock() = snapshot;
        Ok(())
    }

    /// Write the current position to a file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let bytes = self.snapshot()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load a previously saved position from a file
    pub fn load_from(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        self.load(&bytes)
    }
}
