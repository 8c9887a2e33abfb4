//! Probe execution interface
//!
//! The engine never speaks a protocol itself. Each execution unit is handed
//! to a `ProbeExecutor` collaborator together with a `ProbeContext` that
//! carries the unit identity, the run's cancellation token, and the hook
//! for registering out-of-band markers. Executors must tolerate being
//! invoked again for the same (target, template) pair after a resume:
//! delivery is at-least-once.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::catalog::Template;
use crate::checkpoint::UnitId;
use crate::error::Result;
use crate::interactions::InteractionCorrelator;
use crate::targets::Target;

/// Synchronous outcome of one probe execution
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// Whether the probe's matchers fired
    pub matched: bool,
    /// Data extracted from the response, if any
    pub extracted: Vec<String>,
}

impl Outcome {
    pub fn matched() -> Self {
        Self {
            matched: true,
            extracted: Vec::new(),
        }
    }

    pub fn no_match() -> Self {
        Self::default()
    }
}

/// Per-unit execution context handed to the probe
pub struct ProbeContext {
    unit: UnitId,
    cancel: CancellationToken,
    correlator: Option<Arc<InteractionCorrelator>>,
    markers: Mutex<Vec<String>>,
}

impl ProbeContext {
    pub fn new(
        unit: UnitId,
        cancel: CancellationToken,
        correlator: Option<Arc<InteractionCorrelator>>,
    ) -> Self {
        Self {
            unit,
            cancel,
            correlator,
            markers: Mutex::new(Vec::new()),
        }
    }

    pub fn unit(&self) -> &UnitId {
        &self.unit
    }

    /// True once the run has been cancelled; probes should abort their I/O
    /// as soon as feasible.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Obtain a unique out-of-band marker to embed in an outgoing request.
    /// Returns None when interaction correlation is disabled for this run.
    pub fn register_marker(&self) -> Option<String> {
        let correlator = self.correlator.as_ref()?;
        let marker = correlator.register(&self.unit);
        self.markers.lock().push(marker.clone());
        Some(marker)
    }

    /// Start the cooldown clock on every marker this unit registered.
    /// Called by the engine after the probe's synchronous execution returns.
    pub(crate) fn complete_markers(&self) {
        if let Some(correlator) = &self.correlator {
            for marker in self.markers.lock().iter() {
                correlator.mark_completed(marker);
            }
        }
    }
}

/// Protocol probe execution (external collaborator).
///
/// Implementations open sockets, send template requests, and match
/// responses; none of that is this crate's concern.
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    /// Run one template against one target
    async fn execute(
        &self,
        target: &Target,
        template: &Template,
        ctx: &ProbeContext,
    ) -> Result<Outcome>;

    /// Lightweight identification probe used by the automatic strategy:
    /// returns technology/protocol tags detected on the target.
    async fn identify(&self, target: &Target, ctx: &ProbeContext) -> Result<Vec<String>> {
        let _ = (target, ctx);
        Ok(Vec::new())
    }
}
