//! Per-forward-pass adapter state.

use crate::composition::Composition;

/// State threaded through one forward pass.
///
/// Holds the active composition and records whether parallel composition has
/// already replicated the batch.
#[derive(Debug, Clone, Default)]
pub struct ForwardContext {
    active: Option<Composition>,
    parallel_replicas: Option<usize>,
}

impl ForwardContext {
    /// Context for the given active composition.
    #[must_use]
    pub fn new(active: Option<Composition>) -> Self {
        Self {
            active,
            parallel_replicas: None,
        }
    }

    /// Active adapter composition, if any.
    #[must_use]
    pub fn active(&self) -> Option<&Composition> {
        self.active.as_ref()
    }

    /// Number of replicas created by parallel composition, if it has happened.
    #[must_use]
    pub fn parallel_replicas(&self) -> Option<usize> {
        self.parallel_replicas
    }

    /// Record that the batch has been replicated `n` times.
    pub fn mark_parallelized(&mut self, n: usize) {
        self.parallel_replicas = Some(n);
    }
}
