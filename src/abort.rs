//! Abort registry (spec §2, "Abort registry" component): tracks in-flight
//! generations on the worker side and propagates cancellation across the
//! boundary.
//!
//! Grounded in the cancellation-token pattern used for per-request abort in
//! `other_examples/.../llama-agent-src-queue.rs` (`tokio_util::sync::CancellationToken`
//! per queued request), adapted here to key by correlation id since this
//! core has exactly one generation in flight per worker at a time (spec §5).

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::envelope::CorrelationId;

/// Tracks the cancellation token for every generation currently in flight.
/// Mutated only on the worker's loop (spec §5, shared-resource policy).
#[derive(Default)]
pub struct AbortRegistry {
    active: Mutex<HashMap<CorrelationId, CancellationToken>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh generation, returning the token its worker-side
    /// loop should poll.
    pub fn begin(&self, id: CorrelationId) -> CancellationToken {
        let token = CancellationToken::new();
        self.active.lock().unwrap().insert(id, token.clone());
        token
    }

    /// Cancel a generation. Idempotent: aborting an id that is already
    /// cancelled, or unknown, is a no-op (spec §8, "abortGeneration is
    /// idempotent").
    pub fn abort(&self, id: CorrelationId) {
        if let Some(token) = self.active.lock().unwrap().get(&id) {
            token.cancel();
        }
    }

    /// Remove a generation from the active set once it has produced its
    /// terminal envelope, whether by completion or abort (spec §5,
    /// "removal of the correlation id from the active-generations map on
    /// both sides").
    pub fn finish(&self, id: CorrelationId) {
        self.active.lock().unwrap().remove(&id);
    }

    pub fn is_active(&self, id: CorrelationId) -> bool {
        self.active.lock().unwrap().contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_idempotent_and_observable() {
        let registry = AbortRegistry::new();
        let token = registry.begin(1);
        assert!(!token.is_cancelled());

        registry.abort(1);
        registry.abort(1); // second abort is a no-op, not an error
        assert!(token.is_cancelled());

        registry.finish(1);
        assert!(!registry.is_active(1));
    }

    #[test]
    fn abort_of_unknown_id_is_a_no_op() {
        let registry = AbortRegistry::new();
        registry.abort(999); // must not panic
        assert!(!registry.is_active(999));
    }
}
