//! Candidate planning for a single dispatch
//!
//! Produces the ordered list of endpoints one request will walk. Ordered
//! pools keep their declaration order; weighted pools are permuted by
//! roulette selection without replacement, so fallback order is also
//! weight-biased. The endpoint the caller asked for is promoted to the front.

use crate::config::{Config, ModelsPolicy};
use crate::endpoint::EndpointId;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

/// Plans the candidate list for incoming requests
#[derive(Clone)]
pub struct CandidatePlanner {
    config: Arc<Config>,
}

impl CandidatePlanner {
    /// Create a planner over the configured model pool
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Candidate list for one request
    pub fn plan(&self, requested: Option<&EndpointId>) -> Vec<EndpointId> {
        self.plan_with_rng(&mut rand::thread_rng(), requested)
    }

    /// Candidate list drawn with a caller-supplied RNG
    ///
    /// With a fixed seed the result is a pure function of the model pool and
    /// the requested endpoint.
    pub fn plan_with_rng<R: Rng>(
        &self,
        rng: &mut R,
        requested: Option<&EndpointId>,
    ) -> Vec<EndpointId> {
        let mut candidates = match self.config.models() {
            ModelsPolicy::Ordered(list) => list.clone(),
            ModelsPolicy::Weighted(map) => weighted_permutation(rng, map),
        };

        if let Some(requested) = requested {
            if let Some(position) = candidates.iter().position(|e| e == requested) {
                let promoted = candidates.remove(position);
                candidates.insert(0, promoted);
            }
        }

        tracing::debug!(
            candidates = ?candidates.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
            requested = requested.map(|e| e.to_string()),
            "Planned candidate list"
        );
        candidates
    }
}

/// Weighted-random permutation without replacement
///
/// Each position is drawn by roulette over the remaining endpoints, with
/// cumulative weights recomputed after every pick. Remaining endpoints are
/// kept sorted by identity so a seeded RNG yields a deterministic result.
fn weighted_permutation<R: Rng>(rng: &mut R, weights: &HashMap<EndpointId, f64>) -> Vec<EndpointId> {
    let mut remaining: Vec<(EndpointId, f64)> =
        weights.iter().map(|(e, w)| (e.clone(), *w)).collect();
    remaining.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));

    let mut ordered = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let total: f64 = remaining.iter().map(|(_, w)| w).sum();
        let roll = rng.gen_range(0.0..total);

        let mut cumulative = 0.0;
        // Fall back to the last entry if rounding leaves the roll unclaimed.
        let mut picked = remaining.len() - 1;
        for (index, (_, weight)) in remaining.iter().enumerate() {
            cumulative += weight;
            if roll < cumulative {
                picked = index;
                break;
            }
        }
        ordered.push(remaining.remove(picked).0);
    }
    ordered
}
