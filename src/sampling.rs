//! # Candidate Pair Sampling
//!
//! The sampler seam of the annotation loop. Each iteration asks the
//! configured sampler for a batch of still-undetermined pairs to put in
//! front of the annotator; the loop itself is indifferent to how those
//! pairs are chosen.

use crate::constraints::ConstraintManager;
use crate::model::{ClusteringResult, FeatureVectors, IterationId};
use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Everything a sampler may consult when picking the next batch.
///
/// Feature vectors and the previous clustering are passed through opaquely
/// for distance- or boundary-driven strategies; the baseline sampler only
/// reads the constraint state.
pub struct SamplingContext<'a> {
    pub manager: &'a ConstraintManager,
    pub vectors: &'a FeatureVectors,
    pub previous_clustering: Option<&'a ClusteringResult>,
    pub iteration: IterationId,
    pub batch_size: usize,
}

/// Strategy for choosing which undetermined pairs to annotate next.
pub trait ConstraintSampler {
    /// Short strategy name for logs and the run summary.
    fn name(&self) -> &str;

    /// Pick up to `ctx.batch_size` undetermined pairs.
    ///
    /// Returning fewer pairs than requested is normal near exhaustion. An
    /// empty batch is a valid nothing-to-propose signal, not an error; the
    /// loop then falls back to uniform random sampling so progress never
    /// stalls.
    fn sample(&mut self, ctx: &SamplingContext<'_>) -> Result<Vec<(String, String)>>;
}

/// Uniform sampling over the undetermined pairs, seeded for reproducibility.
///
/// The candidate list comes out of the manager in lexicographic order, so a
/// fixed seed yields the same batches run after run.
pub struct RandomSampler {
    rng: StdRng,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ConstraintSampler for RandomSampler {
    fn name(&self) -> &str {
        "random"
    }

    fn sample(&mut self, ctx: &SamplingContext<'_>) -> Result<Vec<(String, String)>> {
        let mut pairs = ctx.manager.undetermined_pairs();
        pairs.shuffle(&mut self.rng);
        pairs.truncate(ctx.batch_size);
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConstraintKind, Universe};

    fn context<'a>(
        manager: &'a ConstraintManager,
        vectors: &'a FeatureVectors,
        batch_size: usize,
    ) -> SamplingContext<'a> {
        SamplingContext {
            manager,
            vectors,
            previous_clustering: None,
            iteration: IterationId(1),
            batch_size,
        }
    }

    #[test]
    fn test_random_sampler_is_reproducible() {
        let manager = ConstraintManager::new(Universe::new(["a", "b", "c", "d", "e"]));
        let vectors = FeatureVectors::new();

        let mut first = RandomSampler::new(7);
        let mut second = RandomSampler::new(7);
        let batch_a = first.sample(&context(&manager, &vectors, 3)).unwrap();
        let batch_b = second.sample(&context(&manager, &vectors, 3)).unwrap();
        assert_eq!(batch_a, batch_b);
        assert_eq!(batch_a.len(), 3);
    }

    #[test]
    fn test_sampler_only_returns_undetermined_pairs() {
        let mut manager = ConstraintManager::new(Universe::new(["a", "b", "c"]));
        manager
            .add_constraint("a", "b", ConstraintKind::MustLink)
            .unwrap();
        let vectors = FeatureVectors::new();

        let mut sampler = RandomSampler::new(0);
        let batch = sampler.sample(&context(&manager, &vectors, 10)).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(!batch.contains(&("a".to_string(), "b".to_string())));
    }

    #[test]
    fn test_short_batch_when_few_pairs_remain() {
        let mut manager = ConstraintManager::new(Universe::new(["a", "b", "c"]));
        manager
            .add_constraint("a", "b", ConstraintKind::MustLink)
            .unwrap();
        manager
            .add_constraint("a", "c", ConstraintKind::CannotLink)
            .unwrap();
        let vectors = FeatureVectors::new();

        let mut sampler = RandomSampler::new(0);
        let batch = sampler.sample(&context(&manager, &vectors, 5)).unwrap();
        assert!(batch.is_empty());
    }
}
