//! Builders and scripted collaborators for tests and benchmarks.

use crate::model::{FeatureVectors, GroundTruth};
use crate::sampling::{ConstraintSampler, SamplingContext};
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

/// Ground truth with `per_group` points in each of `groups` groups.
///
/// Points are named `g<group>_p<index>`, so the lexicographic order of the
/// universe interleaves nothing and stays easy to reason about.
pub fn labeled_truth(groups: usize, per_group: usize) -> GroundTruth {
    let mut truth = GroundTruth::new();
    for group in 0..groups {
        for point in 0..per_group {
            truth.insert(format!("g{group}_p{point:02}"), format!("g{group}"));
        }
    }
    truth
}

/// Two-dimensional feature vectors scattered around one center per group.
pub fn clustered_vectors(truth: &GroundTruth, spread: f64, seed: u64) -> FeatureVectors {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centers: std::collections::BTreeMap<&str, (f64, f64)> = Default::default();
    let mut next_center = 0.0;
    for label in truth.values() {
        centers.entry(label.as_str()).or_insert_with(|| {
            next_center += 10.0;
            (next_center, -next_center)
        });
    }

    truth
        .iter()
        .map(|(point, label)| {
            let (cx, cy) = centers[label.as_str()];
            let x = cx + rng.random_range(-spread..=spread);
            let y = cy + rng.random_range(-spread..=spread);
            (point.clone(), vec![x, y])
        })
        .collect()
}

/// All unordered point pairs of a ground truth, in lexicographic order.
pub fn all_pairs(truth: &GroundTruth) -> Vec<(String, String)> {
    let keys: Vec<&String> = truth.keys().collect();
    let mut pairs = Vec::new();
    for (i, a) in keys.iter().enumerate() {
        for b in keys.iter().skip(i + 1) {
            pairs.push(((*a).clone(), (*b).clone()));
        }
    }
    pairs
}

/// Sampler that plays back a fixed script of batches, then reports
/// exhaustion.
pub struct ScriptedSampler {
    batches: VecDeque<Vec<(String, String)>>,
}

impl ScriptedSampler {
    pub fn new<I>(batches: I) -> Self
    where
        I: IntoIterator<Item = Vec<(String, String)>>,
    {
        Self {
            batches: batches.into_iter().collect(),
        }
    }
}

impl ConstraintSampler for ScriptedSampler {
    fn name(&self) -> &str {
        "scripted"
    }

    fn sample(&mut self, _ctx: &SamplingContext<'_>) -> Result<Vec<(String, String)>> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labeled_truth_shape() {
        let truth = labeled_truth(3, 4);
        assert_eq!(truth.len(), 12);
        assert_eq!(truth["g0_p00"], "g0");
        assert_eq!(truth["g2_p03"], "g2");
        assert_eq!(all_pairs(&truth).len(), 12 * 11 / 2);
    }

    #[test]
    fn test_vectors_cover_universe() {
        let truth = labeled_truth(2, 3);
        let vectors = clustered_vectors(&truth, 1.0, 5);
        assert_eq!(vectors.len(), truth.len());
        assert!(vectors.values().all(|v| v.len() == 2));
    }
}
