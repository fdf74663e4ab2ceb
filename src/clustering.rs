//! # Constrained Clustering
//!
//! The clusterer seam of the annotation loop, plus the built-in baseline:
//! closure clustering, which turns the manager's equivalence classes
//! directly into clusters and can greedily merge compatible classes down
//! toward a requested cluster count. Every result honors the full
//! constraint closure; a result that would require splitting a must-link
//! class is never produced.

use crate::constraints::ConstraintManager;
use crate::model::{ClusterId, ClusteringResult, FeatureVectors, GroundTruth, IterationId, Universe};
use anyhow::Result;
use rustc_hash::FxHashSet;
use thiserror::Error;

/// Fatal clustering failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusteringError {
    /// Forbidden edges make the requested cluster count unreachable.
    #[error(
        "cannot merge below {reachable} clusters toward {requested}: remaining classes are mutually forbidden"
    )]
    Infeasible { requested: usize, reachable: usize },

    /// The clusterer failed to assign a point of the universe.
    #[error("clustering left {0:?} unassigned")]
    MissingAssignment(String),

    /// The clusterer assigned a point outside the universe.
    #[error("clustering assigned unknown point {0:?}")]
    ForeignPoint(String),
}

/// Inputs for one clustering pass.
pub struct ClusteringContext<'a> {
    pub manager: &'a ConstraintManager,
    pub vectors: &'a FeatureVectors,
    pub num_clusters: Option<usize>,
    pub iteration: IterationId,
}

/// A clustering algorithm that honors the constraint closure.
///
/// Implementations must assign every point of the universe exactly once;
/// the loop validates the result with [`validate_assignment`] and treats
/// any violation as fatal.
pub trait ConstrainedClusterer {
    /// Short algorithm name for logs and the run summary.
    fn name(&self) -> &str;

    fn cluster(&mut self, ctx: &ClusteringContext<'_>) -> Result<ClusteringResult>;
}

/// Scoring hook for quality budgets.
///
/// The loop never interprets the score beyond comparing it to the
/// configured floor; higher must mean better.
pub trait QualityProbe {
    fn name(&self) -> &str;

    fn score(&mut self, result: &ClusteringResult, truth: &GroundTruth) -> Result<f64>;
}

/// Built-in probe: pair-counting agreement between a clustering and the
/// truth partition.
///
/// Scores the fraction of point pairs whose co-membership matches on both
/// sides, reaching 1.0 exactly when the clustering reproduces the truth.
/// Quadratic in the universe size, which is fine at annotation-study
/// scale.
#[derive(Debug, Default)]
pub struct PairAgreementProbe;

impl QualityProbe for PairAgreementProbe {
    fn name(&self) -> &str {
        "pair_agreement"
    }

    fn score(&mut self, result: &ClusteringResult, truth: &GroundTruth) -> Result<f64> {
        let keys: Vec<&String> = truth.keys().collect();
        if keys.len() < 2 {
            return Ok(1.0);
        }

        let mut agreeing = 0usize;
        let mut total = 0usize;
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                let same_truth = truth[*a] == truth[*b];
                let same_cluster = match (result.get(*a), result.get(*b)) {
                    (Some(ca), Some(cb)) => ca == cb,
                    _ => false,
                };
                if same_truth == same_cluster {
                    agreeing += 1;
                }
                total += 1;
            }
        }
        Ok(agreeing as f64 / total as f64)
    }
}

/// Check that `result` assigns exactly the points of `universe`.
pub fn validate_assignment(
    universe: &Universe,
    result: &ClusteringResult,
) -> Result<(), ClusteringError> {
    for key in result.keys() {
        if !universe.contains(key) {
            return Err(ClusteringError::ForeignPoint(key.clone()));
        }
    }
    for key in universe.keys() {
        if !result.contains_key(key) {
            return Err(ClusteringError::MissingAssignment(key.clone()));
        }
    }
    Ok(())
}

/// Baseline clusterer over the constraint closure alone.
///
/// Each equivalence class starts as one cluster. When the context requests
/// fewer clusters than classes, the smallest clusters are merged first,
/// skipping any merge across a forbidden edge. A requested count larger
/// than the class count is served with one cluster per class, since
/// honoring it would split must-linked points.
#[derive(Debug, Default)]
pub struct ClosureClustering;

impl ClosureClustering {
    pub fn new() -> Self {
        Self
    }
}

/// Working cluster during greedy merging: the original class indices it
/// spans, their members, and every original class it is forbidden against.
struct MergeCluster {
    origs: FxHashSet<usize>,
    members: Vec<String>,
    forbidden_origs: FxHashSet<usize>,
}

impl MergeCluster {
    fn compatible(&self, other: &MergeCluster) -> bool {
        other.origs.is_disjoint(&self.forbidden_origs)
    }

    fn absorb(&mut self, other: MergeCluster) {
        self.origs.extend(other.origs);
        self.members.extend(other.members);
        self.members.sort();
        self.forbidden_origs.extend(other.forbidden_origs);
    }
}

impl ConstrainedClusterer for ClosureClustering {
    fn name(&self) -> &str {
        "closure"
    }

    fn cluster(&mut self, ctx: &ClusteringContext<'_>) -> Result<ClusteringResult> {
        let classes = ctx.manager.classes();
        let mut clusters: Vec<MergeCluster> = classes
            .iter()
            .enumerate()
            .map(|(i, members)| MergeCluster {
                origs: FxHashSet::from_iter([i]),
                members: members.clone(),
                forbidden_origs: forbidden_classes(ctx.manager, &classes, i),
            })
            .collect();

        if let Some(target) = ctx.num_clusters {
            while clusters.len() > target.max(1) {
                let Some((i, j)) = next_merge(&clusters) else {
                    return Err(ClusteringError::Infeasible {
                        requested: target,
                        reachable: clusters.len(),
                    }
                    .into());
                };
                // Remove the higher position so the lower one stays valid.
                let (keep, remove) = if i < j { (i, j) } else { (j, i) };
                let absorbed = clusters.swap_remove(remove);
                clusters[keep].absorb(absorbed);
            }
        }

        clusters.sort_by(|a, b| a.members.cmp(&b.members));
        let mut result = ClusteringResult::new();
        for (id, cluster) in clusters.into_iter().enumerate() {
            for member in cluster.members {
                result.insert(member, ClusterId(id as u32));
            }
        }
        Ok(result)
    }
}

/// Original class indices forbidden against class `i`, via each class's
/// representative member.
fn forbidden_classes(
    manager: &ConstraintManager,
    classes: &[Vec<String>],
    i: usize,
) -> FxHashSet<usize> {
    let mut out = FxHashSet::default();
    for (j, other) in classes.iter().enumerate() {
        if i == j {
            continue;
        }
        // Representatives suffice: forbidden edges always span whole classes.
        if let Ok(crate::constraints::PairRelation::CannotLink) =
            manager.relation_between(&classes[i][0], &other[0])
        {
            out.insert(j);
        }
    }
    out
}

/// Pick the next pair of cluster positions to merge: the smallest cluster
/// first, its smallest compatible partner second. Ties break on the lowest
/// member list, keeping runs deterministic.
fn next_merge(clusters: &[MergeCluster]) -> Option<(usize, usize)> {
    let mut order: Vec<usize> = (0..clusters.len()).collect();
    order.sort_by(|&a, &b| {
        (clusters[a].members.len(), &clusters[a].members)
            .cmp(&(clusters[b].members.len(), &clusters[b].members))
    });

    for (rank, &i) in order.iter().enumerate() {
        for &j in order.iter().skip(rank + 1) {
            if clusters[i].compatible(&clusters[j]) {
                return Some((i, j));
            }
        }
    }
    None
}
