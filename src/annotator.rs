//! # Simulated Annotation
//!
//! Answers candidate pairs from ground truth, standing in for a human
//! annotator. An error model can corrupt a controlled fraction of each
//! batch to study how annotation mistakes propagate, and a conflict policy
//! decides what happens when the manager rejects a submission: drop the
//! pair, or flip the judgment and resubmit.
//!
//! A flipped resubmission always lands, since a rejected constraint proves
//! its opposite is already in force.

use crate::constraints::{ConstraintError, ConstraintManager};
use crate::model::{AnnotationRecord, ConstraintKind, GroundTruth};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures while answering a batch. Conflicts never surface here; they
/// are resolved by the configured [`ConflictPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnnotatorError {
    /// A sampled point has no ground-truth label.
    #[error("no ground-truth label for {0:?}")]
    MissingTruth(String),

    /// The manager rejected the pair itself, not the judgment.
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
}

/// What to do when a submission contradicts the established closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Drop the pair; no constraint is recorded for it.
    Skip,
    /// Resubmit the opposite judgment, which the closure already implies.
    Flip,
}

/// Where corrupted pairs sit within a batch's submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPlacement {
    /// Corrupt pairs in place, keeping the sampled order.
    AsSampled,
    /// Submit all correct pairs first, then the corrupted ones, so that
    /// accumulated correct closure gets a chance to expose each error as a
    /// conflict.
    Deferred,
}

/// Seeded corruption of a fraction of each batch.
#[derive(Debug)]
pub struct ErrorModel {
    rate: f64,
    placement: ErrorPlacement,
    rng: StdRng,
}

impl ErrorModel {
    pub fn new(rate: f64, placement: ErrorPlacement, seed: u64) -> Self {
        debug_assert!((0.0..=1.0).contains(&rate));
        Self {
            rate,
            placement,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// No corruption; batches pass through untouched.
    pub fn none() -> Self {
        Self::new(0.0, ErrorPlacement::AsSampled, 0)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Arrange the batch for submission, marking which pairs to corrupt.
    ///
    /// Picks `floor(len * rate)` distinct positions. Under
    /// [`ErrorPlacement::Deferred`] the corrupted pairs move to the back,
    /// preserving relative order on both sides of the split.
    fn plan(&mut self, batch: Vec<(String, String)>) -> Vec<((String, String), bool)> {
        let k = (batch.len() as f64 * self.rate).floor() as usize;
        let chosen: FxHashSet<usize> = rand::seq::index::sample(&mut self.rng, batch.len(), k)
            .into_iter()
            .collect();

        let mut planned: Vec<((String, String), bool)> = batch
            .into_iter()
            .enumerate()
            .map(|(i, pair)| (pair, chosen.contains(&i)))
            .collect();
        if self.placement == ErrorPlacement::Deferred {
            planned.sort_by_key(|(_, corrupt)| *corrupt);
        }
        planned
    }
}

/// Ground-truth oracle plus error model and conflict policy.
#[derive(Debug)]
pub struct SimulatedAnnotator {
    truth: GroundTruth,
    policy: ConflictPolicy,
    errors: ErrorModel,
}

impl SimulatedAnnotator {
    pub fn new(truth: GroundTruth, policy: ConflictPolicy, errors: ErrorModel) -> Self {
        Self {
            truth,
            policy,
            errors,
        }
    }

    /// Faithful annotator: no corruption, conflicts skipped.
    pub fn faithful(truth: GroundTruth) -> Self {
        Self::new(truth, ConflictPolicy::Skip, ErrorModel::none())
    }

    pub fn truth(&self) -> &GroundTruth {
        &self.truth
    }

    /// The true relation between two points.
    pub fn truth_kind(&self, a: &str, b: &str) -> Result<ConstraintKind, AnnotatorError> {
        let la = self
            .truth
            .get(a)
            .ok_or_else(|| AnnotatorError::MissingTruth(a.to_string()))?;
        let lb = self
            .truth
            .get(b)
            .ok_or_else(|| AnnotatorError::MissingTruth(b.to_string()))?;
        Ok(if la == lb {
            ConstraintKind::MustLink
        } else {
            ConstraintKind::CannotLink
        })
    }

    /// Annotate a batch of candidate pairs against the manager.
    ///
    /// Returns one audit record per pair in submission order. `erroneous`
    /// always compares the *effective* judgment to ground truth, so a
    /// conflict that flips an injected error back to the truth is counted
    /// as correct.
    pub fn annotate_batch(
        &mut self,
        manager: &mut ConstraintManager,
        batch: Vec<(String, String)>,
    ) -> Result<Vec<AnnotationRecord>, AnnotatorError> {
        let planned = self.errors.plan(batch);
        let mut records = Vec::with_capacity(planned.len());

        for ((point_a, point_b), corrupt) in planned {
            let truth = self.truth_kind(&point_a, &point_b)?;
            let intended = if corrupt { truth.inverse() } else { truth };

            let record = match manager.add_constraint(&point_a, &point_b, intended) {
                Ok(_) => AnnotationRecord {
                    point_a,
                    point_b,
                    kind: intended,
                    erroneous: intended != truth,
                    conflict: false,
                    applied: true,
                },
                Err(ConstraintError::Conflict { .. }) => match self.policy {
                    ConflictPolicy::Skip => AnnotationRecord {
                        point_a,
                        point_b,
                        kind: intended,
                        erroneous: intended != truth,
                        conflict: true,
                        applied: false,
                    },
                    ConflictPolicy::Flip => {
                        let flipped = intended.inverse();
                        manager.add_constraint(&point_a, &point_b, flipped)?;
                        AnnotationRecord {
                            point_a,
                            point_b,
                            kind: flipped,
                            erroneous: flipped != truth,
                            conflict: true,
                            applied: true,
                        }
                    }
                },
                Err(err) => return Err(err.into()),
            };
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Universe;

    fn truth_two_groups() -> GroundTruth {
        GroundTruth::from([
            ("a1".to_string(), "g1".to_string()),
            ("a2".to_string(), "g1".to_string()),
            ("b1".to_string(), "g2".to_string()),
            ("b2".to_string(), "g2".to_string()),
        ])
    }

    fn manager_for(truth: &GroundTruth) -> ConstraintManager {
        ConstraintManager::new(Universe::new(truth.keys().cloned()))
    }

    #[test]
    fn test_faithful_annotation_matches_truth() {
        let truth = truth_two_groups();
        let mut manager = manager_for(&truth);
        let mut annotator = SimulatedAnnotator::faithful(truth);

        let records = annotator
            .annotate_batch(
                &mut manager,
                vec![
                    ("a1".to_string(), "a2".to_string()),
                    ("a1".to_string(), "b1".to_string()),
                ],
            )
            .unwrap();

        assert_eq!(records[0].kind, ConstraintKind::MustLink);
        assert_eq!(records[1].kind, ConstraintKind::CannotLink);
        assert!(records.iter().all(|r| !r.erroneous && !r.conflict && r.applied));
        assert_eq!(manager.constraint_count(), 2);
    }

    #[test]
    fn test_error_count_is_floor_of_rate() {
        let truth = truth_two_groups();
        let mut manager = manager_for(&truth);
        let mut annotator = SimulatedAnnotator::new(
            truth,
            ConflictPolicy::Skip,
            ErrorModel::new(0.5, ErrorPlacement::AsSampled, 11),
        );

        // Disjoint pairs so no conflicts can mask the injected errors.
        let records = annotator
            .annotate_batch(
                &mut manager,
                vec![
                    ("a1".to_string(), "a2".to_string()),
                    ("b1".to_string(), "b2".to_string()),
                    ("a1".to_string(), "b1".to_string()),
                ],
            )
            .unwrap();

        let erroneous = records.iter().filter(|r| r.erroneous).count();
        assert_eq!(erroneous, 1);
    }

    #[test]
    fn test_deferred_placement_moves_errors_last() {
        let truth = truth_two_groups();
        let mut manager = manager_for(&truth);
        let mut annotator = SimulatedAnnotator::new(
            truth,
            ConflictPolicy::Skip,
            ErrorModel::new(0.5, ErrorPlacement::Deferred, 3),
        );

        let records = annotator
            .annotate_batch(
                &mut manager,
                vec![
                    ("a1".to_string(), "a2".to_string()),
                    ("b1".to_string(), "b2".to_string()),
                    ("a1".to_string(), "b1".to_string()),
                    ("a2".to_string(), "b2".to_string()),
                ],
            )
            .unwrap();

        // Two of four corrupted; all correct submissions come first.
        let first_error = records.iter().position(|r| r.erroneous || r.conflict);
        let last_clean = records
            .iter()
            .rposition(|r| !r.erroneous && !r.conflict)
            .unwrap();
        if let Some(first_error) = first_error {
            assert!(last_clean < first_error);
        }
    }

    #[test]
    fn test_flip_policy_restores_truth_on_caught_error() {
        let truth = truth_two_groups();
        let mut manager = manager_for(&truth);
        manager
            .add_constraint("a1", "a2", ConstraintKind::MustLink)
            .unwrap();

        // Rate 1.0 corrupts the whole batch; the closure catches it.
        let mut annotator = SimulatedAnnotator::new(
            truth,
            ConflictPolicy::Flip,
            ErrorModel::new(1.0, ErrorPlacement::AsSampled, 0),
        );
        let records = annotator
            .annotate_batch(
                &mut manager,
                vec![("a1".to_string(), "a2".to_string())],
            )
            .unwrap();

        let record = &records[0];
        assert!(record.conflict);
        assert!(record.applied);
        assert_eq!(record.kind, ConstraintKind::MustLink);
        assert!(!record.erroneous);
    }

    #[test]
    fn test_skip_policy_drops_conflicting_pair() {
        let truth = truth_two_groups();
        let mut manager = manager_for(&truth);
        manager
            .add_constraint("a1", "a2", ConstraintKind::MustLink)
            .unwrap();
        let stats = manager.stats();

        let mut annotator = SimulatedAnnotator::new(
            truth,
            ConflictPolicy::Skip,
            ErrorModel::new(1.0, ErrorPlacement::AsSampled, 0),
        );
        let records = annotator
            .annotate_batch(
                &mut manager,
                vec![("a1".to_string(), "a2".to_string())],
            )
            .unwrap();

        let record = &records[0];
        assert!(record.conflict);
        assert!(!record.applied);
        assert_eq!(record.kind, ConstraintKind::CannotLink);
        assert!(record.erroneous);
        assert!(record.annotation().is_none());
        assert_eq!(manager.stats(), stats);
    }

    #[test]
    fn test_missing_truth_is_fatal() {
        let truth = truth_two_groups();
        let mut manager = ConstraintManager::new(Universe::new(["a1", "zz"]));
        let mut annotator = SimulatedAnnotator::faithful(truth);

        let err = annotator
            .annotate_batch(&mut manager, vec![("a1".to_string(), "zz".to_string())])
            .unwrap_err();
        assert_eq!(err, AnnotatorError::MissingTruth("zz".to_string()));
    }
}
