//! # Constraints Manager
//!
//! Incremental store for pairwise clustering constraints with closure
//! semantics. Must-link constraints merge equivalence classes through a
//! union-find forest; cannot-link constraints become forbidden edges between
//! class representatives, so every stored relation automatically covers all
//! members of both classes. Contradictions are detected at submission time
//! and rejected without mutating any state.
//!
//! Completeness — every pair of points carrying a determined relation — is
//! tracked in O(1): with `k` live classes, the relation set is complete
//! exactly when the number of forbidden edges reaches `k * (k - 1) / 2`.

use crate::dsu::DisjointSets;
use crate::model::{Annotation, ConstraintKind, PointIdx, Universe};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Rejection reasons for a submitted constraint.
///
/// `Conflict` is recoverable: the manager is untouched and the caller may
/// resubmit a different judgment for the pair. The other variants signal a
/// malformed pair and abort the caller's batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstraintError {
    /// The submitted constraint contradicts the closure already in force.
    #[error("{kind} between {point_a:?} and {point_b:?} contradicts established {existing}")]
    Conflict {
        point_a: String,
        point_b: String,
        kind: ConstraintKind,
        existing: ConstraintKind,
    },

    /// The pair references an identifier outside the universe.
    #[error("unknown data point {0:?}")]
    UnknownPoint(String),

    /// Both sides of the pair are the same point.
    #[error("cannot constrain {0:?} against itself")]
    SelfLink(String),
}

/// Outcome of a successfully accepted constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintUpdate {
    /// The constraint changed the closure and was recorded.
    Applied,
    /// The constraint was already implied; nothing changed.
    AlreadyKnown,
}

/// Derived relation between two points under the current closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairRelation {
    MustLink,
    CannotLink,
    Undetermined,
}

/// Closed set of available manager implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerKind {
    /// Binary must-link / cannot-link vocabulary.
    #[default]
    Binary,
}

impl ManagerKind {
    pub fn build(self, universe: Universe) -> ConstraintManager {
        match self {
            ManagerKind::Binary => ConstraintManager::new(universe),
        }
    }
}

/// Counters describing the current closure, for logging and budget checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub points: usize,
    pub classes: usize,
    pub must_links: usize,
    pub cannot_links: usize,
    pub forbidden_edges: usize,
    pub complete: bool,
}

/// Pairwise constraint store over a fixed universe of data points.
#[derive(Debug, Clone)]
pub struct ConstraintManager {
    universe: Universe,
    sets: DisjointSets,
    /// Forbidden edges between class representatives, kept symmetric.
    forbidden: FxHashMap<PointIdx, FxHashSet<PointIdx>>,
    forbidden_edges: usize,
    log: Vec<Annotation>,
    must_links: usize,
    cannot_links: usize,
}

impl ConstraintManager {
    pub fn new(universe: Universe) -> Self {
        let n = universe.len();
        Self {
            universe,
            sets: DisjointSets::new(n),
            forbidden: FxHashMap::default(),
            forbidden_edges: 0,
            log: Vec::new(),
            must_links: 0,
            cannot_links: 0,
        }
    }

    pub fn universe(&self) -> &Universe {
        &self.universe
    }

    /// Submit one pairwise constraint.
    ///
    /// Validation happens before any mutation, so a returned error leaves
    /// the closure exactly as it was. Resubmitting an implied constraint is
    /// accepted as [`ConstraintUpdate::AlreadyKnown`] and does not grow the
    /// audit log.
    pub fn add_constraint(
        &mut self,
        point_a: &str,
        point_b: &str,
        kind: ConstraintKind,
    ) -> Result<ConstraintUpdate, ConstraintError> {
        let (ia, ib) = self.resolve_pair(point_a, point_b)?;
        let ra = self.sets.find_compress(ia);
        let rb = self.sets.find_compress(ib);

        let update = match kind {
            ConstraintKind::MustLink => {
                if ra == rb {
                    return Ok(ConstraintUpdate::AlreadyKnown);
                }
                if self.is_forbidden(ra, rb) {
                    return Err(ConstraintError::Conflict {
                        point_a: point_a.to_string(),
                        point_b: point_b.to_string(),
                        kind,
                        existing: ConstraintKind::CannotLink,
                    });
                }
                self.merge_classes(ra, rb);
                self.must_links += 1;
                ConstraintUpdate::Applied
            }
            ConstraintKind::CannotLink => {
                if ra == rb {
                    return Err(ConstraintError::Conflict {
                        point_a: point_a.to_string(),
                        point_b: point_b.to_string(),
                        kind,
                        existing: ConstraintKind::MustLink,
                    });
                }
                if self.is_forbidden(ra, rb) {
                    return Ok(ConstraintUpdate::AlreadyKnown);
                }
                self.forbid(ra, rb);
                self.cannot_links += 1;
                ConstraintUpdate::Applied
            }
        };

        self.log.push(Annotation::new(point_a, point_b, kind));
        Ok(update)
    }

    /// All points in the same class as `point`, the point itself included.
    pub fn linked_points(&self, point: &str) -> Result<BTreeSet<String>, ConstraintError> {
        let idx = self.resolve(point)?;
        let root = self.sets.find(idx);
        Ok(self
            .universe
            .indices()
            .filter(|&i| self.sets.find(i) == root)
            .map(|i| self.universe.key(i).to_string())
            .collect())
    }

    /// All points in classes forbidden against the class of `point`.
    pub fn forbidden_points(&self, point: &str) -> Result<BTreeSet<String>, ConstraintError> {
        let idx = self.resolve(point)?;
        let root = self.sets.find(idx);
        let Some(neighbors) = self.forbidden.get(&root) else {
            return Ok(BTreeSet::new());
        };
        Ok(self
            .universe
            .indices()
            .filter(|&i| neighbors.contains(&self.sets.find(i)))
            .map(|i| self.universe.key(i).to_string())
            .collect())
    }

    /// The relation currently implied between two points.
    ///
    /// A point relates to itself as must-link.
    pub fn relation_between(
        &self,
        point_a: &str,
        point_b: &str,
    ) -> Result<PairRelation, ConstraintError> {
        let ia = self.resolve(point_a)?;
        let ib = self.resolve(point_b)?;
        let ra = self.sets.find(ia);
        let rb = self.sets.find(ib);
        if ra == rb {
            Ok(PairRelation::MustLink)
        } else if self.is_forbidden(ra, rb) {
            Ok(PairRelation::CannotLink)
        } else {
            Ok(PairRelation::Undetermined)
        }
    }

    /// Whether every pair of points has a determined relation.
    ///
    /// Complete means every remaining pair of classes carries a forbidden
    /// edge; within classes the relation is must-link by construction. Runs
    /// in O(1) off maintained counters.
    pub fn is_complete(&self) -> bool {
        let k = self.sets.set_count();
        self.forbidden_edges == k * k.saturating_sub(1) / 2
    }

    /// Applied constraints in submission order. Resubmissions of implied
    /// constraints are absent, so replaying this log into a fresh manager
    /// reproduces the closure.
    pub fn annotations(&self) -> &[Annotation] {
        &self.log
    }

    /// Number of applied constraints.
    pub fn constraint_count(&self) -> usize {
        self.log.len()
    }

    /// Number of live equivalence classes.
    pub fn class_count(&self) -> usize {
        self.sets.set_count()
    }

    /// Current equivalence classes as sorted member lists, ordered by their
    /// smallest member.
    pub fn classes(&self) -> Vec<Vec<String>> {
        let mut by_root: FxHashMap<PointIdx, Vec<String>> = FxHashMap::default();
        for idx in self.universe.indices() {
            by_root
                .entry(self.sets.find(idx))
                .or_default()
                .push(self.universe.key(idx).to_string());
        }
        // Universe indices come out in key order, so members are sorted.
        let mut classes: Vec<Vec<String>> = by_root.into_values().collect();
        classes.sort();
        classes
    }

    /// All pairs whose relation is still undetermined, in lexicographic
    /// order.
    pub fn undetermined_pairs(&self) -> Vec<(String, String)> {
        let keys = self.universe.keys();
        let mut pairs = Vec::new();
        for (i, a) in keys.iter().enumerate() {
            let ra = self.sets.find(PointIdx(i as u32));
            for (j, b) in keys.iter().enumerate().skip(i + 1) {
                let rb = self.sets.find(PointIdx(j as u32));
                if ra != rb && !self.is_forbidden(ra, rb) {
                    pairs.push((a.clone(), b.clone()));
                }
            }
        }
        pairs
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            points: self.universe.len(),
            classes: self.sets.set_count(),
            must_links: self.must_links,
            cannot_links: self.cannot_links,
            forbidden_edges: self.forbidden_edges,
            complete: self.is_complete(),
        }
    }

    fn resolve(&self, point: &str) -> Result<PointIdx, ConstraintError> {
        self.universe
            .get(point)
            .ok_or_else(|| ConstraintError::UnknownPoint(point.to_string()))
    }

    fn resolve_pair(
        &self,
        point_a: &str,
        point_b: &str,
    ) -> Result<(PointIdx, PointIdx), ConstraintError> {
        let ia = self.resolve(point_a)?;
        let ib = self.resolve(point_b)?;
        if ia == ib {
            return Err(ConstraintError::SelfLink(point_a.to_string()));
        }
        Ok((ia, ib))
    }

    #[inline]
    fn is_forbidden(&self, ra: PointIdx, rb: PointIdx) -> bool {
        self.forbidden.get(&ra).is_some_and(|s| s.contains(&rb))
    }

    fn forbid(&mut self, ra: PointIdx, rb: PointIdx) {
        self.forbidden.entry(ra).or_default().insert(rb);
        self.forbidden.entry(rb).or_default().insert(ra);
        self.forbidden_edges += 1;
    }

    /// Union two class roots and carry the absorbed root's forbidden edges
    /// over to the survivor. Edges that both roots held against the same
    /// third class collapse into one.
    fn merge_classes(&mut self, ra: PointIdx, rb: PointIdx) {
        let Some((winner, loser)) = self.sets.union(ra, rb) else {
            return;
        };
        let Some(absorbed) = self.forbidden.remove(&loser) else {
            return;
        };
        for other in absorbed {
            if let Some(set) = self.forbidden.get_mut(&other) {
                set.remove(&loser);
            }
            if self.forbidden.entry(winner).or_default().insert(other) {
                self.forbidden.entry(other).or_default().insert(winner);
            } else {
                // Both classes already excluded `other`; one edge survives.
                self.forbidden_edges -= 1;
            }
        }
    }
}
