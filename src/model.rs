//! # Data Model
//!
//! Core data structures for constraint management and the annotation loop:
//! point/cluster identifiers, constraint kinds, iteration records, and the
//! fixed universe of data points with its string interning table.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Dense internal index of a data point inside a [`Universe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointIdx(pub u32);

impl PointIdx {
    /// Index into universe-sized arrays.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PointIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Compact identifier for clusters in a clustering result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub u32);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// The binary constraint vocabulary: two points either must share a cluster
/// or must never share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintKind {
    MustLink,
    CannotLink,
}

impl ConstraintKind {
    /// The opposite judgment, used by error injection and the flip policy.
    pub fn inverse(self) -> Self {
        match self {
            ConstraintKind::MustLink => ConstraintKind::CannotLink,
            ConstraintKind::CannotLink => ConstraintKind::MustLink,
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintKind::MustLink => write!(f, "MUST_LINK"),
            ConstraintKind::CannotLink => write!(f, "CANNOT_LINK"),
        }
    }
}

/// An explicit, accepted constraint between two distinct data points.
///
/// The pair is symmetric; `point_a`/`point_b` keep the order in which the
/// annotation was submitted, for audit purposes only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub point_a: String,
    pub point_b: String,
    pub kind: ConstraintKind,
}

impl Annotation {
    pub fn new(point_a: impl Into<String>, point_b: impl Into<String>, kind: ConstraintKind) -> Self {
        Self {
            point_a: point_a.into(),
            point_b: point_b.into(),
            kind,
        }
    }
}

/// Audit record for one annotated candidate pair within an iteration.
///
/// `kind` is the *effective* constraint submitted after error injection and
/// conflict resolution. `erroneous` flags whether that effective constraint
/// contradicts ground truth; `conflict` whether the manager rejected the
/// first submission; `applied` whether any constraint was recorded at all
/// (false only under the skip policy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub point_a: String,
    pub point_b: String,
    pub kind: ConstraintKind,
    pub erroneous: bool,
    pub conflict: bool,
    #[serde(default = "default_applied")]
    pub applied: bool,
}

fn default_applied() -> bool {
    true
}

impl AnnotationRecord {
    /// The annotation this record applied, if any.
    pub fn annotation(&self) -> Option<Annotation> {
        self.applied
            .then(|| Annotation::new(&self.point_a, &self.point_b, self.kind))
    }
}

/// Sequential iteration identifier with the fixed-width, zero-padded string
/// form used as artifact keys (`"0000"`, `"0001"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IterationId(pub u32);

impl IterationId {
    pub const FIRST: IterationId = IterationId(0);

    /// The next iteration in sequence.
    pub fn next(self) -> Self {
        IterationId(self.0 + 1)
    }
}

impl fmt::Display for IterationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

impl FromStr for IterationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(IterationId)
    }
}

impl Serialize for IterationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IterationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|_| D::Error::custom(format!("invalid iteration id: {raw:?}")))
    }
}

/// Elapsed seconds per phase of one iteration, measured by scoped timers
/// around the sampling and clustering calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationTimings {
    pub sampling_total: f64,
    pub clustering_total: f64,
    pub total: f64,
}

impl IterationTimings {
    pub fn new(sampling_total: f64, clustering_total: f64) -> Self {
        Self {
            sampling_total,
            clustering_total,
            total: sampling_total + clustering_total,
        }
    }
}

/// Full assignment of every data point to a cluster.
pub type ClusteringResult = BTreeMap<String, ClusterId>;

/// True label per data point, consumed only by the simulated annotator and
/// quality probes, never by the constraints manager.
pub type GroundTruth = BTreeMap<String, String>;

/// Feature vector per data point, opaque to the core and passed through to
/// samplers and clusterers.
pub type FeatureVectors = BTreeMap<String, Vec<f64>>;

/// The fixed universe of data-point identifiers for one experiment.
///
/// Created once at dataset load; keys are sorted and de-duplicated so that
/// dense indices are stable and runs are deterministic. Never mutated for
/// the lifetime of a constraints manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Universe {
    keys: Vec<String>,
    index: HashMap<String, PointIdx>,
}

impl Universe {
    /// Build the universe from an arbitrary collection of point keys.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort();
        keys.dedup();

        let index = keys
            .iter()
            .enumerate()
            .map(|(i, key)| (key.clone(), PointIdx(i as u32)))
            .collect();

        Self { keys, index }
    }

    /// Look up the dense index of a point key.
    pub fn get(&self, key: &str) -> Option<PointIdx> {
        self.index.get(key).copied()
    }

    /// The key at a dense index. Panics on an out-of-range index, which
    /// cannot occur for indices produced by this universe.
    pub fn key(&self, idx: PointIdx) -> &str {
        &self.keys[idx.index()]
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// All point keys in sorted order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// All dense indices, in key order.
    pub fn indices(&self) -> impl Iterator<Item = PointIdx> + '_ {
        (0..self.keys.len() as u32).map(PointIdx)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of unordered distinct pairs in the universe.
    pub fn pair_count(&self) -> usize {
        let n = self.keys.len();
        n * n.saturating_sub(1) / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_universe_sorts_and_dedups() {
        let universe = Universe::new(["b", "a", "c", "a"]);
        assert_eq!(universe.len(), 3);
        assert_eq!(universe.keys(), &["a", "b", "c"]);
        assert_eq!(universe.get("a"), Some(PointIdx(0)));
        assert_eq!(universe.get("c"), Some(PointIdx(2)));
        assert_eq!(universe.get("z"), None);
        assert_eq!(universe.key(PointIdx(1)), "b");
        assert_eq!(universe.pair_count(), 3);
    }

    #[test]
    fn test_empty_universe() {
        let universe = Universe::new(Vec::<String>::new());
        assert!(universe.is_empty());
        assert_eq!(universe.pair_count(), 0);
    }

    #[test]
    fn test_iteration_id_padding() {
        assert_eq!(IterationId(0).to_string(), "0000");
        assert_eq!(IterationId(7).to_string(), "0007");
        assert_eq!(IterationId(123).to_string(), "0123");
        assert_eq!(IterationId(12345).to_string(), "12345");
        assert_eq!("0042".parse::<IterationId>().unwrap(), IterationId(42));
        assert_eq!(IterationId(2).next(), IterationId(3));
    }

    #[test]
    fn test_iteration_id_as_map_key() {
        let mut map = BTreeMap::new();
        map.insert(IterationId(0), "first");
        map.insert(IterationId(1), "second");

        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"0000":"first","0001":"second"}"#);

        let back: BTreeMap<IterationId, String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back[&IterationId(1)], "second");
    }

    #[test]
    fn test_constraint_kind_serde() {
        let json = serde_json::to_string(&ConstraintKind::MustLink).unwrap();
        assert_eq!(json, "\"MUST_LINK\"");
        let kind: ConstraintKind = serde_json::from_str("\"CANNOT_LINK\"").unwrap();
        assert_eq!(kind, ConstraintKind::CannotLink);
        assert_eq!(kind.inverse(), ConstraintKind::MustLink);
        assert_eq!(ConstraintKind::MustLink.inverse().inverse(), ConstraintKind::MustLink);
    }

    #[test]
    fn test_cluster_id_serializes_as_integer() {
        let mut result = ClusteringResult::new();
        result.insert("a".to_string(), ClusterId(2));
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"a":2}"#);
    }

    #[test]
    fn test_annotation_record_applied_default() {
        let json = r#"{"point_a":"a","point_b":"b","kind":"MUST_LINK","erroneous":false,"conflict":false}"#;
        let record: AnnotationRecord = serde_json::from_str(json).unwrap();
        assert!(record.applied);
        assert_eq!(
            record.annotation(),
            Some(Annotation::new("a", "b", ConstraintKind::MustLink))
        );
    }

    #[test]
    fn test_timings_total() {
        let timings = IterationTimings::new(0.5, 1.25);
        assert_eq!(timings.total, 1.75);
        let json = serde_json::to_string(&timings).unwrap();
        assert!(json.contains("\"sampling_total\":0.5"));
        assert!(json.contains("\"clustering_total\":1.25"));
    }
}
