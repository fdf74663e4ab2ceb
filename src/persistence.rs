//! # Run Persistence
//!
//! File-backed storage for one annotation run. A run directory holds the
//! dataset inputs, one JSON artifact per output stream keyed by iteration,
//! and a manifest guarding the storage format:
//!
//! ```text
//! <data_dir>/
//!   manifest.json             format version + app version
//!   ground_truth.json         point -> true label        (input)
//!   vectors.json              point -> feature vector    (input, optional)
//!   clustering_results.json   iteration -> clustering
//!   annotations.json          iteration -> audit records
//!   timings.json              iteration -> phase timings
//!   summary.json              written once, marks the run finished
//! ```
//!
//! Every write lands in a temporary sibling first and is renamed into
//! place, so an interrupted run leaves each artifact either at its old or
//! its new content. On load the three output artifacts are cross-checked:
//! iterations must be contiguous from zero and present in every stream
//! that applies, and any violation is reported as corruption rather than
//! repaired.

use crate::model::{
    AnnotationRecord, ClusteringResult, FeatureVectors, GroundTruth, IterationId, IterationTimings,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FILE_MANIFEST: &str = "manifest.json";
pub const FILE_GROUND_TRUTH: &str = "ground_truth.json";
pub const FILE_VECTORS: &str = "vectors.json";
pub const FILE_CLUSTERINGS: &str = "clustering_results.json";
pub const FILE_ANNOTATIONS: &str = "annotations.json";
pub const FILE_TIMINGS: &str = "timings.json";
pub const FILE_SUMMARY: &str = "summary.json";

const STORAGE_FORMAT_VERSION: u32 = 1;
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Serialize, Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

/// Artifact-level failures. All of them are fatal to a run; persisted
/// state is never auto-repaired.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact {file} is not valid JSON: {source}")]
    Corrupt {
        file: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("required artifact {0} not found")]
    MissingArtifact(String),

    #[error("storage format version mismatch: expected {expected}, found {found}")]
    FormatMismatch { expected: u32, found: u32 },

    #[error("iteration {iteration} is incomplete on disk: missing from {missing}")]
    IncompleteIteration {
        iteration: IterationId,
        missing: &'static str,
    },

    #[error("persisted iterations are not contiguous: expected {expected}, found {found}")]
    NonContiguous {
        expected: IterationId,
        found: IterationId,
    },
}

/// Handle on a run directory.
#[derive(Debug)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    /// Open a run directory, creating it and its manifest on first use.
    ///
    /// A manifest written by a different storage format version is
    /// rejected.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            file: root.display().to_string(),
            source,
        })?;
        let store = Self { root };
        store.validate_or_init_manifest()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate_or_init_manifest(&self) -> Result<(), StoreError> {
        if let Some(manifest) = self.read_json::<StorageManifest>(FILE_MANIFEST)? {
            if manifest.format_version != STORAGE_FORMAT_VERSION {
                return Err(StoreError::FormatMismatch {
                    expected: STORAGE_FORMAT_VERSION,
                    found: manifest.format_version,
                });
            }
            return Ok(());
        }

        let manifest = StorageManifest {
            format_version: STORAGE_FORMAT_VERSION,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        self.write_json(FILE_MANIFEST, &manifest)
    }

    pub fn load_ground_truth(&self) -> Result<GroundTruth, StoreError> {
        self.read_json(FILE_GROUND_TRUTH)?
            .ok_or_else(|| StoreError::MissingArtifact(FILE_GROUND_TRUTH.to_string()))
    }

    pub fn save_ground_truth(&self, truth: &GroundTruth) -> Result<(), StoreError> {
        self.write_json(FILE_GROUND_TRUTH, truth)
    }

    /// Feature vectors are optional; samplers and clusterers that need
    /// them fail on their own terms when absent.
    pub fn load_vectors(&self) -> Result<Option<FeatureVectors>, StoreError> {
        self.read_json(FILE_VECTORS)
    }

    pub fn save_vectors(&self, vectors: &FeatureVectors) -> Result<(), StoreError> {
        self.write_json(FILE_VECTORS, vectors)
    }

    pub fn load_state(&self) -> Result<PersistedState, StoreError> {
        let state = PersistedState {
            clusterings: self.read_json(FILE_CLUSTERINGS)?.unwrap_or_default(),
            annotations: self.read_json(FILE_ANNOTATIONS)?.unwrap_or_default(),
            timings: self.read_json(FILE_TIMINGS)?.unwrap_or_default(),
        };
        state.ensure_coherent()?;
        Ok(state)
    }

    /// Rewrite the three output artifacts from the in-memory state.
    ///
    /// Called once per iteration; each file is replaced atomically.
    pub fn save_state(&self, state: &PersistedState) -> Result<(), StoreError> {
        self.write_json(FILE_CLUSTERINGS, &state.clusterings)?;
        self.write_json(FILE_ANNOTATIONS, &state.annotations)?;
        self.write_json(FILE_TIMINGS, &state.timings)?;
        Ok(())
    }

    /// Whether a summary was written, marking the run as finished.
    pub fn summary_exists(&self) -> bool {
        self.root.join(FILE_SUMMARY).exists()
    }

    pub fn save_summary<T: Serialize>(&self, summary: &T) -> Result<(), StoreError> {
        self.write_json(FILE_SUMMARY, summary)
    }

    pub fn load_summary<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        self.read_json(FILE_SUMMARY)
    }

    fn read_json<T: DeserializeOwned>(&self, file: &'static str) -> Result<Option<T>, StoreError> {
        let path = self.root.join(file);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    file: file.to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                file: file.to_string(),
                source,
            })
    }

    fn write_json<T: Serialize>(&self, file: &'static str, value: &T) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            file: file.to_string(),
            source,
        };
        let payload = serde_json::to_string_pretty(value).map_err(|source| StoreError::Corrupt {
            file: file.to_string(),
            source,
        })?;

        let final_path = self.root.join(file);
        let tmp_path = self.root.join(format!("{file}{TMP_SUFFIX}"));
        fs::write(&tmp_path, payload).map_err(io_err)?;
        fs::rename(&tmp_path, &final_path).map_err(io_err)?;
        Ok(())
    }
}

/// In-memory image of the three per-iteration output artifacts.
///
/// Iteration zero carries no annotations: the baseline clustering runs
/// before any pair is sampled. Every later iteration must be present in
/// all three maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    pub clusterings: BTreeMap<IterationId, ClusteringResult>,
    pub annotations: BTreeMap<IterationId, Vec<AnnotationRecord>>,
    pub timings: BTreeMap<IterationId, IterationTimings>,
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.clusterings.is_empty()
    }

    /// The last fully persisted iteration, if any.
    pub fn last_iteration(&self) -> Option<IterationId> {
        self.clusterings.keys().next_back().copied()
    }

    /// Record one completed iteration. Iteration zero passes no records.
    pub fn record_iteration(
        &mut self,
        iteration: IterationId,
        clustering: ClusteringResult,
        annotations: Option<Vec<AnnotationRecord>>,
        timings: IterationTimings,
    ) {
        self.clusterings.insert(iteration, clustering);
        if let Some(records) = annotations {
            self.annotations.insert(iteration, records);
        }
        self.timings.insert(iteration, timings);
    }

    /// Audit records of all iterations in iteration order, for replay.
    pub fn annotations_in_order(
        &self,
    ) -> impl Iterator<Item = (IterationId, &[AnnotationRecord])> {
        self.annotations
            .iter()
            .map(|(iteration, records)| (*iteration, records.as_slice()))
    }

    /// Cross-check the three artifact streams against each other.
    fn ensure_coherent(&self) -> Result<(), StoreError> {
        for (position, &iteration) in self.clusterings.keys().enumerate() {
            let expected = IterationId(position as u32);
            if iteration != expected {
                return Err(StoreError::NonContiguous {
                    expected,
                    found: iteration,
                });
            }
            if !self.timings.contains_key(&iteration) {
                return Err(StoreError::IncompleteIteration {
                    iteration,
                    missing: FILE_TIMINGS,
                });
            }
            if iteration != IterationId::FIRST && !self.annotations.contains_key(&iteration) {
                return Err(StoreError::IncompleteIteration {
                    iteration,
                    missing: FILE_ANNOTATIONS,
                });
            }
        }

        for &iteration in self.annotations.keys() {
            if !self.clusterings.contains_key(&iteration) {
                return Err(StoreError::IncompleteIteration {
                    iteration,
                    missing: FILE_CLUSTERINGS,
                });
            }
        }
        for &iteration in self.timings.keys() {
            if !self.clusterings.contains_key(&iteration) {
                return Err(StoreError::IncompleteIteration {
                    iteration,
                    missing: FILE_CLUSTERINGS,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Annotation, ClusterId, ConstraintKind};
    use tempfile::tempdir;

    fn sample_state() -> PersistedState {
        let mut state = PersistedState::default();
        state.record_iteration(
            IterationId(0),
            ClusteringResult::from([
                ("a".to_string(), ClusterId(0)),
                ("b".to_string(), ClusterId(1)),
            ]),
            None,
            IterationTimings::new(0.0, 0.01),
        );
        state.record_iteration(
            IterationId(1),
            ClusteringResult::from([
                ("a".to_string(), ClusterId(0)),
                ("b".to_string(), ClusterId(0)),
            ]),
            Some(vec![AnnotationRecord {
                point_a: "a".to_string(),
                point_b: "b".to_string(),
                kind: ConstraintKind::MustLink,
                erroneous: false,
                conflict: false,
                applied: true,
            }]),
            IterationTimings::new(0.02, 0.03),
        );
        state
    }

    #[test]
    fn state_round_trip() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let state = sample_state();
        store.save_state(&state).unwrap();
        drop(store);

        let store = RunStore::open(dir.path()).unwrap();
        let loaded = store.load_state().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.last_iteration(), Some(IterationId(1)));

        let replayed: Vec<Annotation> = loaded
            .annotations_in_order()
            .flat_map(|(_, records)| records.iter().filter_map(|r| r.annotation()))
            .collect();
        assert_eq!(
            replayed,
            vec![Annotation::new("a", "b", ConstraintKind::MustLink)]
        );
    }

    #[test]
    fn empty_store_loads_empty_state() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let state = store.load_state().unwrap();
        assert!(state.is_empty());
        assert_eq!(state.last_iteration(), None);
        assert!(!store.summary_exists());
    }

    #[test]
    fn manifest_version_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        RunStore::open(dir.path()).unwrap();
        fs::write(
            dir.path().join(FILE_MANIFEST),
            r#"{"format_version": 99, "app_version": "0.0.0"}"#,
        )
        .unwrap();

        let err = RunStore::open(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            StoreError::FormatMismatch {
                expected: STORAGE_FORMAT_VERSION,
                found: 99,
            }
        ));
    }

    #[test]
    fn missing_timings_for_iteration_is_corruption() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let mut state = sample_state();
        state.timings.remove(&IterationId(1));
        store.save_state(&state).unwrap();

        let err = store.load_state().unwrap_err();
        assert!(matches!(
            err,
            StoreError::IncompleteIteration {
                iteration: IterationId(1),
                missing: FILE_TIMINGS,
            }
        ));
    }

    #[test]
    fn missing_annotations_after_baseline_is_corruption() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let mut state = sample_state();
        state.annotations.remove(&IterationId(1));
        store.save_state(&state).unwrap();

        let err = store.load_state().unwrap_err();
        assert!(matches!(
            err,
            StoreError::IncompleteIteration {
                iteration: IterationId(1),
                missing: FILE_ANNOTATIONS,
            }
        ));
    }

    #[test]
    fn baseline_iteration_needs_no_annotations() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let mut state = PersistedState::default();
        state.record_iteration(
            IterationId(0),
            ClusteringResult::from([("a".to_string(), ClusterId(0))]),
            None,
            IterationTimings::new(0.0, 0.01),
        );
        store.save_state(&state).unwrap();
        assert!(store.load_state().is_ok());
    }

    #[test]
    fn iteration_gap_is_corruption() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let mut state = sample_state();
        let clustering = state.clusterings[&IterationId(1)].clone();
        let timing = state.timings[&IterationId(1)];
        let records = state.annotations[&IterationId(1)].clone();
        state.record_iteration(IterationId(3), clustering, Some(records), timing);
        store.save_state(&state).unwrap();

        let err = store.load_state().unwrap_err();
        assert!(matches!(
            err,
            StoreError::NonContiguous {
                expected: IterationId(2),
                found: IterationId(3),
            }
        ));
    }

    #[test]
    fn writes_leave_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        store.save_state(&sample_state()).unwrap();
        store.save_summary(&serde_json::json!({"finished": true})).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|extension| extension == "tmp")
            })
            .collect();
        assert!(leftovers.is_empty());
        assert!(store.summary_exists());
    }

    #[test]
    fn stale_temp_file_from_a_crash_is_ignored() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        store.save_state(&sample_state()).unwrap();
        // A crash between write and rename leaves a half-written temp
        // file; reloading must read only the committed artifacts.
        fs::write(
            dir.path().join(format!("{FILE_CLUSTERINGS}{TMP_SUFFIX}")),
            "{ half written",
        )
        .unwrap();

        let loaded = store.load_state().unwrap();
        assert_eq!(loaded, sample_state());
    }

    #[test]
    fn ground_truth_round_trip_and_missing() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.load_ground_truth().unwrap_err(),
            StoreError::MissingArtifact(_)
        ));

        let truth = GroundTruth::from([
            ("a".to_string(), "g1".to_string()),
            ("b".to_string(), "g2".to_string()),
        ]);
        store.save_ground_truth(&truth).unwrap();
        assert_eq!(store.load_ground_truth().unwrap(), truth);
        assert!(store.load_vectors().unwrap().is_none());
    }

    #[test]
    fn corrupt_json_is_reported_with_file_name() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        fs::write(dir.path().join(FILE_CLUSTERINGS), "{ not json").unwrap();

        let err = store.load_state().unwrap_err();
        let StoreError::Corrupt { file, .. } = err else {
            panic!("expected corruption error, got {err:?}");
        };
        assert_eq!(file, FILE_CLUSTERINGS);
    }
}
