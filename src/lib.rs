//! # Linkwise
//!
//! An interactive constrained-clustering engine: pairwise must-link and
//! cannot-link constraints with closure semantics, plus the
//! sample-annotate-recluster loop that grows a constraint set against a
//! ground-truth oracle until it is complete or a budget runs out.
//!
//! Runs are fully persisted per iteration and can be resumed; annotation
//! errors can be injected at a controlled rate to study how mistakes
//! propagate through the constraint closure.

pub mod annotator;
pub mod clustering;
pub mod config;
pub mod constraints;
pub mod dsu;
pub mod model;
pub mod persistence;
pub mod sampling;
pub mod session;
pub mod test_support;

// Re-export main types for convenience
pub use annotator::{ConflictPolicy, ErrorModel, ErrorPlacement, SimulatedAnnotator};
pub use clustering::{
    ClosureClustering, ClusteringError, ConstrainedClusterer, PairAgreementProbe, QualityProbe,
};
pub use config::{ConfigError, ConfigOverrides, RunConfig};
pub use constraints::{
    ConstraintError, ConstraintManager, ConstraintUpdate, ManagerKind, PairRelation,
};
pub use model::{
    Annotation, AnnotationRecord, ClusterId, ClusteringResult, ConstraintKind, FeatureVectors,
    GroundTruth, IterationId, IterationTimings, Universe,
};
pub use persistence::{PersistedState, RunStore, StoreError};
pub use sampling::{ConstraintSampler, RandomSampler};
pub use session::{
    AnnotationSession, LoopState, ResumeError, RunSummary, StepOutcome, TerminationReason,
};
