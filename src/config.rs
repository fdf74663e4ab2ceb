//! # Run Configuration
//!
//! Configuration for annotation runs, loaded with precedence:
//! CLI overrides > Env vars > Config file > Defaults. Unknown keys in any
//! layer are rejected rather than silently dropped.
//!
//! # Example config file (linkwise.toml)
//! ```toml
//! manager = "binary"
//!
//! [dataset]
//! data_dir = "runs/demo"
//! num_clusters = 4
//!
//! [sampling]
//! strategy = "random"
//! batch_size = 10
//! seed = 42
//!
//! [annotation]
//! conflict_policy = "flip"
//! error_rate = 0.1
//! error_placement = "deferred"
//!
//! [budget]
//! max_iterations = 50
//! max_constraint_rate = 1.5
//! ```

use crate::annotator::{ConflictPolicy, ErrorPlacement};
use crate::constraints::ManagerKind;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default artifact directory for a run.
pub const DEFAULT_DATA_DIR: &str = "linkwise_run";

/// Default number of candidate pairs put before the annotator per iteration.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default seed for the sampling RNG.
pub const DEFAULT_SAMPLER_SEED: u64 = 42;

/// Default seed for the annotation error RNG, kept distinct from the
/// sampler seed so the two streams never correlate.
pub const DEFAULT_ERROR_SEED: u64 = 97;

/// Main configuration for an annotation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Constraint manager implementation
    pub manager: ManagerKind,
    /// Dataset location and shape
    pub dataset: DatasetConfig,
    /// Candidate pair sampling
    pub sampling: SamplingConfig,
    /// Simulated annotator behavior
    pub annotation: AnnotationConfig,
    /// Clustering backend
    pub clustering: ClusteringConfig,
    /// Stopping budgets
    pub budget: BudgetConfig,
}

impl RunConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(config_path: Option<&str>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(RunConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Double underscore separates sections from keys so that keys with
        // underscores survive: LINKWISE_BUDGET__MAX_ITERATIONS.
        figment = figment.merge(Env::prefixed("LINKWISE_").split("__"));

        figment = figment.merge(Serialized::defaults(overrides));

        let config: RunConfig = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    /// Reject value combinations the loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling.batch_size == 0 {
            return Err(ConfigError::invalid("sampling.batch_size must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.annotation.error_rate) {
            return Err(ConfigError::invalid(
                "annotation.error_rate must lie in [0, 1]",
            ));
        }
        if self.dataset.num_clusters == Some(0) {
            return Err(ConfigError::invalid("dataset.num_clusters must be at least 1"));
        }
        if self.budget.max_constraints == Some(0) {
            return Err(ConfigError::invalid(
                "budget.max_constraints must be at least 1",
            ));
        }
        if let Some(rate) = self.budget.max_constraint_rate {
            if rate <= 0.0 {
                return Err(ConfigError::invalid(
                    "budget.max_constraint_rate must be positive",
                ));
            }
        }
        if let Some(quality) = self.budget.min_quality {
            if !(0.0..=1.0).contains(&quality) {
                return Err(ConfigError::invalid(
                    "budget.min_quality must lie in [0, 1]",
                ));
            }
        }
        Ok(())
    }
}

/// Where the run reads its dataset and writes its artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetConfig {
    /// Artifact directory holding inputs and per-iteration outputs
    pub data_dir: PathBuf,
    /// Target cluster count passed to the clusterer, if any
    pub num_clusters: Option<usize>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            num_clusters: None,
        }
    }
}

/// Closed set of built-in sampling strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    #[default]
    Random,
}

/// Candidate pair sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingConfig {
    /// Strategy for picking undetermined pairs
    pub strategy: SamplerKind,
    /// Pairs per iteration put before the annotator
    pub batch_size: usize,
    /// Seed for the sampling RNG
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            strategy: SamplerKind::Random,
            batch_size: DEFAULT_BATCH_SIZE,
            seed: DEFAULT_SAMPLER_SEED,
        }
    }
}

/// Simulated annotator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnnotationConfig {
    /// Resolution for submissions the manager rejects
    pub conflict_policy: ConflictPolicy,
    /// Fraction of each batch answered wrongly
    pub error_rate: f64,
    /// Position of corrupted pairs in the submission order
    pub error_placement: ErrorPlacement,
    /// Seed for the error-selection RNG
    pub error_seed: u64,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::Skip,
            error_rate: 0.0,
            error_placement: ErrorPlacement::AsSampled,
            error_seed: DEFAULT_ERROR_SEED,
        }
    }
}

/// Closed set of built-in clustering backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClustererKind {
    #[default]
    Closure,
}

/// Clustering backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusteringConfig {
    /// Algorithm producing the per-iteration clustering
    pub algorithm: ClustererKind,
}

/// Stopping budgets for the annotation loop.
///
/// Every limit is independently optional and simply absent when unset;
/// with none set the loop runs until the constraints are complete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetConfig {
    /// Iteration ceiling after the baseline pass; unbounded when unset
    pub max_iterations: Option<u32>,
    /// Absolute cap on applied constraints
    pub max_constraints: Option<usize>,
    /// Cap on applied constraints as a multiple of the dataset size
    pub max_constraint_rate: Option<f64>,
    /// Quality floor; the run stops once a probe scores at or above it
    pub min_quality: Option<f64>,
}

impl BudgetConfig {
    /// Effective cap on applied constraints for a dataset of `points`
    /// points, combining the absolute and rate-based limits.
    pub fn constraint_cap(&self, points: usize) -> Option<usize> {
        let from_rate = self
            .max_constraint_rate
            .map(|rate| (rate * points as f64).floor() as usize);
        match (self.max_constraints, from_rate) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (cap, None) => cap,
            (None, cap) => cap,
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manager: Option<ManagerKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation: Option<AnnotationOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_clusters: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<SamplerKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_policy: Option<ConflictPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_placement: Option<ErrorPlacement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_constraints: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_constraint_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_quality: Option<f64>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
