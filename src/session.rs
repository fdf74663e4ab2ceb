//! # Annotation Session
//!
//! The interactive loop that drives a run: sample undetermined pairs,
//! annotate them against ground truth, recluster under the grown
//! constraint set, persist, and repeat until the constraints are complete
//! or a budget runs out. Iteration zero is special: it clusters and
//! persists the unconstrained baseline before any pair is sampled. A
//! primary sampler that comes back empty-handed is answered by a uniform
//! random fallback over the remaining undetermined pairs, so the loop
//! always moves toward completeness.
//!
//! Opening a session against a non-empty run directory replays the
//! persisted annotation history into a fresh manager and continues from
//! the next iteration. Replay is strict: a persisted constraint the
//! manager rejects means the artifacts are corrupt, and the session
//! refuses to start.

use crate::annotator::{ErrorModel, SimulatedAnnotator};
use crate::clustering::{
    validate_assignment, ClosureClustering, ClusteringContext, ConstrainedClusterer, QualityProbe,
};
use crate::config::{ClustererKind, RunConfig, SamplerKind};
use crate::constraints::{ConstraintError, ConstraintManager};
use crate::model::{FeatureVectors, GroundTruth, IterationId, IterationTimings, Universe};
use crate::persistence::{PersistedState, RunStore};
use crate::sampling::{ConstraintSampler, RandomSampler, SamplingContext};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Restore failures when continuing a run from disk.
#[derive(Debug, Error)]
pub enum ResumeError {
    /// The manager rejected a constraint that was accepted in a previous
    /// run. The artifacts no longer describe a consistent history.
    #[error("replaying iteration {iteration}: persisted constraint rejected: {source}")]
    Replay {
        iteration: IterationId,
        #[source]
        source: ConstraintError,
    },
}

/// Phases of the annotation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Sampling,
    Annotating,
    Clustering,
    Persisting,
    Converged,
    BudgetExhausted,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Initializing => "initializing",
            LoopState::Sampling => "sampling",
            LoopState::Annotating => "annotating",
            LoopState::Clustering => "clustering",
            LoopState::Persisting => "persisting",
            LoopState::Converged => "converged",
            LoopState::BudgetExhausted => "budget_exhausted",
        };
        f.write_str(name)
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Every pair of points carries a determined relation.
    Converged,
    /// The iteration ceiling was reached.
    IterationBudget,
    /// The cap on applied constraints was reached.
    ConstraintBudget,
    /// A quality probe scored at or above the configured floor.
    QualityReached,
}

impl TerminationReason {
    fn terminal_state(self) -> LoopState {
        match self {
            TerminationReason::Converged => LoopState::Converged,
            _ => LoopState::BudgetExhausted,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TerminationReason::Converged => "converged",
            TerminationReason::IterationBudget => "iteration_budget",
            TerminationReason::ConstraintBudget => "constraint_budget",
            TerminationReason::QualityReached => "quality_reached",
        };
        f.write_str(name)
    }
}

/// Result of driving the session one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// One iteration completed and was persisted.
    Ran(IterationId),
    /// Nothing remains to run.
    Finished(TerminationReason),
}

/// Final report of a run, persisted as `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub termination: TerminationReason,
    /// Last completed iteration.
    pub iterations: u32,
    pub applied_constraints: usize,
    pub classes: usize,
    pub complete: bool,
    pub quality: Option<f64>,
    pub sampler: String,
    pub clusterer: String,
    pub total_seconds: f64,
}

/// One annotation run: collaborators, constraint state, and artifacts.
pub struct AnnotationSession {
    config: RunConfig,
    store: RunStore,
    truth: GroundTruth,
    vectors: FeatureVectors,
    manager: ConstraintManager,
    annotator: SimulatedAnnotator,
    sampler: Box<dyn ConstraintSampler>,
    fallback: RandomSampler,
    clusterer: Box<dyn ConstrainedClusterer>,
    probe: Option<Box<dyn QualityProbe>>,
    state: PersistedState,
    next_iteration: IterationId,
    loop_state: LoopState,
    finished: Option<TerminationReason>,
    last_quality: Option<f64>,
}

impl fmt::Debug for AnnotationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnnotationSession")
            .field("config", &self.config)
            .field("sampler", &self.sampler.name())
            .field("clusterer", &self.clusterer.name())
            .field("next_iteration", &self.next_iteration)
            .field("loop_state", &self.loop_state)
            .field("finished", &self.finished)
            .field("last_quality", &self.last_quality)
            .finish_non_exhaustive()
    }
}

impl AnnotationSession {
    /// Open (or resume) the run described by `config`.
    pub fn open(config: RunConfig) -> Result<Self> {
        config.validate().context("invalid run configuration")?;
        let store = RunStore::open(&config.dataset.data_dir).with_context(|| {
            format!("opening run directory {}", config.dataset.data_dir.display())
        })?;

        let truth = store
            .load_ground_truth()
            .context("loading ground truth")?;
        let vectors = store
            .load_vectors()
            .context("loading feature vectors")?
            .unwrap_or_default();
        let universe = Universe::new(truth.keys().cloned());
        let mut manager = config.manager.build(universe);

        let annotator = SimulatedAnnotator::new(
            truth.clone(),
            config.annotation.conflict_policy,
            ErrorModel::new(
                config.annotation.error_rate,
                config.annotation.error_placement,
                config.annotation.error_seed,
            ),
        );
        let sampler: Box<dyn ConstraintSampler> = match config.sampling.strategy {
            SamplerKind::Random => Box::new(RandomSampler::new(config.sampling.seed)),
        };
        let fallback = RandomSampler::new(config.sampling.seed);
        let clusterer: Box<dyn ConstrainedClusterer> = match config.clustering.algorithm {
            ClustererKind::Closure => Box::new(ClosureClustering::new()),
        };

        let state = store.load_state().context("restoring persisted state")?;
        replay_into(&mut manager, &state).context("replaying annotation history")?;
        let next_iteration = state
            .last_iteration()
            .map(IterationId::next)
            .unwrap_or(IterationId::FIRST);

        if !state.is_empty() {
            info!(
                resumed_at = %next_iteration,
                constraints = manager.constraint_count(),
                "resumed run from persisted artifacts"
            );
        }

        Ok(Self {
            config,
            store,
            truth,
            vectors,
            manager,
            annotator,
            sampler,
            fallback,
            clusterer,
            probe: None,
            state,
            next_iteration,
            loop_state: LoopState::Initializing,
            finished: None,
            last_quality: None,
        })
    }

    /// Replace the primary sampler, e.g. with an externally driven
    /// strategy. The random fallback stays in place behind it.
    pub fn with_sampler(mut self, sampler: Box<dyn ConstraintSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Replace the clustering backend.
    pub fn with_clusterer(mut self, clusterer: Box<dyn ConstrainedClusterer>) -> Self {
        self.clusterer = clusterer;
        self
    }

    /// Attach a quality probe; required for the `min_quality` budget to
    /// have any effect.
    pub fn with_quality_probe(mut self, probe: Box<dyn QualityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn manager(&self) -> &ConstraintManager {
        &self.manager
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn loop_state(&self) -> LoopState {
        self.loop_state
    }

    pub fn next_iteration(&self) -> IterationId {
        self.next_iteration
    }

    pub fn last_quality(&self) -> Option<f64> {
        self.last_quality
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Drive the loop to its end and persist the summary.
    ///
    /// A run whose summary already exists is not re-run; the stored
    /// summary is returned as-is.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.store.summary_exists() {
            let summary: RunSummary = self
                .store
                .load_summary()
                .context("loading existing summary")?
                .ok_or_else(|| anyhow!("summary marker vanished during load"))?;
            info!(termination = %summary.termination, "run already finished; skipping");
            return Ok(summary);
        }

        if self.config.budget.min_quality.is_some() && self.probe.is_none() {
            warn!("budget.min_quality is set but no quality probe is attached; the floor is inert");
        }

        let started = Instant::now();
        loop {
            match self.step()? {
                StepOutcome::Ran(_) => continue,
                StepOutcome::Finished(reason) => {
                    let summary = self.build_summary(reason, started.elapsed().as_secs_f64());
                    self.store
                        .save_summary(&summary)
                        .context("persisting run summary")?;
                    info!(
                        termination = %reason,
                        iterations = summary.iterations,
                        constraints = summary.applied_constraints,
                        classes = summary.classes,
                        "run finished"
                    );
                    return Ok(summary);
                }
            }
        }
    }

    /// Run a single iteration, or report that the loop is over.
    ///
    /// Iteration zero clusters and persists the unconstrained baseline.
    /// Later iterations sample, annotate, recluster, and persist. An empty
    /// proposal from the primary sampler is answered by the random
    /// fallback, so every iteration puts at least one undetermined pair
    /// before the annotator. Stop conditions are evaluated after
    /// persisting, so a finished session keeps answering
    /// [`StepOutcome::Finished`] without side effects.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if let Some(reason) = self.finished {
            return Ok(StepOutcome::Finished(reason));
        }

        let iteration = self.next_iteration;
        if iteration != IterationId::FIRST && self.manager.is_complete() {
            // A resumed history can already be complete; nothing is left
            // to sample.
            self.finish(TerminationReason::Converged);
            return Ok(StepOutcome::Finished(TerminationReason::Converged));
        }
        if let Some(max) = self.config.budget.max_iterations {
            if iteration != IterationId::FIRST && iteration.0 > max {
                self.finish(TerminationReason::IterationBudget);
                return Ok(StepOutcome::Finished(TerminationReason::IterationBudget));
            }
        }

        let (batch, sampling_seconds) = if iteration == IterationId::FIRST {
            (None, 0.0)
        } else {
            self.enter(LoopState::Sampling);
            let ctx = SamplingContext {
                manager: &self.manager,
                vectors: &self.vectors,
                previous_clustering: self.state.clusterings.values().next_back(),
                iteration,
                batch_size: self.config.sampling.batch_size,
            };
            let sampling_started = Instant::now();
            let mut batch = self
                .sampler
                .sample(&ctx)
                .with_context(|| format!("sampling iteration {iteration}"))?;
            if batch.is_empty() {
                info!(
                    iteration = %iteration,
                    sampler = self.sampler.name(),
                    "primary sampler returned no candidates; falling back to random pairs"
                );
                batch = self
                    .fallback
                    .sample(&ctx)
                    .with_context(|| format!("fallback sampling iteration {iteration}"))?;
            }
            let sampling_seconds = sampling_started.elapsed().as_secs_f64();
            (Some(batch), sampling_seconds)
        };

        let records = match batch {
            None => None,
            Some(batch) => {
                self.enter(LoopState::Annotating);
                let batch_len = batch.len();
                let records = self
                    .annotator
                    .annotate_batch(&mut self.manager, batch)
                    .with_context(|| format!("annotating iteration {iteration}"))?;
                let conflicts = records.iter().filter(|r| r.conflict).count();
                let applied = records.iter().filter(|r| r.applied).count();
                debug!(
                    iteration = %iteration,
                    batch = batch_len,
                    applied,
                    conflicts,
                    "batch annotated"
                );
                Some(records)
            }
        };

        self.enter(LoopState::Clustering);
        let ctx = ClusteringContext {
            manager: &self.manager,
            vectors: &self.vectors,
            num_clusters: self.config.dataset.num_clusters,
            iteration,
        };
        let clustering_started = Instant::now();
        let clustering = self
            .clusterer
            .cluster(&ctx)
            .with_context(|| format!("clustering iteration {iteration}"))?;
        let clustering_seconds = clustering_started.elapsed().as_secs_f64();
        validate_assignment(self.manager.universe(), &clustering)
            .with_context(|| format!("validating clustering of iteration {iteration}"))?;

        self.enter(LoopState::Persisting);
        let timings = IterationTimings::new(sampling_seconds, clustering_seconds);
        self.state
            .record_iteration(iteration, clustering, records, timings);
        self.store
            .save_state(&self.state)
            .with_context(|| format!("persisting iteration {iteration}"))?;

        let stats = self.manager.stats();
        info!(
            iteration = %iteration,
            classes = stats.classes,
            constraints = self.manager.constraint_count(),
            complete = stats.complete,
            "iteration persisted"
        );

        self.next_iteration = iteration.next();
        self.post_iteration_checks()?;
        Ok(StepOutcome::Ran(iteration))
    }

    /// Stop conditions, evaluated once per persisted iteration.
    /// Completeness wins over budgets when both hold.
    fn post_iteration_checks(&mut self) -> Result<()> {
        if self.manager.is_complete() {
            self.finish(TerminationReason::Converged);
            return Ok(());
        }

        let mut quality_reached = false;
        if let Some(probe) = self.probe.as_mut() {
            if let Some(latest) = self.state.clusterings.values().next_back() {
                let score = probe
                    .score(latest, &self.truth)
                    .context("quality probe failed")?;
                debug!(score, probe = probe.name(), "quality probe");
                self.last_quality = Some(score);
                if let Some(floor) = self.config.budget.min_quality {
                    quality_reached = score >= floor;
                }
            }
        }
        if quality_reached {
            self.finish(TerminationReason::QualityReached);
            return Ok(());
        }

        if let Some(cap) = self.config.budget.constraint_cap(self.truth.len()) {
            if self.manager.constraint_count() >= cap {
                self.finish(TerminationReason::ConstraintBudget);
            }
        }
        Ok(())
    }

    fn finish(&mut self, reason: TerminationReason) {
        self.enter(reason.terminal_state());
        self.finished = Some(reason);
        info!(reason = %reason, "loop stopped");
    }

    fn enter(&mut self, state: LoopState) {
        if self.loop_state != state {
            debug!(from = %self.loop_state, to = %state, "state transition");
            self.loop_state = state;
        }
    }

    fn build_summary(&self, termination: TerminationReason, total_seconds: f64) -> RunSummary {
        let stats = self.manager.stats();
        RunSummary {
            termination,
            iterations: self.state.last_iteration().map(|i| i.0).unwrap_or(0),
            applied_constraints: self.manager.constraint_count(),
            classes: stats.classes,
            complete: stats.complete,
            quality: self.last_quality,
            sampler: self.sampler.name().to_string(),
            clusterer: self.clusterer.name().to_string(),
            total_seconds,
        }
    }
}

/// Rebuild the constraint closure from persisted audit records.
///
/// Only effective annotations are replayed; skipped conflicts carry no
/// constraint. Any rejection is corruption, reported as-is.
fn replay_into(manager: &mut ConstraintManager, state: &PersistedState) -> Result<(), ResumeError> {
    for (iteration, records) in state.annotations_in_order() {
        for record in records {
            let Some(annotation) = record.annotation() else {
                continue;
            };
            manager
                .add_constraint(&annotation.point_a, &annotation.point_b, annotation.kind)
                .map_err(|source| ResumeError::Replay { iteration, source })?;
        }
    }
    Ok(())
}
