//! End-to-end runs of the annotation loop on clean ground truth: full
//! convergence, the artifact layout left on disk, the quality budget, and
//! the random fallback behind an empty primary sampler.

use linkwise::persistence::RunStore;
use linkwise::test_support::{clustered_vectors, labeled_truth, ScriptedSampler};
use linkwise::{
    AnnotationSession, IterationId, PairAgreementProbe, RunConfig, RunSummary, TerminationReason,
};
use tempfile::tempdir;

fn config_for(dir: &std::path::Path) -> RunConfig {
    let mut config = RunConfig::default();
    config.dataset.data_dir = dir.to_path_buf();
    config
}

#[test]
fn clean_run_converges_to_ground_truth() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let truth = labeled_truth(3, 4);
    let store = RunStore::open(dir.path())?;
    store.save_ground_truth(&truth)?;
    store.save_vectors(&clustered_vectors(&truth, 0.5, 9))?;

    let mut config = config_for(dir.path());
    config.budget.max_iterations = Some(100);
    let mut session = AnnotationSession::open(config)?;
    let summary = session.run()?;

    assert_eq!(summary.termination, TerminationReason::Converged);
    assert!(summary.complete);
    assert_eq!(summary.classes, 3);
    // Twelve points make 66 pairs, and every sampled pair is determined by
    // the end of its iteration, so batches of ten converge within seven.
    assert!(summary.iterations >= 1);
    assert!(summary.iterations <= 7);

    // A faithful annotator reconstructs the truth partition exactly.
    let clustering = &session.state().clusterings[&IterationId(summary.iterations)];
    let keys: Vec<&String> = truth.keys().collect();
    for (i, a) in keys.iter().enumerate() {
        for b in keys.iter().skip(i + 1) {
            assert_eq!(
                truth[*a] == truth[*b],
                clustering[*a] == clustering[*b],
                "pair ({a}, {b}) disagrees with ground truth"
            );
        }
    }

    // Artifacts on disk: the baseline plus one entry per iteration, no
    // annotations for the baseline, and the stored summary matches.
    let store = RunStore::open(dir.path())?;
    let state = store.load_state()?;
    assert_eq!(state.clusterings.len(), summary.iterations as usize + 1);
    assert_eq!(state.annotations.len(), summary.iterations as usize);
    assert!(!state.annotations.contains_key(&IterationId(0)));
    assert!(store.summary_exists());
    let stored: RunSummary = store.load_summary()?.unwrap();
    assert_eq!(stored, summary);
    Ok(())
}

#[test]
fn quality_floor_stops_at_baseline_when_already_met() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let truth = labeled_truth(3, 4);
    RunStore::open(dir.path())?.save_ground_truth(&truth)?;

    // The all-singletons baseline already splits every cross-group pair:
    // 48 of 66 pairs agree with the truth, clearing a floor of 0.7.
    let mut config = config_for(dir.path());
    config.budget.min_quality = Some(0.7);
    let mut session =
        AnnotationSession::open(config)?.with_quality_probe(Box::new(PairAgreementProbe));
    let summary = session.run()?;

    assert_eq!(summary.termination, TerminationReason::QualityReached);
    assert_eq!(summary.iterations, 0);
    assert_eq!(summary.applied_constraints, 0);
    let quality = summary.quality.unwrap();
    assert!((quality - 48.0 / 66.0).abs() < 1e-9);
    Ok(())
}

#[test]
fn empty_primary_proposal_falls_back_to_random_pairs() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let truth = labeled_truth(2, 3);
    RunStore::open(dir.path())?.save_ground_truth(&truth)?;

    // One scripted batch, then nothing: every later iteration must be fed
    // by the random fallback until the closure is complete.
    let script = [vec![("g0_p00".to_string(), "g0_p01".to_string())]];
    let mut config = config_for(dir.path());
    config.budget.max_iterations = Some(100);
    let mut session =
        AnnotationSession::open(config)?.with_sampler(Box::new(ScriptedSampler::new(script)));
    let summary = session.run()?;

    assert_eq!(summary.termination, TerminationReason::Converged);
    assert!(summary.complete);
    assert_eq!(summary.classes, 2);
    // Six points make 15 pairs; after the single scripted pair the
    // fallback clears the remaining fourteen in batches of ten.
    assert!(summary.iterations >= 2);
    assert!(summary.iterations <= 3);
    // Completing two classes of three takes four merges plus at least one
    // explicit separation.
    assert!(summary.applied_constraints >= 5);

    let annotations = &session.state().annotations;
    assert_eq!(annotations[&IterationId(1)].len(), 1);
    for iteration in 2..=summary.iterations {
        assert!(
            !annotations[&IterationId(iteration)].is_empty(),
            "iteration {iteration} should carry fallback-sampled pairs"
        );
    }
    Ok(())
}
