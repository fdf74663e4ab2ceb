use anyhow::{anyhow, Context};
use linkwise::config::{
    AnnotationOverrides, BudgetOverrides, ConfigOverrides, DatasetOverrides, RunConfig,
    SamplingOverrides,
};
use linkwise::persistence::{RunStore, FILE_GROUND_TRUTH};
use linkwise::{
    AnnotationSession, ConflictPolicy, ErrorPlacement, FeatureVectors, GroundTruth,
    PairAgreementProbe,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_usage() {
    println!("linkwise_run - drive an interactive constrained-clustering run");
    println!();
    println!("Options:");
    println!("  --config PATH           TOML config file (default: linkwise.toml if present)");
    println!("  --data-dir DIR          run directory with inputs and artifacts");
    println!("  --batch-size N          candidate pairs per iteration");
    println!("  --max-iterations N      iteration ceiling after the baseline pass (default: unbounded)");
    println!("  --error-rate F          fraction of each batch answered wrongly");
    println!("  --error-placement MODE  as_sampled | deferred");
    println!("  --conflict-policy MODE  skip | flip");
    println!("  --seed N                sampling seed");
    println!("  --seed-demo GxP         write a demo dataset (G groups, P points each)");
    println!("  --log-file PATH         append logs to a file instead of stderr");
    println!();
    println!("Environment variables with the LINKWISE_ prefix override the config");
    println!("file, e.g. LINKWISE_BUDGET__MAX_ITERATIONS=5.");
}

fn init_logging(log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

fn parse_conflict_policy(value: &str) -> anyhow::Result<ConflictPolicy> {
    match value {
        "skip" => Ok(ConflictPolicy::Skip),
        "flip" => Ok(ConflictPolicy::Flip),
        other => Err(anyhow!("unknown conflict policy {other:?} (skip | flip)")),
    }
}

fn parse_error_placement(value: &str) -> anyhow::Result<ErrorPlacement> {
    match value {
        "as_sampled" => Ok(ErrorPlacement::AsSampled),
        "deferred" => Ok(ErrorPlacement::Deferred),
        other => Err(anyhow!(
            "unknown error placement {other:?} (as_sampled | deferred)"
        )),
    }
}

fn collect_overrides() -> anyhow::Result<ConfigOverrides> {
    let mut overrides = ConfigOverrides::default();

    if let Some(dir) = parse_arg("--data-dir") {
        overrides
            .dataset
            .get_or_insert_with(DatasetOverrides::default)
            .data_dir = Some(dir.into());
    }
    if let Some(raw) = parse_arg("--batch-size") {
        overrides
            .sampling
            .get_or_insert_with(SamplingOverrides::default)
            .batch_size = Some(raw.parse().context("parsing --batch-size")?);
    }
    if let Some(raw) = parse_arg("--seed") {
        overrides
            .sampling
            .get_or_insert_with(SamplingOverrides::default)
            .seed = Some(raw.parse().context("parsing --seed")?);
    }
    if let Some(raw) = parse_arg("--max-iterations") {
        overrides
            .budget
            .get_or_insert_with(BudgetOverrides::default)
            .max_iterations = Some(raw.parse().context("parsing --max-iterations")?);
    }
    if let Some(raw) = parse_arg("--error-rate") {
        overrides
            .annotation
            .get_or_insert_with(AnnotationOverrides::default)
            .error_rate = Some(raw.parse().context("parsing --error-rate")?);
    }
    if let Some(raw) = parse_arg("--error-placement") {
        overrides
            .annotation
            .get_or_insert_with(AnnotationOverrides::default)
            .error_placement = Some(parse_error_placement(&raw)?);
    }
    if let Some(raw) = parse_arg("--conflict-policy") {
        overrides
            .annotation
            .get_or_insert_with(AnnotationOverrides::default)
            .conflict_policy = Some(parse_conflict_policy(&raw)?);
    }
    Ok(overrides)
}

/// Write a synthetic dataset into the run directory: `groups` labeled
/// groups of `per_group` points each, with 2-D vectors scattered around
/// one center per group.
fn seed_demo(store: &RunStore, shape: &str) -> anyhow::Result<()> {
    let (groups, per_group) = shape
        .split_once('x')
        .ok_or_else(|| anyhow!("expected GROUPSxPOINTS, e.g. 4x25, got {shape:?}"))?;
    let groups: usize = groups.parse().context("parsing demo group count")?;
    let per_group: usize = per_group.parse().context("parsing demo group size")?;
    if groups == 0 || per_group == 0 {
        return Err(anyhow!("demo dataset needs at least one group and one point"));
    }

    let mut truth = GroundTruth::new();
    let mut vectors = FeatureVectors::new();
    let mut rng = StdRng::seed_from_u64(7);
    for group in 0..groups {
        let center = (group as f64) * 10.0;
        for point in 0..per_group {
            let key = format!("g{group}_p{point:03}");
            truth.insert(key.clone(), format!("g{group}"));
            vectors.insert(
                key,
                vec![
                    center + rng.random_range(-1.0..=1.0),
                    -center + rng.random_range(-1.0..=1.0),
                ],
            );
        }
    }

    store.save_ground_truth(&truth)?;
    store.save_vectors(&vectors)?;
    println!(
        "Seeded demo dataset: {} points in {} groups under {}",
        truth.len(),
        groups,
        store.root().display()
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    if has_flag("--help") || has_flag("-h") {
        print_usage();
        return Ok(());
    }

    init_logging(parse_arg("--log-file").as_deref())?;

    let config_path = parse_arg("--config").or_else(|| {
        std::path::Path::new("linkwise.toml")
            .exists()
            .then(|| "linkwise.toml".to_string())
    });
    let config = RunConfig::load(config_path.as_deref(), collect_overrides()?)?;

    if let Some(shape) = parse_arg("--seed-demo") {
        let store = RunStore::open(&config.dataset.data_dir)?;
        if store.root().join(FILE_GROUND_TRUTH).exists() {
            return Err(anyhow!(
                "refusing to overwrite existing dataset in {}",
                store.root().display()
            ));
        }
        seed_demo(&store, &shape)?;
    }

    let mut session = AnnotationSession::open(config.clone())?;
    if config.budget.min_quality.is_some() {
        session = session.with_quality_probe(Box::new(PairAgreementProbe));
    }

    let summary = session.run()?;
    println!("Run finished: {}", summary.termination);
    println!("  iterations: {}", summary.iterations);
    println!(
        "  constraints applied: {} ({} classes, complete: {})",
        summary.applied_constraints, summary.classes, summary.complete
    );
    if let Some(quality) = summary.quality {
        println!("  quality: {quality:.4}");
    }
    println!(
        "  sampler: {} / clusterer: {}",
        summary.sampler, summary.clusterer
    );
    println!("  elapsed: {:.2}s", summary.total_seconds);
    Ok(())
}
