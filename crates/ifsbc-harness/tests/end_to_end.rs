//! Full pipeline on a gamma regression: config file → orchestrator → ranks
//! table → discrepancy scores, twice, with identical results.

mod common;

use std::fs;
use std::sync::Arc;

use ifsbc_harness::{
    BatchOrchestrator, CalibrationConfig, CalibrationReport, DiscrepancyScorer, TieBreak,
};
use ifsbc_types::{
    DiscrepancyResult, FailureKind, Family, LOGLIK_VARIABLE, PriorConfig, SimulationSpec,
};

use common::{LeastSquaresOracle, TruthEchoOracle, init_tracing};

const GAMMA_CONFIG: &str = r#"
n_sims = 200
batch_size = 50
lb = 1e-12
ub = 1e300
root_seed = 42
workers = 4
reference_simulations = 300
"#;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn gamma_spec() -> SimulationSpec {
    SimulationSpec::new(Family::Gamma, 50, 15)
}

fn run_and_score(config: CalibrationConfig) -> (CalibrationReport, Vec<DiscrepancyResult>) {
    let spec = gamma_spec();
    let orchestrator = BatchOrchestrator::new(
        Arc::new(LeastSquaresOracle::new(&spec, 99)),
        spec,
        PriorConfig::default(),
        config,
    );
    let report = orchestrator.run().expect("gamma run");
    let results = orchestrator
        .score(&report)
        .expect("scorer")
        .into_iter()
        .filter_map(Result::ok)
        .collect();
    (report, results)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_gamma_pipeline_is_reproducible() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("gamma.toml");
    fs::write(&path, GAMMA_CONFIG).expect("write config");
    let config = CalibrationConfig::load(&path).expect("load config");
    assert_eq!(config.root_seed, 42);
    assert_eq!(config.lb, 1e-12);

    let (first_report, first) = run_and_score(config.clone());
    let (second_report, second) = run_and_score(config);

    let variables = gamma_spec().rank_variables().len();
    assert_eq!(first_report.n_sims, 200);
    assert_eq!(first_report.completed, 200);
    assert_eq!(first_report.ranks.len(), 200 * variables, "case=rows {}", first_report.triage_line());
    assert_eq!(
        first_report.ranks.digest().expect("digest"),
        second_report.ranks.digest().expect("digest")
    );
    assert!(!first.is_empty(), "case=some_variables_scored");
    assert_eq!(first, second, "case=discrepancy_reproducible");

    for result in &first {
        assert!(result.log_score <= 0.0, "case=log_score_range {result:?}");
        assert!(result.reference_log_gamma.is_some());
        assert_eq!(result.num_valid_ranks + result.num_excluded, 200);
    }
}

#[test]
fn test_truth_echo_stub_scores_reproducibly() {
    let config = CalibrationConfig::from_toml_str(GAMMA_CONFIG).expect("config");
    let spec = gamma_spec();
    let run = || {
        let oracle = TruthEchoOracle::new(
            &spec,
            &PriorConfig::default(),
            config.root_seed,
            config.n_sims as u32,
            99,
        );
        let orchestrator = BatchOrchestrator::new(
            Arc::new(oracle),
            spec.clone(),
            PriorConfig::default(),
            config.clone(),
        );
        let report = orchestrator.run().expect("stub run");
        let results: Vec<DiscrepancyResult> = orchestrator
            .score(&report)
            .expect("scorer")
            .into_iter()
            .collect::<Result<_, _>>()
            .expect("every variable scored");
        (report, results)
    };

    let (first_report, first) = run();
    let (second_report, second) = run();
    assert_eq!(first_report.ranked_count() + first_report.failed_count(), 200);
    assert!(
        !first_report.failures.by_kind.contains_key(&FailureKind::Malformed),
        "case=every_truth_found {}",
        first_report.triage_line()
    );
    assert_eq!(
        first_report.ranks.digest().expect("digest"),
        second_report.ranks.digest().expect("digest")
    );
    assert_eq!(first.len(), spec.rank_variables().len());
    assert_eq!(first, second, "case=stub_discrepancy_reproducible");
}

#[test]
fn test_point_mass_oracle_is_flagged_miscalibrated() {
    // Draws concentrated on a least-squares estimate are far too narrow, so
    // at least one coefficient must fall outside the band.
    let mut config = CalibrationConfig::from_toml_str(GAMMA_CONFIG).expect("config");
    config.n_sims = 120;
    config.batch_size = None;
    let (_, results) = run_and_score(config);
    assert!(
        results.iter().any(|r| r.calibrated == Some(false)),
        "case=narrow_posterior_flagged {results:?}"
    );
}

#[test]
fn test_tracked_variables_limit_ranked_columns() {
    let mut config = CalibrationConfig::new(30);
    config.root_seed = 42;
    config.tracked_variables = Some(vec![LOGLIK_VARIABLE.to_owned(), "b_x3".to_owned()]);
    config.tie_break = TieBreak::Strict;
    let (report, _) = run_and_score(config);
    assert_eq!(
        report.ranks.variables(),
        vec!["b_x3".to_owned(), LOGLIK_VARIABLE.to_owned()]
    );
    assert_eq!(report.ranks.len(), 60);
}

#[test]
fn test_loglik_only_tracking_ranks_every_replication() {
    let mut config = CalibrationConfig::new(25);
    config.root_seed = 42;
    config.tracked_variables = Some(vec![LOGLIK_VARIABLE.to_owned()]);
    let (report, results) = run_and_score(config);
    assert_eq!(report.ranked_count(), 25, "case=all_ranked {}", report.triage_line());
    assert_eq!(report.ranks.variables(), vec![LOGLIK_VARIABLE.to_owned()]);
    assert_eq!(report.ranks.len(), 25);
    assert!(report.ranks.rows().iter().all(|r| !r.is_na() && r.num_draws == 99));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].variable, LOGLIK_VARIABLE);
}

#[test]
fn test_ecdf_band_brackets_zero_at_grid_ends() {
    let (report, _) = run_and_score({
        let mut config = CalibrationConfig::new(40);
        config.root_seed = 42;
        config
    });
    let scorer = DiscrepancyScorer::new(0.05, 200, 42).expect("scorer");
    let band = scorer.ecdf_band(&report.ranks, "b_x1").expect("band");
    assert_eq!(band.points.len(), band.grid_levels as usize + 1);
    let first = band.points.first().expect("first point");
    let last = band.points.last().expect("last point");
    assert_eq!(first.ecdf_diff, 0.0);
    assert!(last.ecdf_diff.abs() < 1e-12);
    for point in &band.points {
        assert!(point.lower <= point.upper, "case=band_ordered {point:?}");
    }
}

#[test]
fn test_report_serializes_to_json() {
    let mut config = CalibrationConfig::new(8);
    config.root_seed = 42;
    let (report, _) = run_and_score(config);
    let json = report.to_json().expect("json");
    let decoded: CalibrationReport = serde_json::from_str(&json).expect("decode");
    assert_eq!(decoded.ranks, report.ranks);
    assert_eq!(decoded.failures, report.failures);
}
