//! End-to-end recovery of a known treatment effect on simulated data.
//!
//! Covers:
//! - matching (ATT, bias-adjusted) within a few standard errors of the true effect
//! - IPW-weighted outcome regression with the true and the boosted propensity scores
//! - Breusch-Pagan detects log-linear heteroskedasticity in x1 and not in x2
//! - boosted ATT weights reduce covariate imbalance

use ps_core::{Estimand, SampleKind};
use ps_inference::{
    BiasAdjust, BpVariant, GbmConfig, GbmPropensity, MatchConfig, SimulationConfig, SmdConfig,
    StopMethod, WeightedVariance, breusch_pagan_table, generate_dataset, ipw_weights,
    match_estimate, mean_abs_smd, ols_fit, standardized_differences, weighted_outcome_regression,
};
use ps_translate::{AnalysisFrame, Column};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn frame(cfg: &SimulationConfig) -> (AnalysisFrame, Vec<f64>) {
    let table = generate_dataset(cfg).unwrap();
    let ps_true = match table.column("ps_true").unwrap() {
        Column::Numeric(v) => v.iter().map(|c| c.unwrap()).collect(),
        _ => panic!("ps_true must be numeric"),
    };
    (AnalysisFrame::from_table(&table, &cfg.schema()).unwrap(), ps_true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn matching_recovers_att() {
    let cfg = SimulationConfig { n: 800, effect: 2.0, ..SimulationConfig::default() };
    let (f, _) = frame(&cfg);
    let (x, _) = f.design();
    let mc = MatchConfig {
        m: 4,
        bias_adjust: BiasAdjust::Covariates,
        estimands: vec![Estimand::Att],
        ..MatchConfig::default()
    };
    let r = match_estimate(f.outcome().unwrap(), &f.treatment, &x, &mc).unwrap();
    let row = r.row(Estimand::Att, SampleKind::Sample).unwrap();
    assert!(
        (row.estimate.estimate - 2.0).abs() < 4.0 * row.estimate.std_error + 0.1,
        "att={} se={}",
        row.estimate.estimate,
        row.estimate.std_error
    );
    assert!(row.estimate.p_value < 1e-6);
    let pop = r.row(Estimand::Att, SampleKind::Population).unwrap();
    assert!(pop.estimate.std_error >= row.estimate.std_error);
}

#[test]
fn weighted_regression_with_true_scores() {
    let cfg = SimulationConfig { n: 800, n_clusters: 40, ..SimulationConfig::default() };
    let (f, ps) = frame(&cfg);
    let (x, names) = f.design();
    let y = f.outcome().unwrap();
    for est in [Estimand::Ate, Estimand::Att] {
        let w = ipw_weights(&ps, &f.treatment, est).unwrap();
        let r = weighted_outcome_regression(y, &f.treatment, &x, &names, &w, WeightedVariance::Robust)
            .unwrap();
        assert!(
            (r.treatment.estimate - 2.0).abs() < 0.4,
            "{est}: effect={}",
            r.treatment.estimate
        );
        let clusters = f.cluster.as_ref().unwrap();
        let rc = weighted_outcome_regression(
            y,
            &f.treatment,
            &x,
            &names,
            &w,
            WeightedVariance::Cluster(clusters),
        )
        .unwrap();
        assert_eq!(rc.coefficients.n_clusters, Some(40));
        assert!((rc.treatment.estimate - r.treatment.estimate).abs() < 1e-10);
    }
}

#[test]
fn breusch_pagan_flags_heteroskedastic_covariate() {
    let cfg = SimulationConfig { heteroskedasticity: 1.0, ..SimulationConfig::default() };
    let (f, _) = frame(&cfg);
    let (x, names) = f.design();
    let rows: Vec<Vec<f64>> = f
        .treatment
        .iter()
        .zip(&x)
        .map(|(&t, r)| std::iter::once(t as f64).chain(r.iter().copied()).collect())
        .collect();
    let all: Vec<String> =
        std::iter::once("treatment".to_string()).chain(names.iter().cloned()).collect();
    let fit = ols_fit(&rows, f.outcome().unwrap(), None, &all).unwrap();
    let table = breusch_pagan_table(&fit, &f.covariates, BpVariant::Koenker).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table[0].covariate, "x1");
    assert!(table[0].p_value < 1e-4, "x1 p={}", table[0].p_value);
    for r in &table {
        assert_eq!(r.df, 1);
        assert!(r.statistic >= 0.0);
        assert!((0.0..=1.0).contains(&r.p_value));
    }
}

#[test]
fn homoskedastic_breusch_pagan_is_well_formed() {
    let (f, _) = frame(&SimulationConfig::default());
    let (x, names) = f.design();
    let fit = ols_fit(&x, f.outcome().unwrap(), None, &names).unwrap();
    let table = breusch_pagan_table(&fit, &f.covariates, BpVariant::Original).unwrap();
    for r in &table {
        assert_eq!(r.df, 1);
        assert!(r.statistic >= 0.0 && r.statistic.is_finite());
        assert!((0.0..=1.0).contains(&r.p_value));
    }
}

#[test]
fn boosted_weights_improve_balance() {
    let cfg = SimulationConfig { n: 800, selection: 1.2, ..SimulationConfig::default() };
    let (f, _) = frame(&cfg);
    let (x, names) = f.design();
    let model = GbmPropensity::new(GbmConfig { n_trees: 200, ..GbmConfig::default() }, names)
        .with_stop(StopMethod::BalanceMeanSmd { estimand: Estimand::Att, every: 10 });
    let fit = model.fit(&f.treatment, &x).unwrap();
    let w = ipw_weights(&fit.scores, &f.treatment, Estimand::Att).unwrap();

    let cols = f.design_columns();
    let smd = SmdConfig::default();
    let before = mean_abs_smd(&standardized_differences(&cols, &f.treatment, None, &smd).unwrap());
    let after =
        mean_abs_smd(&standardized_differences(&cols, &f.treatment, Some(&w), &smd).unwrap());
    assert!(after < before, "before={before} after={after}");
    assert!(fit.balance_path.as_ref().is_some_and(|p| !p.is_empty()));

    let y = f.outcome().unwrap();
    let r = weighted_outcome_regression(
        y,
        &f.treatment,
        &x,
        &f.design().1,
        &w,
        WeightedVariance::Robust,
    )
    .unwrap();
    assert!((r.treatment.estimate - 2.0).abs() < 0.5, "effect={}", r.treatment.estimate);
}
