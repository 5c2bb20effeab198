//! Analysis stages shared by the per-stage subcommands and `pscore run`.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::path::Path;

use ps_core::{Estimand, PropensityModel};
use ps_inference::balance::{BalanceRegression, GroupSummary, SmdRow};
use ps_inference::propensity::{BalancePoint, VariableInfluence};
use ps_inference::weighting::TREATMENT_TERM;
use ps_inference::{
    BiasAdjust, BpVariant, BreuschPaganResult, CoefficientTable, CovarianceKind, GbmPropensity,
    LogisticPropensity, MatchingResult, OverlapSummary, SmdDenominator, StopMethod,
    WeightedRegressionResult, WeightedVariance, balance_regressions, breusch_pagan_table,
    effective_sample_size, group_summaries, ipw_weights, match_estimate,
    mean_abs_smd, ols_fit, overlap_summary, standardized_differences,
    weighted_outcome_regression,
};
use ps_translate::{AnalysisFrame, CsvOptions, TableSchema, read_csv};

use crate::spec::{
    BalanceSettings, MatchingSettings, PropensityKind, PropensitySettings, VarianceChoice, WeightingSettings,
};

// ---------------------------------------------------------------------------
// load / describe
// ---------------------------------------------------------------------------

pub fn load_frame(path: &Path, opts: &CsvOptions, schema: &TableSchema) -> Result<AnalysisFrame> {
    let table =
        read_csv(path, opts).with_context(|| format!("failed to read {}", path.display()))?;
    let frame = AnalysisFrame::from_table(&table, schema)
        .with_context(|| format!("{} does not match the analysis schema", path.display()))?;
    tracing::info!(
        rows = frame.n(),
        dropped = frame.n_dropped,
        n_treated = frame.n_treated(),
        n_control = frame.n_control(),
        "loaded analysis frame"
    );
    Ok(frame)
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameSummary {
    pub rows: usize,
    pub dropped: usize,
    pub n_treated: usize,
    pub n_control: usize,
    pub design_columns: Vec<String>,
    pub summaries: Vec<GroupSummary>,
}

pub fn describe(frame: &AnalysisFrame) -> Result<FrameSummary> {
    let columns = frame.design_columns();
    let summaries = group_summaries(&columns, &frame.treatment)?;
    Ok(FrameSummary {
        rows: frame.n(),
        dropped: frame.n_dropped,
        n_treated: frame.n_treated(),
        n_control: frame.n_control(),
        design_columns: columns.into_iter().map(|(n, _)| n).collect(),
        summaries,
    })
}

// ---------------------------------------------------------------------------
// diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub variant: BpVariant,
    pub n_obs: usize,
    pub r_squared: f64,
    /// OLS of the outcome on treatment and covariates.
    pub model: CoefficientTable,
    pub tests: Vec<BreuschPaganResult>,
}

/// `[treatment, covariates...]` design rows and names.
fn treatment_design(frame: &AnalysisFrame) -> (Vec<Vec<f64>>, Vec<String>) {
    let (x, names) = frame.design();
    let rows = frame
        .treatment
        .iter()
        .zip(x)
        .map(|(&t, r)| std::iter::once(t as f64).chain(r).collect())
        .collect();
    let names = std::iter::once(TREATMENT_TERM.to_string()).chain(names).collect();
    (rows, names)
}

pub fn diagnostics(frame: &AnalysisFrame, variant: BpVariant) -> Result<DiagnosticsReport> {
    if frame.covariates.is_empty() {
        bail!("Breusch-Pagan needs at least one covariate");
    }
    let y = frame.outcome()?;
    let (rows, names) = treatment_design(frame);
    let fit = ols_fit(&rows, y, None, &names)?;
    let model = fit.coefficient_table(CovarianceKind::Classical)?;
    let tests = breusch_pagan_table(&fit, &frame.covariates, variant)?;
    let rejected = tests.iter().filter(|t| t.p_value < 0.05).count();
    tracing::info!(tests = tests.len(), rejected, "breusch-pagan");
    Ok(DiagnosticsReport { variant, n_obs: fit.n_obs, r_squared: fit.r_squared, model, tests })
}

// ---------------------------------------------------------------------------
// matching
// ---------------------------------------------------------------------------

/// Rows of the named design columns. A covariate name selects all of its design columns.
fn adjustment_rows(frame: &AnalysisFrame, names: &[String]) -> Result<Vec<Vec<f64>>> {
    let columns = frame.design_columns();
    let mut picked: Vec<&[f64]> = Vec::new();
    for name in names {
        let before = picked.len();
        for (col, values) in &columns {
            let is_level =
                col.strip_prefix(name.as_str()).is_some_and(|rest| rest.starts_with('['));
            if col == name || is_level {
                picked.push(values);
            }
        }
        if picked.len() == before {
            bail!("bias-adjustment column '{name}' is not a covariate of the analysis schema");
        }
    }
    Ok((0..frame.n()).map(|i| picked.iter().map(|c| c[i]).collect()).collect())
}

pub fn matching(frame: &AnalysisFrame, settings: &MatchingSettings) -> Result<MatchingResult> {
    let mut cfg = settings.to_config();
    if !settings.bias_adjust_columns.is_empty() {
        cfg.bias_adjust =
            BiasAdjust::Columns(adjustment_rows(frame, &settings.bias_adjust_columns)?);
    }
    let (x, _) = frame.design();
    let r = match_estimate(frame.outcome()?, &frame.treatment, &x, &cfg)?;
    tracing::info!(m = r.m, rows = r.rows.len(), bias_adjusted = r.bias_adjusted, "matching");
    Ok(r)
}

// ---------------------------------------------------------------------------
// propensity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct GbmDiagnostics {
    pub iteration: usize,
    pub n_trees: usize,
    pub stop: StopMethod,
    pub may_need_more_trees: bool,
    pub final_train_deviance: f64,
    pub relative_influence: Vec<VariableInfluence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_path: Option<Vec<BalancePoint>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PropensityReport {
    pub model: String,
    pub overlap: OverlapSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gbm: Option<GbmDiagnostics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coefficients: Option<CoefficientTable>,
    pub scores: Vec<f64>,
}

pub fn propensity(frame: &AnalysisFrame, settings: &PropensitySettings) -> Result<PropensityReport> {
    let (x, names) = frame.design();
    if names.is_empty() {
        bail!("propensity model needs at least one covariate");
    }
    let treat = &frame.treatment;
    let (model, scores, gbm, coefficients) = match settings.model {
        PropensityKind::Gbm => {
            let mut m = GbmPropensity::new(settings.gbm, names).with_stop(settings.stop);
            m.shuffle = settings.shuffle;
            let fit = m.fit(treat, &x)?;
            let diag = GbmDiagnostics {
                iteration: fit.iteration,
                n_trees: fit.train_deviance.len(),
                stop: fit.stop,
                may_need_more_trees: fit.may_need_more_trees,
                final_train_deviance: fit.train_deviance.last().copied().unwrap_or(f64::NAN),
                relative_influence: fit.relative_influence,
                balance_path: fit.balance_path,
            };
            (m.name().to_string(), fit.scores, Some(diag), None)
        }
        PropensityKind::Logistic => {
            let m = LogisticPropensity { config: settings.logistic, names };
            let fit = m.fit(treat, &x)?;
            let table = fit.coefficient_table(true)?;
            (m.name().to_string(), fit.fitted, None, Some(table))
        }
    };
    let overlap = overlap_summary(&scores, treat, settings.trim)?;
    tracing::info!(
        model = model.as_str(),
        common_support_lo = overlap.common_support[0],
        common_support_hi = overlap.common_support[1],
        "propensity scores"
    );
    Ok(PropensityReport { model, overlap, gbm, coefficients, scores })
}

/// Scores from a fitted model, or from the schema's propensity column.
pub fn scores_for(
    frame: &AnalysisFrame,
    settings: Option<&PropensitySettings>,
) -> Result<(Vec<f64>, Option<PropensityReport>)> {
    if let Some(s) = settings {
        let report = propensity(frame, s)?;
        return Ok((report.scores.clone(), Some(report)));
    }
    match &frame.propensity {
        Some(ps) => Ok((ps.clone(), None)),
        None => bail!("no propensity scores: give a propensity column or fit a propensity model"),
    }
}

// ---------------------------------------------------------------------------
// weights / weighted outcome regression
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct WeightsReport {
    pub estimand: Estimand,
    pub n: usize,
    pub effective_n: f64,
    pub effective_n_treated: f64,
    pub effective_n_control: f64,
    pub min: f64,
    pub max: f64,
    pub weights: Vec<f64>,
}

pub fn weights(frame: &AnalysisFrame, scores: &[f64], estimand: Estimand) -> Result<WeightsReport> {
    let w = ipw_weights(scores, &frame.treatment, estimand)?;
    let arm = |t: u8| -> Vec<f64> {
        w.iter().zip(&frame.treatment).filter(|(_, tt)| **tt == t).map(|(x, _)| *x).collect()
    };
    let report = WeightsReport {
        estimand,
        n: w.len(),
        effective_n: effective_sample_size(&w),
        effective_n_treated: effective_sample_size(&arm(1)),
        effective_n_control: effective_sample_size(&arm(0)),
        min: w.iter().copied().fold(f64::INFINITY, f64::min),
        max: w.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        weights: w,
    };
    tracing::info!(estimand = %estimand, effective_n = report.effective_n, "ipw weights");
    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
pub struct IpwReport {
    pub estimand: Estimand,
    #[serde(flatten)]
    pub regression: WeightedRegressionResult,
}

pub fn weighted_regression(
    frame: &AnalysisFrame,
    w: &[f64],
    settings: &WeightingSettings,
) -> Result<IpwReport> {
    let (x, names) = frame.design();
    let variance = match settings.variance {
        VarianceChoice::Robust => WeightedVariance::Robust,
        VarianceChoice::Cluster => match &frame.cluster {
            Some(ids) => WeightedVariance::Cluster(ids),
            None => bail!("cluster-robust variance needs a cluster column"),
        },
    };
    let regression =
        weighted_outcome_regression(frame.outcome()?, &frame.treatment, &x, &names, w, variance)?;
    tracing::info!(
        estimand = %settings.estimand,
        effect = regression.treatment.estimate,
        se = regression.treatment.std_error,
        "weighted outcome regression"
    );
    Ok(IpwReport { estimand: settings.estimand, regression })
}

// ---------------------------------------------------------------------------
// balance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BalanceReport {
    pub threshold: f64,
    pub denominator: SmdDenominator,
    pub before: Vec<SmdRow>,
    pub mean_before: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Vec<SmdRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_after: Option<f64>,
    pub regressions: Vec<BalanceRegression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weighted_regressions: Option<Vec<BalanceRegression>>,
    pub summaries: Vec<GroupSummary>,
}

pub fn balance(
    frame: &AnalysisFrame,
    w: Option<&[f64]>,
    settings: &BalanceSettings,
) -> Result<BalanceReport> {
    let columns = frame.design_columns();
    let treat = &frame.treatment;
    let cfg = settings.smd_config();
    let before = standardized_differences(&columns, treat, None, &cfg)?;
    let after = w.map(|w| standardized_differences(&columns, treat, Some(w), &cfg)).transpose()?;
    let regressions =
        balance_regressions(&frame.covariates, treat, None, settings.probability_scale)?;
    let weighted_regressions = w
        .map(|w| balance_regressions(&frame.covariates, treat, Some(w), settings.probability_scale))
        .transpose()?;
    let report = BalanceReport {
        threshold: cfg.threshold,
        denominator: cfg.denominator,
        mean_before: mean_abs_smd(&before),
        mean_after: after.as_deref().map(mean_abs_smd),
        before,
        after,
        regressions,
        weighted_regressions,
        summaries: group_summaries(&columns, treat)?,
    };
    tracing::info!(
        mean_before = report.mean_before,
        mean_after = report.mean_after.unwrap_or(f64::NAN),
        "balance"
    );
    Ok(report)
}
