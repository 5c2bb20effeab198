//! Propensity-weighted outcome regression.
//!
//! The outcome is regressed on `[1, treatment, covariates]` by weighted least squares with
//! IPW weights; the treatment coefficient is the weighted effect estimate. Inference uses
//! heteroskedasticity-robust (HC1) or cluster-robust standard errors, since IPW weights
//! are not precision weights.

use ps_core::{Error, Estimate, Result};
use serde::Serialize;

use crate::regression::{CoefficientTable, CovarianceKind, ols_fit};
use crate::weights::effective_sample_size;

/// Name of the treatment term.
pub const TREATMENT_TERM: &str = "treatment";

/// Standard errors for [`weighted_outcome_regression`].
#[derive(Debug, Clone, Copy)]
pub enum WeightedVariance<'a> {
    /// HC1 sandwich.
    Robust,
    /// Cluster-robust over one id per row.
    Cluster(&'a [u64]),
}

/// Result of [`weighted_outcome_regression`].
#[derive(Debug, Clone, Serialize)]
pub struct WeightedRegressionResult {
    /// Treatment effect with its robust test.
    pub treatment: Estimate,
    /// Full coefficient table.
    pub coefficients: CoefficientTable,
    /// Rows with positive weight.
    pub n_obs: usize,
    /// Kish effective sample size of the weights.
    pub effective_n: f64,
    /// Weighted R^2.
    pub r_squared: f64,
}

/// Weighted regression of `y` on treatment and the covariate rows.
pub fn weighted_outcome_regression(
    y: &[f64],
    treat: &[u8],
    x_rows: &[Vec<f64>],
    names: &[String],
    weights: &[f64],
    variance: WeightedVariance<'_>,
) -> Result<WeightedRegressionResult> {
    let n = y.len();
    if treat.len() != n || x_rows.len() != n || weights.len() != n {
        return Err(Error::Validation(format!(
            "length mismatch: y={}, treat={}, x={}, weights={}",
            n,
            treat.len(),
            x_rows.len(),
            weights.len()
        )));
    }
    if treat.iter().any(|&t| t > 1) {
        return Err(Error::Validation("treatment must be 0/1".into()));
    }
    if names.iter().any(|nm| nm == TREATMENT_TERM) {
        return Err(Error::Validation(format!(
            "covariate name '{TREATMENT_TERM}' is reserved for the treatment term"
        )));
    }

    let rows: Vec<Vec<f64>> = treat
        .iter()
        .zip(x_rows)
        .map(|(&t, r)| std::iter::once(t as f64).chain(r.iter().copied()).collect())
        .collect();
    let all_names: Vec<String> =
        std::iter::once(TREATMENT_TERM.to_string()).chain(names.iter().cloned()).collect();

    let fit = ols_fit(&rows, y, Some(weights), &all_names)?;
    let kind = match variance {
        WeightedVariance::Robust => CovarianceKind::Hc1,
        WeightedVariance::Cluster(ids) => CovarianceKind::Cluster(ids),
    };
    let coefficients = fit.coefficient_table(kind)?;
    let treatment = coefficients.get(TREATMENT_TERM)?.estimate;

    Ok(WeightedRegressionResult {
        treatment,
        coefficients,
        n_obs: fit.n_obs,
        effective_n: effective_sample_size(weights),
        r_squared: fit.r_squared,
    })
}
