//! Covariate balance between treatment arms: standardized mean differences,
//! balance regressions and per-arm summaries.

use ps_core::{Error, Estimate, Result};
use ps_translate::Covariate;
use serde::{Deserialize, Serialize};

use crate::regression::{CovarianceKind, LogisticConfig, logistic_fit, ols_fit};
use crate::stats::{mean, quantile_sorted, sample_variance, weighted_mean};

/// Standard deviation in the SMD denominator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmdDenominator {
    /// `sqrt((var_t + var_c) / 2)`.
    #[default]
    Pooled,
    /// Treated-arm standard deviation (ATT convention).
    Treated,
}

/// Standardized-difference controls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmdConfig {
    /// Denominator.
    pub denominator: SmdDenominator,
    /// A covariate is balanced when `smd < threshold`.
    pub threshold: f64,
}

impl Default for SmdConfig {
    fn default() -> Self {
        Self { denominator: SmdDenominator::Pooled, threshold: 0.1 }
    }
}

/// Standardized mean difference for one design column.
#[derive(Debug, Clone, Serialize)]
pub struct SmdRow {
    /// Column name.
    pub covariate: String,
    /// (Weighted) treated mean.
    pub mean_treated: f64,
    /// (Weighted) control mean.
    pub mean_control: f64,
    /// Unweighted denominator.
    pub sd: f64,
    /// `|mean_treated - mean_control| / sd`.
    pub smd: f64,
    /// `smd < threshold`.
    pub balanced: bool,
}

fn split_arms(v: &[f64], treat: &[u8]) -> (Vec<f64>, Vec<f64>) {
    let t = v.iter().zip(treat).filter(|(_, t)| **t == 1).map(|(x, _)| *x).collect();
    let c = v.iter().zip(treat).filter(|(_, t)| **t == 0).map(|(x, _)| *x).collect();
    (t, c)
}

fn check_columns(columns: &[(String, Vec<f64>)], treat: &[u8], weights: Option<&[f64]>) -> Result<()> {
    let n = treat.len();
    if treat.iter().any(|&t| t > 1) {
        return Err(Error::Validation("treatment must be 0/1".into()));
    }
    let n1 = treat.iter().filter(|&&t| t == 1).count();
    if n1 == 0 || n1 == n {
        return Err(Error::Validation("need both treated and control observations".into()));
    }
    for (name, col) in columns {
        if col.len() != n {
            return Err(Error::Validation(format!(
                "column '{}' has {} rows, expected {}",
                name,
                col.len(),
                n
            )));
        }
    }
    if let Some(w) = weights {
        if w.len() != n || w.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(Error::Validation("weights must be finite, >= 0 and one per row".into()));
        }
        let (wt, wc) = split_arms(w, treat);
        if !(wt.iter().sum::<f64>() > 0.0 && wc.iter().sum::<f64>() > 0.0) {
            return Err(Error::Validation("each arm needs positive total weight".into()));
        }
    }
    Ok(())
}

/// `|mean_t - mean_c| / sd` per column.
///
/// Means are weighted when `weights` is given; the denominator always comes from the
/// unweighted sample so that before/after comparisons share a scale.
pub fn standardized_differences(
    columns: &[(String, Vec<f64>)],
    treat: &[u8],
    weights: Option<&[f64]>,
    config: &SmdConfig,
) -> Result<Vec<SmdRow>> {
    check_columns(columns, treat, weights)?;
    let w_arms = weights.map(|w| split_arms(w, treat));
    columns
        .iter()
        .map(|(name, col)| {
            let (xt, xc) = split_arms(col, treat);
            let sd = match config.denominator {
                SmdDenominator::Pooled => {
                    (0.5 * (sample_variance(&xt) + sample_variance(&xc))).sqrt()
                }
                SmdDenominator::Treated => sample_variance(&xt).sqrt(),
            };
            if !(sd > 0.0) {
                return Err(Error::Computation(format!(
                    "covariate '{name}' has zero standard deviation; SMD is undefined"
                )));
            }
            let (mean_treated, mean_control) = match &w_arms {
                Some((wt, wc)) => (weighted_mean(&xt, wt), weighted_mean(&xc, wc)),
                None => (mean(&xt), mean(&xc)),
            };
            let smd = (mean_treated - mean_control).abs() / sd;
            Ok(SmdRow {
                covariate: name.clone(),
                mean_treated,
                mean_control,
                sd,
                smd,
                balanced: smd < config.threshold,
            })
        })
        .collect()
}

/// Mean absolute SMD over rows (the twang `es.mean` stopping criterion).
pub fn mean_abs_smd(rows: &[SmdRow]) -> f64 {
    rows.iter().map(|r| r.smd).sum::<f64>() / rows.len() as f64
}

/// Model used for one balance regression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceModel {
    /// Treatment ~ factor dummies (logistic).
    Logistic,
    /// Covariate ~ treatment (linear).
    Linear,
}

/// One reported term of a balance regression.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceTerm {
    /// Term name (`treatment` or `factor[level]`).
    pub term: String,
    /// Coefficient with robust SE; on the probability scale when requested.
    #[serde(flatten)]
    pub estimate: Estimate,
    /// `exp(coefficient)` for logistic terms (never rescaled).
    pub odds_ratio: Option<f64>,
}

/// Balance regression for one covariate.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceRegression {
    /// Covariate name.
    pub covariate: String,
    /// Model family.
    pub model: BalanceModel,
    /// Terms (intercept omitted).
    pub terms: Vec<BalanceTerm>,
    /// Logistic coefficients and SEs were divided by 4.
    pub probability_scale: bool,
}

/// Regress each covariate on treatment (or treatment on each factor).
///
/// Categorical covariates: weighted logistic regression of treatment on the level
/// dummies with sandwich SEs, reporting odds ratios; with `probability_scale` the
/// coefficient and SE are divided by 4 (the slope of the logistic curve at p = 0.5).
/// Continuous covariates: weighted linear regression of the covariate on treatment with
/// HC1 SEs and a t test.
pub fn balance_regressions(
    covariates: &[Covariate],
    treat: &[u8],
    weights: Option<&[f64]>,
    probability_scale: bool,
) -> Result<Vec<BalanceRegression>> {
    let treat_col = ("treatment".to_string(), treat.iter().map(|&t| t as f64).collect::<Vec<_>>());
    check_columns(std::slice::from_ref(&treat_col), treat, weights)?;
    covariates
        .iter()
        .map(|cov| {
            let cols = cov.design_columns();
            if cov.is_categorical() {
                let (names, values): (Vec<String>, Vec<Vec<f64>>) = cols.into_iter().unzip();
                if names.is_empty() {
                    return Err(Error::Computation(format!(
                        "covariate '{}' has a single level",
                        cov.name
                    )));
                }
                let rows: Vec<Vec<f64>> =
                    (0..treat.len()).map(|i| values.iter().map(|c| c[i]).collect()).collect();
                let fit = logistic_fit(&rows, treat, weights, &names, &LogisticConfig::default())
                    .map_err(|e| with_covariate(e, &cov.name))?;
                let table = fit.coefficient_table(true)?;
                let scale = if probability_scale { 0.25 } else { 1.0 };
                let terms = table
                    .rows
                    .iter()
                    .skip(1)
                    .map(|r| {
                        let e = r.estimate;
                        Ok(BalanceTerm {
                            term: r.term.clone(),
                            estimate: Estimate::new(
                                e.estimate * scale,
                                e.std_error * scale,
                                e.p_value,
                            )?,
                            odds_ratio: Some(e.estimate.exp()),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(BalanceRegression {
                    covariate: cov.name.clone(),
                    model: BalanceModel::Logistic,
                    terms,
                    probability_scale,
                })
            } else {
                let (_, y) = &cols[0];
                let rows: Vec<Vec<f64>> = treat.iter().map(|&t| vec![t as f64]).collect();
                let fit = ols_fit(&rows, y, weights, &["treatment".to_string()])
                    .map_err(|e| with_covariate(e, &cov.name))?;
                let table = fit
                    .coefficient_table(CovarianceKind::Hc1)
                    .map_err(|e| with_covariate(e, &cov.name))?;
                let row = table.get("treatment")?;
                Ok(BalanceRegression {
                    covariate: cov.name.clone(),
                    model: BalanceModel::Linear,
                    terms: vec![BalanceTerm {
                        term: row.term.clone(),
                        estimate: row.estimate,
                        odds_ratio: None,
                    }],
                    probability_scale: false,
                })
            }
        })
        .collect()
}

fn with_covariate(e: Error, name: &str) -> Error {
    match e {
        Error::Computation(msg) => Error::Computation(format!("balance regression for '{name}': {msg}")),
        Error::Convergence(msg) => Error::Convergence(format!("balance regression for '{name}': {msg}")),
        other => other,
    }
}

/// Descriptive statistics for one arm.
#[derive(Debug, Clone, Serialize)]
pub struct ArmSummary {
    /// Observations.
    pub n: usize,
    /// Mean.
    pub mean: f64,
    /// Sample standard deviation.
    pub sd: f64,
    /// Minimum.
    pub min: f64,
    /// Median.
    pub median: f64,
    /// Maximum.
    pub max: f64,
}

impl ArmSummary {
    fn from_values(v: &[f64]) -> Self {
        let mut sorted = v.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Self {
            n: v.len(),
            mean: mean(v),
            sd: sample_variance(v).sqrt(),
            min: sorted.first().copied().unwrap_or(f64::NAN),
            median: quantile_sorted(&sorted, 0.5),
            max: sorted.last().copied().unwrap_or(f64::NAN),
        }
    }
}

/// Covariate summary table row.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    /// Column name.
    pub covariate: String,
    /// Treated arm.
    pub treated: ArmSummary,
    /// Control arm.
    pub control: ArmSummary,
}

/// Per-arm n / mean / sd / min / median / max for each column.
pub fn group_summaries(columns: &[(String, Vec<f64>)], treat: &[u8]) -> Result<Vec<GroupSummary>> {
    check_columns(columns, treat, None)?;
    Ok(columns
        .iter()
        .map(|(name, col)| {
            let (xt, xc) = split_arms(col, treat);
            GroupSummary {
                covariate: name.clone(),
                treated: ArmSummary::from_values(&xt),
                control: ArmSummary::from_values(&xc),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_translate::CovariateValues;

    fn cols() -> (Vec<(String, Vec<f64>)>, Vec<u8>) {
        let treat = vec![1, 1, 1, 0, 0, 0];
        let x = vec![3.0, 4.0, 5.0, 1.0, 2.0, 3.0];
        (vec![("x".to_string(), x)], treat)
    }

    #[test]
    fn test_smd_pooled_and_treated() {
        let (c, t) = cols();
        let rows = standardized_differences(&c, &t, None, &SmdConfig::default()).unwrap();
        // means 4 and 2, both variances 1
        assert!((rows[0].smd - 2.0).abs() < 1e-12);
        assert!(!rows[0].balanced);
        let cfg = SmdConfig { denominator: SmdDenominator::Treated, ..SmdConfig::default() };
        let rows = standardized_differences(&c, &t, None, &cfg).unwrap();
        assert!((rows[0].sd - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_weights_move_means_not_sd() {
        let (c, t) = cols();
        let w = vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0];
        let unweighted = standardized_differences(&c, &t, None, &SmdConfig::default()).unwrap();
        let weighted = standardized_differences(&c, &t, Some(&w), &SmdConfig::default()).unwrap();
        assert_eq!(unweighted[0].sd, weighted[0].sd);
        assert!((weighted[0].mean_treated - 5.0).abs() < 1e-12);
        assert!((weighted[0].mean_control - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_balanced_threshold_is_strict() {
        let treat = vec![1, 1, 0, 0];
        let x = vec![0.1, -0.1, 0.0, 0.0];
        let c = vec![("x".to_string(), x)];
        // pooled sd = sqrt(0.02/2) = 0.1; means equal -> smd 0
        let rows = standardized_differences(&c, &treat, None, &SmdConfig::default()).unwrap();
        assert!(rows[0].balanced);
        let cfg = SmdConfig { threshold: 0.0, ..SmdConfig::default() };
        let rows = standardized_differences(&c, &treat, None, &cfg).unwrap();
        assert!(!rows[0].balanced);
    }

    #[test]
    fn test_zero_sd_is_error() {
        let treat = vec![1, 1, 0, 0];
        let c = vec![("k".to_string(), vec![2.0; 4])];
        let err = standardized_differences(&c, &treat, None, &SmdConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Computation(_)), "{err}");
    }

    fn covariates(n: usize) -> (Vec<Covariate>, Vec<u8>) {
        let treat: Vec<u8> = (0..n).map(|i| if i % 2 == 0 { 1 } else { 0 }).collect();
        let x: Vec<f64> = (0..n).map(|i| (i as f64 * 0.3).sin() + 0.5 * (i % 2 == 0) as u8 as f64).collect();
        let codes: Vec<u32> = (0..n).map(|i| ((i * 7) % 3) as u32).collect();
        (
            vec![
                Covariate { name: "x".into(), values: CovariateValues::Continuous(x) },
                Covariate {
                    name: "grp".into(),
                    values: CovariateValues::Categorical {
                        codes,
                        levels: vec!["a".into(), "b".into(), "c".into()],
                    },
                },
            ],
            treat,
        )
    }

    #[test]
    fn test_balance_regressions_models() {
        let (covs, treat) = covariates(60);
        let out = balance_regressions(&covs, &treat, None, false).unwrap();
        assert_eq!(out[0].model, BalanceModel::Linear);
        assert_eq!(out[0].terms.len(), 1);
        assert_eq!(out[0].terms[0].term, "treatment");
        assert!(out[0].terms[0].odds_ratio.is_none());
        assert_eq!(out[1].model, BalanceModel::Logistic);
        assert_eq!(out[1].terms.len(), 2);
        assert_eq!(out[1].terms[0].term, "grp[b]");
    }

    #[test]
    fn test_probability_scale_divides_by_four() {
        let (covs, treat) = covariates(60);
        let raw = balance_regressions(&covs, &treat, None, false).unwrap();
        let scaled = balance_regressions(&covs, &treat, None, true).unwrap();
        for (a, b) in raw[1].terms.iter().zip(&scaled[1].terms) {
            assert!((b.estimate.estimate - a.estimate.estimate / 4.0).abs() < 1e-12);
            assert!((b.estimate.std_error - a.estimate.std_error / 4.0).abs() < 1e-12);
            assert!((b.estimate.statistic - a.estimate.statistic).abs() < 1e-9);
            assert_eq!(a.odds_ratio, b.odds_ratio);
        }
        // Linear rows are never rescaled.
        assert_eq!(raw[0].terms[0].estimate.estimate, scaled[0].terms[0].estimate.estimate);
    }

    #[test]
    fn test_group_summaries() {
        let (c, t) = cols();
        let s = group_summaries(&c, &t).unwrap();
        assert_eq!(s[0].treated.n, 3);
        assert!((s[0].treated.mean - 4.0).abs() < 1e-12);
        assert_eq!(s[0].control.min, 1.0);
        assert_eq!(s[0].control.max, 3.0);
        assert!((s[0].control.sd - 1.0).abs() < 1e-12);
    }
}
