//! Propensity-score models: boosted trees (twang-style) and logistic regression.

use ps_core::{Error, Estimand, PropensityModel, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::balance::{SmdConfig, SmdDenominator, mean_abs_smd, standardized_differences};
use crate::gbm::{GbmConfig, fit_gbm};
use crate::regression::{LogisticConfig, LogisticFit, logistic_fit};
use crate::stats::quantile_sorted;
use crate::weights::ipw_weights;

/// Deterministic permutation of `0..n` (Fisher–Yates driven by `StdRng::seed_from_u64`).
pub fn shuffle_permutation(n: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(&mut rng);
    perm
}

/// How the boosting iteration used for the scores is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum StopMethod {
    /// Use every tree.
    #[default]
    AllTrees,
    /// Iteration with the lowest held-out deviance (needs `train_fraction < 1`).
    Validation,
    /// Iteration minimising the mean absolute weighted SMD over covariates.
    BalanceMeanSmd {
        /// Estimand whose weights are balanced.
        estimand: Estimand,
        /// Evaluate every `every` iterations.
        every: usize,
    },
}

/// Mean absolute SMD at one evaluated iteration.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BalancePoint {
    /// Iteration (1-based).
    pub iteration: usize,
    /// Mean absolute standardized difference.
    pub mean_smd: f64,
}

/// Relative influence of one covariate.
#[derive(Debug, Clone, Serialize)]
pub struct VariableInfluence {
    /// Design column.
    pub variable: String,
    /// Percent of total split improvement.
    pub percent: f64,
}

/// Scores and diagnostics from [`GbmPropensity::fit`].
#[derive(Debug, Clone, Serialize)]
pub struct GbmPropensityFit {
    /// Propensity score per input row, in input order.
    pub scores: Vec<f64>,
    /// Iteration used for the scores.
    pub iteration: usize,
    /// Selection rule.
    pub stop: StopMethod,
    /// Relative influence, largest first.
    pub relative_influence: Vec<VariableInfluence>,
    /// Training deviance per iteration.
    pub train_deviance: Vec<f64>,
    /// Validation deviance per iteration.
    pub valid_deviance: Option<Vec<f64>>,
    /// Balance criterion path for [`StopMethod::BalanceMeanSmd`].
    pub balance_path: Option<Vec<BalancePoint>>,
    /// The selected iteration is the last tree.
    pub may_need_more_trees: bool,
}

/// Generalized boosted propensity model.
#[derive(Debug, Clone)]
pub struct GbmPropensity {
    /// Boosting controls; `config.seed` also seeds the row permutation.
    pub config: GbmConfig,
    /// Iteration selection.
    pub stop: StopMethod,
    /// Permute rows before fitting.
    pub shuffle: bool,
    /// Design column names (for relative influence and balance).
    pub names: Vec<String>,
}

impl GbmPropensity {
    /// Model with default stop rule and shuffling enabled.
    pub fn new(config: GbmConfig, names: Vec<String>) -> Self {
        Self { config, stop: StopMethod::AllTrees, shuffle: true, names }
    }

    /// Set the stop rule.
    pub fn with_stop(mut self, stop: StopMethod) -> Self {
        self.stop = stop;
        self
    }

    /// Fit and score every row.
    ///
    /// Rows are permuted with [`shuffle_permutation`] before fitting because
    /// `train_fraction` and bagging depend on row order; scores are returned in input
    /// order. Same seed and same input give bit-identical scores.
    pub fn fit(&self, treat: &[u8], x: &[Vec<f64>]) -> Result<GbmPropensityFit> {
        if treat.len() != x.len() {
            return Err(Error::Validation(format!(
                "treatment ({}) and covariates ({}) differ in length",
                treat.len(),
                x.len()
            )));
        }
        let p = x.first().map_or(0, |r| r.len());
        if self.names.len() != p {
            return Err(Error::Validation(format!(
                "expected {} covariate names, got {}",
                p,
                self.names.len()
            )));
        }

        let gbm = if self.shuffle {
            let perm = shuffle_permutation(treat.len(), self.config.seed);
            let t: Vec<u8> = perm.iter().map(|&i| treat[i]).collect();
            let xr: Vec<Vec<f64>> = perm.iter().map(|&i| x[i].clone()).collect();
            fit_gbm(&t, &xr, &self.config)?
        } else {
            fit_gbm(treat, x, &self.config)?
        };

        let n_trees = gbm.n_trees();
        let (iteration, balance_path) = match self.stop {
            StopMethod::AllTrees => (n_trees, None),
            StopMethod::Validation => {
                if gbm.valid_deviance.is_none() {
                    return Err(Error::Validation(
                        "validation stopping needs train_fraction < 1".into(),
                    ));
                }
                (gbm.best_iteration, None)
            }
            StopMethod::BalanceMeanSmd { estimand, every } => {
                if every == 0 {
                    return Err(Error::Validation("balance evaluation step must be >= 1".into()));
                }
                let mut its: Vec<usize> = (every..=n_trees).step_by(every).collect();
                if its.last() != Some(&n_trees) {
                    its.push(n_trees);
                }
                let columns: Vec<(String, Vec<f64>)> = self
                    .names
                    .iter()
                    .enumerate()
                    .map(|(j, name)| (name.clone(), x.iter().map(|r| r[j]).collect()))
                    .collect();
                let smd_cfg = SmdConfig {
                    denominator: if estimand == Estimand::Att {
                        SmdDenominator::Treated
                    } else {
                        SmdDenominator::Pooled
                    },
                    ..SmdConfig::default()
                };
                let staged = gbm.staged_proba(x, &its)?;
                let mut path = Vec::with_capacity(its.len());
                for (&it, scores) in its.iter().zip(&staged) {
                    let w = ipw_weights(scores, treat, estimand)?;
                    let rows = standardized_differences(&columns, treat, Some(&w), &smd_cfg)?;
                    path.push(BalancePoint { iteration: it, mean_smd: mean_abs_smd(&rows) });
                }
                let best = path
                    .iter()
                    .fold(None, |acc: Option<BalancePoint>, pt| match acc {
                        Some(b) if b.mean_smd <= pt.mean_smd => Some(b),
                        _ => Some(*pt),
                    })
                    .map_or(n_trees, |b| b.iteration);
                (best, Some(path))
            }
        };
        let may_need_more_trees = match self.stop {
            StopMethod::AllTrees => false,
            StopMethod::Validation => gbm.may_need_more_trees,
            StopMethod::BalanceMeanSmd { .. } => iteration == n_trees,
        };
        if may_need_more_trees && !matches!(self.stop, StopMethod::Validation) {
            log::warn!("balance criterion is minimised at the last of {n_trees} trees; consider more trees");
        }

        let scores = gbm.predict_proba(x, iteration)?;
        check_scores(&scores)?;

        let mut relative_influence: Vec<VariableInfluence> = self
            .names
            .iter()
            .zip(&gbm.relative_influence)
            .map(|(v, &p)| VariableInfluence { variable: v.clone(), percent: p })
            .collect();
        relative_influence.sort_by(|a, b| b.percent.total_cmp(&a.percent));

        Ok(GbmPropensityFit {
            scores,
            iteration,
            stop: self.stop,
            relative_influence,
            train_deviance: gbm.train_deviance,
            valid_deviance: gbm.valid_deviance,
            balance_path,
            may_need_more_trees,
        })
    }
}

fn check_scores(scores: &[f64]) -> Result<()> {
    if let Some((i, e)) = scores.iter().enumerate().find(|(_, e)| !(**e > 0.0 && **e < 1.0)) {
        return Err(Error::Computation(format!(
            "propensity score numerically 0 or 1 ({e}) at row {}",
            i + 1
        )));
    }
    Ok(())
}

impl PropensityModel for GbmPropensity {
    fn propensity_scores(&self, treat: &[u8], x: &[Vec<f64>]) -> Result<Vec<f64>> {
        Ok(self.fit(treat, x)?.scores)
    }

    fn name(&self) -> &str {
        "gbm"
    }
}

/// Parametric propensity model: logistic regression on the design columns.
#[derive(Debug, Clone)]
pub struct LogisticPropensity {
    /// IRLS controls.
    pub config: LogisticConfig,
    /// Design column names.
    pub names: Vec<String>,
}

impl LogisticPropensity {
    /// Fit the model; `fitted` holds the scores, already checked to lie in (0, 1).
    pub fn fit(&self, treat: &[u8], x: &[Vec<f64>]) -> Result<LogisticFit> {
        let fit = logistic_fit(x, treat, None, &self.names, &self.config)?;
        check_scores(&fit.fitted)?;
        Ok(fit)
    }
}

impl PropensityModel for LogisticPropensity {
    fn propensity_scores(&self, treat: &[u8], x: &[Vec<f64>]) -> Result<Vec<f64>> {
        Ok(self.fit(treat, x)?.fitted)
    }

    fn name(&self) -> &str {
        "logistic"
    }
}

/// Score distribution within one arm.
#[derive(Debug, Clone, Serialize)]
pub struct ArmOverlap {
    /// Units in the arm.
    pub n: usize,
    /// Quantiles: [min, p5, p25, median, p75, p95, max].
    pub quantiles: [f64; 7],
    /// Mean score.
    pub mean: f64,
    /// Scores `<= trim`.
    pub n_below: usize,
    /// Scores `>= 1 - trim`.
    pub n_above: usize,
}

/// Common-support summary of propensity scores.
#[derive(Debug, Clone, Serialize)]
pub struct OverlapSummary {
    /// Treated arm.
    pub treated: ArmOverlap,
    /// Control arm.
    pub control: ArmOverlap,
    /// Trimming threshold.
    pub trim: f64,
    /// `[max(min_t, min_c), min(max_t, max_c)]`.
    pub common_support: [f64; 2],
}

fn arm_overlap(scores: &[f64], trim: f64) -> ArmOverlap {
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q = |p: f64| quantile_sorted(&sorted, p);
    ArmOverlap {
        n: scores.len(),
        quantiles: [q(0.0), q(0.05), q(0.25), q(0.5), q(0.75), q(0.95), q(1.0)],
        mean: scores.iter().sum::<f64>() / scores.len() as f64,
        n_below: scores.iter().filter(|&&e| e <= trim).count(),
        n_above: scores.iter().filter(|&&e| e >= 1.0 - trim).count(),
    }
}

/// Per-arm quantiles and counts outside `[trim, 1 - trim]`.
pub fn overlap_summary(scores: &[f64], treat: &[u8], trim: f64) -> Result<OverlapSummary> {
    if scores.len() != treat.len() {
        return Err(Error::Validation("scores and treatment differ in length".into()));
    }
    if !(0.0..0.5).contains(&trim) {
        return Err(Error::Validation(format!("trim must be in [0, 0.5), got {trim}")));
    }
    let st: Vec<f64> = scores.iter().zip(treat).filter(|(_, t)| **t == 1).map(|(e, _)| *e).collect();
    let sc: Vec<f64> = scores.iter().zip(treat).filter(|(_, t)| **t == 0).map(|(e, _)| *e).collect();
    if st.is_empty() || sc.is_empty() {
        return Err(Error::Validation("need both treated and control observations".into()));
    }
    let treated = arm_overlap(&st, trim);
    let control = arm_overlap(&sc, trim);
    let outside = treated.n_below + treated.n_above + control.n_below + control.n_above;
    if outside > 0 {
        log::warn!("{outside} units have propensity scores outside [{trim}, {}]", 1.0 - trim);
    }
    let common_support = [
        treated.quantiles[0].max(control.quantiles[0]),
        treated.quantiles[6].min(control.quantiles[6]),
    ];
    Ok(OverlapSummary { treated, control, trim, common_support })
}
