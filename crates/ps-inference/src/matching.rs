//! Nearest-neighbour covariate matching (Abadie & Imbens, 2006).
//!
//! Every focal unit is matched to the `m` closest units of the opposite treatment arm
//! under a quadratic-form distance. Missing potential outcomes are imputed from the
//! matches (optionally bias-adjusted by within-arm regressions), and ATE / ATT / ATC are
//! reported with both the sample (conditional) and population variance estimators.
//!
//! `K_i` is the number of times unit `i` is used as a match, each use weighted by
//! `1 / #J(l)` for the focal unit `l` whose match set `J(l)` contains it.
//!
//! # References
//!
//! - Abadie & Imbens (2006), "Large sample properties of matching estimators for
//!   average treatment effects." Econometrica 74(1).
//! - Abadie, Drukker, Herr & Imbens (2004), "Implementing matching estimators for
//!   average treatment effects in Stata." Stata Journal 4(3).

use nalgebra::DMatrix;
use ps_core::{Error, Estimand, Estimate, Result, SampleKind};
use serde::{Deserialize, Serialize};

use crate::estimate::normal_estimate;
use crate::regression::{invert_gram, ols_fit};

/// Quadratic-form distance used to rank candidate matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Diagonal of inverse sample variances.
    #[default]
    InverseVariance,
    /// Inverse sample covariance.
    Mahalanobis,
    /// Identity.
    Euclidean,
}

/// Regression bias adjustment of imputed outcomes.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum BiasAdjust {
    /// Plain matching estimator.
    #[default]
    Off,
    /// Adjust on all matching covariates.
    Covariates,
    /// Adjust on an explicit set of columns, given as one row per unit.
    Columns(Vec<Vec<f64>>),
}

/// Estimator for the conditional outcome variance `sigma^2_i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceMethod {
    /// One constant variance per estimand, from the imputed unit-level effects.
    Homoskedastic,
    /// Unit-level variance from `matches` nearest same-arm neighbours.
    Robust {
        /// Same-arm neighbours per unit.
        matches: usize,
    },
}

/// Matching controls.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchConfig {
    /// Matches per focal unit (>= 1).
    pub m: usize,
    /// Reuse comparison units across focal units.
    pub replace: bool,
    /// Distance metric.
    pub metric: DistanceMetric,
    /// Keep every unit tied with the `m`-th closest distance.
    pub ties: bool,
    /// Bias adjustment.
    pub bias_adjust: BiasAdjust,
    /// Conditional variance estimator.
    pub variance: VarianceMethod,
    /// Estimands to report.
    pub estimands: Vec<Estimand>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            m: 1,
            replace: true,
            metric: DistanceMetric::InverseVariance,
            ties: true,
            bias_adjust: BiasAdjust::Off,
            variance: VarianceMethod::Homoskedastic,
            estimands: Estimand::ALL.to_vec(),
        }
    }
}

/// Matches of one focal unit.
#[derive(Debug, Clone, Serialize)]
pub struct MatchSet {
    /// Row index of the focal unit.
    pub focal: usize,
    /// Row indices of its matches, closest first.
    pub matches: Vec<usize>,
    /// Metric distances to the matches.
    pub distances: Vec<f64>,
}

/// One estimator row.
#[derive(Debug, Clone, Serialize)]
pub struct MatchingRow {
    /// Estimand.
    pub estimand: Estimand,
    /// Sample (conditional) or population variance.
    pub sample: SampleKind,
    /// Estimate with its z test.
    #[serde(flatten)]
    pub estimate: Estimate,
}

/// Output of [`match_estimate`].
#[derive(Debug, Clone, Serialize)]
pub struct MatchingResult {
    /// One row per requested estimand and [`SampleKind`].
    pub rows: Vec<MatchingRow>,
    /// Treated units matched to controls (empty when not needed by the estimands).
    pub treated_matches: Vec<MatchSet>,
    /// Control units matched to treated units (empty when not needed).
    pub control_matches: Vec<MatchSet>,
    /// `K_i` per unit.
    pub match_weights: Vec<f64>,
    /// Number of treated units.
    pub n_treated: usize,
    /// Number of control units.
    pub n_control: usize,
    /// Matches per unit.
    pub m: usize,
    /// Distance metric used.
    pub metric: DistanceMetric,
    /// Whether imputations were bias-adjusted.
    pub bias_adjusted: bool,
}

impl MatchingResult {
    /// Row for `estimand` / `sample`.
    pub fn row(&self, estimand: Estimand, sample: SampleKind) -> Result<&MatchingRow> {
        self.rows
            .iter()
            .find(|r| r.estimand == estimand && r.sample == sample)
            .ok_or_else(|| Error::Validation(format!("no {estimand} / {sample:?} row")))
    }
}

struct Metric {
    weight: DMatrix<f64>,
    diagonal: bool,
}

impl Metric {
    fn build(x: &[Vec<f64>], kind: DistanceMetric) -> Result<Self> {
        let n = x.len();
        let p = x[0].len();
        let mean: Vec<f64> =
            (0..p).map(|j| x.iter().map(|r| r[j]).sum::<f64>() / n as f64).collect();
        let cov = DMatrix::from_fn(p, p, |a, b| {
            x.iter().map(|r| (r[a] - mean[a]) * (r[b] - mean[b])).sum::<f64>() / (n as f64 - 1.0)
        });
        match kind {
            DistanceMetric::Euclidean => Ok(Self { weight: DMatrix::identity(p, p), diagonal: true }),
            DistanceMetric::InverseVariance => {
                let mut w = DMatrix::zeros(p, p);
                for j in 0..p {
                    let v = cov[(j, j)];
                    if !(v > 0.0) {
                        return Err(Error::Computation(format!(
                            "matching covariate {} has zero variance",
                            j + 1
                        )));
                    }
                    w[(j, j)] = 1.0 / v;
                }
                Ok(Self { weight: w, diagonal: true })
            }
            DistanceMetric::Mahalanobis => Ok(Self {
                weight: invert_gram(&cov, "covariate covariance matrix")?,
                diagonal: false,
            }),
        }
    }

    fn dist2(&self, a: &[f64], b: &[f64]) -> f64 {
        let p = a.len();
        if self.diagonal {
            (0..p).map(|j| (a[j] - b[j]) * (a[j] - b[j]) * self.weight[(j, j)]).sum()
        } else {
            let mut s = 0.0;
            for i in 0..p {
                let di = a[i] - b[i];
                for j in 0..p {
                    s += di * self.weight[(i, j)] * (a[j] - b[j]);
                }
            }
            s.max(0.0)
        }
    }

    /// The `m` nearest members of `pool` (excluding `focal`), plus ties with the `m`-th.
    fn nearest(
        &self,
        x: &[Vec<f64>],
        focal: usize,
        pool: &[usize],
        m: usize,
        ties: bool,
    ) -> Vec<(usize, f64)> {
        let mut cand: Vec<(usize, f64)> = pool
            .iter()
            .filter(|&&j| j != focal)
            .map(|&j| (j, self.dist2(&x[focal], &x[j])))
            .collect();
        cand.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        let mut take = m.min(cand.len());
        if ties && take > 0 {
            let dm = cand[take - 1].1;
            let tol = 1e-12 * dm.abs().max(1e-300);
            while take < cand.len() && (cand[take].1 - dm).abs() <= tol {
                take += 1;
            }
        }
        cand.truncate(take);
        cand
    }
}

fn validate(y: &[f64], treat: &[u8], x: &[Vec<f64>], config: &MatchConfig) -> Result<()> {
    let n = y.len();
    if treat.len() != n || x.len() != n {
        return Err(Error::Validation(format!(
            "length mismatch: y={}, treat={}, x={}",
            n,
            treat.len(),
            x.len()
        )));
    }
    if config.m == 0 {
        return Err(Error::Validation("m must be >= 1".into()));
    }
    if config.estimands.is_empty() {
        return Err(Error::Validation("at least one estimand is required".into()));
    }
    if treat.iter().any(|&t| t > 1) {
        return Err(Error::Validation("treatment must be 0/1".into()));
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(Error::Validation("outcome must contain only finite values".into()));
    }
    let p = x.first().map_or(0, |r| r.len());
    if p == 0 {
        return Err(Error::Validation("matching needs at least one covariate".into()));
    }
    if x.iter().any(|r| r.len() != p || r.iter().any(|v| !v.is_finite())) {
        return Err(Error::Validation("covariates must be rectangular and finite".into()));
    }
    if let BiasAdjust::Columns(z) = &config.bias_adjust {
        let q = z.first().map_or(0, |r| r.len());
        if z.len() != n || q == 0 || z.iter().any(|r| r.len() != q || r.iter().any(|v| !v.is_finite())) {
            return Err(Error::Validation(
                "bias-adjustment columns must have one finite row per unit".into(),
            ));
        }
    }
    Ok(())
}

/// Match every focal unit in `focal` against `pool`.
///
/// Without replacement the focal units are served in input order and each match leaves
/// the pool.
fn match_direction(
    metric: &Metric,
    x: &[Vec<f64>],
    focal: &[usize],
    pool: &[usize],
    config: &MatchConfig,
) -> Result<Vec<MatchSet>> {
    if config.m > pool.len() {
        return Err(Error::Validation(format!(
            "m = {} exceeds the {} available comparison units",
            config.m,
            pool.len()
        )));
    }
    let mut available = pool.to_vec();
    let mut out = Vec::with_capacity(focal.len());
    for &i in focal {
        if available.len() < config.m {
            return Err(Error::Validation(format!(
                "matching without replacement ran out of comparison units at row {}",
                i + 1
            )));
        }
        let near = metric.nearest(x, i, &available, config.m, config.ties);
        if !config.replace {
            available.retain(|j| !near.iter().any(|(k, _)| k == j));
        }
        out.push(MatchSet {
            focal: i,
            matches: near.iter().map(|(j, _)| *j).collect(),
            distances: near.iter().map(|(_, d)| d.sqrt()).collect(),
        });
    }
    Ok(out)
}

/// Linear predictor of a within-arm bias-adjustment regression.
struct ArmRegression {
    coefficients: Vec<f64>,
}

impl ArmRegression {
    fn fit(y: &[f64], z: &[Vec<f64>], arm: &[usize], k: &[f64]) -> Result<Self> {
        let rows: Vec<Vec<f64>> = arm.iter().map(|&i| z[i].clone()).collect();
        let ya: Vec<f64> = arm.iter().map(|&i| y[i]).collect();
        let w: Vec<f64> = arm.iter().map(|&i| k[i]).collect();
        let names: Vec<String> = (1..=z[0].len()).map(|j| format!("z{j}")).collect();
        let fit = ols_fit(&rows, &ya, Some(&w), &names).map_err(|e| match e {
            Error::Computation(msg) => {
                Error::Computation(format!("bias-adjustment regression: {msg}"))
            }
            other => other,
        })?;
        Ok(Self { coefficients: fit.coefficients })
    }

    fn predict(&self, z: &[f64]) -> f64 {
        self.coefficients[0] + z.iter().zip(&self.coefficients[1..]).map(|(a, b)| a * b).sum::<f64>()
    }
}

/// Matching estimates of the average treatment effects.
///
/// `x` holds one covariate row per unit. Returns one row per requested estimand and
/// variance kind; `t = estimate / SE` and `p = 2 (1 - Phi(|t|))`.
pub fn match_estimate(
    y: &[f64],
    treat: &[u8],
    x: &[Vec<f64>],
    config: &MatchConfig,
) -> Result<MatchingResult> {
    validate(y, treat, x, config)?;
    let n = y.len();
    let treated: Vec<usize> = (0..n).filter(|&i| treat[i] == 1).collect();
    let controls: Vec<usize> = (0..n).filter(|&i| treat[i] == 0).collect();
    if treated.is_empty() || controls.is_empty() {
        return Err(Error::Validation("need both treated and control observations".into()));
    }
    let metric = Metric::build(x, config.metric)?;

    let need_t = config.estimands.iter().any(|e| matches!(e, Estimand::Ate | Estimand::Att));
    let need_c = config.estimands.iter().any(|e| matches!(e, Estimand::Ate | Estimand::Atc));
    let treated_matches =
        if need_t { match_direction(&metric, x, &treated, &controls, config)? } else { Vec::new() };
    let control_matches =
        if need_c { match_direction(&metric, x, &controls, &treated, config)? } else { Vec::new() };

    // Treated units only collect weight from control focal units and vice versa.
    let mut k_w = vec![0.0; n];
    for set in treated_matches.iter().chain(&control_matches) {
        let share = 1.0 / set.matches.len() as f64;
        for &j in &set.matches {
            k_w[j] += share;
        }
    }
    log::debug!(
        "matched {} treated and {} control units (max reuse {:.2})",
        treated_matches.len(),
        control_matches.len(),
        k_w.iter().cloned().fold(0.0, f64::max)
    );

    let z: Option<&[Vec<f64>]> = match &config.bias_adjust {
        BiasAdjust::Off => None,
        BiasAdjust::Covariates => Some(x),
        BiasAdjust::Columns(z) => Some(z),
    };
    // mu_c is only needed when arm c serves as comparisons.
    let (mu1, mu0) = match z {
        Some(z) => (
            if need_c { Some(ArmRegression::fit(y, z, &treated, &k_w)?) } else { None },
            if need_t { Some(ArmRegression::fit(y, z, &controls, &k_w)?) } else { None },
        ),
        None => (None, None),
    };

    // Imputed potential outcomes; NaN marks "not imputed" and is never read.
    let mut y1 = vec![f64::NAN; n];
    let mut y0 = vec![f64::NAN; n];
    for &i in &treated {
        y1[i] = y[i];
    }
    for &i in &controls {
        y0[i] = y[i];
    }
    let impute = |set: &MatchSet, mu: Option<&ArmRegression>| -> f64 {
        let s: f64 = set
            .matches
            .iter()
            .map(|&j| match (mu, z) {
                (Some(mu), Some(z)) => y[j] + mu.predict(&z[set.focal]) - mu.predict(&z[j]),
                _ => y[j],
            })
            .sum();
        s / set.matches.len() as f64
    };
    for set in &treated_matches {
        y0[set.focal] = impute(set, mu0.as_ref());
    }
    for set in &control_matches {
        y1[set.focal] = impute(set, mu1.as_ref());
    }

    let sigma2_unit = match config.variance {
        VarianceMethod::Robust { matches } => {
            Some(robust_sigma2(y, x, treat, &metric, matches, config.ties)?)
        }
        VarianceMethod::Homoskedastic => None,
    };

    let m = config.m as f64;
    let all: Vec<usize> = (0..n).collect();
    let mut rows = Vec::with_capacity(config.estimands.len() * 2);
    for &estimand in &config.estimands {
        let focal: &[usize] = match estimand {
            Estimand::Ate => &all,
            Estimand::Att => &treated,
            Estimand::Atc => &controls,
        };
        let n_s = focal.len() as f64;
        let tau = focal.iter().map(|&i| y1[i] - y0[i]).sum::<f64>() / n_s;
        let hetero: f64 = focal.iter().map(|&i| (y1[i] - y0[i] - tau).powi(2)).sum();

        let sigma2 = |i: usize| -> f64 {
            match &sigma2_unit {
                Some(s) => s[i],
                None => hetero / (2.0 * n_s),
            }
        };

        let (v_sample, v_pop) = match estimand {
            Estimand::Ate => {
                let nn = n as f64;
                let vs: f64 = (0..n).map(|i| (1.0 + k_w[i]).powi(2) * sigma2(i)).sum::<f64>() / (nn * nn);
                let vp: f64 = (0..n)
                    .map(|i| {
                        (y1[i] - y0[i] - tau).powi(2)
                            + (k_w[i] * k_w[i] + (2.0 * m - 1.0) / m * k_w[i]) * sigma2(i)
                    })
                    .sum::<f64>()
                    / (nn * nn);
                (vs, vp)
            }
            Estimand::Att | Estimand::Atc => {
                let focal_arm = if estimand == Estimand::Att { 1 } else { 0 };
                let vs: f64 = (0..n)
                    .map(|i| {
                        let c = if treat[i] == focal_arm { 1.0 } else { -k_w[i] };
                        c * c * sigma2(i)
                    })
                    .sum::<f64>()
                    / (n_s * n_s);
                (vs, vs + hetero / (n_s * n_s))
            }
        };

        for kind in SampleKind::ALL {
            let v = match kind {
                SampleKind::Sample => v_sample,
                SampleKind::Population => v_pop,
            };
            if !(v.is_finite() && v > 0.0) {
                return Err(Error::Computation(format!(
                    "{estimand} {kind:?} variance is not positive ({v})"
                )));
            }
            rows.push(MatchingRow { estimand, sample: kind, estimate: normal_estimate(tau, v.sqrt())? });
        }
    }

    Ok(MatchingResult {
        rows,
        treated_matches,
        control_matches,
        match_weights: k_w,
        n_treated: treated.len(),
        n_control: controls.len(),
        m: config.m,
        metric: config.metric,
        bias_adjusted: z.is_some(),
    })
}

/// `sigma^2_i = J/(J+1) (Y_i - mean of the J nearest same-arm units)^2`.
fn robust_sigma2(
    y: &[f64],
    x: &[Vec<f64>],
    treat: &[u8],
    metric: &Metric,
    j: usize,
    ties: bool,
) -> Result<Vec<f64>> {
    if j == 0 {
        return Err(Error::Validation("robust variance needs at least one same-arm match".into()));
    }
    let n = y.len();
    let mut out = vec![0.0; n];
    for arm in [0u8, 1u8] {
        let units: Vec<usize> = (0..n).filter(|&i| treat[i] == arm).collect();
        if j >= units.len() {
            return Err(Error::Validation(format!(
                "robust variance needs {} same-arm neighbours but arm {} has only {} units",
                j,
                arm,
                units.len()
            )));
        }
        for &i in &units {
            let near = metric.nearest(x, i, &units, j, ties);
            let jj = near.len() as f64;
            let mean = near.iter().map(|(k, _)| y[*k]).sum::<f64>() / jj;
            out[i] = jj / (jj + 1.0) * (y[i] - mean).powi(2);
        }
    }
    Ok(out)
}
