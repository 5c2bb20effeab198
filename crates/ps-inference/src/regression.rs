//! Linear (OLS / WLS) and logistic (IRLS) regression with coefficient tables.
//!
//! Both fitters always prepend an intercept named `(Intercept)` to the row-major
//! covariate design. Weights are optional; zero weights drop a row from the fit
//! without removing it from the residual/fitted vectors.

use nalgebra::{DMatrix, DVector};
use ps_core::{Error, Estimate, Result};
use ps_prob::math::{bernoulli_deviance, sigmoid};
use serde::Serialize;

use crate::estimate::{normal_estimate, t_estimate};
use crate::robust::{HcType, cluster_robust_covariance, hc_covariance, std_errors};

/// Name of the intercept term in every coefficient table.
pub const INTERCEPT: &str = "(Intercept)";

/// Eigenvalue ratio below which a (column-equilibrated) Gram matrix is treated as singular.
const SINGULAR_TOL: f64 = 1e-12;

fn validate_rows(x_rows: &[Vec<f64>], n: usize, names: &[String]) -> Result<usize> {
    if n == 0 {
        return Err(Error::Validation("X/y must be non-empty".to_string()));
    }
    if x_rows.len() != n {
        return Err(Error::Validation(format!(
            "X has wrong number of rows: expected n={}, got {}",
            n,
            x_rows.len()
        )));
    }
    let p = x_rows[0].len();
    if names.len() != p {
        return Err(Error::Validation(format!(
            "expected {} covariate names, got {}",
            p,
            names.len()
        )));
    }
    for (i, row) in x_rows.iter().enumerate() {
        if row.len() != p {
            return Err(Error::Validation(format!(
                "X must be rectangular: row {} has len {}, expected {}",
                i,
                row.len(),
                p
            )));
        }
        if row.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation("X must contain only finite values".to_string()));
        }
    }
    Ok(p)
}

fn validate_weights(weights: Option<&[f64]>, n: usize) -> Result<Vec<f64>> {
    let Some(w) = weights else {
        return Ok(vec![1.0; n]);
    };
    if w.len() != n {
        return Err(Error::Validation(format!(
            "weights have wrong length: expected n={}, got {}",
            n,
            w.len()
        )));
    }
    if w.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(Error::Validation("weights must be finite and >= 0".to_string()));
    }
    if !w.iter().any(|v| *v > 0.0) {
        return Err(Error::Validation("at least one weight must be > 0".to_string()));
    }
    Ok(w.to_vec())
}

/// Intercept-augmented design `[1, X]`.
fn design_with_intercept(x_rows: &[Vec<f64>], p: usize) -> DMatrix<f64> {
    DMatrix::from_fn(x_rows.len(), p + 1, |i, j| if j == 0 { 1.0 } else { x_rows[i][j - 1] })
}

/// `X' diag(w) X`.
fn weighted_gram(x: &DMatrix<f64>, w: &[f64]) -> DMatrix<f64> {
    let k = x.ncols();
    let mut g = DMatrix::zeros(k, k);
    for (i, &wi) in w.iter().enumerate() {
        if wi == 0.0 {
            continue;
        }
        for a in 0..k {
            let xa = x[(i, a)] * wi;
            for b in a..k {
                g[(a, b)] += xa * x[(i, b)];
            }
        }
    }
    for a in 0..k {
        for b in 0..a {
            g[(a, b)] = g[(b, a)];
        }
    }
    g
}

/// Invert a symmetric positive semi-definite Gram matrix.
///
/// Columns are equilibrated to unit diagonal first so the condition check does
/// not depend on covariate units. Collinear or all-zero columns are a
/// [`Error::Computation`].
pub(crate) fn invert_gram(a: &DMatrix<f64>, what: &str) -> Result<DMatrix<f64>> {
    let k = a.nrows();
    let mut scale = Vec::with_capacity(k);
    for j in 0..k {
        let d = a[(j, j)];
        if !(d.is_finite() && d > 0.0) {
            return Err(Error::Computation(format!(
                "{what} is singular: design column {j} is identically zero"
            )));
        }
        scale.push(1.0 / d.sqrt());
    }
    let scaled = DMatrix::from_fn(k, k, |i, j| a[(i, j)] * scale[i] * scale[j]);
    let eig = scaled.clone().symmetric_eigenvalues();
    let (lo, hi) = eig.iter().fold((f64::INFINITY, 0.0_f64), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if !(lo > hi * SINGULAR_TOL) {
        return Err(Error::Computation(format!(
            "{what} is singular (collinear design columns)"
        )));
    }
    let chol = scaled
        .cholesky()
        .ok_or_else(|| Error::Computation(format!("{what}: Cholesky factorization failed")))?;
    let inv = chol.inverse();
    Ok(DMatrix::from_fn(k, k, |i, j| inv[(i, j)] * scale[i] * scale[j]))
}

fn term_names(names: &[String]) -> Vec<String> {
    std::iter::once(INTERCEPT.to_string()).chain(names.iter().cloned()).collect()
}

// ---------------------------------------------------------------------------
// Coefficient tables
// ---------------------------------------------------------------------------

/// Variance estimator for a linear-model coefficient table.
#[derive(Debug, Clone, Copy)]
pub enum CovarianceKind<'a> {
    /// `sigma^2 (X'WX)^{-1}`.
    Classical,
    /// White heteroskedasticity-robust, no small-sample correction.
    Hc0,
    /// White with `n/(n-k)` (Stata `robust`).
    Hc1,
    /// Liang–Zeger cluster-robust over the given ids (one per row).
    Cluster(&'a [u64]),
}

impl CovarianceKind<'_> {
    fn label(&self) -> &'static str {
        match self {
            CovarianceKind::Classical => "classical",
            CovarianceKind::Hc0 => "HC0",
            CovarianceKind::Hc1 => "HC1",
            CovarianceKind::Cluster(_) => "cluster",
        }
    }
}

/// One coefficient and its Wald test.
#[derive(Debug, Clone, Serialize)]
pub struct CoefficientRow {
    /// Term name (`(Intercept)`, covariate, or `factor[level]`).
    pub term: String,
    /// Estimate, standard error, statistic and p-value.
    #[serde(flatten)]
    pub estimate: Estimate,
}

/// Coefficient table of a fitted model.
#[derive(Debug, Clone, Serialize)]
pub struct CoefficientTable {
    /// Rows in design order, intercept first.
    pub rows: Vec<CoefficientRow>,
    /// Variance estimator used (`classical`, `HC0`, `HC1`, `cluster`, `model`, `sandwich`).
    pub covariance: String,
    /// Reference distribution: `t` or `normal`.
    pub distribution: String,
    /// Degrees of freedom for `t` tests.
    pub df: Option<f64>,
    /// Number of clusters when clustered.
    pub n_clusters: Option<usize>,
}

impl CoefficientTable {
    /// Row for `term`.
    pub fn get(&self, term: &str) -> Result<&CoefficientRow> {
        self.rows
            .iter()
            .find(|r| r.term == term)
            .ok_or_else(|| Error::Validation(format!("term '{term}' not in coefficient table")))
    }
}

// ---------------------------------------------------------------------------
// Linear regression
// ---------------------------------------------------------------------------

/// Result of [`ols_fit`].
#[derive(Debug, Clone, Serialize)]
pub struct LinearFit {
    /// Term names, intercept first.
    pub names: Vec<String>,
    /// Coefficients in term order.
    pub coefficients: Vec<f64>,
    /// Fitted values for every row.
    pub fitted: Vec<f64>,
    /// Residuals `y - fitted` for every row.
    pub residuals: Vec<f64>,
    /// Weighted residual sum of squares.
    pub rss: f64,
    /// Weighted total sum of squares around the weighted mean.
    pub tss: f64,
    /// `1 - rss/tss` (0 when `y` is constant).
    pub r_squared: f64,
    /// Rows with positive weight.
    pub n_obs: usize,
    /// `n_obs - k`.
    pub dof_resid: usize,
    #[serde(skip)]
    weights: Vec<f64>,
    #[serde(skip)]
    design: DMatrix<f64>,
    #[serde(skip)]
    xtwx_inv: DMatrix<f64>,
}

/// Least squares of `y` on `[1, X]`, weighted when `weights` is given.
///
/// `names` labels the columns of `x_rows` (an intercept is always added).
pub fn ols_fit(
    x_rows: &[Vec<f64>],
    y: &[f64],
    weights: Option<&[f64]>,
    names: &[String],
) -> Result<LinearFit> {
    let n = y.len();
    let p = validate_rows(x_rows, n, names)?;
    if y.iter().any(|v| !v.is_finite()) {
        return Err(Error::Validation("y must contain only finite values".to_string()));
    }
    let w = validate_weights(weights, n)?;

    let x = design_with_intercept(x_rows, p);
    let k = p + 1;
    let n_obs = w.iter().filter(|&&v| v > 0.0).count();
    if n_obs < k {
        return Err(Error::Computation(format!(
            "OLS needs at least {k} observations with positive weight, got {n_obs}"
        )));
    }

    let xtwx_inv = invert_gram(&weighted_gram(&x, &w), "X'WX")?;
    let mut xtwy = DVector::zeros(k);
    for i in 0..n {
        if w[i] == 0.0 {
            continue;
        }
        for j in 0..k {
            xtwy[j] += x[(i, j)] * w[i] * y[i];
        }
    }
    let beta = &xtwx_inv * xtwy;
    let fitted_v = &x * &beta;
    let fitted: Vec<f64> = fitted_v.iter().copied().collect();
    let residuals: Vec<f64> = y.iter().zip(&fitted).map(|(yi, fi)| yi - fi).collect();

    let sw: f64 = w.iter().sum();
    let ybar = w.iter().zip(y).map(|(wi, yi)| wi * yi).sum::<f64>() / sw;
    let rss: f64 = w.iter().zip(&residuals).map(|(wi, e)| wi * e * e).sum();
    let tss: f64 = w.iter().zip(y).map(|(wi, yi)| wi * (yi - ybar) * (yi - ybar)).sum();
    let r_squared = if tss > 0.0 { 1.0 - rss / tss } else { 0.0 };

    Ok(LinearFit {
        names: term_names(names),
        coefficients: beta.iter().copied().collect(),
        fitted,
        residuals,
        rss,
        tss,
        r_squared,
        n_obs,
        dof_resid: n_obs - k,
        weights: w,
        design: x,
        xtwx_inv,
    })
}

impl LinearFit {
    /// Number of rows passed to the fit (including zero-weight rows).
    pub fn n_rows(&self) -> usize {
        self.residuals.len()
    }

    /// `(X'WX)^{-1}`.
    pub fn xtwx_inv(&self) -> &DMatrix<f64> {
        &self.xtwx_inv
    }

    /// Row weights used by the fit (all ones for OLS).
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Residual variance `rss / (n - k)`.
    pub fn sigma2(&self) -> Result<f64> {
        if self.dof_resid == 0 {
            return Err(Error::Computation(
                "residual variance undefined: no residual degrees of freedom".to_string(),
            ));
        }
        Ok(self.rss / self.dof_resid as f64)
    }

    /// Coefficient covariance under `kind`, with the degrees of freedom for t tests
    /// and the number of clusters when clustered.
    pub fn covariance(&self, kind: CovarianceKind<'_>) -> Result<(DMatrix<f64>, f64, Option<usize>)> {
        let u: Vec<f64> = self.weights.iter().zip(&self.residuals).map(|(w, e)| w * e).collect();
        match kind {
            CovarianceKind::Classical => {
                Ok((&self.xtwx_inv * self.sigma2()?, self.dof_resid as f64, None))
            }
            CovarianceKind::Hc0 | CovarianceKind::Hc1 => {
                if self.dof_resid == 0 {
                    return Err(Error::Computation(
                        "robust variance undefined: no residual degrees of freedom".to_string(),
                    ));
                }
                let hc = if matches!(kind, CovarianceKind::Hc0) { HcType::Hc0 } else { HcType::Hc1 };
                let v = hc_covariance(&self.design, &u, &self.xtwx_inv, hc, self.n_obs)?;
                Ok((v, self.dof_resid as f64, None))
            }
            CovarianceKind::Cluster(ids) => {
                if ids.len() != self.n_rows() {
                    return Err(Error::Validation(format!(
                        "cluster ids have wrong length: expected {}, got {}",
                        self.n_rows(),
                        ids.len()
                    )));
                }
                let keep: Vec<usize> = (0..self.n_rows()).filter(|&i| self.weights[i] > 0.0).collect();
                let x = self.design.select_rows(keep.iter());
                let u: Vec<f64> = keep.iter().map(|&i| u[i]).collect();
                let ids: Vec<u64> = keep.iter().map(|&i| ids[i]).collect();
                let (v, g) = cluster_robust_covariance(&x, &u, &self.xtwx_inv, &ids, self.n_obs)?;
                Ok((v, (g - 1) as f64, Some(g)))
            }
        }
    }

    /// Coefficient table with Student-t tests.
    ///
    /// Degrees of freedom are `n - k` for classical and HC variances, `G - 1` when clustered.
    pub fn coefficient_table(&self, kind: CovarianceKind<'_>) -> Result<CoefficientTable> {
        let (cov, df, n_clusters) = self.covariance(kind)?;
        let se = std_errors(&cov)?;
        let rows = self
            .names
            .iter()
            .zip(self.coefficients.iter().zip(&se))
            .map(|(term, (&b, &s))| {
                let estimate = t_estimate(b, s, df).map_err(|e| match e {
                    Error::Computation(msg) => Error::Computation(format!("{term}: {msg}")),
                    other => other,
                })?;
                Ok(CoefficientRow { term: term.clone(), estimate })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CoefficientTable {
            rows,
            covariance: kind.label().to_string(),
            distribution: "t".to_string(),
            df: Some(df),
            n_clusters,
        })
    }
}

// ---------------------------------------------------------------------------
// Logistic regression
// ---------------------------------------------------------------------------

/// IRLS controls for [`logistic_fit`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LogisticConfig {
    /// Maximum Newton iterations.
    pub max_iter: usize,
    /// Relative deviance change for convergence: `|dev - dev_old| / (|dev| + 0.1) < tol`.
    pub tol: f64,
    /// Fitted probabilities closer than this to 0 or 1 signal separation.
    pub separation_eps: f64,
}

impl Default for LogisticConfig {
    fn default() -> Self {
        Self { max_iter: 25, tol: 1e-8, separation_eps: 1e-10 }
    }
}

/// Result of [`logistic_fit`].
#[derive(Debug, Clone, Serialize)]
pub struct LogisticFit {
    /// Term names, intercept first.
    pub names: Vec<String>,
    /// Coefficients on the log-odds scale.
    pub coefficients: Vec<f64>,
    /// Fitted probabilities for every row.
    pub fitted: Vec<f64>,
    /// Weighted residual deviance.
    pub deviance: f64,
    /// Weighted deviance of the intercept-only model.
    pub null_deviance: f64,
    /// IRLS iterations used.
    pub iterations: usize,
    /// Rows with positive weight.
    pub n_obs: usize,
    #[serde(skip)]
    design: DMatrix<f64>,
    #[serde(skip)]
    info_inv: DMatrix<f64>,
    #[serde(skip)]
    score_resid: Vec<f64>,
}

/// Weighted logistic regression of binary `y` on `[1, X]` by iteratively reweighted
/// least squares.
///
/// Fails with [`Error::Computation`] under (quasi-)complete separation and with
/// [`Error::Convergence`] when `max_iter` is reached.
pub fn logistic_fit(
    x_rows: &[Vec<f64>],
    y: &[u8],
    weights: Option<&[f64]>,
    names: &[String],
    config: &LogisticConfig,
) -> Result<LogisticFit> {
    let n = y.len();
    let p = validate_rows(x_rows, n, names)?;
    if y.iter().any(|&v| v != 0 && v != 1) {
        return Err(Error::Validation("y must contain only 0/1 values".to_string()));
    }
    if config.max_iter == 0 || !(config.tol > 0.0) {
        return Err(Error::Validation("max_iter must be >= 1 and tol > 0".to_string()));
    }
    let w = validate_weights(weights, n)?;
    let x = design_with_intercept(x_rows, p);
    let k = p + 1;
    let n_obs = w.iter().filter(|&&v| v > 0.0).count();
    let yf: Vec<f64> = y.iter().map(|&v| v as f64).collect();

    // Start as glm.fit does: mu = (w y + 0.5) / (w + 1).
    let mut eta: Vec<f64> = w
        .iter()
        .zip(&yf)
        .map(|(wi, yi)| {
            let mu = (wi * yi + 0.5) / (wi + 1.0);
            (mu / (1.0 - mu)).ln()
        })
        .collect();
    let deviance_of = |eta: &[f64]| -> f64 {
        (0..n).filter(|&i| w[i] > 0.0).map(|i| w[i] * bernoulli_deviance(yf[i], eta[i])).sum()
    };
    let mut dev_old = deviance_of(&eta);
    let mut beta = DVector::zeros(k);
    let mut converged = false;
    let mut iterations = 0;

    for iter in 1..=config.max_iter {
        iterations = iter;
        let mut irls_w = vec![0.0; n];
        let mut xtwz = DVector::zeros(k);
        for i in 0..n {
            if w[i] == 0.0 {
                continue;
            }
            let mu = sigmoid(eta[i]);
            let var = (mu * (1.0 - mu)).max(f64::MIN_POSITIVE);
            let z = eta[i] + (yf[i] - mu) / var;
            irls_w[i] = w[i] * var;
            for j in 0..k {
                xtwz[j] += x[(i, j)] * irls_w[i] * z;
            }
        }
        let info_inv = invert_gram(&weighted_gram(&x, &irls_w), "logistic information matrix")
            .map_err(|e| match e {
                Error::Computation(msg) => Error::Computation(format!(
                    "{msg}; the treatment may be perfectly separated by the covariates"
                )),
                other => other,
            })?;
        beta = info_inv * xtwz;
        let eta_new = &x * &beta;
        eta.iter_mut().zip(eta_new.iter()).for_each(|(e, v)| *e = *v);
        let dev = deviance_of(&eta);
        if !dev.is_finite() {
            return Err(Error::Computation("logistic deviance is not finite".to_string()));
        }
        log::debug!("irls iter {iter}: deviance {dev:.10}");
        if (dev - dev_old).abs() / (dev.abs() + 0.1) < config.tol {
            converged = true;
            dev_old = dev;
            break;
        }
        dev_old = dev;
    }

    if !converged {
        return Err(Error::Convergence(format!(
            "logistic regression did not converge in {} iterations",
            config.max_iter
        )));
    }

    let fitted: Vec<f64> = eta.iter().map(|&e| sigmoid(e)).collect();
    let separated = (0..n).filter(|&i| w[i] > 0.0).any(|i| {
        fitted[i] < config.separation_eps || fitted[i] > 1.0 - config.separation_eps
    });
    if separated {
        return Err(Error::Computation(
            "fitted probabilities numerically 0 or 1: (quasi-)complete separation".to_string(),
        ));
    }

    let mut irls_w = vec![0.0; n];
    for i in 0..n {
        irls_w[i] = w[i] * fitted[i] * (1.0 - fitted[i]);
    }
    let info_inv = invert_gram(&weighted_gram(&x, &irls_w), "logistic information matrix")?;
    let score_resid: Vec<f64> = (0..n).map(|i| w[i] * (yf[i] - fitted[i])).collect();

    let sw: f64 = w.iter().sum();
    let ybar = w.iter().zip(&yf).map(|(wi, yi)| wi * yi).sum::<f64>() / sw;
    let null_deviance = if ybar > 0.0 && ybar < 1.0 {
        let eta0 = (ybar / (1.0 - ybar)).ln();
        (0..n).filter(|&i| w[i] > 0.0).map(|i| w[i] * bernoulli_deviance(yf[i], eta0)).sum()
    } else {
        0.0
    };

    Ok(LogisticFit {
        names: term_names(names),
        coefficients: beta.iter().copied().collect(),
        fitted,
        deviance: dev_old,
        null_deviance,
        iterations,
        n_obs,
        design: x,
        info_inv,
        score_resid,
    })
}

impl LogisticFit {
    /// Coefficient covariance: inverse Fisher information, or the HC0 sandwich when `robust`.
    pub fn covariance(&self, robust: bool) -> Result<DMatrix<f64>> {
        if robust {
            hc_covariance(&self.design, &self.score_resid, &self.info_inv, HcType::Hc0, self.n_obs)
        } else {
            Ok(self.info_inv.clone())
        }
    }

    /// Coefficient table with z tests.
    pub fn coefficient_table(&self, robust: bool) -> Result<CoefficientTable> {
        let se = std_errors(&self.covariance(robust)?)?;
        let rows = self
            .names
            .iter()
            .zip(self.coefficients.iter().zip(&se))
            .map(|(term, (&b, &s))| {
                Ok(CoefficientRow { term: term.clone(), estimate: normal_estimate(b, s)? })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CoefficientTable {
            rows,
            covariance: if robust { "sandwich" } else { "model" }.to_string(),
            distribution: "normal".to_string(),
            df: None,
            n_clusters: None,
        })
    }

    /// `exp(coefficient)` in term order.
    pub fn odds_ratios(&self) -> Vec<f64> {
        self.coefficients.iter().map(|b| b.exp()).collect()
    }

    /// Predicted probabilities for new covariate rows (no intercept column).
    pub fn predict(&self, x_rows: &[Vec<f64>]) -> Result<Vec<f64>> {
        let p = self.coefficients.len() - 1;
        x_rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                if row.len() != p {
                    return Err(Error::Validation(format!(
                        "row {} has len {}, expected {}",
                        i,
                        row.len(),
                        p
                    )));
                }
                let eta = self.coefficients[0]
                    + row.iter().zip(&self.coefficients[1..]).map(|(x, b)| x * b).sum::<f64>();
                Ok(sigmoid(eta))
            })
            .collect()
    }
}
