//! Sandwich covariance estimators: heteroskedasticity-robust (HC0/HC1) and
//! Liang–Zeger cluster-robust.
//!
//! Both take the bread `A = (X'WX)^{-1}` (or the inverse Fisher information for a
//! GLM) and per-observation working residuals `u_i`, so that the score of
//! observation `i` is `x_i u_i`. For weighted least squares `u_i = w_i e_i`; for a
//! weighted logistic regression `u_i = w_i (y_i - p_i)`.
//!
//! # References
//!
//! - White (1980), "A heteroskedasticity-consistent covariance matrix estimator."
//! - Liang & Zeger (1986), "Longitudinal data analysis using generalized linear models."

use std::collections::HashMap;

use nalgebra::DMatrix;
use ps_core::{Error, Result};

/// Small-sample scaling for the heteroskedasticity-robust estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcType {
    /// No correction (White).
    Hc0,
    /// `n / (n - k)` correction (Stata `vce(robust)`).
    Hc1,
}

fn check_dims(x: &DMatrix<f64>, u: &[f64], bread: &DMatrix<f64>) -> Result<()> {
    if x.nrows() != u.len() {
        return Err(Error::Validation(format!(
            "residual length ({}) != n ({})",
            u.len(),
            x.nrows()
        )));
    }
    if bread.nrows() != x.ncols() || bread.ncols() != x.ncols() {
        return Err(Error::Validation("bread matrix must be k x k".into()));
    }
    Ok(())
}

/// Heteroskedasticity-robust covariance `A (Σ_i u_i² x_i x_i') A`.
///
/// `n_eff` is the number of observations entering the fit (rows with positive weight).
pub fn hc_covariance(
    x: &DMatrix<f64>,
    u: &[f64],
    bread: &DMatrix<f64>,
    hc: HcType,
    n_eff: usize,
) -> Result<DMatrix<f64>> {
    check_dims(x, u, bread)?;
    let k = x.ncols();

    let mut meat = DMatrix::zeros(k, k);
    for (i, &ui) in u.iter().enumerate() {
        if ui == 0.0 {
            continue;
        }
        let u2 = ui * ui;
        for a in 0..k {
            let xa = x[(i, a)] * u2;
            for b in 0..k {
                meat[(a, b)] += xa * x[(i, b)];
            }
        }
    }

    let scale = match hc {
        HcType::Hc0 => 1.0,
        HcType::Hc1 => {
            if n_eff <= k {
                return Err(Error::Computation(format!(
                    "HC1 needs n > k (n = {n_eff}, k = {k})"
                )));
            }
            n_eff as f64 / (n_eff - k) as f64
        }
    };
    Ok((bread * &meat) * bread * scale)
}

/// Liang–Zeger cluster-robust covariance.
///
/// `V_CR = c · A B A` where `B = Σ_g s_g s_g'`, `s_g = Σ_{i∈g} x_i u_i`, and the
/// small-sample correction is `c = G/(G-1) · (N-1)/(N-K)`.
///
/// Returns the covariance together with the number of clusters `G`.
pub fn cluster_robust_covariance(
    x: &DMatrix<f64>,
    u: &[f64],
    bread: &DMatrix<f64>,
    cluster_ids: &[u64],
    n_eff: usize,
) -> Result<(DMatrix<f64>, usize)> {
    check_dims(x, u, bread)?;
    if cluster_ids.len() != x.nrows() {
        return Err(Error::Validation(format!(
            "cluster_ids length ({}) != n ({})",
            cluster_ids.len(),
            x.nrows()
        )));
    }
    let k = x.ncols();

    // Clusters are visited in first-appearance order so the float sums are reproducible.
    let mut order: Vec<u64> = Vec::new();
    let mut cluster_map: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, &cid) in cluster_ids.iter().enumerate() {
        cluster_map
            .entry(cid)
            .or_insert_with(|| {
                order.push(cid);
                Vec::new()
            })
            .push(i);
    }
    let g = order.len();
    if g < 2 {
        return Err(Error::Computation(format!(
            "cluster-robust variance needs at least 2 clusters, found {g}"
        )));
    }

    let mut meat = DMatrix::zeros(k, k);
    let mut s_g = vec![0.0_f64; k];
    for cid in &order {
        s_g.iter_mut().for_each(|v| *v = 0.0);
        for &i in &cluster_map[cid] {
            let ui = u[i];
            for j in 0..k {
                s_g[j] += x[(i, j)] * ui;
            }
        }
        for a in 0..k {
            for b in 0..k {
                meat[(a, b)] += s_g[a] * s_g[b];
            }
        }
    }

    let g_f = g as f64;
    let n_f = n_eff as f64;
    let k_f = k as f64;
    let correction = if n_f > k_f { (g_f / (g_f - 1.0)) * ((n_f - 1.0) / (n_f - k_f)) } else { 1.0 };

    Ok(((bread * &meat) * bread * correction, g))
}

/// Standard errors from the diagonal of a covariance matrix.
///
/// A negative or non-finite diagonal is a numerical failure, reported as such.
pub fn std_errors(cov: &DMatrix<f64>) -> Result<Vec<f64>> {
    (0..cov.nrows())
        .map(|j| {
            let v = cov[(j, j)];
            if !v.is_finite() || v < 0.0 {
                Err(Error::Computation(format!("invalid variance {v} for coefficient {j}")))
            } else {
                Ok(v.sqrt())
            }
        })
        .collect()
}
