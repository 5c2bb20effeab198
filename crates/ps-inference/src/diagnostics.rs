//! Breusch–Pagan tests for heteroskedasticity of linear-model residuals.
//!
//! The auxiliary regression is `u ~ 1 + z`:
//! - [`BpVariant::Koenker`] (studentized, `lmtest::bptest` default): `u = e^2`,
//!   statistic `n R^2`.
//! - [`BpVariant::Original`] (Breusch & Pagan 1979, Stata `hettest`): `u = e^2 / (RSS/n)`,
//!   statistic `ESS / 2`.
//!
//! Under homoskedasticity both are chi-squared with `df` = number of auxiliary regressors.
//! For weighted fits the residuals are scaled by `sqrt(w)` and zero-weight rows are skipped.

use ps_core::{Error, Result};
use ps_translate::Covariate;
use serde::{Deserialize, Serialize};

use crate::regression::{LinearFit, ols_fit};

/// Breusch–Pagan statistic flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BpVariant {
    /// Koenker's studentized `n R^2`.
    #[default]
    Koenker,
    /// Original score statistic `ESS / 2` (assumes normal errors).
    Original,
}

/// One Breusch–Pagan test.
#[derive(Debug, Clone, Serialize)]
pub struct BreuschPaganResult {
    /// Covariate (or comma-joined covariates) tested.
    pub covariate: String,
    /// Test statistic.
    pub statistic: f64,
    /// Chi-squared degrees of freedom.
    pub df: usize,
    /// Upper-tail p-value.
    pub p_value: f64,
    /// Statistic flavour.
    pub variant: BpVariant,
}

/// Test whether the squared residuals of `fit` vary with the single column `z`.
pub fn breusch_pagan(
    fit: &LinearFit,
    name: &str,
    z: &[f64],
    variant: BpVariant,
) -> Result<BreuschPaganResult> {
    breusch_pagan_joint(fit, &[name.to_string()], &[z.to_vec()], variant)
        .map(|mut r| {
            r.covariate = name.to_string();
            r
        })
}

/// Test all `z_columns` jointly (`df = z_columns.len()`).
pub fn breusch_pagan_joint(
    fit: &LinearFit,
    names: &[String],
    z_columns: &[Vec<f64>],
    variant: BpVariant,
) -> Result<BreuschPaganResult> {
    if z_columns.is_empty() {
        return Err(Error::Validation("Breusch-Pagan needs at least one covariate".into()));
    }
    if names.len() != z_columns.len() {
        return Err(Error::Validation(format!(
            "expected {} covariate names, got {}",
            z_columns.len(),
            names.len()
        )));
    }
    let n_rows = fit.n_rows();
    for (name, z) in names.iter().zip(z_columns) {
        if z.len() != n_rows {
            return Err(Error::Validation(format!(
                "covariate '{}' has {} rows, model has {}",
                name,
                z.len(),
                n_rows
            )));
        }
    }

    let keep: Vec<usize> = (0..n_rows).filter(|&i| fit.weights()[i] > 0.0).collect();
    let n = keep.len() as f64;
    for (name, z) in names.iter().zip(z_columns) {
        let first = z[keep[0]];
        if keep.iter().all(|&i| z[i] == first) {
            return Err(Error::Computation(format!(
                "covariate '{name}' is constant; Breusch-Pagan auxiliary regression is undefined"
            )));
        }
    }

    let e2: Vec<f64> = keep
        .iter()
        .map(|&i| {
            let e = fit.residuals[i];
            fit.weights()[i] * e * e
        })
        .collect();
    let sigma2 = e2.iter().sum::<f64>() / n;
    if !(sigma2 > 0.0) {
        return Err(Error::Computation(
            "residuals are identically zero; Breusch-Pagan is undefined".into(),
        ));
    }
    let u: Vec<f64> = match variant {
        BpVariant::Koenker => e2,
        BpVariant::Original => e2.iter().map(|v| v / sigma2).collect(),
    };
    let rows: Vec<Vec<f64>> =
        keep.iter().map(|&i| z_columns.iter().map(|z| z[i]).collect()).collect();

    let aux = ols_fit(&rows, &u, None, names).map_err(|e| match e {
        Error::Computation(msg) => Error::Computation(format!(
            "Breusch-Pagan auxiliary regression on {}: {msg}",
            names.join(", ")
        )),
        other => other,
    })?;

    let statistic = match variant {
        BpVariant::Koenker => n * aux.r_squared,
        BpVariant::Original => 0.5 * (aux.tss - aux.rss),
    }
    .max(0.0);
    let df = z_columns.len();
    let p_value = ps_prob::chi_squared::sf(statistic, df as f64)?;

    Ok(BreuschPaganResult { covariate: names.join(","), statistic, df, p_value, variant })
}

/// One independent test per covariate. Factors are tested jointly over their indicator
/// columns, so their `df` is the number of non-reference levels.
pub fn breusch_pagan_table(
    fit: &LinearFit,
    covariates: &[Covariate],
    variant: BpVariant,
) -> Result<Vec<BreuschPaganResult>> {
    covariates
        .iter()
        .map(|cov| {
            let (names, cols): (Vec<String>, Vec<Vec<f64>>) =
                cov.design_columns().into_iter().unzip();
            if cols.is_empty() {
                return Err(Error::Computation(format!(
                    "covariate '{}' has a single level; Breusch-Pagan is undefined",
                    cov.name
                )));
            }
            let mut r = breusch_pagan_joint(fit, &names, &cols, variant)?;
            r.covariate = cov.name.clone();
            Ok(r)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_translate::CovariateValues;

    /// y = 1 + x + e with |e| growing in x.
    fn hetero_fit() -> (LinearFit, Vec<f64>) {
        let n = 200;
        let x: Vec<f64> = (0..n).map(|i| i as f64 / n as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, &xi)| {
                let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
                1.0 + xi + sign * (0.05 + 2.0 * xi) * (1.0 + 0.3 * ((i * 7) % 5) as f64)
            })
            .collect();
        let rows: Vec<Vec<f64>> = x.iter().map(|&v| vec![v]).collect();
        (ols_fit(&rows, &y, None, &["x".to_string()]).unwrap(), x)
    }

    #[test]
    fn test_koenker_detects_variance_trend() {
        let (fit, x) = hetero_fit();
        let r = breusch_pagan(&fit, "x", &x, BpVariant::Koenker).unwrap();
        assert_eq!(r.df, 1);
        assert_eq!(r.covariate, "x");
        assert!(r.statistic > 10.0, "statistic={}", r.statistic);
        assert!(r.p_value < 0.01);
    }

    #[test]
    fn test_koenker_matches_manual_n_r2() {
        let (fit, x) = hetero_fit();
        let e2: Vec<f64> = fit.residuals.iter().map(|e| e * e).collect();
        let rows: Vec<Vec<f64>> = x.iter().map(|&v| vec![v]).collect();
        let aux = ols_fit(&rows, &e2, None, &["x".to_string()]).unwrap();
        let r = breusch_pagan(&fit, "x", &x, BpVariant::Koenker).unwrap();
        assert!((r.statistic - 200.0 * aux.r_squared).abs() < 1e-9);
        let p = ps_prob::chi_squared::sf(r.statistic, 1.0).unwrap();
        assert!((r.p_value - p).abs() < 1e-15);
    }

    #[test]
    fn test_original_variant_is_half_ess() {
        let (fit, x) = hetero_fit();
        let n = fit.n_obs as f64;
        let s2 = fit.rss / n;
        let u: Vec<f64> = fit.residuals.iter().map(|e| e * e / s2).collect();
        let rows: Vec<Vec<f64>> = x.iter().map(|&v| vec![v]).collect();
        let aux = ols_fit(&rows, &u, None, &["x".to_string()]).unwrap();
        let r = breusch_pagan(&fit, "x", &x, BpVariant::Original).unwrap();
        assert!((r.statistic - 0.5 * (aux.tss - aux.rss)).abs() < 1e-9);
    }

    #[test]
    fn test_constant_covariate_is_error() {
        let (fit, x) = hetero_fit();
        let c = vec![3.0; x.len()];
        let err = breusch_pagan(&fit, "c", &c, BpVariant::Koenker).unwrap_err();
        assert!(matches!(err, Error::Computation(_)), "{err}");
    }

    #[test]
    fn test_table_factor_df() {
        let (fit, x) = hetero_fit();
        let codes: Vec<u32> = (0..x.len()).map(|i| (i % 3) as u32).collect();
        let covs = vec![
            Covariate { name: "x".into(), values: CovariateValues::Continuous(x.clone()) },
            Covariate {
                name: "grp".into(),
                values: CovariateValues::Categorical {
                    codes,
                    levels: vec!["a".into(), "b".into(), "c".into()],
                },
            },
        ];
        let table = breusch_pagan_table(&fit, &covs, BpVariant::Koenker).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].df, 1);
        assert_eq!(table[1].df, 2);
        assert_eq!(table[1].covariate, "grp");
        for r in &table {
            assert!(r.statistic >= 0.0);
            assert!((0.0..=1.0).contains(&r.p_value));
        }
    }
}
