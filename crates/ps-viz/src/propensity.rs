//! Propensity-score distributions by treatment arm (numbers-first).
//!
//! Both artifacts take the scores of the analysis frame and the 0/1 treatment vector and
//! keep the treated arm first.

use ps_core::{Error, Result};
use ps_inference::stats::{quantile_sorted, sample_variance};
use serde::Serialize;

use crate::meta::ArtifactMeta;

const DENSITY_SCHEMA: &str = "pscore_propensity_density_v0";
const BOXPLOT_SCHEMA: &str = "pscore_propensity_boxplot_v0";

/// Histogram and kernel density of one arm.
#[derive(Debug, Clone, Serialize)]
pub struct ArmDensity {
    /// `"treated"` or `"control"`.
    pub arm: String,
    /// Units in the arm.
    pub n: usize,
    /// Histogram counts per bin.
    pub counts: Vec<usize>,
    /// `counts / (n * bin_width)`.
    pub density: Vec<f64>,
    /// Gaussian KDE bandwidth.
    pub bandwidth: f64,
    /// KDE evaluated on `kde_x`.
    pub kde_y: Vec<f64>,
}

/// Histogram + KDE artifact on [0, 1].
#[derive(Debug, Clone, Serialize)]
pub struct PropensityDensityArtifact {
    /// Schema tag.
    pub schema_version: String,
    /// Provenance.
    pub meta: ArtifactMeta,
    /// `bins + 1` equally spaced edges from 0 to 1.
    pub bin_edges: Vec<f64>,
    /// KDE grid.
    pub kde_x: Vec<f64>,
    /// Treated arm, then control arm.
    pub arms: Vec<ArmDensity>,
}

/// Five-number summary with Tukey whiskers.
#[derive(Debug, Clone, Serialize)]
pub struct ArmBoxplot {
    /// `"treated"` or `"control"`.
    pub arm: String,
    /// Units in the arm.
    pub n: usize,
    /// Minimum.
    pub min: f64,
    /// First quartile.
    pub q1: f64,
    /// Median.
    pub median: f64,
    /// Third quartile.
    pub q3: f64,
    /// Maximum.
    pub max: f64,
    /// Smallest value within `q1 - 1.5 IQR`.
    pub whisker_lo: f64,
    /// Largest value within `q3 + 1.5 IQR`.
    pub whisker_hi: f64,
    /// Values beyond the whiskers, ascending.
    pub outliers: Vec<f64>,
}

/// Side-by-side boxplots of the scores.
#[derive(Debug, Clone, Serialize)]
pub struct PropensityBoxplotArtifact {
    /// Schema tag.
    pub schema_version: String,
    /// Provenance.
    pub meta: ArtifactMeta,
    /// Treated arm, then control arm.
    pub arms: Vec<ArmBoxplot>,
}

fn split_scores(scores: &[f64], treat: &[u8]) -> Result<[(&'static str, Vec<f64>); 2]> {
    if scores.len() != treat.len() {
        return Err(Error::Validation(format!(
            "scores ({}) and treatment ({}) differ in length",
            scores.len(),
            treat.len()
        )));
    }
    let mut treated = Vec::new();
    let mut control = Vec::new();
    for (i, (&e, &t)) in scores.iter().zip(treat).enumerate() {
        if !(e > 0.0 && e < 1.0) {
            return Err(Error::Validation(format!(
                "propensity score must lie in (0, 1), got {e} at row {}",
                i + 1
            )));
        }
        match t {
            1 => treated.push(e),
            0 => control.push(e),
            other => {
                return Err(Error::Validation(format!("treatment must be 0/1, got {other}")));
            }
        }
    }
    if treated.is_empty() || control.is_empty() {
        return Err(Error::Validation("both treatment arms must be non-empty".into()));
    }
    Ok([("treated", treated), ("control", control)])
}

/// Silverman's rule of thumb, `0.9 * min(sd, IQR / 1.34) * n^(-1/5)`.
///
/// Falls back to `sd`, then `|x_0|`, then 1 when the spread estimate is zero.
fn silverman_bandwidth(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let sd = sample_variance(values).sqrt();
    let iqr = quantile_sorted(&sorted, 0.75) - quantile_sorted(&sorted, 0.25);
    let mut lo = sd.min(iqr / 1.34);
    if lo <= 0.0 {
        lo = if sd > 0.0 {
            sd
        } else if values[0].abs() > 0.0 {
            values[0].abs()
        } else {
            1.0
        };
    }
    0.9 * lo * (values.len() as f64).powf(-0.2)
}

fn gaussian_kde(values: &[f64], grid: &[f64], h: f64) -> Result<Vec<f64>> {
    let n = values.len() as f64;
    grid.iter()
        .map(|&x| {
            let mut s = 0.0;
            for &v in values {
                s += ps_prob::normal::pdf(x, v, h)?;
            }
            Ok(s / n)
        })
        .collect()
}

impl PropensityDensityArtifact {
    /// Histogram with `bins` equal-width bins on [0, 1] and a Gaussian KDE evaluated at
    /// `grid` equally spaced points on [0, 1], separately per arm.
    pub fn build(scores: &[f64], treat: &[u8], bins: usize, grid: usize) -> Result<Self> {
        if bins == 0 {
            return Err(Error::Validation("bins must be >= 1".into()));
        }
        if grid < 2 {
            return Err(Error::Validation("grid must have at least 2 points".into()));
        }
        let arms_in = split_scores(scores, treat)?;
        let width = 1.0 / bins as f64;
        let bin_edges: Vec<f64> = (0..=bins).map(|b| b as f64 * width).collect();
        let kde_x: Vec<f64> = (0..grid).map(|g| g as f64 / (grid - 1) as f64).collect();

        let mut arms = Vec::with_capacity(2);
        for (label, values) in arms_in {
            let mut counts = vec![0usize; bins];
            for &e in &values {
                let b = ((e / width).floor() as usize).min(bins - 1);
                counts[b] += 1;
            }
            let n = values.len();
            let density = counts.iter().map(|&c| c as f64 / (n as f64 * width)).collect();
            let bandwidth = silverman_bandwidth(&values);
            let kde_y = gaussian_kde(&values, &kde_x, bandwidth)?;
            arms.push(ArmDensity { arm: label.to_string(), n, counts, density, bandwidth, kde_y });
        }

        Ok(Self {
            schema_version: DENSITY_SCHEMA.to_string(),
            meta: ArtifactMeta::now()?,
            bin_edges,
            kde_x,
            arms,
        })
    }
}

fn boxplot(label: &str, mut values: Vec<f64>) -> ArmBoxplot {
    values.sort_by(f64::total_cmp);
    let q1 = quantile_sorted(&values, 0.25);
    let q3 = quantile_sorted(&values, 0.75);
    let iqr = q3 - q1;
    let (lo_fence, hi_fence) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);
    let inside: Vec<f64> =
        values.iter().copied().filter(|&v| v >= lo_fence && v <= hi_fence).collect();
    // Non-empty: the order statistics around the median lie within the fences.
    let whisker_lo = inside.first().copied().unwrap_or(q1);
    let whisker_hi = inside.last().copied().unwrap_or(q3);
    let outliers = values.iter().copied().filter(|&v| v < lo_fence || v > hi_fence).collect();
    ArmBoxplot {
        arm: label.to_string(),
        n: values.len(),
        min: values[0],
        q1,
        median: quantile_sorted(&values, 0.5),
        q3,
        max: values[values.len() - 1],
        whisker_lo,
        whisker_hi,
        outliers,
    }
}

impl PropensityBoxplotArtifact {
    /// Per-arm quartiles (R type 7), Tukey whiskers and outliers.
    pub fn build(scores: &[f64], treat: &[u8]) -> Result<Self> {
        let arms = split_scores(scores, treat)?
            .into_iter()
            .map(|(label, values)| boxplot(label, values))
            .collect();
        Ok(Self { schema_version: BOXPLOT_SCHEMA.to_string(), meta: ArtifactMeta::now()?, arms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> (Vec<f64>, Vec<u8>) {
        let scores: Vec<f64> = (0..60).map(|i| 0.05 + 0.9 * ((i * 37) % 60) as f64 / 59.0).collect();
        let treat: Vec<u8> = scores.iter().map(|&e| u8::from(e > 0.4)).collect();
        (scores, treat)
    }

    #[test]
    fn test_histogram_counts_and_density_integrate() {
        let (s, t) = sample();
        let a = PropensityDensityArtifact::build(&s, &t, 10, 101).unwrap();
        assert_eq!(a.bin_edges.len(), 11);
        assert_eq!(a.arms[0].arm, "treated");
        let n_t = t.iter().filter(|&&x| x == 1).count();
        assert_eq!(a.arms[0].n, n_t);
        assert_eq!(a.arms[0].counts.iter().sum::<usize>(), n_t);
        for arm in &a.arms {
            let area: f64 = arm.density.iter().map(|d| d * 0.1).sum();
            assert_relative_eq!(area, 1.0, epsilon = 1e-12);
            assert!(arm.bandwidth > 0.0);
            assert_eq!(arm.kde_y.len(), 101);
            assert!(arm.kde_y.iter().all(|&y| y >= 0.0 && y.is_finite()));
        }
    }

    #[test]
    fn test_kde_mass_mostly_on_unit_interval() {
        let (s, t) = sample();
        let a = PropensityDensityArtifact::build(&s, &t, 5, 401).unwrap();
        let dx = 1.0 / 400.0;
        for arm in &a.arms {
            let trap: f64 = arm.kde_y.windows(2).map(|w| 0.5 * (w[0] + w[1]) * dx).sum();
            assert!(trap > 0.8 && trap <= 1.0 + 1e-9, "{} mass={trap}", arm.arm);
        }
    }

    #[test]
    fn test_silverman_constant_sample_falls_back() {
        let h = silverman_bandwidth(&[0.3, 0.3, 0.3, 0.3]);
        assert_relative_eq!(h, 0.9 * 0.3 * 4f64.powf(-0.2), epsilon = 1e-12);
    }

    #[test]
    fn test_boxplot_whiskers_and_outliers() {
        let mut scores = vec![0.40, 0.42, 0.44, 0.46, 0.48, 0.50, 0.52, 0.99];
        let mut treat = vec![1u8; 8];
        scores.extend([0.2, 0.3, 0.25]);
        treat.extend([0, 0, 0]);
        let b = PropensityBoxplotArtifact::build(&scores, &treat).unwrap();
        let tr = &b.arms[0];
        assert_eq!(tr.n, 8);
        assert_relative_eq!(tr.median, 0.47, epsilon = 1e-12);
        assert_eq!(tr.outliers, vec![0.99]);
        assert_relative_eq!(tr.whisker_hi, 0.52, epsilon = 1e-12);
        assert_relative_eq!(tr.whisker_lo, 0.40, epsilon = 1e-12);
        assert_relative_eq!(tr.max, 0.99, epsilon = 1e-12);
        assert!(b.arms[1].outliers.is_empty());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(PropensityBoxplotArtifact::build(&[0.2, 1.0], &[0, 1]).is_err());
        assert!(PropensityBoxplotArtifact::build(&[0.2, 0.3], &[1, 1]).is_err());
        assert!(PropensityDensityArtifact::build(&[0.2, 0.3], &[0, 1], 0, 10).is_err());
        assert!(PropensityDensityArtifact::build(&[0.2, 0.3], &[0, 1], 4, 1).is_err());
    }
}
