//! Love plot: absolute standardized differences per covariate, before and after adjustment.

use ps_core::{Error, Result};
use ps_inference::SmdRow;
use serde::Serialize;

use crate::meta::ArtifactMeta;

const LOVE_SCHEMA: &str = "pscore_love_plot_v0";

/// One covariate of the love plot.
#[derive(Debug, Clone, Serialize)]
pub struct LoveEntry {
    /// Design column.
    pub covariate: String,
    /// SMD of the raw sample.
    pub smd_before: f64,
    /// SMD after weighting or matching.
    pub smd_after: f64,
    /// `smd_after < threshold`.
    pub balanced_after: bool,
}

/// Plot-friendly love plot artifact.
#[derive(Debug, Clone, Serialize)]
pub struct LovePlotArtifact {
    /// Schema tag.
    pub schema_version: String,
    /// Provenance.
    pub meta: ArtifactMeta,
    /// Reference line.
    pub threshold: f64,
    /// Entries sorted by `smd_before`, largest first.
    pub entries: Vec<LoveEntry>,
    /// Covariate labels aligned with `before` / `after`.
    pub covariates: Vec<String>,
    /// SMD before adjustment.
    pub before: Vec<f64>,
    /// SMD after adjustment.
    pub after: Vec<f64>,
    /// Mean of `before`.
    pub mean_before: f64,
    /// Mean of `after`.
    pub mean_after: f64,
}

impl LovePlotArtifact {
    /// Pair two SMD tables over the same covariates (matched by name, in any order).
    pub fn build(before: &[SmdRow], after: &[SmdRow], threshold: f64) -> Result<Self> {
        if !(threshold.is_finite() && threshold > 0.0) {
            return Err(Error::Validation(format!("threshold must be > 0, got {threshold}")));
        }
        if before.is_empty() {
            return Err(Error::Validation("love plot needs at least one covariate".into()));
        }
        if before.len() != after.len() {
            return Err(Error::Validation(format!(
                "before has {} covariates, after has {}",
                before.len(),
                after.len()
            )));
        }

        let mut entries = before
            .iter()
            .map(|b| {
                let a = after.iter().find(|a| a.covariate == b.covariate).ok_or_else(|| {
                    Error::Validation(format!("covariate '{}' missing after adjustment", b.covariate))
                })?;
                Ok(LoveEntry {
                    covariate: b.covariate.clone(),
                    smd_before: b.smd,
                    smd_after: a.smd,
                    balanced_after: a.smd < threshold,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by(|x, y| y.smd_before.total_cmp(&x.smd_before));

        let covariates = entries.iter().map(|e| e.covariate.clone()).collect();
        let before_v: Vec<f64> = entries.iter().map(|e| e.smd_before).collect();
        let after_v: Vec<f64> = entries.iter().map(|e| e.smd_after).collect();
        let k = entries.len() as f64;

        Ok(Self {
            schema_version: LOVE_SCHEMA.to_string(),
            meta: ArtifactMeta::now()?,
            threshold,
            mean_before: before_v.iter().sum::<f64>() / k,
            mean_after: after_v.iter().sum::<f64>() / k,
            entries,
            covariates,
            before: before_v,
            after: after_v,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, smd: f64) -> SmdRow {
        SmdRow {
            covariate: name.to_string(),
            mean_treated: 0.0,
            mean_control: 0.0,
            sd: 1.0,
            smd,
            balanced: smd < 0.1,
        }
    }

    #[test]
    fn test_pairs_by_name_and_sorts() {
        let before = vec![row("age", 0.15), row("income", 0.4), row("sex[m]", 0.05)];
        let after = vec![row("sex[m]", 0.02), row("age", 0.12), row("income", 0.03)];
        let a = LovePlotArtifact::build(&before, &after, 0.1).unwrap();
        assert_eq!(a.covariates, vec!["income", "age", "sex[m]"]);
        assert_eq!(a.after, vec![0.03, 0.12, 0.02]);
        assert!(!a.entries[1].balanced_after);
        assert!((a.mean_before - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_mismatched_tables() {
        let before = vec![row("age", 0.15)];
        assert!(LovePlotArtifact::build(&before, &[row("sex", 0.1)], 0.1).is_err());
        assert!(LovePlotArtifact::build(&before, &[], 0.1).is_err());
        assert!(LovePlotArtifact::build(&before, &before, 0.0).is_err());
    }
}
