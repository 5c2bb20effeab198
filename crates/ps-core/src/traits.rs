//! Core traits for pscore
//!
//! Propensity-score consumers (weighting, balance checks, reporting) only need
//! "give me P(T=1 | X) for every row"; they do not depend on whether the scores
//! come from a logistic regression or a boosted ensemble.

use crate::Result;

/// A classifier that estimates treatment-assignment probabilities.
pub trait PropensityModel: Send + Sync {
    /// Fit the model on `treat` (0/1) and row-wise covariates `x`, and return one
    /// propensity score per row, in input order. Scores lie in (0, 1).
    fn propensity_scores(&self, treat: &[u8], x: &[Vec<f64>]) -> Result<Vec<f64>>;

    /// Model name (e.g. "logistic", "gbm")
    fn name(&self) -> &str;
}
