//! # ps-inference
//!
//! Propensity-score inference for pscore.
//!
//! This crate provides:
//! - Weighted least squares and logistic regression with classical, HC and cluster-robust errors
//! - Breusch-Pagan heteroskedasticity tests
//! - Nearest-neighbour matching estimators (ATE/ATT/ATC, sample and population variance)
//! - Gradient-boosted propensity scores and inverse-probability weights
//! - Weighted outcome regression and covariate balance checks
//!
//! ## Architecture
//!
//! Estimators take plain slices (`&[u8]` treatment, `&[f64]` outcome, row-major covariates).
//! Building those from a table is the job of `ps-translate`; rendering belongs to `ps-viz`.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Standardized differences, balance regressions and per-arm summaries.
pub mod balance;
/// Breusch-Pagan tests on a fitted linear model.
pub mod diagnostics;
/// `Estimate` constructors for z and t tests.
pub mod estimate;
/// Bernoulli gradient boosting with regression trees.
pub mod gbm;
/// Nearest-neighbour matching estimators.
pub mod matching;
/// Propensity models, stopping rules and overlap summaries.
pub mod propensity;
/// Linear and logistic regression fits.
pub mod regression;
/// Sandwich covariance estimators.
pub mod robust;
/// Synthetic observational datasets.
pub mod simulate;
/// Small descriptive statistics helpers.
pub mod stats;
/// Propensity-weighted outcome regression.
pub mod weighting;
/// Inverse-probability weights.
pub mod weights;

pub use balance::{
    BalanceModel, BalanceRegression, GroupSummary, SmdConfig, SmdDenominator, SmdRow,
    balance_regressions, group_summaries, mean_abs_smd, standardized_differences,
};
pub use diagnostics::{BpVariant, BreuschPaganResult, breusch_pagan, breusch_pagan_table};
pub use gbm::{GbmConfig, GbmFit, fit_gbm};
pub use matching::{
    BiasAdjust, DistanceMetric, MatchConfig, MatchingResult, VarianceMethod, match_estimate,
};
pub use propensity::{
    GbmPropensity, GbmPropensityFit, LogisticPropensity, OverlapSummary, StopMethod,
    overlap_summary,
};
pub use regression::{
    CoefficientTable, CovarianceKind, LinearFit, LogisticConfig, LogisticFit, logistic_fit,
    ols_fit,
};
pub use simulate::{SimulationConfig, generate_dataset};
pub use weighting::{WeightedRegressionResult, WeightedVariance, weighted_outcome_regression};
pub use weights::{effective_sample_size, ipw_weights};
