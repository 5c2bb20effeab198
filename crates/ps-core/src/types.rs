//! Common data types for pscore

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Target population of a treatment-effect estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Estimand {
    /// Average treatment effect over the whole sample.
    Ate,
    /// Average treatment effect for the treated.
    Att,
    /// Average treatment effect for the controls.
    Atc,
}

impl Estimand {
    /// All estimands in reporting order.
    pub const ALL: [Estimand; 3] = [Estimand::Ate, Estimand::Att, Estimand::Atc];

    /// Upper-case label used in tables.
    pub fn label(self) -> &'static str {
        match self {
            Estimand::Ate => "ATE",
            Estimand::Att => "ATT",
            Estimand::Atc => "ATC",
        }
    }
}

impl fmt::Display for Estimand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Estimand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ate" => Ok(Estimand::Ate),
            "att" => Ok(Estimand::Att),
            "atc" => Ok(Estimand::Atc),
            other => Err(Error::Validation(format!(
                "unknown estimand '{other}' (expected ate, att or atc)"
            ))),
        }
    }
}

/// Which variance a matching estimator reports.
///
/// `Sample` conditions on the observed covariates (SATE/SATT/SATC),
/// `Population` adds the heterogeneity of the conditional effect (PATE/PATT/PATC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    /// Sample (conditional) variance.
    Sample,
    /// Population variance.
    Population,
}

impl SampleKind {
    /// Both kinds in reporting order.
    pub const ALL: [SampleKind; 2] = [SampleKind::Sample, SampleKind::Population];
}

/// One reported estimate with its Wald-type test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    /// Point estimate.
    pub estimate: f64,
    /// Standard error.
    pub std_error: f64,
    /// Test statistic (`estimate / std_error`).
    pub statistic: f64,
    /// Two-sided p-value.
    pub p_value: f64,
}

impl Estimate {
    /// Build an estimate from its parts. `statistic` is recomputed from
    /// `estimate / std_error`; the caller supplies the matching p-value.
    pub fn new(estimate: f64, std_error: f64, p_value: f64) -> Result<Self> {
        if !estimate.is_finite() {
            return Err(Error::Computation(format!("estimate is not finite ({estimate})")));
        }
        if !std_error.is_finite() || std_error <= 0.0 {
            return Err(Error::Computation(format!(
                "standard error must be finite and > 0, got {std_error}"
            )));
        }
        if !(0.0..=1.0).contains(&p_value) {
            return Err(Error::Computation(format!("p-value out of [0, 1]: {p_value}")));
        }
        Ok(Self { estimate, std_error, statistic: estimate / std_error, p_value })
    }
}
