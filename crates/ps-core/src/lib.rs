//! # ps-core
//!
//! Core types shared by every pscore crate:
//! - the [`Error`] / [`Result`] pair used by all library code
//! - estimator result records ([`Estimate`], [`Estimand`], [`SampleKind`])
//! - the [`PropensityModel`] trait implemented by the propensity-score models

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::PropensityModel;
pub use types::{Estimand, Estimate, SampleKind};
