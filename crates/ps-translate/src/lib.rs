//! # ps-translate
//!
//! Input translation for pscore.
//!
//! Supports:
//! - delimited text (CSV/TSV) with metadata comment lines and NA tokens
//! - fixed analysis schemas (treatment, outcome, covariates, cluster, propensity)
//! - complete-case analysis frames with factor expansion for model design matrices

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod delimited;
pub mod frame;
pub mod schema;
pub mod table;

pub use delimited::{CsvOptions, read_csv, read_csv_from_reader};
pub use frame::{AnalysisFrame, Covariate, CovariateValues};
pub use schema::{CovariateKind, CovariateSpec, TableSchema};
pub use table::{Column, ObservationTable};
