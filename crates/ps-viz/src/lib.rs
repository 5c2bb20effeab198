//! # ps-viz
//!
//! Visualization data artifacts for pscore.
//!
//! This crate is intentionally dependency-light and focuses on emitting
//! plot-friendly JSON structures (arrays instead of nested objects).

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Love plot artifacts (standardized differences before/after adjustment).
pub mod love;

/// Shared artifact metadata.
pub mod meta;

/// Propensity-score distribution artifacts (histogram, KDE, boxplot).
pub mod propensity;

pub use love::{LoveEntry, LovePlotArtifact};
pub use meta::ArtifactMeta;
pub use propensity::{
    ArmBoxplot, ArmDensity, PropensityBoxplotArtifact, PropensityDensityArtifact,
};
