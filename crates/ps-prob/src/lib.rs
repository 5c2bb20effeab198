//! Probability building blocks for pscore.
//!
//! This crate hosts the reusable probability math used across the workspace:
//! - small numeric helpers (stable log/exp/sigmoid primitives)
//! - tail probabilities for the Normal, Student-t and chi-squared reference
//!   distributions used by Wald and score tests

pub mod chi_squared;
pub mod math;
pub mod normal;
pub mod student_t;
