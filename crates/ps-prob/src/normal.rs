//! Normal distribution utilities.

use ps_core::{Error, Result};
use statrs::function::erf::erfc;

/// Natural log of `sqrt(2π)`.
const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// Standard Normal CDF `Φ(z)`.
#[inline]
pub fn cdf(z: f64) -> f64 {
    0.5 * erfc(-z / std::f64::consts::SQRT_2)
}

/// Density of `N(mu, sigma)` at `x`.
pub fn pdf(x: f64, mu: f64, sigma: f64) -> Result<f64> {
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(Error::Validation(format!("sigma must be finite and > 0, got {}", sigma)));
    }
    let z = (x - mu) / sigma;
    Ok((-0.5 * z * z - sigma.ln() - LN_SQRT_2PI).exp())
}

/// Two-sided p-value of a standard-normal test statistic: `2 * (1 - Φ(|z|))`.
///
/// Evaluated as `erfc(|z| / √2)` so that large `|z|` does not cancel to zero early.
#[inline]
pub fn two_sided_p_value(z: f64) -> f64 {
    erfc(z.abs() / std::f64::consts::SQRT_2).clamp(0.0, 1.0)
}
