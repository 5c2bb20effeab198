//! Small numerically-stable math utilities used across probability code.

use ps_core::{Error, Result};

/// Stable `log(1 + exp(x))`.
///
/// Branchless: `log(1+exp(x)) = max(x,0) + log(1+exp(-|x|))`.
#[inline]
pub fn log1pexp(x: f64) -> f64 {
    let abs_x = x.abs();
    let e = (-abs_x).exp(); // always in (0, 1], no overflow
    x.max(0.0) + e.ln_1p()
}

/// Stable sigmoid: `1 / (1 + exp(-x))`.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    let abs_x = x.abs();
    let e = (-abs_x).exp();
    let recip = 1.0 / (1.0 + e);
    // x >= 0: sigmoid = 1/(1+exp(-x)) = recip
    // x <  0: sigmoid = exp(x)/(1+exp(x)) = e/(1+e) = e*recip
    if x >= 0.0 { recip } else { e * recip }
}

/// Log-odds `ln(p / (1 - p))` for `p` strictly inside (0, 1).
pub fn logit(p: f64) -> Result<f64> {
    if !(p > 0.0 && p < 1.0) {
        return Err(Error::Validation(format!("logit requires p in (0, 1), got {p}")));
    }
    Ok((p / (1.0 - p)).ln())
}

/// Bernoulli deviance contribution `-2 [y*eta - log(1+exp(eta))]` of one
/// observation with label `y` (0/1) and linear predictor `eta`.
#[inline]
pub fn bernoulli_deviance(y: f64, eta: f64) -> f64 {
    -2.0 * (y * eta - log1pexp(eta))
}
