//! Chi-squared upper tail, used by score tests (Breusch-Pagan).

use ps_core::{Error, Result};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Survival function `P(X > x)` for `X ~ χ²(df)`.
pub fn sf(x: f64, df: f64) -> Result<f64> {
    if !df.is_finite() || df <= 0.0 {
        return Err(Error::Validation(format!("df must be finite and > 0, got {}", df)));
    }
    if !x.is_finite() || x < 0.0 {
        return Err(Error::Computation(format!(
            "chi-squared statistic must be finite and >= 0, got {}",
            x
        )));
    }
    let dist = ChiSquared::new(df)
        .map_err(|e| Error::Computation(format!("ChiSquared(df={df}): {e}")))?;
    Ok(dist.sf(x).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_df1_critical_value() {
        // 3.841459 is the 95% quantile of χ²(1)
        assert_relative_eq!(sf(3.841_458_820_694_124, 1.0).unwrap(), 0.05, epsilon = 1e-9);
    }

    #[test]
    fn test_df2_closed_form() {
        // χ²(2) is Exp(1/2): sf(x) = exp(-x/2)
        for x in [0.0, 0.5, 2.0, 7.3] {
            assert_relative_eq!(sf(x, 2.0).unwrap(), (-x / 2.0).exp(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_invalid() {
        assert!(sf(-1.0, 1.0).is_err());
        assert!(sf(1.0, 0.0).is_err());
        assert!(sf(f64::NAN, 1.0).is_err());
    }
}
