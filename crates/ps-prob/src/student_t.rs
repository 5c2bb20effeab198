//! Student-t reference distribution for regression t tests.

use ps_core::{Error, Result};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Two-sided p-value `2 * P(T_df > |t|)`.
pub fn two_sided_p_value(t: f64, df: f64) -> Result<f64> {
    if !df.is_finite() || df <= 0.0 {
        return Err(Error::Validation(format!("df must be finite and > 0, got {}", df)));
    }
    if t.is_nan() {
        return Err(Error::Computation("t statistic is NaN".into()));
    }
    let dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| Error::Computation(format!("StudentsT(df={df}): {e}")))?;
    Ok((2.0 * dist.sf(t.abs())).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cauchy_quartile() {
        // df=1 is Cauchy: P(|T| > 1) = 0.5
        let p = two_sided_p_value(1.0, 1.0).unwrap();
        assert!((p - 0.5).abs() < 1e-10);
    }

    #[test]
    fn test_large_df_approaches_normal() {
        let p_t = two_sided_p_value(1.96, 1e6).unwrap();
        let p_z = crate::normal::two_sided_p_value(1.96);
        assert!((p_t - p_z).abs() < 1e-5);
    }

    #[test]
    fn test_invalid_params() {
        assert!(two_sided_p_value(1.0, 0.0).is_err());
        assert!(two_sided_p_value(f64::NAN, 5.0).is_err());
    }
}
