//! Wald tests attached to point estimates.

use ps_core::{Error, Estimate, Result};

/// Large-sample z test: `p = 2 (1 - Phi(|est / se|))`.
pub fn normal_estimate(estimate: f64, std_error: f64) -> Result<Estimate> {
    check_se(std_error)?;
    Estimate::new(estimate, std_error, ps_prob::normal::two_sided_p_value(estimate / std_error))
}

/// Student-t test with `df` degrees of freedom.
pub fn t_estimate(estimate: f64, std_error: f64, df: f64) -> Result<Estimate> {
    check_se(std_error)?;
    let p = ps_prob::student_t::two_sided_p_value(estimate / std_error, df)?;
    Estimate::new(estimate, std_error, p)
}

fn check_se(std_error: f64) -> Result<()> {
    if !std_error.is_finite() || std_error <= 0.0 {
        return Err(Error::Computation(format!(
            "standard error must be finite and > 0, got {std_error}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_estimate_p_value() {
        let e = normal_estimate(1.959963984540054, 1.0).unwrap();
        assert!((e.p_value - 0.05).abs() < 1e-9, "p={}", e.p_value);
        assert!((e.statistic - 1.959963984540054).abs() < 1e-15);
    }

    #[test]
    fn test_t_estimate_is_wider_than_normal() {
        let z = normal_estimate(2.0, 1.0).unwrap();
        let t = t_estimate(2.0, 1.0, 10.0).unwrap();
        assert!(t.p_value > z.p_value);
    }

    #[test]
    fn test_zero_se_is_error() {
        assert!(normal_estimate(1.0, 0.0).is_err());
        assert!(t_estimate(1.0, f64::NAN, 5.0).is_err());
    }
}
