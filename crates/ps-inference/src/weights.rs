//! Inverse-probability weights from propensity scores.
//!
//! | estimand | treated (`t = 1`) | control (`t = 0`) |
//! |----------|-------------------|-------------------|
//! | ATE      | `1 / e`           | `1 / (1 - e)`     |
//! | ATT      | `1`               | `e / (1 - e)`     |
//! | ATC      | `(1 - e) / e`     | `1`               |

use ps_core::{Error, Estimand, Result};

/// Weight of one unit with propensity `e` and treatment `t`.
pub fn ipw_weight(e: f64, t: u8, estimand: Estimand) -> Result<f64> {
    if !(e > 0.0 && e < 1.0) {
        return Err(Error::Validation(format!("propensity score must lie in (0, 1), got {e}")));
    }
    let w = match (estimand, t) {
        (Estimand::Ate, 1) => 1.0 / e,
        (Estimand::Ate, 0) => 1.0 / (1.0 - e),
        (Estimand::Att, 1) => 1.0,
        (Estimand::Att, 0) => e / (1.0 - e),
        (Estimand::Atc, 1) => (1.0 - e) / e,
        (Estimand::Atc, 0) => 1.0,
        (_, other) => {
            return Err(Error::Validation(format!("treatment must be 0/1, got {other}")));
        }
    };
    Ok(w)
}

/// Weights for every unit.
pub fn ipw_weights(scores: &[f64], treat: &[u8], estimand: Estimand) -> Result<Vec<f64>> {
    if scores.len() != treat.len() {
        return Err(Error::Validation(format!(
            "scores ({}) and treatment ({}) differ in length",
            scores.len(),
            treat.len()
        )));
    }
    scores
        .iter()
        .zip(treat)
        .enumerate()
        .map(|(i, (&e, &t))| {
            ipw_weight(e, t, estimand).map_err(|err| match err {
                Error::Validation(msg) => Error::Validation(format!("row {}: {msg}", i + 1)),
                other => other,
            })
        })
        .collect()
}

/// Kish effective sample size `(sum w)^2 / sum w^2`.
pub fn effective_sample_size(weights: &[f64]) -> f64 {
    let s: f64 = weights.iter().sum();
    let s2: f64 = weights.iter().map(|w| w * w).sum();
    if s2 > 0.0 { s * s / s2 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_half_propensity() {
        let scores = vec![0.5; 6];
        let treat = vec![1, 0, 1, 0, 0, 1];
        let ate = ipw_weights(&scores, &treat, Estimand::Ate).unwrap();
        assert!(ate.iter().all(|&w| (w - 2.0).abs() < 1e-15));
        let att = ipw_weights(&scores, &treat, Estimand::Att).unwrap();
        assert!(att.iter().all(|&w| (w - 1.0).abs() < 1e-15));
        let atc = ipw_weights(&scores, &treat, Estimand::Atc).unwrap();
        assert!(atc.iter().all(|&w| (w - 1.0).abs() < 1e-15));
    }

    #[test]
    fn test_rejects_boundary_scores_and_bad_treatment() {
        assert!(ipw_weight(0.0, 1, Estimand::Ate).is_err());
        assert!(ipw_weight(1.0, 0, Estimand::Att).is_err());
        assert!(ipw_weight(f64::NAN, 0, Estimand::Att).is_err());
        assert!(ipw_weight(0.3, 2, Estimand::Ate).is_err());
        let err = ipw_weights(&[0.2, 1.2], &[0, 1], Estimand::Ate).unwrap_err();
        assert!(err.to_string().contains("row 2"), "{err}");
        assert!(ipw_weights(&[0.2], &[0, 1], Estimand::Ate).is_err());
    }

    #[test]
    fn test_effective_sample_size() {
        assert!((effective_sample_size(&[1.0; 10]) - 10.0).abs() < 1e-12);
        assert!((effective_sample_size(&[10.0, 0.0, 0.0]) - 1.0).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_att_weight_is_one_for_treated(e in 1e-6f64..(1.0 - 1e-6)) {
            prop_assert_eq!(ipw_weight(e, 1, Estimand::Att).unwrap(), 1.0);
        }

        #[test]
        fn prop_weights_finite_and_non_negative(e in 1e-6f64..(1.0 - 1e-6), t in 0u8..=1) {
            for est in Estimand::ALL {
                let w = ipw_weight(e, t, est).unwrap();
                prop_assert!(w.is_finite() && w >= 0.0);
            }
        }

        #[test]
        fn prop_ate_control_times_e_is_att_control(e in 1e-6f64..(1.0 - 1e-6)) {
            let ate = ipw_weight(e, 0, Estimand::Ate).unwrap();
            let att = ipw_weight(e, 0, Estimand::Att).unwrap();
            prop_assert!((ate * e - att).abs() <= 1e-12 * att.max(1.0));
        }
    }
}
