//! Small descriptive-statistics helpers shared by the balance and propensity modules.

/// Arithmetic mean (NaN for an empty slice).
pub fn mean(v: &[f64]) -> f64 {
    v.iter().sum::<f64>() / v.len() as f64
}

/// Weighted mean `sum w x / sum w`.
pub fn weighted_mean(v: &[f64], w: &[f64]) -> f64 {
    let sw: f64 = w.iter().sum();
    v.iter().zip(w).map(|(x, wi)| x * wi).sum::<f64>() / sw
}

/// Sample variance with `n - 1` denominator (0 for fewer than two values).
pub fn sample_variance(v: &[f64]) -> f64 {
    if v.len() < 2 {
        return 0.0;
    }
    let m = mean(v);
    v.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (v.len() - 1) as f64
}

/// Quantile of a sorted slice by linear interpolation (R type 7).
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let frac = pos - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}
