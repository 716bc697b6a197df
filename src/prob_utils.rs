use num::{Float, NumCast};

/// Normalize a ln-transformed unnormalized prob distro in place
///
/// On return the slice holds linear-space probabilities summing to 1.
///
/// Returns the index of the most probable component, or None for empty input
///
pub fn normalize_ln_distro<F: Float>(x: &mut [F]) -> Option<usize> {
    if x.is_empty() {
        return None;
    }

    let mut max_index = 0;
    let mut max_p = *x.first().unwrap();
    for (index, p) in x.iter().skip(1).enumerate() {
        if *p > max_p {
            max_p = *p;
            max_index = index + 1;
        }
    }

    let mut sum = NumCast::from(0).unwrap();
    for p in x.iter_mut() {
        *p = (*p - max_p).exp();
        sum = sum + *p;
    }

    for p in x.iter_mut() {
        *p = *p / sum;
    }

    Some(max_index)
}

/// ln(exp(a) + exp(b)) without leaving ln space
///
pub fn ln_sum_exp_pair(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY && b == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}
