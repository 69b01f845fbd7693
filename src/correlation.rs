/// Outcome-split correlation heuristic.
///
/// Members are split at the median of `values`; the result is the success
/// rate of the upper half minus the success rate of the rest, so it lies in
/// [-1, 1]. `None` when every value sits on one side of the split. This is a
/// ratio heuristic, not a Pearson coefficient.
pub fn outcome_split(values: &[f64], successes: &[bool]) -> Option<f64> {
    if values.len() != successes.len() || values.len() < 2 { return None; }
    let median = median(values)?;
    let (mut hi, mut hi_ok, mut lo, mut lo_ok) = (0usize, 0usize, 0usize, 0usize);
    for (v, ok) in values.iter().zip(successes) {
        if *v > median {
            hi += 1;
            if *ok { hi_ok += 1; }
        } else {
            lo += 1;
            if *ok { lo_ok += 1; }
        }
    }
    if hi == 0 || lo == 0 { return None; }
    let strength = (hi_ok as f64 / hi as f64) - (lo_ok as f64 / lo as f64);
    Some(strength.clamp(-1.0, 1.0))
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() { return None; }
    let mut xs = values.to_vec();
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = xs.len() / 2;
    if xs.len() % 2 == 0 {
        Some((xs[mid - 1] + xs[mid]) / 2.0)
    } else {
        Some(xs[mid])
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() { return None; }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}
