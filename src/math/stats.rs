/// Min-max rescaling of a coordinate vector to [-1, 1]; a constant vector maps to 0
pub fn minmax_scale(values: &[f64]) -> Vec<f32> {
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    values
        .iter()
        .map(|&v| {
            if range > 0.0 {
                (2.0 * (v - min) / range - 1.0) as f32
            } else {
                0.0
            }
        })
        .collect()
}

/// Mean of the finite values, `None` if there are none
pub fn nanmean(values: &[f64]) -> Option<f64> {
    let (sum, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, c), &v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Root mean square difference over pairs where both values are finite
pub fn rms_difference(a: &[f64], b: &[f64]) -> Option<f64> {
    let sq: Vec<f64> = a
        .iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .collect();
    nanmean(&sq).map(f64::sqrt)
}
