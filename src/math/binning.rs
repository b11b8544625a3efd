use ndarray::Array2;

/// Minimum observation error variance of a grid cell after binning
pub const SIGMA2_MIN: f64 = 0.2 * 0.2;

/// Result of [`bin_analysis`], all arrays indexed `[lon, lat]`
#[derive(Debug, Clone)]
pub struct BinAnalysis {
    /// Weighted mean per cell, NaN where no observation falls
    pub mean: Array2<f32>,
    /// Sum of value times inverse variance
    pub weighted_sum: Array2<f32>,
    /// Sum of inverse variances
    pub inv_sigma2: Array2<f32>,
}

/// Nearest grid cell of a position on a regular grid, `None` outside it
fn nearest_cell(lon: &[f64], lat: &[f64], x: f64, y: f64) -> Option<(usize, usize)> {
    if lon.len() < 2 || lat.len() < 2 {
        return None;
    }
    let i = ((x - lon[0]) / (lon[1] - lon[0])).round_ties_even();
    let j = ((y - lat[0]) / (lat[1] - lat[0])).round_ties_even();
    if i >= 0.0 && (i as usize) < lon.len() && j >= 0.0 && (j as usize) < lat.len() {
        Some((i as usize, j as usize))
    } else {
        None
    }
}

/// Accumulate observations with inverse error variance `inv_sigma2` on the
/// nearest cell of a regular grid.
///
/// Cells where the accumulated inverse variance exceeds `1 / sigma2_min` are
/// scaled down so that their error variance is at least `sigma2_min`.
pub fn bin_analysis(
    obs_lon: &[f64],
    obs_lat: &[f64],
    value: &[f64],
    inv_sigma2: &[f64],
    lon: &[f64],
    lat: &[f64],
    sigma2_min: f64,
) -> BinAnalysis {
    let shape = (lon.len(), lat.len());
    let mut msum = Array2::<f64>::zeros(shape);
    let mut minv = Array2::<f64>::zeros(shape);

    for k in 0..value.len() {
        if let Some((i, j)) = nearest_cell(lon, lat, obs_lon[k], obs_lat[k]) {
            msum[[i, j]] += value[k] * inv_sigma2[k];
            minv[[i, j]] += inv_sigma2[k];
        }
    }

    ndarray::Zip::from(&mut msum).and(&mut minv).for_each(|s, w| {
        let alpha = (1.0 / (*w * sigma2_min)).min(1.0);
        *s *= alpha;
        *w *= alpha;
    });

    let mean = ndarray::Zip::from(&msum)
        .and(&minv)
        .map_collect(|&s, &w| if w > 0.0 { (s / w) as f32 } else { f32::NAN });

    BinAnalysis {
        mean,
        weighted_sum: msum.mapv(|v| v as f32),
        inv_sigma2: minv.mapv(|v| v as f32),
    }
}

/// Plain average of the observations falling on each cell, NaN where empty
pub fn bin_average(obs_lon: &[f64], obs_lat: &[f64], value: &[f64], lon: &[f64], lat: &[f64]) -> Array2<f32> {
    let shape = (lon.len(), lat.len());
    let mut sum = Array2::<f64>::zeros(shape);
    let mut count = Array2::<usize>::zeros(shape);

    for k in 0..value.len() {
        if let Some((i, j)) = nearest_cell(lon, lat, obs_lon[k], obs_lat[k]) {
            sum[[i, j]] += value[k];
            count[[i, j]] += 1;
        }
    }

    ndarray::Zip::from(&sum)
        .and(&count)
        .map_collect(|&s, &c| if c > 0 { (s / c as f64) as f32 } else { f32::NAN })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_average() {
        let lon = [0.0, 1.0, 2.0];
        let lat = [10.0, 11.0];
        let avg = bin_average(&[0.1, -0.2, 1.9, 5.0], &[10.0, 10.2, 11.1, 10.0], &[1.0, 3.0, 7.0, 100.0], &lon, &lat);
        assert_eq!(avg[[0, 0]], 2.0);
        assert_eq!(avg[[2, 1]], 7.0);
        assert!(avg[[1, 0]].is_nan());
    }

    #[test]
    fn test_bin_analysis_caps_inverse_variance() {
        let lon = [0.0, 1.0];
        let lat = [0.0, 1.0];
        // 100 unit-weight observations in one cell exceed 1 / 0.04 = 25
        let n = 100;
        let result = bin_analysis(
            &vec![0.0; n],
            &vec![0.0; n],
            &vec![2.0; n],
            &vec![1.0; n],
            &lon,
            &lat,
            SIGMA2_MIN,
        );
        assert!((result.inv_sigma2[[0, 0]] - 25.0).abs() < 1e-3);
        assert!((result.mean[[0, 0]] - 2.0).abs() < 1e-6);
        assert_eq!(result.inv_sigma2[[1, 1]], 0.0);
        assert!(result.mean[[1, 1]].is_nan());
    }
}
