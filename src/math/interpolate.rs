use ndarray::{Array2, ArrayView2};
use num_traits::Float;
use rayon::prelude::*;

/// Generic linear interpolation between two values
pub fn lin_interp<T: Float>(v0: T, v1: T, fac: T) -> T {
    v0 + (v1 - v0) * fac
}

/// Generic bilinear interpolation between four corner values.
/// `fxy` is the value at corner (x, y).
pub fn bilin_interp<T: Float>(f00: T, f01: T, f10: T, f11: T, fac_x: T, fac_y: T) -> T {
    let f_y0 = lin_interp(f00, f10, fac_x);
    let f_y1 = lin_interp(f01, f11, fac_x);
    lin_interp(f_y0, f_y1, fac_y)
}

/// Bracketing indices and weight of `target` in an increasing coordinate
/// vector; `None` outside `[coords[0], coords[last]]`.
pub fn find_grid_indices(coords: &[f64], target: f64) -> Option<(usize, usize, f64)> {
    let last = coords.len().checked_sub(1)?;
    if !target.is_finite() || target < coords[0] || target > coords[last] {
        return None;
    }
    if last == 0 {
        return Some((0, 0, 0.0));
    }

    // Binary search for insertion point
    let mut left = 0;
    let mut right = last;

    while right - left > 1 {
        let mid = (left + right) / 2;
        if coords[mid] <= target {
            left = mid;
        } else {
            right = mid;
        }
    }

    let weight = (target - coords[left]) / (coords[right] - coords[left]);
    Some((left, right, weight))
}

/// Bilinear interpolation of a `[lon, lat]` field at one point.
///
/// NaN outside the grid or when a contributing corner is NaN.
pub fn interp_grid(values: ArrayView2<f32>, lon: &[f64], lat: &[f64], x: f64, y: f64) -> f64 {
    let (Some((i0, i1, wx)), Some((j0, j1, wy))) = (find_grid_indices(lon, x), find_grid_indices(lat, y)) else {
        return f64::NAN;
    };
    bilin_interp(
        values[[i0, j0]] as f64,
        values[[i0, j1]] as f64,
        values[[i1, j0]] as f64,
        values[[i1, j1]] as f64,
        wx,
        wy,
    )
}

/// Interpolate a `[lon, lat]` field at many points in parallel
pub fn interp_points(values: ArrayView2<f32>, lon: &[f64], lat: &[f64], x: &[f64], y: &[f64]) -> Vec<f64> {
    x.par_iter()
        .zip(y.par_iter())
        .map(|(&xi, &yi)| interp_grid(values, lon, lat, xi, yi))
        .collect()
}

/// Row-stochastic `(n_out, n_in)` matrix resampling a 1-D signal with
/// nearest-neighbour lookup (source index `floor(i * n_in / n_out)`).
pub fn nearest_resize_matrix(n_in: usize, n_out: usize) -> Array2<f32> {
    let scale = n_in as f64 / n_out as f64;
    let mut m = Array2::zeros((n_out, n_in));
    for i in 0..n_out {
        let src = ((i as f64 * scale).floor() as usize).min(n_in - 1);
        m[[i, src]] = 1.0;
    }
    m
}

/// Row-stochastic `(n_out, n_in)` matrix for linear resampling with aligned
/// origins (source coordinate `i * n_in / n_out`, clamped at the far edge).
pub fn linear_resize_matrix(n_in: usize, n_out: usize) -> Array2<f32> {
    let scale = n_in as f64 / n_out as f64;
    let mut m = Array2::zeros((n_out, n_in));
    for i in 0..n_out {
        let src = i as f64 * scale;
        let i0 = (src.floor() as usize).min(n_in - 1);
        let i1 = (i0 + 1).min(n_in - 1);
        let w = (src - i0 as f64) as f32;
        m[[i, i0]] += lin_interp(1.0, 0.0, w);
        m[[i, i1]] += w;
    }
    m
}
