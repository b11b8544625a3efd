pub mod common;
pub mod reader;
pub mod writer;

pub use reader::*;
pub use writer::*;

use ndarray::{Array2, Array3, Axis, Zip};

use crate::error::{DincaeError, Result};
use crate::time_utils::CalendarDate;

/// Gridded observations with gaps
///
/// All arrays are indexed `[lon, lat, time]` (or `[lon, lat]` for the static
/// validity mask).
#[derive(Debug, Clone)]
pub struct GriddedField {
    /// Longitude coordinates (degrees east)
    pub lon: Vec<f64>,
    /// Latitude coordinates (degrees north)
    pub lat: Vec<f64>,
    /// Decoded time axis
    pub time: Vec<CalendarDate>,
    /// Observed values, NaN where missing
    pub data: Array3<f32>,
    /// Mask stack used to inject synthetic gaps during training
    pub missing: Array3<bool>,
    /// Static validity mask (true = sea / valid pixel)
    pub mask: Array2<bool>,
}

impl GriddedField {
    /// Build a field, checking that every array matches the coordinate vectors.
    /// The augmentation mask stack defaults to the missing positions of `data`.
    pub fn new(
        lon: Vec<f64>,
        lat: Vec<f64>,
        time: Vec<CalendarDate>,
        data: Array3<f32>,
        mask: Array2<bool>,
    ) -> Result<Self> {
        let expected = [lon.len(), lat.len(), time.len()];
        if data.shape() != expected {
            return Err(DincaeError::shape("data", &expected, data.shape()));
        }
        if mask.shape() != &expected[..2] {
            return Err(DincaeError::shape("validity mask", &expected[..2], mask.shape()));
        }
        if expected.iter().any(|&n| n == 0) {
            return Err(DincaeError::shape("grid (empty axis)", &expected, data.shape()));
        }

        let missing = Zip::from(&data).par_map_collect(|v| !v.is_finite());

        Ok(Self {
            lon,
            lat,
            time,
            data,
            missing,
            mask,
        })
    }

    /// Replace the augmentation mask stack
    pub fn with_missing_mask(mut self, missing: Array3<bool>) -> Result<Self> {
        if missing.shape() != self.data.shape() {
            return Err(DincaeError::shape("missing mask", self.data.shape(), missing.shape()));
        }
        self.missing = missing;
        Ok(self)
    }

    /// (W, H, T)
    pub fn dims(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Fraction of finite values among valid pixels
    pub fn coverage(&self) -> f64 {
        let (_, _, nt) = self.dims();
        let valid = self.mask.iter().filter(|&&m| m).count() * nt;
        if valid == 0 {
            return 0.0;
        }
        let observed = Zip::from(self.data.lanes(Axis(2)))
            .and(&self.mask)
            .fold(0usize, |acc, lane, &m| {
                if m {
                    acc + lane.iter().filter(|v| v.is_finite()).count()
                } else {
                    acc
                }
            });
        observed as f64 / valid as f64
    }
}

/// Temporal mean subtracted before building input channels
#[derive(Debug, Clone, PartialEq)]
pub struct MeanField {
    /// `[lon, lat]` mean values
    pub values: Array2<f32>,
}

impl MeanField {
    pub fn new(values: Array2<f32>) -> Self {
        Self { values }
    }

    /// Mean over time of the finite values; pixels never observed get 0
    pub fn from_field(field: &GriddedField) -> Self {
        let values = field.data.map_axis(Axis(2), |lane| {
            let (sum, count) = lane
                .iter()
                .filter(|v| v.is_finite())
                .fold((0.0f64, 0usize), |(s, c), &v| (s + v as f64, c + 1));
            if count == 0 {
                0.0
            } else {
                (sum / count as f64) as f32
            }
        });
        Self { values }
    }

    /// Uniform mean on valid pixels, 0 elsewhere
    pub fn constant(mask: &Array2<bool>, value: f32) -> Self {
        Self {
            values: mask.mapv(|m| if m { value } else { 0.0 }),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.values.dim()
    }
}

/// Scattered in-situ observations
#[derive(Debug, Clone, Default)]
pub struct Observations {
    pub lon: Vec<f64>,
    pub lat: Vec<f64>,
    pub depth: Vec<f64>,
    pub time: Vec<CalendarDate>,
    pub value: Vec<f64>,
}

impl Observations {
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Keep the observations for which `keep(i)` holds
    pub fn filter<F: Fn(usize) -> bool>(&self, keep: F) -> Self {
        let idx: Vec<usize> = (0..self.len()).filter(|&i| keep(i)).collect();
        Self {
            lon: idx.iter().map(|&i| self.lon[i]).collect(),
            lat: idx.iter().map(|&i| self.lat[i]).collect(),
            depth: idx.iter().map(|&i| self.depth[i]).collect(),
            time: idx.iter().map(|&i| self.time[i]).collect(),
            value: idx.iter().map(|&i| self.value[i]).collect(),
        }
    }

    /// Near-surface observations strictly inside the grid with plausible values
    pub fn select_surface(&self, lon: &[f64], lat: &[f64]) -> Self {
        let (lon0, lon1) = (lon[0], lon[lon.len() - 1]);
        let (lat0, lat1) = (lat[0], lat[lat.len() - 1]);
        self.filter(|i| {
            self.depth[i] < 10.0
                && lon0 < self.lon[i]
                && self.lon[i] < lon1
                && lat0 < self.lat[i]
                && self.lat[i] < lat1
                && self.value[i].abs() < 200.0
        })
    }

    /// Observations falling in a zero-based calendar month
    pub fn month(&self, month_index: usize) -> Self {
        self.filter(|i| self.time[i].month_index() == month_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn dates(n: usize) -> Vec<CalendarDate> {
        crate::time_utils::decode_cf_times(
            &(0..n).map(|i| i as f64).collect::<Vec<_>>(),
            "days since 2000-01-01",
            crate::time_utils::Calendar::Standard,
        )
        .unwrap()
    }

    #[test]
    fn test_gridded_field_shape_mismatch() {
        let data = Array3::<f32>::zeros((4, 5, 3));
        let mask = Array2::from_elem((4, 4), true);
        let result = GriddedField::new(vec![0.0; 4], vec![0.0; 4], dates(3), data, mask);
        assert!(matches!(result, Err(DincaeError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_mean_field_ignores_missing() {
        let mut data = Array3::<f32>::zeros((2, 2, 3));
        data[[0, 0, 0]] = 1.0;
        data[[0, 0, 1]] = f32::NAN;
        data[[0, 0, 2]] = 3.0;
        data[[1, 1, 0]] = f32::NAN;
        data[[1, 1, 1]] = f32::NAN;
        data[[1, 1, 2]] = f32::NAN;
        let mask = Array2::from_elem((2, 2), true);
        let field = GriddedField::new(vec![0.0, 1.0], vec![0.0, 1.0], dates(3), data, mask).unwrap();

        let mean = MeanField::from_field(&field);
        assert_eq!(mean.values[[0, 0]], 2.0);
        assert_eq!(mean.values[[1, 1]], 0.0);
        assert!(field.missing[[0, 0, 1]]);
        assert!(!field.missing[[0, 0, 0]]);
    }

    #[test]
    fn test_select_surface() {
        let obs = Observations {
            lon: vec![0.5, 0.5, 2.5, 0.5],
            lat: vec![0.5, 0.5, 0.5, 0.5],
            depth: vec![0.0, 20.0, 0.0, 5.0],
            time: dates(4),
            value: vec![10.0, 10.0, 10.0, 500.0],
        };
        let selected = obs.select_surface(&[0.0, 1.0, 2.0], &[0.0, 1.0]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected.value, vec![10.0]);
    }
}
