use ndarray::{s, Array2, Array3, Zip};
use rand::Rng;
use rand_distr::Distribution;
use std::f32::consts::PI;
use tracing::{debug, warn};

use super::{check_index, normal, SampleSource, SharedRng, TrainingSample};
use crate::data_io::{GridMask, MeanField, Observations};
use crate::error::{DincaeError, Result};
use crate::math::{bin_analysis, BinAnalysis, SIGMA2_MIN};

/// Number of input channels built from binned observations
pub const INSITU_NVAR: usize = 6;

pub const NMONTHS: usize = 12;

/// Gap centres drawn before giving up on a month
const MAX_GAP_ATTEMPTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InsituOptions {
    /// Constant background subtracted from the observations
    pub mean_value: f32,
    pub jitter_std_value: f32,
    pub jitter_std_lon: f32,
    pub jitter_std_lat: f32,
    /// Radius of the synthetic gap in degrees
    pub gap_radius: f64,
    /// Observed cells a synthetic gap must cover
    pub min_gap_count: usize,
    pub train: bool,
    pub seed: Option<u64>,
}

impl Default for InsituOptions {
    fn default() -> Self {
        Self {
            mean_value: 15.0,
            jitter_std_value: 0.5,
            jitter_std_lon: 0.1,
            jitter_std_lat: 0.1,
            gap_radius: 1.5,
            min_gap_count: 50,
            train: false,
            seed: None,
        }
    }
}

impl InsituOptions {
    /// Latitude jitter of 0.1 degree and a longitude jitter covering the same
    /// distance at the mean latitude of the grid
    pub fn with_grid_jitter(mut self, lat: &[f64]) -> Self {
        let mean_lat = lat.iter().sum::<f64>() / lat.len().max(1) as f64;
        self.jitter_std_lat = 0.1;
        self.jitter_std_lon = (0.1 / mean_lat.to_radians().cos()) as f32;
        self
    }
}

/// Monthly climatology samples from scattered observations binned onto a grid.
///
/// Input channels (`[lon, lat, 6]`): weighted sum, inverse variance, lon, lat,
/// cos/sin of the month angle.
#[derive(Debug)]
pub struct InsituSource {
    lon: Vec<f64>,
    lat: Vec<f64>,
    mask: Array2<bool>,
    months: Vec<BinAnalysis>,
    options: InsituOptions,
    rng: SharedRng,
}

impl InsituSource {
    pub fn new(observations: &Observations, grid: &GridMask, options: InsituOptions) -> Result<Self> {
        let expected = [grid.lon.len(), grid.lat.len()];
        if grid.mask.shape() != expected {
            return Err(DincaeError::shape("validity mask", &expected, grid.mask.shape()));
        }
        if grid.lon.len() < 2 || grid.lat.len() < 2 {
            return Err(DincaeError::shape("regular grid (at least 2x2)", &[2, 2], &expected));
        }
        normal(options.jitter_std_value)?;
        normal(options.jitter_std_lon)?;
        normal(options.jitter_std_lat)?;

        let selected = observations.select_surface(&grid.lon, &grid.lat);
        if selected.len() < observations.len() {
            debug!(
                "Kept {} of {} observations inside the grid",
                selected.len(),
                observations.len()
            );
        }

        let months = (0..NMONTHS)
            .map(|m| {
                let obs = selected.month(m);
                let anomalies: Vec<f64> = obs.value.iter().map(|v| v - options.mean_value as f64).collect();
                let weights = vec![1.0; obs.len()];
                bin_analysis(&obs.lon, &obs.lat, &anomalies, &weights, &grid.lon, &grid.lat, SIGMA2_MIN)
            })
            .collect();

        let source = Self {
            lon: grid.lon.clone(),
            lat: grid.lat.clone(),
            mask: grid.mask.clone(),
            months,
            options,
            rng: SharedRng::new(options.seed),
        };
        if options.train {
            for month in source.months_without_gap() {
                warn!(
                    "Month {} has fewer than {} observed cells: its samples get no synthetic gap",
                    month + 1,
                    options.min_gap_count
                );
            }
        }
        Ok(source)
    }

    /// Months (0-based) with fewer observed cells than `min_gap_count`, where
    /// no gap can ever qualify
    pub fn months_without_gap(&self) -> Vec<usize> {
        self.months
            .iter()
            .enumerate()
            .filter(|(_, binned)| {
                binned.inv_sigma2.iter().filter(|&&w| w > 0.0).count() < self.options.min_gap_count
            })
            .map(|(m, _)| m)
            .collect()
    }

    /// Constant background on valid pixels
    pub fn mean_field(&self) -> MeanField {
        MeanField::constant(&self.mask, self.options.mean_value)
    }

    /// Mask of the observed cells within the gap radius of a random centre, or
    /// `None` if no centre covers enough of them
    fn draw_gap<R: Rng>(&self, observed: &Array2<f32>, rng: &mut R) -> Option<Array2<bool>> {
        let (lon0, lon1) = (self.lon[0], self.lon[self.lon.len() - 1]);
        let (lat0, lat1) = (self.lat[0], self.lat[self.lat.len() - 1]);
        let radius2 = self.options.gap_radius * self.options.gap_radius;

        for _ in 0..MAX_GAP_ATTEMPTS {
            let gap_lon = lon0 + (lon1 - lon0) * rng.random::<f64>();
            let gap_lat = lat0 + (lat1 - lat0) * rng.random::<f64>();
            let gap = Array2::from_shape_fn(observed.dim(), |(i, j)| {
                let d2 = (self.lon[i] - gap_lon).powi(2) + (self.lat[j] - gap_lat).powi(2);
                d2 < radius2 && observed[[i, j]] > 0.0
            });
            if gap.iter().filter(|&&g| g).count() >= self.options.min_gap_count {
                return Some(gap);
            }
        }
        None
    }
}

impl SampleSource for InsituSource {
    fn len(&self) -> usize {
        NMONTHS
    }

    fn nvar(&self) -> usize {
        INSITU_NVAR
    }

    fn grid_shape(&self) -> (usize, usize) {
        (self.lon.len(), self.lat.len())
    }

    fn sample(&self, index: usize) -> Result<TrainingSample> {
        check_index(index, NMONTHS)?;
        let (nlon, nlat) = self.grid_shape();
        let binned = &self.months[index];
        let angle = 2.0 * PI * index as f32 / NMONTHS as f32;

        let mut x = Array3::<f32>::zeros((nlon, nlat, INSITU_NVAR));
        x.slice_mut(s![.., .., 0]).assign(&binned.weighted_sum);
        x.slice_mut(s![.., .., 1]).assign(&binned.inv_sigma2);
        for i in 0..nlon {
            for j in 0..nlat {
                x[[i, j, 2]] = self.lon[i] as f32;
                x[[i, j, 3]] = self.lat[j] as f32;
                x[[i, j, 4]] = angle.cos();
                x[[i, j, 5]] = angle.sin();
            }
        }

        let target = x.slice(s![.., .., 0..2]).to_owned();
        let mut input = x;

        if self.options.train {
            let mut rng = self.rng.lock();
            let value_noise = normal(self.options.jitter_std_value)?;
            let lon_noise = normal(self.options.jitter_std_lon)?;
            let lat_noise = normal(self.options.jitter_std_lat)?;
            let jitter2 = self.options.jitter_std_value * self.options.jitter_std_value;

            for i in 0..nlon {
                for j in 0..nlat {
                    let w = binned.inv_sigma2[[i, j]];
                    if w > 0.0 {
                        input[[i, j, 0]] += value_noise.sample(&mut *rng);
                        input[[i, j, 1]] = 1.0 / (1.0 / w + jitter2);
                    }
                    input[[i, j, 2]] += lon_noise.sample(&mut *rng);
                    input[[i, j, 3]] += lat_noise.sample(&mut *rng);
                }
            }

            let observed = input.slice(s![.., .., 1]).to_owned();
            match self.draw_gap(&observed, &mut *rng) {
                Some(gap) => {
                    let (mut value, mut inv_var) = input.multi_slice_mut((s![.., .., 0], s![.., .., 1]));
                    Zip::from(&mut value)
                        .and(&mut inv_var)
                        .and(&gap)
                        .for_each(|v, w, &g| {
                            if g {
                                *v = 0.0;
                                *w = 0.0;
                            }
                        });
                }
                None => debug!(
                    "No gap of radius {} covers {} observed cells in month {}",
                    self.options.gap_radius,
                    self.options.min_gap_count,
                    index + 1
                ),
            }
        }

        Ok(TrainingSample { input, target })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_utils::days_since_1900;

    fn grid() -> GridMask {
        GridMask {
            lon: (0..10).map(|i| i as f64 * 0.5).collect(),
            lat: (0..8).map(|j| 40.0 + j as f64 * 0.5).collect(),
            mask: Array2::from_elem((10, 8), true),
        }
    }

    fn observations() -> Observations {
        // 2000-01-15 and 2000-07-15
        let jan = days_since_1900(36538.0).unwrap();
        let jul = days_since_1900(36720.0).unwrap();
        Observations {
            lon: vec![1.0, 1.0, 2.0, 3.0],
            lat: vec![41.0, 41.0, 42.0, 42.5],
            depth: vec![0.0, 5.0, 0.0, 50.0],
            time: vec![jan, jan, jul, jan],
            value: vec![16.0, 18.0, 20.0, 10.0],
        }
    }

    #[test]
    fn test_monthly_binning() {
        let source = InsituSource::new(&observations(), &grid(), InsituOptions::default()).unwrap();
        assert_eq!(source.len(), 12);
        assert_eq!(source.nvar(), INSITU_NVAR);

        let january = source.sample(0).unwrap();
        // two observations at (1.0, 41.0): anomalies 1 and 3
        assert_eq!(january.target[[2, 2, 0]], 4.0);
        assert_eq!(january.target[[2, 2, 1]], 2.0);
        // deep observation dropped
        assert_eq!(january.target[[6, 5, 1]], 0.0);
        assert_eq!(january.input[[3, 1, 2]], 1.5);
        assert_eq!(january.input[[3, 1, 3]], 40.5);
        assert_eq!(january.input[[0, 0, 4]], 1.0);

        let july = source.sample(6).unwrap();
        assert_eq!(july.target[[4, 4, 0]], 5.0);
        assert!((july.input[[0, 0, 4]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_training_without_qualifying_gap_keeps_observations() {
        let options = InsituOptions {
            train: true,
            seed: Some(1),
            ..InsituOptions::default()
        };
        let source = InsituSource::new(&observations(), &grid(), options).unwrap();
        let january = source.sample(0).unwrap();
        // fewer than 50 observed cells: no gap is injected, inverse variance is jittered
        let expected = 1.0 / (1.0 / 2.0 + 0.25);
        assert!((january.input[[2, 2, 1]] - expected).abs() < 1e-6);
        assert_eq!(january.target[[2, 2, 1]], 2.0);
    }

    #[test]
    fn test_months_without_gap() {
        let source = InsituSource::new(&observations(), &grid(), InsituOptions::default()).unwrap();
        assert_eq!(source.months_without_gap(), (0..12).collect::<Vec<_>>());

        // January has one observed cell, July one, the other months none
        let options = InsituOptions {
            min_gap_count: 1,
            ..InsituOptions::default()
        };
        let source = InsituSource::new(&observations(), &grid(), options).unwrap();
        let expected: Vec<usize> = (0..12).filter(|&m| m != 0 && m != 6).collect();
        assert_eq!(source.months_without_gap(), expected);
    }

    #[test]
    fn test_mean_field_is_constant() {
        let source = InsituSource::new(&observations(), &grid(), InsituOptions::default()).unwrap();
        assert!(source.mean_field().values.iter().all(|&v| v == 15.0));
    }
}
