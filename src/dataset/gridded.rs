use ndarray::{s, Array2, Array3, Axis, Zip};
use rand::Rng;
use rand_distr::Distribution;
use tracing::debug;

use super::{check_index, normal, SampleSource, SharedRng, TrainingSample};
use crate::data_io::{GriddedField, MeanField};
use crate::error::{DincaeError, Result};
use crate::math::minmax_scale;

/// Number of input channels built from a gridded field
pub const GRIDDED_NVAR: usize = 10;

/// Day-of-year divisor of the seasonal channels
const DAYS_PER_YEAR: f32 = 365.25;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssemblerOptions {
    /// Observation error standard deviation
    pub obs_err_std: f32,
    /// Standard deviation of the noise added to the value channels in training
    pub jitter_std: f32,
    /// Inject synthetic gaps and noise
    pub train: bool,
    pub seed: Option<u64>,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            obs_err_std: 1.0,
            jitter_std: 0.05,
            train: false,
            seed: None,
        }
    }
}

/// Turns a gridded field into per-timestep input and target tensors.
///
/// Channel layout of the input (`[lon, lat, 10]`):
/// 0-1 scaled anomaly and inverse error variance, 2-3 rescaled lon/lat,
/// 4-5 cos/sin of the day of year, 6-7 and 8-9 channels 0-1 of the previous
/// and next timestep (clamped at the ends of the time axis).
#[derive(Debug)]
pub struct SampleAssembler {
    /// `[lon, lat, time]` anomaly / obs_err_std², 0 where missing
    value: Array3<f32>,
    /// `[lon, lat, time]` 1 / obs_err_std², 0 where missing
    inv_var: Array3<f32>,
    lon_scaled: Vec<f32>,
    lat_scaled: Vec<f32>,
    season: Vec<(f32, f32)>,
    missing: Array3<bool>,
    options: AssemblerOptions,
    rng: SharedRng,
}

impl SampleAssembler {
    pub fn new(field: &GriddedField, mean: &MeanField, options: AssemblerOptions) -> Result<Self> {
        let (nlon, nlat, ntime) = field.dims();
        let expected = [field.lon.len(), field.lat.len(), field.time.len()];
        if field.data.shape() != expected {
            return Err(DincaeError::shape("data", &expected, field.data.shape()));
        }
        if field.missing.shape() != expected {
            return Err(DincaeError::shape("missing mask", &expected, field.missing.shape()));
        }
        if mean.values.shape() != &expected[..2] {
            return Err(DincaeError::shape("mean field", &expected[..2], mean.values.shape()));
        }
        if field.mask.shape() != &expected[..2] {
            return Err(DincaeError::shape("validity mask", &expected[..2], field.mask.shape()));
        }
        if ntime == 0 {
            return Err(DincaeError::shape("time axis", &[1], &[0]));
        }
        if !(options.obs_err_std > 0.0) {
            return Err(DincaeError::Config(format!(
                "obs_err_std must be positive, got {}",
                options.obs_err_std
            )));
        }
        // validate the noise distribution up front
        normal(options.jitter_std)?;

        let inv_err = 1.0 / (options.obs_err_std * options.obs_err_std);

        let mut value = Array3::<f32>::zeros((nlon, nlat, ntime));
        let mut inv_var = Array3::<f32>::zeros((nlon, nlat, ntime));
        for ((data, mut val), mut iv) in field
            .data
            .axis_iter(Axis(2))
            .zip(value.axis_iter_mut(Axis(2)))
            .zip(inv_var.axis_iter_mut(Axis(2)))
        {
            Zip::from(&mut val)
                .and(&mut iv)
                .and(&data)
                .and(&mean.values)
                .par_for_each(|v, w, &d, &m| {
                    let anomaly = d - m;
                    if anomaly.is_finite() {
                        *v = anomaly * inv_err;
                        *w = inv_err;
                    }
                });
        }

        let season = field
            .time
            .iter()
            .map(|t| {
                let doy = t.day_of_year as f32;
                ((doy / DAYS_PER_YEAR).cos(), (doy / DAYS_PER_YEAR).sin())
            })
            .collect();

        debug!(
            "Sample assembler {}x{}x{} (train = {})",
            nlon, nlat, ntime, options.train
        );

        Ok(Self {
            value,
            inv_var,
            lon_scaled: minmax_scale(&field.lon),
            lat_scaled: minmax_scale(&field.lat),
            season,
            missing: field.missing.clone(),
            options,
            rng: SharedRng::new(options.seed),
        })
    }

    pub fn options(&self) -> &AssemblerOptions {
        &self.options
    }

    fn add_noise<R: Rng>(&self, channel: &mut Array2<f32>, rng: &mut R) -> Result<()> {
        let dist = normal(self.options.jitter_std)?;
        channel.mapv_inplace(|v| v + dist.sample(rng));
        Ok(())
    }
}

impl SampleSource for SampleAssembler {
    fn len(&self) -> usize {
        self.value.len_of(Axis(2))
    }

    fn nvar(&self) -> usize {
        GRIDDED_NVAR
    }

    fn grid_shape(&self) -> (usize, usize) {
        let (nlon, nlat, _) = self.value.dim();
        (nlon, nlat)
    }

    fn sample(&self, index: usize) -> Result<TrainingSample> {
        let ntime = self.len();
        check_index(index, ntime)?;
        let (nlon, nlat) = self.grid_shape();
        let prev = index.saturating_sub(1);
        let next = (index + 1).min(ntime - 1);

        let mut current_value = self.value.slice(s![.., .., index]).to_owned();
        let mut current_inv_var = self.inv_var.slice(s![.., .., index]).to_owned();
        let mut prev_value = self.value.slice(s![.., .., prev]).to_owned();
        let mut next_value = self.value.slice(s![.., .., next]).to_owned();

        let mut target = Array3::<f32>::zeros((nlon, nlat, 2));
        target.slice_mut(s![.., .., 0]).assign(&current_value);
        target.slice_mut(s![.., .., 1]).assign(&current_inv_var);

        if self.options.train {
            let mut rng = self.rng.lock();
            let k = rng.random_range(0..self.missing.len_of(Axis(2)));
            Zip::from(&mut current_value)
                .and(&mut current_inv_var)
                .and(self.missing.slice(s![.., .., k]))
                .for_each(|v, w, &gap| {
                    if gap {
                        *v = 0.0;
                        *w = 0.0;
                    }
                });
            self.add_noise(&mut current_value, &mut *rng)?;
            self.add_noise(&mut prev_value, &mut *rng)?;
            self.add_noise(&mut next_value, &mut *rng)?;
        }

        let (cos_doy, sin_doy) = self.season[index];
        let mut input = Array3::<f32>::zeros((nlon, nlat, GRIDDED_NVAR));
        input.slice_mut(s![.., .., 0]).assign(&current_value);
        input.slice_mut(s![.., .., 1]).assign(&current_inv_var);
        for (i, mut row) in input.axis_iter_mut(Axis(0)).enumerate() {
            for (j, mut px) in row.axis_iter_mut(Axis(0)).enumerate() {
                px[2] = self.lon_scaled[i];
                px[3] = self.lat_scaled[j];
                px[4] = cos_doy;
                px[5] = sin_doy;
            }
        }
        input.slice_mut(s![.., .., 6]).assign(&prev_value);
        input
            .slice_mut(s![.., .., 7])
            .assign(&self.inv_var.slice(s![.., .., prev]));
        input.slice_mut(s![.., .., 8]).assign(&next_value);
        input
            .slice_mut(s![.., .., 9])
            .assign(&self.inv_var.slice(s![.., .., next]));

        Ok(TrainingSample { input, target })
    }
}
