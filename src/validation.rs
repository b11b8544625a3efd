//! Monthly cross-validation of a reconstruction against independent observations.

use ndarray::{Array3, Axis};
use std::path::Path;
use tracing::{info, warn};

use crate::data_io::reader::{load_observations, open_netcdf_file, read_coordinate, read_masked_field};
use crate::data_io::Observations;
use crate::dataset::insitu::NMONTHS;
use crate::error::{DincaeError, Result};
use crate::math::{interp_points, rms_difference};

/// RMS per calendar month and the combined value
#[derive(Debug, Clone, PartialEq)]
pub struct CvRms {
    /// `None` for months without a usable observation
    pub monthly: Vec<Option<f64>>,
    /// `sqrt(mean(rms^2))` over the months with a value
    pub total: Option<f64>,
}

/// Compare the monthly reconstruction `mean_rec` (`[lon, lat, month]`) with
/// observations, interpolating bilinearly at the observation positions.
pub fn monthly_cv_rms(lon: &[f64], lat: &[f64], mean_rec: &Array3<f32>, obs: &Observations) -> Result<CvRms> {
    let (nlon, nlat, nmonths) = mean_rec.dim();
    if nlon != lon.len() || nlat != lat.len() || nmonths != NMONTHS {
        return Err(DincaeError::shape(
            "monthly reconstruction",
            &[lon.len(), lat.len(), NMONTHS],
            mean_rec.shape(),
        ));
    }

    let monthly: Vec<Option<f64>> = mean_rec
        .axis_iter(Axis(2))
        .enumerate()
        .map(|(m, field)| {
            let selection = obs.month(m);
            let interpolated = interp_points(field, lon, lat, &selection.lon, &selection.lat);
            rms_difference(&interpolated, &selection.value)
        })
        .collect();

    let squares: Vec<f64> = monthly.iter().flatten().map(|r| r * r).collect();
    let total = (!squares.is_empty()).then(|| (squares.iter().sum::<f64>() / squares.len() as f64).sqrt());

    Ok(CvRms { monthly, total })
}

/// Cross-validation RMS of the reconstruction file `recon_path` against the
/// near-surface observations of `varname` in `obs_path`
pub fn monthly_cv_rms_files(recon_path: &Path, obs_path: &Path, varname: &str) -> Result<CvRms> {
    let file = open_netcdf_file(recon_path)?;
    let lon = read_coordinate(&file, "lon")?;
    let lat = read_coordinate(&file, "lat")?;
    let mean_rec = read_masked_field(&file, "mean_rec", lon.len(), lat.len())?;

    let obs = load_observations(obs_path, varname)?.select_surface(&lon, &lat);
    info!(
        "Validating {} against {} observations from {}",
        recon_path.display(),
        obs.len(),
        obs_path.display()
    );

    let result = monthly_cv_rms(&lon, &lat, &mean_rec, &obs)?;
    for (m, rms) in result.monthly.iter().enumerate() {
        match rms {
            Some(rms) => info!("month {:2}: rms {:.4}", m + 1, rms),
            None => warn!("month {:2}: no observation inside the valid domain", m + 1),
        }
    }
    Ok(result)
}
