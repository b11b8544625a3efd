use super::MeanField;
use chrono::Utc;
use ndarray::{Array2, Array3, Axis};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Value written on invalid (land) pixels
pub const FILL_VALUE: f32 = -9999.0;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("NetCDF error: {0}")]
    Netcdf(#[from] netcdf::Error),

    #[error("record offset {offset} already written ({written} records in file)")]
    OffsetWritten { offset: usize, written: usize },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Appends reconstructed mean and standard deviation fields to a NetCDF file
/// with an unlimited time dimension.
///
/// The file is created with `lon`, `lat` and `meandata`; every call to
/// [`ReconstructionWriter::append`] reopens it and writes the records at the
/// requested offset.
#[derive(Debug)]
pub struct ReconstructionWriter {
    path: PathBuf,
    mask: Array2<bool>,
    meandata: Array2<f32>,
    records: usize,
}

impl ReconstructionWriter {
    pub fn create(
        path: impl AsRef<Path>,
        lon: &[f64],
        lat: &[f64],
        meandata: &MeanField,
        mask: &Array2<bool>,
    ) -> Result<Self, WriteError> {
        let (nlon, nlat) = (lon.len(), lat.len());
        if meandata.dim() != (nlon, nlat) || mask.dim() != (nlon, nlat) {
            return Err(WriteError::InvalidData(format!(
                "mean field {:?} and mask {:?} must be ({}, {})",
                meandata.dim(),
                mask.dim(),
                nlon,
                nlat
            )));
        }

        let path = path.as_ref().to_path_buf();
        let mut file = netcdf::create(&path)?;

        file.add_unlimited_dimension("time")?;
        file.add_dimension("lon", nlon)?;
        file.add_dimension("lat", nlat)?;

        file.add_attribute("title", "DINCAE reconstruction")?;
        file.add_attribute("source", "dincae_rust")?;
        file.add_attribute("Conventions", "CF-1.6")?;
        let creation_time = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        file.add_attribute("history", format!("Created on {}", creation_time))?;

        {
            let mut var = file.add_variable::<f32>("lon", &["lon"])?;
            var.put_attribute("units", "degrees_east")?;
            let values: Vec<f32> = lon.iter().map(|&v| v as f32).collect();
            var.put_values(&values, ..)?;
        }
        {
            let mut var = file.add_variable::<f32>("lat", &["lat"])?;
            var.put_attribute("units", "degrees_north")?;
            let values: Vec<f32> = lat.iter().map(|&v| v as f32).collect();
            var.put_values(&values, ..)?;
        }
        {
            let mut var = file.add_variable::<f32>("meandata", &["lat", "lon"])?;
            var.put_attribute("_FillValue", FILL_VALUE)?;
            let values = masked_lat_lon(&meandata.values, mask);
            var.put_values(&values, (0..nlat, 0..nlon))?;
        }
        for (name, long_name) in [
            ("mean_rec", "reconstructed field"),
            ("sigma_rec", "standard deviation of the reconstruction error"),
        ] {
            let mut var = file.add_variable::<f32>(name, &["time", "lat", "lon"])?;
            var.put_attribute("long_name", long_name)?;
            var.put_attribute("_FillValue", FILL_VALUE)?;
        }

        debug!("Created reconstruction file {}", path.display());

        Ok(Self {
            path,
            mask: mask.clone(),
            meandata: meandata.values.clone(),
            records: 0,
        })
    }

    /// Write a batch of anomalies and variances, indexed `[sample, lon, lat]`,
    /// starting at record `offset`. The mean field is added back and the
    /// standard deviation is stored.
    pub fn append(&mut self, offset: usize, mean: &Array3<f32>, variance: &Array3<f32>) -> Result<(), WriteError> {
        if offset < self.records {
            return Err(WriteError::OffsetWritten {
                offset,
                written: self.records,
            });
        }
        let (n, nlon, nlat) = mean.dim();
        if variance.dim() != (n, nlon, nlat) || (nlon, nlat) != self.mask.dim() {
            return Err(WriteError::InvalidData(format!(
                "batch shapes {:?} / {:?} do not match grid {:?}",
                mean.dim(),
                variance.dim(),
                self.mask.dim()
            )));
        }
        if n == 0 {
            return Ok(());
        }

        let mut mean_rec = Vec::with_capacity(n * nlat * nlon);
        let mut sigma_rec = Vec::with_capacity(n * nlat * nlon);
        for (m, v) in mean.axis_iter(Axis(0)).zip(variance.axis_iter(Axis(0))) {
            let rec = &m + &self.meandata;
            mean_rec.extend(masked_lat_lon(&rec, &self.mask));
            sigma_rec.extend(masked_lat_lon(&v.mapv(f32::sqrt), &self.mask));
        }

        let mut file = netcdf::append(&self.path)?;
        let extents = (offset..offset + n, 0..nlat, 0..nlon);
        file.variable_mut("mean_rec")
            .ok_or_else(|| WriteError::InvalidData("mean_rec variable missing".to_string()))?
            .put_values(&mean_rec, extents.clone())?;
        file.variable_mut("sigma_rec")
            .ok_or_else(|| WriteError::InvalidData("sigma_rec variable missing".to_string()))?
            .put_values(&sigma_rec, extents)?;

        self.records = offset + n;
        Ok(())
    }

    /// Number of records in the file
    pub fn records(&self) -> usize {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Flatten a `[lon, lat]` array in `(lat, lon)` file order, filling invalid pixels
fn masked_lat_lon(values: &Array2<f32>, mask: &Array2<bool>) -> Vec<f32> {
    values
        .t()
        .iter()
        .zip(mask.t().iter())
        .map(|(&v, &valid)| if valid && v.is_finite() { v } else { FILL_VALUE })
        .collect()
}
