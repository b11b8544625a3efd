use super::{GriddedField, Observations};
use crate::error::DincaeError;
use crate::time_utils::{days_since_1900, decode_cf_times, Calendar, CalendarDate};
use ndarray::{Array2, Array3};
use netcdf::AttributeValue;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("NetCDF error: {0}")]
    Netcdf(#[from] netcdf::Error),

    #[error("Variable not found: {0}")]
    MissingVariable(String),

    #[error("Attribute not found: {0}")]
    MissingAttribute(String),

    #[error("Data conversion error: {0}")]
    ConversionError(String),

    #[error("Invalid time units: {0}")]
    TimeUnits(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),
}

/// Coordinates and validity mask of a grid
#[derive(Debug, Clone)]
pub struct GridMask {
    pub lon: Vec<f64>,
    pub lat: Vec<f64>,
    /// `[lon, lat]`, true on valid (sea) pixels
    pub mask: Array2<bool>,
}

/// Open a NetCDF file, reporting a missing path explicitly
pub fn open_netcdf_file(path: impl AsRef<Path>) -> Result<netcdf::File, ReaderError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ReaderError::FileNotFound(path.to_string_lossy().to_string()));
    }
    Ok(netcdf::open(path)?)
}

fn variable<'f>(file: &'f netcdf::File, name: &str) -> Result<netcdf::Variable<'f>, ReaderError> {
    file.variable(name)
        .ok_or_else(|| ReaderError::MissingVariable(name.to_string()))
}

/// Numeric attribute as f64, `None` when absent
pub fn attribute_f64(var: &netcdf::Variable, name: &str) -> Result<Option<f64>, ReaderError> {
    let Some(attr) = var.attribute(name) else {
        return Ok(None);
    };
    let value = match attr.value()? {
        AttributeValue::Double(v) => v,
        AttributeValue::Float(v) => v as f64,
        AttributeValue::Longlong(v) => v as f64,
        AttributeValue::Ulonglong(v) => v as f64,
        AttributeValue::Int(v) => v as f64,
        AttributeValue::Uint(v) => v as f64,
        AttributeValue::Short(v) => v as f64,
        AttributeValue::Ushort(v) => v as f64,
        AttributeValue::Schar(v) => v as f64,
        AttributeValue::Uchar(v) => v as f64,
        AttributeValue::Doubles(v) => first_value(name, &v)?,
        AttributeValue::Floats(v) => first_value(name, &v)? as f64,
        AttributeValue::Ints(v) => first_value(name, &v)? as f64,
        AttributeValue::Shorts(v) => first_value(name, &v)? as f64,
        other => {
            return Err(ReaderError::ConversionError(format!(
                "attribute {} is not numeric: {:?}",
                name, other
            )))
        }
    };
    Ok(Some(value))
}

fn first_value<T: Copy>(name: &str, values: &[T]) -> Result<T, ReaderError> {
    values
        .first()
        .copied()
        .ok_or_else(|| ReaderError::ConversionError(format!("attribute {} is empty", name)))
}

/// String attribute, `None` when absent
pub fn attribute_string(var: &netcdf::Variable, name: &str) -> Result<Option<String>, ReaderError> {
    let Some(attr) = var.attribute(name) else {
        return Ok(None);
    };
    match attr.value()? {
        AttributeValue::Str(s) => Ok(Some(s)),
        AttributeValue::Strs(v) => Ok(v.into_iter().next()),
        other => Err(ReaderError::ConversionError(format!(
            "attribute {} is not a string: {:?}",
            name, other
        ))),
    }
}

/// Read a 1-D coordinate variable
pub fn read_coordinate(file: &netcdf::File, name: &str) -> Result<Vec<f64>, ReaderError> {
    let var = variable(file, name)?;
    Ok(var.get_values::<f64, _>(..)?)
}

/// Decode the `time` variable using its `units` and `calendar` attributes
pub fn read_time_axis(file: &netcdf::File) -> Result<Vec<CalendarDate>, ReaderError> {
    let var = variable(file, "time")?;
    let values: Vec<f64> = var.get_values(..)?;
    let units = attribute_string(&var, "units")?
        .ok_or_else(|| ReaderError::MissingAttribute("time.units".to_string()))?;
    let calendar = match attribute_string(&var, "calendar")? {
        Some(name) => name.parse::<Calendar>().map_err(ReaderError::TimeUnits)?,
        None => Calendar::Standard,
    };
    decode_cf_times(&values, &units, calendar).map_err(ReaderError::TimeUnits)
}

/// Read a `(lat, lon)` variable as a `[lon, lat]` array
fn read_lat_lon(file: &netcdf::File, name: &str, nlon: usize, nlat: usize) -> Result<Array2<f64>, ReaderError> {
    let var = variable(file, name)?;
    let shape = var.dimensions().iter().map(|d| d.len()).collect::<Vec<_>>();
    if shape != [nlat, nlon] {
        return Err(ReaderError::ConversionError(format!(
            "{} has shape {:?}, expected (lat, lon) = {:?}",
            name,
            shape,
            [nlat, nlon]
        )));
    }
    let raw: Vec<f64> = var.get_values(..)?;
    let array = Array2::from_shape_vec((nlat, nlon), raw)
        .map_err(|e| ReaderError::ConversionError(e.to_string()))?;
    Ok(array.reversed_axes().as_standard_layout().to_owned())
}

/// Read a `(time, lat, lon)` variable as a `[lon, lat, time]` array.
/// Fill and missing values become NaN; packing attributes are applied.
pub fn read_masked_field(
    file: &netcdf::File,
    name: &str,
    nlon: usize,
    nlat: usize,
) -> Result<Array3<f32>, ReaderError> {
    let var = variable(file, name)?;
    let shape = var.dimensions().iter().map(|d| d.len()).collect::<Vec<_>>();
    if shape.len() != 3 || shape[1] != nlat || shape[2] != nlon {
        return Err(ReaderError::ConversionError(format!(
            "{} has shape {:?}, expected (time, {}, {})",
            name, shape, nlat, nlon
        )));
    }

    let fill = attribute_f64(&var, "_FillValue")?;
    let missing = attribute_f64(&var, "missing_value")?;
    let scale = attribute_f64(&var, "scale_factor")?.unwrap_or(1.0);
    let offset = attribute_f64(&var, "add_offset")?.unwrap_or(0.0);

    let raw: Vec<f64> = var.get_values(..)?;
    let values: Vec<f32> = raw
        .into_iter()
        .map(|v| {
            if !v.is_finite() || Some(v) == fill || Some(v) == missing {
                f32::NAN
            } else {
                (v * scale + offset) as f32
            }
        })
        .collect();

    let array = Array3::from_shape_vec((shape[0], nlat, nlon), values)
        .map_err(|e| ReaderError::ConversionError(e.to_string()))?;

    // [t, lat, lon] -> [lon, lat, t]
    Ok(array.permuted_axes([2, 1, 0]).as_standard_layout().to_owned())
}

/// Load `lon`, `lat` and the `mask(lat, lon)` variable of a grid file
pub fn load_grid_mask(path: impl AsRef<Path>) -> Result<GridMask, ReaderError> {
    let file = open_netcdf_file(&path)?;
    let lon = read_coordinate(&file, "lon")?;
    let lat = read_coordinate(&file, "lat")?;
    let mask = read_lat_lon(&file, "mask", lon.len(), lat.len())?.mapv(|v| v != 0.0);
    debug!(
        "Loaded mask {}x{} from {}",
        lon.len(),
        lat.len(),
        path.as_ref().display()
    );
    Ok(GridMask { lon, lat, mask })
}

/// Load a gridded variable with its coordinates, time axis and validity mask.
///
/// Without a `mask` variable every pixel observed at least once is valid.
pub fn load_gridded_field(path: impl AsRef<Path>, varname: &str) -> Result<GriddedField, DincaeError> {
    let file = open_netcdf_file(&path)?;
    let lon = read_coordinate(&file, "lon")?;
    let lat = read_coordinate(&file, "lat")?;
    let time = read_time_axis(&file)?;
    let data = read_masked_field(&file, varname, lon.len(), lat.len())?;

    let mask = if file.variable("mask").is_some() {
        read_lat_lon(&file, "mask", lon.len(), lat.len())?.mapv(|v| v != 0.0)
    } else {
        data.map_axis(ndarray::Axis(2), |lane| lane.iter().any(|v| v.is_finite()))
    };

    info!(
        "Loaded {} ({} x {} x {}) from {}",
        varname,
        lon.len(),
        lat.len(),
        time.len(),
        path.as_ref().display()
    );

    GriddedField::new(lon, lat, time, data, mask)
}

/// Load scattered observations (`obslon`, `obslat`, `obsdepth`, `obstime` in
/// days since 1900-01-01 and the value variable)
pub fn load_observations(path: impl AsRef<Path>, varname: &str) -> Result<Observations, ReaderError> {
    let file = open_netcdf_file(&path)?;
    let lon = read_coordinate(&file, "obslon")?;
    let lat = read_coordinate(&file, "obslat")?;
    let depth = read_coordinate(&file, "obsdepth")?;
    let obstime = read_coordinate(&file, "obstime")?;
    let value = read_coordinate(&file, varname)?;

    let n = value.len();
    if [lon.len(), lat.len(), depth.len(), obstime.len()].iter().any(|&len| len != n) {
        return Err(ReaderError::ConversionError(format!(
            "observation vectors of {} differ in length",
            path.as_ref().display()
        )));
    }

    let time = obstime
        .iter()
        .map(|&days| {
            days_since_1900(days)
                .ok_or_else(|| ReaderError::ConversionError(format!("invalid obstime {}", days)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    debug!("Loaded {} observations of {}", n, varname);

    Ok(Observations {
        lon,
        lat,
        depth,
        time,
        value,
    })
}
