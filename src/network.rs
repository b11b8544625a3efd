//! Skip-connected convolutional encoder/decoder predicting a mean and an
//! inverse error variance per pixel.
//!
//! Tensors are channel-first, `(batch, channel, lon, lat)`.

use candle_core::{Device, Module, ModuleT, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Dropout, Linear, VarBuilder};
use tracing::debug;

use crate::config::{ResizeMethod, TrainingConfig};
use crate::error::{DincaeError, Result};
use crate::math::{linear_resize_matrix, nearest_resize_matrix};

/// Negative slope of the leaky ReLU
const LEAKY_SLOPE: f64 = 0.2;
/// Upper bound of the predicted log inverse variance
const MAX_LOG_INV_VAR: f64 = 10.0;
/// Lower bound of the inverse variance
const MIN_INV_VAR: f64 = 1e-3;

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    pub nvar: usize,
    /// Output channels of the encoder stages
    pub widths: Vec<usize>,
    /// 1-based decoder stages receiving the mirrored encoder activation
    pub skipconnections: Vec<usize>,
    pub dropout_rate: f32,
    pub resize: ResizeMethod,
    /// (W, H) of the input grid
    pub grid: (usize, usize),
}

impl NetworkConfig {
    pub fn from_training(config: &TrainingConfig, grid: (usize, usize)) -> Self {
        Self {
            nvar: config.nvar,
            widths: config.enc_ksize_internal.clone(),
            skipconnections: config.skipconnections.clone(),
            dropout_rate: config.dropout_rate_train,
            resize: config.resize_method,
            grid,
        }
    }
}

/// Mean and variance of the prediction, each `(batch, lon, lat)`
#[derive(Debug)]
pub struct Prediction {
    pub mean: Tensor,
    pub var: Tensor,
}

fn leaky_relu(x: &Tensor) -> candle_core::Result<Tensor> {
    x.maximum(&(x * LEAKY_SLOPE)?)
}

/// 2x2 average pooling with "same" padding: odd sizes are padded by edge
/// replication, so the last window averages the valid pixels only
fn avg_pool_same(x: &Tensor) -> candle_core::Result<Tensor> {
    let (_, _, n2, n3) = x.dims4()?;
    let x = if n2 % 2 == 1 { x.pad_with_same(2, 0, 1)? } else { x.clone() };
    let x = if n3 % 2 == 1 { x.pad_with_same(3, 0, 1)? } else { x };
    x.avg_pool2d(2)
}

/// Resample the last dimension with a transposed `(n_in, n_out)` matrix
fn resample_last(x: &Tensor, matrix_t: &Tensor) -> candle_core::Result<Tensor> {
    let mut dims = x.dims().to_vec();
    let (n_in, n_out) = matrix_t.dims2()?;
    let rows = x.elem_count() / n_in;
    if let Some(last) = dims.last_mut() {
        *last = n_out;
    }
    x.contiguous()?.reshape((rows, n_in))?.matmul(matrix_t)?.reshape(dims)
}

/// Precomputed upsampling from one spatial size to another
#[derive(Debug)]
struct Resize {
    /// transposed matrices for dims 2 and 3, `None` when the size is unchanged
    dim2: Option<Tensor>,
    dim3: Option<Tensor>,
}

impl Resize {
    fn new(from: (usize, usize), to: (usize, usize), method: ResizeMethod, device: &Device) -> Result<Self> {
        let matrix = |n_in: usize, n_out: usize| -> Result<Option<Tensor>> {
            if n_in == n_out {
                return Ok(None);
            }
            let m = match method {
                ResizeMethod::Nearest => nearest_resize_matrix(n_in, n_out),
                ResizeMethod::Bilinear => linear_resize_matrix(n_in, n_out),
            };
            let values: Vec<f32> = m.t().iter().copied().collect();
            Ok(Some(Tensor::from_vec(values, (n_in, n_out), device)?))
        };
        Ok(Self {
            dim2: matrix(from.0, to.0)?,
            dim3: matrix(from.1, to.1)?,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let x = match &self.dim3 {
            Some(m) => resample_last(x, m)?,
            None => x.clone(),
        };
        match &self.dim2 {
            Some(m) => resample_last(&x.transpose(2, 3)?, m)?.transpose(2, 3),
            None => Ok(x),
        }
    }
}

#[derive(Debug)]
struct DecoderStage {
    resize: Resize,
    /// encoder stage whose pre-pooling activation is concatenated
    skip_from: Option<usize>,
    conv: Conv2d,
    /// false for the final linear stage
    activation: bool,
}

/// Encoder, dense bottleneck and decoder, built once and reused for every batch
#[derive(Debug)]
pub struct DincaeNet {
    encoder: Vec<Conv2d>,
    dense_down: Linear,
    dense_up: Linear,
    dropout: Dropout,
    decoder: Vec<DecoderStage>,
    /// (channels, dim2, dim3) of the smallest feature map
    bottleneck_shape: (usize, usize, usize),
    config: NetworkConfig,
}

impl DincaeNet {
    pub fn new(vb: VarBuilder, config: &NetworkConfig) -> Result<Self> {
        let nstages = config.widths.len();
        if nstages == 0 {
            return Err(DincaeError::Config("at least one encoder stage is required".to_string()));
        }
        if let Some(&bad) = config.skipconnections.iter().find(|&&l| l == 0 || l > nstages) {
            return Err(DincaeError::Config(format!(
                "skip connection {} outside decoder stages 1..={}",
                bad, nstages
            )));
        }
        if config.grid.0 == 0 || config.grid.1 == 0 {
            return Err(DincaeError::shape("grid", &[1, 1], &[config.grid.0, config.grid.1]));
        }

        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        // spatial size before each pooling
        let mut sizes = Vec::with_capacity(nstages);
        let mut size = config.grid;
        let mut encoder = Vec::with_capacity(nstages);
        let mut in_channels = config.nvar;
        for (e, &width) in config.widths.iter().enumerate() {
            sizes.push(size);
            encoder.push(conv2d(in_channels, width, 3, conv_cfg, vb.pp(format!("enc{}", e)))?);
            in_channels = width;
            size = (size.0.div_ceil(2), size.1.div_ceil(2));
        }

        let bottleneck_shape = (in_channels, size.0, size.1);
        let ndense = in_channels * size.0 * size.1;
        let nreduced = (ndense / 5).max(1);
        let dense_down = linear(ndense, nreduced, vb.pp("dense_down"))?;
        let dense_up = linear(nreduced, ndense, vb.pp("dense_up"))?;

        let device = vb.device().clone();
        let mut decoder = Vec::with_capacity(nstages);
        let mut current = size;
        for l in 1..=nstages {
            let mirrored = nstages - l;
            let target = sizes[mirrored];
            let skip_from = config.skipconnections.contains(&l).then_some(mirrored);
            let skip_channels = skip_from.map_or(0, |m| config.widths[m]);
            let last = l == nstages;
            let out_channels = if last { 2 } else { config.widths[mirrored - 1] };
            let conv = conv2d(
                in_channels + skip_channels,
                out_channels,
                3,
                conv_cfg,
                vb.pp(format!("dec{}", l)),
            )?;
            decoder.push(DecoderStage {
                resize: Resize::new(current, target, config.resize, &device)?,
                skip_from,
                conv,
                activation: !last,
            });
            in_channels = out_channels;
            current = target;
        }

        debug!(
            "Built network: {} stages, bottleneck {:?} ({} -> {})",
            nstages, bottleneck_shape, ndense, nreduced
        );

        Ok(Self {
            encoder,
            dense_down,
            dense_up,
            dropout: Dropout::new(config.dropout_rate),
            decoder,
            bottleneck_shape,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Raw two-channel output `(batch, 2, lon, lat)`: scaled mean and log
    /// inverse variance
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, nvar, n2, n3) = x.dims4()?;
        if nvar != self.config.nvar || (n2, n3) != self.config.grid {
            return Err(DincaeError::shape(
                "network input",
                &[batch, self.config.nvar, self.config.grid.0, self.config.grid.1],
                x.dims(),
            ));
        }

        let mut activations = Vec::with_capacity(self.encoder.len());
        let mut h = x.clone();
        for conv in &self.encoder {
            let a = leaky_relu(&conv.forward(&h)?)?;
            h = avg_pool_same(&a)?;
            activations.push(a);
        }

        let (c, b2, b3) = self.bottleneck_shape;
        let flat = h.flatten_from(1)?;
        let dense = leaky_relu(&self.dense_down.forward(&flat)?)?;
        let dense = self.dropout.forward_t(&dense, train)?;
        let dense = leaky_relu(&self.dense_up.forward(&dense)?)?;
        let mut h = dense.reshape((batch, c, b2, b3))?;

        for stage in &self.decoder {
            let up = stage.resize.forward(&h)?;
            let up = match stage.skip_from {
                Some(m) => Tensor::cat(&[&up, &activations[m]], 1)?,
                None => up,
            };
            let out = stage.conv.forward(&up)?;
            h = if stage.activation { leaky_relu(&out)? } else { out };
        }
        Ok(h)
    }

    /// Mean and variance of the prediction
    pub fn predict(&self, x: &Tensor, train: bool) -> Result<Prediction> {
        output_transform(&self.forward_t(x, train)?)
    }
}

/// Turn the raw output into mean and variance:
/// `inv_var = exp(min(log_inv_var, 10))`, `var = 1 / max(inv_var, 1e-3)`,
/// `mean = raw_mean * var`
pub fn output_transform(raw: &Tensor) -> Result<Prediction> {
    let raw_mean = raw.narrow(1, 0, 1)?.squeeze(1)?;
    let log_inv_var = raw.narrow(1, 1, 1)?.squeeze(1)?;
    let inv_var = log_inv_var.minimum(MAX_LOG_INV_VAR)?.exp()?;
    let var = inv_var.maximum(MIN_INV_VAR)?.recip()?;
    let mean = (raw_mean * &var)?;
    Ok(Prediction { mean, var })
}
