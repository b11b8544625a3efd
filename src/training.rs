//! Minibatch optimisation, periodic export of reconstructions and checkpoints.

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TrainingConfig;
use crate::data_io::common::{checkpoint_filename, config_filename, ensure_output_dir, export_filename};
use crate::data_io::{MeanField, ReconstructionWriter};
use crate::dataset::SampleSource;
use crate::error::{DincaeError, Result};
use crate::loss::{l2_penalty, masked_loss};
use crate::network::{DincaeNet, NetworkConfig, Prediction};
use crate::parallel::{batch_ranges, eval_batch, for_each_shuffled_batch, Batch};

/// Scale the gradients of `vars` so that their global L2 norm does not exceed
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut total_norm_sq = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let norm_sq: f32 = grad.sqr()?.sum_all()?.to_dtype(DType::F32)?.to_scalar()?;
            total_norm_sq += norm_sq as f64;
        }
    }
    let total_norm = total_norm_sq.sqrt();

    if total_norm > max_norm {
        let scale = max_norm / total_norm;
        for var in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (grad * scale)?);
            }
        }
    }
    Ok(total_norm)
}

/// Diagnostics of one optimizer step
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    pub loss: f32,
    pub rms: f32,
    pub grad_norm: f64,
}

/// Mean loss and RMS over the batches of a pass
#[derive(Debug, Clone, Copy, Default)]
pub struct PassStats {
    pub loss: f64,
    pub rms: f64,
    pub batches: usize,
    /// Batches without any observed target pixel
    pub skipped: usize,
}

impl PassStats {
    fn add(&mut self, loss: f32, rms: f32) {
        self.loss += loss as f64;
        self.rms += rms as f64;
        self.batches += 1;
    }

    fn mean_loss(&self) -> Option<f64> {
        (self.batches > 0).then(|| self.loss / self.batches as f64)
    }

    fn mean_rms(&self) -> Option<f64> {
        (self.batches > 0).then(|| self.rms / self.batches as f64)
    }
}

/// Grid description shared by every export
#[derive(Debug, Clone)]
pub struct ExportGrid<'a> {
    pub lon: &'a [f64],
    pub lat: &'a [f64],
    pub mask: &'a Array2<bool>,
    pub mean: &'a MeanField,
}

/// Owns the network parameters, the optimizer and the device
pub struct TrainingContext {
    net: DincaeNet,
    varmap: VarMap,
    optimizer: AdamW,
    device: Device,
    config: TrainingConfig,
}

impl TrainingContext {
    pub fn new(config: &TrainingConfig, grid: (usize, usize), device: &Device) -> Result<Self> {
        config.validate().map_err(DincaeError::Config)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = DincaeNet::new(vb, &NetworkConfig::from_training(config, grid))?;

        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        Ok(Self {
            net,
            varmap,
            optimizer,
            device: device.clone(),
            config: config.clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn network(&self) -> &DincaeNet {
        &self.net
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    /// Forward, backward, gradient clipping and one optimizer step.
    ///
    /// A batch without observed target pixels yields `UndefinedLoss` and a
    /// NaN or infinite loss yields `NonFiniteLoss`; both leave the parameters
    /// untouched.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        let prediction = self.net.predict(&batch.inputs, true)?;
        let output = masked_loss(&prediction, &batch.targets, self.config.truth_uncertain)?;

        let total = match l2_penalty(&self.varmap, self.config.regularization_l2_beta)? {
            Some(penalty) => (&output.loss + penalty)?,
            None => output.loss.clone(),
        };
        let loss: f32 = total.to_scalar()?;
        if !loss.is_finite() {
            return Err(DincaeError::NonFiniteLoss { loss });
        }

        let mut grads = total.backward()?;
        let grad_norm = clip_grad_norm(&mut grads, &self.varmap.all_vars(), self.config.clip_grad)?;
        self.optimizer.step(&grads)?;

        Ok(StepOutput {
            loss,
            rms: output.rms,
            grad_norm,
        })
    }

    /// Prediction without dropout
    pub fn predict(&self, inputs: &Tensor) -> Result<Prediction> {
        self.net.predict(inputs, false)
    }

    /// Run a training epoch over `source`
    pub fn train_epoch<R: Rng + Send>(&mut self, source: &dyn SampleSource, rng: R) -> Result<PassStats> {
        let mut stats = PassStats::default();
        let device = self.device.clone();
        let config = self.config.clone();
        for_each_shuffled_batch(
            source,
            config.batch_size,
            config.shuffle_buffer_size,
            config.prefetch,
            rng,
            &device,
            |batch| match self.train_step(&batch) {
                Ok(step) => {
                    debug!(
                        "batch {:?}: loss {:.5}, rms {:.5}, grad norm {:.3}",
                        batch.indices, step.loss, step.rms, step.grad_norm
                    );
                    stats.add(step.loss, step.rms);
                    Ok(())
                }
                Err(DincaeError::UndefinedLoss) => {
                    warn!("Skipping batch {:?}: no observed target pixel", batch.indices);
                    stats.skipped += 1;
                    Ok(())
                }
                Err(e) => Err(e),
            },
        )?;
        Ok(stats)
    }

    /// Sequential forward pass over `source`, writing mean and standard
    /// deviation fields to `path`
    pub fn export(&self, source: &dyn SampleSource, grid: &ExportGrid, path: &Path) -> Result<PassStats> {
        let mut writer = ReconstructionWriter::create(path, grid.lon, grid.lat, grid.mean, grid.mask)?;
        let mut stats = PassStats::default();

        for range in batch_ranges(source.len(), self.config.batch_size) {
            let offset = range.start;
            let batch = eval_batch(source, range, &self.device)?;
            let prediction = self.predict(&batch.inputs)?;

            match masked_loss(&prediction, &batch.targets, self.config.truth_uncertain) {
                Ok(output) => stats.add(output.loss.to_scalar()?, output.rms),
                Err(DincaeError::UndefinedLoss) => stats.skipped += 1,
                Err(e) => return Err(e),
            }

            writer.append(offset, &to_array3(&prediction.mean)?, &to_array3(&prediction.var)?)?;
        }
        Ok(stats)
    }

    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }
}

/// `(batch, lon, lat)` tensor as an ndarray
fn to_array3(t: &Tensor) -> Result<Array3<f32>> {
    let dims = t.dims3()?;
    let values = t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    Array3::from_shape_vec(dims, values).map_err(|_| DincaeError::shape("prediction", &[dims.0, dims.1, dims.2], t.dims()))
}

/// Outcome of [`reconstruct`]
#[derive(Debug, Clone, Default)]
pub struct TrainingSummary {
    /// Last reconstruction file written
    pub last_export: Option<PathBuf>,
    pub last_train_loss: Option<f64>,
    pub last_test_rms: Option<f64>,
}

/// CUDA device 0 when available, CPU otherwise
pub fn default_device() -> Result<Device> {
    Ok(Device::cuda_if_available(0)?)
}

/// Train on `train`, exporting reconstructions of `test` every `save_each`
/// epochs to `outdir/data-<epoch>.nc` and checkpointing the parameters every
/// `save_model_each` epochs.
pub fn reconstruct(
    grid: &ExportGrid,
    train: &dyn SampleSource,
    test: &dyn SampleSource,
    outdir: &Path,
    config: &TrainingConfig,
    device: &Device,
) -> Result<TrainingSummary> {
    config.validate().map_err(DincaeError::Config)?;
    let shape = (grid.lon.len(), grid.lat.len());
    for (name, source) in [("train", train), ("test", test)] {
        if source.grid_shape() != shape {
            let (w, h) = source.grid_shape();
            return Err(DincaeError::shape(format!("{} samples", name), &[shape.0, shape.1], &[w, h]));
        }
        if source.nvar() != config.nvar {
            return Err(DincaeError::Config(format!(
                "{} samples have {} channels, nvar is {}",
                name,
                source.nvar(),
                config.nvar
            )));
        }
    }

    let outdir = ensure_output_dir(outdir)?;
    fs::write(config_filename(&outdir), serde_json::to_string_pretty(config)?)?;

    let mut ctx = TrainingContext::new(config, shape, device)?;
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
        None => StdRng::from_os_rng(),
    };

    info!(
        "Training {} epochs on {} samples ({} test samples), output in {}",
        config.epochs,
        train.len(),
        test.len(),
        outdir.display()
    );

    let mut summary = TrainingSummary::default();
    for epoch in 1..=config.epochs {
        let start = Instant::now();
        let lr = config.learning_rate_at(epoch - 1);
        ctx.set_learning_rate(lr);

        let stats = ctx.train_epoch(train, StdRng::seed_from_u64(rng.random()))?;
        summary.last_train_loss = stats.mean_loss();
        match stats.mean_loss() {
            Some(loss) => info!(
                "Epoch {:5}/{}: loss {:.5}, rms {:.5}, lr {:.2e} ({:.1} s)",
                epoch,
                config.epochs,
                loss,
                stats.mean_rms().unwrap_or(f64::NAN),
                lr,
                start.elapsed().as_secs_f64()
            ),
            None => warn!("Epoch {}: no batch had observed target pixels", epoch),
        }

        if epoch % config.save_each == 0 {
            let path = export_filename(&outdir, epoch);
            let eval = ctx.export(test, grid, &path)?;
            summary.last_test_rms = eval.mean_rms();
            info!(
                "Exported {} (test rms {:.5})",
                path.display(),
                eval.mean_rms().unwrap_or(f64::NAN)
            );
            summary.last_export = Some(path);
        }

        if config.save_model_each > 0 && epoch % config.save_model_each == 0 {
            let path = checkpoint_filename(&outdir, epoch);
            ctx.save_checkpoint(&path)?;
            info!("Saved checkpoint {}", path.display());
        }
    }

    Ok(summary)
}
