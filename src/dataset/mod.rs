//! Lazily assembled training samples.
//!
//! A [`SampleSource`] is an indexable, restartable sequence of
//! (input, target) pairs, one per timestep, that the batching stage in
//! [`crate::parallel`] pulls from.

pub mod gridded;
pub mod insitu;

pub use gridded::{AssemblerOptions, SampleAssembler};
pub use insitu::{InsituOptions, InsituSource};

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Normal;
use std::sync::{Mutex, MutexGuard};

use crate::error::{DincaeError, Result};

/// One timestep: input `[lon, lat, nvar]` and target `[lon, lat, 2]`
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub input: Array3<f32>,
    pub target: Array3<f32>,
}

/// Indexable sequence of training samples
pub trait SampleSource: Send + Sync {
    /// Number of timesteps
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of input channels
    fn nvar(&self) -> usize;

    /// (W, H)
    fn grid_shape(&self) -> (usize, usize);

    /// Assemble the sample of timestep `index` (0-based)
    fn sample(&self, index: usize) -> Result<TrainingSample>;
}

/// Random generator shared by the producer threads of a source
#[derive(Debug)]
pub(crate) struct SharedRng(Mutex<StdRng>);

impl SharedRng {
    /// Deterministic when seeded, OS entropy otherwise
    pub(crate) fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self(Mutex::new(rng))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StdRng> {
        // a panic while holding the lock leaves the generator usable
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn normal(std: f32) -> Result<Normal<f32>> {
    Normal::new(0.0, std).map_err(|e| DincaeError::Config(format!("invalid noise std {}: {}", std, e)))
}

pub(crate) fn check_index(index: usize, len: usize) -> Result<()> {
    if index >= len {
        return Err(DincaeError::IndexOutOfRange { index, len });
    }
    Ok(())
}
