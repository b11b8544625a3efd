use crate::{
    dataset::{SampleSource, TrainingSample},
    error::{DincaeError, Result},
};
use candle_core::{Device, Tensor};
use crossbeam_channel::{self, Receiver, Sender};
use rand::Rng;
use rayon::prelude::*;
use std::ops::Range;
use tracing::debug;

/// Minibatch of stacked samples in channel-first layout
#[derive(Debug)]
pub struct Batch {
    /// Timestep of every sample in the batch
    pub indices: Vec<usize>,
    /// `(B, nvar, W, H)`
    pub inputs: Tensor,
    /// `(B, 2, W, H)`
    pub targets: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Windowed shuffle: a buffer of `capacity` items is filled from the input,
/// each output is drawn uniformly from the buffer and its slot refilled with
/// the next input item. A capacity of 1 keeps the input order.
pub struct ShuffleBuffer<I: Iterator, R> {
    input: I,
    buffer: Vec<I::Item>,
    capacity: usize,
    rng: R,
}

impl<I: Iterator, R: Rng> ShuffleBuffer<I, R> {
    pub fn new(input: I, capacity: usize, rng: R) -> Self {
        Self {
            input,
            buffer: Vec::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            rng,
        }
    }
}

impl<I: Iterator, R: Rng> Iterator for ShuffleBuffer<I, R> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.len() < self.capacity {
            match self.input.next() {
                Some(item) => self.buffer.push(item),
                None => break,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let k = self.rng.random_range(0..self.buffer.len());
        Some(self.buffer.swap_remove(k))
    }
}

/// Stack samples into `(B, C, W, H)` input and target tensors
pub fn stack_samples(samples: &[TrainingSample], device: &Device) -> Result<(Tensor, Tensor)> {
    let first = samples
        .first()
        .ok_or_else(|| DincaeError::Config("cannot stack an empty batch".to_string()))?;
    let (w, h, nvar) = first.input.dim();
    let ntarget = first.target.dim().2;

    let mut inputs = Vec::with_capacity(samples.len() * w * h * nvar);
    let mut targets = Vec::with_capacity(samples.len() * w * h * ntarget);
    for sample in samples {
        if sample.input.dim() != (w, h, nvar) {
            return Err(DincaeError::shape("input sample", &[w, h, nvar], sample.input.shape()));
        }
        if sample.target.dim() != (w, h, ntarget) {
            return Err(DincaeError::shape("target sample", &[w, h, ntarget], sample.target.shape()));
        }
        inputs.extend(sample.input.iter().copied());
        targets.extend(sample.target.iter().copied());
    }

    let b = samples.len();
    let inputs = Tensor::from_vec(inputs, (b, w, h, nvar), device)?
        .permute((0, 3, 1, 2))?
        .contiguous()?;
    let targets = Tensor::from_vec(targets, (b, w, h, ntarget), device)?
        .permute((0, 3, 1, 2))?
        .contiguous()?;
    Ok((inputs, targets))
}

fn assemble_batch(source: &dyn SampleSource, indices: Vec<usize>, device: &Device) -> Result<Batch> {
    let samples = indices
        .iter()
        .map(|&i| source.sample(i))
        .collect::<Result<Vec<_>>>()?;
    let (inputs, targets) = stack_samples(&samples, device)?;
    Ok(Batch {
        indices,
        inputs,
        targets,
    })
}

/// Feed shuffled minibatches of `source` to `consume`.
///
/// A scoped producer thread assembles samples in the order given by a
/// [`ShuffleBuffer`] of `shuffle_buffer_size` and queues up to `prefetch`
/// stacked batches ahead of the consumer. The first error from either side
/// stops the epoch.
pub fn for_each_shuffled_batch<R, F>(
    source: &dyn SampleSource,
    batch_size: usize,
    shuffle_buffer_size: usize,
    prefetch: usize,
    rng: R,
    device: &Device,
    mut consume: F,
) -> Result<()>
where
    R: Rng + Send,
    F: FnMut(Batch) -> Result<()>,
{
    let batch_size = batch_size.max(1);
    let (tx, rx): (Sender<Result<Batch>>, Receiver<Result<Batch>>) =
        crossbeam_channel::bounded(prefetch.max(1));

    std::thread::scope(move |scope| {
        scope.spawn(move || {
            let mut order = ShuffleBuffer::new(0..source.len(), shuffle_buffer_size, rng);
            loop {
                let indices: Vec<usize> = order.by_ref().take(batch_size).collect();
                if indices.is_empty() {
                    break;
                }
                let batch = assemble_batch(source, indices, device);
                let failed = batch.is_err();
                if tx.send(batch).is_err() || failed {
                    break;
                }
            }
        });

        // dropping `rx` on an early return unblocks the producer
        for batch in rx {
            consume(batch?)?;
        }
        Ok(())
    })
}

/// Sequential batch of the timesteps in `range`, samples assembled in parallel
pub fn eval_batch(source: &dyn SampleSource, range: Range<usize>, device: &Device) -> Result<Batch> {
    let indices: Vec<usize> = range.collect();
    let samples = indices
        .par_iter()
        .map(|&i| source.sample(i))
        .collect::<Result<Vec<_>>>()?;
    debug!("Assembled evaluation batch of {} samples", samples.len());
    let (inputs, targets) = stack_samples(&samples, device)?;
    Ok(Batch {
        indices,
        inputs,
        targets,
    })
}

/// Consecutive index ranges covering `0..len` in chunks of `batch_size`
pub fn batch_ranges(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect()
}
