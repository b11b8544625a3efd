use candle_core::{Device, Tensor, Var};
use dincae_rust::dataset::{SampleSource, TrainingSample};
use dincae_rust::error::{DincaeError, Result};
use dincae_rust::loss::masked_loss;
use dincae_rust::network::output_transform;
use dincae_rust::parallel::{batch_ranges, eval_batch, for_each_shuffled_batch};
use dincae_rust::training::clip_grad_norm;
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Source whose sample `t` is filled with `t`
struct Constant {
    len: usize,
    fail_at: Option<usize>,
}

impl SampleSource for Constant {
    fn len(&self) -> usize {
        self.len
    }

    fn nvar(&self) -> usize {
        3
    }

    fn grid_shape(&self) -> (usize, usize) {
        (2, 3)
    }

    fn sample(&self, index: usize) -> Result<TrainingSample> {
        if Some(index) == self.fail_at {
            return Err(DincaeError::IndexOutOfRange { index, len: self.len });
        }
        Ok(TrainingSample {
            input: Array3::from_elem((2, 3, 3), index as f32),
            target: Array3::from_elem((2, 3, 2), index as f32),
        })
    }
}

#[test]
fn test_gradient_clipping_to_max_norm() {
    let device = Device::Cpu;
    let weights = Var::from_slice(&[0f32; 4], 4, &device).unwrap();
    // gradient (20, 40, 40, 80): norm 100
    let slope = Tensor::new(&[20f32, 40.0, 40.0, 80.0], &device).unwrap();
    let loss = (weights.as_tensor() * &slope).unwrap().sum_all().unwrap();
    let mut grads = loss.backward().unwrap();

    let norm = clip_grad_norm(&mut grads, &[weights.clone()], 5.0).unwrap();
    assert!((norm - 100.0).abs() < 1e-3);

    let clipped: Vec<f32> = grads.get(weights.as_tensor()).unwrap().to_vec1().unwrap();
    let clipped_norm = clipped.iter().map(|g| g * g).sum::<f32>().sqrt();
    assert!((clipped_norm - 5.0).abs() < 1e-4);
    for (g, s) in clipped.iter().zip([20f32, 40.0, 40.0, 80.0]) {
        assert!((g / s - 0.05).abs() < 1e-6);
    }
}

#[test]
fn test_shuffled_batches_cover_every_sample() {
    let source = Constant { len: 11, fail_at: None };
    let mut seen = Vec::new();
    let mut sizes = Vec::new();
    for_each_shuffled_batch(&source, 4, 5, 2, StdRng::seed_from_u64(9), &Device::Cpu, |batch| {
        assert_eq!(batch.inputs.dims(), &[batch.len(), 3, 2, 3]);
        assert_eq!(batch.targets.dims(), &[batch.len(), 2, 2, 3]);
        // sample values follow the indices
        let first: Vec<f32> = batch.inputs.flatten_from(1).unwrap().max(1).unwrap().to_vec1().unwrap();
        let expected: Vec<f32> = batch.indices.iter().map(|&i| i as f32).collect();
        assert_eq!(first, expected);
        sizes.push(batch.len());
        seen.extend(batch.indices);
        Ok(())
    })
    .unwrap();

    assert_eq!(sizes, vec![4, 4, 3]);
    seen.sort_unstable();
    assert_eq!(seen, (0..11).collect::<Vec<_>>());
}

#[test]
fn test_sample_error_stops_the_epoch() {
    let source = Constant { len: 20, fail_at: Some(13) };
    let mut batches = 0;
    let result = for_each_shuffled_batch(&source, 2, 1, 1, StdRng::seed_from_u64(0), &Device::Cpu, |_| {
        batches += 1;
        Ok(())
    });
    assert!(matches!(result, Err(DincaeError::IndexOutOfRange { index: 13, .. })));
    assert_eq!(batches, 6);
}

#[test]
fn test_consumer_error_stops_the_producer() {
    let source = Constant { len: 50, fail_at: None };
    let mut batches = 0;
    let result = for_each_shuffled_batch(&source, 1, 1, 1, StdRng::seed_from_u64(0), &Device::Cpu, |_| {
        batches += 1;
        if batches == 3 {
            Err(DincaeError::UndefinedLoss)
        } else {
            Ok(())
        }
    });
    assert!(matches!(result, Err(DincaeError::UndefinedLoss)));
    assert_eq!(batches, 3);
}

#[test]
fn test_eval_batches_keep_order() {
    let source = Constant { len: 7, fail_at: None };
    for range in batch_ranges(source.len(), 3) {
        let batch = eval_batch(&source, range.clone(), &Device::Cpu).unwrap();
        assert_eq!(batch.indices, range.collect::<Vec<_>>());
    }
}

#[test]
fn test_output_transform_bounds() {
    let device = Device::Cpu;
    // channel 0 holds the mean scaled by the inverse variance, channel 1 its log
    let raw = Tensor::new(&[[[[3f32, 3.0]], [[100.0, -100.0]]]], &device).unwrap();
    let prediction = output_transform(&raw).unwrap();

    let var: Vec<f32> = prediction.var.flatten_all().unwrap().to_vec1().unwrap();
    assert!((var[0] - (-10f32).exp()).abs() < 1e-9);
    assert!((var[1] - 1e3).abs() < 1e-2);

    let mean: Vec<f32> = prediction.mean.flatten_all().unwrap().to_vec1().unwrap();
    assert!((mean[1] - 3e3).abs() < 1e-1);
}

#[test]
fn test_loss_is_lowest_at_truth() {
    let device = Device::Cpu;
    let targets = Tensor::new(&[[[[2f32, 1.0]], [[1.0, 1.0]]]], &device).unwrap();
    let loss_at = |mean: [f32; 2]| {
        let raw_mean = Tensor::new(&[[mean]], &device).unwrap();
        let prediction = dincae_rust::network::Prediction {
            mean: raw_mean,
            var: Tensor::ones((1, 1, 2), candle_core::DType::F32, &device).unwrap(),
        };
        masked_loss(&prediction, &targets, true).unwrap().loss.to_scalar::<f32>().unwrap()
    };
    assert!(loss_at([2.0, 1.0]) < loss_at([2.5, 1.0]));
    assert!(loss_at([2.0, 1.0]) < loss_at([2.0, 0.0]));
}
