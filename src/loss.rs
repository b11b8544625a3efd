use candle_core::{DType, Tensor};
use candle_nn::VarMap;

use crate::error::{DincaeError, Result};
use crate::network::Prediction;

/// Lower bound of the target inverse variance
const MIN_TARGET_INV_VAR: f64 = 1e-3;

/// Scalar loss with its diagnostics
#[derive(Debug)]
pub struct LossOutput {
    /// Differentiable scalar
    pub loss: Tensor,
    /// Root mean square error of the mean over observed pixels
    pub rms: f32,
    /// Number of observed target pixels
    pub count: usize,
}

/// Masked heteroscedastic loss against targets `(batch, 2, lon, lat)` holding
/// the scaled value and its inverse variance (0 where unobserved).
///
/// With `truth_uncertain` the loss is twice the Kullback-Leibler divergence
/// between the predicted and target Gaussians; otherwise it is the negative
/// log-likelihood of the target up to constants.
pub fn masked_loss(prediction: &Prediction, targets: &Tensor, truth_uncertain: bool) -> Result<LossOutput> {
    let value = targets.narrow(1, 0, 1)?.squeeze(1)?;
    let confidence = targets.narrow(1, 1, 1)?.squeeze(1)?;
    if value.dims() != prediction.mean.dims() {
        return Err(DincaeError::shape("targets", prediction.mean.dims(), value.dims()));
    }

    let observed = confidence.ne(0f32)?;
    let count = observed_count(&observed)?;
    if count == 0 {
        return Err(DincaeError::UndefinedLoss);
    }

    let true_var = confidence.maximum(MIN_TARGET_INV_VAR)?.recip()?;
    let true_mean = (value * &true_var)?;
    let var = &prediction.var;
    let sq_err = (&prediction.mean - &true_mean)?.sqr()?;

    let term = if truth_uncertain {
        let log_ratio = (var / &true_var)?.log()?;
        ((log_ratio + ((&true_var + &sq_err)? / var)?)? - 1.0)?
    } else {
        (var.log()? + (&sq_err / var)?)?
    };

    let mask = observed.to_dtype(DType::F32)?;
    let n = count as f64;
    let loss = ((term * &mask)?.sum_all()? / n)?;
    let mse = ((sq_err * &mask)?.sum_all()? / n)?.to_scalar::<f32>()?;

    Ok(LossOutput {
        loss,
        rms: mse.sqrt(),
        count,
    })
}

/// Number of nonzero entries of a boolean (`u8`) mask, summed in integers so
/// that large batches are counted exactly
fn observed_count(observed: &Tensor) -> Result<usize> {
    Ok(observed.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()? as usize)
}

/// `beta * sum(w^2)` over all weight matrices and kernels (biases excluded),
/// `None` when `beta` is 0
pub fn l2_penalty(varmap: &VarMap, beta: f64) -> Result<Option<Tensor>> {
    if beta == 0.0 {
        return Ok(None);
    }
    let data = varmap
        .data()
        .lock()
        .map_err(|_| DincaeError::Config("parameter store lock poisoned".to_string()))?;
    let mut total: Option<Tensor> = None;
    for (name, var) in data.iter() {
        if !name.ends_with("weight") {
            continue;
        }
        let sq = var.as_tensor().sqr()?.sum_all()?;
        total = Some(match total {
            Some(t) => (t + sq)?,
            None => sq,
        });
    }
    Ok(match total {
        Some(t) => Some((t * beta)?),
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn prediction(mean: &[f32], var: &[f32]) -> Prediction {
        let device = Device::Cpu;
        Prediction {
            mean: Tensor::from_slice(mean, (1, 1, mean.len()), &device).unwrap(),
            var: Tensor::from_slice(var, (1, 1, var.len()), &device).unwrap(),
        }
    }

    fn targets(value: &[f32], confidence: &[f32]) -> Tensor {
        let n = value.len();
        let mut data = value.to_vec();
        data.extend_from_slice(confidence);
        Tensor::from_vec(data, (1, 2, 1, n), &Device::Cpu).unwrap()
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_perfect_prediction() {
        // true means 2 and -1 with variances 0.5 and 2
        let t = targets(&[4.0, -0.5], &[2.0, 0.5]);
        let p = prediction(&[2.0, -1.0], &[0.5, 2.0]);

        let kl = masked_loss(&p, &t, true).unwrap();
        assert!(scalar(&kl.loss).abs() < 1e-6);

        let nll = masked_loss(&p, &t, false).unwrap();
        let expected = (0.5f32.ln() + 2.0f32.ln()) / 2.0;
        assert!((scalar(&nll.loss) - expected).abs() < 1e-6);
        assert_eq!(nll.rms, 0.0);
    }

    #[test]
    fn test_unobserved_pixels_are_ignored() {
        let t = targets(&[1.0, 0.0], &[1.0, 0.0]);
        let a = masked_loss(&prediction(&[0.0, 0.0], &[1.0, 1.0]), &t, false).unwrap();
        let b = masked_loss(&prediction(&[0.0, 50.0], &[1.0, 7.0]), &t, false).unwrap();
        assert_eq!(a.count, 1);
        assert_eq!(b.count, 1);
        assert_eq!(scalar(&a.loss), scalar(&b.loss));
        assert_eq!(a.rms, 1.0);
    }

    #[test]
    fn test_no_observation_is_undefined() {
        let t = targets(&[0.0, 0.0], &[0.0, 0.0]);
        let result = masked_loss(&prediction(&[0.0, 0.0], &[1.0, 1.0]), &t, false);
        assert!(matches!(result, Err(DincaeError::UndefinedLoss)));
    }

    #[test]
    fn test_count_exceeds_f32_integer_range() {
        // 4097^2 > 2^24, the largest count an f32 sum can reach one by one
        let n = 4097;
        let confidence = Tensor::ones((1, n, n), DType::F32, &Device::Cpu).unwrap();
        let observed = confidence.ne(0f32).unwrap();
        assert_eq!(observed_count(&observed).unwrap(), n * n);
        assert!(n * n > 1 << 24);
    }

    #[test]
    fn test_l2_penalty_skips_biases() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        vb.get_with_hints((2, 2), "layer.weight", candle_nn::Init::Const(1.0)).unwrap();
        vb.get_with_hints(2, "layer.bias", candle_nn::Init::Const(3.0)).unwrap();

        assert!(l2_penalty(&varmap, 0.0).unwrap().is_none());
        let penalty = l2_penalty(&varmap, 0.5).unwrap().unwrap();
        assert_eq!(scalar(&penalty), 2.0);
    }
}
