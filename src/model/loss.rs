//! Per-interpretation training losses.
//!
//! Labels arrive as host arrays. Missing labels (NaN or the map's sentinel)
//! are zeroed and masked out on the host before the labels reach the device,
//! so a sample with a missing output still trains the other outputs.

use crate::data::TensorDict;
use crate::tensor_map::{Interpretation, TensorMap};
use anyhow::{anyhow, bail, Result};
use burn::prelude::*;
use burn::tensor::activation::{log_softmax, sigmoid};
use burn::tensor::{ElementConversion, TensorData};
use ndarray::ArrayD;

const EPSILON: f32 = 1e-7;

/// Labels with missing values zeroed, plus a 0/1 validity mask
struct MaskedLabels {
    values: Vec<f32>,
    mask: Vec<f32>,
    batch: usize,
    size: usize,
}

impl MaskedLabels {
    fn new(tm: &TensorMap, truth: &ArrayD<f32>) -> Result<Self> {
        let batch = truth.shape().first().copied().unwrap_or(0);
        let size = tm.size();
        if truth.len() != batch * size {
            bail!(
                "Labels for {} have shape {:?}, expected {:?} per sample",
                tm.name,
                truth.shape(),
                tm.shape
            );
        }
        let (values, mask) = truth
            .iter()
            .map(|&x| {
                if x.is_finite() && !tm.is_sentinel(x) {
                    (x, 1.0)
                } else {
                    (0.0, 0.0)
                }
            })
            .unzip();
        Ok(Self {
            values,
            mask,
            batch,
            size,
        })
    }

    fn valid(&self) -> f32 {
        self.mask.iter().sum()
    }

    fn tensors<B: Backend>(&self, device: &B::Device) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let shape = [self.batch, self.size];
        (
            Tensor::from_data(TensorData::new(self.values.clone(), shape), device),
            Tensor::from_data(TensorData::new(self.mask.clone(), shape), device),
        )
    }
}

/// Loss of one output head
pub fn head_loss<B: Backend>(
    tm: &TensorMap,
    logits: Tensor<B, 2>,
    truth: &ArrayD<f32>,
) -> Result<Tensor<B, 1>> {
    let labels = MaskedLabels::new(tm, truth)?;
    let device = logits.device();
    let (target, mask) = labels.tensors::<B>(&device);
    let [batch, size] = logits.dims();

    let loss = match tm.interpretation {
        Interpretation::Continuous => {
            let diff = (logits - target).mul(mask);
            diff.powf_scalar(2.0)
                .sum()
                .div_scalar(labels.valid().max(1.0))
        }
        Interpretation::Categorical | Interpretation::Language => {
            let channels = tm.channels().max(1);
            let log_probs =
                log_softmax(logits.reshape([batch, size / channels, channels]), 2).reshape([batch, size]);
            let groups = labels.valid() / channels as f32;
            log_probs
                .mul(target)
                .mul(mask)
                .sum()
                .neg()
                .div_scalar(groups.max(1.0))
        }
        Interpretation::SurvivalCurve => {
            let intervals = size / 2;
            let hazard = sigmoid(logits.slice([0..batch, 0..intervals]));
            let survived = target.clone().slice([0..batch, 0..intervals]);
            let failed = target.slice([0..batch, intervals..size]);

            let censored = survived.mul(hazard.clone().sub_scalar(1.0)).add_scalar(1.0);
            let uncensored = failed.mul(hazard).neg().add_scalar(1.0);
            Tensor::cat(vec![censored, uncensored], 1)
                .clamp_min(EPSILON)
                .log()
                .sum()
                .neg()
                .div_scalar(batch.max(1) as f32)
        }
        Interpretation::TimeToEvent => {
            let risk = sigmoid(logits.slice([0..batch, 0..1])).clamp(EPSILON, 1.0 - EPSILON);
            let event = target.slice([0..batch, 0..1]);
            let event_mask = mask.slice([0..batch, 0..1]);
            let events: f32 = labels.mask.iter().step_by(size.max(1)).sum();

            let positive = event.clone().mul(risk.clone().log());
            let negative = event.neg().add_scalar(1.0).mul(risk.neg().add_scalar(1.0).log());
            (positive + negative)
                .mul(event_mask)
                .sum()
                .neg()
                .div_scalar(events.max(1.0))
        }
    };
    Ok(loss)
}

/// Sum of every head's loss
pub fn multitask_loss<B: Backend>(
    maps: &[TensorMap],
    logits: Vec<Tensor<B, 2>>,
    labels: &TensorDict,
    device: &B::Device,
) -> Result<Tensor<B, 1>> {
    let mut total = Tensor::<B, 1>::zeros([1], device);
    for (tm, head) in maps.iter().zip(logits) {
        let truth = labels
            .get(&tm.output_name())
            .ok_or_else(|| anyhow!("Batch has no labels for {}", tm.output_name()))?;
        total = total + head_loss(tm, head, truth)?;
    }
    Ok(total)
}

/// Host value of a scalar loss
pub fn loss_value<B: Backend>(loss: Tensor<B, 1>) -> f64 {
    loss.into_scalar().elem::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use ndarray::IxDyn;

    type TestBackend = NdArray<f32>;

    fn logits(values: Vec<f32>, shape: [usize; 2]) -> Tensor<TestBackend, 2> {
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    fn labels(values: Vec<f32>, shape: &[usize]) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(shape), values).unwrap()
    }

    #[test]
    fn test_continuous_loss_ignores_missing_labels() {
        let tm = TensorMap::new("age", &[1], Interpretation::Continuous).with_sentinel(-1.0);
        let truth = labels(vec![1.0, f32::NAN, -1.0], &[3, 1]);
        let loss = head_loss(&tm, logits(vec![3.0, 100.0, 100.0], [3, 1]), &truth).unwrap();
        assert!((loss_value(loss) - 4.0).abs() < 1e-5);
    }

    #[test]
    fn test_categorical_loss() {
        let tm = TensorMap::new("sex", &[2], Interpretation::Categorical);
        let truth = labels(vec![1.0, 0.0], &[1, 2]);
        let loss = head_loss(&tm, logits(vec![0.0, 0.0], [1, 2]), &truth).unwrap();
        assert!((loss_value(loss) - std::f64::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_survival_loss_is_zero_for_missing_rows() {
        let tm = TensorMap::new("survival", &[4], Interpretation::SurvivalCurve);
        let truth = labels(vec![f32::NAN; 4], &[1, 4]);
        let loss = head_loss(&tm, logits(vec![0.5; 4], [1, 4]), &truth).unwrap();
        assert!(loss_value(loss).abs() < 1e-6);
    }

    #[test]
    fn test_time_to_event_loss() {
        let tm = TensorMap::new("mi", &[2], Interpretation::TimeToEvent);
        let truth = labels(vec![1.0, 300.0, 0.0, 1200.0], &[2, 2]);
        let loss = head_loss(&tm, logits(vec![0.0, 0.0, 0.0, 0.0], [2, 2]), &truth).unwrap();
        assert!((loss_value(loss) - std::f64::consts::LN_2).abs() < 1e-4);
    }

    #[test]
    fn test_multitask_loss_requires_labels() {
        let maps = vec![TensorMap::new("age", &[1], Interpretation::Continuous)];
        let result = multitask_loss(
            &maps,
            vec![logits(vec![0.0], [1, 1])],
            &TensorDict::new(),
            &Default::default(),
        );
        assert!(result.is_err());
    }
}
