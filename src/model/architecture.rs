use crate::data::TensorDict;
use crate::model::{layer_names, HeadActivation, Model, ModelConfig, EMBED_LAYER, MERGE_LAYER};
use crate::tensor_map::TensorMap;
use anyhow::{anyhow, bail, Result};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{relu, sigmoid, softmax};
use burn::tensor::TensorData;
use ndarray::{Array2, ArrayD, IxDyn};

/// Multimodal multitask network.
///
/// Every input has its own dense encoder. Encoder outputs are concatenated,
/// passed through the dense merger, and the last merger activation (`embed`)
/// feeds one linear decoder per output.
#[derive(Module, Debug)]
pub struct MultimodalModel<B: Backend> {
    encoders: Vec<Linear<B>>,
    dense: Vec<Linear<B>>,
    decoders: Vec<Linear<B>>,
    dropout: Dropout,
}

/// Every intermediate activation of one forward pass
#[derive(Debug, Clone)]
pub struct MultimodalOutput<B: Backend> {
    /// One per input, after the encoder activation
    pub encoded: Vec<Tensor<B, 2>>,
    /// Concatenated encoder outputs
    pub merged: Tensor<B, 2>,
    /// One per dense layer, after activation
    pub dense: Vec<Tensor<B, 2>>,
    /// Decoder outputs before the head activation
    pub logits: Vec<Tensor<B, 2>>,
}

impl<B: Backend> MultimodalOutput<B> {
    pub fn embed(&self) -> Tensor<B, 2> {
        self.dense
            .last()
            .cloned()
            .unwrap_or_else(|| self.merged.clone())
    }
}

impl<B: Backend> MultimodalModel<B> {
    /// Forward pass; inputs are flattened per sample, in input-map order
    pub fn forward(&self, inputs: Vec<Tensor<B, 2>>) -> MultimodalOutput<B> {
        let encoded: Vec<Tensor<B, 2>> = self
            .encoders
            .iter()
            .zip(inputs)
            .map(|(encoder, x)| relu(encoder.forward(x)))
            .collect();

        let merged = Tensor::cat(encoded.clone(), 1);

        let mut dense = Vec::with_capacity(self.dense.len());
        let mut x = merged.clone();
        for layer in &self.dense {
            x = self.dropout.forward(relu(layer.forward(x)));
            dense.push(x.clone());
        }

        let logits = self
            .decoders
            .iter()
            .map(|decoder| decoder.forward(x.clone()))
            .collect();

        MultimodalOutput {
            encoded,
            merged,
            dense,
            logits,
        }
    }

    pub fn encoders(&self) -> &[Linear<B>] {
        &self.encoders
    }

    pub fn decoders(&self) -> &[Linear<B>] {
        &self.decoders
    }

    /// The dense layers between the merge and the decoders
    pub fn merger(&self) -> &[Linear<B>] {
        &self.dense
    }
}

/// Initialize a multimodal model from configuration
pub fn init_model<B: Backend>(config: &ModelConfig, device: &B::Device) -> MultimodalModel<B> {
    let encoders = config
        .input_sizes
        .iter()
        .map(|&size| LinearConfig::new(size, config.encoder_size).init(device))
        .collect();

    let mut width = config.merged_size();
    let mut dense = Vec::with_capacity(config.dense_layers.len());
    for &units in &config.dense_layers {
        dense.push(LinearConfig::new(width, units).init(device));
        width = units;
    }

    let decoders = config
        .output_sizes
        .iter()
        .map(|&size| LinearConfig::new(width, size).init(device))
        .collect();

    MultimodalModel {
        encoders,
        dense,
        decoders,
        dropout: DropoutConfig::new(config.dropout).init(),
    }
}

/// Apply a head activation to a batch of logits
pub fn activate<B: Backend>(logits: Tensor<B, 2>, activation: HeadActivation) -> Tensor<B, 2> {
    match activation {
        HeadActivation::Identity => logits,
        HeadActivation::Sigmoid => sigmoid(logits),
        HeadActivation::Softmax { channels } => {
            let [batch, size] = logits.dims();
            softmax(logits.reshape([batch, size / channels, channels]), 2).reshape([batch, size])
        }
    }
}

/// Flatten a batch to `[batch, size]`; non-finite inputs become zero
pub fn to_tensor<B: Backend>(array: &ArrayD<f32>, size: usize, device: &B::Device) -> Result<Tensor<B, 2>> {
    let batch = array.shape().first().copied().unwrap_or(0);
    if array.len() != batch * size {
        bail!(
            "Expected {} values per sample, got shape {:?}",
            size,
            array.shape()
        );
    }
    let values: Vec<f32> = array
        .iter()
        .map(|&x| if x.is_finite() { x } else { 0.0 })
        .collect();
    Ok(Tensor::from_data(TensorData::new(values, [batch, size]), device))
}

/// Copy a tensor back to the host with the given per-sample shape
pub fn to_array<B: Backend, const D: usize>(tensor: Tensor<B, D>, sample_shape: &[usize]) -> Result<ArrayD<f32>> {
    let batch = tensor.dims()[0];
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Failed to read tensor data: {:?}", e))?;
    let mut shape = vec![batch];
    shape.extend_from_slice(sample_shape);
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
}

/// Gather model inputs from a batch dictionary in input-map order
pub fn input_tensors<B: Backend>(
    maps: &[TensorMap],
    inputs: &TensorDict,
    device: &B::Device,
) -> Result<Vec<Tensor<B, 2>>> {
    maps.iter()
        .map(|tm| {
            let array = inputs
                .get(&tm.input_name())
                .ok_or_else(|| anyhow!("Batch has no input {}", tm.input_name()))?;
            to_tensor(array, tm.size(), device)
        })
        .collect()
}

/// A burn network together with the tensor maps it was built for
#[derive(Debug)]
pub struct BurnModel<B: Backend> {
    name: String,
    network: MultimodalModel<B>,
    inputs: Vec<TensorMap>,
    outputs: Vec<TensorMap>,
    config: ModelConfig,
    device: B::Device,
}

impl<B: Backend> BurnModel<B> {
    /// Freshly initialized model
    pub fn new(
        name: &str,
        inputs: Vec<TensorMap>,
        outputs: Vec<TensorMap>,
        config: ModelConfig,
        device: &B::Device,
    ) -> Self {
        let network = init_model(&config, device);
        Self::from_parts(name, network, inputs, outputs, config, device)
    }

    pub fn from_parts(
        name: &str,
        network: MultimodalModel<B>,
        inputs: Vec<TensorMap>,
        outputs: Vec<TensorMap>,
        config: ModelConfig,
        device: &B::Device,
    ) -> Self {
        Self {
            name: name.to_string(),
            network,
            inputs,
            outputs,
            config,
            device: device.clone(),
        }
    }

    pub fn network(&self) -> &MultimodalModel<B> {
        &self.network
    }

    pub fn into_network(self) -> MultimodalModel<B> {
        self.network
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    fn forward_dict(&self, inputs: &TensorDict) -> Result<MultimodalOutput<B>> {
        let tensors = input_tensors(&self.inputs, inputs, &self.device)?;
        Ok(self.network.forward(tensors))
    }
}

impl<B: Backend> Model for BurnModel<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_maps(&self) -> &[TensorMap] {
        &self.inputs
    }

    fn output_maps(&self) -> &[TensorMap] {
        &self.outputs
    }

    fn layer_names(&self) -> Vec<String> {
        layer_names(&self.inputs, self.config.dense_layers.len())
    }

    fn predict(&self, inputs: &TensorDict) -> Result<TensorDict> {
        let output = self.forward_dict(inputs)?;
        let mut predictions = TensorDict::new();
        for (tm, logits) in self.outputs.iter().zip(output.logits) {
            let activated = activate(logits, HeadActivation::for_map(tm));
            predictions.insert(tm.output_name(), to_array(activated, &tm.shape)?);
        }
        Ok(predictions)
    }

    fn hidden(&self, layer: &str, inputs: &TensorDict) -> Result<Array2<f32>> {
        let output = self.forward_dict(inputs)?;

        let activation = if let Some(name) = layer.strip_prefix("encoder_") {
            let index = self
                .inputs
                .iter()
                .position(|tm| tm.name == name)
                .ok_or_else(|| self.missing_layer(layer))?;
            output.encoded[index].clone()
        } else if layer == EMBED_LAYER {
            output.embed()
        } else if layer == MERGE_LAYER {
            output.merged.clone()
        } else if let Some(index) = layer
            .strip_prefix("dense_")
            .and_then(|i| i.parse::<usize>().ok())
            .filter(|&i| i >= 1 && i <= output.dense.len())
        {
            output.dense[index - 1].clone()
        } else {
            return Err(self.missing_layer(layer).into());
        };

        let [batch, width] = activation.dims();
        let values = to_array(activation, &[width])?;
        Ok(values.into_shape_with_order((batch, width))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor_map::{ChannelMap, Interpretation};
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn test_model() -> BurnModel<TestBackend> {
        let device = Default::default();
        let inputs = vec![
            TensorMap::new("ecg", &[6, 2], Interpretation::Continuous),
            TensorMap::new("bmi", &[1], Interpretation::Continuous),
        ];
        let outputs = vec![
            TensorMap::new("sex", &[2], Interpretation::Categorical)
                .with_channel_map(ChannelMap::new([("female", 0), ("male", 1)])),
            TensorMap::new("age", &[1], Interpretation::Continuous),
        ];
        let config = ModelConfig::for_maps(&inputs, &outputs)
            .with_encoder_size(4)
            .with_dense_layers(vec![8, 3]);
        BurnModel::new("test_model", inputs, outputs, config, &device)
    }

    fn test_inputs(batch: usize) -> TensorDict {
        let mut inputs = TensorDict::new();
        inputs.insert(
            "input_ecg_continuous".to_string(),
            ArrayD::from_elem(IxDyn(&[batch, 6, 2]), 0.5),
        );
        inputs.insert(
            "input_bmi_continuous".to_string(),
            ArrayD::from_elem(IxDyn(&[batch, 1]), f32::NAN),
        );
        inputs
    }

    #[test]
    fn test_model_forward() {
        let device = Default::default();
        let config = ModelConfig::new(vec![5, 3], vec![2]).with_encoder_size(4);
        let model = init_model::<TestBackend>(&config, &device);

        let inputs = vec![
            Tensor::<TestBackend, 2>::zeros([2, 5], &device),
            Tensor::<TestBackend, 2>::zeros([2, 3], &device),
        ];
        let output = model.forward(inputs);

        assert_eq!(output.merged.dims(), [2, 8]);
        assert_eq!(output.embed().dims(), [2, 32]);
        assert_eq!(output.logits[0].dims(), [2, 2]);
    }

    #[test]
    fn test_predict_applies_activations() {
        let model = test_model();
        let predictions = model.predict(&test_inputs(3)).unwrap();

        let sex = &predictions["output_sex_categorical"];
        assert_eq!(sex.shape(), &[3, 2]);
        for row in sex.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
        assert_eq!(predictions["output_age_continuous"].shape(), &[3, 1]);
    }

    #[test]
    fn test_hidden_layers() {
        let model = test_model();
        let inputs = test_inputs(2);

        assert_eq!(model.hidden("embed", &inputs).unwrap().dim(), (2, 3));
        assert_eq!(model.hidden("dense_1", &inputs).unwrap().dim(), (2, 8));
        assert_eq!(model.hidden("encoder_ecg", &inputs).unwrap().dim(), (2, 4));
        assert_eq!(model.hidden("concatenate", &inputs).unwrap().dim(), (2, 8));
        assert!(model.hidden("dense_9", &inputs).is_err());
        assert!(model.has_layer("encoder_bmi"));
        assert!(!model.has_layer("encoder_sex"));
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let model = test_model();
        let mut inputs = test_inputs(1);
        inputs.remove("input_bmi_continuous");
        assert!(model.predict(&inputs).is_err());
    }
}
