pub mod architecture;
pub mod checkpoint;
pub mod loss;

use crate::data::TensorDict;
use crate::error::RecipeError;
use crate::tensor_map::{Interpretation, TensorMap};
use anyhow::Result;
use burn::prelude::*;
use ndarray::Array2;

/// Name of the layer joining all encoder outputs
pub const MERGE_LAYER: &str = "concatenate";

/// Name of the last dense layer, the default embedding layer
pub const EMBED_LAYER: &str = "embed";

/// Model configuration
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Flattened size of every input map, in input order
    pub input_sizes: Vec<usize>,

    /// Flattened size of every output map, in output order
    pub output_sizes: Vec<usize>,

    /// Width of each per-input encoder
    #[config(default = "32")]
    pub encoder_size: usize,

    /// Widths of the dense layers after the merge; the last one is `embed`
    #[config(default = "vec![64, 32]")]
    pub dense_layers: Vec<usize>,

    /// Dropout rate
    #[config(default = "0.0")]
    pub dropout: f64,
}

impl ModelConfig {
    /// Configuration sized for the given input and output maps
    pub fn for_maps(inputs: &[TensorMap], outputs: &[TensorMap]) -> Self {
        Self::new(
            inputs.iter().map(|tm| tm.size()).collect(),
            outputs.iter().map(|tm| tm.size()).collect(),
        )
    }

    /// Width of the merged encoder outputs
    pub fn merged_size(&self) -> usize {
        self.encoder_size * self.input_sizes.len()
    }

    /// Width of the embedding fed to every decoder
    pub fn embed_size(&self) -> usize {
        self.dense_layers
            .last()
            .copied()
            .unwrap_or_else(|| self.merged_size())
    }
}

/// Activation applied to a decoder's logits at prediction time
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeadActivation {
    Identity,
    Sigmoid,
    /// Softmax over consecutive groups of `channels` units
    Softmax { channels: usize },
}

impl HeadActivation {
    pub fn for_map(tm: &TensorMap) -> Self {
        match tm.interpretation {
            Interpretation::Continuous => Self::Identity,
            Interpretation::Categorical | Interpretation::Language => Self::Softmax {
                channels: tm.channels().max(1),
            },
            Interpretation::SurvivalCurve | Interpretation::TimeToEvent => Self::Sigmoid,
        }
    }
}

/// Names of every addressable layer, in forward order
pub fn layer_names(inputs: &[TensorMap], dense_layers: usize) -> Vec<String> {
    let mut names: Vec<String> = inputs
        .iter()
        .map(|tm| format!("encoder_{}", tm.name))
        .collect();
    if dense_layers == 0 {
        names.push(EMBED_LAYER.to_string());
        return names;
    }
    names.push(MERGE_LAYER.to_string());
    for i in 1..dense_layers {
        names.push(format!("dense_{}", i));
    }
    names.push(EMBED_LAYER.to_string());
    names
}

/// A trained model as seen by the workflows
pub trait Model {
    /// Display name, the model file stem
    fn name(&self) -> &str;

    fn input_maps(&self) -> &[TensorMap];

    fn output_maps(&self) -> &[TensorMap];

    fn layer_names(&self) -> Vec<String>;

    /// Predictions keyed by output name, activation applied
    fn predict(&self, inputs: &TensorDict) -> Result<TensorDict>;

    /// Activations of one named layer, one row per sample
    fn hidden(&self, layer: &str, inputs: &TensorDict) -> Result<Array2<f32>>;

    fn has_layer(&self, layer: &str) -> bool {
        self.layer_names().iter().any(|name| name == layer)
    }

    /// Whether an output map is one of this model's output layers
    fn has_output(&self, tm: &TensorMap) -> bool {
        self.output_maps()
            .iter()
            .any(|out| out.output_name() == tm.output_name())
    }

    fn missing_layer(&self, layer: &str) -> RecipeError {
        RecipeError::MissingLayer {
            model: self.name().to_string(),
            layer: layer.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_sizes() {
        let inputs = vec![
            TensorMap::new("ecg", &[10, 2], Interpretation::Continuous),
            TensorMap::new("age", &[1], Interpretation::Continuous),
        ];
        let outputs = vec![TensorMap::new("sex", &[2], Interpretation::Categorical)];
        let config = ModelConfig::for_maps(&inputs, &outputs).with_encoder_size(8);

        assert_eq!(config.input_sizes, vec![20, 1]);
        assert_eq!(config.output_sizes, vec![2]);
        assert_eq!(config.merged_size(), 16);
        assert_eq!(config.embed_size(), 32);
        assert_eq!(config.with_dense_layers(vec![]).embed_size(), 16);
    }

    #[test]
    fn test_layer_names() {
        let inputs = vec![TensorMap::new("ecg", &[4], Interpretation::Continuous)];
        assert_eq!(
            layer_names(&inputs, 3),
            vec!["encoder_ecg", "concatenate", "dense_1", "dense_2", "embed"]
        );
        assert_eq!(layer_names(&inputs, 0), vec!["encoder_ecg", "embed"]);
    }

    #[test]
    fn test_head_activation() {
        let sex = TensorMap::new("sex", &[2], Interpretation::Categorical);
        assert_eq!(HeadActivation::for_map(&sex), HeadActivation::Softmax { channels: 2 });
        let age = TensorMap::new("age", &[1], Interpretation::Continuous);
        assert_eq!(HeadActivation::for_map(&age), HeadActivation::Identity);
    }
}
