use std::path::PathBuf;
use thiserror::Error;

/// Failures that abort a single recipe invocation.
#[derive(Debug, Error)]
pub enum RecipeError {
    /// Mode string did not name any recipe
    #[error("Unknown mode: {0}")]
    UnknownMode(String),

    /// The learning rate finder could not suggest a rate
    #[error("Could not find learning rate.")]
    MissingLearningRate,

    /// A tensor map name was not present in the registry
    #[error("Unknown tensor map: {0}")]
    UnknownTensorMap(String),

    /// No tensor files matched in the tensors directory
    #[error("No tensors found in {0:?}")]
    NoTensors(PathBuf),

    /// A model does not expose the requested layer
    #[error("Model {model} has no layer named {layer}")]
    MissingLayer { model: String, layer: String },

    /// Inconsistent or incomplete run configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
