//! # mmrecipes: workflow recipes for multimodal medical tensor models
//!
//! Every sample lives in its own tensor file. Tensor maps describe how to
//! read one named tensor from those files and how to interpret it; models
//! are built from input and output tensor maps, and recipes glue data,
//! models, training, evaluation and inference together.
//!
//! ## Recipes
//!
//! - `train`, `train_legacy`, `train_shallow`: fit a model, then evaluate it
//!   on held-out samples
//! - `test`, `test_scalar`: evaluate a saved model
//! - `compare`, `compare_scalar`: evaluate several saved models on their
//!   shared outputs
//! - `infer`, `infer_hidden`, `infer_encoders`: per-sample TSV inference
//! - `find_learning_rate`, `find_learning_rate_and_train`: learning rate
//!   sweep, optionally followed by training
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use mmrecipes::recipes::{run, RunConfig};
//! use std::path::PathBuf;
//!
//! let config = RunConfig {
//!     mode: "train".to_string(),
//!     id: "ecg_age".to_string(),
//!     tensors: PathBuf::from("/data/tensors"),
//!     tensor_maps: Some(PathBuf::from("maps.json")),
//!     input_tensors: vec!["ecg_rest".to_string()],
//!     output_tensors: vec!["age".to_string()],
//!     ..RunConfig::default()
//! };
//! let report = run(&config);
//! assert!(report.succeeded());
//! ```

pub mod cli;
pub mod compare;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod model;
pub mod predict;
pub mod recipes;
pub mod tensor_map;
pub mod training;
pub mod utils;

use burn::backend::{Autodiff, NdArray};

/// Backend used for evaluation and inference
pub type InferenceBackend = NdArray<f32>;

/// Backend used for training
pub type TrainingBackend = Autodiff<InferenceBackend>;

/// Re-export commonly used types
pub use data::archive::TensorArchive;
pub use data::{Batch, TensorDict};
pub use error::RecipeError;
pub use model::{Model, ModelConfig};
pub use recipes::{Mode, RunConfig, RunReport};
pub use tensor_map::{Interpretation, TensorMap, TensorMapRegistry};
pub use training::{TrainingConfig, TrainingResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!(
        "{} v{} - workflow recipes for multimodal tensor models",
        NAME, VERSION
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_info() {
        let info_str = info();
        assert!(info_str.contains("mmrecipes"));
        assert!(info_str.contains(VERSION));
    }
}
