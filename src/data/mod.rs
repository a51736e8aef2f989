pub mod archive;
pub mod generator;
pub mod loader;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File extension of per-sample tensor files
pub const TENSOR_EXT: &str = ".tensor";

/// File extension of saved model weights
pub const MODEL_EXT: &str = ".mpk";

/// Tensors keyed by input or output name, batch axis first
pub type TensorDict = BTreeMap<String, ArrayD<f32>>;

/// One generator pull
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Model inputs keyed by `TensorMap::input_name`
    pub inputs: TensorDict,
    /// Labels keyed by `TensorMap::output_name`
    pub outputs: TensorDict,
    /// Source file of every sample in the batch
    pub paths: Vec<PathBuf>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Dataset split configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Training set ratio
    pub train_ratio: f32,
    /// Validation set ratio
    pub val_ratio: f32,
    /// Test set ratio
    pub test_ratio: f32,
    /// Random seed
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train_ratio: 0.7,
            val_ratio: 0.2,
            test_ratio: 0.1,
            seed: 2026,
        }
    }
}

impl SplitConfig {
    pub fn new(val_ratio: f32, test_ratio: f32, seed: u64) -> Self {
        Self {
            train_ratio: 1.0 - val_ratio - test_ratio,
            val_ratio,
            test_ratio,
            seed,
        }
    }
}

/// Sample id of a tensor file: its file name without `TENSOR_EXT`
pub fn sample_id_from_path<P: AsRef<Path>>(path: P) -> String {
    let name = path
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.strip_suffix(TENSOR_EXT) {
        Some(stem) => stem.to_string(),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_id_from_path() {
        assert_eq!(sample_id_from_path("/data/tensors/1000107.tensor"), "1000107");
        assert_eq!(sample_id_from_path("relative/abc"), "abc");
    }
}
