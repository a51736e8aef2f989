use crate::data::{SplitConfig, MODEL_EXT};
use crate::error::RecipeError;
use crate::model::{ModelConfig, EMBED_LAYER};
use crate::tensor_map::{TensorMap, TensorMapRegistry};
use crate::training::TrainingConfig;
use crate::utils::{in_range, positive};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything one recipe invocation needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub mode: String,
    /// Run identifier; outputs go to `<output_folder>/<id>/`
    pub id: String,
    pub output_folder: PathBuf,
    /// Directory of per-sample tensor files
    pub tensors: PathBuf,
    /// Optional CSV whose first column lists the sample ids to use
    pub sample_csv: Option<PathBuf>,
    /// TSV id column style; containing `genetics` writes `FID` and `IID`
    pub tsv_style: String,
    pub model_file: Option<PathBuf>,
    /// Models compared by the compare modes
    pub model_files: Vec<PathBuf>,
    /// JSON file of tensor map definitions
    pub tensor_maps: Option<PathBuf>,
    pub input_tensors: Vec<String>,
    pub output_tensors: Vec<String>,
    /// Covariates only used to color embedding plots
    pub protected_tensors: Vec<String>,
    pub hidden_layer: String,

    pub batch_size: usize,
    pub epochs: usize,
    pub training_steps: usize,
    pub validation_steps: usize,
    pub test_steps: usize,
    pub learning_rate: f64,
    pub learning_rate_schedule: Option<String>,
    pub patience: usize,
    pub save_last_model: bool,

    pub dense_layers: Vec<usize>,
    pub encoder_size: usize,
    pub dropout: f64,

    pub seed: u64,
    pub valid_ratio: f32,
    pub test_ratio: f32,

    /// `tsne` plots hidden-layer embeddings after evaluation
    pub embed_visualization: Option<String>,
    pub alpha: f32,
}

impl Default for RunConfig {
    fn default() -> Self {
        let training = TrainingConfig::default();
        let split = SplitConfig::default();
        Self {
            mode: "train".to_string(),
            id: "no_id".to_string(),
            output_folder: PathBuf::from("./recipes_output"),
            tensors: PathBuf::from("./tensors"),
            sample_csv: None,
            tsv_style: "standard".to_string(),
            model_file: None,
            model_files: Vec::new(),
            tensor_maps: None,
            input_tensors: Vec::new(),
            output_tensors: Vec::new(),
            protected_tensors: Vec::new(),
            hidden_layer: EMBED_LAYER.to_string(),
            batch_size: training.batch_size,
            epochs: training.epochs,
            training_steps: training.training_steps,
            validation_steps: training.validation_steps,
            test_steps: 32,
            learning_rate: training.learning_rate,
            learning_rate_schedule: None,
            patience: training.early_stopping_patience,
            save_last_model: false,
            dense_layers: vec![64, 32],
            encoder_size: 32,
            dropout: 0.0,
            seed: training.seed,
            valid_ratio: split.val_ratio,
            test_ratio: split.test_ratio,
            embed_visualization: None,
            alpha: 0.5,
        }
    }
}

/// Tensor maps of a run, resolved from their names
#[derive(Debug, Clone, Default)]
pub struct ResolvedMaps {
    pub inputs: Vec<TensorMap>,
    pub outputs: Vec<TensorMap>,
    pub protected: Vec<TensorMap>,
}

impl ResolvedMaps {
    /// Outputs followed by protected covariates: every label a generator reads
    pub fn labels(&self) -> Vec<TensorMap> {
        self.outputs.iter().chain(&self.protected).cloned().collect()
    }
}

impl RunConfig {
    /// `<output_folder>/<id>/`
    pub fn run_folder(&self) -> PathBuf {
        self.output_folder.join(&self.id)
    }

    /// Where a trained model is written: `<output_folder>/<id>/<id>.mpk`
    pub fn trained_model_file(&self) -> PathBuf {
        self.run_folder().join(format!("{}{}", self.id, MODEL_EXT))
    }

    pub fn model_file(&self) -> Option<&Path> {
        self.model_file.as_deref()
    }

    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            training_steps: self.training_steps,
            validation_steps: self.validation_steps,
            learning_rate: self.learning_rate,
            learning_rate_schedule: self.learning_rate_schedule.clone(),
            early_stopping_patience: self.patience,
            seed: self.seed,
            save_last_model: self.save_last_model,
        }
    }

    pub fn split_config(&self) -> SplitConfig {
        SplitConfig::new(self.valid_ratio, self.test_ratio, self.seed)
    }

    pub fn model_config(&self, maps: &ResolvedMaps) -> ModelConfig {
        ModelConfig::for_maps(&maps.inputs, &maps.outputs)
            .with_encoder_size(self.encoder_size)
            .with_dense_layers(self.dense_layers.clone())
            .with_dropout(self.dropout)
    }

    /// Reject values no recipe can run with
    pub fn validate(&self) -> Result<()> {
        positive(self.batch_size, "batch_size")?;
        positive(self.learning_rate, "learning_rate")?;
        in_range(self.valid_ratio, 0.0, 1.0, "valid_ratio")?;
        in_range(self.test_ratio, 0.0, 1.0, "test_ratio")?;
        in_range(self.dropout, 0.0, 1.0, "dropout")?;
        in_range(self.alpha, 0.0, 1.0, "alpha")?;
        if self.valid_ratio + self.test_ratio >= 1.0 {
            return Err(RecipeError::InvalidConfig(format!(
                "valid_ratio {} and test_ratio {} leave no training samples",
                self.valid_ratio, self.test_ratio
            ))
            .into());
        }
        Ok(())
    }

    /// Resolve input, output and protected map names against the registry
    pub fn resolve_maps(&self) -> Result<ResolvedMaps> {
        let names = self.input_tensors.len() + self.output_tensors.len() + self.protected_tensors.len();
        let registry = match &self.tensor_maps {
            Some(path) => TensorMapRegistry::load(path)?,
            None if names == 0 => TensorMapRegistry::default(),
            None => {
                return Err(RecipeError::InvalidConfig(
                    "tensor map names were given without a --tensor-maps file".to_string(),
                )
                .into())
            }
        };
        Ok(ResolvedMaps {
            inputs: registry.resolve(&self.input_tensors)?,
            outputs: registry.resolve(&self.output_tensors)?,
            protected: registry.resolve(&self.protected_tensors)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor_map::Interpretation;
    use tempfile::TempDir;

    #[test]
    fn test_paths() {
        let config = RunConfig {
            id: "ecg_age".to_string(),
            output_folder: PathBuf::from("/out"),
            ..RunConfig::default()
        };
        assert_eq!(config.run_folder(), PathBuf::from("/out/ecg_age"));
        assert_eq!(config.trained_model_file(), PathBuf::from("/out/ecg_age/ecg_age.mpk"));
    }

    #[test]
    fn test_training_config_follows_run() {
        let config = RunConfig {
            epochs: 3,
            patience: 1,
            learning_rate_schedule: Some("cosine".to_string()),
            ..RunConfig::default()
        };
        let training = config.training_config();
        assert_eq!(training.epochs, 3);
        assert_eq!(training.early_stopping_patience, 1);
        assert_eq!(training.learning_rate_schedule.as_deref(), Some("cosine"));
    }

    #[test]
    fn test_resolve_maps() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("maps.json");
        let maps = vec![
            TensorMap::new("ecg", &[8], Interpretation::Continuous),
            TensorMap::new("age", &[1], Interpretation::Continuous),
        ];
        std::fs::write(&path, serde_json::to_string(&maps).unwrap()).unwrap();

        let config = RunConfig {
            tensor_maps: Some(path),
            input_tensors: vec!["ecg".to_string()],
            output_tensors: vec!["age".to_string()],
            ..RunConfig::default()
        };
        let resolved = config.resolve_maps().unwrap();
        assert_eq!(resolved.inputs[0].name, "ecg");
        assert_eq!(resolved.labels().len(), 1);

        let missing = RunConfig {
            protected_tensors: vec!["sex".to_string()],
            ..config
        };
        let err = missing.resolve_maps().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecipeError>(),
            Some(RecipeError::UnknownTensorMap(name)) if name == "sex"
        ));
    }

    #[test]
    fn test_validate() {
        assert!(RunConfig::default().validate().is_ok());
        let no_batch = RunConfig {
            batch_size: 0,
            ..RunConfig::default()
        };
        assert!(no_batch.validate().is_err());
        let no_training = RunConfig {
            valid_ratio: 0.5,
            test_ratio: 0.5,
            ..RunConfig::default()
        };
        assert!(no_training.validate().is_err());
    }

    #[test]
    fn test_names_need_registry() {
        let config = RunConfig {
            input_tensors: vec!["ecg".to_string()],
            ..RunConfig::default()
        };
        assert!(config.resolve_maps().is_err());
    }
}
