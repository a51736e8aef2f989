use crate::model::architecture::{init_model, BurnModel};
use crate::model::{Model, ModelConfig};
use crate::tensor_map::TensorMap;
use crate::utils::ensure_dir;
use anyhow::{anyhow, Context, Result};
use burn::prelude::*;
use burn::record::CompactRecorder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Sidecar written next to every saved model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Crate version that wrote the model
    pub version: String,
    /// Model name
    pub name: String,
    /// Training epoch the weights come from
    pub epoch: usize,
    /// Validation loss at that epoch
    pub val_loss: Option<f64>,
    /// Input tensor maps, in encoder order
    pub inputs: Vec<TensorMap>,
    /// Output tensor maps, in decoder order
    pub outputs: Vec<TensorMap>,
    /// Network configuration
    pub model_config: ModelConfig,
}

impl ModelMetadata {
    pub fn for_model<B: Backend>(model: &BurnModel<B>, epoch: usize, val_loss: Option<f64>) -> Self {
        Self {
            version: crate::VERSION.to_string(),
            name: model.name().to_string(),
            epoch,
            val_loss,
            inputs: model.input_maps().to_vec(),
            outputs: model.output_maps().to_vec(),
            model_config: model.config().clone(),
        }
    }
}

/// Metadata sidecar path of a model file
pub fn metadata_path<P: AsRef<Path>>(model_file: P) -> PathBuf {
    model_file.as_ref().with_extension("json")
}

/// Model name derived from its file: the file stem
pub fn model_name<P: AsRef<Path>>(model_file: P) -> String {
    model_file
        .as_ref()
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Read a model's metadata sidecar
pub fn read_metadata<P: AsRef<Path>>(model_file: P) -> Result<ModelMetadata> {
    let path = metadata_path(&model_file);
    let json = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read model metadata {:?}", path))?;
    serde_json::from_str(&json).with_context(|| format!("Failed to parse model metadata {:?}", path))
}

/// Save model weights and their metadata sidecar
pub fn save_model<B: Backend>(
    model: &BurnModel<B>,
    model_file: &Path,
    epoch: usize,
    val_loss: Option<f64>,
) -> Result<()> {
    if let Some(parent) = model_file.parent() {
        ensure_dir(parent)?;
    }

    model
        .network()
        .clone()
        .save_file(model_file.to_path_buf(), &CompactRecorder::new())
        .map_err(|e| anyhow!("Failed to save model {:?}: {:?}", model_file, e))?;

    let metadata = ModelMetadata::for_model(model, epoch, val_loss);
    let json = serde_json::to_string_pretty(&metadata).context("Failed to serialize metadata")?;
    fs::write(metadata_path(model_file), json).context("Failed to write metadata file")?;

    info!("Saved model: {:?}", model_file);
    Ok(())
}

/// Load a saved model; its tensor maps come from the metadata sidecar
pub fn load_model<B: Backend>(model_file: &Path, device: &B::Device) -> Result<BurnModel<B>> {
    info!("Loading model from {:?}", model_file);
    let metadata = read_metadata(model_file)?;

    let network = init_model::<B>(&metadata.model_config, device)
        .load_file(model_file.to_path_buf(), &CompactRecorder::new(), device)
        .map_err(|e| anyhow!("Failed to load model {:?}: {:?}", model_file, e))?;

    Ok(BurnModel::from_parts(
        &model_name(model_file),
        network,
        metadata.inputs,
        metadata.outputs,
        metadata.model_config,
        device,
    ))
}

/// Build a fresh model, or load one when a model file is given
pub fn make_model<B: Backend>(
    model_file: Option<&Path>,
    name: &str,
    inputs: &[TensorMap],
    outputs: &[TensorMap],
    config: ModelConfig,
    device: &B::Device,
) -> Result<BurnModel<B>> {
    match model_file {
        Some(path) => {
            let model = load_model::<B>(path, device)?;
            let same_outputs = model.output_maps().len() == outputs.len()
                && model
                    .output_maps()
                    .iter()
                    .zip(outputs)
                    .all(|(a, b)| a.output_name() == b.output_name());
            if !outputs.is_empty() && !same_outputs {
                warn!(
                    "Model {:?} was saved with different outputs than requested; using the saved ones",
                    path
                );
            }
            Ok(model)
        }
        None => {
            info!(
                "Building model {} with {} inputs and {} outputs",
                name,
                inputs.len(),
                outputs.len()
            );
            Ok(BurnModel::new(name, inputs.to_vec(), outputs.to_vec(), config, device))
        }
    }
}

/// Save each encoder, each decoder and the dense merger as standalone files
pub fn save_components<B: Backend>(model: &BurnModel<B>, dir: &Path) -> Result<Vec<PathBuf>> {
    ensure_dir(dir)?;
    let recorder = CompactRecorder::new();
    let network = model.network();
    let mut saved = Vec::new();

    for (tm, encoder) in model.input_maps().iter().zip(network.encoders()) {
        let path = dir.join(format!("encoder_{}.mpk", tm.name));
        encoder
            .clone()
            .save_file(path.clone(), &recorder)
            .map_err(|e| anyhow!("Failed to save {:?}: {:?}", path, e))?;
        saved.push(path);
    }

    for (tm, decoder) in model.output_maps().iter().zip(network.decoders()) {
        let path = dir.join(format!("decoder_{}.mpk", tm.name));
        decoder
            .clone()
            .save_file(path.clone(), &recorder)
            .map_err(|e| anyhow!("Failed to save {:?}: {:?}", path, e))?;
        saved.push(path);
    }

    if !network.merger().is_empty() {
        let path = dir.join("merger.mpk");
        network
            .merger()
            .to_vec()
            .save_file(path.clone(), &recorder)
            .map_err(|e| anyhow!("Failed to save {:?}: {:?}", path, e))?;
        saved.push(path);
    }

    info!("Saved {} model components to {:?}", saved.len(), dir);
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TensorDict;
    use crate::tensor_map::Interpretation;
    use burn::backend::NdArray;
    use ndarray::{ArrayD, IxDyn};
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn test_model() -> BurnModel<TestBackend> {
        let inputs = vec![TensorMap::new("ecg", &[4], Interpretation::Continuous)];
        let outputs = vec![
            TensorMap::new("age", &[1], Interpretation::Continuous),
            TensorMap::new("lax", &[3, 3], Interpretation::Continuous),
        ];
        let config = ModelConfig::for_maps(&inputs, &outputs)
            .with_encoder_size(4)
            .with_dense_layers(vec![5]);
        BurnModel::new("ecg_age", inputs, outputs, config, &Default::default())
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("ecg_age.mpk");
        let model = test_model();
        save_model(&model, &path, 3, Some(0.25)).unwrap();

        assert!(path.exists());
        let metadata = read_metadata(&path).unwrap();
        assert_eq!(metadata.epoch, 3);
        assert_eq!(metadata.outputs.len(), 2);

        let loaded = load_model::<TestBackend>(&path, &Default::default()).unwrap();
        assert_eq!(loaded.name(), "ecg_age");
        assert_eq!(loaded.output_maps(), model.output_maps());

        let mut inputs = TensorDict::new();
        inputs.insert(
            "input_ecg_continuous".to_string(),
            ArrayD::from_elem(IxDyn(&[2, 4]), 1.0),
        );
        let expected = model.predict(&inputs).unwrap();
        let actual = loaded.predict(&inputs).unwrap();
        let a = &expected["output_age_continuous"];
        let b = &actual["output_age_continuous"];
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-2);
        }
    }

    #[test]
    fn test_save_components() {
        let dir = TempDir::new().unwrap();
        let saved = save_components(&test_model(), dir.path()).unwrap();
        let names: Vec<String> = saved
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["encoder_ecg.mpk", "decoder_age.mpk", "decoder_lax.mpk", "merger.mpk"]
        );
        assert!(saved.iter().all(|p| p.exists()));
    }

    #[test]
    fn test_model_name_is_file_stem() {
        assert_eq!(model_name("/out/run_1/run_1.mpk"), "run_1");
    }
}
