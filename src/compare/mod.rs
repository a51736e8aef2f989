//! Side-by-side evaluation of several saved models.
//!
//! Only outputs produced by every model are compared. Predictions are
//! gathered into a table keyed by output name, then by model name, and handed
//! to the evaluation dispatch with one series per model.

use crate::data::generator::{concatenate_dicts, BatchSource};
use crate::data::TensorDict;
use crate::evaluate::plots::PlotSink;
use crate::evaluate::{evaluate_predictions, FigureCollector, PerformanceMetrics, PredictionSeries};
use crate::model::checkpoint::{load_model, model_name, read_metadata};
use crate::model::Model;
use crate::tensor_map::TensorMap;
use anyhow::{Context, Result};
use burn::prelude::Backend;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Output name to per-model predictions
pub type PredictionTable = BTreeMap<String, PredictionSeries>;

/// Where a model lives and what it consumes and produces
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub path: PathBuf,
    pub name: String,
    pub inputs: Vec<TensorMap>,
    pub outputs: Vec<TensorMap>,
}

/// Read every model's tensor maps from its metadata sidecar
pub fn model_inputs_outputs(model_files: &[PathBuf]) -> Result<Vec<ModelSpec>> {
    model_files
        .iter()
        .map(|path| {
            let metadata = read_metadata(path)
                .with_context(|| format!("Failed to read tensor maps of model {:?}", path))?;
            Ok(ModelSpec {
                path: path.clone(),
                name: model_name(path),
                inputs: metadata.inputs,
                outputs: metadata.outputs,
            })
        })
        .collect()
}

/// Outputs every model produces, in the first model's order
pub fn common_outputs(specs: &[ModelSpec]) -> Vec<TensorMap> {
    let Some((first, rest)) = specs.split_first() else {
        return Vec::new();
    };
    let shared: BTreeSet<String> = rest.iter().fold(
        first.outputs.iter().map(TensorMap::output_name).collect(),
        |acc, spec| {
            let names: BTreeSet<String> = spec.outputs.iter().map(TensorMap::output_name).collect();
            acc.intersection(&names).cloned().collect()
        },
    );
    first
        .outputs
        .iter()
        .filter(|tm| shared.contains(&tm.output_name()))
        .cloned()
        .collect()
}

/// Union of all model inputs, deduplicated by input name
pub fn union_inputs(specs: &[ModelSpec]) -> Vec<TensorMap> {
    let mut seen = BTreeSet::new();
    specs
        .iter()
        .flat_map(|spec| spec.inputs.iter())
        .filter(|tm| seen.insert(tm.input_name()))
        .cloned()
        .collect()
}

/// Turns a [`ModelSpec`] into a usable model
pub trait ModelLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn Model>>;
}

impl<F> ModelLoader for F
where
    F: Fn(&ModelSpec) -> Result<Box<dyn Model>>,
{
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn Model>> {
        self(spec)
    }
}

/// Loads burn checkpoints onto one device
pub struct CheckpointLoader<B: Backend> {
    device: B::Device,
}

impl<B: Backend> CheckpointLoader<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> ModelLoader for CheckpointLoader<B> {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn Model>> {
        Ok(Box::new(load_model::<B>(&spec.path, &self.device)?))
    }
}

fn record_predictions(
    table: &mut PredictionTable,
    model_name: &str,
    common: &[TensorMap],
    predictions: &TensorDict,
) {
    for tm in common {
        match predictions.get(&tm.output_name()) {
            Some(prediction) => {
                table
                    .entry(tm.output_name())
                    .or_default()
                    .insert(model_name.to_string(), prediction.clone());
            }
            None => warn!("Model {} produced no {} prediction", model_name, tm.name),
        }
    }
}

/// Predict one shared batch with every model, loading them one at a time
pub fn gather_predictions(
    specs: &[ModelSpec],
    loader: &dyn ModelLoader,
    common: &[TensorMap],
    inputs: &TensorDict,
) -> Result<PredictionTable> {
    let mut table = PredictionTable::new();
    for spec in specs {
        let model = loader.load(spec)?;
        let predictions = model.predict(inputs)?;
        record_predictions(&mut table, &spec.name, common, &predictions);
        info!("Gathered predictions from model {}", spec.name);
    }
    Ok(table)
}

/// Predictions of every model over `steps` shared generator batches.
///
/// All models are loaded first so each streamed batch is reused by every
/// model. Labels for the common outputs are collected once.
pub fn scalar_predictions_from_generator(
    specs: &[ModelSpec],
    loader: &dyn ModelLoader,
    common: &[TensorMap],
    generator: &mut dyn BatchSource,
    steps: usize,
) -> Result<(PredictionTable, TensorDict, Vec<PathBuf>)> {
    let models = specs
        .iter()
        .map(|spec| Ok((spec.name.clone(), loader.load(spec)?)))
        .collect::<Result<Vec<_>>>()?;
    let scalar: Vec<TensorMap> = common.iter().filter(|tm| tm.axes() == 1).cloned().collect();
    let keep = |dict: &TensorDict| -> TensorDict {
        scalar
            .iter()
            .filter_map(|tm| dict.get(&tm.output_name()).map(|t| (tm.output_name(), t.clone())))
            .collect()
    };

    let mut per_model: BTreeMap<String, Vec<TensorDict>> = BTreeMap::new();
    let mut labels = Vec::with_capacity(steps);
    let mut paths = Vec::new();
    for _ in 0..steps {
        let batch = generator.next_batch()?;
        for (name, model) in &models {
            let predictions = model.predict(&batch.inputs)?;
            per_model.entry(name.clone()).or_default().push(keep(&predictions));
        }
        labels.push(keep(&batch.outputs));
        paths.extend(batch.paths);
    }

    let mut table = PredictionTable::new();
    for (name, batches) in per_model {
        let predictions = concatenate_dicts(&batches)?;
        record_predictions(&mut table, &name, &scalar, &predictions);
    }
    Ok((table, concatenate_dicts(&labels)?, paths))
}

/// Evaluate the aligned table, one series per model for every output
pub fn calculate_and_plot_prediction_stats(
    outputs: &[TensorMap],
    table: &PredictionTable,
    labels: &TensorDict,
    title: &str,
    folder: &Path,
    paths: &[PathBuf],
    sink: &mut dyn PlotSink,
) -> Result<PerformanceMetrics> {
    let mut collector = FigureCollector::default();
    let mut metrics = PerformanceMetrics::new();
    for tm in outputs {
        let (series, truth) = match (table.get(&tm.output_name()), labels.get(&tm.output_name())) {
            (Some(series), Some(truth)) => (series, truth),
            _ => continue,
        };
        info!("Comparing {} models on {}", series.len(), tm.name);
        metrics.extend(evaluate_predictions(
            tm,
            series,
            truth,
            title,
            folder,
            paths,
            &mut collector,
            sink,
        )?);
    }
    collector.render_subplots(title, folder, sink)?;
    Ok(metrics)
}
