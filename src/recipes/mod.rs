//! Workflow recipes and the mode dispatcher.
//!
//! Every recipe returns a `Result`. [`run`] is the only place errors are
//! caught: it logs them with their cause chain and always reports how long
//! the invocation took.

pub mod config;

pub use config::{ResolvedMaps, RunConfig};

use crate::compare::{
    calculate_and_plot_prediction_stats, common_outputs, gather_predictions, model_inputs_outputs,
    scalar_predictions_from_generator, union_inputs, CheckpointLoader, ModelSpec,
};
use crate::data::generator::{big_batch_from_minibatch_generator, test_train_valid_generators, GeneratorSet, TensorGenerator};
use crate::data::loader::tensor_paths_from_sample_csv;
use crate::error::RecipeError;
use crate::evaluate::plots::{Curve, Figure, FigureKind, PlotSink, TsvPlotSink};
use crate::evaluate::{
    evaluate_reconstructions, predict_and_evaluate, predict_scalars_and_evaluate_from_generator, EvaluationData,
    EvaluationOptions, PerformanceMetrics,
};
use crate::model::architecture::BurnModel;
use crate::model::checkpoint::{make_model, read_metadata, save_components};
use crate::model::Model;
use crate::predict::hidden::{infer_encoders, infer_hidden_layer};
use crate::predict::inference::infer_multimodal_multitask;
use crate::tensor_map::extractors;
use crate::tensor_map::nan_on_fail::nan_on_fail_extractors;
use crate::training::trainer::Trainer;
use crate::training::TrainingResult;
use crate::{InferenceBackend, TrainingBackend};
use anyhow::Result;
use burn::prelude::Backend;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;
use tracing::{error, info, warn};

/// Workflows selectable with `--mode`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    TrainLegacy,
    TrainShallow,
    Test,
    TestScalar,
    Compare,
    CompareScalar,
    Infer,
    InferHidden,
    InferEncoders,
    FindLearningRate,
    FindLearningRateAndTrain,
}

impl Mode {
    pub const ALL: [Mode; 12] = [
        Mode::Train,
        Mode::TrainLegacy,
        Mode::TrainShallow,
        Mode::Test,
        Mode::TestScalar,
        Mode::Compare,
        Mode::CompareScalar,
        Mode::Infer,
        Mode::InferHidden,
        Mode::InferEncoders,
        Mode::FindLearningRate,
        Mode::FindLearningRateAndTrain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::TrainLegacy => "train_legacy",
            Mode::TrainShallow => "train_shallow",
            Mode::Test => "test",
            Mode::TestScalar => "test_scalar",
            Mode::Compare => "compare",
            Mode::CompareScalar => "compare_scalar",
            Mode::Infer => "infer",
            Mode::InferHidden => "infer_hidden",
            Mode::InferEncoders => "infer_encoders",
            Mode::FindLearningRate => "find_learning_rate",
            Mode::FindLearningRateAndTrain => "find_learning_rate_and_train",
        }
    }
}

impl FromStr for Mode {
    type Err = RecipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| RecipeError::UnknownMode(s.to_string()))
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one invocation as seen by `main`
#[derive(Debug)]
pub struct RunReport {
    pub mode: String,
    pub elapsed_secs: f64,
    pub metrics: Option<PerformanceMetrics>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Run one recipe, logging instead of propagating any failure
pub fn run(config: &RunConfig) -> RunReport {
    let start = Instant::now();
    let (metrics, error) = match dispatch(config) {
        Ok(metrics) => (Some(metrics), None),
        Err(e) => {
            error!("{:?}", e);
            (None, Some(format!("{:#}", e)))
        }
    };
    let elapsed_secs = start.elapsed().as_secs_f64();
    info!(
        "Executed the '{}' operation in {:.2} seconds",
        config.mode, elapsed_secs
    );
    RunReport {
        mode: config.mode.clone(),
        elapsed_secs,
        metrics,
        error,
    }
}

/// Run the recipe named by `config.mode`, writing figures as TSV tables
pub fn dispatch(config: &RunConfig) -> Result<PerformanceMetrics> {
    let mut sink = TsvPlotSink::new();
    dispatch_with(config, &mut sink)
}

pub fn dispatch_with(config: &RunConfig, sink: &mut dyn PlotSink) -> Result<PerformanceMetrics> {
    let mode: Mode = config.mode.parse()?;
    config.validate()?;
    info!("Running recipe '{}' with id '{}'", mode, config.id);
    match mode {
        Mode::Train => train(config, sink, Flavor::Blocks),
        Mode::TrainLegacy => train(config, sink, Flavor::Legacy),
        Mode::TrainShallow => train(config, sink, Flavor::Shallow),
        Mode::Test => test(config, sink),
        Mode::TestScalar => test_scalar(config, sink),
        Mode::Compare => compare(config, sink),
        Mode::CompareScalar => compare_scalar(config, sink),
        Mode::Infer => infer(config),
        Mode::InferHidden => infer_hidden(config),
        Mode::InferEncoders => infer_encoder_layers(config),
        Mode::FindLearningRate => {
            let mut metrics = PerformanceMetrics::new();
            if let Some(lr) = find_learning_rate(config, sink)? {
                metrics.insert("learning_rate".to_string(), lr);
            }
            Ok(metrics)
        }
        Mode::FindLearningRateAndTrain => {
            let learning_rate = find_learning_rate(config, sink)?.ok_or(RecipeError::MissingLearningRate)?;
            let tuned = RunConfig {
                learning_rate,
                ..config.clone()
            };
            train(&tuned, sink, Flavor::Legacy)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    /// Also saves encoders, decoders and merger and evaluates reconstructions
    Blocks,
    Legacy,
    /// No dense layers between the merge and the decoders
    Shallow,
}

/// Named maps, falling back to the model file's own maps when none are named
fn load_maps(config: &RunConfig) -> Result<ResolvedMaps> {
    let mut maps = config.resolve_maps()?;
    if maps.inputs.is_empty() && maps.outputs.is_empty() {
        if let Some(model_file) = config.model_file() {
            let metadata = read_metadata(model_file)?;
            info!("Using the tensor maps saved with {:?}", model_file);
            maps.inputs = metadata.inputs;
            maps.outputs = metadata.outputs;
        }
    }
    Ok(maps)
}

fn generators(config: &RunConfig, maps: &ResolvedMaps) -> Result<GeneratorSet> {
    let paths = tensor_paths_from_sample_csv(&config.tensors, config.sample_csv.as_deref())?;
    test_train_valid_generators(
        paths,
        &maps.inputs,
        &maps.labels(),
        config.batch_size,
        &config.split_config(),
    )
}

fn device<B: Backend>() -> B::Device {
    Default::default()
}

fn inference_model(config: &RunConfig, maps: &ResolvedMaps) -> Result<BurnModel<InferenceBackend>> {
    make_model::<InferenceBackend>(
        config.model_file(),
        &config.id,
        &maps.inputs,
        &maps.outputs,
        config.model_config(maps),
        &device::<InferenceBackend>(),
    )
}

fn evaluation_options<'a>(config: &'a RunConfig, plot_folder: &'a Path) -> EvaluationOptions<'a> {
    EvaluationOptions {
        hidden_layer: &config.hidden_layer,
        plot_folder,
        embed_visualization: config.embed_visualization.as_deref(),
        alpha: config.alpha,
    }
}

fn render_history(result: &TrainingResult, title: &str, folder: &Path, sink: &mut dyn PlotSink) -> Result<()> {
    let epochs: Vec<f64> = (1..=result.state.epoch).map(|e| e as f64).collect();
    let figure = Figure::new(FigureKind::History, title)
        .with_curve(Curve::new("loss", epochs.clone(), result.state.train_loss_history.clone()))
        .with_curve(Curve::new("val_loss", epochs, result.state.val_loss_history.clone()));
    sink.render(&figure, folder)
}

fn train(config: &RunConfig, sink: &mut dyn PlotSink, flavor: Flavor) -> Result<PerformanceMetrics> {
    let maps = config.resolve_maps()?;
    let mut generators = generators(config, &maps)?;
    let run_folder = config.run_folder();

    let mut model_config = config.model_config(&maps);
    if flavor == Flavor::Shallow {
        model_config.dense_layers = Vec::new();
    }
    let device = device::<TrainingBackend>();
    let model = make_model::<TrainingBackend>(
        config.model_file(),
        &config.id,
        &maps.inputs,
        &maps.outputs,
        model_config,
        &device,
    )?;

    let trainer = Trainer::<TrainingBackend>::new(config.training_config(), device);
    let (model, result) = trainer.train(
        model,
        &mut generators.train,
        &mut generators.valid,
        &config.trained_model_file(),
    )?;
    render_history(&result, &config.id, &run_folder, sink)?;
    if flavor == Flavor::Blocks {
        save_components(&model, &run_folder)?;
    }

    let test = big_batch_from_minibatch_generator(&mut generators.test, config.test_steps)?;
    let data = EvaluationData {
        inputs: &test.inputs,
        labels: &test.outputs,
        paths: &test.paths,
    };
    let metrics = predict_and_evaluate(
        &model,
        data,
        &maps.outputs,
        &maps.protected,
        &evaluation_options(config, &run_folder),
        sink,
    )?;
    if flavor == Flavor::Blocks {
        evaluate_reconstructions(&model, data, &run_folder, sink)?;
    }
    Ok(metrics)
}

fn test(config: &RunConfig, sink: &mut dyn PlotSink) -> Result<PerformanceMetrics> {
    let maps = load_maps(config)?;
    let mut generators = generators(config, &maps)?;
    let model = inference_model(config, &maps)?;
    let run_folder = config.run_folder();

    let test = big_batch_from_minibatch_generator(&mut generators.test, config.test_steps)?;
    predict_and_evaluate(
        &model,
        EvaluationData {
            inputs: &test.inputs,
            labels: &test.outputs,
            paths: &test.paths,
        },
        &maps.outputs,
        &maps.protected,
        &evaluation_options(config, &run_folder),
        sink,
    )
}

fn test_scalar(config: &RunConfig, sink: &mut dyn PlotSink) -> Result<PerformanceMetrics> {
    let maps = load_maps(config)?;
    let mut generators = generators(config, &maps)?;
    let model = inference_model(config, &maps)?;
    let run_folder = config.run_folder();
    predict_scalars_and_evaluate_from_generator(
        &model,
        &mut generators.test,
        &maps.outputs,
        &maps.protected,
        config.test_steps,
        &evaluation_options(config, &run_folder),
        sink,
    )
}

/// Model specs of the compared models and the maps their shared generator reads
fn comparison_maps(config: &RunConfig) -> Result<(Vec<ModelSpec>, ResolvedMaps)> {
    if config.model_files.is_empty() {
        return Err(RecipeError::InvalidConfig("comparing models needs at least one model file".to_string()).into());
    }
    let specs = model_inputs_outputs(&config.model_files)?;
    let maps = ResolvedMaps {
        inputs: union_inputs(&specs),
        outputs: common_outputs(&specs),
        protected: Vec::new(),
    };
    info!(
        "Comparing {} models on {} common outputs",
        specs.len(),
        maps.outputs.len()
    );
    if maps.outputs.is_empty() {
        warn!("The compared models share no outputs");
    }
    Ok((specs, maps))
}

fn compare(config: &RunConfig, sink: &mut dyn PlotSink) -> Result<PerformanceMetrics> {
    let (specs, maps) = comparison_maps(config)?;
    let mut generators = generators(config, &maps)?;
    let test = big_batch_from_minibatch_generator(&mut generators.test, config.test_steps)?;

    let loader = CheckpointLoader::<InferenceBackend>::new(device::<InferenceBackend>());
    let table = gather_predictions(&specs, &loader, &maps.outputs, &test.inputs)?;
    calculate_and_plot_prediction_stats(
        &maps.outputs,
        &table,
        &test.outputs,
        &config.id,
        &config.run_folder(),
        &test.paths,
        sink,
    )
}

fn compare_scalar(config: &RunConfig, sink: &mut dyn PlotSink) -> Result<PerformanceMetrics> {
    let (specs, maps) = comparison_maps(config)?;
    let mut generators = generators(config, &maps)?;

    let loader = CheckpointLoader::<InferenceBackend>::new(device::<InferenceBackend>());
    let (table, labels, paths) = scalar_predictions_from_generator(
        &specs,
        &loader,
        &maps.outputs,
        &mut generators.test,
        config.test_steps,
    )?;
    calculate_and_plot_prediction_stats(
        &maps.outputs,
        &table,
        &labels,
        &config.id,
        &config.run_folder(),
        &paths,
        sink,
    )
}

fn infer(config: &RunConfig) -> Result<PerformanceMetrics> {
    let maps = load_maps(config)?;
    let model = inference_model(config, &maps)?;
    let paths = tensor_paths_from_sample_csv(&config.tensors, config.sample_csv.as_deref())?;
    let mut generator = TensorGenerator::new(
        "inference",
        1,
        extractors(model.input_maps()),
        nan_on_fail_extractors(model.output_maps()),
        paths,
    );
    infer_multimodal_multitask(
        &model,
        &mut generator,
        &config.output_folder,
        &config.id,
        &config.tsv_style,
    )?;
    Ok(PerformanceMetrics::new())
}

fn infer_hidden(config: &RunConfig) -> Result<PerformanceMetrics> {
    let maps = load_maps(config)?;
    let model = inference_model(config, &maps)?;
    let paths = tensor_paths_from_sample_csv(&config.tensors, config.sample_csv.as_deref())?;
    let mut generator = TensorGenerator::from_maps("hidden inference", 1, model.input_maps(), &[], paths);
    infer_hidden_layer(
        &model,
        &config.hidden_layer,
        &config.hidden_layer,
        &mut generator,
        &config.output_folder,
        &config.id,
        &config.tsv_style,
    )?;
    Ok(PerformanceMetrics::new())
}

fn infer_encoder_layers(config: &RunConfig) -> Result<PerformanceMetrics> {
    let maps = load_maps(config)?;
    let model = inference_model(config, &maps)?;
    let paths = tensor_paths_from_sample_csv(&config.tensors, config.sample_csv.as_deref())?;
    let written = infer_encoders(&model, paths, &config.output_folder, &config.id, &config.tsv_style)?;
    info!("Wrote {} encoder inference files", written.len());
    Ok(PerformanceMetrics::new())
}

/// Learning rate sweep; the configured schedule is suspended while it runs
fn find_learning_rate(config: &RunConfig, sink: &mut dyn PlotSink) -> Result<Option<f64>> {
    let sweep_config = RunConfig {
        learning_rate_schedule: None,
        ..config.clone()
    };
    let maps = sweep_config.resolve_maps()?;
    let mut generators = generators(&sweep_config, &maps)?;
    let device = device::<TrainingBackend>();
    let model = make_model::<TrainingBackend>(
        sweep_config.model_file(),
        &sweep_config.id,
        &maps.inputs,
        &maps.outputs,
        sweep_config.model_config(&maps),
        &device,
    )?;

    let sweep = Trainer::<TrainingBackend>::new(sweep_config.training_config(), device)
        .find_learning_rate(model, &mut generators.train)?;
    let figure = Figure::new(FigureKind::LearningRate, &sweep_config.id).with_curve(Curve::new(
        "smoothed_loss",
        sweep.learning_rates.clone(),
        sweep.smoothed_losses.clone(),
    ));
    sink.render(&figure, &sweep_config.run_folder())?;

    match sweep.suggestion {
        Some(lr) => info!("Suggested learning rate: {:.3e}", lr),
        None => warn!(
            "Learning rate sweep of {} steps was too short to suggest a rate",
            sweep.learning_rates.len()
        ),
    }
    Ok(sweep.suggestion)
}
