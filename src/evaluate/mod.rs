//! Prediction evaluation and figure assembly.
//!
//! Every output map is evaluated according to its interpretation. One call
//! can evaluate several prediction series against the same labels, which is
//! how model comparisons share this code with single-model evaluation.

pub mod embedding;
pub mod metrics;
pub mod plots;

use crate::data::generator::{concatenate_dicts, BatchSource};
use crate::data::TensorDict;
use crate::evaluate::embedding::tsne_wrapper;
use crate::evaluate::metrics::{
    calibration_curve, concordance_index, observed_survival_curve, pearson, precision_recall,
    predicted_survival_curve, roc_curve, survival_actual, survival_follow_up, survival_prediction,
};
use crate::evaluate::plots::{Curve, Figure, FigureKind, PlotSink};
use crate::model::Model;
use crate::tensor_map::{Interpretation, TensorMap};
use anyhow::{Context, Result};
use ndarray::{Array2, ArrayD, Axis};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Metric name to value
pub type PerformanceMetrics = BTreeMap<String, f64>;

/// Series label to prediction array, rows aligned with the labels
pub type PredictionSeries = BTreeMap<String, ArrayD<f32>>;

/// Maximum number of language predictions argmax-decoded into the log
pub const MAX_LANGUAGE_SAMPLES: usize = 16;

const C_INDEX_TIED_TOLERANCE: f64 = 1e-8;
const CALIBRATION_BINS: usize = 10;

/// ROC and scatter figures collected across outputs for the combined figure
#[derive(Debug, Default)]
pub struct FigureCollector {
    pub rocs: Vec<Figure>,
    pub scatters: Vec<Figure>,
}

impl FigureCollector {
    /// Render combined figures when more than one ROC or scatter figure was collected
    pub fn render_subplots(&self, title: &str, folder: &Path, sink: &mut dyn PlotSink) -> Result<()> {
        if self.rocs.len() > 1 {
            sink.render_grid(&format!("{}_rocs", title), &self.rocs, folder)?;
        }
        if self.scatters.len() > 1 {
            sink.render_grid(&format!("{}_scatters", title), &self.scatters, folder)?;
        }
        Ok(())
    }
}

fn metric_key(label: &str, tm: &TensorMap, what: &str) -> String {
    if label == tm.name {
        format!("{}_{}", label, what)
    } else {
        format!("{}_{}_{}", label, tm.name, what)
    }
}

fn channel_names(tm: &TensorMap) -> Vec<(String, usize)> {
    if tm.channel_map.is_empty() {
        (0..tm.channels()).map(|i| (i.to_string(), i)).collect()
    } else {
        tm.channel_map
            .iter()
            .map(|(name, index)| (name.to_string(), index))
            .collect()
    }
}

/// View a batch as `[rows, channels]`, folding every non-channel axis into rows
fn flatten_channels(tensor: &ArrayD<f32>, channels: usize) -> Result<Array2<f64>> {
    let channels = channels.max(1);
    let values: Vec<f64> = tensor.iter().map(|&v| v as f64).collect();
    Array2::from_shape_vec((values.len() / channels, channels), values)
        .context("Prediction size is not a multiple of the channel count")
}

fn add_roc(
    figure: &mut Figure,
    metrics: &mut PerformanceMetrics,
    label: &str,
    tm: &TensorMap,
    channel: &str,
    truth: &[f64],
    scores: &[f64],
) {
    let roc = roc_curve(truth, scores);
    if roc.auc.is_nan() {
        warn!("Only one class present for {} {}, skipping its ROC", tm.name, channel);
        return;
    }
    info!("{} {} {} AUC: {:.3}", label, tm.name, channel, roc.auc);
    metrics.insert(metric_key(label, tm, &format!("{}_AUC", channel)), roc.auc);
    figure
        .curves
        .push(Curve::new(&format!("{}_{}", label, channel), roc.fpr, roc.tpr));
}

fn evaluate_categorical(
    tm: &TensorMap,
    predictions: &PredictionSeries,
    truth: &ArrayD<f32>,
    title: &str,
    with_precision_recall: bool,
    metrics: &mut PerformanceMetrics,
) -> Result<Vec<Figure>> {
    tm.check_channel_map()?;
    let truth = flatten_channels(truth, tm.channels())?;
    let mut roc = Figure::new(FigureKind::Roc, title);
    let mut pr = Figure::new(FigureKind::PrecisionRecall, title);

    for (label, prediction) in predictions {
        let prediction = flatten_channels(prediction, tm.channels())?;
        for (channel, index) in channel_names(tm) {
            let y_true: Vec<f64> = truth.column(index).to_vec();
            let y_score: Vec<f64> = prediction.column(index).to_vec();
            add_roc(&mut roc, metrics, label, tm, &channel, &y_true, &y_score);

            if with_precision_recall {
                let curve = precision_recall(&y_true, &y_score);
                if !curve.average_precision.is_nan() {
                    metrics.insert(
                        metric_key(label, tm, &format!("{}_AP", channel)),
                        curve.average_precision,
                    );
                    pr.curves.push(Curve::new(
                        &format!("{}_{}", label, channel),
                        curve.recall,
                        curve.precision,
                    ));
                }
            }
        }
    }

    let mut figures = vec![roc];
    if with_precision_recall {
        figures.push(pr);
    }
    Ok(figures)
}

fn evaluate_continuous(
    tm: &TensorMap,
    predictions: &PredictionSeries,
    truth: &ArrayD<f32>,
    title: &str,
    metrics: &mut PerformanceMetrics,
) -> Figure {
    let actual: Vec<f64> = truth
        .iter()
        .map(|&v| {
            if v.is_finite() && !tm.is_sentinel(v) {
                tm.rescale_value(v) as f64
            } else {
                f64::NAN
            }
        })
        .collect();

    let mut scatter = Figure::new(FigureKind::Scatter, title);
    for (label, prediction) in predictions {
        let predicted: Vec<f64> = prediction.iter().map(|&v| tm.rescale_value(v) as f64).collect();
        let r = pearson(&actual, &predicted);
        info!("{} {} Pearson correlation: {:.3}", label, tm.name, r);
        metrics.insert(metric_key(label, tm, "pearson"), r);
        metrics.insert(metric_key(label, tm, "r_squared"), r * r);
        scatter.curves.push(Curve::new(label, actual.clone(), predicted));
    }
    scatter
}

fn evaluate_time_to_event(
    tm: &TensorMap,
    predictions: &PredictionSeries,
    truth: &ArrayD<f32>,
    title: &str,
    metrics: &mut PerformanceMetrics,
) -> Result<Vec<Figure>> {
    let truth = flatten_channels(truth, tm.size())?;
    let event_values: Vec<f64> = truth.column(0).to_vec();
    let time: Vec<f64> = truth.column(1.min(truth.ncols() - 1)).to_vec();
    let event: Vec<bool> = event_values.iter().map(|&e| e == 1.0).collect();

    let mut roc = Figure::new(FigureKind::Roc, title);
    let mut calibration = Figure::new(FigureKind::Calibration, title);

    for (label, prediction) in predictions {
        let prediction = flatten_channels(prediction, tm.size())?;
        let risk: Vec<f64> = prediction.column(0).to_vec();
        let concordance = concordance_index(&event, &time, &risk, C_INDEX_TIED_TOLERANCE);
        info!(
            "{} {} C-index: {:.3} (concordant {}, discordant {}, tied risk {}, tied time {})",
            label,
            tm.name,
            concordance.c_index,
            concordance.concordant,
            concordance.discordant,
            concordance.tied_risk,
            concordance.tied_time
        );
        metrics.insert(metric_key(label, tm, "C_Index"), concordance.c_index);

        let series = format!("{}_C_Index_{:.3}", label, concordance.c_index);
        let curve = roc_curve(&event_values, &risk);
        if curve.auc.is_nan() {
            warn!("Only one class present for {}, skipping its ROC", tm.name);
        } else {
            metrics.insert(metric_key(label, tm, "AUC"), curve.auc);
            roc.curves.push(Curve::new(&series, curve.fpr, curve.tpr));
        }

        let (predicted, observed) = calibration_curve(&event_values, &risk, CALIBRATION_BINS);
        calibration.curves.push(Curve::new(&series, predicted, observed));
    }
    Ok(vec![roc, calibration])
}

fn evaluate_survival_curve(
    tm: &TensorMap,
    predictions: &PredictionSeries,
    truth: &ArrayD<f32>,
    title: &str,
    metrics: &mut PerformanceMetrics,
) -> Vec<Figure> {
    let intervals = tm.size() / 2;
    let truth_rows: Vec<Vec<f32>> = truth
        .outer_iter()
        .map(|row| row.iter().copied().collect())
        .filter(|row: &Vec<f32>| row.iter().all(|v| v.is_finite()))
        .collect();
    let x: Vec<f64> = (1..=intervals)
        .map(|i| (i * (1 + tm.days_window / intervals.max(1))) as f64)
        .collect();

    let mut survival = Figure::new(FigureKind::Survival, title).with_curve(Curve::new(
        "observed",
        x.clone(),
        observed_survival_curve(&truth_rows, intervals),
    ));

    let event: Vec<bool> = truth_rows
        .iter()
        .map(|row| survival_actual(row, intervals) > 0.0)
        .collect();
    let follow_up: Vec<f64> = truth_rows
        .iter()
        .map(|row| survival_follow_up(row, intervals, tm.days_window))
        .collect();

    for (label, prediction) in predictions {
        let prediction_rows: Vec<Vec<f32>> = prediction
            .outer_iter()
            .zip(truth.outer_iter())
            .filter(|(_, t)| t.iter().all(|v| v.is_finite()))
            .map(|(row, _)| row.iter().copied().collect())
            .collect();
        survival.curves.push(Curve::new(
            label,
            x.clone(),
            predicted_survival_curve(&prediction_rows, intervals),
        ));

        let risk: Vec<f64> = prediction_rows
            .iter()
            .map(|row| survival_prediction(row, intervals))
            .collect();
        let concordance = concordance_index(&event, &follow_up, &risk, C_INDEX_TIED_TOLERANCE);
        info!("{} {} C-index: {:.3}", label, tm.name, concordance.c_index);
        metrics.insert(metric_key(label, tm, "C_Index"), concordance.c_index);
    }
    vec![survival]
}

/// Decode the most likely token at every position of a language tensor
fn decode_tokens(tm: &TensorMap, sample: ndarray::ArrayViewD<f32>) -> String {
    let channels = tm.channels().max(1);
    let values: Vec<f32> = sample.iter().copied().collect();
    values
        .chunks(channels)
        .filter_map(|position| {
            position
                .iter()
                .enumerate()
                .filter(|(_, v)| v.is_finite())
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| tm.channel_map.name_of(i).unwrap_or("?").to_string())
        })
        .collect()
}

/// Decoded (truth, prediction) pairs for the first `max_samples` samples
pub fn decode_language_samples(
    tm: &TensorMap,
    truth: &ArrayD<f32>,
    prediction: &ArrayD<f32>,
    max_samples: usize,
) -> Vec<(String, String)> {
    truth
        .outer_iter()
        .zip(prediction.outer_iter())
        .take(max_samples)
        .map(|(t, p)| (decode_tokens(tm, t), decode_tokens(tm, p)))
        .collect()
}

/// Evaluate prediction series for one output map and render its figures.
///
/// ROC figures and scatter figures are also handed to `collector` for the
/// combined subplot figure.
#[allow(clippy::too_many_arguments)]
pub fn evaluate_predictions(
    tm: &TensorMap,
    predictions: &PredictionSeries,
    truth: &ArrayD<f32>,
    title: &str,
    folder: &Path,
    test_paths: &[PathBuf],
    collector: &mut FigureCollector,
    sink: &mut dyn PlotSink,
) -> Result<PerformanceMetrics> {
    let mut metrics = PerformanceMetrics::new();
    let title = format!("{}_{}", title, tm.name);

    let figures = match tm.interpretation {
        Interpretation::Categorical | Interpretation::Language => {
            let multi_axis = tm.axes() > 1;
            let figures = evaluate_categorical(tm, predictions, truth, &title, multi_axis, &mut metrics)?;
            if tm.is_language() {
                for (label, prediction) in predictions {
                    for (i, (actual, predicted)) in
                        decode_language_samples(tm, truth, prediction, MAX_LANGUAGE_SAMPLES)
                            .into_iter()
                            .enumerate()
                    {
                        let sample = test_paths
                            .get(i)
                            .map(crate::data::sample_id_from_path)
                            .unwrap_or_default();
                        info!(
                            "{} sample {}: truth '{}' argmax-decoded prediction '{}'",
                            label, sample, actual, predicted
                        );
                    }
                }
            }
            figures
        }
        Interpretation::Continuous => vec![evaluate_continuous(tm, predictions, truth, &title, &mut metrics)],
        Interpretation::TimeToEvent => evaluate_time_to_event(tm, predictions, truth, &title, &mut metrics)?,
        Interpretation::SurvivalCurve => evaluate_survival_curve(tm, predictions, truth, &title, &mut metrics),
    };

    for figure in figures {
        if figure.curves.is_empty() {
            continue;
        }
        sink.render(&figure, folder)?;
        match figure.kind {
            FigureKind::Roc => collector.rocs.push(figure),
            FigureKind::Scatter => collector.scatters.push(figure),
            _ => {}
        }
    }
    Ok(metrics)
}

/// Inputs and labels of a fixed evaluation batch
#[derive(Clone, Copy)]
pub struct EvaluationData<'a> {
    pub inputs: &'a TensorDict,
    pub labels: &'a TensorDict,
    pub paths: &'a [PathBuf],
}

/// Options shared by the evaluation entry points
pub struct EvaluationOptions<'a> {
    pub hidden_layer: &'a str,
    pub plot_folder: &'a Path,
    pub embed_visualization: Option<&'a str>,
    pub alpha: f32,
}

/// Predict a fixed batch and evaluate every output that is one of the model's outputs
pub fn predict_and_evaluate(
    model: &dyn Model,
    data: EvaluationData<'_>,
    outputs: &[TensorMap],
    protected: &[TensorMap],
    options: &EvaluationOptions<'_>,
    sink: &mut dyn PlotSink,
) -> Result<PerformanceMetrics> {
    let predictions = model.predict(data.inputs)?;
    let mut collector = FigureCollector::default();
    let mut metrics = PerformanceMetrics::new();

    for tm in outputs.iter().filter(|tm| model.has_output(tm)) {
        let (prediction, truth) = match (
            predictions.get(&tm.output_name()),
            data.labels.get(&tm.output_name()),
        ) {
            (Some(p), Some(t)) => (p, t),
            _ => {
                warn!("No predictions or labels for {}, skipping it", tm.name);
                continue;
            }
        };
        let series = PredictionSeries::from([(tm.name.clone(), prediction.clone())]);
        metrics.extend(evaluate_predictions(
            tm,
            &series,
            truth,
            model.name(),
            options.plot_folder,
            data.paths,
            &mut collector,
            sink,
        )?);
    }
    collector.render_subplots(model.name(), options.plot_folder, sink)?;

    if options.embed_visualization == Some("tsne") {
        let covariates: Vec<TensorMap> = outputs.iter().chain(protected).cloned().collect();
        tsne_wrapper(
            model,
            options.hidden_layer,
            options.alpha,
            options.plot_folder,
            data.labels,
            &covariates,
            data.inputs,
            None,
            sink,
        )?;
    }
    Ok(metrics)
}

/// Evaluate the scalar outputs of a model over `steps` generator pulls.
///
/// When the model has `hidden_layer` its activations are gathered along the
/// way and plotted against the scalar labels and protected covariates.
pub fn predict_scalars_and_evaluate_from_generator(
    model: &dyn Model,
    generator: &mut dyn BatchSource,
    outputs: &[TensorMap],
    protected: &[TensorMap],
    steps: usize,
    options: &EvaluationOptions<'_>,
    sink: &mut dyn PlotSink,
) -> Result<PerformanceMetrics> {
    let scalar_maps: Vec<&TensorMap> = outputs
        .iter()
        .filter(|tm| tm.axes() == 1 && model.has_output(tm))
        .collect();
    let keep = |dict: &TensorDict, maps: &[&TensorMap]| -> TensorDict {
        maps.iter()
            .filter_map(|tm| {
                dict.get(&tm.output_name())
                    .map(|t| (tm.output_name(), t.clone()))
            })
            .collect()
    };
    let label_maps: Vec<&TensorMap> = scalar_maps.iter().copied().chain(protected).collect();
    let embed = model.has_layer(options.hidden_layer);

    let mut prediction_batches = Vec::with_capacity(steps);
    let mut label_batches = Vec::with_capacity(steps);
    let mut embeddings = Vec::new();
    let mut paths = Vec::new();

    for _ in 0..steps {
        let batch = generator.next_batch()?;
        let predictions = model.predict(&batch.inputs)?;
        prediction_batches.push(keep(&predictions, &scalar_maps));
        label_batches.push(keep(&batch.outputs, &label_maps));
        if embed {
            embeddings.push(model.hidden(options.hidden_layer, &batch.inputs)?);
        }
        paths.extend(batch.paths);
    }

    let predictions = concatenate_dicts(&prediction_batches)?;
    let labels = concatenate_dicts(&label_batches)?;
    info!("Evaluating {} samples from {} steps", paths.len(), steps);

    let mut collector = FigureCollector::default();
    let mut metrics = PerformanceMetrics::new();
    for tm in &scalar_maps {
        let (prediction, truth) = match (
            predictions.get(&tm.output_name()),
            labels.get(&tm.output_name()),
        ) {
            (Some(p), Some(t)) => (p, t),
            _ => continue,
        };
        let series = PredictionSeries::from([(tm.name.clone(), prediction.clone())]);
        metrics.extend(evaluate_predictions(
            tm,
            &series,
            truth,
            model.name(),
            options.plot_folder,
            &paths,
            &mut collector,
            sink,
        )?);
    }
    collector.render_subplots(model.name(), options.plot_folder, sink)?;

    if embed && !embeddings.is_empty() {
        let views: Vec<_> = embeddings.iter().map(|e| e.view()).collect();
        let stacked = ndarray::concatenate(Axis(0), &views)?;
        let covariates: Vec<TensorMap> = label_maps.iter().map(|tm| (*tm).clone()).collect();
        tsne_wrapper(
            model,
            options.hidden_layer,
            options.alpha,
            options.plot_folder,
            &labels,
            &covariates,
            &TensorDict::new(),
            Some(stacked),
            sink,
        )?;
    }
    Ok(metrics)
}

/// Evaluate the multi-axis outputs of a batch into `<folder>/reconstructions/`
pub fn evaluate_reconstructions(
    model: &dyn Model,
    data: EvaluationData<'_>,
    folder: &Path,
    sink: &mut dyn PlotSink,
) -> Result<PerformanceMetrics> {
    let reconstruction_maps: Vec<TensorMap> = model
        .output_maps()
        .iter()
        .filter(|tm| tm.axes() > 1)
        .cloned()
        .collect();
    if reconstruction_maps.is_empty() {
        return Ok(PerformanceMetrics::new());
    }

    let folder = folder.join("reconstructions");
    info!(
        "Evaluating {} decoder reconstructions into {:?}",
        reconstruction_maps.len(),
        folder
    );
    let options = EvaluationOptions {
        hidden_layer: "",
        plot_folder: &folder,
        embed_visualization: None,
        alpha: 0.5,
    };
    predict_and_evaluate(model, data, &reconstruction_maps, &[], &options, sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Batch;
    use crate::evaluate::plots::RecordingPlotSink;
    use crate::tensor_map::ChannelMap;
    use ndarray::IxDyn;

    fn array(values: Vec<f32>, shape: &[usize]) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(shape), values).unwrap()
    }

    fn sex_map() -> TensorMap {
        TensorMap::new("sex", &[2], Interpretation::Categorical)
            .with_channel_map(ChannelMap::new([("female", 0), ("male", 1)]))
    }

    #[test]
    fn test_categorical_auc_per_channel() {
        let tm = sex_map();
        let truth = array(vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0], &[3, 2]);
        let prediction = array(vec![0.9, 0.1, 0.2, 0.8, 0.7, 0.3], &[3, 2]);
        let series = PredictionSeries::from([("sex".to_string(), prediction)]);

        let mut collector = FigureCollector::default();
        let mut sink = RecordingPlotSink::default();
        let metrics = evaluate_predictions(
            &tm,
            &series,
            &truth,
            "model",
            Path::new("."),
            &[],
            &mut collector,
            &mut sink,
        )
        .unwrap();

        assert_eq!(metrics["sex_female_AUC"], 1.0);
        assert_eq!(metrics["sex_male_AUC"], 1.0);
        assert_eq!(collector.rocs.len(), 1);
        assert_eq!(collector.rocs[0].curves.len(), 2);
    }

    #[test]
    fn test_channel_index_past_last_axis_is_an_error() {
        let tm = TensorMap::new("sex", &[2], Interpretation::Categorical)
            .with_channel_map(ChannelMap::new([("female", 0), ("male", 2)]));
        let truth = array(vec![1.0, 0.0, 0.0, 1.0], &[2, 2]);
        let prediction = array(vec![0.9, 0.1, 0.2, 0.8], &[2, 2]);
        let series = PredictionSeries::from([("sex".to_string(), prediction)]);

        let err = evaluate_predictions(
            &tm,
            &series,
            &truth,
            "model",
            Path::new("."),
            &[],
            &mut FigureCollector::default(),
            &mut RecordingPlotSink::default(),
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<crate::error::RecipeError>(),
            Some(crate::error::RecipeError::InvalidConfig(message)) if message.contains("male")
        ));
    }

    #[test]
    fn test_multi_axis_categorical_adds_precision_recall() {
        let tm = TensorMap::new("segmentation", &[2, 2], Interpretation::Categorical);
        let truth = array(vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0], &[2, 2, 2]);
        let prediction = array(vec![0.8, 0.2, 0.4, 0.6, 0.3, 0.7, 0.9, 0.1], &[2, 2, 2]);
        let series = PredictionSeries::from([("segmentation".to_string(), prediction)]);

        let mut sink = RecordingPlotSink::default();
        let metrics = evaluate_predictions(
            &tm,
            &series,
            &truth,
            "model",
            Path::new("."),
            &[],
            &mut FigureCollector::default(),
            &mut sink,
        )
        .unwrap();

        assert!(metrics.contains_key("segmentation_0_AP"));
        assert!(sink.figures.iter().any(|f| f.kind == FigureKind::PrecisionRecall));
    }

    #[test]
    fn test_continuous_rescales_and_masks() {
        let tm = TensorMap::new("age", &[1], Interpretation::Continuous)
            .with_sentinel(-1.0)
            .with_normalization(crate::tensor_map::Normalization::Standardize { mean: 50.0, std: 10.0 });
        let truth = array(vec![0.0, 1.0, -1.0, 2.0], &[4, 1]);
        let prediction = array(vec![0.1, 1.1, 5.0, 2.1], &[4, 1]);
        let series = PredictionSeries::from([("age".to_string(), prediction)]);

        let mut collector = FigureCollector::default();
        let metrics = evaluate_predictions(
            &tm,
            &series,
            &truth,
            "model",
            Path::new("."),
            &[],
            &mut collector,
            &mut RecordingPlotSink::default(),
        )
        .unwrap();

        assert!((metrics["age_pearson"] - 1.0).abs() < 1e-6);
        assert_eq!(collector.scatters.len(), 1);
        assert_eq!(collector.scatters[0].curves[0].x[0], 50.0);
    }

    #[test]
    fn test_time_to_event_series_are_relabeled() {
        let tm = TensorMap::new("mi", &[2], Interpretation::TimeToEvent);
        let truth = array(vec![1.0, 100.0, 0.0, 300.0, 1.0, 200.0, 0.0, 400.0], &[4, 2]);
        let good = array(vec![0.9, 0.0, 0.2, 0.0, 0.8, 0.0, 0.1, 0.0], &[4, 2]);
        let series = PredictionSeries::from([("model_a".to_string(), good)]);

        let mut collector = FigureCollector::default();
        let metrics = evaluate_predictions(
            &tm,
            &series,
            &truth,
            "compare",
            Path::new("."),
            &[],
            &mut collector,
            &mut RecordingPlotSink::default(),
        )
        .unwrap();

        assert_eq!(metrics["model_a_mi_C_Index"], 1.0);
        assert_eq!(collector.rocs[0].curves[0].label, "model_a_C_Index_1.000");
    }

    #[test]
    fn test_survival_curve_figure() {
        let tm = TensorMap::new("death", &[4], Interpretation::SurvivalCurve);
        let truth = array(vec![1.0, 1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0], &[2, 4]);
        let prediction = array(vec![0.9, 0.5, 0.0, 0.0, 0.95, 0.9, 0.0, 0.0], &[2, 4]);
        let series = PredictionSeries::from([("death".to_string(), prediction)]);

        let mut sink = RecordingPlotSink::default();
        let metrics = evaluate_predictions(
            &tm,
            &series,
            &truth,
            "model",
            Path::new("."),
            &[],
            &mut FigureCollector::default(),
            &mut sink,
        )
        .unwrap();

        assert!(metrics.contains_key("death_C_Index"));
        let figure = &sink.figures[0];
        assert_eq!(figure.kind, FigureKind::Survival);
        assert_eq!(figure.curves[0].label, "observed");
        assert_eq!(figure.curves[0].y, vec![1.0, 0.0]);
    }

    #[test]
    fn test_decode_language_samples() {
        let tm = TensorMap::new("text", &[3, 2], Interpretation::Language)
            .with_channel_map(ChannelMap::new([("a", 0), ("b", 1)]));
        let truth = array(vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0], &[1, 3, 2]);
        let prediction = array(vec![0.9, 0.1, 0.8, 0.2, 0.4, 0.6], &[1, 3, 2]);
        let decoded = decode_language_samples(&tm, &truth, &prediction, MAX_LANGUAGE_SAMPLES);
        assert_eq!(decoded, vec![("aba".to_string(), "aab".to_string())]);
    }

    #[test]
    fn test_subplots_need_more_than_one_figure() {
        let mut collector = FigureCollector::default();
        collector.rocs.push(Figure::new(FigureKind::Roc, "a"));
        let mut sink = RecordingPlotSink::default();
        collector.render_subplots("model", Path::new("."), &mut sink).unwrap();
        assert!(sink.grids.is_empty());

        collector.rocs.push(Figure::new(FigureKind::Roc, "b"));
        collector.render_subplots("model", Path::new("."), &mut sink).unwrap();
        assert_eq!(sink.grids.len(), 1);
        assert_eq!(sink.grids[0].0, "model_rocs");
    }

    struct ConstantModel {
        outputs: Vec<TensorMap>,
    }

    impl Model for ConstantModel {
        fn name(&self) -> &str {
            "constant"
        }

        fn input_maps(&self) -> &[TensorMap] {
            &[]
        }

        fn output_maps(&self) -> &[TensorMap] {
            &self.outputs
        }

        fn layer_names(&self) -> Vec<String> {
            vec!["embed".to_string()]
        }

        fn predict(&self, inputs: &TensorDict) -> Result<TensorDict> {
            let rows = inputs.values().next().map_or(0, |t| t.shape()[0]);
            let mut out = TensorDict::new();
            out.insert(
                "output_age_continuous".to_string(),
                ArrayD::from_shape_fn(IxDyn(&[rows, 1]), |i| i[0] as f32),
            );
            Ok(out)
        }

        fn hidden(&self, _: &str, inputs: &TensorDict) -> Result<Array2<f32>> {
            let rows = inputs.values().next().map_or(0, |t| t.shape()[0]);
            Ok(Array2::zeros((rows, 2)))
        }
    }

    struct Counting {
        pulls: usize,
    }

    impl BatchSource for Counting {
        fn next_batch(&mut self) -> Result<Batch> {
            self.pulls += 1;
            let mut batch = Batch::default();
            batch
                .inputs
                .insert("input_x_continuous".to_string(), ArrayD::zeros(IxDyn(&[2, 1])));
            batch.outputs.insert(
                "output_age_continuous".to_string(),
                array(vec![0.0, 1.0], &[2, 1]),
            );
            batch.paths = vec![PathBuf::from("a.tensor"), PathBuf::from("b.tensor")];
            Ok(batch)
        }
    }

    #[test]
    fn test_scalar_evaluation_from_generator() {
        let age = TensorMap::new("age", &[1], Interpretation::Continuous);
        let lax = TensorMap::new("lax", &[3, 3], Interpretation::Continuous);
        let model = ConstantModel {
            outputs: vec![age.clone(), lax.clone()],
        };
        let mut generator = Counting { pulls: 0 };
        let options = EvaluationOptions {
            hidden_layer: "embed",
            plot_folder: Path::new("."),
            embed_visualization: None,
            alpha: 0.5,
        };
        let mut sink = RecordingPlotSink::default();

        let metrics = predict_scalars_and_evaluate_from_generator(
            &model,
            &mut generator,
            &[age, lax],
            &[],
            3,
            &options,
            &mut sink,
        )
        .unwrap();

        assert_eq!(generator.pulls, 3);
        assert_eq!(metrics.len(), 2);
        assert!((metrics["age_pearson"] - 1.0).abs() < 1e-9);
        assert_eq!(sink.figures[0].curves[0].x.len(), 6);
        assert_eq!(sink.embeddings.len(), 1);
        assert_eq!(sink.embeddings[0].points.len(), 6);
    }

    #[test]
    fn test_scalar_evaluation_without_hidden_layer_skips_embedding() {
        let age = TensorMap::new("age", &[1], Interpretation::Continuous);
        let model = ConstantModel {
            outputs: vec![age.clone()],
        };
        let options = EvaluationOptions {
            hidden_layer: "dense_9",
            plot_folder: Path::new("."),
            embed_visualization: None,
            alpha: 0.5,
        };
        let mut sink = RecordingPlotSink::default();

        predict_scalars_and_evaluate_from_generator(
            &model,
            &mut Counting { pulls: 0 },
            &[age],
            &[],
            2,
            &options,
            &mut sink,
        )
        .unwrap();

        assert!(sink.embeddings.is_empty());
    }
}
