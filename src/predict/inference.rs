use crate::data::archive::TensorArchive;
use crate::data::generator::BatchSource;
use crate::data::{TensorDict, TENSOR_EXT};
use crate::evaluate::metrics::{survival_actual, survival_follow_up, survival_prediction};
use crate::model::Model;
use crate::predict::{for_each_sample, id_columns, id_header, tsv_writer};
use crate::tensor_map::{Interpretation, TensorMap};
use crate::utils::ensure_dir;
use anyhow::{Context, Result};
use ndarray::{ArrayD, ArrayViewD, Axis};
use std::path::{Path, PathBuf};
use tracing::info;

const LOG_EVERY: usize = 250;
const MISSING: &str = "NA";

pub fn inference_file_name(output_folder: &Path, id: &str) -> PathBuf {
    output_folder.join(id).join(format!("inference_{}.tsv", id))
}

/// Side file holding the multi-axis outputs of one sample
pub fn inferred_tensor_path(output_folder: &Path, id: &str, sample_id: &str) -> PathBuf {
    output_folder
        .join(id)
        .join("inferred_hd5s")
        .join(format!("{}{}", sample_id, TENSOR_EXT))
}

/// Header columns for the outputs that are written to the TSV
pub fn inference_header(outputs: &[TensorMap], tsv_style: &str) -> Vec<String> {
    let mut header = id_header(tsv_style);
    for tm in outputs {
        match tm.interpretation {
            Interpretation::Continuous if tm.axes() == 1 => {
                header.push(format!("{}_prediction", tm.name));
                header.push(format!("{}_actual", tm.name));
            }
            Interpretation::Categorical if tm.axes() == 1 => {
                for (channel, _) in tm.channel_map.iter() {
                    header.push(format!("{}_{}_prediction", tm.name, channel));
                    header.push(format!("{}_{}_actual", tm.name, channel));
                }
            }
            Interpretation::SurvivalCurve => {
                header.push(format!("{}_prediction", tm.name));
                header.push(format!("{}_actual", tm.name));
                header.push(format!("{}_follow_up", tm.name));
            }
            _ => {}
        }
    }
    header
}

fn first_sample(tensor: &ArrayD<f32>) -> Result<ArrayViewD<'_, f32>> {
    if tensor.ndim() == 0 || tensor.shape()[0] == 0 {
        anyhow::bail!("Expected a batch with at least one sample, got shape {:?}", tensor.shape());
    }
    Ok(tensor.index_axis(Axis(0), 0))
}

fn value_at(sample: &ArrayViewD<f32>, index: usize) -> f32 {
    sample.iter().nth(index).copied().unwrap_or(f32::NAN)
}

/// Prediction and actual columns for one output of one sample
fn output_columns(tm: &TensorMap, prediction: &ArrayD<f32>, truth: Option<&ArrayD<f32>>) -> Result<Vec<String>> {
    let predicted = first_sample(prediction)?;
    let actual = truth.map(first_sample).transpose()?;
    let mut columns = Vec::new();

    match tm.interpretation {
        Interpretation::Continuous if tm.axes() == 1 => {
            columns.push(tm.rescale_value(value_at(&predicted, 0)).to_string());
            let label = actual.as_ref().map_or(f32::NAN, |a| value_at(a, 0));
            if label.is_nan() || tm.is_sentinel(label) {
                columns.push(MISSING.to_string());
            } else {
                columns.push(tm.rescale_value(label).to_string());
            }
        }
        Interpretation::Categorical if tm.axes() == 1 => {
            for (_, index) in tm.channel_map.iter() {
                columns.push(value_at(&predicted, index).to_string());
                let label = actual.as_ref().map_or(f32::NAN, |a| value_at(a, index));
                columns.push(if label.is_nan() {
                    MISSING.to_string()
                } else {
                    label.to_string()
                });
            }
        }
        Interpretation::SurvivalCurve => {
            let intervals = tm.size() / 2;
            let hazards: Vec<f32> = predicted.iter().copied().collect();
            columns.push(survival_prediction(&hazards, intervals).to_string());
            match actual {
                Some(actual) => {
                    let truth: Vec<f32> = actual.iter().copied().collect();
                    columns.push(survival_actual(&truth, intervals).to_string());
                    columns.push(survival_follow_up(&truth, intervals, tm.days_window).to_string());
                }
                None => columns.extend([MISSING.to_string(), MISSING.to_string()]),
            }
        }
        _ => {}
    }
    Ok(columns)
}

/// One TSV row for a single-sample batch
pub fn inference_row(
    sample_id: &str,
    outputs: &[TensorMap],
    predictions: &TensorDict,
    truth: &TensorDict,
    tsv_style: &str,
) -> Result<Vec<String>> {
    let mut row = id_columns(tsv_style, sample_id);
    for tm in outputs {
        let prediction = predictions
            .get(&tm.output_name())
            .with_context(|| format!("Model produced no prediction for {}", tm.name))?;
        row.extend(output_columns(tm, prediction, truth.get(&tm.output_name()))?);
    }
    Ok(row)
}

/// Append rescaled truth and prediction of every multi-axis output to a side file
pub fn write_side_tensors(
    path: &Path,
    outputs: &[TensorMap],
    predictions: &TensorDict,
    truth: &TensorDict,
) -> Result<usize> {
    let mut written = 0;
    for tm in outputs.iter().filter(|tm| tm.axes() > 1) {
        let (Some(prediction), Some(actual)) =
            (predictions.get(&tm.output_name()), truth.get(&tm.output_name()))
        else {
            continue;
        };
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let actual = tm.rescale(&first_sample(actual)?.to_owned());
        let prediction = tm.rescale(&first_sample(prediction)?.to_owned());
        TensorArchive::append_dataset(path, &format!("{}_truth", tm.name), &actual)?;
        TensorArchive::append_dataset(path, &format!("{}_prediction", tm.name), &prediction)?;
        written += 1;
    }
    Ok(written)
}

/// Write one inference row per sample until the generator wraps around.
///
/// `generator` must yield single-sample batches in a fixed order, with
/// NaN-on-fail output maps so one bad label never stops the run.
pub fn infer_multimodal_multitask(
    model: &dyn Model,
    generator: &mut dyn BatchSource,
    output_folder: &Path,
    id: &str,
    tsv_style: &str,
) -> Result<PathBuf> {
    let inference_tsv = inference_file_name(output_folder, id);
    let outputs = model.output_maps().to_vec();
    let mut writer = tsv_writer(&inference_tsv)?;
    writer.write_record(inference_header(&outputs, tsv_style))?;

    let count = for_each_sample(generator, "Inference", LOG_EVERY, |sample_id, batch| {
        let predictions = model.predict(&batch.inputs)?;
        writer.write_record(inference_row(sample_id, &outputs, &predictions, &batch.outputs, tsv_style)?)?;
        writer.flush()?;
        write_side_tensors(
            &inferred_tensor_path(output_folder, id, sample_id),
            &outputs,
            &predictions,
            &batch.outputs,
        )?;
        Ok(())
    })?;

    info!("Inference TSV with {} rows at: {:?}", count, inference_tsv);
    Ok(inference_tsv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predict::test_support::CyclingSource;
    use crate::tensor_map::{ChannelMap, Normalization};
    use ndarray::{Array2, IxDyn};
    use std::fs;
    use tempfile::TempDir;

    fn array(values: Vec<f32>, shape: &[usize]) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(shape), values).unwrap()
    }

    fn age() -> TensorMap {
        TensorMap::new("age", &[1], Interpretation::Continuous)
            .with_sentinel(-1.0)
            .with_normalization(Normalization::Standardize { mean: 50.0, std: 10.0 })
    }

    fn sex() -> TensorMap {
        TensorMap::new("sex", &[2], Interpretation::Categorical)
            .with_channel_map(ChannelMap::new([("female", 0), ("male", 1)]))
    }

    fn dict(name: &str, tensor: ArrayD<f32>) -> TensorDict {
        TensorDict::from([(name.to_string(), tensor)])
    }

    #[test]
    fn test_continuous_actual_na() {
        let tm = age();
        let prediction = dict("output_age_continuous", array(vec![1.0], &[1, 1]));
        for label in [f32::NAN, -1.0] {
            let truth = dict("output_age_continuous", array(vec![label], &[1, 1]));
            let row = inference_row("s1", &[tm.clone()], &prediction, &truth, "standard").unwrap();
            assert_eq!(row, vec!["s1", "60", "NA"]);
        }

        let truth = dict("output_age_continuous", array(vec![0.5], &[1, 1]));
        let row = inference_row("s1", &[tm], &prediction, &truth, "genetics").unwrap();
        assert_eq!(row, vec!["s1", "s1", "60", "55"]);
    }

    #[test]
    fn test_categorical_columns() {
        let tm = sex();
        let header = inference_header(&[tm.clone()], "standard");
        assert_eq!(header.len() - 1, 2 * tm.channel_map.len());
        assert_eq!(header[1], "sex_female_prediction");

        let prediction = dict("output_sex_categorical", array(vec![0.25, 0.75], &[1, 2]));
        let truth = dict("output_sex_categorical", array(vec![f32::NAN, f32::NAN], &[1, 2]));
        let row = inference_row("s1", &[tm], &prediction, &truth, "standard").unwrap();
        assert_eq!(row, vec!["s1", "0.25", "NA", "0.75", "NA"]);
    }

    #[test]
    fn test_survival_columns() {
        let tm = TensorMap::new("death", &[4], Interpretation::SurvivalCurve).with_days_window(10);
        let prediction = dict("output_death_survival_curve", array(vec![0.5, 0.5, 0.0, 0.0], &[1, 4]));
        let truth = dict("output_death_survival_curve", array(vec![1.0, 1.0, 0.0, 1.0], &[1, 4]));
        let row = inference_row("s1", &[tm.clone()], &prediction, &truth, "standard").unwrap();
        // days per bin = 1 + 10 / 2
        assert_eq!(row, vec!["s1", "0.75", "1", "12"]);
        assert_eq!(inference_header(&[tm], "standard").len(), 4);
    }

    struct EchoModel {
        outputs: Vec<TensorMap>,
    }

    impl Model for EchoModel {
        fn name(&self) -> &str {
            "echo"
        }

        fn input_maps(&self) -> &[TensorMap] {
            &[]
        }

        fn output_maps(&self) -> &[TensorMap] {
            &self.outputs
        }

        fn layer_names(&self) -> Vec<String> {
            Vec::new()
        }

        fn predict(&self, inputs: &TensorDict) -> Result<TensorDict> {
            let x = inputs["input_x_continuous"].iter().next().copied().unwrap_or(0.0);
            Ok(TensorDict::from([
                ("output_age_continuous".to_string(), array(vec![x], &[1, 1])),
                ("output_lax_continuous".to_string(), ArrayD::from_elem(IxDyn(&[1, 2, 2]), x)),
            ]))
        }

        fn hidden(&self, _: &str, _: &TensorDict) -> Result<Array2<f32>> {
            Ok(Array2::zeros((1, 1)))
        }
    }

    #[test]
    fn test_inference_over_cycling_generator() {
        let dir = TempDir::new().unwrap();
        let lax = TensorMap::new("lax", &[2, 2], Interpretation::Continuous);
        let model = EchoModel {
            outputs: vec![age(), lax],
        };
        let batches = (0..3)
            .map(|i| {
                let inputs = dict("input_x_continuous", array(vec![i as f32], &[1, 1]));
                let mut outputs = dict("output_age_continuous", array(vec![i as f32], &[1, 1]));
                outputs.insert("output_lax_continuous".to_string(), ArrayD::zeros(IxDyn(&[1, 2, 2])));
                (PathBuf::from(format!("/tensors/p{}.tensor", i + 1)), inputs, outputs)
            })
            .collect();
        let mut source = CyclingSource::new(batches);

        let tsv = infer_multimodal_multitask(&model, &mut source, dir.path(), "run", "standard").unwrap();

        let text = fs::read_to_string(&tsv).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "sample_id\tage_prediction\tage_actual");
        assert_eq!(lines[1], "p1\t50\t50");
        assert!(lines[3].starts_with("p3\t"));

        let side = TensorArchive::open(inferred_tensor_path(dir.path(), "run", "p2")).unwrap();
        assert!(side.contains("lax_truth"));
        assert_eq!(side.get("lax_prediction").unwrap().shape(), &[2, 2]);
    }
}
