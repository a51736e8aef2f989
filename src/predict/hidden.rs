use crate::data::generator::{BatchSource, TensorGenerator};
use crate::data::{Batch, TensorDict};
use crate::model::Model;
use crate::predict::{for_each_sample, id_columns, id_header, tsv_writer};
use crate::tensor_map::TensorMap;
use anyhow::{Context, Result};
use ndarray::{ArrayD, IxDyn};
use std::path::{Path, PathBuf};
use tracing::info;

const LOG_EVERY: usize = 500;

pub fn hidden_file_name(output_folder: &Path, prefix: &str, id: &str) -> PathBuf {
    output_folder
        .join(id)
        .join(format!("hidden_{}_{}.tsv", prefix, id))
}

/// Width of a hidden layer, probed with a single all-zero sample
pub fn latent_dimensions(model: &dyn Model, layer: &str) -> Result<usize> {
    let probe: TensorDict = model
        .input_maps()
        .iter()
        .map(|tm| {
            let mut shape = vec![1];
            shape.extend(&tm.shape);
            (tm.input_name(), ArrayD::zeros(IxDyn(&shape)))
        })
        .collect();
    let hidden = model.hidden(layer, &probe)?;
    Ok(hidden.ncols())
}

/// Write the activations of `layer` for every sample to `hidden_<prefix>_<id>.tsv`
pub fn infer_hidden_layer(
    model: &dyn Model,
    layer: &str,
    prefix: &str,
    generator: &mut dyn BatchSource,
    output_folder: &Path,
    id: &str,
    tsv_style: &str,
) -> Result<PathBuf> {
    if !model.has_layer(layer) {
        return Err(model.missing_layer(layer).into());
    }
    let inference_tsv = hidden_file_name(output_folder, prefix, id);
    let dimensions = latent_dimensions(model, layer)?;
    info!(
        "Layer {} has {} latent dimensions. Will write inferences to: {:?}",
        layer, dimensions, inference_tsv
    );

    let mut writer = tsv_writer(&inference_tsv)?;
    let mut header = id_header(tsv_style);
    header.extend((0..dimensions).map(|i| format!("latent_{}", i)));
    writer.write_record(&header)?;

    for_each_sample(generator, "Latent space inference", LOG_EVERY, |sample_id, batch| {
        let hidden = model.hidden(layer, &batch.inputs)?;
        let latent = hidden
            .rows()
            .into_iter()
            .next()
            .with_context(|| format!("No activations of {} for {}", layer, sample_id))?;
        let mut row = id_columns(tsv_style, sample_id);
        row.extend(latent.iter().map(|v| v.to_string()));
        writer.write_record(&row)?;
        writer.flush()?;
        Ok(())
    })?;

    Ok(inference_tsv)
}

/// Adds all-zero tensors for the model inputs a batch does not carry
struct ZeroFilledInputs<'a> {
    inner: &'a mut dyn BatchSource,
    maps: &'a [TensorMap],
}

impl BatchSource for ZeroFilledInputs<'_> {
    fn next_batch(&mut self) -> Result<Batch> {
        let mut batch = self.inner.next_batch()?;
        let rows = batch.len();
        for tm in self.maps {
            batch.inputs.entry(tm.input_name()).or_insert_with(|| {
                let mut shape = vec![rows];
                shape.extend(&tm.shape);
                ArrayD::zeros(IxDyn(&shape))
            });
        }
        Ok(batch)
    }
}

/// One hidden TSV per input, from that input's encoder layer alone
pub fn infer_encoders(
    model: &dyn Model,
    mut paths: Vec<PathBuf>,
    output_folder: &Path,
    id: &str,
    tsv_style: &str,
) -> Result<Vec<PathBuf>> {
    paths.sort();
    let mut written = Vec::with_capacity(model.input_maps().len());
    for tm in model.input_maps() {
        let mut generator = TensorGenerator::from_maps(
            &format!("{} encoder", tm.name),
            1,
            std::slice::from_ref(tm),
            &[],
            paths.clone(),
        );
        let mut source = ZeroFilledInputs {
            inner: &mut generator,
            maps: model.input_maps(),
        };
        let layer = format!("encoder_{}", tm.name);
        written.push(infer_hidden_layer(
            model,
            &layer,
            &tm.name,
            &mut source,
            output_folder,
            id,
            tsv_style,
        )?);
    }
    Ok(written)
}
