use crate::data::TENSOR_EXT;
use crate::error::RecipeError;
use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Read the sample ids in the first column of a CSV, skipping its header row
pub fn sample_ids_from_csv<P: AsRef<Path>>(path: P) -> Result<HashSet<String>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open sample csv {:?}", path))?;

    let mut ids = HashSet::new();
    for record in reader.records() {
        let record = record.context("Failed to parse sample csv record")?;
        if let Some(id) = record.get(0) {
            ids.insert(id.trim().to_string());
        }
    }

    debug!("Read {} sample ids from {:?}", ids.len(), path);
    Ok(ids)
}

/// List tensor files in a directory, sorted by file name
pub fn tensor_paths<P: AsRef<Path>>(tensors: P) -> Result<Vec<PathBuf>> {
    let tensors = tensors.as_ref();
    let mut paths: Vec<PathBuf> = fs::read_dir(tensors)
        .with_context(|| format!("Failed to read tensors directory {:?}", tensors))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .map_or(false, |name| name.to_string_lossy().ends_with(TENSOR_EXT))
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// Tensor files, optionally restricted to the sample ids listed in `sample_csv`
pub fn tensor_paths_from_sample_csv<P: AsRef<Path>>(
    tensors: P,
    sample_csv: Option<&Path>,
) -> Result<Vec<PathBuf>> {
    let tensors = tensors.as_ref();
    let mut paths = tensor_paths(tensors)?;

    if let Some(csv_path) = sample_csv {
        let sample_set = sample_ids_from_csv(csv_path)?;
        paths.retain(|path| sample_set.contains(&crate::data::sample_id_from_path(path)));
    }

    if paths.is_empty() {
        return Err(RecipeError::NoTensors(tensors.to_path_buf()).into());
    }

    info!("Found {} tensor paths.", paths.len());
    Ok(paths)
}
