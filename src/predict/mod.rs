//! Per-sample inference written to TSV files.
//!
//! Both writers pull batches of one sample from a generator until a sample
//! path recurs, which marks the end of the generator's epoch.

pub mod hidden;
pub mod inference;

use crate::data::generator::BatchSource;
use crate::data::{sample_id_from_path, Batch};
use crate::utils::ensure_dir;
use anyhow::{Context, Result};
use csv::{QuoteStyle, Writer, WriterBuilder};
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

/// Sample paths already written by one inference loop
#[derive(Debug, Default)]
pub struct EpochTracker {
    seen: HashSet<PathBuf>,
}

impl EpochTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a path; returns false when it was already seen
    pub fn visit(&mut self, path: &Path) -> bool {
        self.seen.insert(path.to_path_buf())
    }

    pub fn count(&self) -> usize {
        self.seen.len()
    }
}

/// Whether sample ids are written as a genetics `FID`/`IID` pair
pub fn is_genetics_style(tsv_style: &str) -> bool {
    tsv_style.contains("genetics")
}

pub fn id_header(tsv_style: &str) -> Vec<String> {
    if is_genetics_style(tsv_style) {
        vec!["FID".to_string(), "IID".to_string()]
    } else {
        vec!["sample_id".to_string()]
    }
}

pub fn id_columns(tsv_style: &str, sample_id: &str) -> Vec<String> {
    let copies = if is_genetics_style(tsv_style) { 2 } else { 1 };
    vec![sample_id.to_string(); copies]
}

/// Tab-delimited writer with minimal quoting, creating parent folders
pub fn tsv_writer(path: &Path) -> Result<Writer<File>> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(QuoteStyle::Necessary)
        .from_path(path)
        .with_context(|| format!("Failed to create {:?}", path))
}

/// Call `on_sample` once per unique sample of a batch-size-1 generator.
///
/// When a path recurs one more batch is pulled so the generator logs its
/// epoch summary, then the loop ends. Returns the number of samples seen.
pub fn for_each_sample<F>(
    generator: &mut dyn BatchSource,
    description: &str,
    log_every: usize,
    mut on_sample: F,
) -> Result<usize>
where
    F: FnMut(&str, &Batch) -> Result<()>,
{
    let mut tracker = EpochTracker::new();
    loop {
        let batch = generator.next_batch()?;
        let path = batch
            .paths
            .first()
            .cloned()
            .context("Inference generator returned an empty batch")?;
        if !tracker.visit(&path) {
            generator.next_batch()?;
            info!("{} on {} tensors finished.", description, tracker.count());
            return Ok(tracker.count());
        }

        on_sample(&sample_id_from_path(&path), &batch)?;
        if tracker.count() % log_every == 0 {
            info!(
                "Wrote:{} rows of {}. Last tensor:{:?}",
                tracker.count(),
                description.to_lowercase(),
                path
            );
        }
    }
}
