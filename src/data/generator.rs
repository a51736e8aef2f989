//! Batch generators over per-sample tensor files.
//!
//! A [`TensorGenerator`] cycles through its sample paths forever, one epoch
//! after another. Samples whose tensors cannot be extracted are skipped and
//! counted; the counts are logged at every epoch boundary.

use crate::data::archive::TensorArchive;
use crate::data::{Batch, SplitConfig, TensorDict};
use crate::error::RecipeError;
use crate::tensor_map::{extractors, TensorExtractor, TensorMap};
use anyhow::{anyhow, bail, Context, Result};
use ndarray::{ArrayD, ArrayViewD, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Anything that yields batches on demand
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<Batch>;
}

#[derive(Debug, Default)]
struct EpochStats {
    samples: usize,
    failures: usize,
    last_error: Option<String>,
}

/// Deterministic cycling generator over tensor files
pub struct TensorGenerator {
    name: String,
    batch_size: usize,
    inputs: Vec<Box<dyn TensorExtractor>>,
    outputs: Vec<Box<dyn TensorExtractor>>,
    paths: Vec<PathBuf>,
    cursor: usize,
    epoch: usize,
    stats: EpochStats,
    rng: Option<ChaCha8Rng>,
}

impl TensorGenerator {
    pub fn new(
        name: &str,
        batch_size: usize,
        inputs: Vec<Box<dyn TensorExtractor>>,
        outputs: Vec<Box<dyn TensorExtractor>>,
        paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            name: name.to_string(),
            batch_size: batch_size.max(1),
            inputs,
            outputs,
            paths,
            cursor: 0,
            epoch: 0,
            stats: EpochStats::default(),
            rng: None,
        }
    }

    /// Generator over plain tensor maps
    pub fn from_maps(
        name: &str,
        batch_size: usize,
        inputs: &[TensorMap],
        outputs: &[TensorMap],
        paths: Vec<PathBuf>,
    ) -> Self {
        Self::new(name, batch_size, extractors(inputs), extractors(outputs), paths)
    }

    /// Reshuffle the sample order at the start of every epoch
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.paths.shuffle(&mut rng);
        self.rng = Some(rng);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn end_epoch(&mut self) {
        info!(
            "{} generator finished epoch {}: {} tensors read, {} skipped{}",
            self.name,
            self.epoch + 1,
            self.stats.samples,
            self.stats.failures,
            self.stats
                .last_error
                .as_ref()
                .map(|e| format!(" (last error: {})", e))
                .unwrap_or_default(),
        );
        self.stats = EpochStats::default();
        self.epoch += 1;
        self.cursor = 0;
        if let Some(rng) = self.rng.as_mut() {
            self.paths.shuffle(rng);
        }
    }

    fn load_sample(&self, path: &Path) -> Result<(Vec<ArrayD<f32>>, Vec<ArrayD<f32>>)> {
        let archive = TensorArchive::open(path)
            .with_context(|| format!("Failed to open {:?}", path))?;

        let read = |extractor: &Box<dyn TensorExtractor>| {
            extractor
                .tensor_from_file(&archive)
                .with_context(|| format!("{} from {:?}", extractor.tensor_map().name, path))
        };
        let inputs = self.inputs.iter().map(read).collect::<Result<Vec<_>>>()?;
        let outputs = self.outputs.iter().map(read).collect::<Result<Vec<_>>>()?;
        Ok((inputs, outputs))
    }
}

impl BatchSource for TensorGenerator {
    fn next_batch(&mut self) -> Result<Batch> {
        if self.paths.is_empty() {
            bail!("{} generator has no tensor paths", self.name);
        }

        let mut input_rows: Vec<Vec<ArrayD<f32>>> = vec![Vec::new(); self.inputs.len()];
        let mut output_rows: Vec<Vec<ArrayD<f32>>> = vec![Vec::new(); self.outputs.len()];
        let mut paths = Vec::with_capacity(self.batch_size);
        let mut consecutive_failures = 0;

        while paths.len() < self.batch_size {
            if self.cursor >= self.paths.len() {
                self.end_epoch();
            }
            let path = self.paths[self.cursor].clone();
            self.cursor += 1;

            match self.load_sample(&path) {
                Ok((inputs, outputs)) => {
                    for (rows, tensor) in input_rows.iter_mut().zip(inputs) {
                        rows.push(tensor);
                    }
                    for (rows, tensor) in output_rows.iter_mut().zip(outputs) {
                        rows.push(tensor);
                    }
                    paths.push(path);
                    self.stats.samples += 1;
                    consecutive_failures = 0;
                }
                Err(e) => {
                    debug!("Skipping {:?}: {:#}", path, e);
                    self.stats.failures += 1;
                    self.stats.last_error = Some(format!("{:#}", e));
                    consecutive_failures += 1;
                    if consecutive_failures >= self.paths.len() {
                        return Err(e.context(format!(
                            "Every tensor in the {} generator failed to load",
                            self.name
                        )));
                    }
                }
            }
        }

        let mut batch = Batch {
            paths,
            ..Batch::default()
        };
        for (extractor, rows) in self.inputs.iter().zip(&input_rows) {
            batch
                .inputs
                .insert(extractor.tensor_map().input_name(), stack_rows(rows)?);
        }
        for (extractor, rows) in self.outputs.iter().zip(&output_rows) {
            batch
                .outputs
                .insert(extractor.tensor_map().output_name(), stack_rows(rows)?);
        }
        Ok(batch)
    }
}

fn stack_rows(rows: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
    let views: Vec<ArrayViewD<f32>> = rows.iter().map(|r| r.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

/// Concatenate tensor dictionaries along the batch axis
pub fn concatenate_dicts(dicts: &[TensorDict]) -> Result<TensorDict> {
    let mut merged = TensorDict::new();
    let first = match dicts.first() {
        Some(first) => first,
        None => return Ok(merged),
    };
    for key in first.keys() {
        let views = dicts
            .iter()
            .map(|d| {
                d.get(key)
                    .map(|t| t.view())
                    .ok_or_else(|| anyhow!("Batch is missing {}", key))
            })
            .collect::<Result<Vec<_>>>()?;
        merged.insert(key.clone(), ndarray::concatenate(Axis(0), &views)?);
    }
    Ok(merged)
}

/// Pull `steps` batches and concatenate them into one big batch
pub fn big_batch_from_minibatch_generator(
    generator: &mut dyn BatchSource,
    steps: usize,
) -> Result<Batch> {
    let mut inputs = Vec::with_capacity(steps);
    let mut outputs = Vec::with_capacity(steps);
    let mut paths = Vec::new();

    for _ in 0..steps {
        let batch = generator.next_batch()?;
        inputs.push(batch.inputs);
        outputs.push(batch.outputs);
        paths.extend(batch.paths);
    }

    let batch = Batch {
        inputs: concatenate_dicts(&inputs)?,
        outputs: concatenate_dicts(&outputs)?,
        paths,
    };
    info!("Made a big batch of {} samples from {} minibatches", batch.len(), steps);
    Ok(batch)
}

/// Train, validation and test generators over one split of the samples
pub struct GeneratorSet {
    pub train: TensorGenerator,
    pub valid: TensorGenerator,
    pub test: TensorGenerator,
}

/// Split sample paths into train, validation and test sets
pub fn split_paths(
    mut paths: Vec<PathBuf>,
    config: &SplitConfig,
) -> Result<(Vec<PathBuf>, Vec<PathBuf>, Vec<PathBuf>)> {
    let total = paths.len();
    let count = |ratio: f32| -> usize {
        if ratio <= 0.0 {
            0
        } else {
            ((total as f32 * ratio).round() as usize).max(1)
        }
    };
    let n_valid = count(config.val_ratio);
    let n_test = count(config.test_ratio);

    if n_valid + n_test >= total {
        return Err(RecipeError::InvalidConfig(format!(
            "Cannot split {} tensors into {} validation and {} test samples with a non-empty training set",
            total, n_valid, n_test
        ))
        .into());
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    paths.shuffle(&mut rng);

    let mut test = paths.split_off(total - n_test);
    let mut valid = paths.split_off(paths.len() - n_valid);
    let train = paths;
    valid.sort();
    test.sort();

    info!(
        "Split {} tensors into {} train, {} validation and {} test",
        total,
        train.len(),
        valid.len(),
        test.len()
    );
    Ok((train, valid, test))
}

/// Build the three generators; only the training generator reshuffles
pub fn test_train_valid_generators(
    paths: Vec<PathBuf>,
    inputs: &[TensorMap],
    outputs: &[TensorMap],
    batch_size: usize,
    config: &SplitConfig,
) -> Result<GeneratorSet> {
    let (train, valid, test) = split_paths(paths, config)?;
    Ok(GeneratorSet {
        train: TensorGenerator::from_maps("train", batch_size, inputs, outputs, train)
            .with_shuffle(config.seed),
        valid: TensorGenerator::from_maps("validation", batch_size, inputs, outputs, valid),
        test: TensorGenerator::from_maps("test", batch_size, inputs, outputs, test),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor_map::Interpretation;
    use ndarray::IxDyn;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn write_sample(dir: &Path, id: usize, age: Option<f32>) -> PathBuf {
        let path = dir.join(format!("{}.tensor", id));
        let mut datasets = BTreeMap::new();
        datasets.insert(
            "ecg".to_string(),
            ArrayD::from_elem(IxDyn(&[4]), id as f32),
        );
        if let Some(age) = age {
            datasets.insert("age".to_string(), ArrayD::from_elem(IxDyn(&[1]), age));
        }
        TensorArchive::write(&path, &datasets).unwrap();
        path
    }

    fn maps() -> (Vec<TensorMap>, Vec<TensorMap>) {
        (
            vec![TensorMap::new("ecg", &[4], Interpretation::Continuous)],
            vec![TensorMap::new("age", &[1], Interpretation::Continuous)],
        )
    }

    #[test]
    fn test_batches_cycle_through_paths() {
        let dir = TempDir::new().unwrap();
        let paths: Vec<PathBuf> = (0..3).map(|i| write_sample(dir.path(), i, Some(50.0))).collect();
        let (inputs, outputs) = maps();
        let mut generator = TensorGenerator::from_maps("test", 2, &inputs, &outputs, paths.clone());

        let first = generator.next_batch().unwrap();
        assert_eq!(first.paths, paths[0..2].to_vec());
        assert_eq!(first.inputs["input_ecg_continuous"].shape(), &[2, 4]);
        assert_eq!(first.outputs["output_age_continuous"].shape(), &[2, 1]);

        let second = generator.next_batch().unwrap();
        assert_eq!(second.paths, vec![paths[2].clone(), paths[0].clone()]);
        assert_eq!(generator.epoch(), 1);
    }

    #[test]
    fn test_failed_samples_are_skipped() {
        let dir = TempDir::new().unwrap();
        let paths = vec![
            write_sample(dir.path(), 0, Some(40.0)),
            write_sample(dir.path(), 1, None),
            write_sample(dir.path(), 2, Some(60.0)),
        ];
        let (inputs, outputs) = maps();
        let mut generator = TensorGenerator::from_maps("test", 2, &inputs, &outputs, paths.clone());

        let batch = generator.next_batch().unwrap();
        assert_eq!(batch.paths, vec![paths[0].clone(), paths[2].clone()]);
    }

    #[test]
    fn test_all_failures_is_an_error() {
        let dir = TempDir::new().unwrap();
        let paths = vec![write_sample(dir.path(), 0, None), write_sample(dir.path(), 1, None)];
        let (inputs, outputs) = maps();
        let mut generator = TensorGenerator::from_maps("test", 1, &inputs, &outputs, paths);
        assert!(generator.next_batch().is_err());
    }

    #[test]
    fn test_big_batch() {
        let dir = TempDir::new().unwrap();
        let paths: Vec<PathBuf> = (0..4).map(|i| write_sample(dir.path(), i, Some(1.0))).collect();
        let (inputs, outputs) = maps();
        let mut generator = TensorGenerator::from_maps("test", 2, &inputs, &outputs, paths);

        let batch = big_batch_from_minibatch_generator(&mut generator, 2).unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.inputs["input_ecg_continuous"].shape(), &[4, 4]);
    }

    #[test]
    fn test_split_paths() {
        let paths: Vec<PathBuf> = (0..10).map(|i| PathBuf::from(format!("{}.tensor", i))).collect();
        let config = SplitConfig {
            train_ratio: 0.7,
            val_ratio: 0.2,
            test_ratio: 0.1,
            seed: 7,
        };
        let (train, valid, test) = split_paths(paths.clone(), &config).unwrap();
        assert_eq!((train.len(), valid.len(), test.len()), (7, 2, 1));

        let (train_again, _, _) = split_paths(paths, &config).unwrap();
        assert_eq!(train, train_again);
    }

    #[test]
    fn test_split_needs_training_samples() {
        let paths = vec![PathBuf::from("a.tensor"), PathBuf::from("b.tensor")];
        let config = SplitConfig::default();
        assert!(split_paths(paths, &config).is_err());
    }
}
