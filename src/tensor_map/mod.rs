//! Tensor maps: metadata describing one model input or output.
//!
//! A [`TensorMap`] knows the shape of its tensor, how to interpret it when
//! scoring, how to read it from a per-sample [`TensorArchive`], and how to map
//! normalized values back to their original units.

pub mod nan_on_fail;

use crate::data::archive::TensorArchive;
use crate::error::RecipeError;
use anyhow::{Context, Result};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::info;

pub use nan_on_fail::NanOnFail;

/// Default survival window in days
pub const DEFAULT_DAYS_WINDOW: usize = 1460;

/// How an output is scored and plotted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpretation {
    Continuous,
    Categorical,
    SurvivalCurve,
    TimeToEvent,
    Language,
}

impl Interpretation {
    /// Get interpretation as string
    pub fn as_str(&self) -> &'static str {
        match self {
            Interpretation::Continuous => "continuous",
            Interpretation::Categorical => "categorical",
            Interpretation::SurvivalCurve => "survival_curve",
            Interpretation::TimeToEvent => "time_to_event",
            Interpretation::Language => "language",
        }
    }
}

impl fmt::Display for Interpretation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalization applied on read; `rescale` inverts it
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Normalization {
    #[default]
    None,
    Standardize { mean: f32, std: f32 },
    Range { min: f32, max: f32 },
}

impl Normalization {
    pub fn normalize(&self, x: f32) -> f32 {
        match *self {
            Normalization::None => x,
            Normalization::Standardize { mean, std } => (x - mean) / std,
            Normalization::Range { min, max } => (x - min) / (max - min),
        }
    }

    pub fn rescale(&self, x: f32) -> f32 {
        match *self {
            Normalization::None => x,
            Normalization::Standardize { mean, std } => x * std + mean,
            Normalization::Range { min, max } => x * (max - min) + min,
        }
    }
}

/// Check run on every extracted tensor
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Validator {
    #[default]
    None,
    NoNans,
    Range { min: f32, max: f32 },
}

impl Validator {
    /// Validate an extracted tensor, ignoring sentinel entries
    pub fn check(
        &self,
        name: &str,
        tensor: &ArrayD<f32>,
        sentinel: Option<f32>,
    ) -> Result<(), ExtractionError> {
        let is_sentinel = |x: f32| sentinel.map_or(false, |s| s == x);
        match *self {
            Validator::None => Ok(()),
            Validator::NoNans => {
                if tensor.iter().any(|x| x.is_nan()) {
                    Err(ExtractionError::Value(format!("{} contains NaNs", name)))
                } else {
                    Ok(())
                }
            }
            Validator::Range { min, max } => {
                match tensor.iter().find(|&&x| !is_sentinel(x) && (x < min || x > max)) {
                    Some(x) => Err(ExtractionError::Value(format!(
                        "{} value {} outside [{}, {}]",
                        name, x, min, max
                    ))),
                    None => Ok(()),
                }
            }
        }
    }
}

/// Layout of the stored dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Storage {
    /// Stored with the map's full shape
    #[default]
    Dense,
    /// Stored as a single class index, one-hot encoded on read
    ClassIndex,
}

/// Channel name to index mapping, iterated in index order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, usize>", into = "BTreeMap<String, usize>")]
pub struct ChannelMap {
    channels: Vec<(String, usize)>,
}

impl ChannelMap {
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let mut channels: Vec<(String, usize)> = channels
            .into_iter()
            .map(|(name, index)| (name.into(), index))
            .collect();
        channels.sort_by_key(|(_, index)| *index);
        Self { channels }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.channels.iter().map(|(name, index)| (name.as_str(), *index))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.channels
            .iter()
            .find(|(channel, _)| channel == name)
            .map(|(_, index)| *index)
    }

    /// Channel name stored at `index`
    pub fn name_of(&self, index: usize) -> Option<&str> {
        self.channels
            .iter()
            .find(|(_, i)| *i == index)
            .map(|(name, _)| name.as_str())
    }
}

impl From<BTreeMap<String, usize>> for ChannelMap {
    fn from(map: BTreeMap<String, usize>) -> Self {
        ChannelMap::new(map)
    }
}

impl From<ChannelMap> for BTreeMap<String, usize> {
    fn from(map: ChannelMap) -> Self {
        map.channels.into_iter().collect()
    }
}

/// Failure while extracting one tensor from one sample
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("index error: {0}")]
    Index(String),
    #[error("missing key: {0}")]
    Key(String),
    #[error("invalid value: {0}")]
    Value(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime error: {0}")]
    Runtime(String),
}

fn default_days_window() -> usize {
    DEFAULT_DAYS_WINDOW
}

/// Metadata for one model input or output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorMap {
    pub name: String,
    pub shape: Vec<usize>,
    pub interpretation: Interpretation,
    #[serde(default)]
    pub channel_map: ChannelMap,
    #[serde(default)]
    pub normalization: Normalization,
    #[serde(default)]
    pub sentinel: Option<f32>,
    #[serde(default = "default_days_window")]
    pub days_window: usize,
    /// Dataset key inside the sample archive, defaults to `name`
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub validator: Validator,
}

impl TensorMap {
    pub fn new(name: &str, shape: &[usize], interpretation: Interpretation) -> Self {
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            interpretation,
            channel_map: ChannelMap::default(),
            normalization: Normalization::None,
            sentinel: None,
            days_window: DEFAULT_DAYS_WINDOW,
            dataset: None,
            storage: Storage::Dense,
            validator: Validator::None,
        }
    }

    pub fn with_channel_map(mut self, channel_map: ChannelMap) -> Self {
        self.channel_map = channel_map;
        self
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_sentinel(mut self, sentinel: f32) -> Self {
        self.sentinel = Some(sentinel);
        self
    }

    pub fn with_days_window(mut self, days_window: usize) -> Self {
        self.days_window = days_window;
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    /// Key of this map's tensors in a model's input dictionary
    pub fn input_name(&self) -> String {
        format!("input_{}_{}", self.name, self.interpretation)
    }

    /// Key of this map's tensors in a model's output dictionary
    pub fn output_name(&self) -> String {
        format!("output_{}_{}", self.name, self.interpretation)
    }

    /// Number of non-batch axes
    pub fn axes(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements in one sample's tensor
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of channels on the last axis
    pub fn channels(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Every channel index must address the last axis
    pub fn check_channel_map(&self) -> Result<(), RecipeError> {
        let channels = self.channels();
        match self.channel_map.iter().find(|(_, index)| *index >= channels) {
            Some((name, index)) => Err(RecipeError::InvalidConfig(format!(
                "channel {} of tensor map {} has index {} but the map has {} channels",
                name, self.name, index, channels
            ))),
            None => Ok(()),
        }
    }

    pub fn is_continuous(&self) -> bool {
        self.interpretation == Interpretation::Continuous
    }

    pub fn is_categorical(&self) -> bool {
        self.interpretation == Interpretation::Categorical
    }

    pub fn is_survival_curve(&self) -> bool {
        self.interpretation == Interpretation::SurvivalCurve
    }

    pub fn is_time_to_event(&self) -> bool {
        self.interpretation == Interpretation::TimeToEvent
    }

    pub fn is_language(&self) -> bool {
        self.interpretation == Interpretation::Language
    }

    pub fn dataset_key(&self) -> &str {
        self.dataset.as_deref().unwrap_or(&self.name)
    }

    pub fn is_sentinel(&self, value: f32) -> bool {
        self.sentinel.map_or(false, |s| s == value)
    }

    /// Map one normalized value back to original units
    pub fn rescale_value(&self, value: f32) -> f32 {
        self.normalization.rescale(value)
    }

    /// Map normalized values back to original units
    pub fn rescale(&self, tensor: &ArrayD<f32>) -> ArrayD<f32> {
        tensor.mapv(|x| self.normalization.rescale(x))
    }

    /// Read and normalize this map's tensor from a sample archive
    pub fn extract(&self, archive: &TensorArchive) -> Result<ArrayD<f32>, ExtractionError> {
        let raw = archive
            .get(self.dataset_key())
            .ok_or_else(|| ExtractionError::Key(self.dataset_key().to_string()))?;

        let tensor = match self.storage {
            Storage::Dense => {
                if raw.len() != self.size() {
                    return Err(ExtractionError::Value(format!(
                        "{} has {} values, expected shape {:?}",
                        self.name,
                        raw.len(),
                        self.shape
                    )));
                }
                let values: Vec<f32> = raw
                    .iter()
                    .map(|&x| if self.is_sentinel(x) { x } else { self.normalization.normalize(x) })
                    .collect();
                ArrayD::from_shape_vec(IxDyn(&self.shape), values)
                    .map_err(|e| ExtractionError::Value(e.to_string()))?
            }
            Storage::ClassIndex => {
                let index = raw
                    .iter()
                    .next()
                    .copied()
                    .ok_or_else(|| ExtractionError::Value(format!("{} is empty", self.name)))?;
                if !index.is_finite() || index < 0.0 {
                    return Err(ExtractionError::Value(format!(
                        "{} has invalid class index {}",
                        self.name, index
                    )));
                }
                let index = index as usize;
                if index >= self.size() {
                    return Err(ExtractionError::Index(format!(
                        "class index {} out of range for {} with {} channels",
                        index,
                        self.name,
                        self.size()
                    )));
                }
                let mut one_hot = vec![0.0f32; self.size()];
                one_hot[index] = 1.0;
                ArrayD::from_shape_vec(IxDyn(&self.shape), one_hot)
                    .map_err(|e| ExtractionError::Value(e.to_string()))?
            }
        };

        self.validator.check(&self.name, &tensor, self.sentinel)?;
        Ok(tensor)
    }
}

impl fmt::Display for TensorMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} ({})", self.name, self.shape, self.interpretation)
    }
}

/// Anything that can produce one map's tensor from a sample archive
pub trait TensorExtractor {
    fn tensor_map(&self) -> &TensorMap;

    fn tensor_from_file(&self, archive: &TensorArchive) -> Result<ArrayD<f32>, ExtractionError>;
}

impl TensorExtractor for TensorMap {
    fn tensor_map(&self) -> &TensorMap {
        self
    }

    fn tensor_from_file(&self, archive: &TensorArchive) -> Result<ArrayD<f32>, ExtractionError> {
        self.extract(archive)
    }
}

/// Boxed extractors for plain tensor maps
pub fn extractors(maps: &[TensorMap]) -> Vec<Box<dyn TensorExtractor>> {
    maps.iter()
        .map(|tm| Box::new(tm.clone()) as Box<dyn TensorExtractor>)
        .collect()
}

/// Named tensor maps loaded from a JSON file
#[derive(Debug, Clone, Default)]
pub struct TensorMapRegistry {
    maps: BTreeMap<String, TensorMap>,
}

impl TensorMapRegistry {
    pub fn from_maps(maps: Vec<TensorMap>) -> Self {
        Self {
            maps: maps.into_iter().map(|tm| (tm.name.clone(), tm)).collect(),
        }
    }

    /// Load a registry from a JSON array of tensor maps
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tensor maps from {:?}", path))?;
        let maps: Vec<TensorMap> = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse tensor maps in {:?}", path))?;
        for tm in &maps {
            tm.check_channel_map()?;
        }
        info!("Loaded {} tensor maps from {:?}", maps.len(), path);
        Ok(Self::from_maps(maps))
    }

    pub fn get(&self, name: &str) -> Option<&TensorMap> {
        self.maps.get(name)
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Look up maps by name, failing on the first unknown one
    pub fn resolve(&self, names: &[String]) -> Result<Vec<TensorMap>, RecipeError> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .cloned()
                    .ok_or_else(|| RecipeError::UnknownTensorMap(name.clone()))
            })
            .collect()
    }
}
