//! Per-sample tensor container.
//!
//! A sample file holds named `f32` datasets. Each dataset is its own gzip
//! member: a JSON header line (`name`, `shape`) followed by the little-endian
//! values. Members can be appended to an existing file without rewriting it,
//! which is how side-channel predictions accumulate per sample.

use anyhow::{bail, Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
struct DatasetHeader {
    name: String,
    shape: Vec<usize>,
}

/// Named tensors stored for one sample
#[derive(Debug, Clone, Default)]
pub struct TensorArchive {
    datasets: BTreeMap<String, ArrayD<f32>>,
}

impl TensorArchive {
    pub fn from_datasets(datasets: BTreeMap<String, ArrayD<f32>>) -> Self {
        Self { datasets }
    }

    /// Read every dataset in a sample file
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path.as_ref())?;
        if file.metadata()?.len() == 0 {
            return Ok(Self::default());
        }
        Self::read_from(BufReader::new(file))
    }

    /// Read datasets from a stream of gzip members
    pub fn read_from<R: Read>(reader: R) -> io::Result<Self> {
        let mut decoder = BufReader::new(MultiGzDecoder::new(reader));
        let mut datasets = BTreeMap::new();
        let mut line = String::new();

        loop {
            line.clear();
            if decoder.read_line(&mut line)? == 0 {
                break;
            }
            let header: DatasetHeader = serde_json::from_str(line.trim_end())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            let count: usize = header.shape.iter().product();
            let mut bytes = vec![0u8; count * 4];
            decoder.read_exact(&mut bytes)?;
            let values: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();

            let tensor = ArrayD::from_shape_vec(IxDyn(&header.shape), values)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            datasets.insert(header.name, tensor);
        }

        Ok(Self { datasets })
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.datasets.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.datasets.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Write a new sample file, replacing any existing one
    pub fn write<P: AsRef<Path>>(path: P, datasets: &BTreeMap<String, ArrayD<f32>>) -> Result<()> {
        let path = path.as_ref();
        let mut file = File::create(path)
            .with_context(|| format!("Failed to create tensor file {:?}", path))?;
        for (name, tensor) in datasets {
            write_member(&mut file, name, tensor)
                .with_context(|| format!("Failed to write {} to {:?}", name, path))?;
        }
        Ok(())
    }

    /// Append one gzip-compressed dataset; fails if the name already exists
    pub fn append_dataset<P: AsRef<Path>>(path: P, name: &str, tensor: &ArrayD<f32>) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            let existing = TensorArchive::open(path)
                .with_context(|| format!("Failed to read tensor file {:?}", path))?;
            if existing.contains(name) {
                bail!("Dataset {} already exists in {:?}", name, path);
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open tensor file {:?}", path))?;
        write_member(&mut file, name, tensor)
            .with_context(|| format!("Failed to append {} to {:?}", name, path))
    }
}

fn write_member<W: Write>(writer: W, name: &str, tensor: &ArrayD<f32>) -> Result<()> {
    let header = DatasetHeader {
        name: name.to_string(),
        shape: tensor.shape().to_vec(),
    };
    let mut encoder = GzEncoder::new(writer, Compression::default());
    serde_json::to_writer(&mut encoder, &header)?;
    encoder.write_all(b"\n")?;
    for value in tensor.iter() {
        encoder.write_all(&value.to_le_bytes())?;
    }
    encoder.finish()?;
    Ok(())
}
