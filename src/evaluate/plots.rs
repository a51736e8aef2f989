//! Figure descriptions and the sinks that render them.
//!
//! Metric code only computes curves; a [`PlotSink`] decides what a figure
//! becomes on disk. [`TsvPlotSink`] writes every figure as a tab-separated
//! table of its series.

use crate::utils::ensure_dir;
use anyhow::{Context, Result};
use csv::WriterBuilder;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FigureKind {
    Roc,
    PrecisionRecall,
    Scatter,
    Calibration,
    Survival,
    History,
    LearningRate,
}

impl FigureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Roc => "roc",
            Self::PrecisionRecall => "precision_recall",
            Self::Scatter => "scatter",
            Self::Calibration => "calibration",
            Self::Survival => "survival",
            Self::History => "metric_history",
            Self::LearningRate => "lr_range_test",
        }
    }
}

/// One labelled series of a figure
#[derive(Debug, Clone, PartialEq)]
pub struct Curve {
    pub label: String,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl Curve {
    pub fn new(label: &str, x: Vec<f64>, y: Vec<f64>) -> Self {
        Self {
            label: label.to_string(),
            x,
            y,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Figure {
    pub kind: FigureKind,
    pub title: String,
    pub curves: Vec<Curve>,
}

impl Figure {
    pub fn new(kind: FigureKind, title: &str) -> Self {
        Self {
            kind,
            title: title.to_string(),
            curves: Vec::new(),
        }
    }

    pub fn with_curve(mut self, curve: Curve) -> Self {
        self.curves.push(curve);
        self
    }

    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.kind.as_str(), sanitize(&self.title))
    }
}

/// Per-sample covariate used to color an embedding plot
#[derive(Debug, Clone, PartialEq)]
pub enum LabelColumn {
    Categorical(Vec<String>),
    Continuous(Vec<f64>),
}

impl LabelColumn {
    pub fn len(&self) -> usize {
        match self {
            Self::Categorical(values) => values.len(),
            Self::Continuous(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, row: usize) -> String {
        match self {
            Self::Categorical(values) => values.get(row).cloned().unwrap_or_default(),
            Self::Continuous(values) => values.get(row).map(|v| v.to_string()).unwrap_or_default(),
        }
    }
}

/// Two-dimensional projection of hidden-layer embeddings
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingPlot {
    pub title: String,
    pub points: Vec<(f64, f64)>,
    pub labels: BTreeMap<String, LabelColumn>,
    pub alpha: f32,
}

/// Rendering collaborator for evaluation figures
pub trait PlotSink {
    fn render(&mut self, figure: &Figure, folder: &Path) -> Result<()>;

    /// Several figures rendered as one combined subplot figure
    fn render_grid(&mut self, title: &str, figures: &[Figure], folder: &Path) -> Result<()>;

    fn render_embedding(&mut self, plot: &EmbeddingPlot, folder: &Path) -> Result<()>;
}

/// Writes figures as TSV tables
#[derive(Debug, Default)]
pub struct TsvPlotSink {
    written: Vec<PathBuf>,
}

impl TsvPlotSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every file written so far
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    fn write_rows(&mut self, path: PathBuf, header: &[String], rows: Vec<Vec<String>>) -> Result<()> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let mut writer = WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(&path)
            .with_context(|| format!("Failed to create {:?}", path))?;
        writer.write_record(header)?;
        for row in rows {
            writer.write_record(&row)?;
        }
        writer.flush()?;
        info!("Saved plot data at: {:?}", path);
        self.written.push(path);
        Ok(())
    }
}

fn curve_rows(figure: &Figure, prefix: Option<&str>) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    for curve in &figure.curves {
        for (x, y) in curve.x.iter().zip(&curve.y) {
            let mut row = Vec::with_capacity(4);
            if let Some(prefix) = prefix {
                row.push(prefix.to_string());
            }
            row.push(curve.label.clone());
            row.push(x.to_string());
            row.push(y.to_string());
            rows.push(row);
        }
    }
    rows
}

impl PlotSink for TsvPlotSink {
    fn render(&mut self, figure: &Figure, folder: &Path) -> Result<()> {
        let path = folder.join(format!("{}.tsv", figure.file_stem()));
        let header = ["series", "x", "y"].map(String::from);
        self.write_rows(path, &header, curve_rows(figure, None))
    }

    fn render_grid(&mut self, title: &str, figures: &[Figure], folder: &Path) -> Result<()> {
        let path = folder.join(format!("{}_subplots.tsv", sanitize(title)));
        let header = ["figure", "series", "x", "y"].map(String::from);
        let rows = figures
            .iter()
            .flat_map(|figure| curve_rows(figure, Some(&figure.title)))
            .collect();
        self.write_rows(path, &header, rows)
    }

    fn render_embedding(&mut self, plot: &EmbeddingPlot, folder: &Path) -> Result<()> {
        let path = folder.join(format!("embedding_{}.tsv", sanitize(&plot.title)));
        let mut header = vec!["x".to_string(), "y".to_string()];
        header.extend(plot.labels.keys().cloned());
        let rows = plot
            .points
            .iter()
            .enumerate()
            .map(|(i, (x, y))| {
                let mut row = vec![x.to_string(), y.to_string()];
                row.extend(plot.labels.values().map(|column| column.cell(i)));
                row
            })
            .collect();
        self.write_rows(path, &header, rows)
    }
}

fn sanitize(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

/// Sink that keeps every figure in memory
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingPlotSink {
    pub figures: Vec<Figure>,
    pub grids: Vec<(String, Vec<Figure>)>,
    pub embeddings: Vec<EmbeddingPlot>,
}

#[cfg(test)]
impl PlotSink for RecordingPlotSink {
    fn render(&mut self, figure: &Figure, _: &Path) -> Result<()> {
        self.figures.push(figure.clone());
        Ok(())
    }

    fn render_grid(&mut self, title: &str, figures: &[Figure], _: &Path) -> Result<()> {
        self.grids.push((title.to_string(), figures.to_vec()));
        Ok(())
    }

    fn render_embedding(&mut self, plot: &EmbeddingPlot, _: &Path) -> Result<()> {
        self.embeddings.push(plot.clone());
        Ok(())
    }
}
