use crate::data::TensorDict;
use crate::evaluate::plots::{EmbeddingPlot, LabelColumn, PlotSink};
use crate::model::Model;
use crate::tensor_map::{Interpretation, TensorMap};
use anyhow::Result;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Covariates for coloring an embedding plot.
///
/// Categorical maps with one axis contribute the name of their most likely
/// channel, continuous maps of shape `[1]` their rescaled value. Other maps
/// are skipped.
pub fn test_labels_to_label_map(labels: &TensorDict, maps: &[TensorMap]) -> BTreeMap<String, LabelColumn> {
    let mut label_map = BTreeMap::new();
    for tm in maps {
        let tensor = match labels.get(&tm.output_name()) {
            Some(tensor) => tensor,
            None => continue,
        };
        match tm.interpretation {
            Interpretation::Categorical if tm.axes() == 1 => {
                let names = tensor
                    .outer_iter()
                    .map(|row| {
                        let best = row
                            .iter()
                            .enumerate()
                            .filter(|(_, v)| v.is_finite())
                            .max_by(|a, b| a.1.total_cmp(b.1))
                            .map(|(i, _)| i);
                        match best {
                            Some(i) => tm
                                .channel_map
                                .name_of(i)
                                .map(str::to_string)
                                .unwrap_or_else(|| i.to_string()),
                            None => "NA".to_string(),
                        }
                    })
                    .collect();
                label_map.insert(tm.name.clone(), LabelColumn::Categorical(names));
            }
            Interpretation::Continuous if tm.shape == [1] => {
                let values = tensor
                    .iter()
                    .map(|&v| {
                        if v.is_finite() && !tm.is_sentinel(v) {
                            tm.rescale_value(v) as f64
                        } else {
                            f64::NAN
                        }
                    })
                    .collect();
                label_map.insert(tm.name.clone(), LabelColumn::Continuous(values));
            }
            _ => {}
        }
    }
    label_map
}

/// Project rows onto their first two principal components
pub fn project_2d(embeddings: &Array2<f32>) -> Vec<(f64, f64)> {
    let (rows, cols) = embeddings.dim();
    if rows == 0 {
        return Vec::new();
    }
    let data = DMatrix::<f64>::from_fn(rows, cols, |i, j| {
        let v = embeddings[[i, j]];
        if v.is_finite() {
            v as f64
        } else {
            0.0
        }
    });
    let mean = data.row_mean();
    let centered = DMatrix::<f64>::from_fn(rows, cols, |i, j| data[(i, j)] - mean[j]);
    let covariance = centered.transpose() * &centered / (rows.max(2) - 1) as f64;

    let eigen = SymmetricEigen::new(covariance);
    let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let projected: Vec<DVector<f64>> = order
        .into_iter()
        .take(2)
        .map(|i| &centered * eigen.eigenvectors.column(i))
        .collect();

    (0..rows)
        .map(|i| {
            let x = projected.first().map_or(0.0, |p| p[i]);
            let y = projected.get(1).map_or(0.0, |p| p[i]);
            (x, y)
        })
        .collect()
}

/// Plot hidden-layer embeddings colored by every usable covariate.
///
/// Warns and returns without plotting when the model lacks `hidden_layer` or
/// when no categorical or continuous covariate is available.
#[allow(clippy::too_many_arguments)]
pub fn tsne_wrapper(
    model: &dyn Model,
    hidden_layer: &str,
    alpha: f32,
    plot_folder: &Path,
    test_labels: &TensorDict,
    label_maps: &[TensorMap],
    test_data: &TensorDict,
    embeddings: Option<Array2<f32>>,
    sink: &mut dyn PlotSink,
) -> Result<()> {
    if !model.has_layer(hidden_layer) {
        warn!(
            "Can't compute t-SNE, layer: {} not in model: {}",
            hidden_layer,
            model.name()
        );
        return Ok(());
    }

    let embeddings = match embeddings {
        Some(embeddings) => embeddings,
        None => model.hidden(hidden_layer, test_data)?,
    };

    let labels = test_labels_to_label_map(test_labels, label_maps);
    if labels.is_empty() {
        warn!("No categorical or continuous covariates to color the embedding plot");
        return Ok(());
    }

    info!(
        "Plotting {} embeddings from layer {} with {} covariates",
        embeddings.nrows(),
        hidden_layer,
        labels.len()
    );
    let plot = EmbeddingPlot {
        title: format!("{}_{}", model.name(), hidden_layer),
        points: project_2d(&embeddings),
        labels,
        alpha,
    };
    sink.render_embedding(&plot, plot_folder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::plots::RecordingPlotSink;
    use crate::tensor_map::{ChannelMap, Normalization};
    use ndarray::{arr2, ArrayD, IxDyn};

    struct FixedModel {
        layers: Vec<String>,
    }

    impl Model for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }

        fn input_maps(&self) -> &[TensorMap] {
            &[]
        }

        fn output_maps(&self) -> &[TensorMap] {
            &[]
        }

        fn layer_names(&self) -> Vec<String> {
            self.layers.clone()
        }

        fn predict(&self, _: &TensorDict) -> Result<TensorDict> {
            Ok(TensorDict::new())
        }

        fn hidden(&self, _: &str, _: &TensorDict) -> Result<Array2<f32>> {
            Ok(arr2(&[[0.0, 1.0], [1.0, 0.0], [2.0, 2.0]]))
        }
    }

    fn sex_map() -> TensorMap {
        TensorMap::new("sex", &[2], Interpretation::Categorical)
            .with_channel_map(ChannelMap::new([("female", 0), ("male", 1)]))
    }

    fn labels() -> TensorDict {
        let mut labels = TensorDict::new();
        labels.insert(
            "output_sex_categorical".to_string(),
            ArrayD::from_shape_vec(IxDyn(&[3, 2]), vec![1.0, 0.0, 0.0, 1.0, f32::NAN, f32::NAN]).unwrap(),
        );
        labels.insert(
            "output_age_continuous".to_string(),
            ArrayD::from_shape_vec(IxDyn(&[3, 1]), vec![0.0, 1.0, -1.0]).unwrap(),
        );
        labels
    }

    #[test]
    fn test_label_map() {
        let age = TensorMap::new("age", &[1], Interpretation::Continuous)
            .with_normalization(Normalization::Standardize { mean: 50.0, std: 10.0 });
        let map = test_labels_to_label_map(&labels(), &[sex_map(), age]);

        assert_eq!(
            map["sex"],
            LabelColumn::Categorical(vec!["female".into(), "male".into(), "NA".into()])
        );
        assert_eq!(map["age"], LabelColumn::Continuous(vec![50.0, 60.0, 40.0]));
    }

    #[test]
    fn test_project_2d_keeps_rows() {
        let points = project_2d(&arr2(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 1.0, 1.0]]));
        assert_eq!(points.len(), 4);
        assert!(points.iter().all(|(x, y)| x.is_finite() && y.is_finite()));
    }

    #[test]
    fn test_project_2d_first_axis_has_most_variance() {
        let points = project_2d(&arr2(&[[-2.0, 0.0], [-1.0, 0.1], [1.0, -0.1], [2.0, 0.0]]));
        assert!(points[0].0.abs() > 1.9);
        assert!(points[3].0.abs() > 1.9);
        assert!(points.iter().all(|(_, y)| y.abs() < 0.2));
        assert!(points[0].0 * points[3].0 < 0.0);
    }

    #[test]
    fn test_missing_layer_skips_plot() {
        let model = FixedModel { layers: vec!["embed".into()] };
        let mut sink = RecordingPlotSink::default();
        tsne_wrapper(&model, "dense_3", 0.5, Path::new("."), &labels(), &[sex_map()], &TensorDict::new(), None, &mut sink)
            .unwrap();
        assert!(sink.embeddings.is_empty());
    }

    #[test]
    fn test_no_covariates_skips_plot() {
        let model = FixedModel { layers: vec!["embed".into()] };
        let mut sink = RecordingPlotSink::default();
        tsne_wrapper(&model, "embed", 0.5, Path::new("."), &TensorDict::new(), &[sex_map()], &TensorDict::new(), None, &mut sink)
            .unwrap();
        assert!(sink.embeddings.is_empty());
    }

    #[test]
    fn test_embedding_plot_is_rendered() {
        let model = FixedModel { layers: vec!["embed".into()] };
        let mut sink = RecordingPlotSink::default();
        tsne_wrapper(&model, "embed", 0.5, Path::new("."), &labels(), &[sex_map()], &TensorDict::new(), None, &mut sink)
            .unwrap();
        assert_eq!(sink.embeddings.len(), 1);
        assert_eq!(sink.embeddings[0].points.len(), 3);
        assert_eq!(sink.embeddings[0].title, "fixed_embed");
    }
}
