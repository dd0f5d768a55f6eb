//! Similarity-type histograms and embedding export
//!
//! Within each local batch the similarities between first and second views
//! fall into three types: instance (the diagonal), class (same label, off the
//! diagonal) and negative (everything else). Histograms of each type, for the
//! backbone features and for the projections, show how well the embedding
//! separates them.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    data::DataLoader,
    error::{ContrastError, ContrastResult},
    nn::models::ContrastModel,
    tensor::Tensor,
};

pub const SIMILARITY_FILE: &str = "similarity-types.json";
pub const EMBEDDINGS_FILE: &str = "embeddings.json";

/// Summary statistics of a value series
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramStats {
    pub count: usize,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
}

impl HistogramStats {
    pub fn from_values(values: &[f32]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        Self {
            count: values.len(),
            min: values.iter().copied().fold(f32::INFINITY, f32::min),
            max: values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            mean: values.iter().sum::<f32>() / values.len() as f32,
        }
    }
}

/// Fixed-range histogram whose bin weights sum to 1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// `bins + 1` bin boundaries
    pub edges: Vec<f32>,
    pub weights: Vec<f32>,
    pub stats: HistogramStats,
}

impl Histogram {
    /// Each value weighs `1 / values.len()`. The last bin is closed on the right.
    pub fn normalized(values: &[f32], bins: usize, range: (f32, f32)) -> ContrastResult<Self> {
        let (low, high) = range;
        if bins == 0 || !low.is_finite() || !high.is_finite() || low > high {
            return Err(ContrastError::InvalidInput(format!(
                "histogram needs bins > 0 and a finite range, got {} bins over [{}, {}]",
                bins, low, high
            )));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(ContrastError::numerical("histogram", &format!("non-finite similarity {}", bad)));
        }

        let width = (high - low) / bins as f32;
        let edges = (0..=bins).map(|b| low + width * b as f32).collect();
        let mut weights = vec![0.0f32; bins];
        if !values.is_empty() {
            let unit = 1.0 / values.len() as f32;
            for &v in values {
                let bin = if width > 0.0 {
                    (((v - low) / width) as usize).min(bins - 1)
                } else {
                    0
                };
                weights[bin] += unit;
            }
        }

        Ok(Self {
            edges,
            weights,
            stats: HistogramStats::from_values(values),
        })
    }
}

/// Similarities of one space, split by type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimilarityTypes {
    pub negative: Vec<f32>,
    pub class: Vec<f32>,
    pub instance: Vec<f32>,
}

impl SimilarityTypes {
    /// Split a local `[N, N]` first-view by second-view similarity matrix
    pub fn collect(&mut self, similarities: &Tensor<2>, labels: &[i64]) -> ContrastResult<()> {
        let n = labels.len();
        if similarities.rows() != n || similarities.cols() != n {
            return Err(ContrastError::shape_mismatch(
                "local similarities",
                &format!("[{}, {}]", n, n),
                &similarities.shape().to_string(),
            ));
        }

        for (i, row) in similarities.row_iter().enumerate() {
            for (j, &s) in row.iter().enumerate() {
                if i == j {
                    self.instance.push(s);
                } else if labels[i] == labels[j] {
                    self.class.push(s);
                } else {
                    self.negative.push(s);
                }
            }
        }
        Ok(())
    }

    /// Common range of all three types; `(-1, 1)` when nothing was collected
    pub fn range(&self) -> (f32, f32) {
        let all = self.negative.iter().chain(&self.class).chain(&self.instance);
        let (min, max) = all.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if min > max {
            (-1.0, 1.0)
        } else {
            (min, max)
        }
    }

    pub fn histograms(&self, bins: usize) -> ContrastResult<TypeHistograms> {
        let range = self.range();
        Ok(TypeHistograms {
            negative: Histogram::normalized(&self.negative, bins, range)?,
            class: Histogram::normalized(&self.class, bins, range)?,
            instance: Histogram::normalized(&self.instance, bins, range)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeHistograms {
    pub negative: Histogram,
    pub class: Histogram,
    pub instance: Histogram,
}

/// Contents of `similarity-types.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityReport {
    pub features: TypeHistograms,
    pub projections: TypeHistograms,
}

/// Contents of `embeddings.json`, for external t-SNE or plotting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingExport {
    pub labels: Vec<i64>,
    pub features: Vec<Vec<f32>>,
    pub projections: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    pub similarities: SimilarityReport,
    pub embeddings: EmbeddingExport,
}

impl Diagnostics {
    /// Evaluate `model` on every rank's shard of `loader`, one local batch at a time
    pub fn collect(
        model: &ContrastModel,
        loader: &DataLoader,
        world_size: usize,
        bins: usize,
    ) -> ContrastResult<Self> {
        let mut feature_types = SimilarityTypes::default();
        let mut projection_types = SimilarityTypes::default();
        let mut embeddings = EmbeddingExport::default();

        for rank in 0..world_size {
            for batch in loader.shard(0, rank, world_size)? {
                let batch = batch?;
                let features = model.features(&batch.view1)?;
                let key_features = model.features(&batch.view2)?;
                let projections = model.project(&features)?.normalized;
                let key_projections = model.project(&key_features)?.normalized;

                feature_types.collect(&features.matmul_transposed(&key_features)?, &batch.labels)?;
                projection_types
                    .collect(&projections.matmul_transposed(&key_projections)?, &batch.labels)?;

                embeddings.labels.extend_from_slice(&batch.labels);
                embeddings.features.extend(features.row_iter().map(<[f32]>::to_vec));
                embeddings.projections.extend(projections.row_iter().map(<[f32]>::to_vec));
            }
        }

        tracing::debug!(
            examples = embeddings.labels.len(),
            negative = projection_types.negative.len(),
            class = projection_types.class.len(),
            "collected similarity types"
        );

        Ok(Self {
            similarities: SimilarityReport {
                features: feature_types.histograms(bins)?,
                projections: projection_types.histograms(bins)?,
            },
            embeddings,
        })
    }

    pub async fn save(&self, dir: &Path) -> ContrastResult<()> {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(SIMILARITY_FILE), serde_json::to_vec_pretty(&self.similarities)?).await?;
        tokio::fs::write(dir.join(EMBEDDINGS_FILE), serde_json::to_vec(&self.embeddings)?).await?;
        tracing::info!(dir = %dir.display(), "wrote diagnostics");
        Ok(())
    }
}
