//! Datasets, view augmentation and sharded batching

use std::{
    path::Path,
    sync::Arc,
};

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::{
    config::{AugmentConfig, SyntheticConfig},
    error::{ContrastError, ContrastResult},
    tensor::{Shape, Tensor},
};

/// Base trait for all datasets
pub trait Dataset: Send + Sync {
    /// Get the length of the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Width of every input vector
    fn input_dim(&self) -> usize;

    fn num_classes(&self) -> usize;

    /// Get an item at the specified index
    fn get(&self, index: usize) -> ContrastResult<DataItem>;
}

/// One example: an input vector and its class label
#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    pub input: Vec<f32>,
    pub label: i64,
}

/// In-memory dataset, loadable from and savable to JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InMemoryDataset {
    input_dim: usize,
    num_classes: usize,
    inputs: Vec<Vec<f32>>,
    labels: Vec<i64>,
}

impl InMemoryDataset {
    pub fn new(inputs: Vec<Vec<f32>>, labels: Vec<i64>, num_classes: usize) -> ContrastResult<Self> {
        let dataset = Self {
            input_dim: inputs.first().map(Vec::len).unwrap_or(0),
            num_classes,
            inputs,
            labels,
        };
        dataset.validate()?;
        Ok(dataset)
    }

    fn validate(&self) -> ContrastResult<()> {
        if self.inputs.len() != self.labels.len() {
            return Err(ContrastError::shape_mismatch(
                "dataset labels",
                &self.inputs.len().to_string(),
                &self.labels.len().to_string(),
            ));
        }
        if let Some(i) = self.inputs.iter().position(|x| x.len() != self.input_dim) {
            return Err(ContrastError::shape_mismatch(
                &format!("dataset input {}", i),
                &self.input_dim.to_string(),
                &self.inputs[i].len().to_string(),
            ));
        }
        if let Some(label) = self.labels.iter().find(|&&l| l < 0 || l as usize >= self.num_classes) {
            return Err(ContrastError::InvalidInput(format!(
                "label {} outside {} classes",
                label, self.num_classes
            )));
        }
        if self.inputs.iter().flatten().any(|v| !v.is_finite()) {
            return Err(ContrastError::InvalidInput("dataset contains non-finite inputs".to_string()));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> ContrastResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let dataset: Self = serde_json::from_str(&content)?;
        dataset.validate()?;
        tracing::info!(
            examples = dataset.len(),
            classes = dataset.num_classes,
            "Loaded dataset from {:?}",
            path
        );
        Ok(dataset)
    }

    pub fn save(&self, path: &Path) -> ContrastResult<()> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn labels(&self) -> &[i64] {
        &self.labels
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.inputs.len()
    }

    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn get(&self, index: usize) -> ContrastResult<DataItem> {
        match (self.inputs.get(index), self.labels.get(index)) {
            (Some(input), Some(&label)) => Ok(DataItem { input: input.clone(), label }),
            _ => Err(ContrastError::InvalidInput(format!(
                "index {} out of bounds for {} examples",
                index,
                self.len()
            ))),
        }
    }
}

/// Class-clustered Gaussian features: one random unit center per class
pub struct SyntheticClusters {
    centers: Vec<Vec<f32>>,
    cluster_std: f32,
}

impl SyntheticClusters {
    pub fn new<R: Rng + ?Sized>(config: &SyntheticConfig, rng: &mut R) -> Self {
        let centers = (0..config.num_classes)
            .map(|_| {
                let raw: Vec<f32> = (0..config.input_dim).map(|_| StandardNormal.sample(rng)).collect();
                let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt().max(f32::EPSILON);
                raw.into_iter().map(|v| v / norm).collect()
            })
            .collect();
        Self { centers, cluster_std: config.cluster_std }
    }

    pub fn num_classes(&self) -> usize {
        self.centers.len()
    }

    /// Draw `size` examples with labels cycling through the classes
    pub fn sample<R: Rng + ?Sized>(&self, size: usize, rng: &mut R) -> ContrastResult<InMemoryDataset> {
        let classes = self.centers.len().max(1);
        let mut inputs = Vec::with_capacity(size);
        let mut labels = Vec::with_capacity(size);
        for i in 0..size {
            let label = i % classes;
            inputs.push(
                self.centers[label]
                    .iter()
                    .map(|c| {
                        let noise: f32 = StandardNormal.sample(rng);
                        c + self.cluster_std * noise
                    })
                    .collect(),
            );
            labels.push(label as i64);
        }
        InMemoryDataset::new(inputs, labels, self.centers.len())
    }

    /// Train and validation splits sharing the same class centers
    pub fn generate(config: &SyntheticConfig, seed: u64) -> ContrastResult<(InMemoryDataset, InMemoryDataset)> {
        let mut rng = StdRng::seed_from_u64(seed);
        let clusters = Self::new(config, &mut rng);
        let train = clusters.sample(config.train_size, &mut rng)?;
        let val = clusters.sample(config.val_size, &mut rng)?;
        Ok((train, val))
    }
}

/// Random feature-space augmentation: scaling, dropout and Gaussian jitter
#[derive(Debug, Clone, PartialEq)]
pub struct Augment {
    jitter_std: f32,
    dropout: f32,
    min_scale: f32,
    max_scale: f32,
}

impl Augment {
    pub fn new(config: &AugmentConfig) -> Self {
        Self {
            jitter_std: config.jitter_std,
            dropout: config.dropout,
            min_scale: config.min_scale,
            max_scale: config.max_scale.max(config.min_scale),
        }
    }

    pub fn apply<R: Rng + ?Sized>(&self, input: &[f32], rng: &mut R) -> Vec<f32> {
        let scale = if self.max_scale > self.min_scale {
            rng.gen_range(self.min_scale..self.max_scale)
        } else {
            self.min_scale
        };
        input
            .iter()
            .map(|&v| {
                if self.dropout > 0.0 && rng.gen::<f32>() < self.dropout {
                    0.0
                } else {
                    let noise: f32 = StandardNormal.sample(rng);
                    v * scale + self.jitter_std * noise
                }
            })
            .collect()
    }
}

/// How the two views of an example are produced
#[derive(Debug, Clone, PartialEq)]
pub enum ViewMode {
    /// Two independent augmentations
    Augmented(Augment),
    /// Both views are the unmodified input
    Dual,
}

/// A local batch of view pairs
#[derive(Debug, Clone)]
pub struct Batch {
    pub view1: Tensor<2>,
    pub view2: Tensor<2>,
    pub labels: Vec<i64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Deterministic, sharded batch loader.
///
/// Every rank iterates the same global batch order; rank `r` of `w` takes
/// rows `r*B/w .. (r+1)*B/w` of each global batch of `B`. Incomplete global
/// batches are dropped so every replica always sees the same local size.
#[derive(Clone)]
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    shuffle: bool,
    views: ViewMode,
    seed: u64,
}

impl DataLoader {
    pub fn new(dataset: Arc<dyn Dataset>, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size,
            shuffle: false,
            views: ViewMode::Dual,
            seed: 0,
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_views(mut self, views: ViewMode) -> Self {
        self.views = views;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    /// Global batch size
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of complete global batches
    pub fn num_batches(&self) -> usize {
        if self.batch_size == 0 {
            0
        } else {
            self.dataset.len() / self.batch_size
        }
    }

    /// This rank's shard of every global batch of `epoch`
    pub fn shard(&self, epoch: usize, rank: usize, world_size: usize) -> ContrastResult<ShardIter<'_>> {
        if world_size == 0 || rank >= world_size {
            return Err(ContrastError::DistributedError(format!(
                "rank {} outside world of {}",
                rank, world_size
            )));
        }
        if self.batch_size == 0 || self.batch_size % world_size != 0 {
            return Err(ContrastError::ConfigurationError(format!(
                "global batch {} does not split evenly across {} workers",
                self.batch_size, world_size
            )));
        }

        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(stream_seed(self.seed, epoch, 0)));
        }

        Ok(ShardIter {
            loader: self,
            order,
            local_batch: self.batch_size / world_size,
            rank,
            next_batch: 0,
            num_batches: self.num_batches(),
            rng: StdRng::seed_from_u64(stream_seed(self.seed, epoch, rank + 1)),
        })
    }

    /// Single-worker iteration over full batches
    pub fn epoch(&self, epoch: usize) -> ContrastResult<ShardIter<'_>> {
        self.shard(epoch, 0, 1)
    }

    /// Examples after the last complete global batch of `epoch`, as one batch
    pub fn remainder(&self, epoch: usize) -> ContrastResult<Option<Batch>> {
        let mut iter = self.epoch(epoch)?;
        let start = iter.num_batches * self.batch_size;
        if start >= iter.order.len() {
            return Ok(None);
        }
        let indices = iter.order[start..].to_vec();
        iter.build(&indices).map(Some)
    }
}

fn stream_seed(seed: u64, epoch: usize, stream: usize) -> u64 {
    seed ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (stream as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
}

pub struct ShardIter<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    local_batch: usize,
    rank: usize,
    next_batch: usize,
    num_batches: usize,
    rng: StdRng,
}

impl ShardIter<'_> {
    fn build(&mut self, indices: &[usize]) -> ContrastResult<Batch> {
        let dim = self.loader.dataset.input_dim();
        let mut view1 = Vec::with_capacity(indices.len() * dim);
        let mut view2 = Vec::with_capacity(indices.len() * dim);
        let mut labels = Vec::with_capacity(indices.len());

        for &index in indices {
            let item = self.loader.dataset.get(index)?;
            match &self.loader.views {
                ViewMode::Augmented(augment) => {
                    view1.extend(augment.apply(&item.input, &mut self.rng));
                    view2.extend(augment.apply(&item.input, &mut self.rng));
                }
                ViewMode::Dual => {
                    view1.extend_from_slice(&item.input);
                    view2.extend_from_slice(&item.input);
                }
            }
            labels.push(item.label);
        }

        let shape = Shape::new([indices.len(), dim]);
        Ok(Batch {
            view1: Tensor::from_vec(view1, shape)?,
            view2: Tensor::from_vec(view2, shape)?,
            labels,
        })
    }
}

impl Iterator for ShardIter<'_> {
    type Item = ContrastResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_batch >= self.num_batches {
            return None;
        }
        let start = self.next_batch * self.loader.batch_size + self.rank * self.local_batch;
        self.next_batch += 1;

        let indices = self.order[start..start + self.local_batch].to_vec();
        Some(self.build(&indices))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.num_batches - self.next_batch;
        (remaining, Some(remaining))
    }
}
