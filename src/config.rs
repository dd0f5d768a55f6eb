//! Run configuration for contrastive training
//!
//! A single [`ContrastConfig`] is loaded once and resolved into the loss
//! engine, collector, model and data pipeline. Nothing reads configuration
//! from global state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{
    distributed::CollectorKind,
    error::{ContrastError, ContrastResult},
    nn::{layers::BackboneKind, losses::LossKind, losses::DEFAULT_TEMPERATURE_SCALE},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub variant: LossKind,
    pub temperature_scale: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            variant: LossKind::SupCon,
            temperature_scale: DEFAULT_TEMPERATURE_SCALE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    /// Global batch size, split evenly across workers
    pub batch_size: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    /// Epochs at which the learning rate is multiplied by 0.1
    pub lr_decays: Vec<usize>,
    /// Cap on steps per epoch; `None` runs the whole shard
    pub train_steps: Option<usize>,
    pub val_steps: Option<usize>,
    pub log_every: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 256,
            learning_rate: 1e-3,
            momentum: 0.9,
            weight_decay: 0.0,
            lr_decays: Vec::new(),
            train_steps: None,
            val_steps: None,
            log_every: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    pub num_workers: usize,
    pub gather_timeout_secs: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            gather_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub num_classes: usize,
    pub input_dim: usize,
    pub train_size: usize,
    pub val_size: usize,
    /// Standard deviation of each class cluster around its center
    pub cluster_std: f32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            input_dim: 32,
            train_size: 4096,
            val_size: 1024,
            cluster_std: 0.5,
        }
    }
}

/// Where examples come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DataSource {
    Synthetic(SyntheticConfig),
    /// JSON datasets written by [`InMemoryDataset::save`](crate::data::InMemoryDataset::save)
    Files { train: PathBuf, val: PathBuf },
}

impl Default for DataSource {
    fn default() -> Self {
        DataSource::Synthetic(SyntheticConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    pub jitter_std: f32,
    pub dropout: f32,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            jitter_std: 0.1,
            dropout: 0.1,
            min_scale: 0.8,
            max_scale: 1.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub source: DataSource,
    pub augment: AugmentConfig,
    pub shuffle: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            source: DataSource::default(),
            augment: AugmentConfig::default(),
            shuffle: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub backbone: BackboneKind,
    /// Output width of a random-projection backbone
    pub feature_dim: usize,
    pub projection_dim: usize,
    /// L2-normalize backbone features before the heads
    pub norm_feats: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backbone: BackboneKind::RandomProjection,
            feature_dim: 64,
            projection_dim: 128,
            norm_feats: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub out_dir: PathBuf,
    /// Resume from the checkpoint in `out_dir` instead of clearing it
    pub load: bool,
    pub checkpoint: bool,
    pub histogram_bins: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("out"),
            load: false,
            checkpoint: true,
            histogram_bins: 20,
        }
    }
}

/// Complete run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ContrastConfig {
    pub loss: LossConfig,
    pub training: TrainingConfig,
    pub distributed: DistributedConfig,
    pub data: DataConfig,
    pub model: ModelConfig,
    pub output: OutputConfig,
    pub seed: u64,
}

impl ContrastConfig {
    /// Reject configurations that cannot run
    pub fn validate(&self) -> ContrastResult<()> {
        let invalid = |msg: String| Err(ContrastError::ConfigurationError(msg));

        let scale = self.loss.temperature_scale;
        if !scale.is_finite() || scale <= 0.0 {
            return invalid(format!("temperature_scale must be positive, got {}", scale));
        }

        let training = &self.training;
        let workers = self.distributed.num_workers;
        if workers == 0 {
            return invalid("num_workers must be at least 1".to_string());
        }
        if training.batch_size == 0 || training.batch_size % workers != 0 {
            return invalid(format!(
                "batch_size {} must be a positive multiple of num_workers {}",
                training.batch_size, workers
            ));
        }
        if training.epochs == 0 {
            return invalid("epochs must be at least 1".to_string());
        }
        if !(training.learning_rate > 0.0) {
            return invalid(format!("learning_rate must be positive, got {}", training.learning_rate));
        }
        if !(0.0..1.0).contains(&training.momentum) {
            return invalid(format!("momentum must be in [0, 1), got {}", training.momentum));
        }
        if training.weight_decay < 0.0 {
            return invalid(format!("weight_decay must be non-negative, got {}", training.weight_decay));
        }
        if training.log_every == 0 {
            return invalid("log_every must be at least 1".to_string());
        }

        if let DataSource::Synthetic(synthetic) = &self.data.source {
            if synthetic.num_classes < 2 || synthetic.input_dim == 0 {
                return invalid("synthetic data needs at least 2 classes and 1 input dimension".to_string());
            }
            if synthetic.train_size < training.batch_size {
                return invalid(format!(
                    "train_size {} is smaller than one global batch of {}",
                    synthetic.train_size, training.batch_size
                ));
            }
        }

        let augment = &self.data.augment;
        if !(0.0..1.0).contains(&augment.dropout) || augment.jitter_std < 0.0 {
            return invalid("augment dropout must be in [0, 1) and jitter_std non-negative".to_string());
        }
        if augment.min_scale <= 0.0 || augment.min_scale > augment.max_scale {
            return invalid(format!(
                "augment scale range [{}, {}] is empty or non-positive",
                augment.min_scale, augment.max_scale
            ));
        }

        if self.model.projection_dim == 0 || self.model.feature_dim == 0 {
            return invalid("projection_dim and feature_dim must be positive".to_string());
        }
        if self.output.histogram_bins == 0 {
            return invalid("histogram_bins must be at least 1".to_string());
        }

        Ok(())
    }

    pub fn local_batch_size(&self) -> usize {
        self.training.batch_size / self.distributed.num_workers.max(1)
    }

    pub fn collector_kind(&self) -> CollectorKind {
        CollectorKind::for_workers(self.distributed.num_workers)
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_secs(self.distributed.gather_timeout_secs)
    }
}

/// Loads, validates and persists a [`ContrastConfig`]
#[derive(Debug, Default)]
pub struct ConfigManager {
    config: ContrastConfig,
    config_file: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn load_from_file(&mut self, path: &Path) -> ContrastResult<()> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ContrastError::ConfigurationError(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: ContrastConfig = serde_json::from_str(&content).map_err(|e| {
            ContrastError::ConfigurationError(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;

        self.config = config;
        self.config_file = Some(path.to_path_buf());
        tracing::info!("Configuration loaded from {:?}", path);
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> ContrastResult<()> {
        let content = serde_json::to_string_pretty(&self.config)?;
        std::fs::write(path, content)?;
        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn get_config(&self) -> &ContrastConfig {
        &self.config
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    /// Apply `f`, keeping the previous configuration if the result is invalid
    pub fn update_config<F>(&mut self, f: F) -> ContrastResult<()>
    where
        F: FnOnce(&mut ContrastConfig),
    {
        let mut updated = self.config.clone();
        f(&mut updated);
        updated.validate()?;
        self.config = updated;

        if let Some(path) = &self.config_file {
            self.save_to_file(path)?;
        }
        Ok(())
    }

    pub fn set_config(&mut self, config: ContrastConfig) -> ContrastResult<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn into_config(self) -> ContrastConfig {
        self.config
    }
}

/// Create a configuration builder for easy setup
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: ContrastConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loss(mut self, f: impl FnOnce(&mut LossConfig)) -> Self {
        f(&mut self.config.loss);
        self
    }

    pub fn training(mut self, f: impl FnOnce(&mut TrainingConfig)) -> Self {
        f(&mut self.config.training);
        self
    }

    pub fn distributed(mut self, f: impl FnOnce(&mut DistributedConfig)) -> Self {
        f(&mut self.config.distributed);
        self
    }

    pub fn data(mut self, f: impl FnOnce(&mut DataConfig)) -> Self {
        f(&mut self.config.data);
        self
    }

    pub fn model(mut self, f: impl FnOnce(&mut ModelConfig)) -> Self {
        f(&mut self.config.model);
        self
    }

    pub fn output(mut self, f: impl FnOnce(&mut OutputConfig)) -> Self {
        f(&mut self.config.output);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn build(self) -> ContrastResult<ContrastConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .loss(|l| l.variant = LossKind::PartialSupCon)
            .training(|t| {
                t.batch_size = 64;
                t.lr_decays = vec![3, 6];
            })
            .distributed(|d| d.num_workers = 4)
            .build()
            .unwrap();

        assert_eq!(config.loss.variant, LossKind::PartialSupCon);
        assert_eq!(config.loss.temperature_scale, 10.0);
        assert_eq!(config.local_batch_size(), 16);
        assert_eq!(config.collector_kind(), CollectorKind::Replicated { world_size: 4 });
    }

    #[test]
    fn test_uneven_batch_is_rejected() {
        let err = ConfigBuilder::new()
            .training(|t| t.batch_size = 10)
            .distributed(|d| d.num_workers = 3)
            .build()
            .unwrap_err();
        assert!(matches!(err, ContrastError::ConfigurationError(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(ConfigBuilder::new().loss(|l| l.temperature_scale = 0.0).build().is_err());
        assert!(ConfigBuilder::new().training(|t| t.momentum = 1.0).build().is_err());
        assert!(ConfigBuilder::new()
            .data(|d| d.augment.min_scale = 2.0)
            .build()
            .is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "loss": { "variant": "partial-supcon" },
            "data": { "source": { "kind": "synthetic", "num_classes": 4 } },
            "model": { "backbone": "identity" }
        }"#;
        let config: ContrastConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.loss.variant, LossKind::PartialSupCon);
        assert_eq!(config.training.momentum, 0.9);
        assert_eq!(config.model.backbone, BackboneKind::Identity);
        match &config.data.source {
            DataSource::Synthetic(s) => {
                assert_eq!(s.num_classes, 4);
                assert_eq!(s.input_dim, 32);
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_config_manager() {
        let mut manager = ConfigManager::new();
        assert_eq!(manager.get_config().training.epochs, 10);

        manager.update_config(|c| c.training.epochs = 3).unwrap();
        assert_eq!(manager.get_config().training.epochs, 3);

        // invalid updates leave the config untouched
        assert!(manager.update_config(|c| c.training.batch_size = 0).is_err());
        assert_eq!(manager.get_config().training.batch_size, 256);
    }

    #[test]
    fn test_config_file_io() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("supcon.json");

        let mut manager = ConfigManager::new();
        manager
            .set_config(ConfigBuilder::new().seed(42).build().unwrap())
            .unwrap();
        manager.save_to_file(&config_path).unwrap();

        let mut loaded = ConfigManager::new();
        loaded.load_from_file(&config_path).unwrap();
        assert_eq!(loaded.get_config(), manager.get_config());
        assert_eq!(loaded.config_file(), Some(config_path.as_path()));

        std::fs::write(&config_path, "{ not json").unwrap();
        assert!(matches!(
            loaded.load_from_file(&config_path),
            Err(ContrastError::ConfigurationError(_))
        ));
    }
}
