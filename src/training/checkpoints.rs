//! Checkpoint management for training

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ContrastError, ContrastResult},
    nn::{losses::LossKind, models::ModelWeights},
    training::optimizers::OptimizerState,
};

pub const WEIGHTS_FILE: &str = "model.bin";
pub const METADATA_FILE: &str = "checkpoint.json";
pub const METRICS_FILE: &str = "metrics.json";

/// Human-readable description of the latest checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub epochs_completed: usize,
    pub global_step: usize,
    pub learning_rate: f32,
    pub train_loss: f32,
    pub val_acc: f32,
    pub variant: LossKind,
    pub version: String,
}

/// Training checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    pub weights: ModelWeights,
    pub optimizer: OptimizerState,
}

#[derive(Serialize, Deserialize)]
struct WeightsFile {
    weights: ModelWeights,
    optimizer: OptimizerState,
}

/// Reads and writes the checkpoint files of one output directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
}

impl CheckpointManager {
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.as_ref().to_path_buf(),
        }
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.checkpoint_dir.join(file)
    }

    /// Remove everything from a previous run and recreate the directory
    pub async fn clear(&self) -> ContrastResult<()> {
        match tokio::fs::remove_dir_all(&self.checkpoint_dir).await {
            Ok(()) => {
                tracing::warn!(dir = %self.checkpoint_dir.display(), "cleared previous output directory");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.ensure_dir().await
    }

    pub async fn ensure_dir(&self) -> ContrastResult<()> {
        tokio::fs::create_dir_all(&self.checkpoint_dir).await?;
        Ok(())
    }

    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> ContrastResult<()> {
        self.ensure_dir().await?;

        let weights = bincode::serialize(&WeightsFile {
            weights: checkpoint.weights.clone(),
            optimizer: checkpoint.optimizer.clone(),
        })?;
        self.write_atomic(WEIGHTS_FILE, &weights).await?;

        let metadata = serde_json::to_vec_pretty(&checkpoint.metadata)?;
        self.write_atomic(METADATA_FILE, &metadata).await?;

        tracing::info!(
            dir = %self.checkpoint_dir.display(),
            epochs_completed = checkpoint.metadata.epochs_completed,
            "saved checkpoint"
        );
        Ok(())
    }

    /// The latest checkpoint, or `None` when the directory holds none
    pub async fn load_checkpoint(&self) -> ContrastResult<Option<Checkpoint>> {
        let metadata = match tokio::fs::read(self.path(METADATA_FILE)).await {
            Ok(bytes) => serde_json::from_slice::<CheckpointMetadata>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let bytes = tokio::fs::read(self.path(WEIGHTS_FILE)).await.map_err(|e| {
            ContrastError::SerializationError(format!(
                "checkpoint metadata present but {} unreadable: {}",
                WEIGHTS_FILE, e
            ))
        })?;
        let file: WeightsFile = bincode::deserialize(&bytes)?;

        tracing::info!(
            dir = %self.checkpoint_dir.display(),
            epochs_completed = metadata.epochs_completed,
            "loaded checkpoint"
        );
        Ok(Some(Checkpoint {
            metadata,
            weights: file.weights,
            optimizer: file.optimizer,
        }))
    }

    async fn write_atomic(&self, file: &str, bytes: &[u8]) -> ContrastResult<()> {
        let target = self.path(file);
        let tmp = self.path(&format!("{}.tmp", file));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }
}
