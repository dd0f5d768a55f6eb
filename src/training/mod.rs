//! Training infrastructure
//!
//! - Data-parallel trainer with mirrored replicas
//! - SGD with momentum and weight decay
//! - Step-decay learning rate schedule
//! - Per-step metrics and history
//! - Checkpointing and resumption

pub mod checkpoints;
pub mod metrics;
pub mod optimizers;
pub mod schedulers;
pub mod trainer;

pub use checkpoints::{Checkpoint, CheckpointManager, CheckpointMetadata};
pub use metrics::{EpochSummary, MetricTracker, MetricsHistory, TrainingMetrics};
pub use optimizers::{Optimizer, OptimizerState, SGDOptimizer};
pub use schedulers::{LRScheduler, StepDecayScheduler};
pub use trainer::{load_datasets, EvalReport, StepOutcome, Trainer, TrainingState};
