//! supcon - supervised contrastive training in Rust
//!
//! Features:
//! - Relation masks over a global batch gathered from data-parallel replicas
//! - SimCLR, SupCon and partial-SupCon losses with analytic gradients
//! - Mirrored replicas synchronized through in-process collectives
//! - Projection head and linear classifier trained with momentum SGD
//! - Checkpointing, metrics history and similarity diagnostics

pub mod config;
pub mod contrastive;
pub mod data;
pub mod diagnostics;
pub mod distributed;
pub mod error;
pub mod nn;
pub mod tensor;
pub mod training;

use tracing_subscriber::EnvFilter;

pub use config::{ConfigBuilder, ConfigManager, ContrastConfig};
pub use contrastive::{PairIndex, Relation, RelationTensor, SimilarityMatrix};
pub use distributed::{CollectorKind, GlobalCollector, IdentityCollector, ReplicaGroup};
pub use error::{ContrastError, ContrastResult};
pub use nn::losses::{compute_average_loss, ContrastiveEngine, LossKind};
pub use training::Trainer;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise the level is `info`, or `debug`
/// when `verbose` is set.
pub fn init(verbose: bool) -> ContrastResult<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| ContrastError::ConfigurationError(format!("failed to install logger: {}", e)))?;
    tracing::debug!(version = VERSION, "supcon initialized");
    Ok(())
}

/// Get the current crate version
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_once() {
        assert!(init(false).is_ok());
        assert!(init(true).is_err());
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
