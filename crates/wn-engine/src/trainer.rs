//! The trainer collaborator: turns a configuration into metrics.

use async_trait::async_trait;
use wn_optimizer::InputShape;
use wn_types::{ArchConfig, Metrics};

/// Errors surfaced by a trainer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrainerError {
    /// The model could not be built or trained within its resources. The
    /// controller logs the config and samples another one.
    #[error("configuration is unbuildable: {0}")]
    Unbuildable(String),
    /// Anything else. The run stops and can be resumed later.
    #[error("trainer failed: {0}")]
    Fatal(String),
}

/// Result alias for trainer calls.
pub type TrainerResult<T> = Result<T, TrainerError>;

/// Trains and evaluates one configuration.
///
/// Calls are made one at a time and awaited to completion. Any parallelism
/// across devices is the implementation's own business.
#[async_trait]
pub trait Trainer: Send + Sync {
    async fn train(&self, config: &ArchConfig, input: &InputShape) -> TrainerResult<Metrics>;

    fn name(&self) -> &str;
}

#[async_trait]
impl<T: Trainer + ?Sized> Trainer for std::sync::Arc<T> {
    async fn train(&self, config: &ArchConfig, input: &InputShape) -> TrainerResult<Metrics> {
        (**self).train(config, input).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
