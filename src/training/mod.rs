//! Supernet training module
//!
//! Provides the outer training loop and everything it is parameterized over:
//! - Run configuration ([`SupernetConfig`])
//! - Collaborator traits for the trainer, batches, checkpoints and metrics
//! - Meters aggregating step statistics
//! - Checkpoint state and a JSON checkpoint store
//! - The driver state machine with ranking-based early stopping

mod checkpoint;
mod collaborators;
mod config;
mod driver;
mod meters;

pub use checkpoint::{JsonCheckpointStore, TrainingState};
pub use collaborators::{
    BatchSource, CheckpointStore, InMemoryBatches, MemoryCheckpointStore, MemorySink, MetricsSink, SinkRecord,
    SupernetTrainer, TracingSink,
};
pub use config::{SupernetConfig, TrainingMode};
pub use driver::{DriverPhase, StopReason, SupernetDriver, TrainingSummary};
pub use meters::{arch_stats, AverageMeter, MeterSet, StepStats, Stats, StopwatchMeter};
