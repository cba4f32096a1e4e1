//! Collaborator seams of the training driver
//!
//! The driver never touches tensors or data itself. It talks to:
//! - a [`SupernetTrainer`] that owns the model, the optimizer and the lr schedule
//! - a [`BatchSource`] that yields training and validation batches
//! - a [`CheckpointStore`] that persists driver state
//! - a [`MetricsSink`] that receives logged statistics

use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::{debug, info};

use super::checkpoint::TrainingState;
use super::meters::{StepStats, Stats};
use crate::elastic::ElasticModel;
use crate::error::{KolosalError, Result};
use crate::nas::ArchitectureConfig;

/// Owns the supernet and performs gradient updates
pub trait SupernetTrainer {
    type Batch;

    /// The elastic model being trained
    fn model_mut(&mut self) -> &mut dyn ElasticModel;

    /// Activate an architecture on every elastic layer
    fn set_sample_config(&mut self, config: &ArchitectureConfig) -> Result<()> {
        self.model_mut().set_sample_config(config)
    }

    /// One update over a group of batches.
    ///
    /// Returns `None` when the update was skipped (for instance an overflowing
    /// gradient); a skipped update must not advance `num_updates`.
    fn train_step(&mut self, batches: &[Self::Batch], configs: &[ArchitectureConfig]) -> Result<Option<StepStats>>;

    /// Loss of one validation batch under the active architecture
    fn valid_step(&mut self, batch: &Self::Batch) -> Result<StepStats>;

    fn num_updates(&self) -> u64;

    fn lr(&self) -> f64;

    /// Advance the schedule at the end of an epoch and return the new lr
    fn lr_step(&mut self, epoch: usize, val_loss: Option<f64>) -> Result<f64>;

    /// Opaque trainer state (weights, optimizer, counters) stored in checkpoints
    fn state(&self) -> Result<serde_json::Value>;

    fn load_state(&mut self, state: serde_json::Value) -> Result<()>;
}

/// Produces batches for an epoch or a validation subset
pub trait BatchSource {
    type Batch;
    type TrainIter: Iterator<Item = Self::Batch>;
    type ValidIter: Iterator<Item = Self::Batch>;

    /// Batches of a 1-based epoch
    fn train_iter(&mut self, epoch: usize) -> Result<Self::TrainIter>;

    fn valid_iter(&mut self, subset: &str) -> Result<Self::ValidIter>;
}

/// Fixed in-memory batches, replayed every epoch
#[derive(Debug, Clone, Default)]
pub struct InMemoryBatches<B> {
    train: Vec<B>,
    valid: BTreeMap<String, Vec<B>>,
}

impl<B: Clone> InMemoryBatches<B> {
    pub fn new(train: Vec<B>) -> Self {
        Self {
            train,
            valid: BTreeMap::new(),
        }
    }

    pub fn with_valid(mut self, subset: impl Into<String>, batches: Vec<B>) -> Self {
        self.valid.insert(subset.into(), batches);
        self
    }
}

impl<B: Clone> BatchSource for InMemoryBatches<B> {
    type Batch = B;
    type TrainIter = std::vec::IntoIter<B>;
    type ValidIter = std::vec::IntoIter<B>;

    fn train_iter(&mut self, _epoch: usize) -> Result<Self::TrainIter> {
        Ok(self.train.clone().into_iter())
    }

    fn valid_iter(&mut self, subset: &str) -> Result<Self::ValidIter> {
        self.valid
            .get(subset)
            .map(|batches| batches.clone().into_iter())
            .ok_or_else(|| KolosalError::ValidationError(format!("unknown validation subset '{}'", subset)))
    }
}

/// Persists driver state between runs
pub trait CheckpointStore {
    fn save(&mut self, state: &TrainingState) -> Result<()>;

    /// Most recent state, or `None` for a fresh run
    fn load(&mut self) -> Result<Option<TrainingState>>;
}

/// Keeps every saved state in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    saved: Vec<TrainingState>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing state, as if it had been saved earlier
    pub fn with_state(state: TrainingState) -> Self {
        Self { saved: vec![state] }
    }

    pub fn saved(&self) -> &[TrainingState] {
        &self.saved
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&mut self, state: &TrainingState) -> Result<()> {
        self.saved.push(state.clone());
        Ok(())
    }

    fn load(&mut self) -> Result<Option<TrainingState>> {
        Ok(self.saved.last().cloned())
    }
}

/// Receives training and validation statistics
pub trait MetricsSink {
    /// Per-step statistics
    fn log(&mut self, tag: &str, step: u64, stats: &Stats);

    /// End-of-epoch or end-of-validation summary
    fn print(&mut self, tag: &str, step: u64, stats: &Stats);
}

fn format_stats(stats: &Stats) -> String {
    let mut out = String::new();
    for (i, (name, value)) in stats.iter().enumerate() {
        if i > 0 {
            out.push_str(" | ");
        }
        let _ = write!(out, "{} {:.3}", name, value);
    }
    out
}

/// Forwards statistics to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn log(&mut self, tag: &str, step: u64, stats: &Stats) {
        debug!(tag, step, "{}", format_stats(stats));
    }

    fn print(&mut self, tag: &str, step: u64, stats: &Stats) {
        info!(tag, step, "{}", format_stats(stats));
    }
}

/// One recorded sink call
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRecord {
    pub tag: String,
    pub step: u64,
    pub stats: Stats,
}

/// Records every call for later inspection
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub logged: Vec<SinkRecord>,
    pub printed: Vec<SinkRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Printed records with the given tag
    pub fn printed_with_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a SinkRecord> + 'a {
        self.printed.iter().filter(move |r| r.tag == tag)
    }
}

impl MetricsSink for MemorySink {
    fn log(&mut self, tag: &str, step: u64, stats: &Stats) {
        self.logged.push(SinkRecord {
            tag: tag.to_string(),
            step,
            stats: stats.clone(),
        });
    }

    fn print(&mut self, tag: &str, step: u64, stats: &Stats) {
        self.printed.push(SinkRecord {
            tag: tag.to_string(),
            step,
            stats: stats.clone(),
        });
    }
}
