//! Supernet training configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{KolosalError, Result};
use crate::nas::{ArchitectureConfig, SearchSpace, TaskKind};

/// What the driver trains
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    /// Sample a new architecture every update and rank the candidate pool
    #[default]
    Supernet,
    /// Train one fixed architecture; no sampling, no ranking
    SubNetwork(ArchitectureConfig),
}

/// Run configuration, validated once by the driver and read-only afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupernetConfig {
    pub mode: TrainingMode,
    pub task: TaskKind,
    pub search_space: SearchSpace,
    /// Number of distinct candidates whose ranking is tracked
    pub candidate_pool_size: usize,
    /// Draw budget for building the pool; `None` means 50 per candidate
    pub max_pool_attempts: Option<usize>,
    /// Stop once more than this many consecutive epochs were stable
    pub ranking_patience: usize,
    /// Stop as soon as tau exceeds this value
    pub corr_threshold: f64,
    /// Step of the synthetic previous-loss vector used by the first check
    pub ranking_baseline_step: f64,
    pub max_epoch: Option<usize>,
    pub max_update: Option<u64>,
    /// Training ends once the learning rate is at or below this value
    pub min_lr: f64,
    pub max_batches_per_epoch: usize,
    /// Batches per update, per epoch; the last entry repeats
    pub update_freq: Vec<usize>,
    /// Save a checkpoint every N epochs
    pub save_interval: usize,
    /// Validate representatives and save every N updates (0 disables)
    pub save_interval_updates: u64,
    pub validate_interval: usize,
    pub disable_validation: bool,
    pub valid_subsets: Vec<String>,
    /// Extra named architectures validated alongside `smallest` and `largest`
    pub representatives: BTreeMap<String, ArchitectureConfig>,
    /// Architecture validated once before training starts
    pub validate_subnetwork: Option<ArchitectureConfig>,
    pub seed: u64,
}

impl Default for SupernetConfig {
    fn default() -> Self {
        Self {
            mode: TrainingMode::Supernet,
            task: TaskKind::default(),
            search_space: SearchSpace::translation_default(),
            candidate_pool_size: 200,
            max_pool_attempts: None,
            ranking_patience: 5,
            corr_threshold: 0.9,
            ranking_baseline_step: 0.01,
            max_epoch: None,
            max_update: None,
            min_lr: 0.0,
            max_batches_per_epoch: 9000,
            update_freq: vec![1],
            save_interval: 1,
            save_interval_updates: 0,
            validate_interval: 1,
            disable_validation: false,
            valid_subsets: vec!["valid".to_string()],
            representatives: BTreeMap::new(),
            validate_subnetwork: None,
            seed: 1,
        }
    }
}

impl SupernetConfig {
    pub fn new(task: TaskKind, search_space: SearchSpace) -> Self {
        Self {
            task,
            search_space,
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: TrainingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_candidate_pool_size(mut self, size: usize) -> Self {
        self.candidate_pool_size = size;
        self
    }

    pub fn with_max_pool_attempts(mut self, attempts: usize) -> Self {
        self.max_pool_attempts = Some(attempts);
        self
    }

    pub fn with_ranking_patience(mut self, patience: usize) -> Self {
        self.ranking_patience = patience;
        self
    }

    pub fn with_corr_threshold(mut self, threshold: f64) -> Self {
        self.corr_threshold = threshold;
        self
    }

    pub fn with_ranking_baseline_step(mut self, step: f64) -> Self {
        self.ranking_baseline_step = step;
        self
    }

    pub fn with_max_epoch(mut self, max_epoch: usize) -> Self {
        self.max_epoch = Some(max_epoch);
        self
    }

    pub fn with_max_update(mut self, max_update: u64) -> Self {
        self.max_update = Some(max_update);
        self
    }

    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    pub fn with_max_batches_per_epoch(mut self, max_batches: usize) -> Self {
        self.max_batches_per_epoch = max_batches;
        self
    }

    pub fn with_update_freq(mut self, update_freq: Vec<usize>) -> Self {
        self.update_freq = update_freq;
        self
    }

    pub fn with_save_interval(mut self, epochs: usize) -> Self {
        self.save_interval = epochs;
        self
    }

    pub fn with_save_interval_updates(mut self, updates: u64) -> Self {
        self.save_interval_updates = updates;
        self
    }

    pub fn with_validate_interval(mut self, epochs: usize) -> Self {
        self.validate_interval = epochs;
        self
    }

    pub fn with_disable_validation(mut self, disable: bool) -> Self {
        self.disable_validation = disable;
        self
    }

    pub fn with_valid_subsets(mut self, subsets: Vec<String>) -> Self {
        self.valid_subsets = subsets;
        self
    }

    pub fn with_representative(mut self, name: impl Into<String>, config: ArchitectureConfig) -> Self {
        self.representatives.insert(name.into(), config);
        self
    }

    pub fn with_validate_subnetwork(mut self, config: ArchitectureConfig) -> Self {
        self.validate_subnetwork = Some(config);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Pool draw budget after applying the default
    pub fn pool_attempts(&self) -> usize {
        self.max_pool_attempts
            .unwrap_or_else(|| self.candidate_pool_size.saturating_mul(50))
    }

    /// Batches per update for a 1-based epoch
    pub fn update_freq_for(&self, epoch: usize) -> usize {
        let idx = epoch.saturating_sub(1).min(self.update_freq.len().saturating_sub(1));
        self.update_freq.get(idx).copied().unwrap_or(1)
    }

    /// Validate every knob
    pub fn validate(&self) -> Result<()> {
        self.search_space.validate()?;

        if !(-1.0..=1.0).contains(&self.corr_threshold) {
            return Err(invalid("corr_threshold", self.corr_threshold, "must be in [-1, 1]"));
        }
        if !self.ranking_baseline_step.is_finite() || self.ranking_baseline_step <= 0.0 {
            return Err(invalid(
                "ranking_baseline_step",
                self.ranking_baseline_step,
                "must be a positive finite number",
            ));
        }
        if self.candidate_pool_size == 0 && self.ranks_candidates() {
            return Err(invalid("candidate_pool_size", 0, "must be positive"));
        }
        if self.update_freq.is_empty() || self.update_freq.contains(&0) {
            return Err(invalid(
                "update_freq",
                format!("{:?}", self.update_freq),
                "must be a non-empty list of positive counts",
            ));
        }
        if self.max_batches_per_epoch == 0 {
            return Err(invalid("max_batches_per_epoch", 0, "must be positive"));
        }
        if self.save_interval == 0 {
            return Err(invalid("save_interval", 0, "must be positive"));
        }
        if self.validate_interval == 0 {
            return Err(invalid("validate_interval", 0, "must be positive"));
        }
        if self.valid_subsets.is_empty() && !self.disable_validation {
            return Err(KolosalError::ConfigError(
                "valid_subsets is empty while validation is enabled".to_string(),
            ));
        }
        // the ranking check validates every candidate even with validation disabled
        if self.valid_subsets.is_empty() && self.ranks_candidates() {
            return Err(KolosalError::ConfigError(
                "valid_subsets is empty but candidate ranking needs a validation subset".to_string(),
            ));
        }
        if self.min_lr < 0.0 {
            return Err(invalid("min_lr", self.min_lr, "must be non-negative"));
        }

        if let TrainingMode::SubNetwork(config) = &self.mode {
            self.search_space.validate_config(&self.task, config)?;
        }
        for config in self.representatives.values() {
            self.search_space.validate_config(&self.task, config)?;
        }
        if let Some(config) = &self.validate_subnetwork {
            self.search_space.validate_config(&self.task, config)?;
        }
        Ok(())
    }

    /// Whether this run builds a pool and checks its ranking every epoch
    pub fn ranks_candidates(&self) -> bool {
        matches!(self.mode, TrainingMode::Supernet) && self.task.ranks_candidates()
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn invalid(name: &str, value: impl ToString, reason: &str) -> KolosalError {
    KolosalError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
