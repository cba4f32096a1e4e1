//! Ranking stability monitor
//!
//! Once per epoch every candidate of the pool is validated and the resulting loss
//! vector is compared with the previous epoch's by Kendall tau. An epoch is *stable*
//! when tau improved on the previous epoch's tau; training stops after more than
//! `patience` consecutive stable epochs or as soon as tau exceeds the threshold.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::correlation::{kendall_tau, spearman_rho};
use crate::error::{KolosalError, Result};
use crate::nas::{ArchitectureConfig, CandidatePool};

/// State carried between epochs (and across checkpoints)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingState {
    /// Candidate losses of the last check; empty before the first check
    pub previous_losses: Vec<f64>,
    /// Tau of the last defined check, `-1.0` initially
    pub previous_correlation: f64,
    /// Consecutive stable epochs
    pub stability_counter: usize,
}

impl Default for RankingState {
    fn default() -> Self {
        Self {
            previous_losses: Vec::new(),
            previous_correlation: -1.0,
            stability_counter: 0,
        }
    }
}

/// Result of one ranking check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingOutcome {
    pub is_stable: bool,
    /// Kendall tau-b against the previous losses; `None` when undefined
    pub tau: Option<f64>,
    /// Spearman rho against the previous losses; logged only
    pub rho: Option<f64>,
    pub losses: Vec<f64>,
    pub stability_counter: usize,
    pub should_stop: bool,
}

/// Tracks cross-epoch ranking agreement of a fixed candidate pool
#[derive(Debug, Clone)]
pub struct RankingMonitor {
    state: RankingState,
    patience: usize,
    threshold: f64,
    baseline_step: f64,
}

impl RankingMonitor {
    /// Create a monitor
    ///
    /// # Arguments
    /// * `patience` - Stop once more than this many consecutive epochs were stable.
    /// * `threshold` - Stop as soon as tau exceeds this value.
    /// * `baseline_step` - The first check compares against `[i * baseline_step]`.
    pub fn new(patience: usize, threshold: f64, baseline_step: f64) -> Result<Self> {
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(KolosalError::InvalidParameter {
                name: "corr_threshold".to_string(),
                value: threshold.to_string(),
                reason: "must be in [-1, 1]".to_string(),
            });
        }
        if !baseline_step.is_finite() || baseline_step <= 0.0 {
            return Err(KolosalError::InvalidParameter {
                name: "ranking_baseline_step".to_string(),
                value: baseline_step.to_string(),
                reason: "must be a positive finite number".to_string(),
            });
        }

        Ok(Self {
            state: RankingState::default(),
            patience,
            threshold,
            baseline_step,
        })
    }

    /// Continue from a restored state
    pub fn with_state(mut self, state: RankingState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &RankingState {
        &self.state
    }

    /// Synthetic previous vector used by the first check
    pub fn baseline(&self, len: usize) -> Vec<f64> {
        (0..len).map(|i| i as f64 * self.baseline_step).collect()
    }

    /// Validate every candidate with `evaluate(index, config)` and observe the losses
    pub fn check<F>(&mut self, pool: &CandidatePool, mut evaluate: F) -> Result<RankingOutcome>
    where
        F: FnMut(usize, &ArchitectureConfig) -> Result<f64>,
    {
        let mut losses = Vec::with_capacity(pool.len());
        for (i, config) in pool.iter().enumerate() {
            losses.push(evaluate(i, config)?);
        }
        self.observe(losses)
    }

    /// Compare `losses` with the previous vector and update the state.
    ///
    /// A length mismatch with the previous vector is an error and leaves the state
    /// untouched.
    pub fn observe(&mut self, losses: Vec<f64>) -> Result<RankingOutcome> {
        let previous = if self.state.previous_losses.is_empty() {
            self.baseline(losses.len())
        } else {
            self.state.previous_losses.clone()
        };

        let tau = kendall_tau(&losses, &previous)?;
        let rho = spearman_rho(&losses, &previous)?;

        let is_stable = match tau {
            Some(t) => t > self.state.previous_correlation,
            None => false,
        };
        if is_stable {
            self.state.stability_counter += 1;
        } else {
            self.state.stability_counter = 0;
        }
        match tau {
            Some(t) => self.state.previous_correlation = t,
            None => warn!(candidates = losses.len(), "Ranking correlation undefined"),
        }

        let should_stop = self.state.stability_counter > self.patience || tau.map_or(false, |t| t > self.threshold);

        info!(
            tau = ?tau,
            spearman = ?rho,
            stable = is_stable,
            counter = self.state.stability_counter,
            "Ranking check"
        );
        if should_stop {
            info!("The ranking is stable, stop training");
        }

        self.state.previous_losses = losses.clone();

        Ok(RankingOutcome {
            is_stable,
            tau,
            rho,
            losses,
            stability_counter: self.state.stability_counter,
            should_stop,
        })
    }
}
