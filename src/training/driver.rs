//! Supernet training driver
//!
//! Runs the outer loop of supernet training as a small state machine:
//!
//! ```text
//! Init -> TrainEpoch -> RankCheck -> ValidateRepresentatives -> Checkpoint -> LrStep
//!           ^                                                                   |
//!           +------------------------- (continue) -----------------------------+
//!                                                                               |
//!                                                               Done(StopReason)
//! ```
//!
//! Every update draws a fresh architecture seeded by the trainer's update counter,
//! so a run is reproducible and a skipped update redraws the same architecture.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::checkpoint::TrainingState;
use super::collaborators::{BatchSource, CheckpointStore, MetricsSink, SupernetTrainer};
use super::config::{SupernetConfig, TrainingMode};
use super::meters::{arch_stats, MeterSet, Stats, StopwatchMeter};
use crate::error::{KolosalError, Result};
use crate::nas::{ArchitectureSampler, CandidatePool, RepresentativeSet};
use crate::ranking::{RankingMonitor, RankingOutcome};

/// Why training ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Learning rate reached `min_lr`
    LrBelowFloor,
    MaxEpoch,
    MaxUpdate,
    /// The ranking monitor requested a stop
    RankingStable,
}

/// Current step of the driver loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    Init,
    TrainEpoch,
    RankCheck,
    ValidateRepresentatives,
    Checkpoint,
    LrStep,
    Done(StopReason),
}

/// Result of [`SupernetDriver::run`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub epochs_completed: usize,
    pub num_updates: u64,
    pub stop_reason: StopReason,
    pub final_lr: f64,
    pub best_loss: Option<f64>,
    pub last_ranking: Option<RankingOutcome>,
    pub elapsed_secs: f64,
}

/// Drives supernet (or fixed sub-network) training until a stop condition holds
pub struct SupernetDriver<T, B, C, S>
where
    T: SupernetTrainer,
    B: BatchSource<Batch = T::Batch>,
    C: CheckpointStore,
    S: MetricsSink,
{
    config: SupernetConfig,
    trainer: T,
    batches: B,
    store: C,
    sink: S,
    sampler: ArchitectureSampler,
    representatives: RepresentativeSet,
    monitor: RankingMonitor,
    pool: Option<CandidatePool>,
    phase: DriverPhase,
    /// Completed epochs
    epoch: usize,
    /// Update groups to skip at the start of the next epoch (resume)
    resume_iterations: usize,
    lr: f64,
    last_val_loss: Option<f64>,
    best_loss: Option<f64>,
    last_ranking: Option<RankingOutcome>,
    stop_requested: bool,
    stopwatch: StopwatchMeter,
}

impl<T, B, C, S> SupernetDriver<T, B, C, S>
where
    T: SupernetTrainer,
    B: BatchSource<Batch = T::Batch>,
    C: CheckpointStore,
    S: MetricsSink,
{
    /// Validate the configuration and assemble the driver
    pub fn new(config: SupernetConfig, trainer: T, batches: B, store: C, sink: S) -> Result<Self> {
        config.validate()?;

        let sampler = ArchitectureSampler::new(config.search_space.clone(), config.task.clone())?;
        let mut representatives = RepresentativeSet::extremes(&sampler)?;
        for (name, arch) in &config.representatives {
            representatives = representatives.with(name.clone(), arch.clone());
        }
        let monitor = RankingMonitor::new(
            config.ranking_patience,
            config.corr_threshold,
            config.ranking_baseline_step,
        )?;
        let lr = trainer.lr();

        Ok(Self {
            config,
            trainer,
            batches,
            store,
            sink,
            sampler,
            representatives,
            monitor,
            pool: None,
            phase: DriverPhase::Init,
            epoch: 0,
            resume_iterations: 0,
            lr,
            last_val_loss: None,
            best_loss: None,
            last_ranking: None,
            stop_requested: false,
            stopwatch: StopwatchMeter::new(),
        })
    }

    /// Use a prepared candidate pool instead of sampling one
    pub fn with_candidate_pool(mut self, pool: CandidatePool) -> Result<Self> {
        for arch in pool.iter() {
            self.config.search_space.validate_config(&self.config.task, arch)?;
        }
        self.pool = Some(pool);
        Ok(self)
    }

    pub fn config(&self) -> &SupernetConfig {
        &self.config
    }

    pub fn phase(&self) -> DriverPhase {
        self.phase
    }

    pub fn candidate_pool(&self) -> Option<&CandidatePool> {
        self.pool.as_ref()
    }

    pub fn representatives(&self) -> &RepresentativeSet {
        &self.representatives
    }

    pub fn trainer(&self) -> &T {
        &self.trainer
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Take the collaborators back
    pub fn into_parts(self) -> (T, B, C, S) {
        (self.trainer, self.batches, self.store, self.sink)
    }

    /// Train until a stop condition holds
    pub fn run(&mut self) -> Result<TrainingSummary> {
        self.stopwatch.start();
        self.phase = DriverPhase::Init;

        let stop_reason = loop {
            let phase = self.phase;
            self.phase = match phase {
                DriverPhase::Init => {
                    self.init()?;
                    self.continue_or_stop()
                }
                DriverPhase::TrainEpoch => {
                    self.train_epoch()?;
                    DriverPhase::RankCheck
                }
                DriverPhase::RankCheck => {
                    self.rank_check()?;
                    DriverPhase::ValidateRepresentatives
                }
                DriverPhase::ValidateRepresentatives => {
                    self.end_of_epoch_validation()?;
                    DriverPhase::Checkpoint
                }
                DriverPhase::Checkpoint => {
                    if self.epoch % self.config.save_interval == 0 {
                        self.save(self.epoch, 0, true)?;
                    }
                    DriverPhase::LrStep
                }
                DriverPhase::LrStep => {
                    self.lr = self.trainer.lr_step(self.epoch, self.last_val_loss)?;
                    debug!(epoch = self.epoch, lr = self.lr, "Stepped learning rate");
                    self.continue_or_stop()
                }
                DriverPhase::Done(reason) => break reason,
            };
        };

        self.stopwatch.stop();
        let elapsed_secs = self.stopwatch.elapsed_secs();
        info!(reason = ?stop_reason, epochs = self.epoch, "Done training in {:.1} seconds", elapsed_secs);

        Ok(TrainingSummary {
            epochs_completed: self.epoch,
            num_updates: self.trainer.num_updates(),
            stop_reason,
            final_lr: self.lr,
            best_loss: self.best_loss,
            last_ranking: self.last_ranking.clone(),
            elapsed_secs,
        })
    }

    fn continue_or_stop(&self) -> DriverPhase {
        let reason = if self.stop_requested {
            Some(StopReason::RankingStable)
        } else if self.lr <= self.config.min_lr {
            Some(StopReason::LrBelowFloor)
        } else if self.config.max_epoch.map_or(false, |max| self.epoch >= max) {
            Some(StopReason::MaxEpoch)
        } else if self
            .config
            .max_update
            .map_or(false, |max| self.trainer.num_updates() >= max)
        {
            Some(StopReason::MaxUpdate)
        } else {
            None
        };

        match reason {
            Some(reason) => DriverPhase::Done(reason),
            None => DriverPhase::TrainEpoch,
        }
    }

    fn init(&mut self) -> Result<()> {
        if let Some(state) = self.store.load()? {
            self.restore(state)?;
        }
        self.lr = self.trainer.lr();

        let size_config = match &self.config.mode {
            TrainingMode::SubNetwork(arch) => arch.clone(),
            TrainingMode::Supernet => self.sampler.space().largest(self.sampler.task())?,
        };
        self.trainer.set_sample_config(&size_config)?;
        let params = self.trainer.model_mut().calc_sampled_param_num()?;
        match self.config.mode {
            TrainingMode::Supernet => info!(params, "Supernet model size"),
            TrainingMode::SubNetwork(_) => info!(params, arch = %size_config, "Sub-network model size"),
        }

        if self.config.ranks_candidates() && self.pool.is_none() {
            let pool = CandidatePool::seeded(
                &self.sampler,
                self.config.candidate_pool_size,
                self.config.pool_attempts(),
                self.config.seed,
            )?;
            self.pool = Some(pool);
        }

        if let Some(arch) = self.config.validate_subnetwork.clone() {
            self.trainer.set_sample_config(&arch)?;
            let step = self.trainer.num_updates();
            let losses = validate_subsets(
                &mut self.trainer,
                &mut self.batches,
                &mut self.sink,
                &self.config.valid_subsets,
                "subnetwork",
                step,
            )?;
            info!(loss = ?losses.first(), arch = %arch, "Sub-network validation loss");
        }
        Ok(())
    }

    fn restore(&mut self, state: TrainingState) -> Result<()> {
        self.trainer.load_state(state.trainer)?;
        if self.trainer.num_updates() != state.num_updates {
            warn!(
                checkpoint = state.num_updates,
                trainer = self.trainer.num_updates(),
                "Trainer update counter differs from checkpoint"
            );
        }

        self.epoch = state.epoch;
        self.resume_iterations = if state.end_of_epoch { 0 } else { state.iterations_in_epoch };
        self.best_loss = state.best_loss;
        self.last_val_loss = state.val_loss;
        self.monitor = self.monitor.clone().with_state(state.ranking);
        self.stop_requested = state.stop_requested;

        if let Some(pool) = state.candidate_pool {
            if self.pool.as_ref().map_or(false, |p| p != &pool) {
                warn!("Replacing the injected candidate pool with the checkpointed one");
            }
            self.pool = Some(pool);
        }

        info!(
            epoch = self.epoch,
            iterations_in_epoch = self.resume_iterations,
            updates = state.num_updates,
            "Resuming training"
        );
        Ok(())
    }

    fn train_epoch(&mut self) -> Result<()> {
        let epoch = self.epoch + 1;
        let update_freq = self.config.update_freq_for(epoch);
        let resume_groups = std::mem::take(&mut self.resume_iterations);

        let mut batches = self.batches.train_iter(epoch)?;
        let mut meters = MeterSet::new();
        let mut groups_seen = 0usize;
        let mut trained = 0usize;
        let mut skipped = 0usize;

        debug!(epoch, update_freq, resume_groups, "Starting epoch");

        loop {
            // checked before pulling so skipped groups count toward the limit
            if groups_seen >= self.config.max_batches_per_epoch {
                break;
            }
            let group: Vec<T::Batch> = batches.by_ref().take(update_freq).collect();
            if group.is_empty() {
                break;
            }
            groups_seen += 1;
            if groups_seen <= resume_groups {
                continue;
            }

            let arch = match &self.config.mode {
                TrainingMode::SubNetwork(arch) => arch.clone(),
                TrainingMode::Supernet => self.sampler.sample_with_seed(self.trainer.num_updates())?,
            };
            self.trainer.set_sample_config(&arch)?;

            let Some(step) = self.trainer.train_step(&group, std::slice::from_ref(&arch))? else {
                skipped += 1;
                continue;
            };
            trained += 1;
            meters.add_step(&step);

            let num_updates = self.trainer.num_updates();
            let mut stats: Stats = arch_stats(&arch);
            stats.insert("loss".to_string(), step.loss);
            if let Some(nll) = step.nll_loss {
                stats.insert("nll_loss".to_string(), nll);
            }
            for (name, value) in &step.extra {
                stats.insert(name.clone(), *value);
            }
            stats.insert("lr".to_string(), self.trainer.lr());
            self.sink.log("train_inner", num_updates, &stats);

            let interval = self.config.save_interval_updates;
            if interval > 0 && num_updates > 0 && num_updates % interval == 0 && !self.config.disable_validation {
                self.last_val_loss = self.validate_representatives()?;
                self.save(self.epoch, groups_seen, false)?;
            }

            if self.config.max_update.map_or(false, |max| num_updates >= max) {
                debug!(num_updates, "Reached max_update inside epoch");
                break;
            }
        }

        if trained == 0 && (skipped > 0 || groups_seen == 0) {
            return Err(KolosalError::EmptyEpoch { epoch, skipped });
        }
        if skipped > 0 {
            warn!(epoch, skipped, "Skipped updates during epoch");
        }

        self.epoch = epoch;

        let mut stats = meters.stats();
        stats.insert("num_updates".to_string(), self.trainer.num_updates() as f64);
        stats.insert("lr".to_string(), self.trainer.lr());
        self.sink.print("train", self.trainer.num_updates(), &stats);
        info!(epoch, trained, "Finished epoch");
        Ok(())
    }

    fn rank_check(&mut self) -> Result<()> {
        if !self.config.ranks_candidates() {
            return Ok(());
        }
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| KolosalError::TrainingError("ranking requested without a candidate pool".to_string()))?;

        let step = self.trainer.num_updates();
        let trainer = &mut self.trainer;
        let batches = &mut self.batches;
        let sink = &mut self.sink;
        let subsets = &self.config.valid_subsets;

        let outcome = self.monitor.check(pool, |index, arch| {
            trainer.set_sample_config(arch)?;
            let losses = validate_subsets(trainer, batches, sink, subsets, &index.to_string(), step)?;
            first_loss(&losses)
        })?;

        let mut stats = Stats::new();
        if let Some(tau) = outcome.tau {
            stats.insert("kendall_tau".to_string(), tau);
        }
        if let Some(rho) = outcome.rho {
            stats.insert("spearman_rho".to_string(), rho);
        }
        stats.insert("stability_counter".to_string(), outcome.stability_counter as f64);
        self.sink.print("ranking", step, &stats);

        if outcome.should_stop {
            self.stop_requested = true;
        }
        self.last_ranking = Some(outcome);
        Ok(())
    }

    fn end_of_epoch_validation(&mut self) -> Result<()> {
        if self.config.disable_validation || self.epoch % self.config.validate_interval != 0 {
            self.last_val_loss = None;
            return Ok(());
        }
        self.last_val_loss = self.validate_representatives()?;
        Ok(())
    }

    /// Validate the fixed sub-network, or every representative in supernet mode.
    ///
    /// Returns the loss driving the lr schedule and best-checkpoint tracking: the
    /// sub-network's, or the `largest` representative's (last validated otherwise).
    fn validate_representatives(&mut self) -> Result<Option<f64>> {
        let step = self.trainer.num_updates();
        let mut tracked = None;

        match &self.config.mode {
            TrainingMode::SubNetwork(arch) => {
                self.trainer.set_sample_config(arch)?;
                let losses = validate_subsets(
                    &mut self.trainer,
                    &mut self.batches,
                    &mut self.sink,
                    &self.config.valid_subsets,
                    "subnetwork",
                    step,
                )?;
                tracked = losses.first().copied();
            }
            TrainingMode::Supernet => {
                let mut largest = None;
                for (name, arch) in self.representatives.iter() {
                    self.trainer.set_sample_config(arch)?;
                    let losses = validate_subsets(
                        &mut self.trainer,
                        &mut self.batches,
                        &mut self.sink,
                        &self.config.valid_subsets,
                        name,
                        step,
                    )?;
                    tracked = losses.first().copied();
                    if name == "largest" {
                        largest = tracked;
                    }
                }
                tracked = largest.or(tracked);
            }
        }

        if let Some(loss) = tracked {
            self.best_loss = Some(self.best_loss.map_or(loss, |best| best.min(loss)));
        }
        Ok(tracked)
    }

    fn save(&mut self, epoch: usize, iterations_in_epoch: usize, end_of_epoch: bool) -> Result<()> {
        let state = TrainingState {
            epoch,
            iterations_in_epoch,
            end_of_epoch,
            num_updates: self.trainer.num_updates(),
            lr: self.trainer.lr(),
            val_loss: self.last_val_loss,
            best_loss: self.best_loss,
            ranking: self.monitor.state().clone(),
            candidate_pool: self.pool.clone(),
            stop_requested: self.stop_requested,
            trainer: self.trainer.state()?,
        };
        self.store.save(&state)
    }
}

/// Average validation loss of every subset under the active architecture
fn validate_subsets<T, B, S>(
    trainer: &mut T,
    batches: &mut B,
    sink: &mut S,
    subsets: &[String],
    name: &str,
    step: u64,
) -> Result<Vec<f64>>
where
    T: SupernetTrainer,
    B: BatchSource<Batch = T::Batch>,
    S: MetricsSink,
{
    let mut losses = Vec::with_capacity(subsets.len());
    for subset in subsets {
        let mut meters = MeterSet::new();
        for batch in batches.valid_iter(subset)? {
            meters.add_step(&trainer.valid_step(&batch)?);
        }
        let loss = meters
            .avg("loss")
            .ok_or_else(|| KolosalError::ValidationError(format!("subset '{}' yielded no batches", subset)))?;

        sink.print(&format!("{}/{}", subset, name), step, &meters.stats());
        losses.push(loss);
    }
    Ok(losses)
}

fn first_loss(losses: &[f64]) -> Result<f64> {
    losses
        .first()
        .copied()
        .ok_or_else(|| KolosalError::ValidationError("no validation subsets configured".to_string()))
}
