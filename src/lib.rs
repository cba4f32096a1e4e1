//! Kolosal Supernet - Elastic supernet training and architecture search
//!
//! This crate trains one weight-shared supernet whose structured layers can be
//! sliced into many smaller sub-networks, and stops training once the ranking of a
//! fixed pool of candidate sub-networks has stabilized.
//!
//! # Modules
//!
//! ## Elastic parameters
//! - [`elastic`] - Maximal-size layers exposing prefix sub-tensors, and the whole-model aggregate
//!
//! ## Architecture search
//! - [`nas`] - Search space, task kinds, seeded sampler and candidate pool
//! - [`ranking`] - Rank correlation and the ranking stability monitor
//!
//! ## Training
//! - [`training`] - Run configuration, collaborator traits, checkpoints and the driver
//!
//! ## Services
//! - [`cli`] - Command-line interface

// Core error handling
pub mod error;

// Elastic parameters
pub mod elastic;

// Architecture search
pub mod nas;
pub mod ranking;

// Training
pub mod training;

// Services
pub mod cli;

pub use error::{KolosalError, Result};

/// Prelude for convenient imports
pub mod prelude {
    // Error handling
    pub use crate::error::{KolosalError, Result};

    // Elastic parameters
    pub use crate::elastic::{Conv2dSuper, ElasticLayer, ElasticModel, Extent, LinearSuper, SampleDims, SuperNet};

    // Architecture search
    pub use crate::nas::{
        ArchitectureConfig, ArchitectureSampler, CandidatePool, DummyInput, Region, RegionConfig, RegionSpace,
        RepresentativeSet, SampleMode, SearchSpace, TaskKind,
    };

    // Ranking
    pub use crate::ranking::{kendall_tau, spearman_rho, RankingMonitor, RankingOutcome, RankingState};

    // Training
    pub use crate::training::{
        BatchSource, CheckpointStore, JsonCheckpointStore, MetricsSink, StepStats, StopReason, SupernetConfig,
        SupernetDriver, SupernetTrainer, TrainingMode, TrainingSummary,
    };
}
