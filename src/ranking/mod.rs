//! Ranking stability
//!
//! - [`correlation`] - Kendall tau-b and Spearman rho with tie handling
//! - [`monitor`] - cross-epoch stability counter driving early stopping

pub mod correlation;
pub mod monitor;

pub use correlation::{average_ranks, kendall_tau, spearman_rho};
pub use monitor::{RankingMonitor, RankingOutcome, RankingState};
