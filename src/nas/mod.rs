//! Supernet architecture search
//!
//! Defines what a sub-network can look like and how sub-networks are drawn:
//! - Search space: discrete per-region choices and the sampled [`ArchitectureConfig`]
//! - Task kinds: which regions a task samples and what it is profiled against
//! - Sampler: seeded uniform draws, one per searchable dimension
//! - Candidate pool: fixed set of distinct architectures used for ranking

pub mod pool;
pub mod sampler;
pub mod search_space;
pub mod task;

pub use pool::{CandidatePool, RepresentativeSet};
pub use sampler::{ArchitectureSampler, SampleMode};
pub use search_space::{ArchitectureConfig, Region, RegionConfig, RegionSpace, SearchSpace};
pub use task::{DummyInput, TaskKind, TranslationCorpus};
