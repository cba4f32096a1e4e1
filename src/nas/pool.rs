//! Candidate pool and representative set
//!
//! The pool is a fixed, ordered list of distinct architectures whose validation
//! losses are compared across epochs. Positions never change after construction.

use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use super::sampler::{ArchitectureSampler, SampleMode};
use super::search_space::ArchitectureConfig;
use crate::error::{KolosalError, Result};

/// Fixed set of distinct candidate architectures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidatePool {
    candidates: Vec<ArchitectureConfig>,
}

impl CandidatePool {
    /// Sample `size` distinct architectures.
    ///
    /// Fails with [`KolosalError::SearchSpaceTooSmall`] up front when the space cannot
    /// hold `size` distinct configs, and after `max_attempts` draws otherwise.
    pub fn build<R: Rng + ?Sized>(
        sampler: &ArchitectureSampler,
        size: usize,
        max_attempts: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let cardinality = sampler.space().cardinality(sampler.task())?;
        if cardinality < size as u128 {
            return Err(KolosalError::SearchSpaceTooSmall {
                requested: size,
                found: usize::try_from(cardinality).unwrap_or(usize::MAX),
                attempts: 0,
            });
        }

        let mut seen = HashSet::with_capacity(size);
        let mut candidates = Vec::with_capacity(size);
        let mut attempts = 0;

        while candidates.len() < size {
            if attempts >= max_attempts {
                return Err(KolosalError::SearchSpaceTooSmall {
                    requested: size,
                    found: candidates.len(),
                    attempts,
                });
            }
            attempts += 1;

            let config = sampler.sample(SampleMode::Random, rng)?;
            if seen.insert(config.to_canonical_string()?) {
                candidates.push(config);
            }
        }

        info!(size, attempts, "Built candidate pool");
        Ok(Self { candidates })
    }

    /// [`CandidatePool::build`] with a generator seeded from `seed`
    pub fn seeded(sampler: &ArchitectureSampler, size: usize, max_attempts: usize, seed: u64) -> Result<Self> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        Self::build(sampler, size, max_attempts, &mut rng)
    }

    /// Rebuild a pool from stored configs, keeping their order
    pub fn from_configs(candidates: Vec<ArchitectureConfig>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(candidates.len());
        for (i, config) in candidates.iter().enumerate() {
            if !seen.insert(config.to_canonical_string()?) {
                return Err(KolosalError::InvalidInput(format!(
                    "candidate {} duplicates an earlier candidate: {}",
                    i, config
                )));
            }
        }
        debug!(size = candidates.len(), "Restored candidate pool");
        Ok(Self { candidates })
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ArchitectureConfig> {
        self.candidates.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ArchitectureConfig> {
        self.candidates.iter()
    }

    pub fn as_slice(&self) -> &[ArchitectureConfig] {
        &self.candidates
    }
}

impl<'a> IntoIterator for &'a CandidatePool {
    type Item = &'a ArchitectureConfig;
    type IntoIter = std::slice::Iter<'a, ArchitectureConfig>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.iter()
    }
}

/// Named architectures validated periodically during training
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepresentativeSet {
    configs: BTreeMap<String, ArchitectureConfig>,
}

impl RepresentativeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// `smallest` and `largest` of the sampler's space
    pub fn extremes(sampler: &ArchitectureSampler) -> Result<Self> {
        let space = sampler.space();
        let task = sampler.task();
        Ok(Self::new()
            .with("smallest", space.smallest(task)?)
            .with("largest", space.largest(task)?))
    }

    pub fn with(mut self, name: impl Into<String>, config: ArchitectureConfig) -> Self {
        self.configs.insert(name.into(), config);
        self
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ArchitectureConfig> {
        self.configs.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArchitectureConfig)> {
        self.configs.iter().map(|(name, config)| (name.as_str(), config))
    }
}
