//! Architecture sampler
//!
//! Draws one value uniformly per searchable dimension. The draw order is fixed
//! (regions in [`Region`] order; within a region embed, layer count, then per layer
//! ffn / heads / cross heads / arbitrary attention) so a seed always maps to the same
//! architecture.

use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use super::search_space::{ArchitectureConfig, Region, RegionConfig, RegionSpace, SearchSpace};
use super::task::TaskKind;
use crate::error::{KolosalError, Result};

/// How a sample is drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleMode {
    /// Fresh generator seeded from `seed`; the caller's rng is not touched
    Deterministic { seed: u64 },
    /// Draw from the caller's rng
    Random,
}

/// Samples architectures for one task from a search space
#[derive(Debug, Clone)]
pub struct ArchitectureSampler {
    space: SearchSpace,
    task: TaskKind,
}

impl ArchitectureSampler {
    /// Create a sampler, checking that the space covers every region of the task
    pub fn new(space: SearchSpace, task: TaskKind) -> Result<Self> {
        space.validate()?;
        for &region in task.regions() {
            space.region(region)?;
        }
        Ok(Self { space, task })
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn task(&self) -> &TaskKind {
        &self.task
    }

    /// Draw one architecture
    pub fn sample<R: Rng + ?Sized>(&self, mode: SampleMode, rng: &mut R) -> Result<ArchitectureConfig> {
        match mode {
            SampleMode::Deterministic { seed } => self.sample_with_seed(seed),
            SampleMode::Random => self.sample_with_rng(rng),
        }
    }

    /// Draw with a generator seeded from `seed`
    pub fn sample_with_seed(&self, seed: u64) -> Result<ArchitectureConfig> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        self.sample_with_rng(&mut rng)
    }

    pub fn sample_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<ArchitectureConfig> {
        let mut regions: Vec<Region> = self.task.regions().to_vec();
        regions.sort();

        let mut config = ArchitectureConfig::new();
        for region in regions {
            let space = self.space.region(region)?;
            config = config.with_region(region, sample_region(region, space, rng)?);
        }
        Ok(config)
    }
}

fn sample_region<R: Rng + ?Sized>(region: Region, space: &RegionSpace, rng: &mut R) -> Result<RegionConfig> {
    let embed_dim = choose(region, "embed_dim", &space.embed_dim, rng)?;
    let layer_num = choose(region, "layer_num", &space.layer_num, rng)?;

    let mut config = RegionConfig {
        embed_dim,
        layer_num,
        ffn_embed_dim: Vec::with_capacity(layer_num),
        attention_heads: Vec::with_capacity(layer_num),
        cross_attention_heads: Vec::new(),
        arbitrary_ende_attn: Vec::new(),
    };

    for _ in 0..layer_num {
        config
            .ffn_embed_dim
            .push(choose(region, "ffn_embed_dim", &space.ffn_embed_dim, rng)?);
        config
            .attention_heads
            .push(choose(region, "attention_heads", &space.attention_heads, rng)?);
        if !space.cross_attention_heads.is_empty() {
            config.cross_attention_heads.push(choose(
                region,
                "cross_attention_heads",
                &space.cross_attention_heads,
                rng,
            )?);
        }
        if !space.arbitrary_ende_attn.is_empty() {
            config.arbitrary_ende_attn.push(choose(
                region,
                "arbitrary_ende_attn",
                &space.arbitrary_ende_attn,
                rng,
            )?);
        }
    }

    Ok(config)
}

fn choose<T: Copy, R: Rng + ?Sized>(region: Region, name: &str, choices: &[T], rng: &mut R) -> Result<T> {
    if choices.is_empty() {
        return Err(KolosalError::ConfigError(format!("{}.{} has no choices", region, name)));
    }
    Ok(choices[rng.gen_range(0..choices.len())])
}
