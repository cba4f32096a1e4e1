//! Supernet Search Space Definition
//!
//! Defines the discrete choices every sampled sub-network is drawn from, and the
//! hierarchical [`ArchitectureConfig`] record a draw produces.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::task::TaskKind;
use crate::error::{KolosalError, Result};

/// Structural region of the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    /// Encoder stack
    Encoder,
    /// Decoder stack
    Decoder,
    /// Convolutional backbone
    Backbone,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Encoder => "encoder",
            Region::Decoder => "decoder",
            Region::Backbone => "backbone",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discrete choices for one region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSpace {
    /// Embedding width choices
    pub embed_dim: Vec<usize>,
    /// Layer count choices
    pub layer_num: Vec<usize>,
    /// Per-layer feed-forward width choices
    pub ffn_embed_dim: Vec<usize>,
    /// Per-layer self-attention head count choices
    pub attention_heads: Vec<usize>,
    /// Per-layer encoder-decoder attention head count choices (empty = not searched)
    #[serde(default)]
    pub cross_attention_heads: Vec<usize>,
    /// Per-layer choice of how many encoder layers to attend to (-1 = last only)
    #[serde(default)]
    pub arbitrary_ende_attn: Vec<i32>,
}

impl RegionSpace {
    /// Create a region with the mandatory dimensions
    pub fn new(
        embed_dim: Vec<usize>,
        layer_num: Vec<usize>,
        ffn_embed_dim: Vec<usize>,
        attention_heads: Vec<usize>,
    ) -> Self {
        Self {
            embed_dim,
            layer_num,
            ffn_embed_dim,
            attention_heads,
            cross_attention_heads: Vec::new(),
            arbitrary_ende_attn: Vec::new(),
        }
    }

    /// Also search encoder-decoder attention heads
    pub fn with_cross_attention_heads(mut self, heads: Vec<usize>) -> Self {
        self.cross_attention_heads = heads;
        self
    }

    /// Also search arbitrary encoder-decoder attention
    pub fn with_arbitrary_ende_attn(mut self, choices: Vec<i32>) -> Self {
        self.arbitrary_ende_attn = choices;
        self
    }

    pub fn max_embed_dim(&self) -> usize {
        self.embed_dim.iter().copied().max().unwrap_or(0)
    }

    pub fn max_layers(&self) -> usize {
        self.layer_num.iter().copied().max().unwrap_or(0)
    }

    pub fn max_ffn_embed_dim(&self) -> usize {
        self.ffn_embed_dim.iter().copied().max().unwrap_or(0)
    }

    pub fn max_attention_heads(&self) -> usize {
        self.attention_heads.iter().copied().max().unwrap_or(0)
    }

    pub fn max_cross_attention_heads(&self) -> usize {
        self.cross_attention_heads.iter().copied().max().unwrap_or(0)
    }

    /// Validate the region's choice lists
    pub fn validate(&self, region: Region) -> Result<()> {
        let mandatory: [(&str, &Vec<usize>); 4] = [
            ("embed_dim", &self.embed_dim),
            ("layer_num", &self.layer_num),
            ("ffn_embed_dim", &self.ffn_embed_dim),
            ("attention_heads", &self.attention_heads),
        ];

        for (name, choices) in mandatory {
            if choices.is_empty() {
                return Err(KolosalError::ConfigError(format!(
                    "{}.{} has no choices",
                    region, name
                )));
            }
            if choices.contains(&0) {
                return Err(KolosalError::ConfigError(format!(
                    "{}.{} contains a zero choice",
                    region, name
                )));
            }
        }
        if self.cross_attention_heads.contains(&0) {
            return Err(KolosalError::ConfigError(format!(
                "{}.cross_attention_heads contains a zero choice",
                region
            )));
        }
        Ok(())
    }

    /// Number of distinct per-layer outcomes
    fn per_layer_cardinality(&self) -> u128 {
        let cross = distinct(&self.cross_attention_heads).max(1);
        let arbitrary = distinct(&self.arbitrary_ende_attn).max(1);
        distinct(&self.ffn_embed_dim)
            .saturating_mul(distinct(&self.attention_heads))
            .saturating_mul(cross)
            .saturating_mul(arbitrary)
    }

    /// Number of distinct region configurations
    fn cardinality(&self) -> u128 {
        let per_layer = self.per_layer_cardinality();
        let layers: BTreeSet<usize> = self.layer_num.iter().copied().collect();
        let depth_total = layers.iter().fold(0u128, |acc, &depth| {
            let exponent = u32::try_from(depth).unwrap_or(u32::MAX);
            acc.saturating_add(per_layer.saturating_pow(exponent))
        });
        distinct(&self.embed_dim).saturating_mul(depth_total)
    }

    fn extreme(&self, pick: fn(&[usize]) -> usize, pick_attn: fn(&[i32]) -> Option<i32>) -> RegionConfig {
        let layer_num = pick(&self.layer_num);
        RegionConfig {
            embed_dim: pick(&self.embed_dim),
            layer_num,
            ffn_embed_dim: vec![pick(&self.ffn_embed_dim); layer_num],
            attention_heads: vec![pick(&self.attention_heads); layer_num],
            cross_attention_heads: if self.cross_attention_heads.is_empty() {
                Vec::new()
            } else {
                vec![pick(&self.cross_attention_heads); layer_num]
            },
            arbitrary_ende_attn: match pick_attn(&self.arbitrary_ende_attn) {
                Some(v) => vec![v; layer_num],
                None => Vec::new(),
            },
        }
    }
}

fn distinct<T: Ord + Copy>(values: &[T]) -> u128 {
    values.iter().copied().collect::<BTreeSet<T>>().len() as u128
}

fn min_choice(values: &[usize]) -> usize {
    values.iter().copied().min().unwrap_or(0)
}

fn max_choice(values: &[usize]) -> usize {
    values.iter().copied().max().unwrap_or(0)
}

/// Choices of one sampled region
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionConfig {
    pub embed_dim: usize,
    pub layer_num: usize,
    /// One entry per active layer
    pub ffn_embed_dim: Vec<usize>,
    /// One entry per active layer
    pub attention_heads: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cross_attention_heads: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arbitrary_ende_attn: Vec<i32>,
}

impl RegionConfig {
    /// Uniform region: every layer shares the same widths
    pub fn uniform(embed_dim: usize, layer_num: usize, ffn_embed_dim: usize, attention_heads: usize) -> Self {
        Self {
            embed_dim,
            layer_num,
            ffn_embed_dim: vec![ffn_embed_dim; layer_num],
            attention_heads: vec![attention_heads; layer_num],
            cross_attention_heads: Vec::new(),
            arbitrary_ende_attn: Vec::new(),
        }
    }

    /// Mean feed-forward width over active layers
    pub fn mean_ffn_embed_dim(&self) -> f64 {
        mean(&self.ffn_embed_dim)
    }

    /// Mean head count over active layers
    pub fn mean_attention_heads(&self) -> f64 {
        mean(&self.attention_heads)
    }
}

fn mean(values: &[usize]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<usize>() as f64 / values.len() as f64
}

/// A sampled architecture: one [`RegionConfig`] per structural region.
///
/// The canonical form is compact serde JSON. Regions live in a `BTreeMap` and struct
/// fields serialize in declaration order, so equal architectures always render to
/// equal strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchitectureConfig {
    regions: BTreeMap<Region, RegionConfig>,
}

impl ArchitectureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a region
    pub fn with_region(mut self, region: Region, config: RegionConfig) -> Self {
        self.regions.insert(region, config);
        self
    }

    pub fn region(&self, region: Region) -> Option<&RegionConfig> {
        self.regions.get(&region)
    }

    pub fn regions(&self) -> impl Iterator<Item = (&Region, &RegionConfig)> {
        self.regions.iter()
    }

    /// Deterministic string form used for deduplication, logging and checkpoints
    pub fn to_canonical_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl fmt::Display for ArchitectureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

/// Search space: discrete choices per region
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchSpace {
    pub regions: BTreeMap<Region, RegionSpace>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a region
    pub fn with_region(mut self, region: Region, space: RegionSpace) -> Self {
        self.regions.insert(region, space);
        self
    }

    /// Encoder-decoder space used for WMT-scale translation supernets
    pub fn translation_default() -> Self {
        Self::new()
            .with_region(
                Region::Encoder,
                RegionSpace::new(vec![640, 512], vec![6], vec![3072, 2048, 1024], vec![8, 4]),
            )
            .with_region(
                Region::Decoder,
                RegionSpace::new(
                    vec![640, 512],
                    vec![6, 5, 4, 3, 2, 1],
                    vec![3072, 2048, 1024],
                    vec![8, 4],
                )
                .with_cross_attention_heads(vec![8, 4])
                .with_arbitrary_ende_attn(vec![-1, 1, 2]),
            )
    }

    /// Look up a region the task needs
    pub fn region(&self, region: Region) -> Result<&RegionSpace> {
        self.regions
            .get(&region)
            .ok_or_else(|| KolosalError::ConfigError(format!("search space has no {} region", region)))
    }

    /// Validate every declared region
    pub fn validate(&self) -> Result<()> {
        if self.regions.is_empty() {
            return Err(KolosalError::ConfigError("search space has no regions".to_string()));
        }
        for (region, space) in &self.regions {
            space.validate(*region)?;
        }
        Ok(())
    }

    /// Number of distinct architectures a task can draw (saturating)
    pub fn cardinality(&self, task: &TaskKind) -> Result<u128> {
        let mut total = 1u128;
        for &region in task.regions() {
            total = total.saturating_mul(self.region(region)?.cardinality());
        }
        Ok(total)
    }

    /// Smallest choice on every dimension
    pub fn smallest(&self, task: &TaskKind) -> Result<ArchitectureConfig> {
        self.extreme(task, min_choice, |v| v.iter().copied().min())
    }

    /// Largest choice on every dimension
    pub fn largest(&self, task: &TaskKind) -> Result<ArchitectureConfig> {
        self.extreme(task, max_choice, |v| v.iter().copied().max())
    }

    fn extreme(
        &self,
        task: &TaskKind,
        pick: fn(&[usize]) -> usize,
        pick_attn: fn(&[i32]) -> Option<i32>,
    ) -> Result<ArchitectureConfig> {
        let mut config = ArchitectureConfig::new();
        for &region in task.regions() {
            config = config.with_region(region, self.region(region)?.extreme(pick, pick_attn));
        }
        Ok(config)
    }

    /// Whether `config` fits inside this space for `task`
    pub fn contains(&self, task: &TaskKind, config: &ArchitectureConfig) -> bool {
        self.validate_config(task, config).is_ok()
    }

    /// Check that `config` can be sliced out of a supernet built for this space.
    ///
    /// Every region the task needs must be present, per-layer lists must match the
    /// layer count, and no width may exceed the region's maximal choice.
    pub fn validate_config(&self, task: &TaskKind, config: &ArchitectureConfig) -> Result<()> {
        for &region in task.regions() {
            let space = self.region(region)?;
            let cfg = config
                .region(region)
                .ok_or_else(|| KolosalError::ConfigError(format!("architecture has no {} region", region)))?;

            check_bound(region, "embed_dim", cfg.embed_dim, space.max_embed_dim())?;
            check_bound(region, "layer_num", cfg.layer_num, space.max_layers())?;

            let lists = [
                ("ffn_embed_dim", cfg.ffn_embed_dim.len()),
                ("attention_heads", cfg.attention_heads.len()),
            ];
            for (name, len) in lists {
                if len != cfg.layer_num {
                    return Err(KolosalError::ConfigError(format!(
                        "{}.{} has {} entries for {} layers",
                        region, name, len, cfg.layer_num
                    )));
                }
            }
            for &ffn in &cfg.ffn_embed_dim {
                check_bound(region, "ffn_embed_dim", ffn, space.max_ffn_embed_dim())?;
            }
            for &heads in &cfg.attention_heads {
                check_bound(region, "attention_heads", heads, space.max_attention_heads())?;
            }
            if !space.cross_attention_heads.is_empty() {
                if cfg.cross_attention_heads.len() != cfg.layer_num {
                    return Err(KolosalError::ConfigError(format!(
                        "{}.cross_attention_heads has {} entries for {} layers",
                        region,
                        cfg.cross_attention_heads.len(),
                        cfg.layer_num
                    )));
                }
                for &heads in &cfg.cross_attention_heads {
                    check_bound(region, "cross_attention_heads", heads, space.max_cross_attention_heads())?;
                }
            }
        }
        Ok(())
    }
}

fn check_bound(region: Region, name: &str, value: usize, max: usize) -> Result<()> {
    if value == 0 || value > max {
        return Err(KolosalError::InvalidParameter {
            name: format!("{}.{}", region, name),
            value: value.to_string(),
            reason: format!("must be in 1..={}", max),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_space() -> SearchSpace {
        SearchSpace::new()
            .with_region(Region::Encoder, RegionSpace::new(vec![4, 8], vec![1, 2], vec![8, 16], vec![1, 2]))
            .with_region(Region::Decoder, RegionSpace::new(vec![4], vec![1], vec![8], vec![1, 2]))
    }

    fn translation() -> TaskKind {
        TaskKind::translation_wmt()
    }

    #[test]
    fn test_translation_default_is_valid() {
        let space = SearchSpace::translation_default();
        assert!(space.validate().is_ok());
        assert_eq!(space.region(Region::Decoder).unwrap().max_layers(), 6);
    }

    #[test]
    fn test_validate_rejects_empty_choices() {
        let space = SearchSpace::new().with_region(
            Region::Encoder,
            RegionSpace::new(vec![4], vec![], vec![8], vec![1]),
        );
        assert!(matches!(space.validate(), Err(KolosalError::ConfigError(_))));
        assert!(SearchSpace::new().validate().is_err());
    }

    #[test]
    fn test_cardinality() {
        let space = tiny_space();
        // encoder: 2 embeds * (4^1 + 4^2) = 40; decoder: 1 * 2^1 = 2
        assert_eq!(space.cardinality(&translation()).unwrap(), 80);
    }

    #[test]
    fn test_cardinality_saturates() {
        let space = SearchSpace::translation_default();
        assert!(space.cardinality(&translation()).unwrap() > 1_000_000);
    }

    #[test]
    fn test_smallest_and_largest() {
        let space = tiny_space();
        let small = space.smallest(&translation()).unwrap();
        let large = space.largest(&translation()).unwrap();

        let enc_small = small.region(Region::Encoder).unwrap();
        assert_eq!(enc_small.embed_dim, 4);
        assert_eq!(enc_small.layer_num, 1);
        assert_eq!(enc_small.ffn_embed_dim, vec![8]);

        let enc_large = large.region(Region::Encoder).unwrap();
        assert_eq!(enc_large.layer_num, 2);
        assert_eq!(enc_large.ffn_embed_dim, vec![16, 16]);
        assert_eq!(enc_large.attention_heads, vec![2, 2]);

        assert!(space.validate_config(&translation(), &small).is_ok());
        assert!(space.validate_config(&translation(), &large).is_ok());
    }

    #[test]
    fn test_validate_config_rejects_oversized() {
        let space = tiny_space();
        let mut config = space.largest(&translation()).unwrap();
        config = config.with_region(Region::Encoder, RegionConfig::uniform(16, 2, 16, 2));
        assert!(space.validate_config(&translation(), &config).is_err());

        let missing = ArchitectureConfig::new().with_region(Region::Encoder, RegionConfig::uniform(4, 1, 8, 1));
        assert!(space.validate_config(&translation(), &missing).is_err());
    }

    #[test]
    fn test_validate_config_rejects_ragged_layers() {
        let space = tiny_space();
        let mut enc = RegionConfig::uniform(4, 2, 8, 1);
        enc.attention_heads.pop();
        let config = space.smallest(&translation()).unwrap().with_region(Region::Encoder, enc);
        assert!(space.validate_config(&translation(), &config).is_err());
    }

    #[test]
    fn test_canonical_string_is_json() {
        let mut dec = RegionConfig::uniform(512, 2, 1024, 4);
        dec.cross_attention_heads = vec![4, 8];
        dec.arbitrary_ende_attn = vec![-1, 2];
        let config = ArchitectureConfig::new()
            .with_region(Region::Decoder, dec)
            .with_region(Region::Encoder, RegionConfig::uniform(640, 1, 3072, 8));

        let text = config.to_canonical_string().unwrap();
        assert!(text.starts_with("{\"encoder\":"));
        assert_eq!(
            text,
            "{\"encoder\":{\"embed_dim\":640,\"layer_num\":1,\"ffn_embed_dim\":[3072],\"attention_heads\":[8]},\
             \"decoder\":{\"embed_dim\":512,\"layer_num\":2,\"ffn_embed_dim\":[1024,1024],\"attention_heads\":[4,4],\
             \"cross_attention_heads\":[4,8],\"arbitrary_ende_attn\":[-1,2]}}"
        );

        let parsed: ArchitectureConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(serde_json::to_string(&config).unwrap(), text);
    }

    #[test]
    fn test_canonical_string_covers_every_field() {
        let base = RegionConfig::uniform(8, 2, 16, 2);
        let plain = ArchitectureConfig::new().with_region(Region::Decoder, base.clone());
        let crossed = ArchitectureConfig::new().with_region(
            Region::Decoder,
            RegionConfig {
                cross_attention_heads: vec![2, 2],
                ..base.clone()
            },
        );
        let ende = ArchitectureConfig::new().with_region(
            Region::Decoder,
            RegionConfig {
                arbitrary_ende_attn: vec![1, -1],
                ..base
            },
        );

        let keys: BTreeSet<String> = [&plain, &crossed, &ende]
            .iter()
            .map(|c| c.to_canonical_string().unwrap())
            .collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(crossed.to_string(), crossed.to_canonical_string().unwrap());
    }

    #[test]
    fn test_region_config_means() {
        let mut cfg = RegionConfig::uniform(8, 2, 16, 2);
        cfg.ffn_embed_dim = vec![8, 16];
        assert_eq!(cfg.mean_ffn_embed_dim(), 12.0);
        assert_eq!(cfg.mean_attention_heads(), 2.0);
    }
}
