//! Whole-model aggregate
//!
//! A [`SuperNet`] owns every elastic layer of a model together with a binding that
//! says which entries of an [`ArchitectureConfig`] fix its input and output widths.
//! Activating an architecture resolves every binding and broadcasts the result.

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::{Conv2dSuper, ElasticLayer, LinearSuper, SampleDims};
use crate::error::{KolosalError, Result};
use crate::nas::{ArchitectureConfig, DummyInput, Region, RegionConfig, SearchSpace};

/// Stride of the backbone stem convolution
const STEM_STRIDE: usize = 2;

/// Anything whose structured layers follow a sampled architecture
pub trait ElasticModel: Send {
    /// Broadcast the architecture to every elastic layer
    fn set_sample_config(&mut self, config: &ArchitectureConfig) -> Result<()>;

    /// Parameter count of the active sub-network
    fn calc_sampled_param_num(&self) -> Result<usize>;

    /// Toggle profiling mode on every layer
    fn profile(&mut self, mode: bool);
}

/// Where a layer width comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimSource {
    /// Never sampled
    Fixed(usize),
    /// Region embedding width
    EmbedDim,
    /// Feed-forward width of the bound layer
    FfnDim,
    /// Self-attention heads of the bound layer times `head_dim`
    Heads { head_dim: usize },
    /// Encoder-decoder attention heads of the bound layer times `head_dim`
    CrossHeads { head_dim: usize },
}

impl DimSource {
    fn resolve(&self, region: Region, config: &RegionConfig, layer: Option<usize>) -> Result<usize> {
        match *self {
            DimSource::Fixed(dim) => Ok(dim),
            DimSource::EmbedDim => Ok(config.embed_dim),
            DimSource::FfnDim => per_layer(region, "ffn_embed_dim", &config.ffn_embed_dim, layer),
            DimSource::Heads { head_dim } => {
                per_layer(region, "attention_heads", &config.attention_heads, layer).map(|h| h * head_dim)
            }
            DimSource::CrossHeads { head_dim } => {
                per_layer(region, "cross_attention_heads", &config.cross_attention_heads, layer)
                    .map(|h| h * head_dim)
            }
        }
    }
}

fn per_layer(region: Region, name: &str, values: &[usize], layer: Option<usize>) -> Result<usize> {
    let layer = layer.ok_or_else(|| {
        KolosalError::ConfigError(format!("{}.{} needs a layer index", region, name))
    })?;
    values.get(layer).copied().ok_or_else(|| {
        KolosalError::ConfigError(format!(
            "{}.{} has no entry for layer {}",
            region, name, layer
        ))
    })
}

/// Ties one elastic layer to the architecture entries that size it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerBinding {
    pub region: Region,
    /// Layer index inside the region; `None` for region-level layers such as a stem
    pub layer: Option<usize>,
    pub in_dim: DimSource,
    pub out_dim: DimSource,
}

impl LayerBinding {
    pub fn new(region: Region, layer: Option<usize>, in_dim: DimSource, out_dim: DimSource) -> Self {
        Self {
            region,
            layer,
            in_dim,
            out_dim,
        }
    }

    /// Dims under `config`, or `None` when the layer is beyond the sampled depth
    pub fn resolve(&self, config: &ArchitectureConfig) -> Result<Option<SampleDims>> {
        let region_config = config.region(self.region).ok_or_else(|| {
            KolosalError::ConfigError(format!("architecture has no {} region", self.region))
        })?;

        if let Some(layer) = self.layer {
            if layer >= region_config.layer_num {
                return Ok(None);
            }
        }

        let in_dim = self.in_dim.resolve(self.region, region_config, self.layer)?;
        let out_dim = self.out_dim.resolve(self.region, region_config, self.layer)?;
        Ok(Some(SampleDims::new(in_dim, out_dim)))
    }
}

struct BoundLayer {
    name: String,
    binding: LayerBinding,
    module: Box<dyn ElasticLayer>,
}

/// Named elastic layers sharing one sampled architecture
#[derive(Default)]
pub struct SuperNet {
    layers: Vec<BoundLayer>,
    /// Indices of the layers used by the last architecture, in order
    active: Vec<usize>,
    configured: bool,
}

impl fmt::Debug for SuperNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuperNet")
            .field("layers", &self.layers.iter().map(|l| &l.name).collect::<Vec<_>>())
            .field("active", &self.active.len())
            .finish()
    }
}

impl SuperNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer; layers are profiled in insertion order
    pub fn push(&mut self, name: impl Into<String>, binding: LayerBinding, module: impl ElasticLayer + 'static) {
        self.layers.push(BoundLayer {
            name: name.into(),
            binding,
            module: Box::new(module),
        });
        self.active.clear();
        self.configured = false;
    }

    /// Transformer supernet: per region and layer an attention output projection
    /// followed by the two feed-forward projections.
    pub fn transformer(space: &SearchSpace, head_dim: usize, seed: u64) -> Result<Self> {
        if head_dim == 0 {
            return Err(KolosalError::InvalidParameter {
                name: "head_dim".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        space.validate()?;

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut net = Self::new();

        for (&region, rs) in &space.regions {
            if region == Region::Backbone {
                continue;
            }
            let embed = rs.max_embed_dim();
            let ffn = rs.max_ffn_embed_dim();
            let attn = rs.max_attention_heads() * head_dim;

            for l in 0..rs.max_layers() {
                let prefix = format!("{}.layers.{}", region, l);
                net.push(
                    format!("{}.self_attn.out_proj", prefix),
                    LayerBinding::new(region, Some(l), DimSource::Heads { head_dim }, DimSource::EmbedDim),
                    LinearSuper::new(attn, embed, true, &mut rng)?,
                );
                if !rs.cross_attention_heads.is_empty() {
                    net.push(
                        format!("{}.encoder_attn.out_proj", prefix),
                        LayerBinding::new(region, Some(l), DimSource::CrossHeads { head_dim }, DimSource::EmbedDim),
                        LinearSuper::new(rs.max_cross_attention_heads() * head_dim, embed, true, &mut rng)?,
                    );
                }
                net.push(
                    format!("{}.fc1", prefix),
                    LayerBinding::new(region, Some(l), DimSource::EmbedDim, DimSource::FfnDim),
                    LinearSuper::new(embed, ffn, true, &mut rng)?,
                );
                net.push(
                    format!("{}.fc2", prefix),
                    LayerBinding::new(region, Some(l), DimSource::FfnDim, DimSource::EmbedDim),
                    LinearSuper::new(ffn, embed, true, &mut rng)?,
                );
            }
        }

        debug!(layers = net.len(), params = net.total_param_num(), "Built transformer supernet");
        Ok(net)
    }

    /// Convolutional supernet: a strided stem into the embedding width, then per layer
    /// a 1x1 expand to the feed-forward width and a 1x1 projection back.
    pub fn conv_backbone(space: &SearchSpace, in_channels: usize, kernel_size: usize, seed: u64) -> Result<Self> {
        space.validate()?;
        let rs = space.region(Region::Backbone)?;

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut net = Self::new();
        let embed = rs.max_embed_dim();
        let ffn = rs.max_ffn_embed_dim();

        net.push(
            "backbone.stem",
            LayerBinding::new(Region::Backbone, None, DimSource::Fixed(in_channels), DimSource::EmbedDim),
            Conv2dSuper::new(in_channels, embed, kernel_size, STEM_STRIDE, true, &mut rng)?,
        );
        for l in 0..rs.max_layers() {
            net.push(
                format!("backbone.layers.{}.expand", l),
                LayerBinding::new(Region::Backbone, Some(l), DimSource::EmbedDim, DimSource::FfnDim),
                Conv2dSuper::new(embed, ffn, 1, 1, false, &mut rng)?,
            );
            net.push(
                format!("backbone.layers.{}.project", l),
                LayerBinding::new(Region::Backbone, Some(l), DimSource::FfnDim, DimSource::EmbedDim),
                Conv2dSuper::new(ffn, embed, 1, 1, false, &mut rng)?,
            );
        }

        debug!(layers = net.len(), params = net.total_param_num(), "Built convolutional supernet");
        Ok(net)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer names in insertion order
    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|l| l.name.as_str())
    }

    /// Active dims of a named layer; `None` if unknown or inactive
    pub fn layer_dims(&self, name: &str) -> Option<SampleDims> {
        self.layers
            .iter()
            .position(|l| l.name == name)
            .filter(|i| self.active.contains(i))
            .and_then(|i| self.layers[i].module.sample_dims())
    }

    /// Number of layers used by the last architecture
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Element count of every maximal tensor
    pub fn total_param_num(&self) -> usize {
        self.layers.iter().map(|l| l.module.total_param_num()).sum()
    }

    /// Activate `config` and count its parameters
    pub fn sampled_param_count(&mut self, config: &ArchitectureConfig) -> Result<usize> {
        self.set_sample_config(config)?;
        self.calc_sampled_param_num()
    }

    /// Multiply-accumulate count of one forward pass of `config` over the dummy input.
    ///
    /// Profiling mode is switched on for the measurement and always switched off again.
    pub fn profile_macs(&mut self, config: &ArchitectureConfig, input: &DummyInput) -> Result<u64> {
        self.set_sample_config(config)?;
        self.profile(true);
        let result = self.thread_macs(input);
        self.profile(false);
        result
    }

    fn thread_macs(&mut self, input: &DummyInput) -> Result<u64> {
        let mut extent = input.extent();
        let mut total = 0u64;
        for &i in &self.active {
            let (macs, next) = self.layers[i].module.sampled_macs(extent)?;
            total = total.saturating_add(macs);
            extent = next;
        }
        Ok(total)
    }
}

impl ElasticModel for SuperNet {
    /// Resolves and range-checks every layer before touching any of them, so a
    /// rejected architecture leaves the previous one active.
    fn set_sample_config(&mut self, config: &ArchitectureConfig) -> Result<()> {
        let mut resolved = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            if let Some(dims) = layer.binding.resolve(config)? {
                let (super_in, super_out) = layer.module.super_dims();
                dims.check(super_in, super_out)?;
                resolved.push((i, dims));
            }
        }

        self.active.clear();
        for (i, dims) in resolved {
            self.layers[i].module.set_sample_config(dims.in_dim, dims.out_dim)?;
            self.active.push(i);
        }
        self.configured = true;
        Ok(())
    }

    fn calc_sampled_param_num(&self) -> Result<usize> {
        if !self.configured {
            return Err(KolosalError::NotSampled(
                "SuperNet has no active architecture".to_string(),
            ));
        }
        self.active
            .iter()
            .map(|&i| self.layers[i].module.calc_sampled_param_num())
            .sum()
    }

    fn profile(&mut self, mode: bool) {
        for layer in &mut self.layers {
            layer.module.profile(mode);
        }
    }
}
