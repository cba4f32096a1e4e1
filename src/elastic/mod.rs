//! Elastic parameter modules
//!
//! A structured layer owns one maximal-size weight tensor and exposes a family of
//! sub-tensors carved out of it:
//! - [`Conv2dSuper`] - 2D convolution over NCHW inputs
//! - [`LinearSuper`] - fully connected projection
//! - [`SuperNet`] - whole-model aggregate that broadcasts an architecture to every layer
//!
//! Every sub-shape is a prefix along the sliceable axes: a layer sampled at
//! `(in_dim, out_dim)` uses `weight[0..out_dim, 0..in_dim, ..]`. Channel order inside
//! the maximal tensor is therefore shared by every sub-network.

mod conv;
mod linear;
mod supernet;

pub use conv::{conv2d, Conv2dSuper, SampledConv};
pub use linear::{LinearSuper, SampledLinear};
pub use supernet::{DimSource, ElasticModel, LayerBinding, SuperNet};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{KolosalError, Result};

/// Requested sub-shape of an elastic layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleDims {
    /// Number of leading input channels/features used
    pub in_dim: usize,
    /// Number of leading output channels/features used
    pub out_dim: usize,
}

impl SampleDims {
    /// Create new sample dims
    pub fn new(in_dim: usize, out_dim: usize) -> Self {
        Self { in_dim, out_dim }
    }

    /// Check the dims against the maximal extent of a layer.
    ///
    /// Both bounds are inclusive; zero is never a valid width.
    pub fn check(&self, super_in_dim: usize, super_out_dim: usize) -> Result<()> {
        if self.in_dim == 0 || self.in_dim > super_in_dim {
            return Err(KolosalError::SampleDimOutOfRange {
                axis: "sample_in_dim",
                requested: self.in_dim,
                max: super_in_dim,
            });
        }
        if self.out_dim == 0 || self.out_dim > super_out_dim {
            return Err(KolosalError::SampleDimOutOfRange {
                axis: "sample_out_dim",
                requested: self.out_dim,
                max: super_out_dim,
            });
        }
        Ok(())
    }
}

/// Input extent a layer is profiled against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extent {
    /// Sequence of token positions
    Tokens(usize),
    /// Spatial feature map (height, width)
    Spatial(usize, usize),
}

impl Extent {
    /// Number of positions a position-wise projection is applied to
    pub fn positions(&self) -> usize {
        match *self {
            Extent::Tokens(n) => n,
            Extent::Spatial(h, w) => h * w,
        }
    }
}

/// Common interface of every elastic layer, used by the whole-model aggregate
pub trait ElasticLayer: Send {
    /// Maximal (input, output) extent
    fn super_dims(&self) -> (usize, usize);

    /// Activate a sub-shape, recomputing the cached slice
    fn set_sample_config(&mut self, sample_in_dim: usize, sample_out_dim: usize) -> Result<()>;

    /// Currently active dims, if any configuration was set
    fn sample_dims(&self) -> Option<SampleDims>;

    /// Element count of the cached slice (weight + bias)
    fn calc_sampled_param_num(&self) -> Result<usize>;

    /// Element count of the maximal tensors
    fn total_param_num(&self) -> usize;

    /// Toggle profiling mode
    fn profile(&mut self, mode: bool);

    fn is_profiling(&self) -> bool;

    /// Multiply-accumulate count of one forward pass over `extent`, and the output extent
    fn sampled_macs(&mut self, extent: Extent) -> Result<(u64, Extent)>;
}

/// Xavier/Glorot uniform bound for the given fan sizes
pub(crate) fn xavier_bound(fan_in: usize, fan_out: usize) -> f32 {
    (6.0 / (fan_in + fan_out).max(1) as f64).sqrt() as f32
}

/// Draw a Xavier-uniform value
pub(crate) fn xavier_sample(rng: &mut impl Rng, bound: f32) -> f32 {
    if bound <= 0.0 {
        return 0.0;
    }
    rng.gen_range(-bound..bound)
}
