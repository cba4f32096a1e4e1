//! Elastic fully connected layer

use ndarray::{s, Array1, Array2, ArrayView2};
use rand::Rng;

use super::{xavier_bound, xavier_sample, ElasticLayer, Extent, SampleDims};
use crate::error::{KolosalError, Result};

/// Sliced projection parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SampledLinear {
    pub dims: SampleDims,
    /// `[out_dim, in_dim]`
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl SampledLinear {
    pub fn num_params(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len())
    }
}

/// Linear projection `y = x W^T + b` with sampled input/output widths
#[derive(Debug, Clone)]
pub struct LinearSuper {
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
    sample_dims: Option<SampleDims>,
    samples: Option<SampledLinear>,
    profiling: bool,
    stale: bool,
}

impl LinearSuper {
    /// Create a new layer with Xavier-uniform weights and zero bias
    pub fn new(super_in_dim: usize, super_out_dim: usize, bias: bool, rng: &mut impl Rng) -> Result<Self> {
        if super_in_dim == 0 || super_out_dim == 0 {
            return Err(KolosalError::InvalidParameter {
                name: "LinearSuper dims".to_string(),
                value: format!("({}, {})", super_in_dim, super_out_dim),
                reason: "feature counts must be positive".to_string(),
            });
        }

        let bound = xavier_bound(super_in_dim, super_out_dim);
        let weight = Array2::from_shape_simple_fn((super_out_dim, super_in_dim), || xavier_sample(rng, bound));
        let bias = bias.then(|| Array1::zeros(super_out_dim));

        Self::from_parts(weight, bias)
    }

    pub fn from_parts(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Result<Self> {
        if let Some(b) = &bias {
            if b.len() != weight.nrows() {
                return Err(KolosalError::ShapeError {
                    expected: format!("bias of length {}", weight.nrows()),
                    actual: format!("bias of length {}", b.len()),
                });
            }
        }

        Ok(Self {
            weight,
            bias,
            sample_dims: None,
            samples: None,
            profiling: false,
            stale: false,
        })
    }

    pub fn super_in_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn super_out_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    /// Mutable maximal weight; marks the cached slice stale
    pub fn weight_mut(&mut self) -> &mut Array2<f32> {
        self.stale = true;
        &mut self.weight
    }

    /// Activate a sub-shape and return the freshly sliced parameters
    pub fn set_sample_config(&mut self, sample_in_dim: usize, sample_out_dim: usize) -> Result<&SampledLinear> {
        let dims = SampleDims::new(sample_in_dim, sample_out_dim);
        dims.check(self.super_in_dim(), self.super_out_dim())?;

        self.sample_dims = Some(dims);
        let sliced = self.slice(dims);
        self.stale = false;
        let sampled: &SampledLinear = self.samples.insert(sliced);
        Ok(sampled)
    }

    pub fn sample_parameters(&mut self, resample: bool) -> Result<&SampledLinear> {
        self.refresh(resample)?;
        self.samples
            .as_ref()
            .ok_or_else(|| KolosalError::NotSampled("LinearSuper has no active configuration".to_string()))
    }

    /// Project `input` (`[batch, sample_in_dim]`) with the cached slice
    pub fn forward(&mut self, input: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.refresh(false)?;
        let params = self
            .samples
            .as_ref()
            .ok_or_else(|| KolosalError::NotSampled("LinearSuper has no active configuration".to_string()))?;
        project(input, params)
    }

    pub fn forward_with(&self, params: &SampledLinear, input: ArrayView2<f32>) -> Result<Array2<f32>> {
        params.dims.check(self.super_in_dim(), self.super_out_dim())?;
        project(input, params)
    }

    pub fn calc_sampled_param_num(&self) -> Result<usize> {
        self.samples
            .as_ref()
            .map(SampledLinear::num_params)
            .ok_or_else(|| {
                KolosalError::NotSampled("calc_sampled_param_num called before set_sample_config".to_string())
            })
    }

    fn refresh(&mut self, force: bool) -> Result<()> {
        let dims = self
            .sample_dims
            .ok_or_else(|| KolosalError::NotSampled("LinearSuper has no active configuration".to_string()))?;

        if force || self.profiling || self.stale || self.samples.is_none() {
            self.samples = Some(self.slice(dims));
            self.stale = false;
        }
        Ok(())
    }

    fn slice(&self, dims: SampleDims) -> SampledLinear {
        SampledLinear {
            dims,
            weight: self.weight.slice(s![..dims.out_dim, ..dims.in_dim]).to_owned(),
            bias: self.bias.as_ref().map(|b| b.slice(s![..dims.out_dim]).to_owned()),
        }
    }
}

fn project(input: ArrayView2<f32>, params: &SampledLinear) -> Result<Array2<f32>> {
    if input.ncols() != params.dims.in_dim {
        return Err(KolosalError::ShapeError {
            expected: format!("{} input features", params.dims.in_dim),
            actual: format!("{} input features", input.ncols()),
        });
    }

    let mut output = input.dot(&params.weight.t());
    if let Some(bias) = &params.bias {
        output += bias;
    }
    Ok(output)
}

impl ElasticLayer for LinearSuper {
    fn super_dims(&self) -> (usize, usize) {
        (self.super_in_dim(), self.super_out_dim())
    }

    fn set_sample_config(&mut self, sample_in_dim: usize, sample_out_dim: usize) -> Result<()> {
        LinearSuper::set_sample_config(self, sample_in_dim, sample_out_dim).map(|_| ())
    }

    fn sample_dims(&self) -> Option<SampleDims> {
        self.sample_dims
    }

    fn calc_sampled_param_num(&self) -> Result<usize> {
        LinearSuper::calc_sampled_param_num(self)
    }

    fn total_param_num(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len())
    }

    fn profile(&mut self, mode: bool) {
        self.profiling = mode;
    }

    fn is_profiling(&self) -> bool {
        self.profiling
    }

    fn sampled_macs(&mut self, extent: Extent) -> Result<(u64, Extent)> {
        let dims = self.sample_parameters(false)?.dims;
        let macs = (dims.in_dim * dims.out_dim * extent.positions()) as u64;
        Ok((macs, extent))
    }
}
