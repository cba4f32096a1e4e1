//! Elastic 2D convolution
//!
//! `Conv2dSuper` keeps a `[super_out, super_in, kh, kw]` weight and convolves with a
//! prefix slice of it. Convolution is lowered to an im2col matrix multiplied by the
//! flattened sliced kernel.

use ndarray::{s, Array1, Array2, Array4, ArrayView1, ArrayView4};
use rand::Rng;

use super::{xavier_bound, xavier_sample, ElasticLayer, Extent, SampleDims};
use crate::error::{KolosalError, Result};

/// Sliced convolution parameters for one sub-shape
#[derive(Debug, Clone, PartialEq)]
pub struct SampledConv {
    /// Dims the slice was taken at
    pub dims: SampleDims,
    /// `[out_dim, in_dim, kh, kw]` prefix of the maximal weight
    pub weight: Array4<f32>,
    /// `[out_dim]` prefix of the maximal bias
    pub bias: Option<Array1<f32>>,
}

impl SampledConv {
    /// Number of elements held by this slice
    pub fn num_params(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len())
    }
}

/// 2D convolution whose channel widths can be sampled below the maximal extent
#[derive(Debug, Clone)]
pub struct Conv2dSuper {
    weight: Array4<f32>,
    bias: Option<Array1<f32>>,
    stride: usize,
    sample_dims: Option<SampleDims>,
    samples: Option<SampledConv>,
    profiling: bool,
    /// Set when the maximal tensors were handed out mutably after the last slice
    stale: bool,
    slices_computed: u64,
}

impl Conv2dSuper {
    /// Create a new layer with Xavier-uniform weights and zero bias.
    ///
    /// # Arguments
    /// * `super_in_dim` - Largest number of input channels any sub-network uses.
    /// * `super_out_dim` - Largest number of output channels any sub-network uses.
    /// * `kernel_size` - Square kernel side.
    /// * `stride` - Convolution stride, shared by every sub-network.
    /// * `bias` - Whether the layer carries a bias vector.
    pub fn new(
        super_in_dim: usize,
        super_out_dim: usize,
        kernel_size: usize,
        stride: usize,
        bias: bool,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if super_in_dim == 0 || super_out_dim == 0 || kernel_size == 0 {
            return Err(KolosalError::InvalidParameter {
                name: "Conv2dSuper dims".to_string(),
                value: format!("({}, {}, {})", super_in_dim, super_out_dim, kernel_size),
                reason: "channel counts and kernel size must be positive".to_string(),
            });
        }

        let receptive = kernel_size * kernel_size;
        let bound = xavier_bound(super_in_dim * receptive, super_out_dim * receptive);
        let weight = Array4::from_shape_simple_fn(
            (super_out_dim, super_in_dim, kernel_size, kernel_size),
            || xavier_sample(rng, bound),
        );
        let bias = bias.then(|| Array1::zeros(super_out_dim));

        Self::from_parts(weight, bias, stride)
    }

    /// Build a layer around existing maximal tensors
    pub fn from_parts(weight: Array4<f32>, bias: Option<Array1<f32>>, stride: usize) -> Result<Self> {
        if stride == 0 {
            return Err(KolosalError::InvalidParameter {
                name: "stride".to_string(),
                value: "0".to_string(),
                reason: "stride must be positive".to_string(),
            });
        }
        if let Some(b) = &bias {
            if b.len() != weight.dim().0 {
                return Err(KolosalError::ShapeError {
                    expected: format!("bias of length {}", weight.dim().0),
                    actual: format!("bias of length {}", b.len()),
                });
            }
        }

        Ok(Self {
            weight,
            bias,
            stride,
            sample_dims: None,
            samples: None,
            profiling: false,
            stale: false,
            slices_computed: 0,
        })
    }

    /// Largest input channel count
    pub fn super_in_dim(&self) -> usize {
        self.weight.dim().1
    }

    /// Largest output channel count
    pub fn super_out_dim(&self) -> usize {
        self.weight.dim().0
    }

    /// Kernel (height, width)
    pub fn kernel_size(&self) -> (usize, usize) {
        let (_, _, kh, kw) = self.weight.dim();
        (kh, kw)
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Maximal weight tensor
    pub fn weight(&self) -> &Array4<f32> {
        &self.weight
    }

    /// Maximal bias vector
    pub fn bias(&self) -> Option<&Array1<f32>> {
        self.bias.as_ref()
    }

    /// Mutable maximal weight, for in-place gradient updates.
    ///
    /// The cached slice is marked stale and re-sliced on its next use.
    pub fn weight_mut(&mut self) -> &mut Array4<f32> {
        self.stale = true;
        &mut self.weight
    }

    /// Mutable maximal bias; marks the cached slice stale
    pub fn bias_mut(&mut self) -> Option<&mut Array1<f32>> {
        self.stale = true;
        self.bias.as_mut()
    }

    /// Number of times a slice was materialized
    pub fn slices_computed(&self) -> u64 {
        self.slices_computed
    }

    /// Activate a sub-shape and return the freshly sliced parameters.
    ///
    /// Fails with [`KolosalError::SampleDimOutOfRange`] without touching the current
    /// configuration when either dim is zero or beyond the maximal extent.
    pub fn set_sample_config(&mut self, sample_in_dim: usize, sample_out_dim: usize) -> Result<&SampledConv> {
        let dims = SampleDims::new(sample_in_dim, sample_out_dim);
        dims.check(self.super_in_dim(), self.super_out_dim())?;

        self.sample_dims = Some(dims);
        let sliced = self.slice(dims);
        self.stale = false;
        let sampled: &SampledConv = self.samples.insert(sliced);
        Ok(sampled)
    }

    /// Return the cached slice, recomputing it first when `resample` is set, the layer
    /// is profiling, or the maximal tensors changed since it was taken.
    pub fn sample_parameters(&mut self, resample: bool) -> Result<&SampledConv> {
        self.refresh(resample)?;
        self.samples
            .as_ref()
            .ok_or_else(|| KolosalError::NotSampled("Conv2dSuper has no active configuration".to_string()))
    }

    /// Convolve `input` (`[batch, sample_in_dim, h, w]`) with the cached slice
    pub fn forward(&mut self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        self.refresh(false)?;
        let params = self
            .samples
            .as_ref()
            .ok_or_else(|| KolosalError::NotSampled("Conv2dSuper has no active configuration".to_string()))?;
        conv2d(input, params.weight.view(), params.bias.as_ref().map(|b| b.view()), self.stride)
    }

    /// Convolve with explicitly threaded parameters, independent of the cache
    pub fn forward_with(&self, params: &SampledConv, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        params.dims.check(self.super_in_dim(), self.super_out_dim())?;
        conv2d(input, params.weight.view(), params.bias.as_ref().map(|b| b.view()), self.stride)
    }

    /// Element count of the cached slice
    pub fn calc_sampled_param_num(&self) -> Result<usize> {
        self.samples
            .as_ref()
            .map(SampledConv::num_params)
            .ok_or_else(|| {
                KolosalError::NotSampled("calc_sampled_param_num called before set_sample_config".to_string())
            })
    }

    /// Output spatial size for an input of `h x w`
    pub fn output_hw(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        let (kh, kw) = self.kernel_size();
        if h < kh || w < kw {
            return Err(KolosalError::ShapeError {
                expected: format!("spatial size of at least {}x{}", kh, kw),
                actual: format!("{}x{}", h, w),
            });
        }
        Ok(((h - kh) / self.stride + 1, (w - kw) / self.stride + 1))
    }

    fn refresh(&mut self, force: bool) -> Result<()> {
        let dims = self
            .sample_dims
            .ok_or_else(|| KolosalError::NotSampled("Conv2dSuper has no active configuration".to_string()))?;

        if force || self.profiling || self.stale || self.samples.is_none() {
            self.samples = Some(self.slice(dims));
            self.stale = false;
        }
        Ok(())
    }

    fn slice(&mut self, dims: SampleDims) -> SampledConv {
        self.slices_computed += 1;
        let weight = self
            .weight
            .slice(s![..dims.out_dim, ..dims.in_dim, .., ..])
            .to_owned();
        let bias = self.bias.as_ref().map(|b| b.slice(s![..dims.out_dim]).to_owned());
        SampledConv { dims, weight, bias }
    }
}

impl ElasticLayer for Conv2dSuper {
    fn super_dims(&self) -> (usize, usize) {
        (self.super_in_dim(), self.super_out_dim())
    }

    fn set_sample_config(&mut self, sample_in_dim: usize, sample_out_dim: usize) -> Result<()> {
        Conv2dSuper::set_sample_config(self, sample_in_dim, sample_out_dim).map(|_| ())
    }

    fn sample_dims(&self) -> Option<SampleDims> {
        self.sample_dims
    }

    fn calc_sampled_param_num(&self) -> Result<usize> {
        Conv2dSuper::calc_sampled_param_num(self)
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
        let Extent::Spatial(h, w) = extent else {
            return Err(KolosalError::ShapeError {
                expected: "spatial input extent".to_string(),
                actual: format!("{:?}", extent),
            });
        };

        let (ho, wo) = self.output_hw(h, w)?;
        let (kh, kw) = self.kernel_size();
        let dims = self.sample_parameters(false)?.dims;
        let macs = (dims.out_dim * dims.in_dim * kh * kw * ho * wo) as u64;
        Ok((macs, Extent::Spatial(ho, wo)))
    }
}

/// Valid (unpadded) 2D cross-correlation of an NCHW batch.
///
/// `weight` is `[out, in, kh, kw]`; the input channel count must equal `in`.
pub fn conv2d(
    input: ArrayView4<f32>,
    weight: ArrayView4<f32>,
    bias: Option<ArrayView1<f32>>,
    stride: usize,
) -> Result<Array4<f32>> {
    let (batch, channels, h, w) = input.dim();
    let (out, cin, kh, kw) = weight.dim();

    if channels != cin {
        return Err(KolosalError::ShapeError {
            expected: format!("{} input channels", cin),
            actual: format!("{} input channels", channels),
        });
    }
    if stride == 0 {
        return Err(KolosalError::InvalidInput("stride must be positive".to_string()));
    }
    if h < kh || w < kw {
        return Err(KolosalError::ShapeError {
            expected: format!("spatial size of at least {}x{}", kh, kw),
            actual: format!("{}x{}", h, w),
        });
    }
    if let Some(b) = &bias {
        if b.len() != out {
            return Err(KolosalError::ShapeError {
                expected: format!("bias of length {}", out),
                actual: format!("bias of length {}", b.len()),
            });
        }
    }

    let ho = (h - kh) / stride + 1;
    let wo = (w - kw) / stride + 1;
    let patch = cin * kh * kw;

    let kernel = weight.to_shape((out, patch))?;
    let mut output = Array4::<f32>::zeros((batch, out, ho, wo));
    let mut cols = Array2::<f32>::zeros((patch, ho * wo));

    for b in 0..batch {
        for ci in 0..cin {
            for ki in 0..kh {
                for kj in 0..kw {
                    let row = (ci * kh + ki) * kw + kj;
                    for oi in 0..ho {
                        for oj in 0..wo {
                            cols[[row, oi * wo + oj]] = input[[b, ci, oi * stride + ki, oj * stride + kj]];
                        }
                    }
                }
            }
        }

        let mut result = kernel.dot(&cols);
        if let Some(bias) = &bias {
            for (mut row, &bv) in result.rows_mut().into_iter().zip(bias.iter()) {
                row += bv;
            }
        }

        let result = result.into_shape((out, ho, wo))?;
        output.slice_mut(s![b, .., .., ..]).assign(&result);
    }

    Ok(output)
}
