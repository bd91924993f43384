//! Inference-only building blocks of the learned parts of the network.
//!
//! All convolutions are stride 1 with "same" zero padding, which is the only form the
//! cascade uses. Parameters are either drawn from a seeded generator with the usual
//! fan-in scaled uniform initialization or loaded from existing arrays.

use crate::error::ensure_shape;
use crate::{MvsError, Result};
use ndarray::{s, Array, Array1, Array4, Array5, ArrayView4, ArrayView5, Dimension, ShapeBuilder};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

/// Uniform in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.
fn fan_in_uniform<Sh, D, R>(shape: Sh, fan_in: usize, rng: &mut R) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng + ?Sized,
{
    let bound = (fan_in.max(1) as f32).sqrt().recip();
    let dist = Uniform::new_inclusive(-bound, bound);
    Array::from_shape_simple_fn(shape, || dist.sample(&mut *rng))
}

/// Range of output positions whose input tap at kernel offset `k` is inside the input,
/// and the first input position read.
#[inline]
fn overlap(len: usize, k: usize, pad: usize) -> Option<(usize, usize, usize)> {
    let shift = k as isize - pad as isize;
    let start = (-shift).max(0);
    let end = (len as isize).min(len as isize - shift);
    if end <= start {
        None
    } else {
        Some((start as usize, end as usize, (start + shift) as usize))
    }
}

fn check_kernel(what: &'static str, k: usize, k2: usize) -> Result<()> {
    if k % 2 == 1 && k == k2 {
        Ok(())
    } else {
        Err(MvsError::InvalidConfig(format!(
            "{} kernels must be square with odd size, got {}x{}",
            what, k, k2
        )))
    }
}

/// 2d convolution over `(B, C, H, W)` tensors.
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// `(out, in, k, k)`
    weight: Array4<f32>,
    bias: Option<Array1<f32>>,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        let fan_in = in_channels * kernel * kernel;
        let weight = fan_in_uniform((out_channels, in_channels, kernel, kernel), fan_in, rng);
        let bias = bias.then(|| fan_in_uniform(out_channels, fan_in, rng));
        Self { weight, bias }
    }

    pub fn from_weights(weight: Array4<f32>, bias: Option<Array1<f32>>) -> Result<Self> {
        let (out_c, _, k, k2) = weight.dim();
        check_kernel("conv2d", k, k2)?;
        if let Some(bias) = &bias {
            ensure_shape("conv2d bias", &[out_c], bias.shape())?;
        }
        Ok(Self { weight, bias })
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    pub fn forward(&self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (batch, channels, height, width) = input.dim();
        let (out_c, in_c, k, _) = self.weight.dim();
        ensure_shape("conv2d input channels", &[in_c], &[channels])?;
        let pad = k / 2;
        let mut out = Array4::zeros((batch, out_c, height, width));
        for b in 0..batch {
            for o in 0..out_c {
                let mut plane = out.slice_mut(s![b, o, .., ..]);
                if let Some(bias) = &self.bias {
                    plane.fill(bias[o]);
                }
                for i in 0..in_c {
                    let src = input.slice(s![b, i, .., ..]);
                    for ky in 0..k {
                        let (y0, y1, sy) = match overlap(height, ky, pad) {
                            Some(r) => r,
                            None => continue,
                        };
                        for kx in 0..k {
                            let w = self.weight[[o, i, ky, kx]];
                            if w == 0.0 {
                                continue;
                            }
                            if let Some((x0, x1, sx)) = overlap(width, kx, pad) {
                                plane.slice_mut(s![y0..y1, x0..x1]).scaled_add(
                                    w,
                                    &src.slice(s![sy..sy + (y1 - y0), sx..sx + (x1 - x0)]),
                                );
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Batch normalization with frozen statistics.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    scale: Array1<f32>,
    shift: Array1<f32>,
}

impl BatchNorm2d {
    const EPS: f32 = 1e-5;

    /// Unit scale, zero shift, zero mean and unit variance.
    pub fn new(channels: usize) -> Self {
        Self {
            scale: Array1::from_elem(channels, (1.0 + Self::EPS).sqrt().recip()),
            shift: Array1::zeros(channels),
        }
    }

    pub fn from_parts(
        gamma: Array1<f32>,
        beta: Array1<f32>,
        running_mean: Array1<f32>,
        running_var: Array1<f32>,
    ) -> Result<Self> {
        let n = gamma.len();
        ensure_shape("batch norm beta", &[n], beta.shape())?;
        ensure_shape("batch norm mean", &[n], running_mean.shape())?;
        ensure_shape("batch norm variance", &[n], running_var.shape())?;
        let scale = &gamma / &running_var.mapv(|v| (v + Self::EPS).sqrt());
        let shift = &beta - &(&running_mean * &scale);
        Ok(Self { scale, shift })
    }

    pub fn forward_inplace(&self, x: &mut Array4<f32>) -> Result<()> {
        ensure_shape("batch norm channels", &[self.scale.len()], &[x.dim().1])?;
        for mut sample in x.outer_iter_mut() {
            for (c, mut plane) in sample.outer_iter_mut().enumerate() {
                let (scale, shift) = (self.scale[c], self.shift[c]);
                plane.mapv_inplace(|v| v * scale + shift);
            }
        }
        Ok(())
    }
}

/// 3x3 convolution without bias, batch normalization and ReLU.
#[derive(Debug, Clone)]
pub struct ConvBnRelu {
    conv: Conv2d,
    bn: BatchNorm2d,
}

impl ConvBnRelu {
    pub fn new<R: Rng + ?Sized>(in_channels: usize, out_channels: usize, rng: &mut R) -> Self {
        Self {
            conv: Conv2d::new(in_channels, out_channels, 3, false, rng),
            bn: BatchNorm2d::new(out_channels),
        }
    }

    pub fn from_parts(conv: Conv2d, bn: BatchNorm2d) -> Self {
        Self { conv, bn }
    }

    pub fn in_channels(&self) -> usize {
        self.conv.in_channels()
    }

    pub fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }

    pub fn forward(&self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut x = self.conv.forward(input)?;
        self.bn.forward_inplace(&mut x)?;
        x.mapv_inplace(|v| v.max(0.0));
        Ok(x)
    }
}

/// 3d convolution over `(B, C, D, H, W)` volumes.
#[derive(Debug, Clone)]
pub struct Conv3d {
    /// `(out, in, k, k, k)`
    weight: Array5<f32>,
    bias: Option<Array1<f32>>,
}

impl Conv3d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        let fan_in = in_channels * kernel * kernel * kernel;
        let weight = fan_in_uniform(
            (out_channels, in_channels, kernel, kernel, kernel),
            fan_in,
            rng,
        );
        let bias = bias.then(|| fan_in_uniform(out_channels, fan_in, rng));
        Self { weight, bias }
    }

    pub fn from_weights(weight: Array5<f32>, bias: Option<Array1<f32>>) -> Result<Self> {
        let (out_c, _, k, k2, k3) = weight.dim();
        check_kernel("conv3d", k, k2)?;
        check_kernel("conv3d", k, k3)?;
        if let Some(bias) = &bias {
            ensure_shape("conv3d bias", &[out_c], bias.shape())?;
        }
        Ok(Self { weight, bias })
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn forward(&self, input: ArrayView5<f32>) -> Result<Array5<f32>> {
        let (batch, channels, depth, height, width) = input.dim();
        let (out_c, in_c, k, _, _) = self.weight.dim();
        ensure_shape("conv3d input channels", &[in_c], &[channels])?;
        let pad = k / 2;
        let mut out = Array5::zeros((batch, out_c, depth, height, width));
        for b in 0..batch {
            for o in 0..out_c {
                let mut volume = out.slice_mut(s![b, o, .., .., ..]);
                if let Some(bias) = &self.bias {
                    volume.fill(bias[o]);
                }
                for i in 0..in_c {
                    let src = input.slice(s![b, i, .., .., ..]);
                    for kd in 0..k {
                        let (d0, d1, sd) = match overlap(depth, kd, pad) {
                            Some(r) => r,
                            None => continue,
                        };
                        for ky in 0..k {
                            let (y0, y1, sy) = match overlap(height, ky, pad) {
                                Some(r) => r,
                                None => continue,
                            };
                            for kx in 0..k {
                                let w = self.weight[[o, i, kd, ky, kx]];
                                if w == 0.0 {
                                    continue;
                                }
                                if let Some((x0, x1, sx)) = overlap(width, kx, pad) {
                                    volume.slice_mut(s![d0..d1, y0..y1, x0..x1]).scaled_add(
                                        w,
                                        &src.slice(s![
                                            sd..sd + (d1 - d0),
                                            sy..sy + (y1 - y0),
                                            sx..sx + (x1 - x0)
                                        ]),
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}
