//! Hand-written building blocks for the engine: valid depthwise convolution,
//! max-pooling with arg-max bookkeeping, and the matching gradient helpers.
//!
//! Maps are stored as `[channel, row, column]` arrays; a single-channel image is
//! a `[row, column]` array.

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, Zip, s};

pub fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + f64::exp(-z))
}

pub fn relu(z: f64) -> f64 {
    if z > 0.0 { z } else { 0.0 }
}

/// Convolves a single-channel image with every kernel in `kernels`, one output
/// channel per kernel.
pub fn conv_image(
    image: ArrayView2<f64>,
    kernels: ArrayView3<f64>,
    bias: ArrayView1<f64>,
) -> Array3<f64> {
    stack_channels(kernels, bias, |_| image)
}

/// Convolves channel `f` of `maps` with kernel `f` only. No channel mixing.
pub fn conv_depthwise(
    maps: ArrayView3<f64>,
    kernels: ArrayView3<f64>,
    bias: ArrayView1<f64>,
) -> Array3<f64> {
    stack_channels(kernels, bias, |f| maps.index_axis_move(Axis(0), f))
}

fn stack_channels<'a, F>(kernels: ArrayView3<f64>, bias: ArrayView1<f64>, input: F) -> Array3<f64>
where
    F: Fn(usize) -> ArrayView2<'a, f64>,
{
    let (filters, kernel_height, kernel_width) = kernels.dim();
    let (input_height, input_width) = input(0).dim();
    let mut output = Array3::zeros((
        filters,
        input_height - kernel_height + 1,
        input_width - kernel_width + 1,
    ));

    for (f, mut channel) in output.outer_iter_mut().enumerate() {
        let kernel = kernels.index_axis(Axis(0), f);
        let source = input(f);
        for ((y, x), out) in channel.indexed_iter_mut() {
            let window = source.slice(s![y..y + kernel_height, x..x + kernel_width]);
            *out = Zip::from(&window)
                .and(&kernel)
                .fold(bias[f], |sum, &v, &k| sum + v * k);
        }
    }

    output
}

/// Gradient of one convolution's kernel: each tap correlates the output
/// gradient with the input shifted by that tap.
pub fn kernel_gradient(
    input: ArrayView2<f64>,
    output_grad: ArrayView2<f64>,
    kernel_size: usize,
) -> Array2<f64> {
    let (out_height, out_width) = output_grad.dim();
    Array2::from_shape_fn((kernel_size, kernel_size), |(ky, kx)| {
        let shifted = input.slice(s![ky..ky + out_height, kx..kx + out_width]);
        Zip::from(&output_grad)
            .and(&shifted)
            .fold(0.0, |sum, &g, &v| sum + g * v)
    })
}

/// Gradient with respect to a convolution's input. Every output gradient is
/// scattered back over its receptive field through the kernel as stored, so
/// `input_grad[y + ky, x + kx] += kernel[ky, kx] * output_grad[y, x]`. The kernel
/// is not flipped.
pub fn input_gradient(
    output_grad: ArrayView2<f64>,
    kernel: ArrayView2<f64>,
    input_dim: (usize, usize),
) -> Array2<f64> {
    let (out_height, out_width) = output_grad.dim();
    let mut input_grad = Array2::zeros(input_dim);
    for ((ky, kx), &weight) in kernel.indexed_iter() {
        input_grad
            .slice_mut(s![ky..ky + out_height, kx..kx + out_width])
            .scaled_add(weight, &output_grad);
    }
    input_grad
}

/// Output of [`max_pool`].
#[derive(Debug, Clone, PartialEq)]
pub struct Pooled {
    /// `[channel, pooled_row, pooled_column]` maxima.
    pub values: Array3<f64>,
    /// For every pooled value, in the same channel-major order, the flat
    /// standard-layout index of the winning element in the pooled input.
    pub argmax: Vec<usize>,
}

impl Pooled {
    /// Channel-major, row-major flattening of the pooled maps.
    pub fn flatten(&self) -> Array1<f64> {
        self.values.iter().copied().collect()
    }
}

/// Non-overlapping `pool x pool` max-pooling. Rows and columns past the last
/// whole window are dropped. Ties go to the first element in row-major order.
pub fn max_pool(maps: ArrayView3<f64>, pool: usize) -> Pooled {
    let (filters, height, width) = maps.dim();
    let (pooled_height, pooled_width) = (height / pool, width / pool);
    let mut values = Array3::zeros((filters, pooled_height, pooled_width));
    let mut argmax = Vec::with_capacity(values.len());

    for ((f, y, x), value) in values.indexed_iter_mut() {
        let (mut best, mut best_index) = (f64::NEG_INFINITY, None);
        for py in 0..pool {
            for px in 0..pool {
                let (iy, ix) = (y * pool + py, x * pool + px);
                let v = maps[[f, iy, ix]];
                if best_index.is_none() || v > best {
                    best = v;
                    best_index = Some((f * height + iy) * width + ix);
                }
            }
        }
        *value = best;
        argmax.extend(best_index);
    }

    Pooled { values, argmax }
}

/// Routes gradients of the flattened pooled vector back to the winning
/// positions recorded by [`max_pool`]. Every other position gets zero.
pub fn unpool(
    pooled_grad: ArrayView1<f64>,
    argmax: &[usize],
    dim: (usize, usize, usize),
) -> Array3<f64> {
    let (_, height, width) = dim;
    let plane = height * width;
    let mut grad = Array3::zeros(dim);
    for (&g, &index) in pooled_grad.iter().zip(argmax) {
        grad[[index / plane, (index % plane) / width, index % width]] += g;
    }
    grad
}
