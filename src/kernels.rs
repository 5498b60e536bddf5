//! CPU kernels for the tensor ops of the graph
//!
//! Images are laid out NHWC and convolution kernels HWIO, so the innermost
//! loops always run over a contiguous channel slice. Every kernel splits work
//! across samples (or rows) with rayon.

use rayon::prelude::*;

use crate::tensor::TensorError;

/// Geometry of a stride 1 convolution with `SAME` padding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub in_channels: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub out_channels: usize,
}

impl ConvGeometry {
    /// Validates an `[N, H, W, C]` input against an `[KH, KW, C, F]` kernel
    pub fn new(input: &[usize], kernel: &[usize]) -> Result<Self, TensorError> {
        let &[batch, height, width, in_channels] = input else {
            return Err(TensorError::RankMismatch {
                op: "conv2d",
                expected: 4,
                got: input.len(),
            });
        };
        let &[kernel_h, kernel_w, kernel_in, out_channels] = kernel else {
            return Err(TensorError::RankMismatch {
                op: "conv2d",
                expected: 4,
                got: kernel.len(),
            });
        };
        if kernel_in != in_channels {
            return Err(TensorError::ShapeMismatch {
                op: "conv2d",
                lhs: input.to_vec(),
                rhs: kernel.to_vec(),
            });
        }
        if [height, width, in_channels, kernel_h, kernel_w, out_channels].contains(&0) {
            return Err(TensorError::EmptyDimension {
                op: "conv2d",
                shape: kernel.to_vec(),
            });
        }
        Ok(Self {
            batch,
            height,
            width,
            in_channels,
            kernel_h,
            kernel_w,
            out_channels,
        })
    }

    /// Rows and columns of zero padding before the image, the rest goes after it
    pub fn pad_before(&self) -> (usize, usize) {
        ((self.kernel_h - 1) / 2, (self.kernel_w - 1) / 2)
    }

    pub fn output_shape(&self) -> Vec<usize> {
        vec![self.batch, self.height, self.width, self.out_channels]
    }

    fn in_sample_len(&self) -> usize {
        self.height * self.width * self.in_channels
    }

    fn out_sample_len(&self) -> usize {
        self.height * self.width * self.out_channels
    }

    fn kernel_len(&self) -> usize {
        self.kernel_h * self.kernel_w * self.in_channels * self.out_channels
    }

    /// Offset of the `[C, F]` kernel slab at `(kh, kw)`
    fn kernel_offset(&self, kh: usize, kw: usize) -> usize {
        (kh * self.kernel_w + kw) * self.in_channels * self.out_channels
    }
}

/// Input coordinate read by output `o` at kernel tap `k`, `None` inside the padding
fn input_coord(o: usize, k: usize, pad: usize, size: usize) -> Option<usize> {
    let i = (o + k).checked_sub(pad)?;
    (i < size).then_some(i)
}

pub fn conv2d_forward(input: &[f32], kernel: &[f32], g: &ConvGeometry) -> Vec<f32> {
    let (pad_h, pad_w) = g.pad_before();
    let (cin, cout) = (g.in_channels, g.out_channels);
    let mut output = vec![0.0; g.batch * g.out_sample_len()];

    output
        .par_chunks_mut(g.out_sample_len())
        .zip(input.par_chunks(g.in_sample_len()))
        .for_each(|(out, x)| {
            for oh in 0..g.height {
                for ow in 0..g.width {
                    let o = &mut out[(oh * g.width + ow) * cout..][..cout];
                    for kh in 0..g.kernel_h {
                        let Some(ih) = input_coord(oh, kh, pad_h, g.height) else {
                            continue;
                        };
                        for kw in 0..g.kernel_w {
                            let Some(iw) = input_coord(ow, kw, pad_w, g.width) else {
                                continue;
                            };
                            let xs = &x[(ih * g.width + iw) * cin..][..cin];
                            let k = &kernel[g.kernel_offset(kh, kw)..][..cin * cout];
                            for (c, &xv) in xs.iter().enumerate() {
                                let k_row = &k[c * cout..][..cout];
                                for (acc, &kv) in o.iter_mut().zip(k_row) {
                                    *acc += xv * kv;
                                }
                            }
                        }
                    }
                }
            }
        });
    output
}

/// Gradient of the loss with respect to the convolution kernel
pub fn conv2d_backward_kernel(input: &[f32], grad_out: &[f32], g: &ConvGeometry) -> Vec<f32> {
    let (pad_h, pad_w) = g.pad_before();
    let (cin, cout) = (g.in_channels, g.out_channels);
    let kernel_len = g.kernel_len();

    input
        .par_chunks(g.in_sample_len())
        .zip(grad_out.par_chunks(g.out_sample_len()))
        .fold(
            || vec![0.0; kernel_len],
            |mut acc, (x, go)| {
                for oh in 0..g.height {
                    for ow in 0..g.width {
                        let gs = &go[(oh * g.width + ow) * cout..][..cout];
                        for kh in 0..g.kernel_h {
                            let Some(ih) = input_coord(oh, kh, pad_h, g.height) else {
                                continue;
                            };
                            for kw in 0..g.kernel_w {
                                let Some(iw) = input_coord(ow, kw, pad_w, g.width) else {
                                    continue;
                                };
                                let xs = &x[(ih * g.width + iw) * cin..][..cin];
                                let acc_k = &mut acc[g.kernel_offset(kh, kw)..][..cin * cout];
                                for (c, &xv) in xs.iter().enumerate() {
                                    let row = &mut acc_k[c * cout..][..cout];
                                    for (a, &gv) in row.iter_mut().zip(gs) {
                                        *a += xv * gv;
                                    }
                                }
                            }
                        }
                    }
                }
                acc
            },
        )
        .reduce(|| vec![0.0; kernel_len], sum_into)
}

/// Gradient of the loss with respect to the convolution input
pub fn conv2d_backward_input(kernel: &[f32], grad_out: &[f32], g: &ConvGeometry) -> Vec<f32> {
    let (pad_h, pad_w) = g.pad_before();
    let (cin, cout) = (g.in_channels, g.out_channels);
    let mut grad_in = vec![0.0; g.batch * g.in_sample_len()];

    grad_in
        .par_chunks_mut(g.in_sample_len())
        .zip(grad_out.par_chunks(g.out_sample_len()))
        .for_each(|(gx, go)| {
            for oh in 0..g.height {
                for ow in 0..g.width {
                    let gs = &go[(oh * g.width + ow) * cout..][..cout];
                    for kh in 0..g.kernel_h {
                        let Some(ih) = input_coord(oh, kh, pad_h, g.height) else {
                            continue;
                        };
                        for kw in 0..g.kernel_w {
                            let Some(iw) = input_coord(ow, kw, pad_w, g.width) else {
                                continue;
                            };
                            let gxs = &mut gx[(ih * g.width + iw) * cin..][..cin];
                            let k = &kernel[g.kernel_offset(kh, kw)..][..cin * cout];
                            for (c, gxv) in gxs.iter_mut().enumerate() {
                                *gxv += dot(&k[c * cout..][..cout], gs);
                            }
                        }
                    }
                }
            }
        });
    grad_in
}

/// Geometry of a `VALID` pooling window sliding over an NHWC input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub window: [usize; 2],
    pub strides: [usize; 2],
}

impl PoolGeometry {
    pub fn new(
        input: &[usize],
        window: [usize; 2],
        strides: [usize; 2],
    ) -> Result<Self, TensorError> {
        let &[batch, height, width, channels] = input else {
            return Err(TensorError::RankMismatch {
                op: "avg_pool2d",
                expected: 4,
                got: input.len(),
            });
        };
        if [height, width, channels, window[0], window[1], strides[0], strides[1]].contains(&0) {
            return Err(TensorError::EmptyDimension {
                op: "avg_pool2d",
                shape: input.to_vec(),
            });
        }
        if window[0] > height || window[1] > width {
            return Err(TensorError::ShapeMismatch {
                op: "avg_pool2d",
                lhs: input.to_vec(),
                rhs: window.to_vec(),
            });
        }
        Ok(Self {
            batch,
            height,
            width,
            channels,
            window,
            strides,
        })
    }

    pub fn out_height(&self) -> usize {
        (self.height - self.window[0]) / self.strides[0] + 1
    }

    pub fn out_width(&self) -> usize {
        (self.width - self.window[1]) / self.strides[1] + 1
    }

    pub fn output_shape(&self) -> Vec<usize> {
        vec![self.batch, self.out_height(), self.out_width(), self.channels]
    }

    fn in_sample_len(&self) -> usize {
        self.height * self.width * self.channels
    }

    fn out_sample_len(&self) -> usize {
        self.out_height() * self.out_width() * self.channels
    }

    /// Input offsets covered by the window of output `(oh, ow)`
    fn window_offsets(&self, oh: usize, ow: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.window[0]).flat_map(move |i| {
            (0..self.window[1]).map(move |j| {
                let ih = oh * self.strides[0] + i;
                let iw = ow * self.strides[1] + j;
                (ih * self.width + iw) * self.channels
            })
        })
    }
}

pub fn avg_pool2d_forward(input: &[f32], g: &PoolGeometry) -> Vec<f32> {
    let c = g.channels;
    let scale = 1.0 / (g.window[0] * g.window[1]) as f32;
    let mut output = vec![0.0; g.batch * g.out_sample_len()];

    output
        .par_chunks_mut(g.out_sample_len())
        .zip(input.par_chunks(g.in_sample_len()))
        .for_each(|(out, x)| {
            for oh in 0..g.out_height() {
                for ow in 0..g.out_width() {
                    let o = &mut out[(oh * g.out_width() + ow) * c..][..c];
                    for offset in g.window_offsets(oh, ow) {
                        for (acc, &xv) in o.iter_mut().zip(&x[offset..offset + c]) {
                            *acc += xv;
                        }
                    }
                    o.iter_mut().for_each(|v| *v *= scale);
                }
            }
        });
    output
}

pub fn avg_pool2d_backward(grad_out: &[f32], g: &PoolGeometry) -> Vec<f32> {
    let c = g.channels;
    let scale = 1.0 / (g.window[0] * g.window[1]) as f32;
    let mut grad_in = vec![0.0; g.batch * g.in_sample_len()];

    grad_in
        .par_chunks_mut(g.in_sample_len())
        .zip(grad_out.par_chunks(g.out_sample_len()))
        .for_each(|(gx, go)| {
            for oh in 0..g.out_height() {
                for ow in 0..g.out_width() {
                    let gs = &go[(oh * g.out_width() + ow) * c..][..c];
                    for offset in g.window_offsets(oh, ow) {
                        for (acc, &gv) in gx[offset..offset + c].iter_mut().zip(gs) {
                            *acc += gv * scale;
                        }
                    }
                }
            }
        });
    grad_in
}

/// `[n, k] · [k, m]`
pub fn matmul_forward(a: &[f32], b: &[f32], k: usize, m: usize) -> Vec<f32> {
    let n = a.len() / k;
    let mut output = vec![0.0; n * m];
    output
        .par_chunks_mut(m)
        .zip(a.par_chunks(k))
        .for_each(|(row, a_row)| {
            for (kk, &av) in a_row.iter().enumerate() {
                for (o, &bv) in row.iter_mut().zip(&b[kk * m..][..m]) {
                    *o += av * bv;
                }
            }
        });
    output
}

/// `grad · bᵀ`, the gradient for the left operand
pub fn matmul_backward_lhs(b: &[f32], grad: &[f32], k: usize, m: usize) -> Vec<f32> {
    let n = grad.len() / m;
    let mut grad_a = vec![0.0; n * k];
    grad_a
        .par_chunks_mut(k)
        .zip(grad.par_chunks(m))
        .for_each(|(ga_row, g_row)| {
            for (kk, ga) in ga_row.iter_mut().enumerate() {
                *ga = dot(&b[kk * m..][..m], g_row);
            }
        });
    grad_a
}

/// `aᵀ · grad`, the gradient for the right operand
pub fn matmul_backward_rhs(a: &[f32], grad: &[f32], k: usize, m: usize) -> Vec<f32> {
    let n = grad.len() / m;
    let mut grad_b = vec![0.0; k * m];
    grad_b
        .par_chunks_mut(m)
        .enumerate()
        .for_each(|(kk, gb_row)| {
            for i in 0..n {
                let av = a[i * k + kk];
                if av == 0.0 {
                    continue;
                }
                for (gb, &gv) in gb_row.iter_mut().zip(&grad[i * m..][..m]) {
                    *gb += av * gv;
                }
            }
        });
    grad_b
}

/// Numerically stable `x - log(sum(exp(x)))` over each row of width `cols`
pub fn log_softmax_forward(x: &[f32], cols: usize) -> Vec<f32> {
    let mut output = x.to_vec();
    output.par_chunks_mut(cols).for_each(|row| {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
        row.iter_mut().for_each(|v| *v = (*v - max) - log_sum);
    });
    output
}

/// Takes the log-softmax output `y`; `dx = g - softmax(x) * sum(g)`
pub fn log_softmax_backward(y: &[f32], grad: &[f32], cols: usize) -> Vec<f32> {
    let mut grad_in = vec![0.0; y.len()];
    grad_in
        .par_chunks_mut(cols)
        .zip(y.par_chunks(cols).zip(grad.par_chunks(cols)))
        .for_each(|(gx, (y_row, g_row))| {
            let g_sum = g_row.iter().sum::<f32>();
            for ((o, &yv), &gv) in gx.iter_mut().zip(y_row).zip(g_row) {
                *o = gv - yv.exp() * g_sum;
            }
        });
    grad_in
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn sum_into(mut a: Vec<f32>, b: Vec<f32>) -> Vec<f32> {
    for (x, y) in a.iter_mut().zip(b) {
        *x += y;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_eq_float;

    #[test]
    fn test_conv_same_padding_shape() {
        let g = ConvGeometry::new(&[2, 5, 4, 3], &[3, 3, 3, 8]).unwrap();
        assert_eq!(g.output_shape(), vec![2, 5, 4, 8]);
        assert_eq!(g.pad_before(), (1, 1));

        let err = ConvGeometry::new(&[2, 5, 4, 3], &[3, 3, 2, 8]).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { op: "conv2d", .. }));
    }

    #[test]
    fn test_conv_forward_box_filter() {
        // 3x3 image of ones, 3x3 kernel of ones: each output counts its in-bounds neighbours
        let g = ConvGeometry::new(&[1, 3, 3, 1], &[3, 3, 1, 1]).unwrap();
        let out = conv2d_forward(&[1.0; 9], &[1.0; 9], &g);
        assert_eq!(out, vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
    }

    #[test]
    fn test_conv_forward_channels() {
        // 1x1 kernel mixes channels like a matmul on every pixel
        let g = ConvGeometry::new(&[1, 1, 2, 2], &[1, 1, 2, 3]).unwrap();
        let input = [1.0, 2.0, 3.0, 4.0];
        let kernel = [1.0, 0.0, 1.0, 0.0, 1.0, 1.0];
        let out = conv2d_forward(&input, &kernel, &g);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 3.0, 4.0, 7.0]);
    }

    #[test]
    fn test_conv_backward_box_filter() {
        let g = ConvGeometry::new(&[1, 3, 3, 1], &[3, 3, 1, 1]).unwrap();
        let grad_out = [1.0; 9];
        // every input pixel is read by as many outputs as it has in-bounds neighbours
        let gx = conv2d_backward_input(&[1.0; 9], &grad_out, &g);
        assert_eq!(gx, vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
        // kernel tap (kh, kw) sees a shifted window of the image
        let gk = conv2d_backward_kernel(&[1.0; 9], &grad_out, &g);
        assert_eq!(gk, vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
    }

    #[test]
    fn test_avg_pool() {
        let g = PoolGeometry::new(&[1, 4, 4, 1], [2, 2], [2, 2]).unwrap();
        assert_eq!(g.output_shape(), vec![1, 2, 2, 1]);
        let input = (0..16).map(|v| v as f32).collect::<Vec<_>>();
        let out = avg_pool2d_forward(&input, &g);
        assert_eq!(out, vec![2.5, 4.5, 10.5, 12.5]);

        let gx = avg_pool2d_backward(&[4.0, 8.0, 0.0, 0.0], &g);
        assert_eq!(&gx[..4], &[1.0, 1.0, 2.0, 2.0]);
        assert_eq!(&gx[12..], &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_avg_pool_odd_input_drops_border() {
        let g = PoolGeometry::new(&[1, 5, 5, 2], [2, 2], [2, 2]).unwrap();
        assert_eq!(g.output_shape(), vec![1, 2, 2, 2]);
        assert!(PoolGeometry::new(&[1, 1, 5, 2], [2, 2], [2, 2]).is_err());
    }

    #[test]
    fn test_matmul() {
        // [[1, 2], [3, 4]] · [[5, 6, 7], [8, 9, 10]]
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(
            matmul_forward(&a, &b, 2, 3),
            vec![21.0, 24.0, 27.0, 47.0, 54.0, 61.0]
        );

        let grad = [1.0; 6];
        assert_eq!(matmul_backward_lhs(&b, &grad, 2, 3), vec![18.0, 27.0, 18.0, 27.0]);
        assert_eq!(
            matmul_backward_rhs(&a, &grad, 2, 3),
            vec![4.0, 4.0, 4.0, 6.0, 6.0, 6.0]
        );
    }

    #[test]
    fn test_log_softmax() {
        let out = log_softmax_forward(&[1.0, 2.0, 1000.0, 1000.0], 2);
        assert_eq_float!(out[0], (0.2689414f32).ln());
        assert_eq_float!(out[1], (0.7310586f32).ln());
        // large logits must not overflow
        assert_eq_float!(out[2], -(2.0f32).ln());
        assert_eq_float!(out[3], -(2.0f32).ln());

        // gradient of a row sum of log-probabilities is 1 - n * softmax
        let gx = log_softmax_backward(&out[..2], &[1.0, 1.0], 2);
        assert_eq_float!(gx[0], 1.0 - 2.0 * 0.2689414);
        assert_eq_float!(gx[1], 1.0 - 2.0 * 0.7310586);
    }
}
