//! Incremental gradient update functions for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph.

use std::rc::Rc;

use crate::{
    kernels::{self, ConvGeometry, PoolGeometry},
    tensor::Tensor,
    values::Value,
};

/// Represents the function in the computation graph
#[derive(Debug, Clone)]
pub enum BackpropFunc {
    MatMul,
    AddBias,
    Conv2d(ConvGeometry),
    AvgPool(PoolGeometry),
    ReLU,
    Reshape,
    LogSoftmax,
    NllLoss { labels: Rc<[u8]> },
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::MatMul => 2,
            BackpropFunc::AddBias => 2,
            BackpropFunc::Conv2d(_) => 2,
            BackpropFunc::AvgPool(_) => 1,
            BackpropFunc::ReLU => 1,
            BackpropFunc::Reshape => 1,
            BackpropFunc::LogSoftmax => 1,
            BackpropFunc::NllLoss { .. } => 1,
        }
    }
}

/// Represents backprop for the operation `a · b = out`
pub fn matmul(a: &Tensor, b: &Tensor, grad: &Tensor, needs: &[bool]) -> Vec<Option<Tensor>> {
    let (k, m) = (b.shape()[0], b.shape()[1]);
    let grad_a = needs[0].then(|| {
        Tensor::from_raw(
            a.shape().to_vec(),
            kernels::matmul_backward_lhs(b.data(), grad.data(), k, m),
        )
    });
    let grad_b = needs[1].then(|| {
        Tensor::from_raw(
            b.shape().to_vec(),
            kernels::matmul_backward_rhs(a.data(), grad.data(), k, m),
        )
    });
    vec![grad_a, grad_b]
}

/// Represents backprop for the operation `x + bias = out`, the bias broadcast over leading axes
pub fn add_bias(x: &Tensor, bias: &Tensor, grad: &Tensor, needs: &[bool]) -> Vec<Option<Tensor>> {
    let grad_x = needs[0].then(|| Tensor::from_raw(x.shape().to_vec(), grad.data().to_vec()));
    let grad_bias = needs[1].then(|| {
        let mut sum = vec![0.0; bias.len()];
        for row in grad.data().chunks(bias.len()) {
            for (s, g) in sum.iter_mut().zip(row) {
                *s += g;
            }
        }
        Tensor::from_raw(bias.shape().to_vec(), sum)
    });
    vec![grad_x, grad_bias]
}

/// Represents backprop for the operation `conv2d(x, kernel) = out`
pub fn conv2d(
    x: &Tensor,
    kernel: &Tensor,
    grad: &Tensor,
    geometry: &ConvGeometry,
    needs: &[bool],
) -> Vec<Option<Tensor>> {
    // the image batch feeding the first layer never needs this
    let grad_x = needs[0].then(|| {
        Tensor::from_raw(
            x.shape().to_vec(),
            kernels::conv2d_backward_input(kernel.data(), grad.data(), geometry),
        )
    });
    let grad_kernel = needs[1].then(|| {
        Tensor::from_raw(
            kernel.shape().to_vec(),
            kernels::conv2d_backward_kernel(x.data(), grad.data(), geometry),
        )
    });
    vec![grad_x, grad_kernel]
}

/// Represents backprop for the operation `avg_pool(x) = out`
pub fn avg_pool(x: &Tensor, grad: &Tensor, geometry: &PoolGeometry) -> Tensor {
    Tensor::from_raw(
        x.shape().to_vec(),
        kernels::avg_pool2d_backward(grad.data(), geometry),
    )
}

/// Represents backprop for the operation `relu(x) = out`
pub fn relu(x: &Tensor, grad: &Tensor) -> Tensor {
    let data = x
        .data()
        .iter()
        .zip(grad.data())
        .map(|(&v, &g)| if v > 0.0 { g } else { 0.0 })
        .collect();
    Tensor::from_raw(x.shape().to_vec(), data)
}

/// Represents backprop for the operation `reshape(x) = out`
pub fn reshape(x: &Tensor, grad: &Tensor) -> Tensor {
    Tensor::from_raw(x.shape().to_vec(), grad.data().to_vec())
}

/// Represents backprop for the operation `log_softmax(x) = out`
pub fn log_softmax(out: &Tensor, grad: &Tensor) -> Tensor {
    let cols = out.shape().last().copied().unwrap_or(1);
    let data = if cols == 0 {
        vec![]
    } else {
        kernels::log_softmax_backward(out.data(), grad.data(), cols)
    };
    Tensor::from_raw(out.shape().to_vec(), data)
}

/// Represents backprop for the operation `-mean(logp[i, labels[i]]) = out`
pub fn nll_loss(logp: &Tensor, labels: &[u8], grad: &Tensor) -> Tensor {
    let num_classes = logp.shape()[1];
    let upstream = grad.data()[0];
    let scale = -upstream / labels.len().max(1) as f32;
    let mut data = vec![0.0; logp.len()];
    for (i, &label) in labels.iter().enumerate() {
        data[i * num_classes + label as usize] = scale;
    }
    Tensor::from_raw(logp.shape().to_vec(), data)
}

/// Pushes the gradient of `out` into its inputs according to the op which created it
pub fn update_gradients(inputs: &[Value], out: &Value) {
    let grads = {
        let out_inner = out.0.borrow();
        let (Some(backprop_fn), Some(grad)) =
            (out_inner.backprop_fn.as_ref(), out_inner.grad.as_ref())
        else {
            return;
        };
        let inner = inputs.iter().map(|v| v.0.borrow()).collect::<Vec<_>>();
        let needs = inner.iter().map(|v| v.requires_grad).collect::<Vec<_>>();
        let data = inner.iter().map(|v| &v.data).collect::<Vec<_>>();
        match backprop_fn {
            BackpropFunc::MatMul => matmul(data[0], data[1], grad, &needs),
            BackpropFunc::AddBias => add_bias(data[0], data[1], grad, &needs),
            BackpropFunc::Conv2d(geometry) => conv2d(data[0], data[1], grad, geometry, &needs),
            BackpropFunc::AvgPool(geometry) => {
                vec![needs[0].then(|| avg_pool(data[0], grad, geometry))]
            }
            BackpropFunc::ReLU => vec![needs[0].then(|| relu(data[0], grad))],
            BackpropFunc::Reshape => vec![needs[0].then(|| reshape(data[0], grad))],
            BackpropFunc::LogSoftmax => {
                vec![needs[0].then(|| log_softmax(&out_inner.data, grad))]
            }
            BackpropFunc::NllLoss { labels } => {
                vec![needs[0].then(|| nll_loss(data[0], labels, grad))]
            }
        }
    };
    for (input, grad) in inputs.iter().zip(grads) {
        if let Some(grad) = grad {
            input.accumulate_grad(grad);
        }
    }
}
