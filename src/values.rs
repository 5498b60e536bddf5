//! Tensor values which form a computation graph
use std::{
    cell::{Ref, RefCell},
    collections::HashSet,
    rc::Rc,
};

use rand::Rng;

use crate::{
    backprop_fns::{BackpropFunc, update_gradients},
    kernels::{self, ConvGeometry, PoolGeometry},
    tensor::{Tensor, TensorError},
};

type SharedValue = Rc<RefCell<InnerValue>>;

/// Newtype representing a shared tensor in a computation graph
///
/// Graphs are built per step and never cross threads; parameters travel between
/// steps (and devices) as plain [`Tensor`]s.
#[derive(Debug, Clone)]
pub struct Value(pub(crate) SharedValue);

impl Value {
    /// Create a trainable leaf whose gradient is tracked
    pub fn new(data: Tensor) -> Self {
        Self(Rc::new(RefCell::new(InnerValue::new(data, None, true))))
    }

    /// Create a leaf which never receives a gradient, e.g. a batch of images
    pub fn constant(data: Tensor) -> Self {
        Self(Rc::new(RefCell::new(InnerValue::new(data, None, false))))
    }

    /// Create a new value derived from an operation on other values (i.e. not a leaf node)
    fn new_derived(data: Tensor, backprop_fn: BackpropFunc) -> Self {
        Self(Rc::new(RefCell::new(InnerValue::new(
            data,
            Some(backprop_fn),
            false,
        ))))
    }

    fn add_child(&self, child: Value) {
        let child_requires_grad = child.requires_grad();
        let mut inner = self.0.borrow_mut();
        inner.requires_grad |= child_requires_grad;
        inner.children.push(child.0);
    }

    pub fn data(&self) -> Ref<'_, Tensor> {
        Ref::map(self.0.borrow(), |inner| &inner.data)
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.borrow().data.shape().to_vec()
    }

    /// Gradient accumulated by the last `backward`, `None` when nothing flowed into this node
    pub fn grad(&self) -> Option<Tensor> {
        self.0.borrow().grad.clone()
    }

    pub fn take_grad(&self) -> Option<Tensor> {
        self.0.borrow_mut().grad.take()
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    pub(crate) fn accumulate_grad(&self, grad: Tensor) {
        let mut inner = self.0.borrow_mut();
        match inner.grad.as_mut() {
            Some(existing) => {
                for (a, b) in existing.data_mut().iter_mut().zip(grad.data()) {
                    *a += b;
                }
            }
            None => inner.grad = Some(grad),
        }
    }

    /// Clears the gradients of this node and of every node it was computed from
    pub fn zero_grad(&mut self) {
        let mut order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();
        self.backward_inner(&mut order, &mut visited);
        for value in order {
            value.0.borrow_mut().grad = None;
        }
    }

    /// Backpropagates from this node, seeding it with a gradient of ones
    pub fn backward(&self) {
        let seed = Tensor::full(self.shape(), 1.0);
        self.0.borrow_mut().grad = Some(seed);

        let mut backprop_order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();

        // visit in post order
        self.backward_inner(&mut backprop_order, &mut visited);

        // apply backprop, reversed to start from root first
        for value in backprop_order.into_iter().rev() {
            let children = value
                .0
                .borrow()
                .children
                .iter()
                .map(|c| Value(c.clone()))
                .collect::<Vec<_>>();
            if children.is_empty() {
                continue;
            }
            if let Some(f) = value.0.borrow().backprop_fn.as_ref() {
                debug_assert!(f.n_operands() == children.len());
            }
            update_gradients(&children, &value);
        }
    }

    fn backward_inner(&self, backprop_order: &mut Vec<Value>, visited: &mut HashSet<u64>) {
        for c in self.0.borrow().children.iter() {
            if visited.contains(&c.borrow().id) {
                continue;
            }
            visited.insert(c.borrow().id);
            let value = Value(c.clone());
            value.backward_inner(backprop_order, visited);
        }
        backprop_order.push(self.clone());
    }
}

// Tensor operations building the graph
impl Value {
    /// `[n, k] · [k, m]`
    pub fn matmul(&self, other: &Value) -> Result<Value, TensorError> {
        let data = {
            let a = self.data();
            let b = other.data();
            let (&[n, k], &[k2, m]) = (a.shape(), b.shape()) else {
                return Err(TensorError::RankMismatch {
                    op: "matmul",
                    expected: 2,
                    got: if a.rank() != 2 { a.rank() } else { b.rank() },
                });
            };
            if k != k2 || k == 0 || m == 0 {
                return Err(TensorError::ShapeMismatch {
                    op: "matmul",
                    lhs: a.shape().to_vec(),
                    rhs: b.shape().to_vec(),
                });
            }
            Tensor::from_raw(vec![n, m], kernels::matmul_forward(a.data(), b.data(), k, m))
        };
        let result = Value::new_derived(data, BackpropFunc::MatMul);
        result.add_child(self.clone());
        result.add_child(other.clone());

        Ok(result)
    }

    /// Adds a `[F]` bias to every slice along the last axis
    pub fn add_bias(&self, bias: &Value) -> Result<Value, TensorError> {
        let data = {
            let x = self.data();
            let b = bias.data();
            if b.rank() != 1 || x.shape().last() != Some(&b.len()) || b.is_empty() {
                return Err(TensorError::ShapeMismatch {
                    op: "add_bias",
                    lhs: x.shape().to_vec(),
                    rhs: b.shape().to_vec(),
                });
            }
            let mut out = x.data().to_vec();
            for row in out.chunks_mut(b.len()) {
                for (o, bv) in row.iter_mut().zip(b.data()) {
                    *o += bv;
                }
            }
            Tensor::from_raw(x.shape().to_vec(), out)
        };
        let result = Value::new_derived(data, BackpropFunc::AddBias);
        result.add_child(self.clone());
        result.add_child(bias.clone());

        Ok(result)
    }

    /// Stride 1 convolution with `SAME` padding, `self` is `[N, H, W, C]` and `kernel` is `[KH, KW, C, F]`
    pub fn conv2d(&self, kernel: &Value) -> Result<Value, TensorError> {
        let (data, geometry) = {
            let x = self.data();
            let k = kernel.data();
            let geometry = ConvGeometry::new(x.shape(), k.shape())?;
            let out = kernels::conv2d_forward(x.data(), k.data(), &geometry);
            (Tensor::from_raw(geometry.output_shape(), out), geometry)
        };
        let result = Value::new_derived(data, BackpropFunc::Conv2d(geometry));
        result.add_child(self.clone());
        result.add_child(kernel.clone());

        Ok(result)
    }

    /// Average pooling without padding over `[N, H, W, C]`
    pub fn avg_pool2d(&self, window: [usize; 2], strides: [usize; 2]) -> Result<Value, TensorError> {
        let (data, geometry) = {
            let x = self.data();
            let geometry = PoolGeometry::new(x.shape(), window, strides)?;
            let out = kernels::avg_pool2d_forward(x.data(), &geometry);
            (Tensor::from_raw(geometry.output_shape(), out), geometry)
        };
        let result = Value::new_derived(data, BackpropFunc::AvgPool(geometry));
        result.add_child(self.clone());

        Ok(result)
    }

    pub fn relu(&self) -> Value {
        let data = {
            let x = self.data();
            let out = x.data().iter().map(|v| v.max(0.0)).collect();
            Tensor::from_raw(x.shape().to_vec(), out)
        };
        let result = Value::new_derived(data, BackpropFunc::ReLU);
        result.add_child(self.clone());

        result
    }

    pub fn reshape(&self, shape: Vec<usize>) -> Result<Value, TensorError> {
        let data = self.data().clone().reshape(shape)?;
        let result = Value::new_derived(data, BackpropFunc::Reshape);
        result.add_child(self.clone());

        Ok(result)
    }

    /// Collapses every axis but the first
    pub fn flatten(&self) -> Result<Value, TensorError> {
        let shape = self.shape();
        let Some((&batch, rest)) = shape.split_first() else {
            return Err(TensorError::RankMismatch {
                op: "flatten",
                expected: 1,
                got: 0,
            });
        };
        self.reshape(vec![batch, rest.iter().product()])
    }

    /// Log-probabilities over the last axis
    pub fn log_softmax(&self) -> Value {
        let data = {
            let x = self.data();
            let cols = x.shape().last().copied().unwrap_or(1);
            let out = if cols == 0 {
                vec![]
            } else {
                kernels::log_softmax_forward(x.data(), cols)
            };
            Tensor::from_raw(x.shape().to_vec(), out)
        };
        let result = Value::new_derived(data, BackpropFunc::LogSoftmax);
        result.add_child(self.clone());

        result
    }

    /// Mean negative log-likelihood of `labels` under `[B, K]` log-probabilities
    ///
    /// Equal to `-mean(sum(onehot(labels) * self, -1))`.
    pub fn nll_loss(&self, labels: &[u8]) -> Result<Value, TensorError> {
        let data = {
            let x = self.data();
            let &[batch, num_classes] = x.shape() else {
                return Err(TensorError::RankMismatch {
                    op: "nll_loss",
                    expected: 2,
                    got: x.rank(),
                });
            };
            if labels.len() != batch {
                return Err(TensorError::LabelCountMismatch {
                    expected: batch,
                    got: labels.len(),
                });
            }
            if let Some(&label) = labels.iter().find(|&&l| l as usize >= num_classes) {
                return Err(TensorError::LabelOutOfRange { label, num_classes });
            }
            let total = labels
                .iter()
                .enumerate()
                .map(|(i, &l)| x.data()[i * num_classes + l as usize])
                .sum::<f32>();
            Tensor::scalar(-total / batch.max(1) as f32)
        };
        let result = Value::new_derived(
            data,
            BackpropFunc::NllLoss {
                labels: labels.into(),
            },
        );
        result.add_child(self.clone());

        Ok(result)
    }
}

#[derive(Debug)]
pub(crate) struct InnerValue {
    pub(crate) data: Tensor,
    /// gradient of the graph output with respect to this value
    pub(crate) grad: Option<Tensor>,
    /// false for constants and for values computed only from constants
    pub(crate) requires_grad: bool,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    children: Vec<SharedValue>,
    /// Unique identifier for the node
    id: u64,
    /// The function which created this value from its children
    /// `None` when the value is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerValue {
    fn new(data: Tensor, backprop_fn: Option<BackpropFunc>, requires_grad: bool) -> Self {
        Self {
            data,
            grad: None,
            requires_grad,
            children: vec![],
            id: generate_random_id(),
            backprop_fn,
        }
    }
}

fn generate_random_id() -> u64 {
    let mut rng = rand::rng();
    rng.random() // generates a random u64
}
