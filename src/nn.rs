//! Components to build a neural network
//!
//! Layers are declared once and stay immutable; [`Module::init_by_shape`]
//! creates their parameters from an input shape and [`Module::apply`] runs
//! them on graph values holding those parameters.

use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};
use thiserror::Error;

use crate::{
    params::Params,
    tensor::{Tensor, TensorError},
    values::Value,
};

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("{layer} expects a rank {expected} input, got shape {got:?}")]
    InputRankMismatch {
        layer: &'static str,
        expected: usize,
        got: Vec<usize>,
    },
    #[error("Expected {expected} parameters, got {got}")]
    ParamCountMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// A layer or a composition of layers. NNs should implement this trait.
pub trait Module: Send + Sync {
    /// Name used for parameter paths, e.g. `Conv` in `Conv_0/kernel`
    fn name(&self) -> &'static str;

    /// Names of the parameters this module owns, in the order `apply` expects them
    fn param_names(&self) -> &'static [&'static str] {
        &[]
    }

    /// Creates parameters for an input of `input_shape`, returns the output shape with them
    fn init_by_shape(
        &self,
        input_shape: &[usize],
        rng: &mut dyn RngCore,
    ) -> Result<(Vec<usize>, Vec<Tensor>), NNError>;

    fn apply(&self, params: &[Value], x: &Value) -> Result<Value, NNError>;
}

fn check_param_count(module: &dyn Module, params: &[Value]) -> Result<(), NNError> {
    let expected = module.param_names().len();
    if params.len() != expected {
        return Err(NNError::ParamCountMismatch {
            expected,
            got: params.len(),
        });
    }
    Ok(())
}

/// LeCun normal initialization, a normal truncated at two standard deviations with variance `1 / fan_in`
///
/// Keeps the variance of each layer's output close to its input's, so activations
/// neither explode nor vanish through the stack.
fn lecun_normal(shape: Vec<usize>, fan_in: usize, rng: &mut dyn RngCore) -> Tensor {
    // std of a unit normal truncated to [-2, 2]
    const TRUNCATED_STD: f32 = 0.879_625_7;
    let std = (1.0 / fan_in.max(1) as f32).sqrt() / TRUNCATED_STD;
    let len = shape.iter().product();
    let data = (0..len)
        .map(|_| loop {
            let z: f32 = StandardNormal.sample(&mut *rng);
            if z.abs() <= 2.0 {
                break z * std;
            }
        })
        .collect();
    Tensor::from_raw(shape, data)
}

/// 2D convolution with `SAME` padding and stride 1, followed by a bias
pub struct Conv {
    pub features: usize,
    pub kernel_size: [usize; 2],
}

impl Conv {
    pub fn new(features: usize, kernel_size: [usize; 2]) -> Self {
        Self {
            features,
            kernel_size,
        }
    }
}

impl Module for Conv {
    fn name(&self) -> &'static str {
        "Conv"
    }

    fn param_names(&self) -> &'static [&'static str] {
        &["kernel", "bias"]
    }

    fn init_by_shape(
        &self,
        input_shape: &[usize],
        rng: &mut dyn RngCore,
    ) -> Result<(Vec<usize>, Vec<Tensor>), NNError> {
        let &[batch, height, width, channels] = input_shape else {
            return Err(NNError::InputRankMismatch {
                layer: self.name(),
                expected: 4,
                got: input_shape.to_vec(),
            });
        };
        let [kh, kw] = self.kernel_size;
        let kernel = lecun_normal(vec![kh, kw, channels, self.features], kh * kw * channels, rng);
        let bias = Tensor::zeros(vec![self.features]);
        Ok((vec![batch, height, width, self.features], vec![kernel, bias]))
    }

    fn apply(&self, params: &[Value], x: &Value) -> Result<Value, NNError> {
        check_param_count(self, params)?;
        Ok(x.conv2d(&params[0])?.add_bias(&params[1])?)
    }
}

/// Fully connected layer over the last axis of a `[B, F]` input
pub struct Dense {
    pub features: usize,
}

impl Dense {
    pub fn new(features: usize) -> Self {
        Self { features }
    }
}

impl Module for Dense {
    fn name(&self) -> &'static str {
        "Dense"
    }

    fn param_names(&self) -> &'static [&'static str] {
        &["kernel", "bias"]
    }

    fn init_by_shape(
        &self,
        input_shape: &[usize],
        rng: &mut dyn RngCore,
    ) -> Result<(Vec<usize>, Vec<Tensor>), NNError> {
        let &[batch, in_features] = input_shape else {
            return Err(NNError::InputRankMismatch {
                layer: self.name(),
                expected: 2,
                got: input_shape.to_vec(),
            });
        };
        let kernel = lecun_normal(vec![in_features, self.features], in_features, rng);
        let bias = Tensor::zeros(vec![self.features]);
        Ok((vec![batch, self.features], vec![kernel, bias]))
    }

    fn apply(&self, params: &[Value], x: &Value) -> Result<Value, NNError> {
        check_param_count(self, params)?;
        Ok(x.matmul(&params[0])?.add_bias(&params[1])?)
    }
}

/// Applies ReLU element-wise
#[derive(Default)]
pub struct ReLU;

impl Module for ReLU {
    fn name(&self) -> &'static str {
        "ReLU"
    }

    fn init_by_shape(
        &self,
        input_shape: &[usize],
        _rng: &mut dyn RngCore,
    ) -> Result<(Vec<usize>, Vec<Tensor>), NNError> {
        Ok((input_shape.to_vec(), vec![]))
    }

    fn apply(&self, params: &[Value], x: &Value) -> Result<Value, NNError> {
        check_param_count(self, params)?;
        Ok(x.relu())
    }
}

/// Average pooling with `VALID` padding
pub struct AvgPool {
    pub window_shape: [usize; 2],
    pub strides: [usize; 2],
}

impl AvgPool {
    pub fn new(window_shape: [usize; 2], strides: [usize; 2]) -> Self {
        Self {
            window_shape,
            strides,
        }
    }
}

impl Module for AvgPool {
    fn name(&self) -> &'static str {
        "AvgPool"
    }

    fn init_by_shape(
        &self,
        input_shape: &[usize],
        _rng: &mut dyn RngCore,
    ) -> Result<(Vec<usize>, Vec<Tensor>), NNError> {
        let geometry =
            crate::kernels::PoolGeometry::new(input_shape, self.window_shape, self.strides)?;
        Ok((geometry.output_shape(), vec![]))
    }

    fn apply(&self, params: &[Value], x: &Value) -> Result<Value, NNError> {
        check_param_count(self, params)?;
        Ok(x.avg_pool2d(self.window_shape, self.strides)?)
    }
}

/// Collapses every axis but the batch axis
#[derive(Default)]
pub struct Flatten;

impl Module for Flatten {
    fn name(&self) -> &'static str {
        "Flatten"
    }

    fn init_by_shape(
        &self,
        input_shape: &[usize],
        _rng: &mut dyn RngCore,
    ) -> Result<(Vec<usize>, Vec<Tensor>), NNError> {
        let Some((&batch, rest)) = input_shape.split_first() else {
            return Err(NNError::InputRankMismatch {
                layer: self.name(),
                expected: 2,
                got: vec![],
            });
        };
        Ok((vec![batch, rest.iter().product()], vec![]))
    }

    fn apply(&self, params: &[Value], x: &Value) -> Result<Value, NNError> {
        check_param_count(self, params)?;
        Ok(x.flatten()?)
    }
}

/// Log-probabilities over the last axis
#[derive(Default)]
pub struct LogSoftmax;

impl Module for LogSoftmax {
    fn name(&self) -> &'static str {
        "LogSoftmax"
    }

    fn init_by_shape(
        &self,
        input_shape: &[usize],
        _rng: &mut dyn RngCore,
    ) -> Result<(Vec<usize>, Vec<Tensor>), NNError> {
        Ok((input_shape.to_vec(), vec![]))
    }

    fn apply(&self, params: &[Value], x: &Value) -> Result<Value, NNError> {
        check_param_count(self, params)?;
        Ok(x.log_softmax())
    }
}

/// Runs layers one after another, the output of each feeding the next
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, layer: impl Module + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Initialises every layer and names parameters `<Layer>_<i>/<param>`,
    /// counting each layer type separately
    pub fn init(
        &self,
        input_shape: &[usize],
        rng: &mut dyn RngCore,
    ) -> Result<(Vec<usize>, Params), NNError> {
        let mut params = Params::new();
        let mut shape = input_shape.to_vec();
        let mut seen: Vec<(&'static str, usize)> = vec![];
        for layer in &self.layers {
            let (out_shape, tensors) = layer.init_by_shape(&shape, rng)?;
            if !tensors.is_empty() {
                let index = match seen.iter_mut().find(|(name, _)| *name == layer.name()) {
                    Some((_, count)) => {
                        *count += 1;
                        *count - 1
                    }
                    None => {
                        seen.push((layer.name(), 1));
                        0
                    }
                };
                for (param, tensor) in layer.param_names().iter().zip(tensors) {
                    params.push(format!("{}_{}/{}", layer.name(), index, param), tensor);
                }
            }
            log::debug!("{} output shape: {:?}", layer.name(), out_shape);
            shape = out_shape;
        }
        Ok((shape, params))
    }
}

impl Module for Sequential {
    fn name(&self) -> &'static str {
        "Sequential"
    }

    fn init_by_shape(
        &self,
        input_shape: &[usize],
        rng: &mut dyn RngCore,
    ) -> Result<(Vec<usize>, Vec<Tensor>), NNError> {
        let (shape, params) = self.init(input_shape, rng)?;
        Ok((shape, params.tensors().to_vec()))
    }

    fn apply(&self, params: &[Value], x: &Value) -> Result<Value, NNError> {
        let expected = self
            .layers
            .iter()
            .map(|l| l.param_names().len())
            .sum::<usize>();
        if params.len() != expected {
            return Err(NNError::ParamCountMismatch {
                expected,
                got: params.len(),
            });
        }
        let mut out = x.clone();
        let mut offset = 0;
        for layer in &self.layers {
            let n = layer.param_names().len();
            out = layer.apply(&params[offset..offset + n], &out)?;
            offset += n;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    fn ones(shape: Vec<usize>) -> Value {
        Value::new(Tensor::full(shape, 1.0))
    }

    #[test]
    fn test_dense_forward() {
        let dense = Dense::new(3);
        let params = vec![ones(vec![2, 3]), ones(vec![3])];
        let x = Value::constant(Tensor::new(vec![1, 2], vec![1.0, 2.0]).unwrap());
        let out = dense.apply(&params, &x).unwrap();
        assert_eq!(out.shape(), vec![1, 3]);
        assert_eq!(out.data().data(), &[4.0, 4.0, 4.0]);
    }

    #[test]
    fn test_dim_mismatch() {
        let dense = Dense::new(3);
        let params = vec![ones(vec![2, 3]), ones(vec![3])];
        let x = Value::constant(Tensor::zeros(vec![1, 1]));
        assert!(matches!(
            dense.apply(&params, &x).unwrap_err(),
            NNError::Tensor(TensorError::ShapeMismatch { op: "matmul", .. })
        ));
        assert!(matches!(
            dense.apply(&params[..1], &x).unwrap_err(),
            NNError::ParamCountMismatch {
                expected: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn test_conv_init_shapes() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let conv = Conv::new(8, [3, 3]);
        let (shape, params) = conv.init_by_shape(&[1, 6, 6, 2], &mut rng).unwrap();
        assert_eq!(shape, vec![1, 6, 6, 8]);
        assert_eq!(params[0].shape(), &[3, 3, 2, 8]);
        assert_eq!(params[1].data(), &[0.0; 8]);

        assert!(matches!(
            conv.init_by_shape(&[6, 6], &mut rng),
            Err(NNError::InputRankMismatch { layer: "Conv", .. })
        ));
    }

    #[test]
    fn test_lecun_normal_statistics() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let fan_in = 100;
        let t = lecun_normal(vec![100, 100], fan_in, &mut rng);
        let n = t.len() as f32;
        let mean = t.data().iter().sum::<f32>() / n;
        let var = t.data().iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 0.01);
        assert!((var - 1.0 / fan_in as f32).abs() < 0.001);
        // nothing beyond the truncation point
        let bound = 2.0 * (1.0 / fan_in as f32).sqrt() / 0.879_625_7;
        assert!(t.data().iter().all(|v| v.abs() <= bound + 1e-6));
    }

    #[test]
    fn test_sequential_names_and_shapes() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let model = Sequential::new()
            .add(Conv::new(4, [3, 3]))
            .add(ReLU)
            .add(AvgPool::new([2, 2], [2, 2]))
            .add(Flatten)
            .add(Dense::new(5))
            .add(Dense::new(3))
            .add(LogSoftmax);
        let (shape, params) = model.init(&[1, 8, 8, 1], &mut rng).unwrap();
        assert_eq!(shape, vec![1, 3]);
        assert_eq!(
            params.names(),
            &[
                "Conv_0/kernel",
                "Conv_0/bias",
                "Dense_0/kernel",
                "Dense_0/bias",
                "Dense_1/kernel",
                "Dense_1/bias",
            ]
        );
        assert_eq!(params.get("Dense_0/kernel").unwrap().shape(), &[64, 5]);

        let x = Value::constant(Tensor::full(vec![2, 8, 8, 1], 0.5));
        let out = model.apply(&params.to_values(), &x).unwrap();
        assert_eq!(out.shape(), vec![2, 3]);
        // rows are log-probabilities
        for row in out.data().data().chunks(3) {
            let total = row.iter().map(|v| v.exp()).sum::<f32>();
            assert!((total - 1.0).abs() < 1e-5);
        }

        assert!(matches!(
            model.apply(&params.to_values()[..5], &x),
            Err(NNError::ParamCountMismatch {
                expected: 6,
                got: 5
            })
        ));
    }
}
