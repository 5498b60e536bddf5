//! Optimizer(s)

use thiserror::Error;

use crate::{
    params::{Params, ParamsError},
    tensor::Tensor,
};

#[derive(Debug, Error, PartialEq)]
pub enum OptimError {
    #[error("Gradients do not match the parameters: {0}")]
    GradientMismatch(#[from] ParamsError),
    #[error("Optimizer state was built for {expected} parameters, got {got}")]
    StateMismatch { expected: usize, got: usize },
}

/// Common interface for optimizers
pub trait Optim {
    /// Updates `params` in place with one step along `grads`
    fn apply_gradient(&mut self, params: &mut Params, grads: &Params) -> Result<(), OptimError>;
}

/// SGD with (heavy ball) momentum
///
/// `m ← beta · m + g`, then `p ← p − lr · m`
#[derive(Debug, Clone)]
pub struct Momentum {
    // constant for the whole run
    learning_rate: f32,
    beta: f32,
    // velocity per parameter
    velocity: Vec<Tensor>,
}

impl Momentum {
    pub fn new(params: &Params, learning_rate: f32, beta: f32) -> Self {
        let velocity = params.zeros_like().tensors().to_vec();
        Self {
            learning_rate,
            beta,
            velocity,
        }
    }

    #[cfg(test)]
    pub fn velocities(&self) -> &[Tensor] {
        &self.velocity
    }
}

impl Optim for Momentum {
    fn apply_gradient(&mut self, params: &mut Params, grads: &Params) -> Result<(), OptimError> {
        params.check_same_structure(grads)?;
        if self.velocity.len() != params.len() {
            return Err(OptimError::StateMismatch {
                expected: self.velocity.len(),
                got: params.len(),
            });
        }
        for ((param, grad), velocity) in params
            .tensors_mut()
            .iter_mut()
            .zip(grads.tensors())
            .zip(self.velocity.iter_mut())
        {
            for ((p, &g), m) in param
                .data_mut()
                .iter_mut()
                .zip(grad.data())
                .zip(velocity.data_mut().iter_mut())
            {
                *m = self.beta * *m + g;
                *p -= self.learning_rate * *m;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_eq_float;

    fn single(name: &str, values: Vec<f32>) -> Params {
        let mut p = Params::new();
        p.push(name, Tensor::new(vec![values.len()], values).unwrap());
        p
    }

    #[test]
    fn test_sgd_no_momentum() {
        let mut params = single("w", vec![1.0, 2.0, 3.0]);
        let grads = single("w", vec![1.0, 1.0, 1.0]);

        let mut optim = Momentum::new(&params, 0.1, 0.0);
        optim.apply_gradient(&mut params, &grads).unwrap();
        let p = params.tensors()[0].data();
        assert_eq_float!(p[0], 0.9);
        assert_eq_float!(p[1], 1.9);
        assert_eq_float!(p[2], 2.9);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let mut params = single("w", vec![1.0, 2.0, 3.0]);
        let grads = single("w", vec![1.0, 1.0, 1.0]);

        let mut optim = Momentum::new(&params, 0.1, 0.9);
        optim.apply_gradient(&mut params, &grads).unwrap();
        let p = params.tensors()[0].data().to_vec();
        assert_eq_float!(p[0], 0.9);
        assert_eq_float!(p[1], 1.9);
        assert_eq_float!(p[2], 2.9);
        assert_eq!(optim.velocities()[0].data(), &[1.0, 1.0, 1.0]);

        optim.apply_gradient(&mut params, &grads).unwrap();
        let p = params.tensors()[0].data();
        assert_eq_float!(p[0], 0.71);
        assert_eq_float!(p[1], 1.71);
        assert_eq_float!(p[2], 2.71);
        assert_eq_float!(optim.velocities()[0].data()[0], 1.9);
    }

    #[test]
    fn test_mismatched_gradients() {
        let mut params = single("w", vec![1.0]);
        let mut optim = Momentum::new(&params, 0.1, 0.9);
        let err = optim
            .apply_gradient(&mut params, &single("v", vec![1.0]))
            .unwrap_err();
        assert!(matches!(err, OptimError::GradientMismatch(_)));

        let mut bigger = single("w", vec![1.0]);
        bigger.push("b", Tensor::zeros(vec![1]));
        let grads = bigger.clone();
        let err = optim.apply_gradient(&mut bigger, &grads).unwrap_err();
        assert_eq!(
            err,
            OptimError::StateMismatch {
                expected: 1,
                got: 2
            }
        );
    }
}
