//! Named parameter trees
//!
//! Parameters live outside the graph as plain tensors so they can be shared
//! with every device, updated by the optimizer and averaged across replicas.

use thiserror::Error;

use crate::{tensor::Tensor, values::Value};

#[derive(Debug, Error, PartialEq)]
pub enum ParamsError {
    #[error("Cannot combine parameter trees: {reason}")]
    StructureMismatch { reason: String },
    #[error("Cannot average an empty list of parameter trees")]
    Empty,
}

/// An ordered list of named tensors, e.g. `Conv_0/kernel`, `Conv_0/bias`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Params {
    names: Vec<String>,
    tensors: Vec<Tensor>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.names.push(name.into());
        self.tensors.push(tensor);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn tensors_mut(&mut self) -> &mut [Tensor] {
        &mut self.tensors
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.tensors[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.tensors.iter())
    }

    /// Total number of scalars across all tensors
    pub fn num_elements(&self) -> usize {
        self.tensors.iter().map(Tensor::len).sum()
    }

    /// Same names and shapes, all values zero
    pub fn zeros_like(&self) -> Self {
        Self {
            names: self.names.clone(),
            tensors: self
                .tensors
                .iter()
                .map(|t| Tensor::zeros(t.shape().to_vec()))
                .collect(),
        }
    }

    /// Fresh trainable graph leaves holding a copy of every tensor
    pub fn to_values(&self) -> Vec<Value> {
        self.tensors.iter().cloned().map(Value::new).collect()
    }

    /// Collects the gradients of the leaves created by [`Params::to_values`]
    ///
    /// Leaves which no gradient reached contribute zeros.
    pub fn from_grads(&self, values: &[Value]) -> Result<Self, ParamsError> {
        if values.len() != self.len() {
            return Err(ParamsError::StructureMismatch {
                reason: format!("{} values for {} parameters", values.len(), self.len()),
            });
        }
        let tensors = self
            .tensors
            .iter()
            .zip(values)
            .map(|(t, v)| {
                v.take_grad()
                    .unwrap_or_else(|| Tensor::zeros(t.shape().to_vec()))
            })
            .collect();
        Ok(Self {
            names: self.names.clone(),
            tensors,
        })
    }

    pub fn check_same_structure(&self, other: &Params) -> Result<(), ParamsError> {
        if self.names != other.names {
            return Err(ParamsError::StructureMismatch {
                reason: format!("names {:?} vs {:?}", self.names, other.names),
            });
        }
        for ((name, a), b) in self.iter().zip(other.tensors.iter()) {
            if a.shape() != b.shape() {
                return Err(ParamsError::StructureMismatch {
                    reason: format!("{name} has shape {:?} vs {:?}", a.shape(), b.shape()),
                });
            }
        }
        Ok(())
    }

    /// Element-wise mean of replicas sharing one structure
    pub fn mean(replicas: &[Params]) -> Result<Self, ParamsError> {
        let (first, rest) = replicas.split_first().ok_or(ParamsError::Empty)?;
        let mut acc = first.clone();
        for replica in rest {
            acc.check_same_structure(replica)?;
            for (a, b) in acc.tensors.iter_mut().zip(replica.tensors.iter()) {
                for (x, y) in a.data_mut().iter_mut().zip(b.data()) {
                    *x += y;
                }
            }
        }
        let scale = 1.0 / replicas.len() as f32;
        acc.tensors.iter_mut().for_each(|t| t.scale(scale));
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(values: [f32; 3]) -> Params {
        let mut p = Params::new();
        p.push("Dense_0/kernel", Tensor::new(vec![1, 2], values[..2].to_vec()).unwrap());
        p.push("Dense_0/bias", Tensor::new(vec![1], vec![values[2]]).unwrap());
        p
    }

    #[test]
    fn test_mean() {
        let mean = Params::mean(&[params([1.0, 2.0, 3.0]), params([3.0, 4.0, 5.0])]).unwrap();
        assert_eq!(mean, params([2.0, 3.0, 4.0]));
        assert_eq!(mean.num_elements(), 3);
        assert_eq!(Params::mean(&[]), Err(ParamsError::Empty));
    }

    #[test]
    fn test_mean_rejects_different_structure() {
        let mut other = params([0.0; 3]);
        other.push("Dense_1/bias", Tensor::zeros(vec![1]));
        assert!(matches!(
            Params::mean(&[params([0.0; 3]), other]),
            Err(ParamsError::StructureMismatch { .. })
        ));
    }

    #[test]
    fn test_grads_roundtrip_through_values() {
        let p = params([1.0, 2.0, 3.0]);
        let values = p.to_values();
        let x = Value::constant(Tensor::new(vec![1, 1], vec![2.0]).unwrap());
        let y = x.matmul(&values[0]).unwrap();
        y.backward();

        let grads = p.from_grads(&values).unwrap();
        assert_eq!(grads.names(), p.names());
        assert_eq!(grads.get("Dense_0/kernel").unwrap().data(), &[2.0, 2.0]);
        // the bias took no part in the graph
        assert_eq!(grads.get("Dense_0/bias").unwrap().data(), &[0.0]);
    }
}
