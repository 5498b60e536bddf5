//! Dense row-major tensors of 32 bit floats

use thiserror::Error;

/// Errors for tensor shapes and the ops built on them
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    #[error("Shape {shape:?} holds {expected} elements but {len} were given")]
    DataLengthMismatch {
        shape: Vec<usize>,
        expected: usize,
        len: usize,
    },
    #[error("{op} expects a rank {expected} tensor, got rank {got}")]
    RankMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{op} received incompatible shapes {lhs:?} and {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    #[error("{op} does not support empty dimensions, got shape {shape:?}")]
    EmptyDimension { op: &'static str, shape: Vec<usize> },
    #[error("Cannot reshape {from:?} into {to:?}")]
    ReshapeMismatch { from: Vec<usize>, to: Vec<usize> },
    #[error("Expected {expected} labels, got {got}")]
    LabelCountMismatch { expected: usize, got: usize },
    #[error("Label {label} is out of range for {num_classes} classes")]
    LabelOutOfRange { label: u8, num_classes: usize },
}

/// An n-dimensional array stored contiguously in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, TensorError> {
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(TensorError::DataLengthMismatch {
                shape,
                expected,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Builds a tensor whose length was already checked by the caller
    pub(crate) fn from_raw(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![value; len],
        }
    }

    /// A rank 0 tensor
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: vec![],
            data: vec![value],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Returns the single element of a tensor holding exactly one value
    pub fn item(&self) -> Option<f32> {
        match self.data.as_slice() {
            [v] => Some(*v),
            _ => None,
        }
    }

    /// Same data viewed with a different shape of equal element count
    pub fn reshape(mut self, shape: Vec<usize>) -> Result<Self, TensorError> {
        if shape.iter().product::<usize>() != self.data.len() {
            return Err(TensorError::ReshapeMismatch {
                from: self.shape,
                to: shape,
            });
        }
        self.shape = shape;
        Ok(self)
    }

    pub fn scale(&mut self, factor: f32) {
        for v in self.data.iter_mut() {
            *v *= factor;
        }
    }

    /// Index of the largest value along the last axis, one entry per row
    pub fn argmax_rows(&self) -> Vec<usize> {
        let cols = self.shape.last().copied().unwrap_or(1);
        if cols == 0 {
            return vec![];
        }
        self.data
            .chunks(cols)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |(best, best_v), (i, &v)| {
                        if v > best_v { (i, v) } else { (best, best_v) }
                    })
                    .0
            })
            .collect()
    }
}
