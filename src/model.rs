//! The convolutional classifier trained by the binary

use crate::nn::{AvgPool, Conv, Dense, Flatten, LogSoftmax, ReLU, Sequential};

/// A simple CNN: two conv/pool stages followed by two dense layers,
/// the output is a row of log-probabilities per image
pub fn cnn(num_classes: usize) -> Sequential {
    Sequential::new()
        .add(Conv::new(32, [3, 3]))
        .add(ReLU)
        .add(AvgPool::new([2, 2], [2, 2]))
        .add(Conv::new(64, [3, 3]))
        .add(ReLU)
        .add(AvgPool::new([2, 2], [2, 2]))
        .add(Flatten)
        .add(Dense::new(256))
        .add(ReLU)
        .add(Dense::new(num_classes))
        .add(LogSoftmax)
}
