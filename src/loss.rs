//! Loss function(s)

use crate::{
    metrics::Metrics,
    tensor::{Tensor, TensorError},
    values::Value,
};

/// One-hot encodes integer labels into a `[labels.len(), num_classes]` tensor
///
/// Labels outside `0..num_classes` become all-zero rows.
pub fn onehot(labels: &[u8], num_classes: usize) -> Tensor {
    let mut data = vec![0.0; labels.len() * num_classes];
    for (row, &label) in data.chunks_mut(num_classes.max(1)).zip(labels) {
        if let Some(v) = row.get_mut(label as usize) {
            *v = 1.0;
        }
    }
    Tensor::from_raw(vec![labels.len(), num_classes], data)
}

/// Cross entropy between integer labels and `[B, K]` log-probabilities,
/// `-mean(sum(onehot(labels) * logits, -1))`
pub fn cross_entropy_loss(logits: &Value, labels: &[u8]) -> Result<Value, TensorError> {
    logits.nll_loss(labels)
}

/// Fraction of rows whose most likely class matches the label
pub fn accuracy(logits: &Tensor, labels: &[u8]) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = logits
        .argmax_rows()
        .into_iter()
        .zip(labels)
        .filter(|&(pred, &label)| pred == label as usize)
        .count();
    correct as f32 / labels.len() as f32
}

/// Loss and accuracy of a batch of log-probabilities
pub fn compute_metrics(logits: &Value, labels: &[u8]) -> Result<Metrics, TensorError> {
    let loss = cross_entropy_loss(logits, labels)?;
    let loss = loss.data().item().unwrap_or(f32::NAN);
    Ok(Metrics {
        loss,
        accuracy: accuracy(&logits.data(), labels),
    })
}
