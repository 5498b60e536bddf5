//! Loss and accuracy summaries

use std::fmt::{self, Display};

/// Loss and accuracy over some set of examples, accuracy in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Metrics {
    pub loss: f32,
    pub accuracy: f32,
}

impl Metrics {
    /// Unweighted mean, `None` for an empty list
    pub fn mean(metrics: &[Metrics]) -> Option<Metrics> {
        if metrics.is_empty() {
            return None;
        }
        let n = metrics.len() as f32;
        Some(Metrics {
            loss: metrics.iter().map(|m| m.loss).sum::<f32>() / n,
            accuracy: metrics.iter().map(|m| m.accuracy).sum::<f32>() / n,
        })
    }
}

impl Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loss: {:.4}, accuracy: {:.2}",
            self.loss,
            self.accuracy * 100.0
        )
    }
}

/// Accumulates per-chunk metrics weighted by the number of examples in each chunk
#[derive(Debug, Default)]
pub struct MetricsAccumulator {
    loss_sum: f64,
    correct_sum: f64,
    count: usize,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, metrics: Metrics, count: usize) {
        self.loss_sum += metrics.loss as f64 * count as f64;
        self.correct_sum += metrics.accuracy as f64 * count as f64;
        self.count += count;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn finish(&self) -> Option<Metrics> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(Metrics {
            loss: (self.loss_sum / n) as f32,
            accuracy: (self.correct_sum / n) as f32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_eq_float;

    #[test]
    fn test_mean() {
        let mean = Metrics::mean(&[
            Metrics {
                loss: 1.0,
                accuracy: 0.5,
            },
            Metrics {
                loss: 2.0,
                accuracy: 1.0,
            },
        ])
        .unwrap();
        assert_eq_float!(mean.loss, 1.5);
        assert_eq_float!(mean.accuracy, 0.75);
        assert_eq!(Metrics::mean(&[]), None);
    }

    #[test]
    fn test_accumulator_weights_by_count() {
        let mut acc = MetricsAccumulator::new();
        acc.add(
            Metrics {
                loss: 1.0,
                accuracy: 1.0,
            },
            3,
        );
        acc.add(
            Metrics {
                loss: 2.0,
                accuracy: 0.0,
            },
            1,
        );
        let m = acc.finish().unwrap();
        assert_eq!(acc.count(), 4);
        assert_eq_float!(m.loss, 1.25);
        assert_eq_float!(m.accuracy, 0.75);
    }

    #[test]
    fn test_display() {
        let m = Metrics {
            loss: 0.12344,
            accuracy: 0.9876,
        };
        assert_eq!(m.to_string(), "loss: 0.1234, accuracy: 98.76");
    }
}
