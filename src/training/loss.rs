//! Classification criteria
//!
//! Plain cross entropy, and a class-imbalance aware margin loss: the true-class
//! logit is reduced by a per-class margin `m_c ∝ n_c^(-1/4)`, all logits are
//! scaled by `s`, and per-example losses are weighted by the effective-number
//! weight of the true class, `w_c ∝ (1 - β) / (1 - β^n_c)`.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use tracing::debug;

use crate::model::config::MarginLossConfig;

/// Per-example cross entropy `[N]`
pub fn cross_entropy_per_sample<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    let [n, _] = logits.dims();
    log_softmax(logits, 1)
        .gather(1, targets.reshape([n, 1]))
        .reshape([n])
        .neg()
}

/// Effective-number class weights, normalized to sum to the number of classes.
///
/// Classes with no examples get weight 0 before normalization.
pub fn effective_number_weights(counts: &[usize], beta: f64) -> Vec<f32> {
    let raw: Vec<f64> = counts
        .iter()
        .map(|&n| {
            if n == 0 {
                0.0
            } else {
                (1.0 - beta) / (1.0 - beta.powf(n as f64))
            }
        })
        .collect();

    let total: f64 = raw.iter().sum();
    if total <= 0.0 {
        return vec![1.0; counts.len()];
    }
    let k = counts.len() as f64;
    raw.iter().map(|w| (w * k / total) as f32).collect()
}

/// Per-class margins proportional to `n_c^(-1/4)`, the largest equal to `max_margin`.
///
/// Classes with no examples get `max_margin`.
pub fn class_margins(counts: &[usize], max_margin: f64) -> Vec<f32> {
    let raw: Vec<Option<f64>> = counts
        .iter()
        .map(|&n| (n > 0).then(|| (n as f64).powf(-0.25)))
        .collect();
    let largest = raw.iter().flatten().copied().fold(0.0f64, f64::max);

    raw.iter()
        .map(|m| match m {
            Some(m) if largest > 0.0 => (m * max_margin / largest) as f32,
            _ => max_margin as f32,
        })
        .collect()
}

/// Margin loss built from a class-count vector
#[derive(Debug, Clone, PartialEq)]
pub struct MarginLoss {
    margins: Vec<f32>,
    weights: Vec<f32>,
    scale: f32,
}

impl MarginLoss {
    pub fn from_counts(counts: &[usize], config: &MarginLossConfig) -> Self {
        let margins = class_margins(counts, config.max_margin);
        let weights = effective_number_weights(counts, config.beta);
        debug!("Margin loss: counts {:?}, weights {:?}, margins {:?}", counts, weights, margins);
        Self {
            margins,
            weights,
            scale: config.scale as f32,
        }
    }

    pub fn margins(&self) -> &[f32] {
        &self.margins
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Weighted mean loss `Σ w_y ℓ / Σ w_y`, shape `[1]`
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let device = logits.device();
        let [n, k] = logits.dims();
        let margins = Tensor::<B, 1>::from_floats(TensorData::new(self.margins.clone(), [k]), &device);
        let weights = Tensor::<B, 1>::from_floats(TensorData::new(self.weights.clone(), [k]), &device);

        let m_y = margins.select(0, targets.clone());
        let delta = Tensor::<B, 2>::zeros([n, k], &device).scatter(
            1,
            targets.clone().reshape([n, 1]),
            m_y.reshape([n, 1]),
        );
        let adjusted = (logits - delta).mul_scalar(self.scale);

        let w_y = weights.select(0, targets.clone());
        let losses = cross_entropy_per_sample(adjusted, targets);
        (losses * w_y.clone()).sum() / w_y.sum()
    }
}

/// Loss used for labeled (or pseudo-labeled) batches
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    CrossEntropy,
    Margin(MarginLoss),
}

impl Criterion {
    pub fn margin(counts: &[usize], config: &MarginLossConfig) -> Self {
        Self::Margin(MarginLoss::from_counts(counts, config))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CrossEntropy => "cross_entropy",
            Self::Margin(_) => "margin",
        }
    }

    pub fn forward<B: Backend>(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        match self {
            Self::CrossEntropy => CrossEntropyLossConfig::new()
                .init(&logits.device())
                .forward(logits, targets),
            Self::Margin(loss) => loss.forward(logits, targets),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar()
    }

    #[test]
    fn test_weights_decrease_with_count_and_sum_to_k() {
        let counts = [1, 10, 100, 1000, 10000];
        let weights = effective_number_weights(&counts, 0.9999);
        for pair in weights.windows(2) {
            assert!(pair[0] > pair[1], "{:?}", weights);
        }
        let sum: f32 = weights.iter().sum();
        assert!((sum - counts.len() as f32).abs() < 1e-4);
    }

    #[test]
    fn test_zero_count_class_gets_no_weight() {
        let weights = effective_number_weights(&[0, 5, 5], 0.9999);
        assert_eq!(weights[0], 0.0);
        assert!((weights[1] - 1.5).abs() < 1e-5);
        assert_eq!(effective_number_weights(&[0, 0], 0.9), vec![1.0, 1.0]);
    }

    #[test]
    fn test_counts_beyond_i32_keep_positive_weights() {
        let weights = effective_number_weights(&[3_000_000_000, 1], 0.9999);
        assert!(weights.iter().all(|w| w.is_finite() && *w > 0.0), "{:?}", weights);
        assert!(weights[0] < weights[1]);
    }

    #[test]
    fn test_largest_margin_is_max_margin() {
        let margins = class_margins(&[16, 1, 81], 0.3);
        let max = margins.iter().copied().fold(f32::MIN, f32::max);
        assert!((max - 0.3).abs() < 1e-6);
        assert!((margins[1] - 0.3).abs() < 1e-6);
        assert!((margins[0] - 0.15).abs() < 1e-6);
        assert!((margins[2] - 0.1).abs() < 1e-6);

        assert_eq!(class_margins(&[0, 16], 0.3)[0], 0.3);
    }

    #[test]
    fn test_cross_entropy_per_sample() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0], [10.0, 0.0]], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([1, 0], &device);
        let losses: Vec<f32> = cross_entropy_per_sample(logits, targets)
            .into_data()
            .to_vec()
            .unwrap();
        assert!((losses[0] - std::f32::consts::LN_2).abs() < 1e-5);
        assert!(losses[1] < 1e-3);
    }

    #[test]
    fn test_margin_loss_without_margin_is_scaled_cross_entropy() {
        let device = Default::default();
        let config = MarginLossConfig {
            beta: 0.9999,
            scale: 2.0,
            max_margin: 0.0,
        };
        let loss = MarginLoss::from_counts(&[3, 3], &config);
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.5, 0.1], [0.2, 0.4]], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 1], &device);

        let margin = scalar(loss.forward(logits.clone(), targets.clone()));
        let plain = scalar(cross_entropy_per_sample(logits.mul_scalar(2.0), targets).mean());
        assert!((margin - plain).abs() < 1e-5);
    }

    #[test]
    fn test_margin_increases_loss() {
        let device = Default::default();
        let counts = [4, 4];
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.5, 0.1], [0.2, 0.4]], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 1], &device);

        let without = MarginLoss::from_counts(&counts, &MarginLossConfig { max_margin: 0.0, ..Default::default() });
        let with = MarginLoss::from_counts(&counts, &MarginLossConfig::default());
        assert!(
            scalar(with.forward(logits.clone(), targets.clone())) > scalar(without.forward(logits, targets))
        );
    }

    #[test]
    fn test_criterion_dispatch() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0]], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0], &device);
        let ce = scalar(Criterion::CrossEntropy.forward(logits, targets));
        assert!((ce - std::f32::consts::LN_2).abs() < 1e-5);
        assert_eq!(Criterion::margin(&[1, 2], &MarginLossConfig::default()).name(), "margin");
    }
}
