//! Confidence gate
//!
//! Softmax the logits, take the top class and its probability, and replace the
//! class with -1 when the probability is below the threshold. "Unknown" is an
//! ordinary output here, never an error.

use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::UNKNOWN_CLASS;

/// Gated predictions for one batch
#[derive(Debug, Clone)]
pub struct GateOutput<B: Backend> {
    /// Argmax class, or -1 below the threshold [N]
    pub predictions: Tensor<B, 1, Int>,
    /// Argmax class before gating [N]
    pub raw_predictions: Tensor<B, 1, Int>,
    /// Max softmax probability [N]
    pub confidences: Tensor<B, 1>,
}

/// One host-side gated prediction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatedPrediction {
    pub prediction: i64,
    pub raw_prediction: i64,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceGate {
    threshold: f32,
}

impl ConfidenceGate {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Gate a batch of logits `[N, K]`
    pub fn apply<B: Backend>(&self, logits: Tensor<B, 2>) -> GateOutput<B> {
        let probs = softmax(logits, 1);
        let (confidences, raw) = probs.max_dim_with_indices(1);
        let confidences = confidences.squeeze::<1>(1);
        let raw_predictions = raw.squeeze::<1>(1);

        let below = confidences.clone().lower_elem(self.threshold);
        let predictions = raw_predictions.clone().mask_fill(below, UNKNOWN_CLASS);

        GateOutput {
            predictions,
            raw_predictions,
            confidences,
        }
    }

    /// Gate an already-collected row-major probability matrix
    pub fn gate_probabilities(&self, probabilities: &[f32], num_classes: usize) -> Vec<GatedPrediction> {
        probabilities
            .chunks(num_classes.max(1))
            .map(|row| {
                let (argmax, confidence) = row
                    .iter()
                    .copied()
                    .enumerate()
                    .fold((0usize, f32::NEG_INFINITY), |best, (i, p)| {
                        if p > best.1 {
                            (i, p)
                        } else {
                            best
                        }
                    });
                let raw_prediction = argmax as i64;
                let prediction = if confidence < self.threshold {
                    UNKNOWN_CLASS
                } else {
                    raw_prediction
                };
                GatedPrediction {
                    prediction,
                    raw_prediction,
                    confidence,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    type TestBackend = NdArray;

    #[test]
    fn test_gate_only_emits_argmax_or_unknown() {
        let device = Default::default();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let (n, k) = (64, 4);
        let values: Vec<f32> = (0..n * k).map(|_| rng.gen_range(-3.0..3.0)).collect();
        let logits = Tensor::<TestBackend, 2>::from_floats(TensorData::new(values, [n, k]), &device);
        let probs: Vec<f32> = softmax(logits.clone(), 1).into_data().to_vec().unwrap();

        for step in 0..=10 {
            let threshold = step as f32 / 10.0;
            let gate = ConfidenceGate::new(threshold);
            let out = gate.apply(logits.clone());
            let preds: Vec<i64> = out.predictions.into_data().to_vec().unwrap();
            let confs: Vec<f32> = out.confidences.into_data().to_vec().unwrap();

            let expected = gate.gate_probabilities(&probs, k);
            for i in 0..n {
                let row = &probs[i * k..(i + 1) * k];
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                assert!((confs[i] - max).abs() < 1e-6);
                assert!(preds[i] == UNKNOWN_CLASS || preds[i] == expected[i].raw_prediction);
                assert_eq!(preds[i] == UNKNOWN_CLASS, confs[i] < threshold);
            }
        }
    }

    #[test]
    fn test_threshold_extremes() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[2.0, 0.0], [0.0, 0.0]], &device);

        let open = ConfidenceGate::new(0.0).apply(logits.clone());
        let preds: Vec<i64> = open.predictions.into_data().to_vec().unwrap();
        assert!(preds.iter().all(|&p| p != UNKNOWN_CLASS));

        // a uniform row has confidence exactly 0.5
        let gated = ConfidenceGate::new(0.6).apply(logits);
        let preds: Vec<i64> = gated.predictions.into_data().to_vec().unwrap();
        assert_eq!(preds, vec![0, UNKNOWN_CLASS]);
    }

    #[test]
    fn test_gate_probabilities_host_side() {
        let gate = ConfidenceGate::new(0.5);
        let out = gate.gate_probabilities(&[0.1, 0.7, 0.2, 0.4, 0.3, 0.3], 3);
        assert_eq!(out[0].prediction, 1);
        assert_eq!(out[1].prediction, UNKNOWN_CLASS);
        assert_eq!(out[1].raw_prediction, 0);
    }
}
