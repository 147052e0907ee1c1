//! Open-Set Metrics
//!
//! Evaluation of gated predictions, where `-1` marks an example the model
//! refused to classify:
//! - Per-class confident accuracy and confident percentage
//! - False-positive and unknown percentages
//! - Macro-F1 over confident predictions
//! - The confident-prediction mask that seeds pseudo-labels

use serde::{Deserialize, Serialize};

use crate::utils::error::{OpenSetError, Result};
use crate::UNKNOWN_CLASS;

/// Per-class row of an open-set evaluation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassReport {
    /// Dense class id
    pub class_id: i64,
    /// Number of training examples of this class (looked up by class id)
    pub train_count: usize,
    /// Number of evaluated examples whose true label is this class
    pub eval_count: usize,
    /// Confident predictions of this class
    pub predicted: usize,
    /// Confident predictions of this class that were correct
    pub correct: usize,
    /// correct / predicted, 0 when nothing was predicted as this class
    pub conf_acc: f64,
    /// predicted / eval_count
    pub conf_pct: f64,
    /// Share of this class that was gated out although the raw argmax was wrong
    pub unconf_wrong_pct: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Result of evaluating gated predictions against ground truth
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenSetReport {
    pub per_class: Vec<ClassReport>,
    /// Confident predictions whose true label is not a known class / confident predictions
    pub fp_pct: f64,
    /// Predictions equal to -1 / all predictions
    pub unknown_pct: f64,
    /// Mean F1 over known classes, confident predictions only
    pub macro_f1: f64,
    pub avg_conf_acc: f64,
    pub avg_conf_pct: f64,
    pub avg_unconf_wrong_pct: f64,
    pub total: usize,
    /// `true` where the prediction is not -1
    pub confident_mask: Vec<bool>,
    /// Gated predictions, usable directly as hard pseudo-labels
    pub conf_preds: Vec<i64>,
}

impl OpenSetReport {
    /// Evaluate gated predictions.
    ///
    /// `known_classes` are the classes exposed during evaluation (any `-1` in it is
    /// ignored). `train_counts` is indexed by class id. `raw_preds` are the argmax
    /// predictions before gating; without them `unconf_wrong_pct` stays 0.
    pub fn evaluate(
        preds: &[i64],
        labels: &[i64],
        raw_preds: Option<&[i64]>,
        known_classes: &[i64],
        train_counts: &[usize],
    ) -> Result<Self> {
        if preds.len() != labels.len() {
            return Err(OpenSetError::shape(
                "predictions vs labels",
                vec![labels.len()],
                vec![preds.len()],
            ));
        }
        if let Some(raw) = raw_preds {
            if raw.len() != preds.len() {
                return Err(OpenSetError::shape(
                    "raw predictions vs predictions",
                    vec![preds.len()],
                    vec![raw.len()],
                ));
            }
        }

        let mut known: Vec<i64> = known_classes
            .iter()
            .copied()
            .filter(|&c| c != UNKNOWN_CLASS)
            .collect();
        known.sort_unstable();
        known.dedup();

        let is_known = |label: i64| known.binary_search(&label).is_ok();

        let total = preds.len();
        let confident_mask: Vec<bool> = preds.iter().map(|&p| p != UNKNOWN_CLASS).collect();
        let num_confident = confident_mask.iter().filter(|&&m| m).count();
        let num_unknown = total - num_confident;

        let false_positives = preds
            .iter()
            .zip(labels)
            .filter(|(&p, &l)| p != UNKNOWN_CLASS && !is_known(l))
            .count();

        let per_class: Vec<ClassReport> = known
            .iter()
            .map(|&c| {
                let eval_count = labels.iter().filter(|&&l| l == c).count();
                let predicted = preds.iter().filter(|&&p| p == c).count();
                let correct = preds
                    .iter()
                    .zip(labels)
                    .filter(|(&p, &l)| p == c && l == c)
                    .count();
                // true-c examples that received a confident prediction
                let confident_support = preds
                    .iter()
                    .zip(labels)
                    .filter(|(&p, &l)| l == c && p != UNKNOWN_CLASS)
                    .count();
                let unconf_wrong = match raw_preds {
                    Some(raw) => preds
                        .iter()
                        .zip(labels)
                        .zip(raw)
                        .filter(|((&p, &l), &r)| l == c && p == UNKNOWN_CLASS && r != c)
                        .count(),
                    None => 0,
                };

                let precision = ratio(correct, predicted);
                let recall = ratio(correct, confident_support);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };

                ClassReport {
                    class_id: c,
                    train_count: usize::try_from(c)
                        .ok()
                        .and_then(|idx| train_counts.get(idx).copied())
                        .unwrap_or(0),
                    eval_count,
                    predicted,
                    correct,
                    conf_acc: ratio(correct, predicted),
                    conf_pct: ratio(predicted, eval_count),
                    unconf_wrong_pct: ratio(unconf_wrong, eval_count),
                    precision,
                    recall,
                    f1,
                }
            })
            .collect();

        let mean = |f: fn(&ClassReport) -> f64| {
            if per_class.is_empty() {
                0.0
            } else {
                per_class.iter().map(f).sum::<f64>() / per_class.len() as f64
            }
        };

        Ok(Self {
            fp_pct: ratio(false_positives, num_confident),
            unknown_pct: ratio(num_unknown, total),
            macro_f1: mean(|c| c.f1),
            avg_conf_acc: mean(|c| c.conf_acc),
            avg_conf_pct: mean(|c| c.conf_pct),
            avg_unconf_wrong_pct: mean(|c| c.unconf_wrong_pct),
            total,
            confident_mask,
            conf_preds: preds.to_vec(),
            per_class,
        })
    }
}

impl std::fmt::Display for OpenSetReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Per-class evaluation results:")?;
        for row in &self.per_class {
            writeln!(
                f,
                "  Class {:>3} (train counts {:>6}): confident {:6.2}% | unconfident wrong {:6.2}% | accuracy {:7.3}%",
                row.class_id,
                row.train_count,
                row.conf_pct * 100.0,
                row.unconf_wrong_pct * 100.0,
                row.conf_acc * 100.0
            )?;
        }
        writeln!(f, "  Overall F1:                  {:.3}", self.macro_f1)?;
        writeln!(f, "  False positive percentage:   {:.3}", self.fp_pct * 100.0)?;
        writeln!(f, "  Selected unknown percentage: {:.3}", self.unknown_pct * 100.0)?;
        writeln!(f, "  Avg conf %:                  {:.3}", self.avg_conf_pct * 100.0)?;
        writeln!(f, "  Avg unconf wrong %:          {:.3}", self.avg_unconf_wrong_pct * 100.0)?;
        write!(f, "  Conf acc %:                  {:.3}", self.avg_conf_acc * 100.0)
    }
}

/// Closed-set macro accuracy: mean per-class recall of argmax predictions over
/// the classes present in `labels` (unknown labels are skipped).
pub fn macro_accuracy(preds: &[i64], labels: &[i64], num_classes: usize) -> f64 {
    let mut support = vec![0usize; num_classes];
    let mut hits = vec![0usize; num_classes];

    for (&p, &l) in preds.iter().zip(labels) {
        let Ok(idx) = usize::try_from(l) else {
            continue;
        };
        if idx >= num_classes {
            continue;
        }
        support[idx] += 1;
        if p == l {
            hits[idx] += 1;
        }
    }

    let present: Vec<f64> = support
        .iter()
        .zip(&hits)
        .filter(|(&s, _)| s > 0)
        .map(|(&s, &h)| h as f64 / s as f64)
        .collect();

    if present.is_empty() {
        0.0
    } else {
        present.iter().sum::<f64>() / present.len() as f64
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den > 0 {
        num as f64 / den as f64
    } else {
        0.0
    }
}

/// Running average for tracking loss during training
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    sum: f64,
    count: usize,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn average(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Hit counter for batch accuracies
#[derive(Debug, Clone, Default)]
pub struct AccuracyTracker {
    correct: usize,
    total: usize,
}

impl AccuracyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, correct: usize, total: usize) {
        self.correct += correct;
        self.total += total;
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct, self.total)
    }
}
