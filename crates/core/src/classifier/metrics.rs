use super::{argmax, ClassifierError, Result};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Probability floor applied before taking logs.
const LOG_EPSILON: f32 = 1e-7;

/// Rows are true classes, columns predicted classes.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    pub fn record(&mut self, truth: usize, predicted: usize) {
        if let Some(cell) = self
            .counts
            .get_mut(truth)
            .and_then(|row| row.get_mut(predicted))
        {
            *cell += 1;
        }
    }

    pub fn count(&self, truth: usize, predicted: usize) -> usize {
        self.counts
            .get(truth)
            .and_then(|row| row.get(predicted))
            .copied()
            .unwrap_or(0)
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.counts
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.counts.len()).map(|i| self.counts[i][i]).sum()
    }

    pub fn accuracy(&self) -> f32 {
        match self.total() {
            0 => 0.0,
            total => self.correct() as f32 / total as f32,
        }
    }

    /// Plain-text table. Missing names fall back to the class index.
    pub fn render(&self, names: &[&str]) -> String {
        let label = |i: usize| {
            names
                .get(i)
                .map(|s| (*s).to_owned())
                .unwrap_or_else(|| i.to_string())
        };
        let labels: Vec<String> = (0..self.num_classes()).map(label).collect();
        let cell = labels
            .iter()
            .map(String::len)
            .chain(self.counts.iter().flatten().map(|c| c.to_string().len()))
            .max()
            .unwrap_or(1)
            .max(4);

        let mut out = String::new();
        let _ = write!(out, "{:>cell$}", "", cell = cell);
        for name in &labels {
            let _ = write!(out, " {:>cell$}", name, cell = cell);
        }
        out.push('\n');
        for (name, row) in labels.iter().zip(&self.counts) {
            let _ = write!(out, "{:>cell$}", name, cell = cell);
            for count in row {
                let _ = write!(out, " {:>cell$}", count, cell = cell);
            }
            out.push('\n');
        }
        out
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    /// Mean categorical cross-entropy.
    pub loss: f32,
    pub accuracy: f32,
    pub confusion: ConfusionMatrix,
}

impl Evaluation {
    pub fn from_probabilities(probabilities: ArrayView2<'_, f32>, labels: &[u32]) -> Result<Self> {
        if probabilities.nrows() != labels.len() {
            return Err(ClassifierError::LabelCount {
                samples: probabilities.nrows(),
                labels: labels.len(),
            });
        }
        let classes = probabilities.ncols();
        let mut confusion = ConfusionMatrix::new(classes);
        let mut loss = 0.0f64;
        for (row, &label) in probabilities.rows().into_iter().zip(labels) {
            let truth = label as usize;
            let p = row.get(truth).copied().ok_or(ClassifierError::LabelOutOfRange {
                label,
                classes,
            })?;
            loss -= f64::from(p.max(LOG_EPSILON).ln());
            if let Some((predicted, _)) = argmax(row) {
                confusion.record(truth, predicted);
            }
        }
        let loss = if labels.is_empty() {
            0.0
        } else {
            (loss / labels.len() as f64) as f32
        };
        Ok(Self {
            loss,
            accuracy: confusion.accuracy(),
            confusion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn evaluation_counts_hits_and_misses() {
        let probs = array![[0.9f32, 0.1], [0.2, 0.8], [0.6, 0.4], [0.3, 0.7]];
        let eval = Evaluation::from_probabilities(probs.view(), &[0, 1, 1, 1]).expect("eval");

        assert!((eval.accuracy - 0.75).abs() < 1e-6);
        assert_eq!(eval.confusion.count(0, 0), 1);
        assert_eq!(eval.confusion.count(1, 1), 2);
        assert_eq!(eval.confusion.count(1, 0), 1);
        assert_eq!(eval.confusion.total(), 4);

        let expected = -(0.9f64.ln() + 0.8f64.ln() + 0.4f64.ln() + 0.7f64.ln()) / 4.0;
        assert!((f64::from(eval.loss) - expected).abs() < 1e-5);
    }

    #[test]
    fn evaluation_rejects_bad_labels() {
        let probs = array![[0.5f32, 0.5]];
        assert!(matches!(
            Evaluation::from_probabilities(probs.view(), &[2]),
            Err(ClassifierError::LabelOutOfRange { label: 2, classes: 2 })
        ));
        assert!(matches!(
            Evaluation::from_probabilities(probs.view(), &[0, 1]),
            Err(ClassifierError::LabelCount { .. })
        ));
    }

    #[test]
    fn zero_probability_loss_is_finite() {
        let probs = array![[1.0f32, 0.0]];
        let eval = Evaluation::from_probabilities(probs.view(), &[1]).expect("eval");
        assert!(eval.loss.is_finite());
        assert_eq!(eval.accuracy, 0.0);
    }

    #[test]
    fn render_uses_names_and_aligns() {
        let mut m = ConfusionMatrix::new(2);
        m.record(0, 0);
        m.record(1, 0);
        m.record(1, 1);
        let text = m.render(&["happy", "angry"]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("happy") && lines[0].contains("angry"));
        assert!(lines[2].starts_with("angry"));
        assert!(lines.iter().all(|l| l.len() == lines[0].len()));
    }

    #[test]
    fn out_of_range_record_is_ignored() {
        let mut m = ConfusionMatrix::new(2);
        m.record(5, 0);
        assert_eq!(m.total(), 0);
        assert_eq!(m.accuracy(), 0.0);
    }
}
