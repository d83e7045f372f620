//! Confusion-matrix metrics and per-pass training metrics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use crate::types::TrainingPhase;

/// Square matrix of counts indexed as `[actual][predicted]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

    /// Records one prediction. Out-of-range ids are ignored.
    pub fn record(&mut self, actual: usize, predicted: usize) {
        let n = self.num_classes();
        if actual < n && predicted < n {
            self.counts[actual][predicted] += 1;
        }
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.counts[actual][predicted]
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.counts
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.num_classes()).map(|i| self.counts[i][i]).sum()
    }

    /// Number of samples whose actual class is `class_id`.
    pub fn support(&self, class_id: usize) -> usize {
        self.counts[class_id].iter().sum()
    }

    /// Number of samples predicted as `class_id`.
    pub fn predicted(&self, class_id: usize) -> usize {
        self.counts.iter().map(|row| row[class_id]).sum()
    }
}

/// Metrics for a single class. `None` means undefined (zero denominator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class_id: usize,
    pub label: String,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
    pub support: usize,
    pub predicted: usize,
}

impl ClassMetrics {
    fn from_confusion(matrix: &ConfusionMatrix, class_id: usize, label: String) -> Self {
        let true_positives = matrix.get(class_id, class_id);
        let support = matrix.support(class_id);
        let predicted = matrix.predicted(class_id);

        let precision = ratio(true_positives, predicted);
        let recall = ratio(true_positives, support);
        let f1 = match (precision, recall) {
            (Some(p), Some(r)) if p + r > 0.0 => Some(2.0 * p * r / (p + r)),
            (Some(_), Some(_)) => Some(0.0),
            _ => None,
        };

        Self {
            class_id,
            label,
            precision,
            recall,
            f1,
            support,
            predicted,
        }
    }
}

fn ratio(numerator: usize, denominator: usize) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}

fn mean_defined(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let defined: Vec<f64> = values.flatten().collect();
    if defined.is_empty() {
        None
    } else {
        Some(defined.iter().sum::<f64>() / defined.len() as f64)
    }
}

/// Aggregate and per-class metrics over a test set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub num_samples: usize,
    pub correct: usize,
    /// Fraction of correct predictions, 0 when there are no samples
    pub accuracy: f64,
    pub per_class: Vec<ClassMetrics>,
    pub confusion_matrix: ConfusionMatrix,
}

impl EvaluationReport {
    /// Builds the report; `labels[i]` names class `i`.
    pub fn from_confusion(matrix: ConfusionMatrix, labels: &[String]) -> Self {
        let num_samples = matrix.total();
        let correct = matrix.correct();
        let accuracy = ratio(correct, num_samples).unwrap_or(0.0);

        let per_class = (0..matrix.num_classes())
            .map(|class_id| {
                let label = labels
                    .get(class_id)
                    .cloned()
                    .unwrap_or_else(|| format!("class_{class_id}"));
                ClassMetrics::from_confusion(&matrix, class_id, label)
            })
            .collect();

        Self {
            num_samples,
            correct,
            accuracy,
            per_class,
            confusion_matrix: matrix,
        }
    }

    /// Mean precision over classes where it is defined.
    pub fn macro_precision(&self) -> Option<f64> {
        mean_defined(self.per_class.iter().map(|c| c.precision))
    }

    pub fn macro_recall(&self) -> Option<f64> {
        mean_defined(self.per_class.iter().map(|c| c.recall))
    }

    pub fn macro_f1(&self) -> Option<f64> {
        mean_defined(self.per_class.iter().map(|c| c.f1))
    }

    pub fn class(&self, label: &str) -> Option<&ClassMetrics> {
        self.per_class.iter().find(|c| c.label == label)
    }

    pub fn save_json(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }

    /// Writes the confusion matrix as CSV, one row per actual class.
    pub fn export_confusion_csv(&self, path: &Path) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;

        let header = std::iter::once("actual\\predicted")
            .chain(self.per_class.iter().map(|class| class.label.as_str()));
        writer.write_record(header)?;

        for (class, row) in self.per_class.iter().zip(self.confusion_matrix.rows()) {
            let record = std::iter::once(class.label.clone())
                .chain(row.iter().map(|count| count.to_string()));
            writer.write_record(record)?;
        }

        writer.flush()
    }
}

fn fmt_metric(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.4}"),
        None => "undefined".to_string(),
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "=".repeat(72))?;
        writeln!(f, "Evaluation over {} samples", self.num_samples)?;
        writeln!(f, "{}", "=".repeat(72))?;
        writeln!(f, " Accuracy:   {:.4}", self.accuracy)?;
        writeln!(f, " Precision:  {} (macro)", fmt_metric(self.macro_precision()))?;
        writeln!(f, " Recall:     {} (macro)", fmt_metric(self.macro_recall()))?;
        writeln!(f, " F1 Score:   {} (macro)", fmt_metric(self.macro_f1()))?;
        writeln!(f, "{}", "-".repeat(72))?;
        writeln!(
            f,
            "{:<20} {:>10} {:>10} {:>10} {:>8} {:>8}",
            "Class", "Precision", "Recall", "F1", "Support", "Pred"
        )?;
        for class in &self.per_class {
            writeln!(
                f,
                "{:<20} {:>10} {:>10} {:>10} {:>8} {:>8}",
                class.label,
                fmt_metric(class.precision),
                fmt_metric(class.recall),
                fmt_metric(class.f1),
                class.support,
                class.predicted
            )?;
        }
        writeln!(f, "{}", "-".repeat(72))?;
        writeln!(f, "Confusion matrix (rows = actual, columns = predicted):")?;
        for (class, row) in self.per_class.iter().zip(self.confusion_matrix.rows()) {
            let cells: Vec<String> = row.iter().map(|c| format!("{c:>6}")).collect();
            writeln!(f, "{:<20}{}", class.label, cells.join(""))?;
        }
        write!(f, "{}", "=".repeat(72))
    }
}

/// Loss and accuracy for one pass over the training data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PassMetrics {
    pub phase: TrainingPhase,
    /// Pass number within the phase, starting at 1
    pub pass: usize,
    pub mean_loss: f64,
    pub accuracy: f64,
    /// Global iteration counter at the end of the pass
    pub iteration: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        vec!["cat".to_string(), "dog".to_string()]
    }

    #[test]
    fn test_majority_predictor() {
        let mut matrix = ConfusionMatrix::new(2);
        for _ in 0..16 {
            matrix.record(0, 0);
        }
        for _ in 0..4 {
            matrix.record(1, 0);
        }

        let report = EvaluationReport::from_confusion(matrix, &labels());
        assert_eq!(report.num_samples, 20);
        assert!((report.accuracy - 0.8).abs() < 1e-9);

        let cat = report.class("cat").unwrap();
        assert_eq!(cat.recall, Some(1.0));
        assert_eq!(cat.precision, Some(0.8));

        let dog = report.class("dog").unwrap();
        assert_eq!(dog.recall, Some(0.0));
        assert_eq!(dog.precision, None);
        assert_eq!(dog.f1, None);

        let support: usize = report.per_class.iter().map(|c| c.support).sum();
        assert_eq!(support, report.num_samples);
    }

    #[test]
    fn test_metrics_in_unit_interval() {
        let mut matrix = ConfusionMatrix::new(3);
        let pairs = [(0, 0), (0, 1), (1, 1), (2, 0), (2, 2), (2, 2), (1, 2)];
        for (actual, predicted) in pairs {
            matrix.record(actual, predicted);
        }
        let report = EvaluationReport::from_confusion(
            matrix,
            &["a".to_string(), "b".to_string(), "c".to_string()],
        );

        assert!((0.0..=1.0).contains(&report.accuracy));
        for class in &report.per_class {
            for value in [class.precision, class.recall, class.f1].into_iter().flatten() {
                assert!((0.0..=1.0).contains(&value));
            }
        }
    }

    #[test]
    fn test_empty_report() {
        let report = EvaluationReport::from_confusion(ConfusionMatrix::new(2), &labels());
        assert_eq!(report.accuracy, 0.0);
        assert!(report.macro_f1().is_none());
        assert!(report.to_string().contains("undefined"));
    }

    #[test]
    fn test_out_of_range_prediction_ignored() {
        let mut matrix = ConfusionMatrix::new(2);
        matrix.record(0, 5);
        assert_eq!(matrix.total(), 0);
    }

    #[test]
    fn test_export_confusion_csv() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut matrix = ConfusionMatrix::new(2);
        matrix.record(0, 0);
        matrix.record(1, 0);
        let report = EvaluationReport::from_confusion(matrix, &labels());

        let path = dir.path().join("confusion.csv");
        report.export_confusion_csv(&path).unwrap();
        let csv = fs::read_to_string(&path).unwrap();
        assert_eq!(csv, "actual\\predicted,cat,dog\ncat,1,0\ndog,1,0\n");
    }

    #[test]
    fn test_confusion_csv_quotes_labels() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut matrix = ConfusionMatrix::new(2);
        matrix.record(0, 1);
        let report =
            EvaluationReport::from_confusion(matrix, &["a,b".to_string(), "c".to_string()]);

        let path = dir.path().join("confusion.csv");
        report.export_confusion_csv(&path).unwrap();

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&path)
            .unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.len() == 3));
        assert_eq!(&rows[1][0], "a,b");
        assert_eq!(&rows[1][2], "1");
    }
}
