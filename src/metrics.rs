//! Yes/no accuracy reporting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::AccuracyError;

/// A prediction or label reduced to the binary answer space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum YesNo {
    Yes,
    No,
}

fn parse_yes_no(text: &str) -> Option<YesNo> {
    let cleaned = text.trim().trim_end_matches(['.', '!']).trim().to_ascii_lowercase();
    match cleaned.as_str() {
        "yes" => Some(YesNo::Yes),
        "no" => Some(YesNo::No),
        _ => None,
    }
}

/// Counts for one binary confusion matrix, `yes` being the positive class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Confusion {
    tp: usize,
    fp: usize,
    tn: usize,
    fn_: usize,
}

impl Confusion {
    fn record(&mut self, predicted: YesNo, actual: YesNo) {
        match (predicted, actual) {
            (YesNo::Yes, YesNo::Yes) => self.tp += 1,
            (YesNo::Yes, YesNo::No) => self.fp += 1,
            (YesNo::No, YesNo::No) => self.tn += 1,
            (YesNo::No, YesNo::Yes) => self.fn_ += 1,
        }
    }

    const fn total(&self) -> usize {
        self.tp + self.fp + self.tn + self.fn_
    }

    /// Swaps the positive class to `no`.
    const fn flipped(&self) -> Self {
        Self {
            tp: self.tn,
            fp: self.fn_,
            tn: self.tp,
            fn_: self.fp,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn harmonic(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

/// Binary metrics over the scorable samples of one population.
///
/// A division by zero scores 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BinaryScores {
    /// Share of scored samples predicted correctly.
    pub accuracy: f64,
    /// Precision of the `yes` class.
    pub precision: f64,
    /// Recall of the `yes` class.
    pub recall: f64,
    /// F1 of the `yes` class.
    pub f1: f64,
    /// Precision, recall and F1 averaged over both classes, weighted by
    /// how often each class is the true label.
    pub weighted_precision: f64,
    /// Support-weighted recall.
    pub weighted_recall: f64,
    /// Support-weighted F1.
    pub weighted_f1: f64,
    /// Samples where both prediction and label are yes/no.
    pub scored: usize,
    /// Samples whose prediction is missing or not yes/no.
    pub unparseable: usize,
}

impl BinaryScores {
    fn from_confusion(c: &Confusion, unparseable: usize) -> Self {
        let per_class = |c: &Confusion| {
            let precision = ratio(c.tp, c.tp + c.fp);
            let recall = ratio(c.tp, c.tp + c.fn_);
            (precision, recall, harmonic(precision, recall))
        };
        let (precision, recall, f1) = per_class(c);
        let (no_precision, no_recall, no_f1) = per_class(&c.flipped());
        let total = c.total();
        let yes_weight = ratio(c.tp + c.fn_, total);
        let no_weight = ratio(c.tn + c.fp, total);
        Self {
            accuracy: ratio(c.tp + c.tn, total),
            precision,
            recall,
            f1,
            weighted_precision: precision * yes_weight + no_precision * no_weight,
            weighted_recall: recall * yes_weight + no_recall * no_weight,
            weighted_f1: f1 * yes_weight + no_f1 * no_weight,
            scored: total,
            unparseable,
        }
    }
}

/// Overall and per-group scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    /// Scores over every labeled sample.
    pub overall: BinaryScores,
    /// Scores per grouping key; ungrouped samples only count overall.
    pub per_group: BTreeMap<String, BinaryScores>,
    /// Samples whose label is not yes/no; they are left out entirely.
    pub unlabeled: usize,
}

#[derive(Default)]
struct Tally {
    confusion: Confusion,
    unparseable: usize,
}

impl Tally {
    fn scores(&self) -> BinaryScores {
        BinaryScores::from_confusion(&self.confusion, self.unparseable)
    }
}

/// Scores `predictions` against `groundtruths`. `groups` may be empty;
/// otherwise it gives each sample's grouping key.
pub fn accuracy_report(
    predictions: &[Option<String>],
    groundtruths: &[String],
    groups: &[Option<String>],
) -> Result<AccuracyReport, AccuracyError> {
    if predictions.is_empty() {
        return Err(AccuracyError::Empty);
    }
    if predictions.len() != groundtruths.len() || (!groups.is_empty() && groups.len() != predictions.len()) {
        return Err(AccuracyError::LengthMismatch {
            predictions: predictions.len(),
            groundtruths: groundtruths.len(),
        });
    }

    let mut overall = Tally::default();
    let mut per_group: BTreeMap<String, Tally> = BTreeMap::new();
    let mut unlabeled = 0;
    for (i, (prediction, truth)) in predictions.iter().zip(groundtruths).enumerate() {
        let Some(actual) = parse_yes_no(truth) else {
            unlabeled += 1;
            continue;
        };
        let group = groups.get(i).and_then(Option::as_deref).map(|g| per_group.entry(g.to_string()).or_default());
        let predicted = prediction.as_deref().and_then(parse_yes_no);
        match predicted {
            Some(predicted) => {
                overall.confusion.record(predicted, actual);
                if let Some(tally) = group {
                    tally.confusion.record(predicted, actual);
                }
            }
            None => {
                overall.unparseable += 1;
                if let Some(tally) = group {
                    tally.unparseable += 1;
                }
            }
        }
    }

    Ok(AccuracyReport {
        overall: overall.scores(),
        per_group: per_group.into_iter().map(|(k, t)| (k, t.scores())).collect(),
        unlabeled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(values: &[&str]) -> Vec<Option<String>> {
        values.iter().map(|v| Some((*v).to_string())).collect()
    }

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn scores_against_all_yes_labels() {
        let report = accuracy_report(&some(&["yes", "no", "yes"]), &labels(&["yes", "yes", "yes"]), &[]).unwrap();
        let s = report.overall;
        assert!(close(s.accuracy, 2.0 / 3.0));
        assert!(close(s.precision, 1.0));
        assert!(close(s.recall, 2.0 / 3.0));
        assert!(close(s.f1, 0.8));
        assert!(close(s.weighted_f1, 0.8));
        assert_eq!(s.scored, 3);
    }

    #[test]
    fn unparseable_predictions_are_counted_not_scored() {
        let predictions = vec![Some("Yes.".to_string()), None, Some("maybe".to_string())];
        let report = accuracy_report(&predictions, &labels(&["yes", "no", "no"]), &[]).unwrap();
        assert_eq!(report.overall.scored, 1);
        assert_eq!(report.overall.unparseable, 2);
        assert!(close(report.overall.accuracy, 1.0));
    }

    #[test]
    fn per_group_breakdown() {
        let groups = vec![Some("count".to_string()), Some("count".to_string()), Some("who".to_string())];
        let report =
            accuracy_report(&some(&["yes", "no", "no"]), &labels(&["yes", "yes", "no"]), &groups).unwrap();
        assert!(close(report.per_group["count"].accuracy, 0.5));
        assert!(close(report.per_group["who"].accuracy, 1.0));
        assert_eq!(report.per_group.len(), 2);
    }

    #[test]
    fn zero_division_scores_zero() {
        let report = accuracy_report(&some(&["no", "no"]), &labels(&["no", "no"]), &[]).unwrap();
        assert!(close(report.overall.precision, 0.0));
        assert!(close(report.overall.accuracy, 1.0));
        assert!(close(report.overall.weighted_precision, 1.0));
    }

    #[test]
    fn invalid_inputs() {
        assert!(matches!(accuracy_report(&[], &[], &[]), Err(AccuracyError::Empty)));
        assert!(matches!(
            accuracy_report(&some(&["yes"]), &labels(&["yes", "no"]), &[]),
            Err(AccuracyError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn non_binary_labels_are_skipped() {
        let report = accuracy_report(&some(&["3", "yes"]), &labels(&["3", "yes"]), &[]).unwrap();
        assert_eq!(report.unlabeled, 1);
        assert_eq!(report.overall.scored, 1);
    }
}
