use super::{Record, RecordValue};
use log::warn;
use std::collections::BTreeMap;

const CONFUSION_MATRIX: &str = "confusion_matrix/";
const CLASSIFICATION_REPORT: &str = "classification_report/";

/// Aggregates confusion matrices found in `records` into classification scores.
///
/// Every `confusion_matrix/<name>` entry is removed from the records. The matrices
/// of one name are summed (rows are true classes, columns are predictions) and a
/// record with `classification_report/<name>_{precision,recall,f1}_class_<i>` is
/// appended. A score whose denominator is zero is reported as 0. Matrices whose
/// shape differs from the first one seen for that name are skipped.
pub fn process_confusion_matrices(records: &mut Vec<Record>) {
    let mut sums: BTreeMap<String, (Vec<f32>, usize)> = BTreeMap::new();

    for record in records.iter_mut() {
        let keys: Vec<String> = record
            .keys()
            .filter(|k| k.starts_with(CONFUSION_MATRIX))
            .cloned()
            .collect();
        for key in keys {
            let name = key[CONFUSION_MATRIX.len()..].to_string();
            match record.remove(&key) {
                Some(RecordValue::Array2(data, [n, m])) if n == m && data.len() == n * m => {
                    let (sum, size) = sums.entry(name).or_insert_with(|| (vec![0.0; n * n], n));
                    if *size != n {
                        warn!("Confusion matrix {} changed shape, skipped", key);
                        continue;
                    }
                    sum.iter_mut().zip(data.iter()).for_each(|(s, d)| *s += d);
                }
                _ => warn!("{} is not a square 2-dimensional array, skipped", key),
            }
        }
    }

    if sums.is_empty() {
        return;
    }

    let mut report = Record::empty();
    for (name, (cm, n)) in sums.iter() {
        for i in 0..*n {
            let tp = cm[i * n + i];
            let predicted: f32 = (0..*n).map(|r| cm[r * n + i]).sum();
            let actual: f32 = (0..*n).map(|c| cm[i * n + c]).sum();
            let precision = ratio(tp, predicted);
            let recall = ratio(tp, actual);
            let f1 = ratio(2.0 * precision * recall, precision + recall);
            let key = |metric: &str| format!("{}{}_{}_class_{}", CLASSIFICATION_REPORT, name, metric, i);
            report.insert(key("precision"), RecordValue::Scalar(precision));
            report.insert(key("recall"), RecordValue::Scalar(recall));
            report.insert(key("f1"), RecordValue::Scalar(f1));
        }
    }
    records.push(report);
}

fn ratio(num: f32, den: f32) -> f32 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}
