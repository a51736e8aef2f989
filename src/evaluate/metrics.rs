//! Performance metrics over flat prediction and label vectors.

/// Receiver operating characteristic curve
#[derive(Debug, Clone, PartialEq)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    pub auc: f64,
}

/// Precision-recall curve
#[derive(Debug, Clone, PartialEq)]
pub struct PrecisionRecall {
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub average_precision: f64,
}

/// Harrell's concordance and its pair counts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Concordance {
    pub c_index: f64,
    pub concordant: usize,
    pub discordant: usize,
    pub tied_risk: usize,
    pub tied_time: usize,
}

/// Binary truth/score pairs with non-finite entries dropped
fn finite_pairs(truth: &[f64], scores: &[f64]) -> Vec<(f64, bool)> {
    truth
        .iter()
        .zip(scores)
        .filter(|(t, s)| t.is_finite() && s.is_finite())
        .map(|(&t, &s)| (s, t >= 0.5))
        .collect()
}

/// Cumulative (false positive, true positive) counts at each distinct threshold, scores descending
fn threshold_counts(pairs: &mut [(f64, bool)]) -> Vec<(usize, usize)> {
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0));
    let mut counts = Vec::new();
    let (mut fp, mut tp) = (0, 0);
    for (i, &(score, positive)) in pairs.iter().enumerate() {
        if positive {
            tp += 1;
        } else {
            fp += 1;
        }
        let last_at_threshold = pairs.get(i + 1).map_or(true, |next| next.0 != score);
        if last_at_threshold {
            counts.push((fp, tp));
        }
    }
    counts
}

/// ROC curve and trapezoidal AUC; AUC is NaN when only one class is present
pub fn roc_curve(truth: &[f64], scores: &[f64]) -> RocCurve {
    let mut pairs = finite_pairs(truth, scores);
    let positives = pairs.iter().filter(|(_, p)| *p).count();
    let negatives = pairs.len() - positives;
    if positives == 0 || negatives == 0 {
        return RocCurve {
            fpr: Vec::new(),
            tpr: Vec::new(),
            auc: f64::NAN,
        };
    }

    let mut fpr = vec![0.0];
    let mut tpr = vec![0.0];
    for (fp, tp) in threshold_counts(&mut pairs) {
        fpr.push(fp as f64 / negatives as f64);
        tpr.push(tp as f64 / positives as f64);
    }

    let auc = fpr
        .windows(2)
        .zip(tpr.windows(2))
        .map(|(x, y)| (x[1] - x[0]) * (y[1] + y[0]) / 2.0)
        .sum();
    RocCurve { fpr, tpr, auc }
}

/// Precision-recall curve and average precision
pub fn precision_recall(truth: &[f64], scores: &[f64]) -> PrecisionRecall {
    let mut pairs = finite_pairs(truth, scores);
    let positives = pairs.iter().filter(|(_, p)| *p).count();
    if positives == 0 {
        return PrecisionRecall {
            precision: Vec::new(),
            recall: Vec::new(),
            average_precision: f64::NAN,
        };
    }

    let mut precision = Vec::new();
    let mut recall = Vec::new();
    let mut average_precision = 0.0;
    let mut last_recall = 0.0;
    for (fp, tp) in threshold_counts(&mut pairs) {
        let p = tp as f64 / (tp + fp) as f64;
        let r = tp as f64 / positives as f64;
        average_precision += (r - last_recall) * p;
        last_recall = r;
        precision.push(p);
        recall.push(r);
    }
    PrecisionRecall {
        precision,
        recall,
        average_precision,
    }
}

/// Pearson correlation over the finite pairs
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(&a, &b)| (a, b))
        .collect();
    if pairs.len() < 2 {
        return f64::NAN;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (a, b) in &pairs {
        cov += (a - mean_x) * (b - mean_y);
        var_x += (a - mean_x).powi(2);
        var_y += (b - mean_y).powi(2);
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}

/// Harrell's C-index for right-censored data.
///
/// A pair is comparable when the sample with the shorter time had an event;
/// an event is also comparable to censored samples at the same time. Risk
/// ties within `tied_tol` count one half.
pub fn concordance_index(event: &[bool], time: &[f64], risk: &[f64], tied_tol: f64) -> Concordance {
    let n = event.len().min(time.len()).min(risk.len());
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| time[a].total_cmp(&time[b]));

    let mut numerator = 0.0;
    let mut denominator = 0usize;
    let mut result = Concordance {
        c_index: f64::NAN,
        concordant: 0,
        discordant: 0,
        tied_risk: 0,
        tied_time: 0,
    };

    let mut i = 0;
    while i + 1 < n {
        let time_i = time[order[i]];
        let mut end = i + 1;
        while end < n && time[order[end]] == time_i {
            end += 1;
        }

        let censored_at_same_time: Vec<usize> =
            (i..end).filter(|&k| !event[order[k]]).map(|k| order[k]).collect();

        for j in i..end {
            let index = order[j];
            if !event[index] {
                continue;
            }
            result.tied_time += censored_at_same_time.len();

            let est_i = risk[index];
            let comparable = order[end..].iter().chain(&censored_at_same_time);
            for &other in comparable {
                let est = risk[other];
                denominator += 1;
                if (est - est_i).abs() <= tied_tol {
                    result.tied_risk += 1;
                    numerator += 0.5;
                } else if est < est_i {
                    result.concordant += 1;
                    numerator += 1.0;
                } else {
                    result.discordant += 1;
                }
            }
        }
        i = end;
    }

    if denominator > 0 {
        result.c_index = numerator / denominator as f64;
    }
    result
}

/// Mean predicted probability and observed positive fraction per non-empty bin
pub fn calibration_curve(truth: &[f64], probabilities: &[f64], bins: usize) -> (Vec<f64>, Vec<f64>) {
    let bins = bins.max(1);
    let mut sums = vec![0.0; bins];
    let mut positives = vec![0.0; bins];
    let mut counts = vec![0usize; bins];
    for (&t, &p) in truth.iter().zip(probabilities) {
        if !t.is_finite() || !p.is_finite() {
            continue;
        }
        let bin = ((p.clamp(0.0, 1.0) * bins as f64) as usize).min(bins - 1);
        sums[bin] += p;
        positives[bin] += if t >= 0.5 { 1.0 } else { 0.0 };
        counts[bin] += 1;
    }

    (0..bins)
        .filter(|&b| counts[b] > 0)
        .map(|b| (sums[b] / counts[b] as f64, positives[b] / counts[b] as f64))
        .unzip()
}

/// Predicted probability of an event by the end of the last interval
pub fn survival_prediction(hazards: &[f32], intervals: usize) -> f64 {
    1.0 - hazards.iter().take(intervals).map(|&h| h as f64).product::<f64>()
}

/// Observed event indicator: sum of the failure bins
pub fn survival_actual(truth: &[f32], intervals: usize) -> f64 {
    truth.iter().skip(intervals).take(intervals).map(|&t| t as f64).sum()
}

/// Days followed: survived bins times days per bin
pub fn survival_follow_up(truth: &[f32], intervals: usize, days_window: usize) -> f64 {
    let days_per_bin = 1 + days_window / intervals.max(1);
    truth.iter().take(intervals).map(|&t| t as f64).sum::<f64>() * days_per_bin as f64
}

/// Mean cumulative product of per-interval survival probabilities
pub fn predicted_survival_curve(rows: &[Vec<f32>], intervals: usize) -> Vec<f64> {
    let mut curve = vec![0.0; intervals];
    if rows.is_empty() {
        return curve;
    }
    for row in rows {
        let mut survival = 1.0;
        for (point, &h) in curve.iter_mut().zip(row.iter().take(intervals)) {
            survival *= h as f64;
            *point += survival;
        }
    }
    curve.iter().map(|s| s / rows.len() as f64).collect()
}

/// Kaplan-Meier survival from (at-risk, failure) interval indicators
pub fn observed_survival_curve(rows: &[Vec<f32>], intervals: usize) -> Vec<f64> {
    let mut curve = Vec::with_capacity(intervals);
    let mut survival = 1.0;
    for i in 0..intervals {
        let at_risk: f64 = rows.iter().filter_map(|r| r.get(i)).map(|&v| v as f64).sum();
        let failed: f64 = rows
            .iter()
            .filter_map(|r| r.get(intervals + i))
            .map(|&v| v as f64)
            .sum();
        if at_risk > 0.0 {
            survival *= 1.0 - failed / at_risk;
        }
        curve.push(survival);
    }
    curve
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roc_perfect_and_random() {
        let truth = vec![0.0, 0.0, 1.0, 1.0];
        assert!((roc_curve(&truth, &[0.1, 0.2, 0.8, 0.9]).auc - 1.0).abs() < 1e-12);
        assert!((roc_curve(&truth, &[0.5, 0.5, 0.5, 0.5]).auc - 0.5).abs() < 1e-12);
        assert!(roc_curve(&[1.0, 1.0], &[0.1, 0.2]).auc.is_nan());
    }

    #[test]
    fn test_roc_ignores_nan_labels() {
        let roc = roc_curve(&[0.0, f64::NAN, 1.0], &[0.1, 0.9, 0.8]);
        assert!((roc.auc - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_average_precision() {
        let pr = precision_recall(&[1.0, 0.0, 1.0, 0.0], &[0.9, 0.8, 0.7, 0.1]);
        assert!((pr.average_precision - (0.5 + 0.5 * 2.0 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_pearson() {
        assert!((pearson(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]) - 1.0).abs() < 1e-12);
        assert!((pearson(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]) + 1.0).abs() < 1e-12);
        assert!(pearson(&[1.0], &[1.0]).is_nan());
    }

    #[test]
    fn test_concordance_index() {
        let event = [true, true, false, true];
        let time = [1.0, 2.0, 3.0, 4.0];
        let perfect = concordance_index(&event, &time, &[4.0, 3.0, 2.0, 1.0], 1e-8);
        assert_eq!(perfect.c_index, 1.0);
        assert_eq!(perfect.concordant, 5);
        assert_eq!(perfect.discordant, 0);

        let reversed = concordance_index(&event, &time, &[1.0, 2.0, 3.0, 4.0], 1e-8);
        assert_eq!(reversed.c_index, 0.0);

        let tied = concordance_index(&event, &time, &[1.0, 1.0, 1.0, 1.0], 1e-8);
        assert_eq!(tied.c_index, 0.5);
        assert_eq!(tied.tied_risk, 5);
    }

    #[test]
    fn test_concordance_tied_time_with_censoring() {
        let result = concordance_index(&[true, false], &[2.0, 2.0], &[0.9, 0.1], 1e-8);
        assert_eq!(result.tied_time, 1);
        assert_eq!(result.concordant, 1);
        assert_eq!(result.c_index, 1.0);
    }

    #[test]
    fn test_calibration_curve() {
        let (predicted, observed) = calibration_curve(&[0.0, 1.0, 1.0, 1.0], &[0.05, 0.08, 0.95, 0.92], 10);
        assert_eq!(predicted.len(), 2);
        assert_eq!(observed, vec![0.5, 1.0]);
    }

    #[test]
    fn test_survival_transforms() {
        let hazards = [0.9f32, 0.8, 0.5, 0.5];
        assert!((survival_prediction(&hazards, 2) - 0.28).abs() < 1e-6);

        let truth = [1.0f32, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        assert_eq!(survival_actual(&truth, 4), 1.0);
        assert_eq!(survival_follow_up(&truth, 4, 1460), 3.0 * 366.0);
    }

    #[test]
    fn test_survival_curves() {
        let rows = vec![vec![1.0f32, 1.0, 0.0, 1.0], vec![1.0, 0.0, 0.0, 0.0]];
        assert_eq!(observed_survival_curve(&rows, 2), vec![1.0, 0.0]);
        let predicted = predicted_survival_curve(&[vec![0.5f32, 0.5], vec![1.0, 0.5]], 2);
        assert_eq!(predicted, vec![0.75, 0.375]);
    }
}
