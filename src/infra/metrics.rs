// ============================================================
// Layer 6 — Metric Aggregator
// ============================================================
// Two kinds of metric:
//
//   AverageMeter      — running mean of a scalar (losses)
//
//   MultiLabelMetrics — buffers prediction scores and gold
//                       labels across a whole evaluation pass,
//                       then computes ranking metrics once:
//
//     Mac-AP / Mic-AP / wAP   macro, micro and positive-count
//                             weighted average precision
//     mAP / mAUC              per-label AP and ROC-AUC, averaged
//     mP / mR                 precision / recall at the midpoint
//                             of each label's PR curve
//
// A label with no positives (or no negatives) has no AP or
// AUC. It scores 0 and sets the report's error flag instead
// of failing the evaluation.
//
// `report` drains the buffers: asking twice without new
// accumulation is an error.
//
// Example output:
//   Mac-AP = 41.20 Mic-AP = 47.85 wAP = 44.10 Err(false)
//   mAP = 41.20 mAUC = 88.31 mP = 52.00 mR = 49.70 @ 2000

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum MetricError {
    #[error("no predictions accumulated since the last report")]
    Empty,

    #[error("scores hold {scores} values but labels hold {labels}")]
    LengthMismatch { scores: usize, labels: usize },

    #[error("{len} values cannot be split into rows of {nlabel} labels")]
    Ragged { len: usize, nlabel: usize },

    #[error("label count changed from {before} to {after}")]
    LabelCountChanged { before: usize, after: usize },
}

// ─── AverageMeter ─────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    pub val:   f64,
    pub sum:   f64,
    pub count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, val: f64, n: usize) {
        self.val    = val;
        self.sum   += val * n as f64;
        self.count += n;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.sum / self.count as f64 }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ─── MultiLabelMetrics ────────────────────────────────────────────────────────
#[derive(Debug, Clone, Default)]
pub struct MultiLabelMetrics {
    scores: Vec<f32>,
    gold:   Vec<f32>,
    nlabel: usize,
}

/// Every value is a percentage in [0, 100].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricReport {
    pub macro_ap:    f64,
    pub micro_ap:    f64,
    pub weighted_ap: f64,
    pub mean_ap:     f64,
    pub mean_auc:    f64,
    pub mean_p:      f64,
    pub mean_r:      f64,
    pub has_err:     bool,
    pub nsample:     usize,
}

impl fmt::Display for MetricReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mac-AP = {:.2} Mic-AP = {:.2} wAP = {:.2} Err({}) mAP = {:.2} mAUC = {:.2} mP = {:.2} mR = {:.2} @ {}",
            self.macro_ap, self.micro_ap, self.weighted_ap, self.has_err,
            self.mean_ap, self.mean_auc, self.mean_p, self.mean_r, self.nsample,
        )
    }
}

impl MultiLabelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append row-major `(n, nlabel)` scores and 0/1 gold labels.
    pub fn accumulate(&mut self, scores: &[f32], gold: &[f32], nlabel: usize) -> Result<(), MetricError> {
        if scores.len() != gold.len() {
            return Err(MetricError::LengthMismatch { scores: scores.len(), labels: gold.len() });
        }
        if nlabel == 0 || scores.len() % nlabel != 0 {
            return Err(MetricError::Ragged { len: scores.len(), nlabel });
        }
        if !self.scores.is_empty() && self.nlabel != nlabel {
            return Err(MetricError::LabelCountChanged { before: self.nlabel, after: nlabel });
        }
        self.nlabel = nlabel;
        self.scores.extend_from_slice(scores);
        self.gold.extend_from_slice(gold);
        Ok(())
    }

    /// Compute every metric and clear the buffers.
    pub fn report(&mut self) -> Result<MetricReport, MetricError> {
        if self.scores.is_empty() {
            return Err(MetricError::Empty);
        }
        let nlabel  = self.nlabel;
        let scores  = std::mem::take(&mut self.scores);
        let gold    = std::mem::take(&mut self.gold);
        let nsample = scores.len() / nlabel;

        let mut has_err   = false;
        let mut aps       = Vec::with_capacity(nlabel);
        let mut aucs      = Vec::with_capacity(nlabel);
        let mut precision = Vec::with_capacity(nlabel);
        let mut recall    = Vec::with_capacity(nlabel);
        let mut weights   = Vec::with_capacity(nlabel);

        for k in 0..nlabel {
            let col: Vec<(f32, bool)> = (0..nsample)
                .map(|i| (scores[i * nlabel + k], gold[i * nlabel + k] > 0.5))
                .collect();
            let npos = col.iter().filter(|(_, y)| *y).count();
            weights.push(npos as f64);

            let ap = average_precision(&col).unwrap_or_else(|| {
                has_err = true;
                0.0
            });
            let auc = roc_auc(&col).unwrap_or_else(|| {
                has_err = true;
                0.0
            });
            let (p, r) = midpoint_pr(&col);
            aps.push(ap);
            aucs.push(auc);
            precision.push(p);
            recall.push(r);
        }

        let micro: Vec<(f32, bool)> = scores
            .iter()
            .zip(gold.iter())
            .map(|(&s, &y)| (s, y > 0.5))
            .collect();
        let micro_ap = average_precision(&micro).unwrap_or(0.0);

        let total_weight: f64 = weights.iter().sum();
        let weighted_ap = if total_weight > 0.0 {
            aps.iter().zip(weights.iter()).map(|(a, w)| a * w).sum::<f64>() / total_weight
        } else {
            0.0
        };

        let macro_ap = mean(&aps);
        Ok(MetricReport {
            macro_ap:    macro_ap * 100.0,
            micro_ap:    micro_ap * 100.0,
            weighted_ap: weighted_ap * 100.0,
            mean_ap:     macro_ap * 100.0,
            mean_auc:    mean(&aucs) * 100.0,
            mean_p:      mean(&precision) * 100.0,
            mean_r:      mean(&recall) * 100.0,
            has_err,
            nsample,
        })
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() { 0.0 } else { values.iter().sum::<f64>() / values.len() as f64 }
}

/// (threshold, tp, fp) at every distinct score, highest score first.
fn cumulative_counts(col: &[(f32, bool)]) -> Vec<(usize, usize)> {
    let mut sorted = col.to_vec();
    sorted.sort_by(|a, b| b.0.total_cmp(&a.0));
    let mut out = Vec::new();
    let (mut tp, mut fp) = (0usize, 0usize);
    for (i, &(score, positive)) in sorted.iter().enumerate() {
        if positive { tp += 1 } else { fp += 1 }
        let last_of_tie = sorted.get(i + 1).map_or(true, |next| next.0 != score);
        if last_of_tie {
            out.push((tp, fp));
        }
    }
    out
}

/// Step-wise AP: sum over thresholds of (R_n - R_{n-1}) * P_n.
/// `None` when the column has no positives.
fn average_precision(col: &[(f32, bool)]) -> Option<f64> {
    let npos = col.iter().filter(|(_, y)| *y).count();
    if npos == 0 {
        return None;
    }
    let mut ap = 0.0;
    let mut prev_recall = 0.0;
    for (tp, fp) in cumulative_counts(col) {
        let precision = tp as f64 / (tp + fp) as f64;
        let recall    = tp as f64 / npos as f64;
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
    }
    Some(ap)
}

/// Rank-sum ROC-AUC with tied scores sharing their average rank.
/// `None` when either class is missing.
fn roc_auc(col: &[(f32, bool)]) -> Option<f64> {
    let npos = col.iter().filter(|(_, y)| *y).count();
    let nneg = col.len() - npos;
    if npos == 0 || nneg == 0 {
        return None;
    }
    let mut sorted = col.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut rank_sum = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j + 1 < sorted.len() && sorted[j + 1].0 == sorted[i].0 {
            j += 1;
        }
        // ranks are 1-based; the tie block i..=j shares the mean rank
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        let positives = sorted[i..=j].iter().filter(|(_, y)| *y).count();
        rank_sum += avg_rank * positives as f64;
        i = j + 1;
    }
    let npos = npos as f64;
    Some((rank_sum - npos * (npos + 1.0) / 2.0) / (npos * nneg as f64))
}

/// The PR curve runs from the lowest threshold to the highest with
/// (precision 1, recall 0) appended; take its middle point.
fn midpoint_pr(col: &[(f32, bool)]) -> (f64, f64) {
    let npos = col.iter().filter(|(_, y)| *y).count();
    let mut curve: Vec<(f64, f64)> = cumulative_counts(col)
        .into_iter()
        .rev()
        .map(|(tp, fp)| {
            let p = tp as f64 / (tp + fp) as f64;
            let r = if npos == 0 { 0.0 } else { tp as f64 / npos as f64 };
            (p, r)
        })
        .collect();
    curve.push((1.0, 0.0));
    curve[curve.len() / 2]
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_average_meter() {
        let mut meter = AverageMeter::new();
        meter.update(2.0, 1);
        meter.update(4.0, 3);
        assert!(close(meter.avg(), 3.5));
        meter.reset();
        assert_eq!(meter.avg(), 0.0);
    }

    #[test]
    fn test_perfect_ranking() {
        let mut m = MultiLabelMetrics::new();
        // two labels, four samples
        let scores = [0.9, 0.1, 0.8, 0.2, 0.3, 0.7, 0.2, 0.6];
        let gold   = [1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0];
        m.accumulate(&scores, &gold, 2).unwrap();
        let r = m.report().unwrap();
        assert!(close(r.macro_ap, 100.0));
        assert!(close(r.micro_ap, 100.0));
        assert!(close(r.mean_auc, 100.0));
        assert!(!r.has_err);
        assert_eq!(r.nsample, 4);
    }

    #[test]
    fn test_known_average_precision() {
        // scores descending: 0.8(+) 0.4(-) 0.35(+) 0.1(-)
        // AP = 0.5 * 1 + 0.5 * 2/3
        let col = [(0.1, false), (0.4, false), (0.35, true), (0.8, true)];
        assert!(close(average_precision(&col).unwrap(), 0.5 + 1.0 / 3.0));
        assert!(close(roc_auc(&col).unwrap(), 0.75));
    }

    #[test]
    fn test_ties_share_rank() {
        let col = [(0.5, true), (0.5, false)];
        assert!(close(roc_auc(&col).unwrap(), 0.5));
        assert!(close(average_precision(&col).unwrap(), 0.5));
    }

    #[test]
    fn test_second_report_fails() {
        let mut m = MultiLabelMetrics::new();
        m.accumulate(&[0.2, 0.8], &[0.0, 1.0], 1).unwrap();
        assert!(m.report().is_ok());
        assert_eq!(m.report().unwrap_err(), MetricError::Empty);
    }

    #[test]
    fn test_degenerate_label_sets_error_flag() {
        let mut m = MultiLabelMetrics::new();
        // label 1 has no positives
        let scores = [0.9, 0.4, 0.2, 0.7, 0.6, 0.1];
        let gold   = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        m.accumulate(&scores, &gold, 2).unwrap();
        let r = m.report().unwrap();
        assert!(r.has_err);
        for v in [r.macro_ap, r.micro_ap, r.weighted_ap, r.mean_ap, r.mean_auc, r.mean_p, r.mean_r] {
            assert!(v.is_finite());
            assert!((0.0..=100.0).contains(&v));
        }
        // the healthy label is ranked perfectly, the degenerate one scores 0
        assert!(close(r.macro_ap, 50.0));
        assert!(close(r.weighted_ap, 100.0));
        assert!(r.to_string().contains("Err(true)"));
    }

    #[test]
    fn test_accumulate_rejects_bad_shapes() {
        let mut m = MultiLabelMetrics::new();
        assert!(matches!(m.accumulate(&[0.1, 0.2], &[1.0], 2), Err(MetricError::LengthMismatch { .. })));
        assert!(matches!(m.accumulate(&[0.1, 0.2, 0.3], &[1.0; 3], 2), Err(MetricError::Ragged { .. })));
        m.accumulate(&[0.1, 0.2], &[1.0, 0.0], 2).unwrap();
        assert!(matches!(m.accumulate(&[0.1], &[1.0], 1), Err(MetricError::LabelCountChanged { .. })));
    }

    #[test]
    fn test_midpoint_of_pr_curve() {
        // distinct thresholds give (p, r) = (1, .5), (.5, .5), (2/3, 1), (.5, 1)
        // reversed with (1, 0) appended: 5 points, middle is (.5, .5)
        let col = [(0.9, true), (0.8, false), (0.7, true), (0.6, false)];
        let (p, r) = midpoint_pr(&col);
        assert!(close(p, 0.5));
        assert!(close(r, 0.5));
    }
}
