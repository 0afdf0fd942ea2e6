//! Class-weighted cross-entropy over raw class scores.

/// Loss value and its gradient with respect to the scores.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: f64,
    pub grad: Vec<Vec<f32>>,
}

/// Weighted mean cross-entropy:
/// `sum_i w[y_i] * -log softmax(s_i)[y_i] / sum_i w[y_i]`.
///
/// Targets without weight contribute nothing. If the batch carries no weight at
/// all the loss is zero with a zero gradient.
pub fn weighted_cross_entropy(scores: &[Vec<f32>], targets: &[usize], weights: &[f32]) -> LossOutput {
    debug_assert_eq!(scores.len(), targets.len());

    let weight_of = |t: usize| weights.get(t).copied().unwrap_or(0.0) as f64;
    let total_weight: f64 = targets.iter().map(|&t| weight_of(t)).sum();

    let mut grad: Vec<Vec<f32>> = scores.iter().map(|s| vec![0.0; s.len()]).collect();
    if total_weight <= 0.0 {
        return LossOutput { loss: 0.0, grad };
    }

    let mut loss = 0.0f64;
    for ((row, &target), g) in scores.iter().zip(targets).zip(grad.iter_mut()) {
        let w = weight_of(target);
        if w == 0.0 || target >= row.len() {
            continue;
        }
        let probs = softmax(row);
        loss += -w * probs[target].max(f64::MIN_POSITIVE).ln();

        let scale = w / total_weight;
        for (k, (gk, pk)) in g.iter_mut().zip(&probs).enumerate() {
            let onehot = if k == target { 1.0 } else { 0.0 };
            *gk = ((pk - onehot) * scale) as f32;
        }
    }

    LossOutput {
        loss: loss / total_weight,
        grad,
    }
}

/// Numerically stable softmax in `f64`.
pub fn softmax(row: &[f32]) -> Vec<f64> {
    let max = row.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v)) as f64;
    let exps: Vec<f64> = row.iter().map(|&v| (v as f64 - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the highest score; first index wins ties.
pub fn argmax(row: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in row.iter().enumerate() {
        if best.map_or(true, |(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}
