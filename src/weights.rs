//! Inverse-frequency class weights for the loss.

use std::collections::BTreeMap;

/// `weight[c] = 1 / count(c)` for every class that occurs at least once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassWeights {
    weights: BTreeMap<usize, f64>,
}

impl ClassWeights {
    pub fn from_labels<I>(labels: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for label in labels {
            *counts.entry(label).or_insert(0) += 1;
        }
        let weights = counts
            .into_iter()
            .map(|(label, count)| (label, 1.0 / count.max(1) as f64))
            .collect();
        Self { weights }
    }

    pub fn get(&self, label: usize) -> Option<f64> {
        self.weights.get(&label).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.weights.iter().map(|(&l, &w)| (l, w))
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Dense per-class loss weights. Classes without samples get 0.0; they
    /// never appear as a target.
    pub fn to_dense(&self, num_classes: usize) -> Vec<f32> {
        (0..num_classes)
            .map(|c| self.get(c).unwrap_or(0.0) as f32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unseen_classes_are_excluded() {
        let w = ClassWeights::from_labels([0, 0, 2]);
        assert_eq!(w.get(0), Some(0.5));
        assert_eq!(w.get(1), None);
        assert_eq!(w.get(2), Some(1.0));
        assert_eq!(w.to_dense(4), vec![0.5, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn no_labels_no_weights() {
        assert!(ClassWeights::from_labels(Vec::new()).is_empty());
    }

    proptest! {
        #[test]
        fn every_class_carries_equal_total_weight(labels in prop::collection::vec(0usize..6, 1..300)) {
            let w = ClassWeights::from_labels(labels.iter().copied());
            for (label, weight) in w.iter() {
                let count = labels.iter().filter(|&&l| l == label).count();
                prop_assert!((weight * count as f64 - 1.0).abs() < 1e-9);
            }
        }
    }
}
