//! CPU multilayer perceptron.
//!
//! ```text
//! x ─► L2 normalise ─► Linear(D→h) ─► ReLU ─► Linear(h→h) ─► ReLU ─► Linear(h→K) ─► scores
//! ```
//!
//! Trained with class-weighted cross-entropy and SGD with momentum
//! (`v = μ·v + g`, `p -= lr·v`).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use super::loss::weighted_cross_entropy;
use super::{Device, ExecutionContext, ModelBuilder, ModelError, ModelShape, TrainableModel};
use crate::search::TrialConfig;

const NORM_EPS: f32 = 1e-12;

/// Zeroed buffer, failing instead of aborting when memory runs out.
fn try_zeros(len: usize) -> Result<Vec<f32>, ModelError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| ModelError::OutOfMemory { elements: len })?;
    v.resize(len, 0.0);
    Ok(v)
}

// ============================================================================
// Linear layer
// ============================================================================

/// Dense layer. Weights are stored input-major: `weights[i * out + j]`.
#[derive(Clone, Debug, Serialize)]
pub struct Linear {
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    /// Uniform init in `±1/sqrt(in_features)`.
    fn new(in_features: usize, out_features: usize, rng: &mut StdRng) -> Result<Self, ModelError> {
        let count = in_features
            .checked_mul(out_features)
            .ok_or(ModelError::OutOfMemory { elements: usize::MAX })?;
        let mut weights = try_zeros(count)?;
        let mut bias = try_zeros(out_features)?;
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        for w in weights.iter_mut().chain(bias.iter_mut()) {
            *w = rng.gen_range(-bound..bound);
        }
        Ok(Self {
            weights,
            bias,
            in_features,
            out_features,
        })
    }

    fn forward(&self, input: &[f32], output: &mut [f32]) {
        output.copy_from_slice(&self.bias);
        for (i, &val) in input.iter().enumerate().take(self.in_features) {
            if val == 0.0 {
                continue;
            }
            let row = &self.weights[i * self.out_features..(i + 1) * self.out_features];
            for (o, w) in output.iter_mut().zip(row) {
                *o += val * w;
            }
        }
    }

    /// Accumulate parameter gradients; write the input gradient if asked.
    fn backward(
        &self,
        input: &[f32],
        grad_out: &[f32],
        grads: &mut LinearGrads,
        grad_in: Option<&mut [f32]>,
    ) {
        for (b, g) in grads.bias.iter_mut().zip(grad_out) {
            *b += g;
        }
        for (i, &val) in input.iter().enumerate() {
            if val == 0.0 {
                continue;
            }
            let row = &mut grads.weights[i * self.out_features..(i + 1) * self.out_features];
            for (w, g) in row.iter_mut().zip(grad_out) {
                *w += val * g;
            }
        }
        if let Some(grad_in) = grad_in {
            for (i, gi) in grad_in.iter_mut().enumerate() {
                let row = &self.weights[i * self.out_features..(i + 1) * self.out_features];
                *gi = row.iter().zip(grad_out).map(|(w, g)| w * g).sum();
            }
        }
    }
}

/// Gradient or velocity buffer shaped like a [`Linear`].
#[derive(Clone, Debug)]
struct LinearGrads {
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl LinearGrads {
    fn like(layer: &Linear) -> Result<Self, ModelError> {
        Ok(Self {
            weights: try_zeros(layer.weights.len())?,
            bias: try_zeros(layer.bias.len())?,
        })
    }

    fn zero(&mut self) {
        self.weights.iter_mut().for_each(|g| *g = 0.0);
        self.bias.iter_mut().for_each(|g| *g = 0.0);
    }
}

/// Activations kept from `forward` for the backward pass.
struct ForwardCache {
    input: Vec<f32>,
    z1: Vec<f32>,
    a1: Vec<f32>,
    z2: Vec<f32>,
    a2: Vec<f32>,
}

// ============================================================================
// Network
// ============================================================================

pub struct Mlp {
    layers: [Linear; 3],
    grads: [LinearGrads; 3],
    velocity: [LinearGrads; 3],
    learning_rate: f32,
    momentum: f32,
    cache: Vec<ForwardCache>,
}

#[derive(Serialize)]
struct MlpSnapshot<'a> {
    input_dim: usize,
    hidden_width: usize,
    num_classes: usize,
    layers: &'a [Linear; 3],
}

impl Mlp {
    pub fn new(
        shape: ModelShape,
        hidden_width: usize,
        learning_rate: f64,
        momentum: f64,
        seed: u64,
    ) -> Result<Self, ModelError> {
        if shape.num_classes == 0 {
            return Err(ModelError::Shape("zero classes".into()));
        }
        if shape.input_dim == 0 || hidden_width == 0 {
            return Err(ModelError::Shape("zero-width layer".into()));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let layers = [
            Linear::new(shape.input_dim, hidden_width, &mut rng)?,
            Linear::new(hidden_width, hidden_width, &mut rng)?,
            Linear::new(hidden_width, shape.num_classes, &mut rng)?,
        ];
        let grads = [
            LinearGrads::like(&layers[0])?,
            LinearGrads::like(&layers[1])?,
            LinearGrads::like(&layers[2])?,
        ];
        let velocity = grads.clone();

        Ok(Self {
            layers,
            grads,
            velocity,
            learning_rate: learning_rate as f32,
            momentum: momentum as f32,
            cache: Vec::new(),
        })
    }

    pub fn input_dim(&self) -> usize {
        self.layers[0].in_features
    }

    pub fn hidden_width(&self) -> usize {
        self.layers[0].out_features
    }

    fn forward_one(&self, features: &[f32]) -> (Vec<f32>, ForwardCache) {
        let hidden = self.hidden_width();
        let norm = features.iter().map(|v| v * v).sum::<f32>().sqrt().max(NORM_EPS);
        let mut input: Vec<f32> = features.iter().map(|v| v / norm).collect();
        // Pad or cut to the input width.
        input.resize(self.input_dim(), 0.0);

        let mut z1 = vec![0.0; hidden];
        self.layers[0].forward(&input, &mut z1);
        let a1: Vec<f32> = z1.iter().map(|v| v.max(0.0)).collect();

        let mut z2 = vec![0.0; hidden];
        self.layers[1].forward(&a1, &mut z2);
        let a2: Vec<f32> = z2.iter().map(|v| v.max(0.0)).collect();

        let mut scores = vec![0.0; self.num_classes()];
        self.layers[2].forward(&a2, &mut scores);

        (scores, ForwardCache { input, z1, a1, z2, a2 })
    }

    fn step(&mut self) {
        let (lr, mu) = (self.learning_rate, self.momentum);
        for ((layer, grad), vel) in self
            .layers
            .iter_mut()
            .zip(self.grads.iter())
            .zip(self.velocity.iter_mut())
        {
            for (p, (g, v)) in layer.weights.iter_mut().zip(grad.weights.iter().zip(vel.weights.iter_mut())) {
                *v = mu * *v + g;
                *p -= lr * *v;
            }
            for (p, (g, v)) in layer.bias.iter_mut().zip(grad.bias.iter().zip(vel.bias.iter_mut())) {
                *v = mu * *v + g;
                *p -= lr * *v;
            }
        }
    }
}

impl TrainableModel for Mlp {
    fn num_classes(&self) -> usize {
        self.layers[2].out_features
    }

    fn forward(&mut self, batch: &[&[f32]]) -> Vec<Vec<f32>> {
        self.cache.clear();
        let mut scores = Vec::with_capacity(batch.len());
        for features in batch {
            let (s, cache) = self.forward_one(features);
            scores.push(s);
            self.cache.push(cache);
        }
        scores
    }

    fn update(
        &mut self,
        scores: &[Vec<f32>],
        targets: &[usize],
        class_weights: &[f32],
    ) -> Result<f64, ModelError> {
        if scores.len() != self.cache.len() || targets.len() != scores.len() {
            return Err(ModelError::Shape(format!(
                "{} scores, {} targets, {} cached inputs",
                scores.len(),
                targets.len(),
                self.cache.len()
            )));
        }

        let out = weighted_cross_entropy(scores, targets, class_weights);
        if !out.loss.is_finite() {
            return Err(ModelError::NonFinite(out.loss));
        }

        self.grads.iter_mut().for_each(LinearGrads::zero);
        let hidden = self.hidden_width();
        let mut d_a2 = vec![0.0f32; hidden];
        let mut d_a1 = vec![0.0f32; hidden];

        let [l0, l1, l2] = &self.layers;
        let [g0, g1, g2] = &mut self.grads;
        for (cache, d_scores) in self.cache.iter().zip(&out.grad) {
            l2.backward(&cache.a2, d_scores, g2, Some(&mut d_a2));
            for (d, z) in d_a2.iter_mut().zip(&cache.z2) {
                if *z <= 0.0 {
                    *d = 0.0;
                }
            }
            l1.backward(&cache.a1, &d_a2, g1, Some(&mut d_a1));
            for (d, z) in d_a1.iter_mut().zip(&cache.z1) {
                if *z <= 0.0 {
                    *d = 0.0;
                }
            }
            l0.backward(&cache.input, &d_a1, g0, None);
        }

        self.step();
        Ok(out.loss)
    }

    fn snapshot(&self) -> Result<serde_json::Value, ModelError> {
        serde_json::to_value(MlpSnapshot {
            input_dim: self.input_dim(),
            hidden_width: self.hidden_width(),
            num_classes: self.num_classes(),
            layers: &self.layers,
        })
        .map_err(|e| ModelError::Snapshot(e.to_string()))
    }
}

/// Builds an [`Mlp`] from a trial's width, learning rate and momentum.
#[derive(Debug, Clone, Copy, Default)]
pub struct MlpBuilder;

impl ModelBuilder for MlpBuilder {
    fn build(
        &self,
        config: &TrialConfig,
        shape: ModelShape,
        ctx: &ExecutionContext,
        seed: u64,
    ) -> Result<Box<dyn TrainableModel>, ModelError> {
        if ctx.device != Device::Cpu {
            return Err(ModelError::UnsupportedDevice(ctx.device));
        }
        let mlp = Mlp::new(
            shape,
            config.hidden_width,
            config.learning_rate,
            config.momentum,
            seed,
        )?;
        Ok(Box::new(mlp))
    }
}
