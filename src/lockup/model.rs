//! Lockup classifier network
//!
//! A single hidden layer: 5 inputs -> 32 ReLU units -> 1 sigmoid output.
//! Callers pass physical units. The artifact carries a fixed full-scale value
//! per input that divides it before the first layer; training never changes it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::types::{FeatureVector, FEATURE_COUNT};

/// Hidden layer width
pub const HIDDEN_SIZE: usize = 32;

/// Artifact format version written by this build
pub const FORMAT_VERSION: u32 = 1;

/// Decision threshold on the sigmoid output
pub const DECISION_THRESHOLD: f32 = 0.5;

/// Default full-scale values for throttle, speed (km/h), rpm, engine and
/// transmission temperature (deg C)
pub const FEATURE_SCALE: FeatureVector = [1.0, 200.0, 8000.0, 150.0, 150.0];

fn default_input_scale() -> FeatureVector {
    FEATURE_SCALE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockupNet {
    pub format_version: u32,
    pub input_size: usize,
    pub hidden_size: usize,
    /// Per-input full-scale divisor
    #[serde(default = "default_input_scale")]
    pub input_scale: FeatureVector,
    /// Hidden weights, row-major `[hidden][input]`
    pub w1: Vec<f32>,
    pub b1: Vec<f32>,
    /// Output weights, one per hidden unit
    pub w2: Vec<f32>,
    pub b2: f32,
}

/// Intermediate values of a forward pass, kept for backprop
pub(crate) struct Activations {
    pub pre: [f32; HIDDEN_SIZE],
    pub hidden: [f32; HIDDEN_SIZE],
    pub logit: f32,
}

pub(crate) fn sigmoid(z: f32) -> f32 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

impl LockupNet {
    /// Uniform init in +-1/sqrt(fan_in), reproducible from `seed`
    pub fn seeded(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let in_bound = 1.0 / (FEATURE_COUNT as f32).sqrt();
        let hidden_bound = 1.0 / (HIDDEN_SIZE as f32).sqrt();

        let w1 = (0..HIDDEN_SIZE * FEATURE_COUNT)
            .map(|_| rng.random_range(-in_bound..in_bound))
            .collect();
        let b1 = (0..HIDDEN_SIZE).map(|_| rng.random_range(-in_bound..in_bound)).collect();
        let w2 = (0..HIDDEN_SIZE)
            .map(|_| rng.random_range(-hidden_bound..hidden_bound))
            .collect();
        let b2 = rng.random_range(-hidden_bound..hidden_bound);

        Self {
            format_version: FORMAT_VERSION,
            input_size: FEATURE_COUNT,
            hidden_size: HIDDEN_SIZE,
            input_scale: FEATURE_SCALE,
            w1,
            b1,
            w2,
            b2,
        }
    }

    /// Check shapes and that every parameter is finite
    pub fn validate(&self) -> Result<(), String> {
        if self.format_version != FORMAT_VERSION {
            return Err(format!("unsupported format version {}", self.format_version));
        }
        if self.input_size != FEATURE_COUNT || self.hidden_size != HIDDEN_SIZE {
            return Err(format!(
                "expected {}x{} network, found {}x{}",
                FEATURE_COUNT, HIDDEN_SIZE, self.input_size, self.hidden_size
            ));
        }
        if self.w1.len() != HIDDEN_SIZE * FEATURE_COUNT
            || self.b1.len() != HIDDEN_SIZE
            || self.w2.len() != HIDDEN_SIZE
        {
            return Err("parameter lengths do not match layer shapes".to_string());
        }
        if !self.input_scale.iter().all(|s| s.is_finite() && *s > 0.0) {
            return Err("input scale must be finite and positive".to_string());
        }
        if !self.parameters().all(f32::is_finite) {
            return Err("non-finite parameter".to_string());
        }
        Ok(())
    }

    fn parameters(&self) -> impl Iterator<Item = f32> + '_ {
        self.w1
            .iter()
            .chain(&self.b1)
            .chain(&self.w2)
            .chain(std::iter::once(&self.b2))
            .copied()
    }

    /// Inputs divided by their full-scale values
    pub(crate) fn scaled(&self, x: &FeatureVector) -> FeatureVector {
        let mut out = [0.0f32; FEATURE_COUNT];
        for (o, (xi, s)) in out.iter_mut().zip(x.iter().zip(&self.input_scale)) {
            *o = xi / s;
        }
        out
    }

    pub(crate) fn activations(&self, x: &FeatureVector) -> Activations {
        let mut pre = [0.0f32; HIDDEN_SIZE];
        let mut hidden = [0.0f32; HIDDEN_SIZE];
        let mut logit = self.b2;
        let x = self.scaled(x);
        for j in 0..HIDDEN_SIZE {
            let row = &self.w1[j * FEATURE_COUNT..(j + 1) * FEATURE_COUNT];
            let z = row.iter().zip(&x).map(|(w, xi)| w * xi).sum::<f32>() + self.b1[j];
            pre[j] = z;
            hidden[j] = z.max(0.0);
            logit += self.w2[j] * hidden[j];
        }
        Activations { pre, hidden, logit }
    }

    /// Probability that lockup should be engaged
    pub fn forward(&self, x: &FeatureVector) -> f32 {
        sigmoid(self.activations(x).logit)
    }

    /// Engage when the output exceeds the decision threshold
    pub fn predict(&self, x: &FeatureVector) -> bool {
        self.forward(x) > DECISION_THRESHOLD
    }

    /// Flatten into `[w1, b1, w2, b2]`
    pub(crate) fn to_flat(&self) -> Vec<f32> {
        self.parameters().collect()
    }

    /// Inverse of [`LockupNet::to_flat`]; the input scale is taken from `self`
    pub(crate) fn with_flat(&self, flat: &[f32]) -> Self {
        let w1_end = HIDDEN_SIZE * FEATURE_COUNT;
        let b1_end = w1_end + HIDDEN_SIZE;
        let w2_end = b1_end + HIDDEN_SIZE;
        Self {
            format_version: FORMAT_VERSION,
            input_size: FEATURE_COUNT,
            hidden_size: HIDDEN_SIZE,
            input_scale: self.input_scale,
            w1: flat[..w1_end].to_vec(),
            b1: flat[w1_end..b1_end].to_vec(),
            w2: flat[b1_end..w2_end].to_vec(),
            b2: flat[w2_end],
        }
    }

    /// Total number of trainable parameters
    pub fn parameter_count() -> usize {
        HIDDEN_SIZE * FEATURE_COUNT + HIDDEN_SIZE + HIDDEN_SIZE + 1
    }
}
