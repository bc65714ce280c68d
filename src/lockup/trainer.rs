//! Online retraining pass
//!
//! Mini-batch Adam on binary cross-entropy, starting from the current
//! network. A pass is reproducible: shuffling uses a seeded RNG.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::buffer::Sample;
use super::model::{LockupNet, HIDDEN_SIZE};
use crate::config::LockupConfig;
use crate::types::FEATURE_COUNT;

/// Recoverable retraining failures; the current model stays in service
#[derive(Debug, thiserror::Error)]
pub enum RetrainError {
    #[error("training diverged in epoch {epoch} (mean loss {loss})")]
    Diverged { epoch: usize, loss: f32 },
    #[error("candidate model rejected: {0}")]
    InvalidCandidate(String),
    #[error("no samples to train on")]
    NoSamples,
    #[error("failed to persist retrained model to {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("persisted model {} does not match its recorded hash", .path.display())]
    PersistVerify { path: PathBuf },
    #[error("retraining cancelled")]
    Cancelled,
    #[error("retraining worker exited without a result")]
    WorkerLost,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingParams {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub seed: u64,
    pub divergence_ceiling: f32,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self::from_config(&LockupConfig::default())
    }
}

impl TrainingParams {
    pub fn from_config(config: &LockupConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            learning_rate: config.learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            seed: config.seed,
            divergence_ceiling: config.divergence_ceiling,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub samples: usize,
    pub epochs: usize,
    /// Mean loss of the final epoch
    pub final_loss: f32,
}

/// Numerically stable BCE on a logit
fn bce_with_logit(logit: f32, target: f32) -> f32 {
    logit.max(0.0) - logit * target + (-logit.abs()).exp().ln_1p()
}

struct Adam {
    m: Vec<f32>,
    v: Vec<f32>,
    step: i32,
}

impl Adam {
    fn new(len: usize) -> Self {
        Self {
            m: vec![0.0; len],
            v: vec![0.0; len],
            step: 0,
        }
    }

    fn update(&mut self, params: &mut [f32], grads: &[f32], p: &TrainingParams) {
        self.step += 1;
        let bias1 = 1.0 - p.beta1.powi(self.step);
        let bias2 = 1.0 - p.beta2.powi(self.step);
        for i in 0..params.len() {
            self.m[i] = p.beta1 * self.m[i] + (1.0 - p.beta1) * grads[i];
            self.v[i] = p.beta2 * self.v[i] + (1.0 - p.beta2) * grads[i] * grads[i];
            let m_hat = self.m[i] / bias1;
            let v_hat = self.v[i] / bias2;
            params[i] -= p.learning_rate * m_hat / (v_hat.sqrt() + p.epsilon);
        }
    }
}

/// Accumulate the gradient of one sample's loss into `grads`; returns the loss
fn accumulate(net: &LockupNet, sample: &Sample, grads: &mut [f32]) -> f32 {
    let act = net.activations(&sample.inputs);
    let target = sample.target();
    let d_logit = super::model::sigmoid(act.logit) - target;
    let inputs = net.scaled(&sample.inputs);

    let w1_len = HIDDEN_SIZE * FEATURE_COUNT;
    let b1_off = w1_len;
    let w2_off = b1_off + HIDDEN_SIZE;
    let b2_off = w2_off + HIDDEN_SIZE;

    for j in 0..HIDDEN_SIZE {
        grads[w2_off + j] += d_logit * act.hidden[j];
        if act.pre[j] > 0.0 {
            let d_hidden = d_logit * net.w2[j];
            for (i, x) in inputs.iter().enumerate() {
                grads[j * FEATURE_COUNT + i] += d_hidden * x;
            }
            grads[b1_off + j] += d_hidden;
        }
    }
    grads[b2_off] += d_logit;

    bce_with_logit(act.logit, target)
}

/// Train a candidate from `base` on `samples`.
///
/// `cancel` is checked between epochs. The returned network has passed
/// [`LockupNet::validate`].
pub fn train(
    base: &LockupNet,
    samples: &[Sample],
    params: &TrainingParams,
    cancel: &AtomicBool,
) -> Result<(LockupNet, TrainingReport), RetrainError> {
    if samples.is_empty() {
        return Err(RetrainError::NoSamples);
    }
    let batch_size = params.batch_size.max(1);
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut order: Vec<usize> = (0..samples.len()).collect();
    let mut flat = base.to_flat();
    let mut adam = Adam::new(flat.len());
    let mut grads = vec![0.0f32; flat.len()];
    let mut final_loss = f32::NAN;

    for epoch in 0..params.epochs {
        if cancel.load(Ordering::Relaxed) {
            return Err(RetrainError::Cancelled);
        }
        order.shuffle(&mut rng);
        let mut epoch_loss = 0.0f32;

        for batch in order.chunks(batch_size) {
            let net = base.with_flat(&flat);
            grads.iter_mut().for_each(|g| *g = 0.0);
            for &idx in batch {
                epoch_loss += accumulate(&net, &samples[idx], &mut grads);
            }
            let scale = 1.0 / batch.len() as f32;
            grads.iter_mut().for_each(|g| *g *= scale);
            adam.update(&mut flat, &grads, params);
        }

        let mean = epoch_loss / samples.len() as f32;
        debug!(epoch, loss = mean, "retrain epoch");
        if !mean.is_finite() || mean > params.divergence_ceiling {
            return Err(RetrainError::Diverged { epoch, loss: mean });
        }
        final_loss = mean;
    }

    let candidate = base.with_flat(&flat);
    candidate.validate().map_err(RetrainError::InvalidCandidate)?;
    Ok((
        candidate,
        TrainingReport {
            samples: samples.len(),
            epochs: params.epochs,
            final_loss,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lockup wanted at steady cruise, not in town
    fn cruise_samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let cruising = i % 2 == 0;
                let (speed, rpm) = if cruising { (110.0, 2200.0) } else { (20.0, 1500.0) };
                Sample::new([0.2, speed, rpm, 90.0, 80.0], cruising)
            })
            .collect()
    }

    fn mean_loss(net: &LockupNet, samples: &[Sample]) -> f32 {
        samples
            .iter()
            .map(|s| bce_with_logit(net.activations(&s.inputs).logit, s.target()))
            .sum::<f32>()
            / samples.len() as f32
    }

    #[test]
    fn test_training_reduces_loss() {
        let base = LockupNet::seeded(11);
        let samples = cruise_samples(100);
        let params = TrainingParams {
            epochs: 50,
            learning_rate: 0.01,
            ..TrainingParams::default()
        };
        let (trained, report) = train(&base, &samples, &params, &AtomicBool::new(false)).unwrap();
        assert!(mean_loss(&trained, &samples) < mean_loss(&base, &samples));
        assert_eq!(report.samples, 100);
        assert!(report.final_loss.is_finite());
    }

    #[test]
    fn test_training_is_reproducible() {
        let base = LockupNet::seeded(5);
        let samples = cruise_samples(64);
        let params = TrainingParams::default();
        let cancel = AtomicBool::new(false);
        let (a, _) = train(&base, &samples, &params, &cancel).unwrap();
        let (b, _) = train(&base, &samples, &params, &cancel).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_divergence_is_reported() {
        let base = LockupNet::seeded(5);
        let samples = cruise_samples(32);
        let params = TrainingParams {
            divergence_ceiling: 1e-9,
            ..TrainingParams::default()
        };
        let err = train(&base, &samples, &params, &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, RetrainError::Diverged { epoch: 0, .. }));
    }

    #[test]
    fn test_non_finite_inputs_diverge() {
        let base = LockupNet::seeded(5);
        let samples = vec![Sample::new([f32::INFINITY, 1.0, 1.0, 1.0, 1.0], true); 8];
        let err = train(&base, &samples, &TrainingParams::default(), &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, RetrainError::Diverged { .. }));
    }

    #[test]
    fn test_cancel_stops_pass() {
        let base = LockupNet::seeded(5);
        let err = train(&base, &cruise_samples(16), &TrainingParams::default(), &AtomicBool::new(true))
            .unwrap_err();
        assert!(matches!(err, RetrainError::Cancelled));
    }

    #[test]
    fn test_empty_samples_rejected() {
        let err = train(&LockupNet::seeded(1), &[], &TrainingParams::default(), &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, RetrainError::NoSamples));
    }

    #[test]
    fn test_bce_matches_definition() {
        let logit = 0.7f32;
        let p = 1.0 / (1.0 + (-logit).exp());
        let direct = -(p.ln());
        assert!((bce_with_logit(logit, 1.0) - direct).abs() < 1e-5);
        let direct = -((1.0 - p).ln());
        assert!((bce_with_logit(logit, 0.0) - direct).abs() < 1e-5);
    }
}
