//! Torque-converter lockup predictor
//!
//! Wraps the lockup classifier with its model lifecycle:
//!
//! ```text
//! Uninitialized -> Verified -> Ready -> Retraining -> Ready -> ...
//! ```
//!
//! A predictor can only be obtained from an artifact whose recorded hash
//! matches its content, so an unverified model never makes a decision.
//! Observations are buffered and, once the retraining threshold is reached,
//! drained into a retraining pass. Training may run on a blocking worker, but
//! the candidate is persisted and re-verified on the caller's thread, and only
//! then replaces the live model. A pass that is cancelled never reaches disk.
//! After a failed pass, `threshold` new observations are required before the
//! next attempt.

pub mod artifact;
pub mod buffer;
pub mod model;
pub mod trainer;

pub use artifact::{content_hash, sidecar_path, IntegrityError, ModelArtifact};
pub use buffer::{Sample, TrainingBuffer};
pub use model::{LockupNet, FEATURE_SCALE};
pub use trainer::{RetrainError, TrainingParams, TrainingReport};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::{LockupConfig, RetrainMode};
use crate::types::FeatureVector;

/// Model lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictorState {
    Uninitialized,
    Verified,
    Ready,
    Retraining,
}

impl std::fmt::Display for PredictorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PredictorState::Uninitialized => write!(f, "uninitialized"),
            PredictorState::Verified => write!(f, "verified"),
            PredictorState::Ready => write!(f, "ready"),
            PredictorState::Retraining => write!(f, "retraining"),
        }
    }
}

/// What `maybe_retrain` did this cycle
#[derive(Debug)]
pub enum RetrainOutcome {
    /// Below threshold, nothing running
    Idle,
    /// A background pass was started
    Scheduled { samples: usize },
    /// A background pass is still running
    InProgress,
    /// A candidate was verified, persisted and swapped in
    Swapped(TrainingReport),
    /// The pass failed; the previous model is still live
    Failed(RetrainError),
}

/// Counters for retraining activity
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct RetrainStats {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub last_loss: Option<f32>,
    pub model_hash: String,
}

struct PendingRetrain {
    rx: oneshot::Receiver<Result<(LockupNet, TrainingReport), RetrainError>>,
    cancel: Arc<AtomicBool>,
    samples: Vec<Sample>,
}

/// The lockup predictor
pub struct LockupPredictor {
    state: PredictorState,
    net: Arc<LockupNet>,
    path: PathBuf,
    buffer: TrainingBuffer,
    threshold: usize,
    mode: RetrainMode,
    params: TrainingParams,
    passes: u64,
    /// New observations still required after a failed pass
    backoff: usize,
    pending: Option<PendingRetrain>,
    stats: RetrainStats,
}

impl LockupPredictor {
    /// Load and verify the artifact at the configured path
    pub fn open(config: &LockupConfig) -> Result<Self, PredictorOpenError> {
        let path = config.resolved_model_path()?;
        Ok(Self::open_at(&path, config)?)
    }

    /// Load and verify the artifact at `path`
    pub fn open_at(path: &Path, config: &LockupConfig) -> Result<Self, IntegrityError> {
        let mut state = PredictorState::Uninitialized;
        debug!(path = %path.display(), %state, "loading lockup model");

        let artifact = ModelArtifact::load(path)?;
        if let Err(e) = artifact.verify(path) {
            error!(path = %path.display(), error = %e, "lockup model failed integrity check");
            return Err(e);
        }
        state = PredictorState::Verified;
        let net = artifact.decode(path)?;
        debug!(path = %path.display(), %state, hash = artifact.recorded_hash(), "lockup model verified");

        let predictor = Self {
            state: PredictorState::Ready,
            net: Arc::new(net),
            path: path.to_path_buf(),
            buffer: TrainingBuffer::new(config.buffer_capacity),
            threshold: config.retrain_threshold,
            mode: config.retrain_mode,
            params: TrainingParams::from_config(config),
            passes: 0,
            backoff: 0,
            pending: None,
            stats: RetrainStats {
                model_hash: artifact.recorded_hash().to_string(),
                ..RetrainStats::default()
            },
        };
        info!(
            path = %path.display(),
            hash = artifact.recorded_hash(),
            threshold = predictor.threshold,
            capacity = predictor.buffer.capacity(),
            "lockup predictor ready"
        );
        Ok(predictor)
    }

    pub fn state(&self) -> PredictorState {
        self.state
    }

    pub fn model_path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> &RetrainStats {
        &self.stats
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer(&self) -> &TrainingBuffer {
        &self.buffer
    }

    /// Raw model output in `[0, 1]`
    pub fn probability(&self, inputs: &FeatureVector) -> f32 {
        self.net.forward(inputs)
    }

    /// Engage lockup when the model output exceeds 0.5
    pub fn predict(&self, inputs: &FeatureVector) -> bool {
        self.net.predict(inputs)
    }

    /// Buffer an observation for the next retraining pass
    pub fn record(&mut self, inputs: FeatureVector, outcome: bool) {
        self.backoff = self.backoff.saturating_sub(1);
        if self.buffer.push(Sample::new(inputs, outcome)).is_some() {
            debug!(capacity = self.buffer.capacity(), "training buffer full, dropped oldest sample");
        }
    }

    /// Called once per cycle: collect a finished pass, or start one when the
    /// buffer has reached the threshold.
    pub fn maybe_retrain(&mut self) -> RetrainOutcome {
        if self.pending.is_some() {
            return self.poll_pending();
        }
        if self.buffer.len() < self.threshold || self.backoff > 0 {
            return RetrainOutcome::Idle;
        }

        let samples = self.buffer.drain();
        self.passes += 1;
        self.stats.started += 1;
        self.state = PredictorState::Retraining;
        let params = TrainingParams {
            seed: self.params.seed.wrapping_add(self.passes),
            ..self.params.clone()
        };
        info!(samples = samples.len(), pass = self.passes, mode = ?self.mode, "lockup retraining started");

        let runtime = match self.mode {
            RetrainMode::Background => tokio::runtime::Handle::try_current().ok(),
            RetrainMode::Inline => None,
        };

        match runtime {
            Some(handle) => {
                let (tx, rx) = oneshot::channel();
                let cancel = Arc::new(AtomicBool::new(false));
                let job = RetrainJob {
                    base: self.net.clone(),
                    samples: samples.clone(),
                    params,
                    cancel: cancel.clone(),
                };
                let count = samples.len();
                handle.spawn_blocking(move || {
                    let _ = tx.send(job.run());
                });
                self.pending = Some(PendingRetrain { rx, cancel, samples });
                RetrainOutcome::Scheduled { samples: count }
            }
            None => {
                if self.mode == RetrainMode::Background {
                    debug!("no async runtime, retraining inline");
                }
                let job = RetrainJob {
                    base: self.net.clone(),
                    samples: samples.clone(),
                    params,
                    cancel: Arc::new(AtomicBool::new(false)),
                };
                let result = job.run();
                self.finish(result, samples)
            }
        }
    }

    fn poll_pending(&mut self) -> RetrainOutcome {
        let Some(pending) = self.pending.as_mut() else {
            return RetrainOutcome::Idle;
        };
        let result = match pending.rx.try_recv() {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => return RetrainOutcome::InProgress,
            Err(oneshot::error::TryRecvError::Closed) => Err(RetrainError::WorkerLost),
        };
        let samples = match self.pending.take() {
            Some(p) => p.samples,
            None => Vec::new(),
        };
        self.finish(result, samples)
    }

    fn finish(&mut self, result: Result<(LockupNet, TrainingReport), RetrainError>, samples: Vec<Sample>) -> RetrainOutcome {
        self.state = PredictorState::Ready;
        let persisted = result.and_then(|(net, report)| {
            let hash = self.persist(&net)?;
            Ok((net, report, hash))
        });
        match persisted {
            Ok((net, report, hash)) => {
                self.net = Arc::new(net);
                self.stats.succeeded += 1;
                self.stats.last_loss = Some(report.final_loss);
                self.stats.model_hash = hash;
                info!(
                    loss = report.final_loss,
                    samples = report.samples,
                    hash = %self.stats.model_hash,
                    "lockup model retrained and swapped in"
                );
                RetrainOutcome::Swapped(report)
            }
            Err(e) => {
                self.stats.failed += 1;
                self.backoff = self.threshold;
                warn!(
                    error = %e,
                    restored = samples.len(),
                    backoff = self.backoff,
                    "lockup retraining failed, keeping current model"
                );
                self.buffer.restore(samples);
                RetrainOutcome::Failed(e)
            }
        }
    }

    /// Write the candidate and confirm the persisted pair verifies
    fn persist(&self, net: &LockupNet) -> Result<String, RetrainError> {
        let artifact = ModelArtifact::from_net(net).map_err(|e| RetrainError::InvalidCandidate(e.to_string()))?;
        artifact
            .save(&self.path)
            .map_err(|source| RetrainError::Persist { path: self.path.clone(), source })?;

        let (reloaded, _) =
            ModelArtifact::load_verified(&self.path).map_err(|_| RetrainError::PersistVerify { path: self.path.clone() })?;
        if reloaded.recorded_hash() != artifact.recorded_hash() {
            return Err(RetrainError::PersistVerify { path: self.path.clone() });
        }
        Ok(artifact.recorded_hash().to_string())
    }

    /// Stop a background pass. Its result is discarded, the artifact on disk is
    /// left untouched, and its samples are returned to the buffer.
    pub fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel.store(true, Ordering::Relaxed);
            info!("cancelling in-flight lockup retraining");
            self.buffer.restore(pending.samples);
            self.state = PredictorState::Ready;
        }
    }

    pub fn is_retraining(&self) -> bool {
        self.pending.is_some()
    }
}

impl Drop for LockupPredictor {
    fn drop(&mut self) {
        if let Some(pending) = &self.pending {
            pending.cancel.store(true, Ordering::Relaxed);
        }
    }
}

/// Error from [`LockupPredictor::open`]
#[derive(Debug, thiserror::Error)]
pub enum PredictorOpenError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

struct RetrainJob {
    base: Arc<LockupNet>,
    samples: Vec<Sample>,
    params: TrainingParams,
    cancel: Arc<AtomicBool>,
}

impl RetrainJob {
    /// Train a candidate; persisting is left to the predictor
    fn run(self) -> Result<(LockupNet, TrainingReport), RetrainError> {
        let result = trainer::train(&self.base, &self.samples, &self.params, &self.cancel)?;
        if self.cancel.load(Ordering::Relaxed) {
            return Err(RetrainError::Cancelled);
        }
        Ok(result)
    }
}
