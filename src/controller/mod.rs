//! Transmission controller
//!
//! Runs the fixed-cadence control cycle: drain inbound telemetry, take a
//! snapshot, arbitrate the gear, decide lockup, put both on the bus, feed the
//! outcome back to the predictor and report status.
//!
//! The controller owns the bus channel and the predictor; nothing else writes
//! gear state or touches the model while it runs.

pub mod report;
pub mod source;
pub mod stats;

pub use report::{JsonLinesStatusSink, LogStatusSink, StatusSink};
pub use source::{ReplaySource, SourceError, SyntheticDrive, VehicleDataSource};
pub use stats::CycleStats;

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bus::{BusChannel, BusError, CommandIds};
use crate::config::{Config, ConfigError};
use crate::gears::GearSelector;
use crate::lockup::{IntegrityError, LockupPredictor, PredictorOpenError, RetrainOutcome};
use crate::types::{GearState, LockupDecision, SensorSnapshot, StatusRecord};

/// Fatal startup failures
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("model rejected: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("bus unavailable: {0}")]
    Bus(#[from] BusError),
}

impl From<PredictorOpenError> for StartupError {
    fn from(err: PredictorOpenError) -> Self {
        match err {
            PredictorOpenError::Config(e) => StartupError::Config(e),
            PredictorOpenError::Integrity(e) => StartupError::Integrity(e),
        }
    }
}

/// Result of one call to [`TransmissionController::run_cycle`]
#[derive(Debug)]
pub enum CycleOutcome {
    Completed(StatusRecord),
    /// No snapshot this cycle; nothing was decided or sent
    Skipped,
    /// The data source has no more snapshots
    Finished,
}

/// The control loop
pub struct TransmissionController {
    bus: BusChannel,
    ids: CommandIds,
    selector: GearSelector,
    predictor: LockupPredictor,
    source: Box<dyn VehicleDataSource>,
    sink: Box<dyn StatusSink>,
    gear: GearState,
    period: Duration,
    send_timeout: Duration,
    receive_timeout: Duration,
    inbound_poll_limit: usize,
    observed_ids: Vec<u32>,
    self_label_fallback: bool,
    started: Instant,
    cycle: u64,
    stats: CycleStats,
}

impl TransmissionController {
    /// Validate `config`, verify the model and open the bus, in that order.
    pub fn startup(
        config: &Config,
        source: Box<dyn VehicleDataSource>,
        sink: Box<dyn StatusSink>,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        let predictor = LockupPredictor::open(&config.lockup)?;
        let bus = BusChannel::from_config(&config.bus)?;
        Self::new(config, bus, predictor, source, sink)
    }

    /// Assemble a controller from already-opened parts
    pub fn new(
        config: &Config,
        bus: BusChannel,
        predictor: LockupPredictor,
        source: Box<dyn VehicleDataSource>,
        sink: Box<dyn StatusSink>,
    ) -> Result<Self, StartupError> {
        let selector = GearSelector::from_config(&config.gears)?;
        Ok(Self {
            ids: CommandIds::from_config(&config.bus),
            bus,
            selector,
            predictor,
            source,
            sink,
            gear: GearState::Park,
            period: config.control.period(),
            send_timeout: config.bus.send_timeout(),
            receive_timeout: config.bus.receive_timeout(),
            inbound_poll_limit: config.control.inbound_poll_limit,
            observed_ids: config.bus.observed_ids.clone(),
            self_label_fallback: config.lockup.self_label_fallback,
            started: Instant::now(),
            cycle: 0,
            stats: CycleStats::default(),
        })
    }

    pub fn current_gear(&self) -> GearState {
        self.gear
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn predictor(&self) -> &LockupPredictor {
        &self.predictor
    }

    pub fn bus(&self) -> &BusChannel {
        &self.bus
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// One control cycle. Step failures are logged and never abort the cycle.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        self.drain_inbound();

        let at = self.started.elapsed();
        let snapshot = match self.source.snapshot(at) {
            Ok(snapshot) => snapshot,
            Err(SourceError::Exhausted) => return CycleOutcome::Finished,
            Err(e) => {
                warn!(error = %e, "no snapshot, skipping cycle");
                self.stats.skipped += 1;
                return CycleOutcome::Skipped;
            }
        };
        self.cycle += 1;

        self.apply_gear(&snapshot);
        let decision = self.apply_lockup(snapshot);
        self.learn(&decision);

        let record = StatusRecord {
            cycle: self.cycle,
            gear: self.gear,
            lockup: decision.engaged,
            timestamp: Utc::now(),
            uptime_ms: at.as_millis() as u64,
            efficiency: self.source.efficiency(),
        };
        self.sink.emit(&record);
        self.stats.cycles += 1;
        CycleOutcome::Completed(record)
    }

    fn drain_inbound(&mut self) {
        for _ in 0..self.inbound_poll_limit {
            match self.bus.receive(self.receive_timeout) {
                Ok(Some(frame)) => {
                    self.stats.inbound_frames += 1;
                    if self.observed_ids.contains(&frame.id()) {
                        debug!(%frame, "telemetry frame");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, kind = e.kind(), "inbound receive failed");
                    break;
                }
            }
        }
    }

    fn apply_gear(&mut self, snapshot: &SensorSnapshot) {
        let next = self.selector.next(self.gear, snapshot);
        if next == self.gear {
            return;
        }
        if let Some(frame) = self.ids.gear_frame(next) {
            if let Err(e) = self.bus.send(&frame, self.send_timeout) {
                warn!(error = %e, kind = e.kind(), gear = %next, "gear command not delivered");
                self.stats.record_send_failure(&e);
            }
        }
        info!(from = %self.gear, to = %next, speed = snapshot.speed_kmh(), "gear change");
        self.gear = next;
        self.stats.gear_shifts += 1;
    }

    fn apply_lockup(&mut self, snapshot: SensorSnapshot) -> LockupDecision {
        let engaged = self.predictor.predict(&snapshot.features());
        let frame = self.ids.lockup_frame(engaged);
        if let Err(e) = self.bus.send(&frame, self.send_timeout) {
            warn!(error = %e, kind = e.kind(), engaged, "lockup command not delivered");
            self.stats.record_send_failure(&e);
        }
        if engaged {
            self.stats.lockup_engaged += 1;
        }
        LockupDecision::new(engaged, snapshot)
    }

    fn learn(&mut self, decision: &LockupDecision) {
        let label = match self.source.observed_lockup() {
            Some(observed) => Some(observed),
            None if self.self_label_fallback => Some(decision.engaged),
            None => None,
        };
        if let Some(outcome) = label {
            self.predictor.record(decision.features(), outcome);
        }

        match self.predictor.maybe_retrain() {
            RetrainOutcome::Idle | RetrainOutcome::InProgress => {}
            RetrainOutcome::Scheduled { samples } => debug!(samples, "retraining scheduled"),
            RetrainOutcome::Swapped(report) => debug!(loss = report.final_loss, "retrained model live"),
            RetrainOutcome::Failed(e) => debug!(error = %e, "retraining failed"),
        }
    }

    /// Run at the configured cadence until `running` is cleared, the source
    /// is exhausted, or `max_cycles` cycles have been attempted.
    pub async fn run(mut self, running: Arc<AtomicBool>, max_cycles: Option<u64>) -> CycleStats {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            channel = self.bus.name(),
            period_ms = self.period.as_millis() as u64,
            "transmission controller running"
        );

        let mut attempted = 0u64;
        while running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if !running.load(Ordering::SeqCst) {
                break;
            }

            let started = Instant::now();
            let outcome = self.run_cycle();
            let elapsed = started.elapsed();
            self.stats.max_cycle_us = self.stats.max_cycle_us.max(elapsed.as_micros() as u64);
            if elapsed > self.period {
                self.stats.overruns += 1;
                warn!(elapsed_ms = elapsed.as_millis() as u64, period_ms = self.period.as_millis() as u64, "control cycle overran");
            }

            if matches!(outcome, CycleOutcome::Finished) {
                info!("vehicle data exhausted");
                break;
            }
            attempted += 1;
            if max_cycles.is_some_and(|max| attempted >= max) {
                break;
            }
        }

        self.shutdown()
    }

    /// Cancel retraining, close the bus and log the run summary
    pub fn shutdown(mut self) -> CycleStats {
        self.predictor.cancel_pending();
        self.bus.close();
        let stats = std::mem::take(&mut self.stats);
        let retrain = self.predictor.stats();
        if stats.total_send_failures() > 0 {
            error!(failures = ?stats.send_failures, "bus send failures during run");
        }
        info!(
            cycles = stats.cycles,
            skipped = stats.skipped,
            overruns = stats.overruns,
            gear_shifts = stats.gear_shifts,
            lockup_ratio = stats.lockup_ratio(),
            retrains = retrain.succeeded,
            retrain_failures = retrain.failed,
            final_gear = %self.gear,
            "transmission controller stopped"
        );
        stats
    }
}
