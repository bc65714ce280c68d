//! Control-loop counters

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bus::BusError;

/// Aggregated counters for a controller run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleStats {
    /// Cycles that ran to completion
    pub cycles: u64,
    /// Cycles skipped because no snapshot was available
    pub skipped: u64,
    /// Cycles that took longer than the period
    pub overruns: u64,
    /// Gear changes applied
    pub gear_shifts: u64,
    /// Cycles where lockup was commanded on
    pub lockup_engaged: u64,
    /// Inbound frames drained
    pub inbound_frames: u64,
    /// Send failures keyed by error kind
    pub send_failures: BTreeMap<String, u64>,
    /// Longest cycle seen, microseconds
    pub max_cycle_us: u64,
}

impl CycleStats {
    pub fn record_send_failure(&mut self, err: &BusError) {
        *self.send_failures.entry(err.kind().to_string()).or_insert(0) += 1;
    }

    pub fn total_send_failures(&self) -> u64 {
        self.send_failures.values().sum()
    }

    /// Share of completed cycles with lockup engaged
    pub fn lockup_ratio(&self) -> f64 {
        if self.cycles == 0 {
            0.0
        } else {
            self.lockup_engaged as f64 / self.cycles as f64
        }
    }
}
