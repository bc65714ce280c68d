//! Shared types used across modules
//!
//! Sensor snapshots, gear states and status records are produced and consumed
//! by several components, so they live here to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of features fed to the lockup model
pub const FEATURE_COUNT: usize = 5;

/// Model input: throttle, speed, rpm, engine temperature, transmission temperature
pub type FeatureVector = [f32; FEATURE_COUNT];

/// Transmission gear state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GearState {
    #[default]
    Park,
    Reverse,
    Neutral,
    Gear1,
    Gear2,
    Gear3,
    Gear4,
}

impl GearState {
    /// Highest forward gear
    pub const TOP_FORWARD: u8 = 4;

    /// Forward gear number (1-4), or `None` for Park/Reverse/Neutral
    pub fn forward_number(self) -> Option<u8> {
        match self {
            GearState::Gear1 => Some(1),
            GearState::Gear2 => Some(2),
            GearState::Gear3 => Some(3),
            GearState::Gear4 => Some(4),
            GearState::Park | GearState::Reverse | GearState::Neutral => None,
        }
    }

    /// Forward gear from its number
    pub fn from_forward_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(GearState::Gear1),
            2 => Some(GearState::Gear2),
            3 => Some(GearState::Gear3),
            4 => Some(GearState::Gear4),
            _ => None,
        }
    }

    pub fn is_forward(self) -> bool {
        self.forward_number().is_some()
    }
}

impl std::fmt::Display for GearState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GearState::Park => write!(f, "P"),
            GearState::Reverse => write!(f, "R"),
            GearState::Neutral => write!(f, "N"),
            GearState::Gear1 => write!(f, "1"),
            GearState::Gear2 => write!(f, "2"),
            GearState::Gear3 => write!(f, "3"),
            GearState::Gear4 => write!(f, "4"),
        }
    }
}

/// Driver's shift-lever position
///
/// The lever is the only input allowed to move the transmission in or out of
/// Park, Reverse and Neutral. In `Drive` the forward ladder is automatic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftLever {
    Park,
    Reverse,
    Neutral,
    #[default]
    Drive,
}

impl std::fmt::Display for ShiftLever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShiftLever::Park => write!(f, "park"),
            ShiftLever::Reverse => write!(f, "reverse"),
            ShiftLever::Neutral => write!(f, "neutral"),
            ShiftLever::Drive => write!(f, "drive"),
        }
    }
}

/// Rejected sensor reading
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SnapshotError {
    #[error("sensor reading is missing field `{0}`")]
    MissingField(&'static str),
    #[error("sensor field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// One cycle's worth of validated sensor values
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorSnapshot {
    throttle: f64,
    speed_kmh: f64,
    engine_rpm: f64,
    engine_temp_c: f64,
    trans_temp_c: f64,
    lever: ShiftLever,
    timestamp: Duration,
}

fn check(field: &'static str, value: f64, min: f64, max: f64) -> Result<f64, SnapshotError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(value)
    } else {
        Err(SnapshotError::OutOfRange { field, value })
    }
}

impl SensorSnapshot {
    /// Build a snapshot, validating ranges. Lever defaults to `Drive`.
    pub fn new(
        throttle: f64,
        speed_kmh: f64,
        engine_rpm: f64,
        engine_temp_c: f64,
        trans_temp_c: f64,
        timestamp: Duration,
    ) -> Result<Self, SnapshotError> {
        Ok(Self {
            throttle: check("throttle", throttle, 0.0, 1.0)?,
            speed_kmh: check("speed", speed_kmh, 0.0, f64::MAX)?,
            engine_rpm: check("rpm", engine_rpm, 0.0, f64::MAX)?,
            engine_temp_c: check("engine_temp", engine_temp_c, -273.15, f64::MAX)?,
            trans_temp_c: check("trans_temp", trans_temp_c, -273.15, f64::MAX)?,
            lever: ShiftLever::Drive,
            timestamp,
        })
    }

    pub fn with_lever(mut self, lever: ShiftLever) -> Self {
        self.lever = lever;
        self
    }

    pub fn throttle(&self) -> f64 {
        self.throttle
    }

    pub fn speed_kmh(&self) -> f64 {
        self.speed_kmh
    }

    pub fn engine_rpm(&self) -> f64 {
        self.engine_rpm
    }

    pub fn engine_temp_c(&self) -> f64 {
        self.engine_temp_c
    }

    pub fn trans_temp_c(&self) -> f64 {
        self.trans_temp_c
    }

    pub fn lever(&self) -> ShiftLever {
        self.lever
    }

    /// Monotonic time since the controller started
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Model input in physical units; no scaling is applied here.
    pub fn features(&self) -> FeatureVector {
        [
            self.throttle as f32,
            self.speed_kmh as f32,
            self.engine_rpm as f32,
            self.engine_temp_c as f32,
            self.trans_temp_c as f32,
        ]
    }
}

/// Raw sensor reading as delivered by a collaborator (e.g. one replay line)
///
/// Every field is optional so that a missing value is reported by name
/// instead of failing deserialization as a whole.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorReading {
    pub throttle: Option<f64>,
    pub speed: Option<f64>,
    pub rpm: Option<f64>,
    pub engine_temp: Option<f64>,
    pub trans_temp: Option<f64>,
    #[serde(default)]
    pub lever: Option<ShiftLever>,
    /// Milliseconds since the start of the recording
    #[serde(default)]
    pub timestamp_ms: Option<u64>,
    /// Lockup state observed on the vehicle, when the recorder captured it
    #[serde(default)]
    pub lockup_observed: Option<bool>,
    /// Fuel efficiency (km/L) computed upstream, if any
    #[serde(default)]
    pub efficiency: Option<f64>,
}

impl SensorReading {
    /// Validate into a snapshot stamped with `fallback_timestamp` when the
    /// reading carries none.
    pub fn into_snapshot(self, fallback_timestamp: Duration) -> Result<SensorSnapshot, SnapshotError> {
        let snapshot = SensorSnapshot::new(
            self.throttle.ok_or(SnapshotError::MissingField("throttle"))?,
            self.speed.ok_or(SnapshotError::MissingField("speed"))?,
            self.rpm.ok_or(SnapshotError::MissingField("rpm"))?,
            self.engine_temp.ok_or(SnapshotError::MissingField("engine_temp"))?,
            self.trans_temp.ok_or(SnapshotError::MissingField("trans_temp"))?,
            self.timestamp_ms
                .map(Duration::from_millis)
                .unwrap_or(fallback_timestamp),
        )?;
        Ok(snapshot.with_lever(self.lever.unwrap_or_default()))
    }
}

/// Lockup verdict for one cycle, with the snapshot that produced it
#[derive(Debug, Clone, Copy)]
pub struct LockupDecision {
    pub engaged: bool,
    pub snapshot: SensorSnapshot,
}

impl LockupDecision {
    pub fn new(engaged: bool, snapshot: SensorSnapshot) -> Self {
        Self { engaged, snapshot }
    }

    pub fn features(&self) -> FeatureVector {
        self.snapshot.features()
    }
}

/// Per-cycle summary handed to the reporting collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub cycle: u64,
    pub gear: GearState,
    pub lockup: bool,
    /// Wall-clock time the record was produced
    pub timestamp: DateTime<Utc>,
    /// Monotonic time since controller start, milliseconds
    pub uptime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub efficiency: Option<f64>,
}
