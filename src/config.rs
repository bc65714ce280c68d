//! Configuration management
//!
//! Bus channel, shift tables, lockup learning and control cadence settings.
//! Nothing in the control core is hardcoded: every calibration value below is
//! read from `config.toml` and validated before the controller starts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::frame::MAX_STANDARD_ID;
use crate::types::SnapshotError;

/// Configuration problems; all of them are fatal at startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write config file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not determine the platform config directory")]
    NoProjectDirs,
    #[error("unknown shift profile `{name}` (available: {available})")]
    UnknownProfile { name: String, available: String },
    #[error("shift profile `{profile}`: boundary {value} km/h is not a finite, non-negative speed")]
    InvalidBoundary { profile: String, value: f64 },
    #[error("shift profile `{profile}`: boundaries must increase strictly ({lower} km/h then {upper} km/h)")]
    NonMonotonicBands { profile: String, lower: f64, upper: f64 },
    #[error("shift profile `{profile}`: hysteresis margin {value} km/h must be finite and non-negative")]
    InvalidHysteresis { profile: String, value: f64 },
    #[error("shift profile `{profile}`: hysteresis windows around {lower} km/h and {upper} km/h overlap")]
    OverlappingHysteresis { profile: String, lower: f64, upper: f64 },
    #[error("kickdown settings invalid: {0}")]
    InvalidKickdown(String),
    #[error("bus identifier {id:#05x} exceeds the 11-bit standard range")]
    InvalidIdentifier { id: u32 },
    #[error("bus identifier {id:#05x} is used both as a command and as {other}")]
    IdentifierCollision { id: u32, other: &'static str },
    #[error("bus bitrate must be positive")]
    InvalidBitrate,
    #[error("bus backend `{backend}` is not available in this build")]
    BackendUnavailable { backend: BusBackend },
    #[error("control cadence {hz} Hz is outside the supported range ({min}..={max} Hz)")]
    InvalidCadence { hz: f64, min: f64, max: f64 },
    #[error("retrain threshold {threshold} must be positive and no larger than buffer capacity {capacity}")]
    InvalidThreshold { threshold: usize, capacity: usize },
    #[error("training parameters invalid: {0}")]
    InvalidTraining(String),
    #[error("{}:{line}: {source}", .path.display())]
    ReplayLine {
        path: PathBuf,
        line: usize,
        #[source]
        source: SnapshotError,
    },
    #[error("{}:{line}: malformed reading: {source}", .path.display())]
    ReplayParse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Control bus channel
    #[serde(default)]
    pub bus: BusConfig,
    /// Shift tables and kickdown
    #[serde(default)]
    pub gears: GearsConfig,
    /// Lockup model and online learning
    #[serde(default)]
    pub lockup: LockupConfig,
    /// Control loop cadence
    #[serde(default)]
    pub control: ControlConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which device backs the bus channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusBackend {
    /// Linux SocketCAN interface
    #[default]
    Socketcan,
    /// In-memory bus, no hardware (explicit no-bus mode)
    Simulated,
}

impl std::fmt::Display for BusBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusBackend::Socketcan => write!(f, "socketcan"),
            BusBackend::Simulated => write!(f, "simulated"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub backend: BusBackend,
    /// Interface name, e.g. `can0`
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Line rate in bit/s
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Identifier of the gear-command frame
    #[serde(default = "default_gear_command_id")]
    pub gear_command_id: u32,
    /// Identifier of the lockup-command frame
    #[serde(default = "default_lockup_command_id")]
    pub lockup_command_id: u32,
    /// Telemetry identifiers this controller only listens to
    #[serde(default)]
    pub observed_ids: Vec<u32>,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default)]
    pub receive_timeout_ms: u64,
}

fn default_channel() -> String {
    "can0".to_string()
}

fn default_bitrate() -> u32 {
    500_000
}

fn default_gear_command_id() -> u32 {
    0x241
}

fn default_lockup_command_id() -> u32 {
    0x242
}

fn default_send_timeout_ms() -> u64 {
    10
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::default(),
            channel: default_channel(),
            bitrate: default_bitrate(),
            gear_command_id: default_gear_command_id(),
            lockup_command_id: default_lockup_command_id(),
            observed_ids: Vec::new(),
            send_timeout_ms: default_send_timeout_ms(),
            receive_timeout_ms: 0,
        }
    }
}

impl BusConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Command identifiers must be valid and disjoint from observed ones
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bitrate == 0 {
            return Err(ConfigError::InvalidBitrate);
        }
        for id in [self.gear_command_id, self.lockup_command_id]
            .iter()
            .chain(self.observed_ids.iter())
        {
            if *id > MAX_STANDARD_ID {
                return Err(ConfigError::InvalidIdentifier { id: *id });
            }
        }
        if self.gear_command_id == self.lockup_command_id {
            return Err(ConfigError::IdentifierCollision {
                id: self.gear_command_id,
                other: "the other command",
            });
        }
        for id in [self.gear_command_id, self.lockup_command_id] {
            if self.observed_ids.contains(&id) {
                return Err(ConfigError::IdentifierCollision { id, other: "an observed telemetry id" });
            }
        }
        if self.backend == BusBackend::Socketcan && !cfg!(feature = "socketcan") {
            return Err(ConfigError::BackendUnavailable { backend: self.backend });
        }
        Ok(())
    }
}

/// One named shift table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftProfileConfig {
    /// Upshift boundaries 1->2, 2->3, 3->4 in km/h
    pub boundaries_kmh: [f64; 3],
    /// Margin on each side of a boundary inside which the engaged gear is kept
    pub hysteresis_kmh: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GearsConfig {
    /// Name of the active entry in `profiles`
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_profiles")]
    pub profiles: BTreeMap<String, ShiftProfileConfig>,
    /// Throttle above which boundaries are pushed up
    #[serde(default = "default_kickdown_throttle")]
    pub kickdown_throttle: f64,
    /// Boundary offset at full throttle, km/h
    #[serde(default = "default_kickdown_offset")]
    pub kickdown_offset_kmh: f64,
}

fn default_profile() -> String {
    "normal".to_string()
}

fn default_profiles() -> BTreeMap<String, ShiftProfileConfig> {
    let mut profiles = BTreeMap::new();
    profiles.insert(
        "normal".to_string(),
        ShiftProfileConfig { boundaries_kmh: [17.5, 37.5, 62.5], hysteresis_kmh: 2.5 },
    );
    profiles.insert(
        "sport".to_string(),
        ShiftProfileConfig { boundaries_kmh: [22.5, 42.5, 67.5], hysteresis_kmh: 2.5 },
    );
    profiles
}

fn default_kickdown_throttle() -> f64 {
    0.8
}

fn default_kickdown_offset() -> f64 {
    15.0
}

impl Default for GearsConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            profiles: default_profiles(),
            kickdown_throttle: default_kickdown_throttle(),
            kickdown_offset_kmh: default_kickdown_offset(),
        }
    }
}

impl GearsConfig {
    /// The active shift table
    pub fn active_profile(&self) -> Result<&ShiftProfileConfig, ConfigError> {
        self.profiles.get(&self.profile).ok_or_else(|| ConfigError::UnknownProfile {
            name: self.profile.clone(),
            available: self.profiles.keys().cloned().collect::<Vec<_>>().join(", "),
        })
    }
}

/// Where retraining passes run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainMode {
    /// On the control loop, inside `maybe_retrain`
    Inline,
    /// On a blocking worker while the loop keeps predicting
    #[default]
    Background,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockupConfig {
    /// Weights file; the hash sidecar sits next to it. Defaults to the data dir.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    /// Buffered samples that trigger a retraining pass
    #[serde(default = "default_retrain_threshold")]
    pub retrain_threshold: usize,
    /// Hard bound on buffered samples
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default)]
    pub retrain_mode: RetrainMode,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Seed for shuffling during retraining
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Mean epoch loss above this fails the pass
    #[serde(default = "default_divergence_ceiling")]
    pub divergence_ceiling: f32,
    /// Label with the model's own decision when no observed outcome exists
    #[serde(default = "default_true")]
    pub self_label_fallback: bool,
}

fn default_retrain_threshold() -> usize {
    100
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_epochs() -> usize {
    10
}

fn default_batch_size() -> usize {
    32
}

fn default_learning_rate() -> f32 {
    0.001
}

fn default_seed() -> u64 {
    0x5EED
}

fn default_divergence_ceiling() -> f32 {
    50.0
}

fn default_true() -> bool {
    true
}

impl Default for LockupConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            retrain_threshold: default_retrain_threshold(),
            buffer_capacity: default_buffer_capacity(),
            retrain_mode: RetrainMode::default(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            seed: default_seed(),
            divergence_ceiling: default_divergence_ceiling(),
            self_label_fallback: true,
        }
    }
}

impl LockupConfig {
    /// Configured model path, or `<data dir>/models/torque_converter.json`
    pub fn resolved_model_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.model_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("models").join("torque_converter.json")),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retrain_threshold == 0 || self.retrain_threshold > self.buffer_capacity {
            return Err(ConfigError::InvalidThreshold {
                threshold: self.retrain_threshold,
                capacity: self.buffer_capacity,
            });
        }
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(ConfigError::InvalidTraining("epochs and batch_size must be positive".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::InvalidTraining(format!(
                "learning_rate {} must be positive",
                self.learning_rate
            )));
        }
        if !(self.divergence_ceiling.is_finite() && self.divergence_ceiling > 0.0) {
            return Err(ConfigError::InvalidTraining(format!(
                "divergence_ceiling {} must be positive",
                self.divergence_ceiling
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Target cycle rate
    #[serde(default = "default_cadence_hz")]
    pub cadence_hz: f64,
    /// Inbound telemetry frames drained per cycle
    #[serde(default = "default_inbound_poll_limit")]
    pub inbound_poll_limit: usize,
}

/// Slowest cadence the controller will run at
pub const MIN_CADENCE_HZ: f64 = 10.0;
/// Fastest cadence the controller will run at
pub const MAX_CADENCE_HZ: f64 = 1000.0;

fn default_cadence_hz() -> f64 {
    20.0
}

fn default_inbound_poll_limit() -> usize {
    8
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            cadence_hz: default_cadence_hz(),
            inbound_poll_limit: default_inbound_poll_limit(),
        }
    }
}

impl ControlConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.cadence_hz)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.cadence_hz.is_finite()
            && self.cadence_hz >= MIN_CADENCE_HZ
            && self.cadence_hz <= MAX_CADENCE_HZ)
        {
            return Err(ConfigError::InvalidCadence {
                hz: self.cadence_hz,
                min: MIN_CADENCE_HZ,
                max: MAX_CADENCE_HZ,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Config {
    /// Load configuration from `path`, or the default location when `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })
    }

    /// Check every section; the first problem found is returned
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()?;
        crate::gears::ShiftTable::from_config(&self.gears)?;
        self.lockup.validate()?;
        self.control.validate()?;
        Ok(())
    }
}

fn project_dirs() -> Result<directories::ProjectDirs, ConfigError> {
    directories::ProjectDirs::from("com", "atecu", "atecu").ok_or(ConfigError::NoProjectDirs)
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulated() -> Config {
        let mut config = Config::default();
        config.bus.backend = BusBackend::Simulated;
        config
    }

    #[test]
    fn test_defaults_are_valid() {
        simulated().validate().unwrap();
        let config = Config::default();
        assert_eq!(config.bus.gear_command_id, 0x241);
        assert_eq!(config.bus.lockup_command_id, 0x242);
        assert_eq!(config.bus.bitrate, 500_000);
        assert_eq!(config.lockup.retrain_threshold, 100);
        assert_eq!(config.control.period(), Duration::from_millis(50));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [bus]
            backend = "simulated"
            channel = "vcan0"

            [gears]
            profile = "sport"
            "#,
        )
        .unwrap();
        assert_eq!(config.bus.channel, "vcan0");
        assert_eq!(config.bus.bitrate, 500_000);
        assert_eq!(config.gears.active_profile().unwrap().boundaries_kmh, [22.5, 42.5, 67.5]);
        config.validate().unwrap();
    }

    #[test]
    fn test_command_ids_must_be_disjoint() {
        let mut config = simulated();
        config.bus.lockup_command_id = config.bus.gear_command_id;
        assert!(matches!(config.validate(), Err(ConfigError::IdentifierCollision { .. })));

        let mut config = simulated();
        config.bus.observed_ids = vec![0x100, 0x242];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IdentifierCollision { id: 0x242, .. })
        ));

        let mut config = simulated();
        config.bus.observed_ids = vec![0x800];
        assert!(matches!(config.validate(), Err(ConfigError::InvalidIdentifier { id: 0x800 })));
    }

    #[test]
    fn test_threshold_cannot_exceed_capacity() {
        let mut config = simulated();
        config.lockup.buffer_capacity = 50;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidThreshold { .. })));
    }

    #[test]
    fn test_cadence_below_ten_hz_rejected() {
        let mut config = simulated();
        config.control.cadence_hz = 5.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidCadence { .. })));
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let mut config = simulated();
        config.gears.profile = "eco".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("normal, sport"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = simulated();
        config.control.cadence_hz = 50.0;
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.control.cadence_hz, 50.0);
        assert_eq!(loaded.bus.backend, BusBackend::Simulated);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(loaded.gears.profile, "normal");
    }
}
