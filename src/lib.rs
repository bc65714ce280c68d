//! atecu - Automatic Transmission Controller Library
//!
//! Controls gear selection and torque-converter lockup:
//! - Gear selection state machine with hysteresis and kickdown
//! - Lockup classifier with online learning and verified model artifacts
//! - Control-bus channel (SocketCAN or simulated) with typed failures
//! - Fixed-cadence controller tying them together
//!
//! # Example
//!
//! ```ignore
//! use atecu::config::Config;
//! use atecu::controller::{LogStatusSink, SyntheticDrive, TransmissionController};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     let controller = TransmissionController::startup(
//!         &config,
//!         Box::new(SyntheticDrive::new()),
//!         Box::new(LogStatusSink::new()),
//!     )?;
//!     let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
//!     controller.run(running, Some(200)).await;
//!     Ok(())
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod config;
pub mod bus;
pub mod gears;
pub mod lockup;
pub mod controller;
pub mod cli;

// Re-export commonly used types for convenience
pub use types::{GearState, SensorSnapshot, ShiftLever, StatusRecord};

pub use config::Config;

pub use bus::{BusChannel, BusError, BusFrame};

pub use gears::{GearSelector, ShiftTable};

pub use lockup::{IntegrityError, LockupPredictor, RetrainError};

pub use controller::{StartupError, TransmissionController};
