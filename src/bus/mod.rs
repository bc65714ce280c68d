//! Control bus channel
//!
//! Owns exactly one bus device and sequences it through bring-up, framed
//! send/receive with bounded waits, and bring-down. The channel knows nothing
//! about gears or lockup; it moves [`BusFrame`]s and classifies failures.
//!
//! No privilege escalation happens here. If the interface needs
//! administrative setup (bitrate, link state) the host must grant it to the
//! running user, or have it configured beforehand.

pub mod frame;
pub mod simulated;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socket_can;

pub use frame::{BusFrame, CommandIds, FRAME_PAYLOAD_LEN, MAX_STANDARD_ID};
pub use simulated::{FaultKind, SimulatedBus, SimulatedBusHandle};

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{BusBackend, BusConfig};

/// Bus failures
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus {channel}: no completion within {timeout:?}")]
    Timeout { channel: String, timeout: Duration },
    #[error("bus {channel}: link is down")]
    LinkDown { channel: String },
    #[error("bus {channel}: device access denied ({source})")]
    DeviceAccessDenied {
        channel: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bus {channel}: {source}")]
    Io {
        channel: String,
        #[source]
        source: std::io::Error,
    },
}

impl BusError {
    /// Map an OS error from the device into the bus taxonomy
    pub fn from_io(channel: &str, timeout: Duration, err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let channel = channel.to_string();
        match err.kind() {
            ErrorKind::PermissionDenied => return BusError::DeviceAccessDenied { channel, source: err },
            ErrorKind::TimedOut | ErrorKind::WouldBlock => return BusError::Timeout { channel, timeout },
            ErrorKind::NotFound | ErrorKind::NotConnected | ErrorKind::BrokenPipe => {
                return BusError::LinkDown { channel }
            }
            _ => {}
        }
        match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => BusError::DeviceAccessDenied { channel, source: err },
            Some(libc::ENETDOWN) | Some(libc::ENODEV) | Some(libc::ENXIO) => BusError::LinkDown { channel },
            Some(libc::ETIMEDOUT) | Some(libc::EAGAIN) | Some(libc::ENOBUFS) => {
                BusError::Timeout { channel, timeout }
            }
            _ => BusError::Io { channel, source: err },
        }
    }

    /// Short label used in logs and statistics
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::Timeout { .. } => "timeout",
            BusError::LinkDown { .. } => "link_down",
            BusError::DeviceAccessDenied { .. } => "access_denied",
            BusError::Io { .. } => "io",
        }
    }
}

/// A physical or virtual bus device
///
/// Implementations block for at most the timeout they are given.
pub trait BusDevice: Send {
    /// Interface name, used in errors and logs
    fn name(&self) -> &str;

    /// Configure the line rate and bring the link up
    fn bring_up(&mut self, bitrate: u32) -> Result<(), BusError>;

    /// Take the link down
    fn bring_down(&mut self) -> Result<(), BusError>;

    /// Put one frame on the bus
    fn transmit(&mut self, frame: &BusFrame, timeout: Duration) -> Result<(), BusError>;

    /// Wait up to `timeout` for one frame; `None` if the bus stayed quiet
    fn receive(&mut self, timeout: Duration) -> Result<Option<BusFrame>, BusError>;
}

/// Acknowledgement of a delivered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub id: u32,
    pub elapsed: Duration,
}

/// Link state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

/// An open bus channel
///
/// Dropping the channel closes it, so every exit path releases the device.
pub struct BusChannel {
    device: Box<dyn BusDevice>,
    state: LinkState,
    bitrate: u32,
}

impl BusChannel {
    /// Bring `device` up at `bitrate`
    pub fn open(mut device: Box<dyn BusDevice>, bitrate: u32) -> Result<Self, BusError> {
        device.bring_up(bitrate)?;
        info!(channel = device.name(), bitrate, "bus channel up");
        Ok(Self {
            device,
            state: LinkState::Up,
            bitrate,
        })
    }

    /// Open the backend selected in `config`
    pub fn from_config(config: &BusConfig) -> Result<Self, BusError> {
        match config.backend {
            BusBackend::Simulated => {
                let (device, _handle) = SimulatedBus::new(&config.channel);
                Self::open(Box::new(device), config.bitrate)
            }
            BusBackend::Socketcan => Self::open(socketcan_device(&config.channel)?, config.bitrate),
        }
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.state == LinkState::Up
    }

    /// Send one frame, blocking for at most `timeout`
    pub fn send(&mut self, frame: &BusFrame, timeout: Duration) -> Result<Ack, BusError> {
        if !self.is_up() {
            return Err(BusError::LinkDown { channel: self.name().to_string() });
        }
        let started = Instant::now();
        self.device.transmit(frame, timeout)?;
        let elapsed = started.elapsed();
        debug!(channel = self.name(), %frame, ?elapsed, "frame sent");
        Ok(Ack { id: frame.id(), elapsed })
    }

    /// Receive one frame, waiting at most `timeout`
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<BusFrame>, BusError> {
        if !self.is_up() {
            return Err(BusError::LinkDown { channel: self.name().to_string() });
        }
        self.device.receive(timeout)
    }

    /// Bring the link down. Safe to call repeatedly; failures are only logged.
    pub fn close(&mut self) {
        if self.state == LinkState::Down {
            return;
        }
        self.state = LinkState::Down;
        match self.device.bring_down() {
            Ok(()) => info!(channel = self.name(), "bus channel down"),
            Err(e) => warn!(channel = self.name(), error = %e, "bus bring-down failed"),
        }
    }
}

impl Drop for BusChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(all(target_os = "linux", feature = "socketcan"))]
fn socketcan_device(channel: &str) -> Result<Box<dyn BusDevice>, BusError> {
    Ok(Box::new(socket_can::SocketCanDevice::new(channel)))
}

#[cfg(not(all(target_os = "linux", feature = "socketcan")))]
fn socketcan_device(channel: &str) -> Result<Box<dyn BusDevice>, BusError> {
    Err(BusError::Io {
        channel: channel.to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "socketcan backend not compiled in (enable the `socketcan` feature)",
        ),
    })
}
