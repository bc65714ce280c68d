//! Linux SocketCAN device
//!
//! Line rate and link state are set over netlink. When the running user lacks
//! the capability to do that, the interface is expected to have been brought
//! up by the host and is used as-is.

use ::socketcan::{CanFrame, CanInterface, CanSocket, EmbeddedFrame, Frame, Socket, StandardId};
use std::io;
use std::time::Duration;
use tracing::{debug, warn};

use super::{BusDevice, BusError, BusFrame};

pub struct SocketCanDevice {
    name: String,
    socket: Option<CanSocket>,
}

impl SocketCanDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            socket: None,
        }
    }

    fn netlink_error(err: impl std::fmt::Display) -> io::Error {
        let text = err.to_string();
        let lower = text.to_lowercase();
        if lower.contains("not permitted") || lower.contains("permission denied") {
            io::Error::new(io::ErrorKind::PermissionDenied, text)
        } else {
            io::Error::other(text)
        }
    }

    fn configure_link(&self, bitrate: u32) -> io::Result<()> {
        let iface = CanInterface::open(&self.name).map_err(Self::netlink_error)?;
        iface.bring_down().map_err(Self::netlink_error)?;
        iface.set_bitrate(bitrate, None).map_err(Self::netlink_error)?;
        iface.bring_up().map_err(Self::netlink_error)
    }

    /// `up` and `unknown` (virtual interfaces) both count as usable
    fn link_is_up(&self) -> bool {
        let path = format!("/sys/class/net/{}/operstate", self.name);
        match std::fs::read_to_string(path) {
            Ok(state) => matches!(state.trim(), "up" | "unknown"),
            Err(_) => false,
        }
    }

    fn socket(&self) -> Result<&CanSocket, BusError> {
        self.socket
            .as_ref()
            .ok_or_else(|| BusError::LinkDown { channel: self.name.clone() })
    }
}

impl BusDevice for SocketCanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn bring_up(&mut self, bitrate: u32) -> Result<(), BusError> {
        if let Err(e) = self.configure_link(bitrate) {
            if e.kind() == io::ErrorKind::PermissionDenied {
                warn!(channel = %self.name, "no permission to configure link; using host configuration");
            } else {
                return Err(BusError::from_io(&self.name, Duration::ZERO, e));
            }
        }
        if !self.link_is_up() {
            return Err(BusError::LinkDown { channel: self.name.clone() });
        }
        let socket = CanSocket::open(&self.name)
            .map_err(|e| BusError::from_io(&self.name, Duration::ZERO, e))?;
        self.socket = Some(socket);
        Ok(())
    }

    fn bring_down(&mut self) -> Result<(), BusError> {
        self.socket = None;
        let result = CanInterface::open(&self.name)
            .map_err(Self::netlink_error)
            .and_then(|iface| iface.bring_down().map_err(Self::netlink_error));
        result.map_err(|e| BusError::from_io(&self.name, Duration::ZERO, e))
    }

    fn transmit(&mut self, frame: &BusFrame, timeout: Duration) -> Result<(), BusError> {
        let socket = self.socket()?;
        let id = StandardId::new(frame.id() as u16).ok_or_else(|| BusError::Io {
            channel: self.name.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "identifier out of range"),
        })?;
        let can_frame = CanFrame::new(id, frame.payload()).ok_or_else(|| BusError::Io {
            channel: self.name.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "payload too long"),
        })?;
        socket
            .set_write_timeout(timeout)
            .and_then(|()| socket.write_frame(&can_frame))
            .map_err(|e| BusError::from_io(&self.name, timeout, e))
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<BusFrame>, BusError> {
        let socket = self.socket()?;
        let armed = if timeout.is_zero() {
            socket.set_nonblocking(true)
        } else {
            socket.set_nonblocking(false).and_then(|()| socket.set_read_timeout(timeout))
        };
        armed.map_err(|e| BusError::from_io(&self.name, timeout, e))?;

        match socket.read_frame() {
            Ok(frame) if !frame.is_extended() => Ok(BusFrame::new(frame.raw_id(), frame.data())),
            Ok(frame) => {
                debug!(channel = %self.name, id = frame.raw_id(), "ignoring extended frame");
                Ok(None)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(BusError::from_io(&self.name, timeout, e)),
        }
    }
}
