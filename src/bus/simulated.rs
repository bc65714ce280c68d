//! In-memory bus device
//!
//! Used when no hardware bus is present and by tests. Transmitted frames are
//! recorded, inbound frames can be queued, and failures can be injected on the
//! next bring-up, bring-down, transmit or receive.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{BusDevice, BusError, BusFrame};

/// Failure to inject into the simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Timeout,
    LinkDown,
    AccessDenied,
}

impl FaultKind {
    fn into_error(self, channel: &str, timeout: Duration) -> BusError {
        let channel = channel.to_string();
        match self {
            FaultKind::Timeout => BusError::Timeout { channel, timeout },
            FaultKind::LinkDown => BusError::LinkDown { channel },
            FaultKind::AccessDenied => BusError::DeviceAccessDenied {
                channel,
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            },
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    up: bool,
    bitrate: Option<u32>,
    sent: Vec<BusFrame>,
    inbound: VecDeque<BusFrame>,
    bring_down_count: usize,
    fail_bring_up: Option<FaultKind>,
    fail_bring_down: Option<FaultKind>,
    send_faults: VecDeque<FaultKind>,
    receive_faults: VecDeque<FaultKind>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Simulated bus device
pub struct SimulatedBus {
    name: String,
    state: Arc<Mutex<SimState>>,
}

/// Inspection and fault-injection handle for a [`SimulatedBus`]
#[derive(Clone)]
pub struct SimulatedBusHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    /// Create a device and the handle that observes it
    pub fn new(name: &str) -> (Self, SimulatedBusHandle) {
        let state = Arc::new(Mutex::new(SimState::default()));
        (
            Self {
                name: name.to_string(),
                state: state.clone(),
            },
            SimulatedBusHandle { state },
        )
    }
}

impl BusDevice for SimulatedBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn bring_up(&mut self, bitrate: u32) -> Result<(), BusError> {
        let mut state = lock(&self.state);
        if let Some(fault) = state.fail_bring_up.take() {
            return Err(fault.into_error(&self.name, Duration::ZERO));
        }
        state.up = true;
        state.bitrate = Some(bitrate);
        Ok(())
    }

    fn bring_down(&mut self) -> Result<(), BusError> {
        let mut state = lock(&self.state);
        state.bring_down_count += 1;
        state.up = false;
        match state.fail_bring_down.take() {
            Some(fault) => Err(fault.into_error(&self.name, Duration::ZERO)),
            None => Ok(()),
        }
    }

    fn transmit(&mut self, frame: &BusFrame, timeout: Duration) -> Result<(), BusError> {
        let mut state = lock(&self.state);
        if let Some(fault) = state.send_faults.pop_front() {
            return Err(fault.into_error(&self.name, timeout));
        }
        if !state.up {
            return Err(BusError::LinkDown { channel: self.name.clone() });
        }
        state.sent.push(*frame);
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<BusFrame>, BusError> {
        let mut state = lock(&self.state);
        if let Some(fault) = state.receive_faults.pop_front() {
            return Err(fault.into_error(&self.name, timeout));
        }
        Ok(state.inbound.pop_front())
    }
}

impl SimulatedBusHandle {
    /// Frames transmitted so far, oldest first
    pub fn sent(&self) -> Vec<BusFrame> {
        lock(&self.state).sent.clone()
    }

    pub fn is_up(&self) -> bool {
        lock(&self.state).up
    }

    /// Bitrate given at the last successful bring-up
    pub fn bitrate(&self) -> Option<u32> {
        lock(&self.state).bitrate
    }

    pub fn bring_down_count(&self) -> usize {
        lock(&self.state).bring_down_count
    }

    /// Queue a frame for the next `receive`
    pub fn push_inbound(&self, frame: BusFrame) {
        lock(&self.state).inbound.push_back(frame);
    }

    /// Fail the next transmit with `fault`; calls queue in order
    pub fn fail_next_send(&self, fault: FaultKind) {
        lock(&self.state).send_faults.push_back(fault);
    }

    pub fn fail_next_receive(&self, fault: FaultKind) {
        lock(&self.state).receive_faults.push_back(fault);
    }

    pub fn fail_bring_up(&self, fault: FaultKind) {
        lock(&self.state).fail_bring_up = Some(fault);
    }

    pub fn fail_bring_down(&self, fault: FaultKind) {
        lock(&self.state).fail_bring_down = Some(fault);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_faults_fire_once_in_order() {
        let (mut bus, handle) = SimulatedBus::new("sim");
        bus.bring_up(250_000).unwrap();
        handle.fail_next_send(FaultKind::Timeout);
        handle.fail_next_send(FaultKind::LinkDown);
        let frame = BusFrame::new(0x10, &[1]).unwrap();
        let t = Duration::from_millis(3);

        assert!(matches!(bus.transmit(&frame, t), Err(BusError::Timeout { timeout, .. }) if timeout == t));
        assert!(matches!(bus.transmit(&frame, t), Err(BusError::LinkDown { .. })));
        bus.transmit(&frame, t).unwrap();
        assert_eq!(handle.sent().len(), 1);
    }

    #[test]
    fn test_transmit_requires_link_up() {
        let (mut bus, handle) = SimulatedBus::new("sim");
        let frame = BusFrame::new(0x10, &[1]).unwrap();
        assert!(matches!(bus.transmit(&frame, Duration::ZERO), Err(BusError::LinkDown { .. })));
        assert!(handle.sent().is_empty());
    }

    #[test]
    fn test_receive_fault() {
        let (mut bus, handle) = SimulatedBus::new("sim");
        bus.bring_up(500_000).unwrap();
        handle.fail_next_receive(FaultKind::AccessDenied);
        assert!(matches!(bus.receive(Duration::ZERO), Err(BusError::DeviceAccessDenied { .. })));
        assert_eq!(bus.receive(Duration::ZERO).unwrap(), None);
    }
}
