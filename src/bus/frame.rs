//! Bus frame layout and command encoding
//!
//! Every frame carries an 11-bit identifier and an 8-byte payload. Command
//! frames put their value in byte 0 and zero-fill the rest.

use serde::{Deserialize, Serialize};

use crate::types::GearState;

/// Payload bytes per frame
pub const FRAME_PAYLOAD_LEN: usize = 8;

/// Largest standard (11-bit) identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// A single bus frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawFrame")]
pub struct BusFrame {
    id: u32,
    len: u8,
    data: [u8; FRAME_PAYLOAD_LEN],
}

/// Unchecked wire form, validated through [`BusFrame::new`]
#[derive(Deserialize)]
struct RawFrame {
    id: u32,
    len: u8,
    data: [u8; FRAME_PAYLOAD_LEN],
}

impl TryFrom<RawFrame> for BusFrame {
    type Error = String;

    fn try_from(raw: RawFrame) -> Result<Self, Self::Error> {
        let payload = raw
            .data
            .get(..raw.len as usize)
            .ok_or_else(|| format!("frame length {} exceeds {} bytes", raw.len, FRAME_PAYLOAD_LEN))?;
        Self::new(raw.id, payload).ok_or_else(|| format!("identifier {:#x} is not an 11-bit id", raw.id))
    }
}

impl BusFrame {
    /// Frame from an identifier and up to eight payload bytes
    pub fn new(id: u32, payload: &[u8]) -> Option<Self> {
        if id > MAX_STANDARD_ID || payload.len() > FRAME_PAYLOAD_LEN {
            return None;
        }
        let mut data = [0u8; FRAME_PAYLOAD_LEN];
        data[..payload.len()].copy_from_slice(payload);
        Some(Self { id, len: payload.len() as u8, data })
    }

    /// Full-length command frame with `value` in byte 0
    fn command(id: u32, value: u8) -> Self {
        let mut data = [0u8; FRAME_PAYLOAD_LEN];
        data[0] = value;
        Self { id: id & MAX_STANDARD_ID, len: FRAME_PAYLOAD_LEN as u8, data }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The valid payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl std::fmt::Display for BusFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#05x} [{}] {}", self.id, self.len, hex::encode(self.payload()))
    }
}

/// Identifiers of the frames this controller emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandIds {
    pub gear: u32,
    pub lockup: u32,
}

impl CommandIds {
    pub fn from_config(config: &crate::config::BusConfig) -> Self {
        Self {
            gear: config.gear_command_id,
            lockup: config.lockup_command_id,
        }
    }

    /// Encode a gear command. Only forward gears are commanded over the bus.
    pub fn gear_frame(&self, gear: GearState) -> Option<BusFrame> {
        gear.forward_number().map(|n| BusFrame::command(self.gear, n))
    }

    pub fn lockup_frame(&self, engaged: bool) -> BusFrame {
        BusFrame::command(self.lockup, u8::from(engaged))
    }

    /// Decode a gear command emitted by [`CommandIds::gear_frame`]
    pub fn decode_gear(&self, frame: &BusFrame) -> Option<GearState> {
        if frame.id() != self.gear {
            return None;
        }
        frame.payload().first().and_then(|b| GearState::from_forward_number(*b))
    }

    /// Decode a lockup command emitted by [`CommandIds::lockup_frame`]
    pub fn decode_lockup(&self, frame: &BusFrame) -> Option<bool> {
        if frame.id() != self.lockup {
            return None;
        }
        match frame.payload().first() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        }
    }
}
