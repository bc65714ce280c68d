//! Status reporting

use std::io::Write;
use tracing::{debug, info, warn};

use crate::types::{GearState, StatusRecord};

/// Receives one status record per completed cycle
pub trait StatusSink: Send {
    fn emit(&mut self, record: &StatusRecord);
}

/// Logs every record at debug, and gear or lockup changes at info
#[derive(Debug, Default)]
pub struct LogStatusSink {
    last: Option<(GearState, bool)>,
}

impl LogStatusSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusSink for LogStatusSink {
    fn emit(&mut self, record: &StatusRecord) {
        let current = (record.gear, record.lockup);
        if self.last != Some(current) {
            info!(
                cycle = record.cycle,
                gear = %record.gear,
                lockup = record.lockup,
                efficiency = ?record.efficiency,
                "status changed"
            );
            self.last = Some(current);
        } else {
            debug!(cycle = record.cycle, gear = %record.gear, lockup = record.lockup, "status");
        }
    }
}

/// Writes one JSON object per line
pub struct JsonLinesStatusSink<W: Write + Send> {
    writer: W,
    failed: bool,
}

impl<W: Write + Send> JsonLinesStatusSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, failed: false }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> StatusSink for JsonLinesStatusSink<W> {
    fn emit(&mut self, record: &StatusRecord) {
        let result = serde_json::to_writer(&mut self.writer, record)
            .map_err(std::io::Error::from)
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush());
        match result {
            Ok(()) => self.failed = false,
            // Warn once per outage, not once per cycle
            Err(e) if !self.failed => {
                warn!(error = %e, "failed to write status record");
                self.failed = true;
            }
            Err(_) => {}
        }
    }
}
