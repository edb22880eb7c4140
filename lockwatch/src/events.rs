//! Decoding and output of captured mutex events.

use std::sync::atomic::{AtomicU64, Ordering};

use lockwatch_common::{MutexEvent, TASK_COMM_LEN};
use log::debug;
use serde::Serialize;

use crate::{settings::OutputFormat, telemetry};

/// Records dropped because their operation tag was not lock or unlock.
static UNKNOWN_OPERATIONS: AtomicU64 = AtomicU64::new(0);

pub fn take_unknown_operations() -> u64 {
    UNKNOWN_OPERATIONS.swap(0, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    /// Monotonic clock, not wall time.
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    pub mntns_id: u64,
    pub comm: String,
    pub mutex_addr: u64,
    pub operation: &'static str,
}

impl LockRecord {
    /// Fails with the raw tag when the operation is unknown.
    pub fn from_event(event: &MutexEvent) -> Result<Self, u32> {
        let operation = event.operation()?;
        Ok(Self {
            timestamp_ns: event.timestamp,
            pid: event.process.pid,
            tid: event.process.tid,
            mntns_id: event.process.mntns_id,
            comm: decode_comm(&event.process.comm),
            mutex_addr: event.mutex_addr,
            operation: operation.as_str(),
        })
    }

    pub fn to_text(&self) -> String {
        format!(
            "MUTEX_{} pid={} tid={} comm={} mntns={} addr={:#x} ts={}",
            self.operation.to_ascii_uppercase(),
            self.pid,
            self.tid,
            self.comm,
            self.mntns_id,
            self.mutex_addr,
            self.timestamp_ns
        )
    }
}

/// `comm` is NUL padded and may be cut mid character by the kernel.
pub fn decode_comm(comm: &[u8; TASK_COMM_LEN]) -> String {
    let end = comm.iter().position(|b| *b == 0).unwrap_or(comm.len());
    std::str::from_utf8(&comm[..end])
        .unwrap_or("<invalid>")
        .to_string()
}

/// Turns ring records into output lines.
#[derive(Debug, Clone, Copy)]
pub struct EventSink {
    format: OutputFormat,
}

impl EventSink {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn render(&self, event: &MutexEvent) -> Option<String> {
        let record = match LockRecord::from_event(event) {
            Ok(record) => record,
            Err(raw) => {
                UNKNOWN_OPERATIONS.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Skipping event with unknown operation {} (pid={})",
                    raw, event.process.pid
                );
                return None;
            }
        };
        telemetry::record_mutex_event(record.operation);

        match self.format {
            OutputFormat::Text => Some(record.to_text()),
            OutputFormat::Json => match serde_json::to_string(&record) {
                Ok(line) => Some(line),
                Err(e) => {
                    debug!("Failed to serialize {:?}: {}", record, e);
                    None
                }
            },
        }
    }

    pub fn handle(&self, event: MutexEvent) {
        if let Some(line) = self.render(&event) {
            println!("{}", line);
        }
    }
}
