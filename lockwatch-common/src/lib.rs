#![no_std]

pub mod capture;
pub mod filter;

pub use capture::{CaptureOutcome, EventRing, EventSlot, TaskContext, capture};
pub use filter::{FilterMode, MountNsFilter};

pub const TASK_COMM_LEN: usize = 16;

/// Backing storage of the `EVENTS` ring buffer, in bytes.
pub const EVENTS_RING_BYTES: u32 = 1024 * 256;
pub const EXEC_RING_BYTES: u32 = 64 * 1024;
pub const MAX_FILTER_ENTRIES: u32 = 10240;

pub const EVENTS_MAP: &str = "EVENTS";
pub const EXEC_EVENTS_MAP: &str = "EXEC_EVENTS";
pub const STATS_MAP: &str = "STATS";
pub const MNTNS_FILTER_MAP: &str = "MNTNS_FILTER";
pub const PROBE_CONFIG_GLOBAL: &str = "PROBE_CONFIG";

pub const LOCK_PROGRAM: &str = "trace_uprobe_mutex_lock";
pub const UNLOCK_PROGRAM: &str = "trace_uprobe_mutex_unlock";
pub const EXEC_PROGRAM: &str = "probe_exec";

pub const LOCK_SYMBOL: &str = "pthread_mutex_lock";
pub const UNLOCK_SYMBOL: &str = "pthread_mutex_unlock";

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Lock = 0,
    Unlock = 1,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Operation::Lock => "lock",
            Operation::Unlock => "unlock",
        }
    }
}

impl TryFrom<u32> for Operation {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Operation::Lock),
            1 => Ok(Operation::Unlock),
            other => Err(other),
        }
    }
}

/// Identity of the thread that hit a probe, latched at capture time.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Thread group id (the userspace "pid").
    pub pid: u32,
    pub tid: u32,
    /// Inode number of the mount namespace, 0 when unresolved.
    pub mntns_id: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

/// One lock or unlock occurrence as written into the `EVENTS` ring.
///
/// Field order and widths are the wire contract; consumers decode records
/// positionally. `operation` stays a raw `u32` so that a corrupted value never
/// becomes an invalid enum discriminant on the reading side.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutexEvent {
    pub timestamp: u64,
    pub process: ProcessInfo,
    pub mutex_addr: u64,
    pub operation: u32,
    pub _pad: u32,
}

impl MutexEvent {
    pub fn operation(&self) -> Result<Operation, u32> {
        Operation::try_from(self.operation)
    }
}

/// Emitted by the `sched_process_exec` tracepoint so userspace can look for
/// freshly mapped lock libraries.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ExecEvent {
    pub pid: u32,
    pub _pad: u32,
}

/// Load-time configuration written into the `PROBE_CONFIG` global.
///
/// The offsets come from the running kernel's BTF; the eBPF side never embeds
/// struct layouts. `mntns_resolvable == 0` means they could not be found and
/// every event carries `mntns_id == 0`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeConfig {
    pub task_nsproxy_offset: u32,
    pub nsproxy_mnt_ns_offset: u32,
    pub mnt_ns_inum_offset: u32,
    pub mntns_resolvable: u8,
    pub filter_mode: u8,
    pub _pad: [u8; 2],
}

impl ProbeConfig {
    pub const fn zeroed() -> Self {
        Self {
            task_nsproxy_offset: 0,
            nsproxy_mnt_ns_offset: 0,
            mnt_ns_inum_offset: 0,
            mntns_resolvable: 0,
            filter_mode: 0,
            _pad: [0; 2],
        }
    }

    pub fn filter_mode(&self) -> FilterMode {
        FilterMode::from(self.filter_mode)
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for MutexEvent {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ExecEvent {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ProbeConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn test_wire_layout() {
        assert_eq!(size_of::<ProcessInfo>(), 32);
        assert_eq!(offset_of!(ProcessInfo, pid), 0);
        assert_eq!(offset_of!(ProcessInfo, tid), 4);
        assert_eq!(offset_of!(ProcessInfo, mntns_id), 8);
        assert_eq!(offset_of!(ProcessInfo, comm), 16);

        assert_eq!(size_of::<MutexEvent>(), 56);
        assert_eq!(offset_of!(MutexEvent, timestamp), 0);
        assert_eq!(offset_of!(MutexEvent, process), 8);
        assert_eq!(offset_of!(MutexEvent, mutex_addr), 40);
        assert_eq!(offset_of!(MutexEvent, operation), 48);
    }

    #[test]
    fn test_operation_decoding() {
        assert_eq!(Operation::try_from(0), Ok(Operation::Lock));
        assert_eq!(Operation::try_from(1), Ok(Operation::Unlock));
        assert_eq!(Operation::try_from(7), Err(7));
        assert_eq!(Operation::Unlock as u32, 1);
    }

    #[test]
    fn test_probe_config_filter_mode() {
        let mut config = ProbeConfig::zeroed();
        assert_eq!(config.filter_mode(), FilterMode::Disabled);
        config.filter_mode = FilterMode::Deny as u8;
        assert_eq!(config.filter_mode(), FilterMode::Deny);
    }
}
