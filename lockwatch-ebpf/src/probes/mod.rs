pub mod exec_watch;
pub mod mutex;

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_current_task, bpf_ktime_get_ns,
        bpf_probe_read_kernel,
    },
    macros::map,
    maps::PerCpuArray,
};
use lockwatch_common::{CaptureOutcome, ProbeConfig, ProcessInfo, TaskContext};

/// Written by userspace through `EbpfLoader::set_global` before load.
#[unsafe(no_mangle)]
static PROBE_CONFIG: ProbeConfig = ProbeConfig::zeroed();

#[map]
pub static STATS: PerCpuArray<u64> =
    PerCpuArray::with_max_entries(CaptureOutcome::COUNT as u32, 0);

#[inline(always)]
pub fn load_config() -> ProbeConfig {
    // Volatile so the compiler cannot fold the zeroed initializer.
    unsafe { core::ptr::read_volatile(&PROBE_CONFIG) }
}

#[inline(always)]
pub fn record_outcome(outcome: CaptureOutcome) {
    if let Some(counter) = STATS.get_ptr_mut(outcome.index()) {
        unsafe { *counter += 1 };
    }
}

#[inline(always)]
fn read_field<T: Copy>(base: *const u8, offset: u32) -> Option<T> {
    if base.is_null() {
        return None;
    }
    let ptr = unsafe { base.add(offset as usize) as *const T };
    unsafe { bpf_probe_read_kernel(ptr).ok() }
}

#[inline(always)]
fn read_ptr(base: *const u8, offset: u32) -> Option<*const u8> {
    let addr: usize = read_field(base, offset)?;
    if addr == 0 { None } else { Some(addr as *const u8) }
}

/// The task currently running the probe, seen through BTF-derived offsets.
pub struct CurrentTask<'a> {
    config: &'a ProbeConfig,
}

impl<'a> CurrentTask<'a> {
    #[inline(always)]
    pub fn new(config: &'a ProbeConfig) -> Self {
        Self { config }
    }
}

impl TaskContext for CurrentTask<'_> {
    #[inline(always)]
    fn mntns_id(&self) -> Option<u64> {
        if self.config.mntns_resolvable == 0 {
            return Some(0);
        }
        // task_struct->nsproxy->mnt_ns->ns.inum
        let task = unsafe { bpf_get_current_task() } as *const u8;
        let nsproxy = read_ptr(task, self.config.task_nsproxy_offset)?;
        let mnt_ns = read_ptr(nsproxy, self.config.nsproxy_mnt_ns_offset)?;
        let inum: u32 = read_field(mnt_ns, self.config.mnt_ns_inum_offset)?;
        Some(inum as u64)
    }

    #[inline(always)]
    fn process(&self, mntns_id: u64) -> Option<ProcessInfo> {
        let pid_tgid = bpf_get_current_pid_tgid();
        let comm = bpf_get_current_comm().ok()?;
        Some(ProcessInfo {
            pid: (pid_tgid >> 32) as u32,
            tid: pid_tgid as u32,
            mntns_id,
            comm,
        })
    }

    #[inline(always)]
    fn monotonic_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }
}
