//! Exec watch tracepoint for late library discovery.
//!
//! Tells userspace when a process execs so uprobes can be attached to any
//! libc image that was not mapped when the probes were first installed.

use aya_ebpf::{
    helpers::bpf_get_current_pid_tgid,
    macros::{map, tracepoint},
    maps::RingBuf,
    programs::TracePointContext,
};
use aya_log_ebpf::debug;
use lockwatch_common::{EXEC_RING_BYTES, ExecEvent};

#[map]
pub static EXEC_EVENTS: RingBuf = RingBuf::with_byte_size(EXEC_RING_BYTES, 0);

/// Tracepoint for sched_process_exec.
#[tracepoint]
pub fn probe_exec(ctx: TracePointContext) -> u32 {
    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    match EXEC_EVENTS.reserve::<ExecEvent>(0) {
        Some(mut slot) => {
            slot.write(ExecEvent { pid, _pad: 0 });
            slot.submit(0);
        }
        None => debug!(&ctx, "exec ring full, pid {} not reported", pid),
    }
    0
}
