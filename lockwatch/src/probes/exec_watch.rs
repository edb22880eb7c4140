//! Exec notifications from the `probe_exec` tracepoint.
//!
//! The ring handler only queues pids; the engine loop drains the queue and
//! hands each process to the dynamic probes, which need `&mut Ebpf`.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use aya::Ebpf;
use lockwatch_common::{EXEC_EVENTS_MAP, EXEC_PROGRAM, ExecEvent};
use log::info;
use regex::Regex;
use tokio::sync::Notify;

use super::{TracepointConfig, attach_tracepoint, discovery, spawn_ringbuf_handler};

/// Pending pids, capped so a fork storm cannot grow it without bound.
pub type ExecPidQueue = Arc<Mutex<Vec<u32>>>;
pub type ExecNotify = Arc<Notify>;

const MAX_PENDING_EXECS: usize = 4096;

/// A freshly exec'd process and the lock libraries it maps.
#[derive(Debug, Clone)]
pub struct ExecProcess {
    pub pid: u32,
    pub libs: BTreeSet<String>,
}

impl ExecProcess {
    pub fn scan(pid: u32, pattern: &Regex) -> Self {
        Self {
            pid,
            libs: discovery::libraries_of_pid(pid, pattern),
        }
    }
}

/// Attaches the exec tracepoint and starts queueing pids. Returns `None` when
/// the tracepoint is unavailable on this kernel.
pub fn setup_exec_watch(bpf: &mut Ebpf) -> Result<Option<(ExecPidQueue, ExecNotify)>> {
    let attached = attach_tracepoint(
        bpf,
        TracepointConfig {
            program_name: EXEC_PROGRAM,
            category: "sched",
            name: "sched_process_exec",
        },
    )?;
    if !attached {
        return Ok(None);
    }

    let queue: ExecPidQueue = Arc::new(Mutex::new(Vec::new()));
    let notify: ExecNotify = Arc::new(Notify::new());

    let handler_queue = queue.clone();
    let handler_notify = notify.clone();
    spawn_ringbuf_handler(bpf, EXEC_EVENTS_MAP, move |event: ExecEvent| {
        let mut pending = handler_queue.lock().unwrap_or_else(|e| e.into_inner());
        if pending.len() < MAX_PENDING_EXECS {
            pending.push(event.pid);
        }
        drop(pending);
        handler_notify.notify_one();
    })?;

    info!("Exec watch enabled (sched:sched_process_exec)");
    Ok(Some((queue, notify)))
}

/// Takes every queued pid, deduplicated, in arrival order.
pub fn drain_pids(queue: &ExecPidQueue) -> Vec<u32> {
    let pending = std::mem::take(&mut *queue.lock().unwrap_or_else(|e| e.into_inner()));
    let mut seen = BTreeSet::new();
    pending.into_iter().filter(|pid| seen.insert(*pid)).collect()
}
