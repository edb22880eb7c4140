use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::RingBuf,
    programs::{ProgramError, TracePoint, UProbe, uprobe::UProbeLinkId},
};
use log::{info, warn};

pub mod discovery;
pub mod exec_watch;
pub mod mutex;

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub trait Probe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()>;
}

/// Probes that grow as new processes appear.
pub trait DynamicProbe {
    fn on_exec(&self, bpf: &mut Ebpf, process: &exec_watch::ExecProcess) -> Result<()>;
}

pub struct TracepointConfig<'a> {
    pub program_name: &'a str,
    pub category: &'a str,
    pub name: &'a str,
}

pub const POLL_INTERVAL_MS: u64 = 10;

fn tracepoint_exists(category: &str, name: &str) -> bool {
    const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

    TRACEFS_MOUNT_POINTS.iter().any(|base| {
        Path::new(base)
            .join("events")
            .join(category)
            .join(name)
            .exists()
    })
}

pub fn attach_tracepoint(bpf: &mut Ebpf, config: TracepointConfig) -> Result<bool> {
    if !tracepoint_exists(config.category, config.name) {
        warn!(
            "Tracepoint {}:{} not available; skipping {}",
            config.category, config.name, config.program_name
        );
        return Ok(false);
    }

    info!("Loading program {}", config.program_name);
    let program: &mut TracePoint = bpf
        .program_mut(config.program_name)
        .with_context(|| format!("Failed to find {} program", config.program_name))?
        .try_into()?;
    program.load()?;
    program
        .attach(config.category, config.name)
        .with_context(|| format!("Failed to attach {}", config.name))?;
    Ok(true)
}

/// Attaches `program_name` at the entry of `symbol` in `target`.
///
/// One program is attached to many library images, so it is loaded on first
/// use and reused afterwards.
pub fn attach_uprobe(
    bpf: &mut Ebpf,
    program_name: &str,
    symbol: &str,
    target: &str,
) -> Result<UProbeLinkId> {
    let program = uprobe_program(bpf, program_name)?;

    match program.load() {
        Ok(()) | Err(ProgramError::AlreadyLoaded) => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to load {}", program_name)),
    }

    program
        .attach(Some(symbol), 0, target, None)
        .with_context(|| format!("Failed to attach uprobe to {}:{}", target, symbol))
}

pub fn detach_uprobe(bpf: &mut Ebpf, program_name: &str, link: UProbeLinkId) -> Result<()> {
    uprobe_program(bpf, program_name)?
        .detach(link)
        .with_context(|| format!("Failed to detach {}", program_name))
}

fn uprobe_program<'a>(bpf: &'a mut Ebpf, program_name: &str) -> Result<&'a mut UProbe> {
    bpf.program_mut(program_name)
        .with_context(|| format!("Failed to find program: {}", program_name))?
        .try_into()
        .with_context(|| format!("Program {} is not a UProbe", program_name))
}

/// Drains `map_name` on a blocking task until shutdown. Records shorter than
/// `T` are skipped.
pub fn spawn_ringbuf_handler<T, F>(bpf: &mut Ebpf, map_name: &str, handler: F) -> Result<()>
where
    T: Copy + Send + 'static,
    F: Fn(T) + Send + 'static,
{
    let mut ring_buf = RingBuf::try_from(
        bpf.take_map(map_name)
            .with_context(|| format!("Failed to get {} map", map_name))?,
    )?;
    let shutdown = shutdown_flag();

    tokio::task::spawn_blocking(move || {
        while !shutdown.load(Ordering::Relaxed) {
            let mut has_work = false;
            while let Some(item) = ring_buf.next() {
                has_work = true;
                if item.len() >= std::mem::size_of::<T>() {
                    let event = unsafe { (item.as_ptr() as *const T).read_unaligned() };
                    handler(event);
                }
            }
            if !has_work {
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
        }
    });
    Ok(())
}
