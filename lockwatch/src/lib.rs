pub mod btf;
pub mod events;
pub mod filter;
pub mod metadata;
pub mod probes;
pub mod settings;
pub mod stats;
pub mod telemetry;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use lockwatch_common::PROBE_CONFIG_GLOBAL;
use log::{info, warn};
use tokio::{signal, time::Instant};

use crate::{
    btf::MntNsOffsets,
    filter::FilterPlan,
    probes::{
        DynamicProbe, Probe,
        exec_watch::{self, ExecNotify, ExecPidQueue, ExecProcess},
        mutex::MutexProbe,
        request_shutdown,
    },
    settings::Settings,
    stats::StatsReader,
};

/// Time for the dynamic loader of an exec'd process to map its libraries.
const EXEC_SETTLE_MS: u64 = 50;

pub struct LockWatchEngine {
    pub settings: Settings,
    bpf: Ebpf,
    mutex_probe: MutexProbe,
    stats: StatsReader,
}

impl LockWatchEngine {
    pub fn new(settings: Settings, bytecode: &[u8]) -> Result<Self> {
        let mut bpf = load_object(&settings, bytecode)?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }

        let stats = StatsReader::new(&mut bpf)?;
        let mutex_probe = MutexProbe::new(&settings)?;
        Ok(Self {
            settings,
            bpf,
            mutex_probe,
            stats,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        self.mutex_probe.attach(&mut self.bpf)?;

        let exec_watch = if self.settings.exec_watch() && self.mutex_probe.is_dynamic() {
            exec_watch::setup_exec_watch(&mut self.bpf)?
        } else {
            None
        };

        let mut stats_tick =
            tokio::time::interval(Duration::from_secs(self.settings.stats_interval_secs()));
        // The first tick completes immediately.
        stats_tick.tick().await;

        // Set when an exec arrives; the queue is drained once it passes.
        let mut exec_deadline: Option<Instant> = None;

        info!("Monitoring active. Press Ctrl-C to exit.");
        loop {
            tokio::select! {
                res = signal::ctrl_c() => {
                    res.context("Failed to listen for Ctrl-C")?;
                    break;
                }
                _ = stats_tick.tick() => {
                    if let Err(e) = self.stats.report() {
                        warn!("Failed to read capture stats: {:#}", e);
                    }
                }
                _ = wait_for_exec(exec_watch.as_ref().map(|(_, notify)| notify)),
                    if exec_deadline.is_none() =>
                {
                    exec_deadline = Some(Instant::now() + Duration::from_millis(EXEC_SETTLE_MS));
                }
                _ = exec_settled(exec_deadline) => {
                    exec_deadline = None;
                    if let Some((queue, _)) = &exec_watch {
                        self.handle_execs(queue);
                    }
                }
            }
        }

        info!("Exiting...");
        request_shutdown();
        if let Err(e) = self.stats.report() {
            warn!("Failed to read final capture stats: {:#}", e);
        }
        Ok(())
    }

    fn handle_execs(&mut self, queue: &ExecPidQueue) {
        for pid in exec_watch::drain_pids(queue) {
            let process = ExecProcess::scan(pid, self.mutex_probe.pattern());
            if process.libs.is_empty() {
                continue;
            }
            if let Err(e) = self.mutex_probe.on_exec(&mut self.bpf, &process) {
                warn!("Exec handling for pid {} failed: {:#}", pid, e);
            }
        }
    }
}

/// Resolves kernel offsets and the filter, bakes both into `PROBE_CONFIG`,
/// loads the object and fills the filter map. Nothing is attached yet.
fn load_object(settings: &Settings, bytecode: &[u8]) -> Result<Ebpf> {
    if bytecode.is_empty() {
        bail!("eBPF object was not built; rebuild with a nightly toolchain and bpf-linker");
    }
    bump_memlock_rlimit()?;

    let mut filter = FilterPlan::from_settings(&settings.filter)?;
    let offsets = match MntNsOffsets::discover() {
        Ok(offsets) => Some(offsets),
        Err(e) => {
            warn!(
                "Kernel BTF unavailable, mount namespace ids will be 0: {:#}",
                e
            );
            filter.disable_for_unresolved_mntns();
            None
        }
    };
    let config = btf::probe_config(offsets, filter.mode());

    let mut bpf = EbpfLoader::new()
        .set_global(PROBE_CONFIG_GLOBAL, &config, true)
        .load(bytecode)
        .context("Failed to load eBPF object")?;
    filter.install(&mut bpf)?;
    Ok(bpf)
}

/// Loads the object without attaching anything, for metadata validation.
pub fn load_for_inspection(bytecode: &[u8]) -> Result<Ebpf> {
    if bytecode.is_empty() {
        bail!("eBPF object was not built; rebuild with a nightly toolchain and bpf-linker");
    }
    bump_memlock_rlimit()?;
    EbpfLoader::new()
        .load(bytecode)
        .context("Failed to load eBPF object")
}

async fn wait_for_exec(notify: Option<&ExecNotify>) {
    match notify {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

async fn exec_settled(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
