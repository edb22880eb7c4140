use std::{
    collections::{BTreeSet, HashSet},
    os::unix::fs::MetadataExt,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result, bail};
use aya::{Ebpf, programs::uprobe::UProbeLinkId};
use lockwatch_common::{
    EVENTS_MAP, LOCK_PROGRAM, LOCK_SYMBOL, MutexEvent, UNLOCK_PROGRAM, UNLOCK_SYMBOL,
};
use log::{info, warn};
use regex::Regex;

use super::{
    DynamicProbe, Probe, attach_uprobe, detach_uprobe, discovery, exec_watch::ExecProcess,
    spawn_ringbuf_handler,
};
use crate::{events::EventSink, settings::Settings, telemetry};

const PROBE_NAME: &str = "mutex";

/// `(st_dev, st_ino)` of a library image. Uprobes are keyed on the inode, so
/// one image seen through several `/proc/<pid>/root` paths is probed once.
type FileId = (u64, u64);

fn file_id(path: impl AsRef<Path>) -> Result<FileId> {
    let meta = std::fs::metadata(path.as_ref())
        .with_context(|| format!("Failed to stat {}", path.as_ref().display()))?;
    Ok((meta.dev(), meta.ino()))
}

/// Something both mutex entry points can be attached to.
trait UprobeTarget {
    type Link;

    fn attach(&mut self, program: &str, symbol: &str) -> Result<Self::Link>;
    fn detach(&mut self, program: &str, link: Self::Link) -> Result<()>;
}

struct LibraryImage<'a> {
    bpf: &'a mut Ebpf,
    path: &'a str,
}

impl UprobeTarget for LibraryImage<'_> {
    type Link = UProbeLinkId;

    fn attach(&mut self, program: &str, symbol: &str) -> Result<UProbeLinkId> {
        attach_uprobe(&mut *self.bpf, program, symbol, self.path)
    }

    fn detach(&mut self, program: &str, link: UProbeLinkId) -> Result<()> {
        detach_uprobe(&mut *self.bpf, program, link)
    }
}

/// Attaches the lock and unlock programs, or neither. A lone lock probe
/// would report acquisitions that never release.
fn attach_entry_points<T: UprobeTarget>(target: &mut T) -> Result<()> {
    let lock = target.attach(LOCK_PROGRAM, LOCK_SYMBOL)?;
    if let Err(e) = target.attach(UNLOCK_PROGRAM, UNLOCK_SYMBOL) {
        if let Err(detach_err) = target.detach(LOCK_PROGRAM, lock) {
            warn!("Failed to roll back {}: {:#}", LOCK_PROGRAM, detach_err);
        }
        return Err(e);
    }
    Ok(())
}

#[derive(Default)]
struct KnownTargets {
    files: HashSet<FileId>,
}

pub struct MutexProbe {
    explicit_paths: Option<Vec<String>>,
    discover: bool,
    pattern: Regex,
    sink: EventSink,
    known_targets: Arc<Mutex<KnownTargets>>,
}

impl MutexProbe {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self {
            explicit_paths: settings.probe.library_paths.clone().filter(|p| !p.is_empty()),
            discover: settings.discover(),
            pattern: discovery::lock_library_regex()?,
            sink: EventSink::new(settings.output_format()),
            known_targets: Arc::new(Mutex::new(KnownTargets::default())),
        })
    }

    /// Whether new processes can bring new targets.
    pub fn is_dynamic(&self) -> bool {
        self.explicit_paths.is_none() && self.discover
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn attached_count(&self) -> usize {
        self.known_targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .files
            .len()
    }

    fn targets(&self) -> Result<BTreeSet<String>> {
        if let Some(paths) = &self.explicit_paths {
            return Ok(paths.iter().cloned().collect());
        }
        if !self.discover {
            bail!("PROBE__DISCOVER is off and no PROBE__LIBRARY_PATHS given");
        }
        discovery::find_lock_libraries(&self.pattern)
    }

    /// Returns `Ok(false)` when the image is already probed. The path is
    /// stat'ed on every call since `/proc/<pid>/root` paths outlive their pid.
    fn attach_library(&self, bpf: &mut Ebpf, path: &str) -> Result<bool> {
        let id = file_id(path)?;
        if self.is_attached(id) {
            return Ok(false);
        }

        attach_entry_points(&mut LibraryImage { bpf, path })?;

        self.known_targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .files
            .insert(id);
        Ok(true)
    }

    fn is_attached(&self, id: FileId) -> bool {
        self.known_targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .files
            .contains(&id)
    }
}

impl Probe for MutexProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()> {
        let targets = self.targets()?;

        for path in &targets {
            match self.attach_library(bpf, path) {
                Ok(true) => info!("Attached mutex probes to {}", path),
                Ok(false) => {}
                // glibc >= 2.34 ships a libpthread stub without these symbols.
                Err(e) => warn!("Failed to attach to {}: {:#}", path, e),
            }
        }

        let attached = self.attached_count();
        if attached == 0 {
            bail!(
                "No mutex probes attached; checked {} candidate libraries",
                targets.len()
            );
        }
        telemetry::record_active_probe(PROBE_NAME, attached as u64);

        let sink = self.sink;
        spawn_ringbuf_handler(bpf, EVENTS_MAP, move |event: MutexEvent| sink.handle(event))?;

        Ok(())
    }
}

impl DynamicProbe for MutexProbe {
    fn on_exec(&self, bpf: &mut Ebpf, process: &ExecProcess) -> Result<()> {
        let mut attached_any = false;
        for path in &process.libs {
            match self.attach_library(bpf, path) {
                Ok(true) => {
                    attached_any = true;
                    info!(
                        "[Re-discovery] Attached mutex probes to {} (PID: {})",
                        path, process.pid
                    );
                }
                Ok(false) => {}
                Err(e) => warn!("[Re-discovery] Failed to attach to {}: {:#}", path, e),
            }
        }
        if attached_any {
            telemetry::record_active_probe(PROBE_NAME, self.attached_count() as u64);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ProbeSettings;

    fn settings(probe: ProbeSettings) -> Settings {
        Settings {
            probe,
            ..Default::default()
        }
    }

    #[test]
    fn test_explicit_paths_disable_rediscovery() {
        let probe = MutexProbe::new(&settings(ProbeSettings {
            library_paths: Some(vec!["/lib/libc.so.6".to_string()]),
            ..Default::default()
        }))
        .unwrap();

        assert!(!probe.is_dynamic());
        assert_eq!(
            probe.targets().unwrap().into_iter().collect::<Vec<_>>(),
            vec!["/lib/libc.so.6".to_string()]
        );
    }

    #[test]
    fn test_empty_path_list_falls_back_to_discovery() {
        let probe = MutexProbe::new(&settings(ProbeSettings {
            library_paths: Some(Vec::new()),
            ..Default::default()
        }))
        .unwrap();
        assert!(probe.is_dynamic());
    }

    #[test]
    fn test_no_source_of_targets_is_an_error() {
        let probe = MutexProbe::new(&settings(ProbeSettings {
            discover: Some(false),
            ..Default::default()
        }))
        .unwrap();
        assert!(!probe.is_dynamic());
        assert!(probe.targets().is_err());
    }

    #[test]
    fn test_new_probe_has_nothing_attached() {
        let probe = MutexProbe::new(&Settings::default()).unwrap();
        assert_eq!(probe.attached_count(), 0);
        assert!(!probe.is_attached((0, 0)));
    }

    #[test]
    fn test_replaced_image_behind_same_path_is_not_attached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libc.so.6");
        std::fs::write(&path, b"old image").unwrap();
        // Held open so the old inode cannot be recycled for the new file.
        let _old_handle = std::fs::File::open(&path).unwrap();
        let old = file_id(&path).unwrap();

        let probe = MutexProbe::new(&Settings::default()).unwrap();
        probe.known_targets.lock().unwrap().files.insert(old);
        assert!(probe.is_attached(file_id(&path).unwrap()));

        // A recycled pid's /proc/<pid>/root now leads to a different libc.
        let staged = dir.path().join("libc.so.6.new");
        std::fs::write(&staged, b"new image").unwrap();
        std::fs::rename(&staged, &path).unwrap();

        let new = file_id(&path).unwrap();
        assert_ne!(old, new);
        assert!(!probe.is_attached(new));
    }

    #[test]
    fn test_missing_library_fails_to_stat() {
        assert!(file_id("/nonexistent/libc.so.6").is_err());
    }

    #[derive(Default)]
    struct RecordingTarget {
        fail_on: Option<&'static str>,
        fail_detach: bool,
        attached: Vec<&'static str>,
        detached: Vec<String>,
    }

    impl UprobeTarget for RecordingTarget {
        type Link = &'static str;

        fn attach(&mut self, _program: &str, symbol: &str) -> Result<&'static str> {
            let symbol = if symbol == LOCK_SYMBOL {
                LOCK_SYMBOL
            } else {
                UNLOCK_SYMBOL
            };
            if self.fail_on == Some(symbol) {
                bail!("symbol {} not found", symbol);
            }
            self.attached.push(symbol);
            Ok(symbol)
        }

        fn detach(&mut self, program: &str, link: &'static str) -> Result<()> {
            if self.fail_detach {
                bail!("detach refused");
            }
            self.attached.retain(|s| *s != link);
            self.detached.push(program.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_both_entry_points_attached() {
        let mut target = RecordingTarget::default();
        attach_entry_points(&mut target).unwrap();
        assert_eq!(target.attached, vec![LOCK_SYMBOL, UNLOCK_SYMBOL]);
        assert!(target.detached.is_empty());
    }

    #[test]
    fn test_unlock_failure_rolls_back_lock() {
        let mut target = RecordingTarget {
            fail_on: Some(UNLOCK_SYMBOL),
            ..Default::default()
        };
        assert!(attach_entry_points(&mut target).is_err());
        assert!(target.attached.is_empty());
        assert_eq!(target.detached, vec![LOCK_PROGRAM.to_string()]);
    }

    #[test]
    fn test_lock_failure_attaches_nothing() {
        let mut target = RecordingTarget {
            fail_on: Some(LOCK_SYMBOL),
            ..Default::default()
        };
        assert!(attach_entry_points(&mut target).is_err());
        assert!(target.attached.is_empty());
        assert!(target.detached.is_empty());
    }

    #[test]
    fn test_failed_rollback_still_reports_attach_error() {
        let mut target = RecordingTarget {
            fail_on: Some(UNLOCK_SYMBOL),
            fail_detach: true,
            ..Default::default()
        };
        let err = attach_entry_points(&mut target).unwrap_err();
        assert!(err.to_string().contains(UNLOCK_SYMBOL));
    }
}
