//! Host side of the mount namespace filter.
//!
//! The plan is built once from settings, its mode is baked into
//! `PROBE_CONFIG` before load, and its ids are written to `MNTNS_FILTER`
//! before any uprobe is attached.

use std::{collections::BTreeSet, ffi::OsStr};

use anyhow::{Context, Result, bail};
use aya::{Ebpf, maps::HashMap};
use lockwatch_common::{FilterMode, MAX_FILTER_ENTRIES, MNTNS_FILTER_MAP, MountNsFilter};
use log::{info, warn};

use crate::settings::FilterSettings;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPlan {
    mode: FilterMode,
    ids: BTreeSet<u64>,
}

impl FilterPlan {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &FilterSettings) -> Result<Self> {
        Self::build(settings, mntns_of_pid)
    }

    /// `resolve` maps a pid to its mount namespace inode.
    fn build<R>(settings: &FilterSettings, resolve: R) -> Result<Self>
    where
        R: Fn(u32) -> Result<u64>,
    {
        let allow = collect_ids(
            settings.allow_mntns.as_deref(),
            settings.allow_pids.as_deref(),
            &resolve,
        )?;
        let deny = collect_ids(
            settings.deny_mntns.as_deref(),
            settings.deny_pids.as_deref(),
            &resolve,
        )?;

        let allow_requested = settings.allow_mntns.is_some() || settings.allow_pids.is_some();
        let deny_requested = settings.deny_mntns.is_some() || settings.deny_pids.is_some();
        if allow_requested && deny_requested {
            bail!("FILTER allow and deny lists are mutually exclusive");
        }

        let plan = if !allow.is_empty() {
            Self {
                mode: FilterMode::Allow,
                ids: allow,
            }
        } else if !deny.is_empty() {
            Self {
                mode: FilterMode::Deny,
                ids: deny,
            }
        } else {
            if allow_requested {
                // An empty allow set would drop every event.
                warn!("Allow filter resolved to no namespaces; tracing everything");
            }
            Self::disabled()
        };

        if plan.ids.len() > MAX_FILTER_ENTRIES as usize {
            bail!(
                "{} namespaces requested, filter holds at most {}",
                plan.ids.len(),
                MAX_FILTER_ENTRIES
            );
        }
        Ok(plan)
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Without a resolvable namespace every event carries id 0, so any
    /// active filter would be meaningless.
    pub fn disable_for_unresolved_mntns(&mut self) {
        if self.mode != FilterMode::Disabled {
            warn!(
                "Mount namespace ids unavailable; ignoring {:?} filter of {} namespaces",
                self.mode,
                self.ids.len()
            );
            *self = Self::disabled();
        }
    }

    /// Writes the ids into `MNTNS_FILTER`. The mode itself travels in the
    /// load-time config.
    pub fn install(&self, bpf: &mut Ebpf) -> Result<()> {
        if self.mode == FilterMode::Disabled {
            return Ok(());
        }

        let mut map: HashMap<_, u64, u8> = HashMap::try_from(
            bpf.map_mut(MNTNS_FILTER_MAP)
                .with_context(|| format!("Failed to get {} map", MNTNS_FILTER_MAP))?,
        )?;
        for id in &self.ids {
            map.insert(id, 1u8, 0)
                .with_context(|| format!("Failed to add namespace {} to filter", id))?;
        }

        info!(
            "Namespace filter installed: mode={:?} namespaces={:?}",
            self.mode, self.ids
        );
        Ok(())
    }
}

impl MountNsFilter for FilterPlan {
    fn should_discard(&self, mntns_id: u64) -> bool {
        self.mode.discards(self.ids.contains(&mntns_id))
    }
}

fn collect_ids<R>(mntns: Option<&str>, pids: Option<&str>, resolve: &R) -> Result<BTreeSet<u64>>
where
    R: Fn(u32) -> Result<u64>,
{
    let mut ids: BTreeSet<u64> = parse_list::<u64>(mntns)?.into_iter().collect();
    for pid in parse_list::<u32>(pids)? {
        match resolve(pid) {
            Ok(id) => {
                ids.insert(id);
            }
            // Processes may exit between configuration and startup.
            Err(e) => warn!("Skipping pid {} in namespace filter: {:#}", pid, e),
        }
    }
    Ok(ids)
}

fn parse_list<T>(raw: Option<&str>) -> Result<Vec<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<T>()
                .with_context(|| format!("Invalid filter entry '{}'", item))
        })
        .collect()
}

/// Mount namespace inode of a running process, from `/proc/<pid>/ns/mnt`.
pub fn mntns_of_pid(pid: u32) -> Result<u64> {
    let process = procfs::process::Process::new(pid as i32)
        .with_context(|| format!("No such process {}", pid))?;
    let namespaces = process
        .namespaces()
        .with_context(|| format!("Failed to read namespaces of {}", pid))?;
    namespaces
        .0
        .get(OsStr::new("mnt"))
        .map(|ns| ns.identifier)
        .with_context(|| format!("Process {} has no mount namespace entry", pid))
}
