//! Kernel struct layout discovery.
//!
//! The probe reads `current->nsproxy->mnt_ns->ns.inum` with plain
//! `bpf_probe_read_kernel` calls, so it needs the byte offsets of the
//! running kernel. They are taken from its BTF at startup.

use std::path::Path;

use anyhow::{Context, Result, bail};
use btf_rs::{Btf, Struct, Type};
use lockwatch_common::{FilterMode, ProbeConfig};
use log::{debug, info};

pub const VMLINUX_BTF: &str = "/sys/kernel/btf/vmlinux";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MntNsOffsets {
    pub task_nsproxy: u32,
    pub nsproxy_mnt_ns: u32,
    /// `mnt_namespace.ns` plus `ns_common.inum`.
    pub mnt_ns_inum: u32,
}

impl MntNsOffsets {
    pub fn discover() -> Result<Self> {
        Self::from_file(VMLINUX_BTF)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let btf = Btf::from_file(path)
            .with_context(|| format!("Failed to parse BTF from {}", path.display()))?;
        Self::from_btf(&btf)
    }

    pub fn from_btf(btf: &Btf) -> Result<Self> {
        let task_nsproxy = member_offset(btf, "task_struct", "nsproxy")?;
        let nsproxy_mnt_ns = member_offset(btf, "nsproxy", "mnt_ns")?;
        let mnt_ns_common = member_offset(btf, "mnt_namespace", "ns")?;
        let ns_inum = member_offset(btf, "ns_common", "inum")?;

        let offsets = Self {
            task_nsproxy,
            nsproxy_mnt_ns,
            mnt_ns_inum: mnt_ns_common + ns_inum,
        };
        info!(
            "Kernel offsets: task_struct.nsproxy={} nsproxy.mnt_ns={} mnt_namespace.ns.inum={}",
            offsets.task_nsproxy, offsets.nsproxy_mnt_ns, offsets.mnt_ns_inum
        );
        Ok(offsets)
    }
}

/// Load-time configuration for the probes. `None` offsets leave namespace
/// resolution off and every event reports `mntns_id == 0`.
pub fn probe_config(offsets: Option<MntNsOffsets>, filter_mode: FilterMode) -> ProbeConfig {
    let mut config = ProbeConfig::zeroed();
    if let Some(offsets) = offsets {
        config.task_nsproxy_offset = offsets.task_nsproxy;
        config.nsproxy_mnt_ns_offset = offsets.nsproxy_mnt_ns;
        config.mnt_ns_inum_offset = offsets.mnt_ns_inum;
        config.mntns_resolvable = 1;
        config.filter_mode = filter_mode as u8;
    }
    config
}

fn find_struct(btf: &Btf, name: &str) -> Result<Struct> {
    // Forward declarations share the name; only the definition has members.
    btf.resolve_types_by_name(name)
        .with_context(|| format!("Type {} not found in BTF", name))?
        .into_iter()
        .find_map(|ty| match ty {
            Type::Struct(s) => Some(s),
            _ => None,
        })
        .with_context(|| format!("{} is not a struct", name))
}

fn member_offset(btf: &Btf, struct_name: &str, member: &str) -> Result<u32> {
    let parent = find_struct(btf, struct_name)?;
    match find_member(btf, &parent, member, 0)? {
        Some(offset) => {
            debug!("{}.{} at byte {}", struct_name, member, offset);
            Ok(offset)
        }
        None => bail!("{}.{} not found in BTF", struct_name, member),
    }
}

/// Searches `parent` for `name`, descending into anonymous struct and union
/// members. Returns the byte offset relative to the outermost struct.
fn find_member(btf: &Btf, parent: &Struct, name: &str, base: u32) -> Result<Option<u32>> {
    for member in &parent.members {
        let offset = base + member.bit_offset() / 8;
        let member_name = btf.resolve_name(member).unwrap_or_default();

        if member_name == name {
            return Ok(Some(offset));
        }
        if !member_name.is_empty() {
            continue;
        }

        let nested = match btf.resolve_chained_type(member)? {
            Type::Struct(s) | Type::Union(s) => s,
            _ => continue,
        };
        if let Some(found) = find_member(btf, &nested, name, offset)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_config_without_offsets_disables_filter() {
        let config = probe_config(None, FilterMode::Deny);
        assert_eq!(config.mntns_resolvable, 0);
        assert_eq!(config.filter_mode(), FilterMode::Disabled);
    }

    #[test]
    fn test_probe_config_with_offsets() {
        let offsets = MntNsOffsets {
            task_nsproxy: 2896,
            nsproxy_mnt_ns: 24,
            mnt_ns_inum: 16,
        };
        let config = probe_config(Some(offsets), FilterMode::Allow);
        assert_eq!(config.task_nsproxy_offset, 2896);
        assert_eq!(config.nsproxy_mnt_ns_offset, 24);
        assert_eq!(config.mnt_ns_inum_offset, 16);
        assert_eq!(config.mntns_resolvable, 1);
        assert_eq!(config.filter_mode(), FilterMode::Allow);
    }

    #[test]
    fn test_missing_btf_file_is_an_error() {
        assert!(MntNsOffsets::from_file("/nonexistent/vmlinux").is_err());
    }

    #[test]
    fn test_running_kernel_offsets() {
        // Only meaningful on kernels that expose BTF.
        if !Path::new(VMLINUX_BTF).exists() {
            return;
        }
        let offsets = MntNsOffsets::discover().unwrap();
        assert!(offsets.task_nsproxy > 0);
    }
}
