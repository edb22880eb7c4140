//! Finds the libc / libpthread images that export the pthread mutex entry
//! points, on the host and inside containers.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result};
use log::debug;
use procfs::process::{MMapPath, Process};
use regex::Regex;

/// File names that may define `pthread_mutex_lock`. glibc >= 2.34 folds
/// libpthread into libc; older and musl systems still split them.
pub const LOCK_LIBRARY_PATTERN: &str = r"^(libc|libpthread)(-[0-9.]+)?\.so(\.[0-9.]+)?$";

const LDCONFIG_NAMES: [&str; 2] = ["libc.so", "libpthread.so"];

pub fn lock_library_regex() -> Result<Regex> {
    Regex::new(LOCK_LIBRARY_PATTERN).context("Invalid lock library pattern")
}

/// Resolves a path from a process's mount namespace to the host filesystem
/// through `/proc/<pid>/root`.
pub fn resolve_host_path(pid: i32, container_path: &Path) -> PathBuf {
    if container_path.starts_with("/proc") {
        return container_path.to_path_buf();
    }

    let mut root_path = PathBuf::from(format!("/proc/{}/root", pid));
    root_path.push(container_path.strip_prefix("/").unwrap_or(container_path));
    root_path
}

/// Every matching library mapped by any running process, plus the system
/// copies known to `ldconfig`.
pub fn find_lock_libraries(pattern: &Regex) -> Result<BTreeSet<String>> {
    let mut paths: BTreeSet<String> = find_system_libraries(&LDCONFIG_NAMES)
        .into_iter()
        .collect();

    debug!("Scanning processes for lock libraries...");
    let processes = procfs::process::all_processes().context("Failed to list processes")?;
    for process in processes.flatten() {
        scan_process(&process, pattern, &mut paths);
    }

    Ok(paths)
}

/// Matching libraries mapped by one process. Cheap enough to run per exec.
pub fn libraries_of_pid(pid: u32, pattern: &Regex) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    if let Ok(process) = Process::new(pid as i32) {
        scan_process(&process, pattern, &mut paths);
    }
    paths
}

fn scan_process(process: &Process, pattern: &Regex, paths: &mut BTreeSet<String>) {
    // Kernel threads and exited processes have no readable maps.
    let Ok(maps) = process.maps() else {
        return;
    };

    for map in maps {
        if let MMapPath::Path(path_buf) = map.pathname
            && let Some(file_name) = path_buf.file_name().and_then(|n| n.to_str())
            && pattern.is_match(file_name)
        {
            let host_path = resolve_host_path(process.pid, &path_buf);
            if host_path.exists() {
                let path_str = host_path.to_string_lossy().to_string();
                if paths.insert(path_str.clone()) {
                    debug!("Found library: {} (from PID: {})", path_str, process.pid);
                }
            }
        }
    }
}

/// System libraries from `ldconfig -p` whose entry names start with one of
/// `names`. A missing `ldconfig` (e.g. musl) yields nothing.
pub fn find_system_libraries(names: &[&str]) -> Vec<String> {
    let Ok(output) = Command::new("ldconfig").arg("-p").output() else {
        debug!("ldconfig not available");
        return Vec::new();
    };
    parse_ldconfig(&String::from_utf8_lossy(&output.stdout), names)
}

fn parse_ldconfig(listing: &str, names: &[&str]) -> Vec<String> {
    let mut paths = Vec::new();
    for line in listing.lines() {
        let Some((entry, path)) = line.split_once("=>") else {
            continue;
        };
        let entry = entry.trim();
        if !names.iter().any(|name| entry.starts_with(name)) {
            continue;
        }
        let path = path.trim().to_string();
        if !paths.contains(&path) {
            debug!("Found system library via ldconfig: {}", path);
            paths.push(path);
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches_lock_libraries() {
        let re = lock_library_regex().unwrap();
        for name in [
            "libc.so.6",
            "libpthread.so.0",
            "libc-2.31.so",
            "libpthread-2.31.so",
            "libc.so",
        ] {
            assert!(re.is_match(name), "{name} should match");
        }
        for name in ["libcrypto.so.3", "libcap.so.2", "libc.so.6.debug", "mylibc.so.6"] {
            assert!(!re.is_match(name), "{name} should not match");
        }
    }

    #[test]
    fn test_resolve_host_path() {
        assert_eq!(
            resolve_host_path(42, Path::new("/usr/lib/libc.so.6")),
            PathBuf::from("/proc/42/root/usr/lib/libc.so.6")
        );
        assert_eq!(
            resolve_host_path(42, Path::new("/proc/1/root/lib/libc.so.6")),
            PathBuf::from("/proc/1/root/lib/libc.so.6")
        );
    }

    #[test]
    fn test_parse_ldconfig() {
        let listing = "\
1234 libs found in cache `/etc/ld.so.cache'
\tlibpthread.so.0 (libc6,x86-64, OS ABI: Linux 3.2.0) => /lib/x86_64-linux-gnu/libpthread.so.0
\tlibcrypto.so.3 (libc6,x86-64) => /lib/x86_64-linux-gnu/libcrypto.so.3
\tlibc.so.6 (libc6,x86-64, OS ABI: Linux 3.2.0) => /lib/x86_64-linux-gnu/libc.so.6
\tlibc.so.6 (libc6,x86-64, OS ABI: Linux 3.2.0) => /lib/x86_64-linux-gnu/libc.so.6
";
        assert_eq!(
            parse_ldconfig(listing, &LDCONFIG_NAMES),
            vec![
                "/lib/x86_64-linux-gnu/libpthread.so.0".to_string(),
                "/lib/x86_64-linux-gnu/libc.so.6".to_string(),
            ]
        );
    }

    #[test]
    fn test_own_process_maps_libc() {
        let re = lock_library_regex().unwrap();
        // Statically linked test binaries map no libc at all.
        for path in libraries_of_pid(std::process::id(), &re) {
            assert!(path.starts_with(&format!("/proc/{}/root/", std::process::id())));
        }
    }
}
