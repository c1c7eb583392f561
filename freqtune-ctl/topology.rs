//! Shared topology lookups over sysfs
//!
//! Core devices are logical CPUs (`cpu<N>` entries); uncore devices are
//! NUMA nodes (`node<N>` entries). The sysfs mount point is taken from
//! `/proc/mounts` rather than assumed.

use std::path::{Path, PathBuf};

use crate::error::{FreqError, Result};

/// Locate the sysfs mount point from `/proc/mounts`.
pub fn sysfs_root() -> Result<PathBuf> {
    let mounts = std::fs::read_to_string("/proc/mounts")
        .map_err(|e| FreqError::from_io("/proc/mounts", e))?;

    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let fsname = fields.next();
        let dir = fields.next();
        if fsname == Some("sysfs") {
            if let Some(dir) = dir {
                return Ok(PathBuf::from(dir));
            }
        }
    }

    Err(FreqError::NotReady(
        "sysfs is not mounted according to /proc/mounts".into(),
    ))
}

/// Highest index of `<prefix><N>` directory entries under `dir`, if any.
fn max_indexed_entry(dir: &Path, prefix: &str) -> Result<Option<u32>> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| FreqError::from_io(dir.display().to_string(), e))?;

    let mut max: Option<u32> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(tail) = name.strip_prefix(prefix) else {
            continue;
        };
        if let Ok(index) = tail.parse::<u32>() {
            max = Some(max.map_or(index, |m| m.max(index)));
        }
    }
    Ok(max)
}

/// Number of logical CPUs, from `<sysfs>/devices/system/cpu`.
pub fn cpu_count() -> Result<u32> {
    let dir = sysfs_root()?.join("devices/system/cpu");
    match max_indexed_entry(&dir, "cpu")? {
        Some(max) => Ok(max + 1),
        None => Err(FreqError::NotFound {
            path: dir.join("cpu0").display().to_string(),
        }),
    }
}

/// Number of NUMA nodes, from `<sysfs>/devices/system/node`.
pub fn node_count() -> Result<u32> {
    let dir = sysfs_root()?.join("devices/system/node");
    match max_indexed_entry(&dir, "node")? {
        Some(max) => Ok(max + 1),
        None => Err(FreqError::NotFound {
            path: dir.join("node0").display().to_string(),
        }),
    }
}

/// First CPU of a NUMA node, from `node<N>/cpulist`.
///
/// Uncore registers are reached through any CPU of the package; the first
/// one listed is used.
pub fn node_first_cpu(node: u32) -> Result<u32> {
    let path = sysfs_root()?.join(format!("devices/system/node/node{node}/cpulist"));
    let list = std::fs::read_to_string(&path)
        .map_err(|e| FreqError::from_io(path.display().to_string(), e))?;

    parse_cpu_list(&list)
        .and_then(|cpus| cpus.first().copied())
        .ok_or_else(|| {
            FreqError::InvalidArgument(format!(
                "malformed cpulist {:?} in {}",
                list.trim(),
                path.display()
            ))
        })
}

/// Parse a CPU list like "0-3,8-11" into indices.
pub fn parse_cpu_list(s: &str) -> Option<Vec<u32>> {
    let mut cpus = Vec::new();
    for part in s.trim().split(',') {
        if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start.trim().parse().ok()?;
            let end: u32 = end.trim().parse().ok()?;
            cpus.extend(start..=end);
        } else {
            cpus.push(part.trim().parse().ok()?);
        }
    }
    Some(cpus)
}
