//! System probes: CPU topology, per-CPU time accounting, block device facts
//!
//! Everything here reads Linux's procfs/sysfs surfaces once; nothing is
//! cached across calls except the topology snapshot taken at startup.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::Context;

use crate::Result;

/// Per-CPU time counters from `/proc/stat`, in clock ticks.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTimes {
    pub user: f64,
    pub nice: f64,
    pub system: f64,
    pub idle: f64,
    pub iowait: f64,
}

impl CpuTimes {
    pub fn total(&self) -> f64 {
        self.user + self.nice + self.system + self.idle + self.iowait
    }
}

/// Topology snapshot taken once at startup. The affinity set defaults to all
/// online CPUs and can be narrowed by the `-a` flag.
#[derive(Debug, Clone)]
pub struct SysInfo {
    pub online_cpus: BTreeSet<u32>,
    /// Ordered list workers are pinned over, round-robin.
    pub affinity_cpus: Vec<u32>,
    pub cpu_lo: u32,
    pub cpu_hi: u32,
}

impl SysInfo {
    pub fn probe(affinity_set: Option<&str>) -> Result<Self> {
        let online = fs::read_to_string("/sys/devices/system/cpu/online")
            .context("reading /sys/devices/system/cpu/online")?;
        let online_cpus = parse_cpu_set(online.trim())?;
        if online_cpus.is_empty() {
            anyhow::bail!("no online CPUs reported by the kernel");
        }

        let affinity: BTreeSet<u32> = match affinity_set {
            Some(s) => {
                let set = parse_cpu_set(s)?;
                if set.is_empty() {
                    anyhow::bail!("affinity set '{s}' selects no CPUs");
                }
                set
            }
            None => online_cpus.clone(),
        };

        Ok(Self {
            cpu_lo: *online_cpus.iter().next().unwrap(),
            cpu_hi: *online_cpus.iter().next_back().unwrap(),
            affinity_cpus: affinity.into_iter().collect(),
            online_cpus,
        })
    }

    /// Snapshot per-CPU time counters for every online CPU.
    pub fn cpu_stats(&self) -> Result<BTreeMap<u32, CpuTimes>> {
        let stat = fs::read_to_string("/proc/stat").context("reading /proc/stat")?;
        let mut stats = BTreeMap::new();

        for line in stat.lines() {
            let Some(rest) = line.strip_prefix("cpu") else {
                continue;
            };
            // the aggregate "cpu " line has no id glued to the prefix
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                continue;
            }
            let mut fields = rest.split_whitespace();
            let Some(id) = fields.next().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };

            let mut values = [0.0f64; 5];
            for v in values.iter_mut() {
                *v = fields
                    .next()
                    .and_then(|f| f.parse::<f64>().ok())
                    .with_context(|| format!("malformed /proc/stat line for cpu{id}"))?;
            }
            stats.insert(
                id,
                CpuTimes {
                    user: values[0],
                    nice: values[1],
                    system: values[2],
                    idle: values[3],
                    iowait: values[4],
                },
            );
        }

        for cpu in &self.online_cpus {
            if !stats.contains_key(cpu) {
                anyhow::bail!("/proc/stat has no entry for online cpu{cpu}");
            }
        }
        Ok(stats)
    }
}

/// Parse a kernel-style CPU list: comma-separated ids and ranges, e.g.
/// `0-3,7,12-14`.
pub fn parse_cpu_set(s: &str) -> Result<BTreeSet<u32>> {
    let mut set = BTreeSet::new();
    if s.is_empty() {
        return Ok(set);
    }

    for field in s.split(',') {
        let field = field.trim();
        match field.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().with_context(|| format!("bad CPU id '{lo}'"))?;
                let hi: u32 = hi.trim().parse().with_context(|| format!("bad CPU id '{hi}'"))?;
                if hi < lo {
                    anyhow::bail!("descending CPU range '{field}'");
                }
                set.extend(lo..=hi);
            }
            None => {
                let id: u32 = field.parse().with_context(|| format!("bad CPU id '{field}'"))?;
                set.insert(id);
            }
        }
    }
    Ok(set)
}

/// Resolve a device number to its kernel block device name via
/// `/sys/dev/block/<major>:<minor>`. Empty when the device is unknown
/// (e.g. tmpfs or network filesystems).
pub fn device_name(dev: u64) -> String {
    let major = libc::major(dev);
    let minor = libc::minor(dev);
    let link = format!("/sys/dev/block/{major}:{minor}");
    match fs::read_link(&link) {
        Ok(path) => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}

/// The active I/O scheduler of a block device, read from
/// `queue/scheduler` (the bracketed entry). Partitions fall back to their
/// parent disk's queue.
pub fn device_scheduler(device: &str) -> String {
    if device.is_empty() {
        return String::new();
    }

    let direct = format!("/sys/block/{device}/queue/scheduler");
    let parent = format!(
        "/sys/block/{}/queue/scheduler",
        device.trim_end_matches(|c: char| c.is_ascii_digit())
    );

    let contents = fs::read_to_string(&direct)
        .or_else(|_| fs::read_to_string(&parent))
        .unwrap_or_default();

    // format: "noop deadline [cfq]" - the bracketed name is active
    if let (Some(open), Some(close)) = (contents.find('['), contents.find(']')) {
        if open < close {
            return contents[open + 1..close].to_string();
        }
    }
    contents.trim().to_string()
}

/// Size in bytes of a block device, from its sysfs `size` (512-byte sectors).
pub fn partition_size(rdev: u64) -> Result<u64> {
    let major = libc::major(rdev);
    let minor = libc::minor(rdev);
    let path = format!("/sys/dev/block/{major}:{minor}/size");
    let sectors: u64 = fs::read_to_string(&path)
        .with_context(|| format!("reading {path}"))?
        .trim()
        .parse()
        .with_context(|| format!("malformed sector count in {path}"))?;
    Ok(sectors * 512)
}

/// True when the path names a block device.
pub fn is_block_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_cpu() {
        let set = parse_cpu_set("3").unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_parse_ranges_and_singles() {
        let set = parse_cpu_set("0-3,7,12-14").unwrap();
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 7, 12, 13, 14]
        );
    }

    #[test]
    fn test_parse_deduplicates_overlap() {
        let set = parse_cpu_set("0-4,2-6").unwrap();
        assert_eq!(set.len(), 7);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cpu_set("0-").is_err());
        assert!(parse_cpu_set("a,b").is_err());
        assert!(parse_cpu_set("4-2").is_err());
    }

    #[test]
    fn test_probe_reports_online_cpus() {
        let sys = SysInfo::probe(None).unwrap();
        assert!(!sys.online_cpus.is_empty());
        assert!(sys.cpu_lo <= sys.cpu_hi);
        assert_eq!(sys.affinity_cpus.len(), sys.online_cpus.len());
    }

    #[test]
    fn test_probe_narrows_affinity() {
        let sys = SysInfo::probe(Some("0")).unwrap();
        assert_eq!(sys.affinity_cpus, vec![0]);
    }

    #[test]
    fn test_cpu_stats_cover_online_set() {
        let sys = SysInfo::probe(None).unwrap();
        let stats = sys.cpu_stats().unwrap();
        for cpu in &sys.online_cpus {
            let t = &stats[cpu];
            assert!(t.total() > 0.0);
        }
    }

    #[test]
    fn test_device_name_unknown_device_is_empty() {
        // device 0:0 never exists in sysfs
        assert_eq!(device_name(0), "");
    }

    #[test]
    fn test_scheduler_of_unknown_device_is_empty() {
        assert_eq!(device_scheduler(""), "");
        assert_eq!(device_scheduler("no-such-device-xyz"), "");
    }
}
