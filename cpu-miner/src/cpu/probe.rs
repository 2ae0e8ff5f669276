//! CPU and memory capability probe.
//!
//! Gathers what the scheduler and summary need to know about the host:
//! core counts and SMT layout, cache sizes, AES support and huge page
//! availability. On Linux most of it comes from sysfs and procfs; anything
//! that can't be read degrades to conservative defaults rather than failing.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::algo::Algorithm;

/// Huge page pool as reported by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HugePageInfo {
    pub total: usize,
    pub free: usize,
    /// Bytes per huge page
    pub page_size: Option<usize>,
}

impl HugePageInfo {
    pub fn available(&self) -> bool {
        self.total > 0
    }
}

/// Read-only snapshot of host capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuInfo {
    pub brand: String,
    pub sockets: usize,
    pub logical_cores: usize,
    pub physical_cores: usize,

    /// Total L2 across all cores, in bytes
    pub l2_bytes: usize,

    /// Total L3 across all sockets, in bytes
    pub l3_bytes: usize,

    pub aes: bool,
    pub x86_64: bool,

    /// Logical CPU ids grouped by physical core, in core order
    pub cores: Vec<Vec<usize>>,

    pub huge_pages: HugePageInfo,
}

impl CpuInfo {
    /// Worker count whose combined working sets fit in L3, capped at the
    /// logical core count and never below one.
    pub fn recommended_threads(&self, algo: Algorithm, hash_factor: usize) -> usize {
        let logical = self.logical_cores.max(1);
        if self.l3_bytes == 0 {
            return logical;
        }
        let per_thread = algo.scratch_size_for(hash_factor.max(1));
        (self.l3_bytes / per_thread).clamp(1, logical)
    }
}

/// Source of [`CpuInfo`].
pub trait CapabilityProbe {
    fn probe(&self) -> CpuInfo;
}

/// Probe backed by the running system.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    root: PathBuf,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }
}

impl SystemProbe {
    /// Probe a filesystem tree laid out like `/sys` and `/proc` under `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, path: impl AsRef<Path>) -> Option<String> {
        fs::read_to_string(self.root.join(path)).ok()
    }

    fn cpu_dir(cpu: usize) -> PathBuf {
        PathBuf::from(format!("sys/devices/system/cpu/cpu{}", cpu))
    }

    fn online_cpus(&self) -> Vec<usize> {
        self.read("sys/devices/system/cpu/online")
            .map(|s| parse_cpu_list(&s))
            .filter(|cpus| !cpus.is_empty())
            .unwrap_or_else(|| (0..num_cpus::get()).collect())
    }

    /// Group CPUs by (package, core).
    fn cores(&self, cpus: &[usize]) -> (Vec<Vec<usize>>, usize) {
        let mut groups: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
        let mut packages = HashSet::new();

        for &cpu in cpus {
            let topo = Self::cpu_dir(cpu).join("topology");
            let package = self
                .read(topo.join("physical_package_id"))
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0);
            let core = self
                .read(topo.join("core_id"))
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(cpu);
            packages.insert(package);
            groups.entry((package, core)).or_default().push(cpu);
        }

        let mut cores: Vec<Vec<usize>> = groups.into_values().collect();
        for siblings in &mut cores {
            siblings.sort_unstable();
        }
        cores.sort_by_key(|siblings| siblings[0]);
        (cores, packages.len().max(1))
    }

    /// Total bytes of data/unified caches at `level`, counting each shared
    /// cache once.
    fn cache_total(&self, cpus: &[usize], level: u32) -> usize {
        let mut seen = HashSet::new();
        let mut total = 0;

        for &cpu in cpus {
            for index in 0..8 {
                let dir = Self::cpu_dir(cpu).join(format!("cache/index{}", index));
                let Some(found) = self.read(dir.join("level")) else {
                    break;
                };
                if found.trim().parse::<u32>().ok() != Some(level) {
                    continue;
                }
                if self
                    .read(dir.join("type"))
                    .is_some_and(|t| t.trim() == "Instruction")
                {
                    continue;
                }
                let shared = self
                    .read(dir.join("shared_cpu_list"))
                    .unwrap_or_else(|| cpu.to_string());
                if !seen.insert(shared.trim().to_string()) {
                    continue;
                }
                total += self
                    .read(dir.join("size"))
                    .and_then(|s| parse_size(&s))
                    .unwrap_or(0);
            }
        }
        total
    }
}

impl CapabilityProbe for SystemProbe {
    fn probe(&self) -> CpuInfo {
        let cpus = self.online_cpus();
        let (mut cores, sockets) = self.cores(&cpus);
        if cores.is_empty() {
            cores = cpus.iter().map(|&c| vec![c]).collect();
        }

        CpuInfo {
            brand: self
                .read("proc/cpuinfo")
                .and_then(|s| parse_brand(&s))
                .unwrap_or_else(|| "unknown".to_string()),
            sockets,
            logical_cores: cpus.len(),
            physical_cores: cores.len(),
            l2_bytes: self.cache_total(&cpus, 2),
            l3_bytes: self.cache_total(&cpus, 3),
            aes: has_aes(),
            x86_64: cfg!(target_arch = "x86_64"),
            cores,
            huge_pages: self
                .read("proc/meminfo")
                .map(|s| parse_meminfo(&s))
                .unwrap_or_default(),
        }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn has_aes() -> bool {
    std::arch::is_x86_feature_detected!("aes")
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn has_aes() -> bool {
    false
}

/// Parse a kernel CPU list such as `0-3,8,10-11`.
pub fn parse_cpu_list(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((a, b)) => {
                if let (Ok(a), Ok(b)) = (a.trim().parse::<usize>(), b.trim().parse::<usize>()) {
                    cpus.extend(a..=b);
                }
            }
            None => {
                if let Ok(cpu) = part.trim().parse() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

/// Parse a sysfs cache size such as `32K` or `16384K`.
pub fn parse_size(size: &str) -> Option<usize> {
    let size = size.trim();
    let (digits, scale) = match size.chars().last()? {
        'K' | 'k' => (&size[..size.len() - 1], 1024),
        'M' | 'm' => (&size[..size.len() - 1], 1024 * 1024),
        'G' | 'g' => (&size[..size.len() - 1], 1024 * 1024 * 1024),
        _ => (size, 1),
    };
    digits.trim().parse::<usize>().ok().map(|n| n * scale)
}

fn parse_brand(cpuinfo: &str) -> Option<String> {
    cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        matches!(key.trim(), "model name" | "Model" | "cpu model")
            .then(|| value.trim().to_string())
    })
}

fn parse_meminfo(meminfo: &str) -> HugePageInfo {
    let mut info = HugePageInfo::default();
    for line in meminfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let mut fields = value.split_whitespace();
        let number = fields.next().and_then(|n| n.parse::<usize>().ok());
        match (key.trim(), number) {
            ("HugePages_Total", Some(n)) => info.total = n,
            ("HugePages_Free", Some(n)) => info.free = n,
            ("Hugepagesize", Some(n)) => {
                let scale = match fields.next() {
                    Some("kB") => 1024,
                    Some("MB") => 1024 * 1024,
                    _ => 1,
                };
                info.page_size = Some(n * scale);
            }
            _ => {}
        }
    }
    info
}
