//! Worker-to-CPU placement.

use super::probe::CpuInfo;

/// Logical CPU for each of `threads` workers.
///
/// With an explicit mask, worker N goes to the N-th set bit, wrapping when
/// there are more workers than bits. Without one, workers spread across
/// distinct physical cores first and only then onto SMT siblings. `None`
/// means the worker is left unpinned.
pub fn assign_cpus(info: &CpuInfo, threads: usize, mask: Option<u64>) -> Vec<Option<usize>> {
    let order = match mask {
        Some(mask) => mask_cpus(mask),
        None => spread_order(&info.cores),
    };

    if order.is_empty() {
        return vec![None; threads];
    }

    (0..threads).map(|n| Some(order[n % order.len()])).collect()
}

/// CPUs selected by an affinity mask, lowest bit first.
pub fn mask_cpus(mask: u64) -> Vec<usize> {
    (0..64).filter(|bit| mask & (1u64 << bit) != 0).collect()
}

/// First thread of every core, then second threads, and so on.
fn spread_order(cores: &[Vec<usize>]) -> Vec<usize> {
    let depth = cores.iter().map(Vec::len).max().unwrap_or(0);
    (0..depth)
        .flat_map(|level| cores.iter().filter_map(move |siblings| siblings.get(level).copied()))
        .collect()
}

/// Pin the calling thread to `cpu`. Returns whether the OS accepted it.
pub fn pin_current_thread(cpu: usize) -> bool {
    core_affinity::set_for_current(core_affinity::CoreId { id: cpu })
}
