//! Status published for the command-and-control endpoint.

use serde::Serialize;

use crate::dispatch::DispatchStatus;
use crate::memory::MemoryUsage;
use crate::pool::{ConnectionState, PoolDescriptor};
use crate::stats::{HashrateMonitor, HashrateWindows, ResultsSnapshot};
use crate::types::HashRate;

/// One connection as shown in the status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    pub url: String,
    pub state: String,
    pub active: bool,
    pub donation: bool,
}

/// Snapshot of the whole miner. Replaced wholesale on every update.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub paused: bool,
    pub hashrate: HashrateWindows,
    pub hashrate_highest: HashRate,
    pub threads: Vec<HashrateWindows>,
    pub pools: Vec<PoolStatus>,

    /// Address of the pool the workers are hashing for
    pub active_pool: Option<String>,

    pub results: ResultsSnapshot,
    pub memory: MemoryUsage,

    /// Some scratch buffers fell back from huge pages
    pub memory_degraded: bool,

    /// Rejection ratio over the rolling window is below the threshold
    pub healthy: bool,
}

impl StatusReport {
    /// Assemble a report from the live components.
    ///
    /// `descriptors` is indexed like the dispatcher's pools; when
    /// `donation` is set the last descriptor is the donation pool.
    pub fn collect(
        uptime_secs: u64,
        paused: bool,
        monitor: &HashrateMonitor,
        dispatch: &DispatchStatus,
        descriptors: &[PoolDescriptor],
        donation: bool,
        memory: MemoryUsage,
    ) -> Self {
        let pools = descriptors
            .iter()
            .enumerate()
            .map(|(i, descriptor)| PoolStatus {
                url: descriptor.address(),
                state: dispatch
                    .states
                    .get(i)
                    .copied()
                    .unwrap_or(ConnectionState::Disconnected)
                    .to_string(),
                active: dispatch.active.is_some_and(|id| id.0 == i),
                donation: donation && i + 1 == descriptors.len(),
            })
            .collect();

        Self {
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs,
            paused,
            hashrate: monitor.windows(),
            hashrate_highest: monitor.highest(),
            threads: monitor.thread_windows(),
            pools,
            active_pool: dispatch
                .active
                .and_then(|id| descriptors.get(id.0))
                .map(PoolDescriptor::address),
            results: dispatch.results,
            memory,
            memory_degraded: memory.degraded(),
            healthy: dispatch.results.healthy,
        }
    }
}
