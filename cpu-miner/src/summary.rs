//! Startup summary.
//!
//! A handful of lines describing what this session is about to do: the
//! build, huge page state, the CPU, the worker layout, the pools and the
//! command-and-control endpoint.

use crate::config::Config;
use crate::cpu::CpuInfo;
use crate::memory::MemoryUsage;
use crate::pool::PoolDescriptor;
use crate::tracing::prelude::*;
use crate::worker::{sizing_algorithm, WorkerPlan};

const MIB: f64 = 1024.0 * 1024.0;

/// Everything the summary reports, gathered once the workers are started.
pub struct Summary<'a> {
    pub config: &'a Config,
    pub cpu: &'a CpuInfo,
    pub plans: &'a [WorkerPlan],
    pub pools: &'a [PoolDescriptor],
    pub memory: MemoryUsage,
}

impl Summary<'_> {
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!(
                "VERSIONS:     {}/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ),
            self.huge_pages(),
            format!(
                "CPU:          {} ({}) {}x64 {}AES-NI",
                self.cpu.brand,
                self.cpu.sockets,
                if self.cpu.x86_64 { "" } else { "-" },
                if self.cpu.aes { "" } else { "-" },
            ),
            format!(
                "CPU L2/L3:    {:.1} MB/{:.1} MB",
                self.cpu.l2_bytes as f64 / MIB,
                self.cpu.l3_bytes as f64 / MIB
            ),
            self.threads(),
        ];

        for (i, pool) in self.pools.iter().enumerate() {
            lines.push(format!(
                "POOL #{}:      {}{}",
                i + 1,
                pool.address(),
                if pool.tls { " (tls)" } else { "" }
            ));
        }

        if let Some(cc) = &self.config.cc {
            lines.push(format!(
                "CC:           {} (status every {}s)",
                cc.url, cc.update_interval_secs
            ));
        }
        lines
    }

    fn huge_pages(&self) -> String {
        let available = if self.cpu.huge_pages.available() {
            "available"
        } else {
            "unavailable"
        };
        let enabled = if !self.config.memory.huge_pages {
            "disabled".to_string()
        } else if self.memory.degraded() {
            format!(
                "enabled for {}/{} buffers",
                self.memory.huge_page_buffers, self.memory.buffers
            )
        } else {
            "enabled".to_string()
        };
        format!("HUGE PAGES:   {}, {}", available, enabled)
    }

    fn threads(&self) -> String {
        let threads = &self.config.threads;
        let mut line = format!(
            "THREADS:      {}, {}, aes={}, hf={}, donate={}%",
            self.plans.len(),
            sizing_algorithm(self.config),
            u8::from(self.cpu.aes),
            threads.hash_factor,
            self.config.donate_level
        );

        if let Some(mask) = threads.affinity {
            line.push_str(&format!(", affinity=0x{:X}", mask));
        }

        if let (true, Some(mask)) = (threads.hash_factor > 1, threads.multi_hash_thread_mask) {
            let join = |multi: bool| {
                self.plans
                    .iter()
                    .filter(|p| (p.hash_factor > 1) == multi)
                    .map(|p| p.index.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            line.push_str(&format!(
                ", multi_hash_thread_mask=0x{:X} [single threads: {}; multihash threads: {}]",
                mask,
                join(false),
                join(true)
            ));
        }
        line
    }

    /// Write the summary to the log.
    pub fn log(&self) {
        for line in self.lines() {
            info!(" * {}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use crate::cpu::HugePageInfo;

    fn cpu() -> CpuInfo {
        CpuInfo {
            brand: "Test CPU".into(),
            sockets: 1,
            logical_cores: 4,
            physical_cores: 2,
            l2_bytes: 512 * 1024,
            l3_bytes: 8 * 1024 * 1024,
            aes: true,
            x86_64: true,
            cores: vec![vec![0, 2], vec![1, 3]],
            huge_pages: HugePageInfo {
                total: 128,
                free: 128,
                page_size: Some(2 * 1024 * 1024),
            },
        }
    }

    fn plan(index: usize, hash_factor: usize) -> WorkerPlan {
        WorkerPlan {
            index,
            cpu: Some(index),
            hash_factor,
            scratch_size: 0,
        }
    }

    #[test]
    #[serial]
    fn describes_cpu_threads_and_pools() {
        let config = Config::from_toml_str(
            "donate_level = 2\n\
             [[pools]]\nurl = \"stratum+ssl://a.example.com:443\"\nuser = \"w\"\n\
             [[pools]]\nurl = \"b.example.com:3333\"\nuser = \"w\"\n\
             [threads]\ncount = 3\naffinity = 0xf\nhash_factor = 2\nmulti_hash_thread_mask = 0x2\n\
             [cc]\nurl = \"http://cc.example.com:3344\"\n",
        )
        .unwrap();
        let pools = config.pool_descriptors().unwrap();
        let plans = [plan(0, 1), plan(1, 2), plan(2, 1)];
        let summary = Summary {
            config: &config,
            cpu: &cpu(),
            plans: &plans,
            pools: &pools,
            memory: MemoryUsage {
                buffers: 3,
                huge_page_buffers: 2,
                bytes: 0,
            },
        };

        let lines = summary.lines();
        assert_eq!(lines[1], "HUGE PAGES:   available, enabled for 2/3 buffers");
        assert_eq!(lines[2], "CPU:          Test CPU (1) x64 AES-NI");
        assert_eq!(lines[3], "CPU L2/L3:    0.5 MB/8.0 MB");
        assert_eq!(
            lines[4],
            "THREADS:      3, cryptonight, aes=1, hf=2, donate=2%, affinity=0xF, \
             multi_hash_thread_mask=0x2 [single threads: 0, 2; multihash threads: 1]"
        );
        assert_eq!(lines[5], "POOL #1:      a.example.com:443 (tls)");
        assert_eq!(lines[6], "POOL #2:      b.example.com:3333");
        assert_eq!(lines[7], "CC:           http://cc.example.com:3344 (status every 10s)");
    }
}
