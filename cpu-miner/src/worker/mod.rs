//! Worker threads.
//!
//! The scheduler owns a fixed pool of hashing threads, one per planned
//! worker. Each thread is pinned (when a CPU was assigned), owns one scratch
//! buffer for its whole life, and reads work from the shared [`WorkBoard`].
//! Shares leave through a bounded channel that is never waited on.

mod board;
mod nonce;
mod thread;

pub use board::{WorkBoard, WorkUnit};
pub use nonce::NonceRange;
pub use thread::{Step, Worker, IDLE_WAIT};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::algo::Algorithm;
use crate::config::{Config, ThreadCount, ThreadMode};
use crate::cpu::{assign_cpus, pin_current_thread, CpuInfo};
use crate::error::Result;
use crate::hasher::HashExecutor;
use crate::memory::MemoryManager;
use crate::pool::Share;
use crate::tracing::prelude::*;

/// Capacity of the share queue between workers and the router.
pub const SHARE_QUEUE_DEPTH: usize = 256;

/// Placement and sizing decided for one worker before it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPlan {
    pub index: usize,
    pub cpu: Option<usize>,
    pub hash_factor: usize,
    pub scratch_size: usize,
}

/// Algorithm with the largest working set among the configured pools.
///
/// Scratch buffers are sized for it so a failover to a pool with a different
/// variant doesn't require reallocating.
pub fn sizing_algorithm(config: &Config) -> Algorithm {
    config
        .pools
        .iter()
        .map(|p| p.algo.unwrap_or(config.algo))
        .chain(std::iter::once(config.algo))
        .max_by_key(|algo| algo.scratch_size())
        .unwrap_or(config.algo)
}

/// Number of workers to run on this host.
pub fn thread_count(config: &Config, info: &CpuInfo) -> usize {
    match config.threads.count {
        ThreadCount::Fixed(n) => n,
        ThreadCount::Mode(ThreadMode::All) => info.logical_cores.max(1),
        ThreadCount::Mode(ThreadMode::Auto) => {
            info.recommended_threads(sizing_algorithm(config), config.thread_hash_factor(0))
        }
    }
}

/// Plan every worker: count, CPU, hash factor and scratch size.
pub fn plan_workers(config: &Config, info: &CpuInfo) -> Vec<WorkerPlan> {
    let count = thread_count(config, info);
    let algo = sizing_algorithm(config);
    let cpus = assign_cpus(info, count, config.threads.affinity);

    cpus.into_iter()
        .enumerate()
        .map(|(index, cpu)| {
            let hash_factor = config.thread_hash_factor(index);
            WorkerPlan {
                index,
                cpu: config.thread_cpu_override(index).or(cpu),
                hash_factor,
                scratch_size: algo.scratch_size_for(hash_factor),
            }
        })
        .collect()
}

/// A running worker thread.
///
/// The thread owns the worker's scratch buffer; joining the thread is what
/// releases it.
#[derive(Debug)]
pub struct WorkerHandle {
    pub index: usize,
    pub cpu: Option<usize>,
    pub hash_factor: usize,
    pub huge_pages: bool,
    hashes: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Hashes computed since the worker started. Never decreases.
    pub fn hashes(&self) -> u64 {
        self.hashes.load(Ordering::Relaxed)
    }

    pub fn counter(&self) -> Arc<AtomicU64> {
        self.hashes.clone()
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(worker = self.index, "Worker thread panicked");
            }
        }
    }
}

/// Fixed pool of hashing threads.
pub struct WorkerScheduler {
    board: Arc<WorkBoard>,
    workers: Vec<WorkerHandle>,
}

impl WorkerScheduler {
    /// Allocate scratch for and start every planned worker.
    ///
    /// On any failure the workers already started are stopped and joined
    /// before the error is returned, so no scratch buffer outlives the call.
    pub fn start(
        plans: &[WorkerPlan],
        board: Arc<WorkBoard>,
        executor: Arc<dyn HashExecutor>,
        memory: &MemoryManager,
        shares: mpsc::Sender<Share>,
    ) -> Result<Self> {
        let mut scheduler = Self {
            board,
            workers: Vec::with_capacity(plans.len()),
        };

        for plan in plans {
            match scheduler.spawn(plan, plans.len(), executor.clone(), memory, shares.clone()) {
                Ok(handle) => scheduler.workers.push(handle),
                Err(e) => {
                    error!(worker = plan.index, error = %e, "Failed to start worker");
                    scheduler.stop();
                    return Err(e);
                }
            }
        }

        info!(
            threads = scheduler.workers.len(),
            executor = executor.name(),
            "Workers started"
        );
        Ok(scheduler)
    }

    fn spawn(
        &self,
        plan: &WorkerPlan,
        count: usize,
        executor: Arc<dyn HashExecutor>,
        memory: &MemoryManager,
        shares: mpsc::Sender<Share>,
    ) -> Result<WorkerHandle> {
        let scratch = memory.allocate(plan.scratch_size)?;
        let huge_pages = scratch.huge_pages();
        let hashes = Arc::new(AtomicU64::new(0));

        let worker = Worker::new(
            plan.index,
            count,
            plan.hash_factor,
            self.board.clone(),
            executor,
            shares,
            hashes.clone(),
            scratch,
        );

        let index = plan.index;
        let cpu = plan.cpu;
        // If spawning fails the closure, and the scratch buffer inside it,
        // is dropped right here.
        let thread = std::thread::Builder::new()
            .name(format!("cpu-miner-{}", index))
            .spawn(move || {
                if let Some(cpu) = cpu {
                    if !pin_current_thread(cpu) {
                        warn!(worker = index, cpu, "Failed to set thread affinity");
                    }
                }
                worker.run();
            })?;

        debug!(
            worker = index,
            cpu = ?cpu,
            hash_factor = plan.hash_factor,
            huge_pages,
            "Worker spawned"
        );

        Ok(WorkerHandle {
            index,
            cpu,
            hash_factor: plan.hash_factor,
            huge_pages,
            hashes,
            thread: Some(thread),
        })
    }

    pub fn board(&self) -> &Arc<WorkBoard> {
        &self.board
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Per-worker hash counters, in worker order.
    pub fn counters(&self) -> Vec<Arc<AtomicU64>> {
        self.workers.iter().map(WorkerHandle::counter).collect()
    }

    /// Stop iterating nonces. Threads and scratch stay.
    pub fn pause(&self) {
        self.board.pause();
        info!("Mining paused");
    }

    /// Continue on whatever job is current now, from fresh ranges.
    pub fn resume(&self) {
        self.board.republish();
        self.board.resume();
        info!("Mining resumed");
    }

    /// Stop and join every worker, releasing their scratch buffers.
    pub fn stop(&mut self) {
        self.board.stop();
        for worker in &mut self.workers {
            worker.join();
        }
        if !self.workers.is_empty() {
            debug!(threads = self.workers.len(), "Workers joined");
        }
        self.workers.clear();
    }
}

impl Drop for WorkerScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::HugePageInfo;
    use crate::hasher::Digest;
    use crate::pool::{Job, PoolId};
    use serial_test::serial;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn info(logical: usize) -> CpuInfo {
        CpuInfo {
            brand: "test".into(),
            sockets: 1,
            logical_cores: logical,
            physical_cores: logical,
            l2_bytes: 0,
            l3_bytes: 8 * 1024 * 1024,
            aes: true,
            x86_64: true,
            cores: (0..logical).map(|cpu| vec![cpu]).collect(),
            huge_pages: HugePageInfo::default(),
        }
    }

    fn config(extra: &str) -> Config {
        let text = format!(
            "[[pools]]\nurl = \"pool.example.com:3333\"\nuser = \"w\"\n{}",
            extra
        );
        Config::from_toml_str(&text).unwrap()
    }

    /// Never meets a target; records which job it last hashed.
    #[derive(Default)]
    struct Counting {
        last_seq: AtomicU64,
    }

    impl HashExecutor for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn hash(&self, job: &Job, _nonce: u32, _scratch: &mut [u8]) -> Digest {
            self.last_seq.store(job.seq, Ordering::Relaxed);
            [0xffu8; 32]
        }
    }

    fn job(seq: u64) -> Arc<Job> {
        let blob = hex::encode([0u8; 76]);
        Arc::new(
            Job::from_hex("j", &blob, "ffffffff", Algorithm::CryptonightLite, PoolId(0), seq, false)
                .unwrap(),
        )
    }

    fn total(scheduler: &WorkerScheduler) -> u64 {
        scheduler.workers().iter().map(WorkerHandle::hashes).sum()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn start(
        threads: usize,
        executor: Arc<dyn HashExecutor>,
    ) -> (WorkerScheduler, MemoryManager, mpsc::Receiver<Share>) {
        let memory = MemoryManager::new(false, None);
        let plans: Vec<_> = (0..threads)
            .map(|index| WorkerPlan {
                index,
                cpu: None,
                hash_factor: 1,
                scratch_size: Algorithm::CryptonightLite.scratch_size(),
            })
            .collect();
        let (tx, rx) = mpsc::channel(SHARE_QUEUE_DEPTH);
        let scheduler =
            WorkerScheduler::start(&plans, Arc::new(WorkBoard::new()), executor, &memory, tx)
                .unwrap();
        (scheduler, memory, rx)
    }

    #[test]
    #[serial]
    fn plan_defaults_to_one_worker_per_logical_core() {
        let plans = plan_workers(&config(""), &info(4));
        assert_eq!(plans.len(), 4);
        assert_eq!(
            plans.iter().map(|p| p.cpu).collect::<Vec<_>>(),
            vec![Some(0), Some(1), Some(2), Some(3)]
        );
        assert!(plans
            .iter()
            .all(|p| p.scratch_size == Algorithm::Cryptonight.scratch_size()));
    }

    #[test]
    #[serial]
    fn plan_applies_overrides_and_multi_hash_mask() {
        let config = config(
            "[threads]\ncount = 3\nhash_factor = 2\nmulti_hash_thread_mask = 0x1\n\
             [[threads.overrides]]\nindex = 2\ncpu = 9\nhash_factor = 3\n",
        );
        let plans = plan_workers(&config, &info(8));
        assert_eq!(
            plans.iter().map(|p| p.hash_factor).collect::<Vec<_>>(),
            vec![2, 1, 3]
        );
        assert_eq!(plans[2].cpu, Some(9));
        assert_eq!(
            plans[2].scratch_size,
            Algorithm::Cryptonight.scratch_size_for(3)
        );
    }

    #[test]
    #[serial]
    fn auto_threads_fit_in_cache() {
        let config = config("[threads]\ncount = \"auto\"\n");
        // 8 MiB of L3 over 2 MiB working sets.
        assert_eq!(thread_count(&config, &info(16)), 4);
    }

    #[test]
    #[serial]
    fn scratch_is_sized_for_largest_pool_algorithm() {
        let text = "algo = \"cryptonight-lite\"\n\
                    [[pools]]\nurl = \"a.example.com:1\"\nuser = \"w\"\n\
                    [[pools]]\nurl = \"b.example.com:1\"\nuser = \"w\"\nalgo = \"cryptonight-heavy\"\n";
        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(sizing_algorithm(&config), Algorithm::CryptonightHeavy);
    }

    #[test]
    fn pause_freezes_counters_and_resume_uses_current_job() {
        let executor = Arc::new(Counting::default());
        let (mut scheduler, memory, _rx) = start(2, executor.clone());
        assert_eq!(memory.usage().buffers, 2);

        scheduler.board().publish(Some(job(1)));
        wait_until(|| total(&scheduler) > 100);

        scheduler.pause();
        std::thread::sleep(IDLE_WAIT * 2);
        let frozen = total(&scheduler);
        std::thread::sleep(IDLE_WAIT * 4);
        assert_eq!(total(&scheduler), frozen);

        // Work that arrives while paused is what resume picks up.
        scheduler.board().publish(Some(job(2)));
        std::thread::sleep(IDLE_WAIT * 2);
        assert_eq!(total(&scheduler), frozen);

        scheduler.resume();
        wait_until(|| total(&scheduler) > frozen + 100);
        assert_eq!(executor.last_seq.load(Ordering::Relaxed), 2);

        scheduler.stop();
        assert_eq!(memory.usage().buffers, 0);
    }

    /// Records, per hashing thread, the job sequence of every hash.
    #[derive(Default)]
    struct Recording {
        seen: Mutex<HashMap<std::thread::ThreadId, Vec<u64>>>,
    }

    impl HashExecutor for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn hash(&self, job: &Job, _nonce: u32, _scratch: &mut [u8]) -> Digest {
            self.seen
                .lock()
                .unwrap()
                .entry(std::thread::current().id())
                .or_default()
                .push(job.seq);
            [0xffu8; 32]
        }
    }

    #[test]
    fn workers_observe_non_decreasing_jobs() {
        let executor = Arc::new(Recording::default());
        let (mut scheduler, _memory, _rx) = start(3, executor.clone());
        let board = scheduler.board().clone();

        for seq in 1..=50 {
            board.publish(Some(job(seq)));
            std::thread::sleep(Duration::from_millis(1));
        }
        wait_until(|| {
            executor
                .seen
                .lock()
                .unwrap()
                .values()
                .filter(|seqs| seqs.last() == Some(&50))
                .count()
                == 3
        });
        scheduler.stop();

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        for seqs in seen.values() {
            assert!(seqs.windows(2).all(|w| w[0] <= w[1]), "{:?}", seqs);
        }
    }

    #[test]
    fn stop_releases_scratch() {
        let (mut scheduler, memory, _rx) = start(3, Arc::new(Counting::default()));
        assert_eq!(memory.usage().buffers, 3);
        scheduler.stop();
        assert!(scheduler.workers().is_empty());
        assert_eq!(memory.usage().buffers, 0);
    }

    #[test]
    fn allocation_failure_cleans_up_started_workers() {
        let memory = MemoryManager::new(false, None);
        let plans = vec![
            WorkerPlan {
                index: 0,
                cpu: None,
                hash_factor: 1,
                scratch_size: 4096,
            },
            WorkerPlan {
                index: 1,
                cpu: None,
                hash_factor: 1,
                scratch_size: 0,
            },
        ];
        let (tx, _rx) = mpsc::channel(1);
        let result = WorkerScheduler::start(
            &plans,
            Arc::new(WorkBoard::new()),
            Arc::new(Counting::default()),
            &memory,
            tx,
        );
        assert!(result.is_err());
        assert_eq!(memory.usage().buffers, 0);
    }
}
