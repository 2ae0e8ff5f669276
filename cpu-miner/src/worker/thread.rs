//! The per-thread hashing loop.
//!
//! Runs on a dedicated `std::thread`: CPU-bound work never shares a thread
//! with the async runtime. Each pass loads the board, switches to newer work
//! if there is any, and hashes one batch of `hash_factor` nonces.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};

use super::board::WorkBoard;
use super::nonce::NonceRange;
use crate::hasher::{Digest, HashExecutor};
use crate::memory::ScratchBuffer;
use crate::pool::{Job, Share};
use crate::tracing::prelude::*;

/// Sleep between board checks while there is nothing to hash.
pub const IDLE_WAIT: Duration = Duration::from_millis(50);

/// What one call to [`Worker::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Hashed this many nonces
    Hashed(u32),
    /// Paused, no work, or work this worker cannot hash
    Idle,
    /// The board was stopped or the share queue is gone
    Stopped,
}

/// Per-worker state owned by the hashing thread.
pub struct Worker {
    pub(super) id: usize,
    pub(super) count: usize,
    pub(super) hash_factor: usize,
    pub(super) board: Arc<WorkBoard>,
    pub(super) executor: Arc<dyn HashExecutor>,
    pub(super) shares: mpsc::Sender<Share>,
    pub(super) hashes: Arc<AtomicU64>,
    pub(super) scratch: ScratchBuffer,
    job: Option<Arc<Job>>,
    range: Option<NonceRange>,
    epoch: u64,
    job_hashes: u64,
    digests: Vec<Digest>,
    unsupported: Option<u64>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        count: usize,
        hash_factor: usize,
        board: Arc<WorkBoard>,
        executor: Arc<dyn HashExecutor>,
        shares: mpsc::Sender<Share>,
        hashes: Arc<AtomicU64>,
        scratch: ScratchBuffer,
    ) -> Self {
        let hash_factor = hash_factor.max(1);
        Self {
            id,
            count,
            hash_factor,
            board,
            executor,
            shares,
            hashes,
            scratch,
            job: None,
            range: None,
            epoch: 0,
            job_hashes: 0,
            digests: vec![[0u8; 32]; hash_factor],
            unsupported: None,
        }
    }

    /// Hashes computed against the current job.
    pub fn job_hashes(&self) -> u64 {
        self.job_hashes
    }

    /// Range currently being worked.
    pub fn range(&self) -> Option<&NonceRange> {
        self.range.as_ref()
    }

    /// Epoch of the work this worker last picked up.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// One pass of the loop.
    pub fn step(&mut self) -> Step {
        if self.board.is_stopped() {
            return Step::Stopped;
        }
        if self.board.is_paused() {
            return Step::Idle;
        }

        match self.board.current() {
            Some(unit) if unit.epoch > self.epoch => {
                self.epoch = unit.epoch;
                self.range = Some(NonceRange::for_job(&unit.job, self.id, self.count));
                self.job = Some(unit.job.clone());
                self.job_hashes = 0;
            }
            // Never move back to older work.
            Some(_) => {}
            None => {
                self.job = None;
                self.range = None;
                return Step::Idle;
            }
        }

        let (Some(job), Some(range)) = (self.job.clone(), self.range.as_mut()) else {
            return Step::Idle;
        };

        let needed = job.algo.scratch_size_for(self.hash_factor);
        if needed > self.scratch.len() {
            if self.unsupported != Some(self.epoch) {
                warn!(
                    worker = self.id,
                    algo = %job.algo,
                    needed,
                    have = self.scratch.len(),
                    "Scratch buffer too small for job, idling"
                );
                self.unsupported = Some(self.epoch);
            }
            return Step::Idle;
        }

        let batch = self.hash_factor as u32;
        let first = range.next_batch(batch);
        self.executor.hash_many(
            &job,
            first,
            &mut self.scratch.as_mut_slice()[..needed],
            &mut self.digests,
        );

        for (i, digest) in self.digests.iter().enumerate() {
            if !job.meets_target(digest) {
                continue;
            }
            let nonce = first.wrapping_add(i as u32);
            trace!(worker = self.id, job_id = %job.id, nonce, "Found share");
            match self.shares.try_send(Share::new(job.clone(), nonce, *digest)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(worker = self.id, nonce, "Share queue full, dropping share");
                }
                Err(TrySendError::Closed(_)) => return Step::Stopped,
            }
        }

        self.job_hashes += batch as u64;
        self.hashes.fetch_add(batch as u64, Ordering::Relaxed);
        Step::Hashed(batch)
    }

    /// Loop until stopped. The scratch buffer is released when this returns.
    pub fn run(mut self) {
        debug!(worker = self.id, hash_factor = self.hash_factor, "Worker started");
        loop {
            match self.step() {
                Step::Hashed(_) => {}
                Step::Idle => std::thread::sleep(IDLE_WAIT),
                Step::Stopped => break,
            }
        }
        debug!(worker = self.id, "Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::Algorithm;
    use crate::memory::MemoryManager;
    use crate::pool::PoolId;
    use std::sync::Mutex;

    /// Meets the target only for the nonce `winner`.
    struct Stub {
        winner: u32,
        seen: Mutex<Vec<u32>>,
    }

    impl Stub {
        fn new(winner: u32) -> Arc<Self> {
            Arc::new(Self {
                winner,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl HashExecutor for Stub {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn hash(&self, _job: &Job, nonce: u32, _scratch: &mut [u8]) -> Digest {
            self.seen.lock().unwrap().push(nonce);
            if nonce == self.winner {
                [0u8; 32]
            } else {
                [0xffu8; 32]
            }
        }
    }

    fn job(seq: u64) -> Arc<Job> {
        let blob = hex::encode([0u8; 76]);
        Arc::new(
            Job::from_hex("j", &blob, "ffffffff", Algorithm::CryptonightLite, PoolId(0), seq, false)
                .unwrap(),
        )
    }

    fn worker(
        id: usize,
        count: usize,
        hash_factor: usize,
        executor: Arc<dyn HashExecutor>,
    ) -> (Worker, Arc<WorkBoard>, mpsc::Receiver<Share>) {
        let board = Arc::new(WorkBoard::new());
        let (tx, rx) = mpsc::channel(16);
        let memory = MemoryManager::new(false, None);
        let scratch = memory
            .allocate(Algorithm::CryptonightLite.scratch_size_for(hash_factor))
            .unwrap();
        let worker = Worker::new(
            id,
            count,
            hash_factor,
            board.clone(),
            executor,
            tx,
            Arc::new(AtomicU64::new(0)),
            scratch,
        );
        (worker, board, rx)
    }

    #[test]
    fn fifth_nonce_yields_exactly_one_share() {
        let start = NonceRange::partition(0, 1 << 32, 1, 4).first();
        let (mut worker, board, mut rx) = worker(1, 4, 1, Stub::new(start + 4));
        board.publish(Some(job(1)));

        for _ in 0..8 {
            assert_eq!(worker.step(), Step::Hashed(1));
        }

        let share = rx.try_recv().unwrap();
        assert_eq!(share.nonce, start + 4);
        assert!(rx.try_recv().is_err());
        assert_eq!(worker.hashes.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn batches_follow_hash_factor() {
        let stub = Stub::new(3);
        let (mut worker, board, mut rx) = worker(0, 1, 2, stub.clone());
        board.publish(Some(job(1)));

        assert_eq!(worker.step(), Step::Hashed(2));
        assert_eq!(worker.step(), Step::Hashed(2));
        assert_eq!(*stub.seen.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(rx.try_recv().unwrap().nonce, 3);
        assert_eq!(worker.job_hashes(), 4);
    }

    #[test]
    fn idles_without_work_and_when_paused() {
        let (mut worker, board, _rx) = worker(0, 1, 1, Stub::new(0));
        assert_eq!(worker.step(), Step::Idle);

        board.publish(Some(job(1)));
        board.pause();
        assert_eq!(worker.step(), Step::Idle);
        assert_eq!(worker.hashes.load(Ordering::Relaxed), 0);

        board.resume();
        assert_eq!(worker.step(), Step::Hashed(1));

        board.publish(None);
        assert_eq!(worker.step(), Step::Idle);
        assert!(worker.range().is_none());

        board.stop();
        assert_eq!(worker.step(), Step::Stopped);
    }

    #[test]
    fn new_work_resets_range_and_job_counter() {
        let stub = Stub::new(u32::MAX);
        let (mut worker, board, _rx) = worker(0, 1, 1, stub.clone());
        board.publish(Some(job(1)));
        worker.step();
        worker.step();
        assert_eq!(worker.job_hashes(), 2);

        board.publish(Some(job(2)));
        worker.step();
        assert_eq!(worker.job_hashes(), 1);
        assert_eq!(worker.epoch(), 2);
        assert_eq!(*stub.seen.lock().unwrap(), vec![0, 1, 0]);
        assert_eq!(worker.hashes.load(Ordering::Relaxed), 3);
    }

    struct EveryNonce;

    impl HashExecutor for EveryNonce {
        fn name(&self) -> &'static str {
            "every-nonce"
        }

        fn hash(&self, _job: &Job, _nonce: u32, _scratch: &mut [u8]) -> Digest {
            [0u8; 32]
        }
    }

    #[test]
    fn full_share_queue_never_blocks() {
        let board = Arc::new(WorkBoard::new());
        let (tx, mut rx) = mpsc::channel(1);
        let scratch = MemoryManager::new(false, None)
            .allocate(Algorithm::CryptonightLite.scratch_size())
            .unwrap();
        let mut worker = Worker::new(
            0,
            1,
            1,
            board.clone(),
            Arc::new(EveryNonce),
            tx,
            Arc::default(),
            scratch,
        );
        board.publish(Some(job(1)));

        assert_eq!(worker.step(), Step::Hashed(1));
        assert_eq!(worker.step(), Step::Hashed(1));
        assert_eq!(rx.try_recv().unwrap().nonce, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_share_queue_stops_worker() {
        let (mut worker, board, rx) = worker(0, 1, 1, Stub::new(0));
        board.publish(Some(job(1)));
        drop(rx);
        assert_eq!(worker.step(), Step::Stopped);
    }

    #[test]
    fn undersized_scratch_idles() {
        let (mut worker, board, _rx) = worker(0, 1, 1, Stub::new(0));
        let blob = hex::encode([0u8; 76]);
        let heavy = Job::from_hex("h", &blob, "ffffffff", Algorithm::CryptonightHeavy, PoolId(0), 1, false)
            .unwrap();
        board.publish(Some(Arc::new(heavy)));
        assert_eq!(worker.step(), Step::Idle);
    }
}
