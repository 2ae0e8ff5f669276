//! Work published to the worker threads.
//!
//! The I/O side swaps in a new [`WorkUnit`] with one atomic pointer store;
//! workers load it at the top of every pass and never take a lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::pool::Job;

/// A job as seen by the workers.
#[derive(Debug)]
pub struct WorkUnit {
    pub job: Arc<Job>,

    /// Global publication counter; strictly increasing across pools
    pub epoch: u64,
}

/// Shared slot for the current work plus the pause and stop flags.
#[derive(Debug, Default)]
pub struct WorkBoard {
    work: ArcSwapOption<WorkUnit>,
    epoch: AtomicU64,
    paused: AtomicBool,
    stopped: AtomicBool,
}

impl WorkBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `job`, or clear the board with `None`, and return the new
    /// epoch.
    pub fn publish(&self, job: Option<Arc<Job>>) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.work.store(job.map(|job| Arc::new(WorkUnit { job, epoch })));
        epoch
    }

    /// Publish the current job again under a new epoch, so every worker
    /// starts a fresh range.
    pub fn republish(&self) -> u64 {
        let job = self.work.load().as_ref().map(|unit| unit.job.clone());
        self.publish(job)
    }

    /// Current work, if any.
    pub fn current(&self) -> Option<Arc<WorkUnit>> {
        self.work.load_full()
    }

    /// Job currently on the board.
    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.work.load().as_ref().map(|unit| unit.job.clone())
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Ask every worker to exit after its current pass.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::Algorithm;
    use crate::pool::PoolId;

    fn job(seq: u64) -> Arc<Job> {
        let blob = hex::encode([0u8; 76]);
        Arc::new(
            Job::from_hex("j", &blob, "ffffffff", Algorithm::Cryptonight, PoolId(0), seq, false)
                .unwrap(),
        )
    }

    #[test]
    fn epochs_increase_with_every_publication() {
        let board = WorkBoard::new();
        assert!(board.current().is_none());

        assert_eq!(board.publish(Some(job(1))), 1);
        assert_eq!(board.current().unwrap().epoch, 1);

        assert_eq!(board.publish(None), 2);
        assert!(board.current().is_none());
        assert_eq!(board.epoch(), 2);

        assert_eq!(board.publish(Some(job(2))), 3);
        assert_eq!(board.current_job().unwrap().seq, 2);
    }

    #[test]
    fn republish_keeps_job_and_bumps_epoch() {
        let board = WorkBoard::new();
        board.publish(Some(job(7)));
        assert_eq!(board.republish(), 2);

        let unit = board.current().unwrap();
        assert_eq!(unit.epoch, 2);
        assert_eq!(unit.job.seq, 7);
    }

    #[test]
    fn flags() {
        let board = WorkBoard::new();
        assert!(!board.is_paused());
        board.pause();
        assert!(board.is_paused());
        board.resume();
        assert!(!board.is_paused());
        board.stop();
        assert!(board.is_stopped());
    }
}
