//! Share result accounting and rejection health.

use std::collections::VecDeque;

use serde::Serialize;

use crate::config::HealthConfig;
use crate::pool::SubmitOutcome;

/// Point-in-time copy of the counters, for status and summary output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResultsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub discarded: u64,

    /// Sum of the difficulty of accepted shares
    pub total_difficulty: u64,

    /// Highest difficulty among accepted shares
    pub best_difficulty: u64,

    /// Rejected fraction over the rolling window
    pub rejection_ratio: f64,

    pub healthy: bool,
}

/// Counts share outcomes and watches the recent rejection rate.
///
/// Only answers from the pool count toward the rolling window: a timeout or
/// a local discard says nothing about whether the pool likes our shares.
#[derive(Debug, Clone)]
pub struct ShareResults {
    accepted: u64,
    rejected: u64,
    timed_out: u64,
    discarded: u64,
    total_difficulty: u64,
    best_difficulty: u64,
    window: VecDeque<bool>,
    window_size: usize,
    max_ratio: f64,
}

impl ShareResults {
    pub fn new(health: &HealthConfig) -> Self {
        Self {
            accepted: 0,
            rejected: 0,
            timed_out: 0,
            discarded: 0,
            total_difficulty: 0,
            best_difficulty: 0,
            window: VecDeque::with_capacity(health.rejection_window),
            window_size: health.rejection_window.max(1),
            max_ratio: health.max_rejection_ratio,
        }
    }

    pub fn record(&mut self, outcome: &SubmitOutcome, difficulty: u64) {
        match outcome {
            SubmitOutcome::Accepted => {
                self.accepted += 1;
                self.total_difficulty = self.total_difficulty.saturating_add(difficulty);
                self.best_difficulty = self.best_difficulty.max(difficulty);
                self.push(false);
            }
            SubmitOutcome::Rejected(_) => {
                self.rejected += 1;
                self.push(true);
            }
            SubmitOutcome::TimedOut => self.timed_out += 1,
            SubmitOutcome::Discarded(_) => self.discarded += 1,
        }
    }

    fn push(&mut self, rejected: bool) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(rejected);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Rejected fraction of the most recent pool answers.
    pub fn rejection_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let rejected = self.window.iter().filter(|r| **r).count();
        rejected as f64 / self.window.len() as f64
    }

    pub fn is_healthy(&self) -> bool {
        self.rejection_ratio() <= self.max_ratio
    }

    pub fn snapshot(&self) -> ResultsSnapshot {
        ResultsSnapshot {
            accepted: self.accepted,
            rejected: self.rejected,
            timed_out: self.timed_out,
            discarded: self.discarded,
            total_difficulty: self.total_difficulty,
            best_difficulty: self.best_difficulty,
            rejection_ratio: self.rejection_ratio(),
            healthy: self.is_healthy(),
        }
    }
}
