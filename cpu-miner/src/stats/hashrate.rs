//! Windowed hashrate from worker hash counters.
//!
//! Workers only ever add to their counters. The monitor samples all of them
//! at once on a fixed interval and derives each window's rate from the
//! difference between the newest sample and the oldest one still inside the
//! window. A paused worker's counter stops moving, so its rate decays to zero
//! as the window slides past the pause.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::types::HashRate;

pub const SHORT_WINDOW: Duration = Duration::from_millis(2_500);
pub const MEDIUM_WINDOW: Duration = Duration::from_secs(60);
pub const LONG_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Rates over the three reporting windows. `None` until the window has at
/// least two samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HashrateWindows {
    pub short: Option<HashRate>,
    pub medium: Option<HashRate>,
    pub long: Option<HashRate>,
}

impl std::fmt::Display for HashrateWindows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |rate: Option<HashRate>| match rate {
            Some(rate) => format!("{:.1}", rate.as_hashes()),
            None => "n/a".to_string(),
        };
        write!(
            f,
            "{} {} {} H/s",
            show(self.short),
            show(self.medium),
            show(self.long)
        )
    }
}

/// Samples per-worker counters and answers windowed rate queries.
#[derive(Debug)]
pub struct HashrateMonitor {
    counters: Vec<Arc<AtomicU64>>,
    samples: VecDeque<(Instant, Vec<u64>)>,
    highest: HashRate,
}

impl HashrateMonitor {
    pub fn new(counters: Vec<Arc<AtomicU64>>) -> Self {
        Self {
            counters,
            samples: VecDeque::new(),
            highest: HashRate::default(),
        }
    }

    pub fn threads(&self) -> usize {
        self.counters.len()
    }

    /// Record the counters now.
    pub fn sample(&mut self) {
        self.sample_at(Instant::now());
    }

    /// Record the counters as of `at`.
    pub fn sample_at(&mut self, at: Instant) {
        let counts = self
            .counters
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        self.record(at, counts);
    }

    fn record(&mut self, at: Instant, counts: Vec<u64>) {
        self.samples.push_back((at, counts));

        // Keep one sample at or beyond the long window so it stays fully
        // covered.
        if let Some(cutoff) = at.checked_sub(LONG_WINDOW) {
            while self.samples.len() > 2 && self.samples[1].0 <= cutoff {
                self.samples.pop_front();
            }
        }

        if let Some(short) = self.total(SHORT_WINDOW) {
            if short > self.highest {
                self.highest = short;
            }
        }
    }

    /// Rate of worker `thread` over `window`.
    pub fn thread_rate(&self, thread: usize, window: Duration) -> Option<HashRate> {
        self.rate(window, |counts| counts.get(thread).copied().unwrap_or(0))
    }

    /// Combined rate over `window`.
    pub fn total(&self, window: Duration) -> Option<HashRate> {
        self.rate(window, |counts| counts.iter().sum())
    }

    /// All three windows for the combined rate.
    pub fn windows(&self) -> HashrateWindows {
        HashrateWindows {
            short: self.total(SHORT_WINDOW),
            medium: self.total(MEDIUM_WINDOW),
            long: self.total(LONG_WINDOW),
        }
    }

    /// All three windows for each worker.
    pub fn thread_windows(&self) -> Vec<HashrateWindows> {
        (0..self.counters.len())
            .map(|thread| HashrateWindows {
                short: self.thread_rate(thread, SHORT_WINDOW),
                medium: self.thread_rate(thread, MEDIUM_WINDOW),
                long: self.thread_rate(thread, LONG_WINDOW),
            })
            .collect()
    }

    /// Highest short-window rate seen.
    pub fn highest(&self) -> HashRate {
        self.highest
    }

    fn rate(&self, window: Duration, count: impl Fn(&[u64]) -> u64) -> Option<HashRate> {
        let (newest_at, newest) = self.samples.back()?;
        let (oldest_at, oldest) = match newest_at.checked_sub(window) {
            Some(since) => self.samples.iter().find(|(t, _)| *t >= since)?,
            None => self.samples.front()?,
        };
        if oldest_at >= newest_at {
            return None;
        }
        let hashes = count(newest.as_slice()).saturating_sub(count(oldest.as_slice()));
        Some(HashRate::from_count(hashes, *newest_at - *oldest_at))
    }
}
