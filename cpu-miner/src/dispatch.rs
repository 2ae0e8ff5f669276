//! Glue between the pool connections and the workers.
//!
//! The [`Dispatcher`] runs on the I/O runtime. It consumes connection
//! events, asks the [`Strategy`] which connection is active, publishes that
//! connection's job to the [`WorkBoard`], routes shares found by the workers
//! back to the connection that issued their job, and keeps the share result
//! counters.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::pool::{
    ConnectionState, DiscardReason, PoolEvent, PoolEventKind, PoolHandle, PoolId, Share,
    SubmitOutcome,
};
use crate::stats::{ResultsSnapshot, ShareResults};
use crate::strategy::Strategy;
use crate::tracing::prelude::*;
use crate::worker::WorkBoard;

/// What the dispatcher currently knows, for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchStatus {
    /// Connection whose job the workers are hashing
    pub active: Option<PoolId>,

    /// Last reported state of every connection, donation pool last
    pub states: Vec<ConnectionState>,

    pub results: ResultsSnapshot,
}

type Outcome = BoxFuture<'static, (PoolId, SubmitOutcome)>;

pub struct Dispatcher {
    pools: Vec<PoolHandle>,
    states: Vec<ConnectionState>,
    strategy: Strategy,
    board: Arc<WorkBoard>,
    results: ShareResults,
    active: Option<PoolId>,
    /// Pool and sequence number of the last job put on the board
    published: Option<(PoolId, u64)>,
    events: mpsc::Receiver<PoolEvent>,
    shares: mpsc::Receiver<Share>,
    status: watch::Sender<DispatchStatus>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// `pools` must be indexed by [`PoolId`]: configured pools in priority
    /// order, then the donation pool.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pools: Vec<PoolHandle>,
        strategy: Strategy,
        board: Arc<WorkBoard>,
        results: ShareResults,
        events: mpsc::Receiver<PoolEvent>,
        shares: mpsc::Receiver<Share>,
        shutdown: CancellationToken,
    ) -> (Self, watch::Receiver<DispatchStatus>) {
        let states = pools.iter().map(PoolHandle::state).collect();
        let (status, status_rx) = watch::channel(DispatchStatus::default());
        let dispatcher = Self {
            pools,
            states,
            strategy,
            board,
            results,
            active: None,
            published: None,
            events,
            shares,
            status,
            shutdown,
        };
        dispatcher.publish_status();
        (dispatcher, status_rx)
    }

    pub async fn run(mut self) {
        let mut outcomes: FuturesUnordered<Outcome> = FuturesUnordered::new();
        let mut boundary = self.next_boundary();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                event = self.events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => {
                        debug!("All connections gone, dispatcher exiting");
                        break;
                    }
                },

                Some(share) = self.shares.recv() => {
                    if let Some(outcome) = self.route(share) {
                        outcomes.push(outcome);
                    }
                }

                Some((pool, outcome)) = outcomes.next(), if !outcomes.is_empty() => {
                    self.on_local_outcome(pool, outcome);
                }

                _ = sleep_until(boundary.unwrap_or_else(Instant::now)), if boundary.is_some() => {
                    self.reselect();
                    boundary = self.next_boundary();
                }
            }
        }

        // Stop feeding the workers.
        self.board.publish(None);
    }

    fn next_boundary(&self) -> Option<Instant> {
        self.strategy
            .donation()
            .filter(|(_, schedule)| schedule.level() > 0)
            .map(|(_, schedule)| schedule.next_boundary(Instant::now()))
    }

    fn on_event(&mut self, event: PoolEvent) {
        let PoolEvent { pool, kind } = event;
        match kind {
            PoolEventKind::StateChanged(state) => {
                if let Some(slot) = self.states.get_mut(pool.0) {
                    *slot = state;
                }
                self.reselect();
            }
            PoolEventKind::NewJob(job) => {
                if self.active != Some(pool) {
                    return;
                }
                // The board may already carry a newer job read straight from
                // the handle during a switch.
                if let Some((published_pool, seq)) = self.published {
                    if published_pool == pool && job.seq <= seq {
                        return;
                    }
                }
                self.published = Some((pool, job.seq));
                self.board.publish(Some(job));
            }
            PoolEventKind::ShareResult {
                difficulty,
                outcome,
                ..
            } => {
                self.results.record(&outcome, difficulty);
                self.publish_status();
            }
        }
    }

    /// Re-run the strategy and republish work if the active pool changed.
    fn reselect(&mut self) {
        let chosen = self.strategy.choose(&self.states, Instant::now());
        if chosen == self.active {
            self.publish_status();
            return;
        }

        let previous = std::mem::replace(&mut self.active, chosen);
        match chosen {
            Some(id) => {
                let pool = &self.pools[id.0];
                info!(
                    pool = %pool.descriptor(),
                    id = %id,
                    previous = ?previous,
                    "Active pool changed"
                );
            }
            None => warn!("No pool ready, workers idle"),
        }

        let job = chosen.and_then(|id| self.pools.get(id.0).and_then(PoolHandle::current_job));
        self.published = job.as_ref().map(|job| (job.pool, job.seq));
        self.board.publish(job);
        self.publish_status();
    }

    fn route(&mut self, share: Share) -> Option<Outcome> {
        let pool = share.job.pool;
        let Some(handle) = self.pools.get(pool.0) else {
            warn!(pool = %pool, "Share for unknown pool dropped");
            return None;
        };

        trace!(pool = %pool, job_id = %share.job.id, nonce = share.nonce, "Routing share");
        let reply = handle.submit_share(share);
        Some(
            reply
                .map(move |outcome| {
                    let outcome =
                        outcome.unwrap_or(SubmitOutcome::Discarded(DiscardReason::Closed));
                    (pool, outcome)
                })
                .boxed(),
        )
    }

    /// Account for shares the connection discarded without ever putting
    /// them on its event stream.
    fn on_local_outcome(&mut self, pool: PoolId, outcome: SubmitOutcome) {
        if let SubmitOutcome::Discarded(reason @ (DiscardReason::NotReady | DiscardReason::Closed)) =
            outcome
        {
            debug!(pool = %pool, reason = %reason, "Share discarded");
            self.results.record(&outcome, 0);
            self.publish_status();
        }
    }

    fn publish_status(&self) {
        self.status.send_replace(DispatchStatus {
            active: self.active,
            states: self.states.clone(),
            results: self.results.snapshot(),
        });
    }
}
