//! The mining session.
//!
//! A [`Miner`] owns everything that lives for one configuration: the pool
//! connections, the dispatcher, the worker threads and their scratch
//! memory. It runs sessions back to back until told to shut down; restart
//! and reconfigure commands end the current session and start a fresh one.
//!
//! Teardown always runs in the same order: workers are stopped and joined
//! first (releasing their scratch), then the connections and the dispatcher
//! are cancelled and awaited.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::Config;
use crate::control::{ControlCommand, Controller};
use crate::cpu::CpuInfo;
use crate::dispatch::{DispatchStatus, Dispatcher};
use crate::error::Result;
use crate::hasher::HashExecutor;
use crate::memory::MemoryManager;
use crate::pool::{
    dialect_for, ConnectionSettings, Connector, PoolConnection, PoolDescriptor, PoolId,
};
use crate::stats::{HashrateMonitor, ShareResults};
use crate::status::StatusReport;
use crate::strategy::{DonationSchedule, Strategy};
use crate::summary::Summary;
use crate::tracing::prelude::*;
use crate::worker::{plan_workers, WorkBoard, WorkerScheduler, SHARE_QUEUE_DEPTH};

/// How often per-thread hash counters are sampled.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// How often the status report is republished when no CC endpoint sets it.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the connection event queue.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Why a session ended.
enum SessionEnd {
    Shutdown,
    Restart,
    Reconfigure(Arc<Config>),
}

pub struct Miner {
    config: Arc<Config>,
    cpu: CpuInfo,
    executor: Arc<dyn HashExecutor>,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    status: watch::Sender<StatusReport>,
    shutdown: CancellationToken,
    started: Instant,
    paused: bool,
}

impl Miner {
    /// Build a miner for a validated `config`.
    ///
    /// Returns the miner, a [`Controller`] to steer it and a receiver for
    /// status reports. Nothing runs until [`Miner::run`] is awaited.
    pub fn new(
        config: Arc<Config>,
        cpu: CpuInfo,
        executor: Arc<dyn HashExecutor>,
        connector: Arc<dyn Connector>,
    ) -> (Self, Controller, watch::Receiver<StatusReport>) {
        let (controller, commands) = Controller::new();
        let (status, status_rx) = watch::channel(StatusReport::default());
        let miner = Self {
            config,
            cpu,
            executor,
            connector,
            commands,
            status,
            shutdown: CancellationToken::new(),
            started: Instant::now(),
            paused: false,
        };
        (miner, controller, status_rx)
    }

    /// Token that ends the run loop when cancelled, like a Shutdown command.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run sessions until shutdown.
    ///
    /// Returns an error only when a session cannot be started at all, e.g.
    /// no scratch memory could be allocated.
    pub async fn run(mut self) -> Result<()> {
        loop {
            match self.session().await? {
                SessionEnd::Shutdown => break,
                SessionEnd::Restart => info!("Restarting"),
                SessionEnd::Reconfigure(config) => {
                    info!("Applying new configuration");
                    self.config = config;
                }
            }
        }
        info!("Miner stopped");
        Ok(())
    }

    async fn session(&mut self) -> Result<SessionEnd> {
        let config = self.config.clone();

        let descriptors = config.pool_descriptors()?;
        let donation = config.donation_descriptor()?;
        let donation_id = donation.as_ref().map(|_| PoolId(descriptors.len()));
        let all_pools: Vec<_> = descriptors.iter().cloned().chain(donation).collect();

        // Workers first, so a memory failure aborts before anything connects.
        let memory = MemoryManager::new(
            config.memory.huge_pages,
            self.cpu.huge_pages.page_size,
        );
        let plans = plan_workers(&config, &self.cpu);
        let board = Arc::new(WorkBoard::new());
        if self.paused {
            board.pause();
        }
        let (shares_tx, shares_rx) = mpsc::channel(SHARE_QUEUE_DEPTH);
        let scheduler = WorkerScheduler::start(
            &plans,
            board.clone(),
            self.executor.clone(),
            &memory,
            shares_tx,
        )?;

        Summary {
            config: &config,
            cpu: &self.cpu,
            plans: &plans,
            pools: &descriptors,
            memory: memory.usage(),
        }
        .log();

        // Connections and the dispatcher share one cancellation scope.
        let running = self.shutdown.child_token();
        let tracker = TaskTracker::new();
        let settings = ConnectionSettings::from_network(&config.network);
        let dialect = dialect_for(&config.network);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let handles = all_pools
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, descriptor)| {
                PoolConnection::new(
                    PoolId(i),
                    descriptor,
                    settings.clone(),
                    dialect.clone(),
                    self.connector.clone(),
                    events_tx.clone(),
                    running.clone(),
                )
                .connect(&tracker)
            })
            .collect();
        drop(events_tx);

        let strategy = Strategy::new(
            config.network.prefer_primary,
            donation_id.map(|id| {
                let unit = Duration::from_secs(config.donation.unit_secs);
                (id, DonationSchedule::new(config.donate_level, unit, Instant::now()))
            }),
        );
        let (dispatcher, dispatch_status) = Dispatcher::new(
            handles,
            strategy,
            board.clone(),
            ShareResults::new(&config.health),
            events_rx,
            shares_rx,
            running.clone(),
        );
        tracker.spawn(dispatcher.run());
        tracker.close();

        let mut monitor = HashrateMonitor::new(scheduler.counters());
        monitor.sample();

        let mut sample = interval(SAMPLE_INTERVAL);
        sample.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut publish = interval(status_interval(&config));
        publish.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let print_time = Duration::from_secs(config.log.print_time_secs);
        let mut speed = interval(print_time.max(SAMPLE_INTERVAL));
        speed.set_missed_tick_behavior(MissedTickBehavior::Delay);
        speed.tick().await;

        let session = SessionView {
            descriptors: &all_pools,
            donation: donation_id.is_some(),
            memory: &memory,
            dispatch: &dispatch_status,
        };

        let end = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break SessionEnd::Shutdown,

                command = self.commands.recv() => match command {
                    Some(ControlCommand::Pause) => {
                        if !self.paused {
                            self.paused = true;
                            scheduler.pause();
                        }
                    }
                    Some(ControlCommand::Resume) => {
                        if self.paused {
                            self.paused = false;
                            scheduler.resume();
                        }
                    }
                    Some(ControlCommand::Restart) => break SessionEnd::Restart,
                    Some(ControlCommand::Reconfigure(config)) => {
                        break SessionEnd::Reconfigure(config)
                    }
                    Some(ControlCommand::Shutdown) | None => break SessionEnd::Shutdown,
                },

                _ = sample.tick() => monitor.sample(),

                _ = publish.tick() => self.publish_status(&monitor, &session),

                _ = speed.tick(), if !print_time.is_zero() => {
                    info!(
                        threads = monitor.threads(),
                        "speed 2.5s/60s/15m {} max {:.1} H/s",
                        monitor.windows(),
                        monitor.highest().as_hashes()
                    );
                }
            }
        };

        // Workers first: joining them releases their scratch buffers.
        debug!("Stopping workers");
        if let Err(e) = tokio::task::spawn_blocking(move || drop(scheduler)).await {
            error!(error = %e, "Worker shutdown failed");
        }

        debug!("Closing pool connections");
        running.cancel();
        tracker.wait().await;

        let usage = memory.usage();
        if usage.buffers > 0 {
            warn!(buffers = usage.buffers, "Scratch buffers still live after teardown");
        }

        Ok(end)
    }

    fn publish_status(&self, monitor: &HashrateMonitor, session: &SessionView<'_>) {
        let dispatch = session.dispatch.borrow().clone();
        let report = StatusReport::collect(
            self.started.elapsed().as_secs(),
            self.paused,
            monitor,
            &dispatch,
            session.descriptors,
            session.donation,
            session.memory.usage(),
        );
        self.status.send_replace(report);
    }
}

/// Status publication period: the CC endpoint's, never faster than sampling.
fn status_interval(config: &Config) -> Duration {
    config
        .cc
        .as_ref()
        .map_or(STATUS_INTERVAL, |cc| cc.update_interval())
        .max(SAMPLE_INTERVAL)
}

/// Borrowed session state the status report is built from.
struct SessionView<'a> {
    descriptors: &'a [PoolDescriptor],
    donation: bool,
    memory: &'a MemoryManager,
    dispatch: &'a watch::Receiver<DispatchStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const POOLS: &str = "[[pools]]\nurl = \"pool.example.com:3333\"\nuser = \"w\"\n";

    #[test]
    #[serial]
    fn status_follows_cc_update_interval() {
        let config = Config::from_toml_str(&format!(
            "{}[cc]\nurl = \"http://cc.example.com:3344\"\nupdate_interval_secs = 30\n",
            POOLS
        ))
        .unwrap();
        assert_eq!(status_interval(&config), Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn status_defaults_without_cc() {
        let config = Config::from_toml_str(POOLS).unwrap();
        assert_eq!(status_interval(&config), STATUS_INTERVAL);
    }
}
