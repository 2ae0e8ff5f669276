//! Pool connection state machine.
//!
//! A [`PoolConnection`] owns one network transport at a time and drives it
//! through connect, subscribe, authorize and the steady-state message loop.
//! Failures of any kind end the session; the connection then waits out its
//! backoff and starts over. Everything else in the process talks to it
//! through a cloneable [`PoolHandle`].

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::backoff::{Backoff, CREDENTIAL_FAILURE_WEIGHT};
use super::descriptor::PoolDescriptor;
use super::dialect::{Dialect, JobParams, Notification, Request, Session, SubmitReply};
use super::job::{Job, Share};
use super::messages::JsonRpcMessage;
use super::transport::{Connector, Transport};
use super::{ConnectionState, DiscardReason, PoolEvent, PoolEventKind, PoolId, SubmitOutcome};
use crate::config::{NetworkConfig, StaleSharePolicy};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Timing and policy knobs for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub keepalive_interval: Duration,
    pub retry_min: Duration,
    pub retry_max: Duration,
    pub max_failures: u32,
    pub stale_shares: StaleSharePolicy,
    pub user_agent: String,
}

impl ConnectionSettings {
    pub fn from_network(network: &NetworkConfig) -> Self {
        Self {
            connect_timeout: network.connect_timeout(),
            response_timeout: network.response_timeout(),
            keepalive_interval: network.keepalive_interval(),
            retry_min: network.retry_min(),
            retry_max: network.retry_max(),
            max_failures: network.max_failures,
            stale_shares: network.stale_shares,
            user_agent: network.user_agent.clone(),
        }
    }
}

enum Command {
    Submit {
        share: Share,
        reply: oneshot::Sender<SubmitOutcome>,
    },
}

/// Cloneable view of a running connection.
#[derive(Clone)]
pub struct PoolHandle {
    id: PoolId,
    descriptor: Arc<PoolDescriptor>,
    commands: mpsc::UnboundedSender<Command>,
    job: Arc<ArcSwapOption<Job>>,
    state: watch::Receiver<ConnectionState>,
}

impl PoolHandle {
    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn descriptor(&self) -> &PoolDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch for state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Latest job, or `None` while the connection is not Ready.
    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.job.load_full()
    }

    /// Queue a share for submission.
    ///
    /// Never waits. The returned receiver resolves once the pool answers,
    /// the response times out, or the share is discarded. Shares offered
    /// while the connection is not Ready are discarded immediately.
    pub fn submit_share(&self, share: Share) -> oneshot::Receiver<SubmitOutcome> {
        let (reply, rx) = oneshot::channel();

        if !self.state().is_ready() {
            let _ = reply.send(SubmitOutcome::Discarded(DiscardReason::NotReady));
            return rx;
        }

        if let Err(mpsc::error::SendError(Command::Submit { reply, .. })) =
            self.commands.send(Command::Submit { share, reply })
        {
            let _ = reply.send(SubmitOutcome::Discarded(DiscardReason::Closed));
        }
        rx
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("id", &self.id)
            .field("pool", &self.descriptor.to_string())
            .field("state", &self.state())
            .finish()
    }
}

struct PendingShare {
    job_id: String,
    nonce: u32,
    difficulty: u64,
    deadline: Instant,
    reply: oneshot::Sender<SubmitOutcome>,
}

/// One upstream pool connection.
pub struct PoolConnection {
    id: PoolId,
    descriptor: Arc<PoolDescriptor>,
    settings: ConnectionSettings,
    dialect: Arc<dyn Dialect>,
    connector: Arc<dyn Connector>,
    events: mpsc::Sender<PoolEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    job: Arc<ArcSwapOption<Job>>,
    state: watch::Sender<ConnectionState>,
    handle: PoolHandle,
    shutdown: CancellationToken,
    backoff: Backoff,
    pending: HashMap<u64, PendingShare>,
    next_id: u64,
    seq: u64,
}

impl PoolConnection {
    pub fn new(
        id: PoolId,
        descriptor: PoolDescriptor,
        settings: ConnectionSettings,
        dialect: Arc<dyn Dialect>,
        connector: Arc<dyn Connector>,
        events: mpsc::Sender<PoolEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let descriptor = Arc::new(descriptor);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let job = Arc::new(ArcSwapOption::empty());

        let handle = PoolHandle {
            id,
            descriptor: descriptor.clone(),
            commands: commands_tx,
            job: job.clone(),
            state: state_rx,
        };

        Self {
            id,
            descriptor,
            backoff: Backoff::new(settings.retry_min, settings.retry_max),
            settings,
            dialect,
            connector,
            events,
            commands,
            job,
            state,
            handle,
            shutdown,
            pending: HashMap::new(),
            next_id: 1,
            seq: 0,
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Start the state machine on `tracker` and return immediately.
    pub fn connect(self, tracker: &TaskTracker) -> PoolHandle {
        let handle = self.handle();
        tracker.spawn(self.run());
        handle
    }

    /// Run sessions until shutdown.
    pub async fn run(mut self) {
        let shutdown = self.shutdown.clone();

        loop {
            let result = tokio::select! {
                result = self.session() => result,
                _ = shutdown.cancelled() => break,
            };
            let err = match result {
                Ok(never) => match never {},
                Err(e) => e,
            };

            self.end_session();

            let weight = if err.is_credential() {
                error!(pool = %self.descriptor, error = %err, "Pool rejected credentials");
                CREDENTIAL_FAILURE_WEIGHT
            } else {
                warn!(pool = %self.descriptor, error = %err, "Pool connection lost");
                1
            };

            let mut delay = self.backoff.record_failure(weight);
            if self.backoff.failures() >= self.settings.max_failures {
                delay = self.backoff.ceiling();
                if self.current_state() != ConnectionState::Failed {
                    warn!(
                        pool = %self.descriptor,
                        failures = self.backoff.failures(),
                        "Pool marked failed"
                    );
                }
                self.set_state(ConnectionState::Failed).await;
            } else {
                self.set_state(ConnectionState::Reconnecting).await;
            }

            debug!(
                pool = %self.descriptor,
                delay_ms = delay.as_millis() as u64,
                "Waiting before reconnect"
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.end_session();
        // No event: the strategy is shutting down too.
        self.state.send_replace(ConnectionState::Disconnected);
        debug!(pool = %self.descriptor, "Connection closed");
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn emit(&self, kind: PoolEventKind) {
        self.events.send(PoolEvent::new(self.id, kind)).await.ok();
    }

    async fn set_state(&mut self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(pool = %self.descriptor, from = %previous, to = %state, "State changed");
            self.emit(PoolEventKind::StateChanged(state)).await;
        }
    }

    /// Drop per-session state: the job, unanswered submissions and any
    /// shares queued while the session was going down.
    fn end_session(&mut self) {
        self.job.store(None);

        for (_, pending) in self.pending.drain() {
            let _ = pending
                .reply
                .send(SubmitOutcome::Discarded(DiscardReason::Closed));
        }

        while let Ok(Command::Submit { reply, .. }) = self.commands.try_recv() {
            let _ = reply.send(SubmitOutcome::Discarded(DiscardReason::NotReady));
        }
    }

    async fn session(&mut self) -> Result<Infallible> {
        self.set_state(ConnectionState::Connecting).await;

        let mut transport = timeout(
            self.settings.connect_timeout,
            self.connector.connect(&self.descriptor),
        )
        .await
        .map_err(|_| Error::Timeout("connect"))??;
        let transport = transport.as_mut();

        // Jobs pushed before authorization are held until it succeeds.
        let mut early_job = None;

        if let Some(request) = self.dialect.subscribe(&self.settings.user_agent) {
            self.set_state(ConnectionState::Subscribing).await;
            let (result, error) = self
                .request(transport, request, "subscribe", &mut early_job)
                .await?;
            self.dialect
                .parse_subscribe(result.as_ref(), error.as_ref())?;
        }

        self.set_state(ConnectionState::Authorizing).await;
        let request = self
            .dialect
            .authorize(&self.descriptor, &self.settings.user_agent);
        let (result, error) = self
            .request(transport, request, "authorize", &mut early_job)
            .await?;
        let authorized =
            self.dialect
                .parse_authorize(&self.descriptor, result.as_ref(), error.as_ref())?;

        info!(
            pool = %self.descriptor,
            user = %self.descriptor.user,
            dialect = self.dialect.name(),
            "Logged in"
        );

        if let Some(job) = authorized.job.or(early_job) {
            self.accept_job(job).await?;
        }

        self.serve(transport, authorized.session).await
    }

    /// Send a setup request and wait for its response. Jobs notified in
    /// between land in `early_job`, newest winning.
    async fn request(
        &mut self,
        transport: &mut dyn Transport,
        request: Request,
        step: &'static str,
        early_job: &mut Option<JobParams>,
    ) -> Result<(Option<Value>, Option<Value>)> {
        let id = self.next_id();
        transport
            .write_message(&JsonRpcMessage::request(id, request.method, request.params))
            .await?;

        timeout(
            self.settings.response_timeout,
            self.read_reply(transport, id, early_job),
        )
            .await
            .map_err(|_| Error::Timeout(step))?
    }

    async fn read_reply(
        &mut self,
        transport: &mut dyn Transport,
        id: u64,
        early_job: &mut Option<JobParams>,
    ) -> Result<(Option<Value>, Option<Value>)> {
        loop {
            match transport.read_message().await?.ok_or(Error::Disconnected)? {
                JsonRpcMessage::Response {
                    id: resp_id,
                    result,
                    error,
                } if resp_id == id => return Ok((result, error)),
                JsonRpcMessage::Response { id: other_id, .. } => {
                    warn!(msg_id = other_id, "Received response for different request");
                }
                JsonRpcMessage::Request {
                    id: None,
                    method,
                    params,
                } => match self.dialect.parse_notification(&method, &params)? {
                    Notification::Job(job) => {
                        debug!(pool = %self.descriptor, job_id = %job.job_id, "Job before login");
                        *early_job = Some(job);
                    }
                    Notification::Reconnect => {
                        return Err(Error::Transport("pool requested reconnect".to_string()))
                    }
                    Notification::Unknown => {
                        warn!(pool = %self.descriptor, method = %method, "Unknown notification method");
                    }
                },
                JsonRpcMessage::Request {
                    id: Some(_),
                    method,
                    ..
                } => {
                    warn!(method = %method, "Server sent request during setup");
                }
            }
        }
    }

    async fn handle_notification(&mut self, method: &str, params: &Value) -> Result<()> {
        match self.dialect.parse_notification(method, params)? {
            Notification::Job(job) => self.accept_job(job).await,
            Notification::Reconnect => {
                Err(Error::Transport("pool requested reconnect".to_string()))
            }
            Notification::Unknown => {
                warn!(pool = %self.descriptor, method = %method, "Unknown notification method");
                Ok(())
            }
        }
    }

    /// Install a new current job. The first job of a session makes the
    /// connection Ready.
    async fn accept_job(&mut self, params: JobParams) -> Result<()> {
        let job = Job::from_hex(
            &params.job_id,
            &params.blob,
            &params.target,
            self.descriptor.algo,
            self.id,
            self.seq + 1,
            self.descriptor.nicehash,
        )?;
        self.seq += 1;

        debug!(
            pool = %self.descriptor,
            job_id = %job.id,
            difficulty = job.difficulty(),
            "New job"
        );

        let job = Arc::new(job);
        self.job.store(Some(job.clone()));
        self.emit(PoolEventKind::NewJob(job)).await;

        if !self.current_state().is_ready() {
            self.backoff.reset();
            self.set_state(ConnectionState::Ready).await;
            info!(pool = %self.descriptor, "Pool ready");
        }
        Ok(())
    }

    /// Steady-state loop: notifications, submissions, response deadlines
    /// and keep-alive.
    async fn serve(
        &mut self,
        transport: &mut dyn Transport,
        session: Session,
    ) -> Result<Infallible> {
        let keepalive = if self.descriptor.keepalive {
            self.dialect.keepalive(&session)
        } else {
            None
        };
        let first_job_deadline = Instant::now() + self.settings.response_timeout;
        let mut keepalive_pending: Option<(u64, Instant)> = None;
        let mut last_send = Instant::now();

        loop {
            let keepalive_due = match (&keepalive, keepalive_pending) {
                (Some(_), None) => Some(last_send + self.settings.keepalive_interval),
                _ => None,
            };
            let first_job = (!self.current_state().is_ready()).then_some(first_job_deadline);
            let deadline = self
                .pending
                .values()
                .map(|p| p.deadline)
                .chain(keepalive_pending.map(|(_, at)| at))
                .chain(keepalive_due)
                .chain(first_job)
                .min()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                msg = transport.read_message() => {
                    match msg?.ok_or(Error::Disconnected)? {
                        JsonRpcMessage::Response { id, result, error } => {
                            if let Some(pending) = self.pending.remove(&id) {
                                let outcome = match self.dialect.parse_submit(result.as_ref(), error.as_ref()) {
                                    SubmitReply::Accepted => SubmitOutcome::Accepted,
                                    SubmitReply::Rejected(reason) => SubmitOutcome::Rejected(reason),
                                };
                                self.finish_share(pending, outcome).await;
                            } else if keepalive_pending.map(|(k, _)| k) == Some(id) {
                                trace!(pool = %self.descriptor, "Keep-alive answered");
                                keepalive_pending = None;
                            } else {
                                debug!(msg_id = id, "Received unexpected response");
                            }
                        }
                        JsonRpcMessage::Request { id: None, method, params } => {
                            self.handle_notification(&method, &params).await?;
                        }
                        JsonRpcMessage::Request { id: Some(_), method, .. } => {
                            warn!(method = %method, "Server sent request (not notification)");
                        }
                    }
                }

                Some(Command::Submit { share, reply }) = self.commands.recv() => {
                    if self.submit(transport, &session, share, reply).await? {
                        last_send = Instant::now();
                    }
                }

                _ = sleep_until(deadline) => {
                    let now = Instant::now();
                    self.expire_pending(now).await;

                    if matches!(keepalive_pending, Some((_, at)) if at <= now) {
                        return Err(Error::Timeout("keep-alive reply"));
                    }
                    if first_job.is_some_and(|at| at <= now) {
                        return Err(Error::Timeout("first job"));
                    }
                    if let (Some(request), Some(due)) = (&keepalive, keepalive_due) {
                        if due <= now {
                            let id = self.next_id();
                            trace!(pool = %self.descriptor, "Sending keep-alive");
                            transport
                                .write_message(&JsonRpcMessage::request(
                                    id,
                                    request.method.clone(),
                                    request.params.clone(),
                                ))
                                .await?;
                            last_send = now;
                            keepalive_pending = Some((id, now + self.settings.response_timeout));
                        }
                    }
                }
            }
        }
    }

    /// Write a share submission. Returns whether anything was sent.
    async fn submit(
        &mut self,
        transport: &mut dyn Transport,
        session: &Session,
        share: Share,
        reply: oneshot::Sender<SubmitOutcome>,
    ) -> Result<bool> {
        if !self.current_state().is_ready() {
            let _ = reply.send(SubmitOutcome::Discarded(DiscardReason::NotReady));
            return Ok(false);
        }

        let stale = self
            .job
            .load()
            .as_ref()
            .map_or(true, |current| current.seq != share.job.seq);

        if stale && self.settings.stale_shares == StaleSharePolicy::Drop {
            debug!(
                pool = %self.descriptor,
                job_id = %share.job.id,
                nonce = %share.nonce_hex(),
                "Dropping stale share"
            );
            let outcome = SubmitOutcome::Discarded(DiscardReason::Stale);
            let _ = reply.send(outcome.clone());
            self.emit(PoolEventKind::ShareResult {
                job_id: share.job.id.clone(),
                nonce: share.nonce,
                difficulty: share.job.difficulty(),
                outcome,
            })
            .await;
            return Ok(false);
        }

        let id = self.next_id();
        let request = self.dialect.submit(session, &share, stale);
        transport
            .write_message(&JsonRpcMessage::request(id, request.method, request.params))
            .await?;

        debug!(
            pool = %self.descriptor,
            job_id = %share.job.id,
            nonce = %share.nonce_hex(),
            stale,
            "Submitted share"
        );

        self.pending.insert(
            id,
            PendingShare {
                job_id: share.job.id.clone(),
                nonce: share.nonce,
                difficulty: share.job.difficulty(),
                deadline: Instant::now() + self.settings.response_timeout,
                reply,
            },
        );
        Ok(true)
    }

    async fn expire_pending(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                self.finish_share(pending, SubmitOutcome::TimedOut).await;
            }
        }
    }

    async fn finish_share(&mut self, pending: PendingShare, outcome: SubmitOutcome) {
        match &outcome {
            SubmitOutcome::Accepted => {
                info!(
                    pool = %self.descriptor,
                    job_id = %pending.job_id,
                    difficulty = pending.difficulty,
                    "Share accepted"
                );
            }
            SubmitOutcome::Rejected(reason) => {
                warn!(
                    pool = %self.descriptor,
                    job_id = %pending.job_id,
                    reason = %reason,
                    "Share rejected"
                );
            }
            SubmitOutcome::TimedOut => {
                warn!(pool = %self.descriptor, job_id = %pending.job_id, "Share response timed out");
            }
            SubmitOutcome::Discarded(_) => {}
        }

        let _ = pending.reply.send(outcome.clone());
        self.emit(PoolEventKind::ShareResult {
            job_id: pending.job_id,
            nonce: pending.nonce,
            difficulty: pending.difficulty,
            outcome,
        })
        .await;
    }
}
