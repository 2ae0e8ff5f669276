//! Run-time control of a mining session.
//!
//! Anything that wants to steer the miner (signal handlers, a
//! command-and-control client, tests) holds a cloneable [`Controller`] and
//! sends [`ControlCommand`]s; the miner's run loop is the single consumer.

use std::sync::Arc;

use strum::Display;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Display)]
pub enum ControlCommand {
    /// Stop hashing; threads, scratch and pool connections stay up
    Pause,
    /// Continue hashing on the then-current job
    Resume,
    /// Tear down connections and workers and rebuild them from the same
    /// configuration
    Restart,
    /// Tear down and rebuild from a new configuration
    Reconfigure(Arc<Config>),
    /// Stop everything and return from the run loop
    Shutdown,
}

/// Sends control commands to a running miner.
#[derive(Debug, Clone)]
pub struct Controller {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl Controller {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControlCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, command: ControlCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::ChannelClosed("miner control"))
    }

    pub fn pause(&self) -> Result<()> {
        self.send(ControlCommand::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(ControlCommand::Resume)
    }

    pub fn restart(&self) -> Result<()> {
        self.send(ControlCommand::Restart)
    }

    /// Validates `config` before handing it over, so a bad configuration is
    /// reported to the caller instead of stopping a running miner.
    pub fn reconfigure(&self, config: Config) -> Result<()> {
        config.validate()?;
        self.send(ControlCommand::Reconfigure(Arc::new(config)))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(ControlCommand::Shutdown)
    }
}
