//! cpu-miner daemon.
//!
//! Usage: `cpu-minerd [CONFIG]`. The configuration path defaults to
//! `$CPUMINER_CONFIG`, then `cpu-miner.toml`. SIGINT and SIGTERM stop the
//! miner; SIGHUP reloads the configuration file and restarts with it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{self, SignalKind};

use cpu_miner::config::{Config, LogConfig};
use cpu_miner::cpu::{CapabilityProbe, SystemProbe};
use cpu_miner::hasher::Sha256dExecutor;
use cpu_miner::miner::Miner;
use cpu_miner::pool::TcpConnector;
use cpu_miner::tracing::{self, prelude::*};

const DEFAULT_CONFIG: &str = "cpu-miner.toml";

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("CPUMINER_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let path = config_path();
    let config = match Config::load_from(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::init_journald_or_stdout(&LogConfig::default());
            error!(path = %path.display(), error = %e, "Failed to load configuration");
            return Err(e).with_context(|| format!("loading {}", path.display()));
        }
    };
    tracing::init_journald_or_stdout(&config.log);

    let cpu = SystemProbe::default().probe();
    let (miner, controller, _status) = Miner::new(
        Arc::new(config),
        cpu,
        Arc::new(Sha256dExecutor),
        Arc::new(TcpConnector),
    );
    let shutdown = miner.shutdown_token();
    let run = miner.run();
    tokio::pin!(run);
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let mut sighup = unix::signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = sighup.recv() => {
                info!(path = %path.display(), "Reloading configuration");
                match Config::load_from(&path) {
                    Ok(config) => {
                        if let Err(e) = controller.reconfigure(config) {
                            error!(error = %e, "Configuration rejected");
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to reload configuration"),
                }
            }
            result = &mut run => {
                result?;
                info!("Exiting.");
                return Ok(());
            }
        }
    }

    trace!("Shutting down.");
    shutdown.cancel();
    run.await?;
    info!("Exiting.");
    Ok(())
}
