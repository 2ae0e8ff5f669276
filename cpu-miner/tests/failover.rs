//! End-to-end sessions against fake pools on localhost.
//!
//! The primary pool's address has nothing listening; the backup is a small
//! scripted responder speaking the login dialect. The miner must fail over
//! to the backup, hash its job and get shares accepted.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

use cpu_miner::config::Config;
use cpu_miner::cpu::{CapabilityProbe, SystemProbe};
use cpu_miner::hasher::Sha256dExecutor;
use cpu_miner::miner::Miner;
use cpu_miner::pool::{TcpConnector, NONCE_OFFSET};
use cpu_miner::status::StatusReport;

const WAIT: Duration = Duration::from_secs(20);

/// 64-bit target of 2^50: roughly one share per 16k hashes.
const TARGET: &str = "0000000000000400";

#[derive(Default)]
struct PoolCounters {
    logins: AtomicUsize,
    submits: AtomicUsize,
}

/// An address nothing listens on.
async fn unreachable_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn scripted_pool() -> (SocketAddr, Arc<PoolCounters>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counters = Arc::new(PoolCounters::default());

    let shared = counters.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, shared.clone()));
        }
    });
    (addr, counters)
}

async fn serve(stream: TcpStream, counters: Arc<PoolCounters>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let request: Value = serde_json::from_str(&line).unwrap();
        let id = request["id"].clone();
        let result = match request["method"].as_str() {
            Some("login") => {
                counters.logins.fetch_add(1, Ordering::SeqCst);
                json!({
                    "id": "session-1",
                    "status": "OK",
                    "job": {
                        "job_id": "job-1",
                        "blob": hex::encode(vec![0u8; NONCE_OFFSET + 37]),
                        "target": TARGET,
                    },
                })
            }
            Some("submit") => {
                assert_eq!(request["params"]["id"], "session-1");
                assert_eq!(request["params"]["job_id"], "job-1");
                counters.submits.fetch_add(1, Ordering::SeqCst);
                json!({"status": "OK"})
            }
            Some("keepalived") => json!({"status": "KEEPALIVED"}),
            other => panic!("unexpected method {:?}", other),
        };

        let reply = json!({"id": id, "jsonrpc": "2.0", "result": result});
        let mut text = reply.to_string();
        text.push('\n');
        if write.write_all(text.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn config(primary: SocketAddr, backup: SocketAddr) -> Config {
    Config::from_toml_str(&format!(
        r#"
        algo = "cryptonight-lite"
        donate_level = 0

        [[pools]]
        url = "{primary}"
        user = "wallet"

        [[pools]]
        url = "{backup}"
        user = "wallet"

        [threads]
        count = 1

        [memory]
        huge_pages = false

        [network]
        retry_min_ms = 100
        retry_max_ms = 500
        max_failures = 1000
        connect_timeout_ms = 1000
        response_timeout_ms = 5000

        [log]
        print_time_secs = 0
        "#
    ))
    .unwrap()
}

fn start(config: Config) -> (Miner, cpu_miner::control::Controller, watch::Receiver<StatusReport>) {
    Miner::new(
        Arc::new(config),
        SystemProbe::default().probe(),
        Arc::new(Sha256dExecutor),
        Arc::new(TcpConnector),
    )
}

#[tokio::test]
async fn fails_over_to_backup_and_gets_shares_accepted() {
    let primary = unreachable_address().await;
    let (backup, pool) = scripted_pool().await;
    let (miner, controller, mut status) = start(config(primary, backup));
    let run = tokio::spawn(miner.run());

    let backup_url = backup.to_string();
    let report = timeout(
        WAIT,
        status.wait_for(|s| {
            s.active_pool.as_deref() == Some(backup_url.as_str()) && s.results.accepted > 0
        }),
    )
    .await
    .expect("no accepted share from the backup pool")
    .unwrap()
    .clone();

    assert_eq!(report.pools.len(), 2);
    assert_ne!(report.pools[0].state, "Ready");
    assert!(!report.pools[0].active);
    assert_eq!(report.pools[1].state, "Ready");
    assert!(report.pools[1].active);
    assert!(report.healthy);
    assert_eq!(report.memory.buffers, 1);
    assert!(pool.submits.load(Ordering::SeqCst) > 0);

    controller.shutdown().unwrap();
    timeout(WAIT, run).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn restart_logs_in_again() {
    let primary = unreachable_address().await;
    let (backup, pool) = scripted_pool().await;
    let (miner, controller, mut status) = start(config(primary, backup));
    let run = tokio::spawn(miner.run());

    timeout(WAIT, status.wait_for(|s| s.active_pool.is_some()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pool.logins.load(Ordering::SeqCst), 1);

    controller.restart().unwrap();
    timeout(WAIT, async {
        while pool.logins.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("no second login after restart");

    controller.pause().unwrap();
    timeout(WAIT, status.wait_for(|s| s.paused)).await.unwrap().unwrap();

    controller.shutdown().unwrap();
    timeout(WAIT, run).await.unwrap().unwrap().unwrap();
}
