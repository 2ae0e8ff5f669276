//! CPU proof-of-work mining agent.
//!
//! Workers hash on dedicated OS threads; pool connections, the dispatcher
//! and control run on a single-threaded tokio runtime. The two sides meet at
//! the [`worker::WorkBoard`] (current job, published by the dispatcher) and
//! the share queue (found shares, drained by the dispatcher).

pub mod algo;
pub mod config;
pub mod control;
pub mod cpu;
pub mod dispatch;
pub mod error;
pub mod hasher;
pub mod memory;
pub mod miner;
pub mod pool;
pub mod stats;
pub mod status;
pub mod strategy;
pub mod summary;
pub mod tracing;
pub mod types;
pub mod worker;
