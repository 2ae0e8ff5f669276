//! Core value types shared across the miner.

mod hash_rate;

pub use hash_rate::HashRate;
