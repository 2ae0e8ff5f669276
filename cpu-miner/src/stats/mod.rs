//! Hashrate and share result accounting.

mod hashrate;
mod results;

pub use hashrate::{HashrateMonitor, HashrateWindows, LONG_WINDOW, MEDIUM_WINDOW, SHORT_WINDOW};
pub use results::{ResultsSnapshot, ShareResults};
