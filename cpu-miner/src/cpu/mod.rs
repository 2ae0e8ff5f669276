//! Host CPU discovery and worker placement.

pub mod probe;
pub mod topology;

pub use probe::{CapabilityProbe, CpuInfo, HugePageInfo, SystemProbe};
pub use topology::{assign_cpus, pin_current_thread};
