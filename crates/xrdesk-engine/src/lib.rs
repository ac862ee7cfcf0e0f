//! Fleet coordination for xrdesk.
//!
//! The [`MonitorFleetCoordinator`] owns one capture worker per monitor,
//! rebuilds the fleet when the monitor layout changes or a worker fails,
//! and drives every worker once per HMD frame.

mod error;
mod fleet;
mod metrics;
mod platform;
mod signal;
mod watcher;

pub use error::{EngineError, EngineResult};
pub use fleet::{MonitorFleetCoordinator, MonitorView};
pub use metrics::FleetMetricsCollector;
pub use platform::CapturePlatform;
pub use signal::MonitorChangeSignal;

#[cfg(windows)]
pub use platform::DxgiPlatform;
#[cfg(windows)]
pub use watcher::MonitorChangeWatcher;
