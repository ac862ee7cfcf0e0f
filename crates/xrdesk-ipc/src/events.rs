//! Events sent from the capture fleet to the rendering host.

use serde::{Deserialize, Serialize};

use crate::types::{FleetMetrics, MonitorDescriptor, WarningType};

/// Events that the fleet can send to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FleetEvent {
    /// The fleet was torn down and recreated for a new monitor layout.
    FleetRebuilt {
        /// Monitors now being captured, in worker order.
        monitors: Vec<MonitorDescriptor>,
    },

    /// A worker hit an unrecoverable capture failure.
    WorkerFailed {
        /// Index of the failed monitor.
        monitor_index: usize,
    },

    /// Performance warning detected.
    PerformanceWarning(WarningType),

    /// Periodic fleet metrics.
    Metrics(FleetMetrics),

    /// Monitor enumeration failed; the fleet is empty until the next change.
    EnumerationFailed {
        /// Error message.
        message: String,
    },

    /// The fleet has shut down.
    Shutdown,
}
