//! Typed fleet<->host messages for xrdesk.
//!
//! This crate defines the metadata, configuration and event types shared
//! between the capture fleet and the VR rendering host.

mod config;
mod events;
mod state;
mod types;

pub use config::{CaptureConfig, ConfigError};
pub use events::FleetEvent;
pub use state::CaptureState;
pub use types::{AdapterLuid, FleetMetrics, MonitorDescriptor, Rotation, ScreenRect, WarningType};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for events (Fleet → Host).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<FleetEvent>, Receiver<FleetEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
