//! Common types used across fleet messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Locally unique identifier of a graphics adapter.
///
/// Two devices created on the same physical GPU report the same LUID, which
/// is how the fleet decides between the same-adapter and cross-adapter
/// capture strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdapterLuid {
    pub low_part: u32,
    pub high_part: i32,
}

impl AdapterLuid {
    pub const fn new(low_part: u32, high_part: i32) -> Self {
        Self {
            low_part,
            high_part,
        }
    }

    /// Packs the LUID into a single integer.
    pub fn as_u64(self) -> u64 {
        ((self.high_part as u32 as u64) << 32) | self.low_part as u64
    }
}

impl fmt::Display for AdapterLuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.high_part as u32, self.low_part)
    }
}

/// A rectangle in virtual desktop coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl ScreenRect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Returns true if the point lies inside the rectangle (right/bottom exclusive).
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }
}

/// Display rotation as reported by the OS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Identity,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    /// Returns true if width and height are swapped between screen and device space.
    pub fn is_transposed(self) -> bool {
        matches!(self, Self::Rotate90 | Self::Rotate270)
    }
}

/// Metadata the mesh generator needs to place one monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorDescriptor {
    /// Position of the monitor in the enumeration order.
    pub index: usize,

    /// OS device name (e.g., `\\.\DISPLAY1`).
    pub name: String,

    /// Whether this is the primary display.
    pub is_primary: bool,

    /// Pixel rectangle in virtual desktop coordinates.
    pub screen_rect: ScreenRect,

    /// Display rotation.
    pub rotation: Rotation,

    /// Adapter the monitor is attached to.
    pub adapter: AdapterLuid,
}

impl MonitorDescriptor {
    /// Width of the duplicated desktop texture, which is unrotated.
    pub fn device_width(&self) -> u32 {
        let (w, h) = (self.screen_rect.width(), self.screen_rect.height());
        let w = if self.rotation.is_transposed() { h } else { w };
        w.max(0) as u32
    }

    /// Height of the duplicated desktop texture, which is unrotated.
    pub fn device_height(&self) -> u32 {
        let (w, h) = (self.screen_rect.width(), self.screen_rect.height());
        let h = if self.rotation.is_transposed() { w } else { h };
        h.max(0) as u32
    }
}

/// Fleet-wide capture metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetMetrics {
    /// Number of capture workers currently running.
    pub worker_count: usize,

    /// Duration of the most recent acquire pass in microseconds.
    pub last_acquire_us: u64,

    /// Longest acquire pass since the metrics were started.
    pub max_acquire_us: u64,

    /// Acquire passes that exceeded the slow-pass threshold.
    pub slow_passes: u64,

    /// Frames that reached a render texture.
    pub frames_delivered: u64,

    /// Times the whole fleet was torn down and rebuilt.
    pub rebuilds: u64,

    /// Seconds since the metrics were started.
    pub uptime_seconds: u64,
}

/// Types of performance warnings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WarningType {
    /// The per-frame acquire pass ate into the HMD frame budget.
    SlowAcquire { elapsed_us: u64 },

    /// A monitor's capture failed and the fleet will be rebuilt.
    CaptureFailed { monitor_index: usize },

    /// A worker produced frames faster than the host released them.
    RenderingFallingBehind { monitor_index: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luid_packing() {
        let luid = AdapterLuid::new(0x1234, 1);
        assert_eq!(luid.as_u64(), 0x1_0000_1234);
        assert_eq!(luid.to_string(), "00000001:00001234");
    }

    #[test]
    fn test_screen_rect_contains_is_half_open() {
        let rect = ScreenRect::new(1920, 0, 3840, 1080);
        assert!(rect.contains(1920, 0));
        assert!(!rect.contains(3840, 0));
        assert!(!rect.contains(1919, 500));
        assert_eq!(rect.width(), 1920);
    }

    #[test]
    fn test_device_size_follows_rotation() {
        let mut monitor = MonitorDescriptor {
            index: 0,
            name: "\\\\.\\DISPLAY2".into(),
            is_primary: false,
            screen_rect: ScreenRect::new(0, 0, 1080, 1920),
            rotation: Rotation::Rotate90,
            adapter: AdapterLuid::default(),
        };
        assert_eq!((monitor.device_width(), monitor.device_height()), (1920, 1080));

        monitor.rotation = Rotation::Identity;
        assert_eq!((monitor.device_width(), monitor.device_height()), (1080, 1920));
    }
}
