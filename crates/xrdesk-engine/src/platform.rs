//! Where the fleet gets its monitors from.

use xrdesk_capture::{CaptureTarget, DesktopSource, GpuDevice};

use crate::EngineResult;

/// Enumerates the monitors to capture.
pub trait CapturePlatform {
    type Device: GpuDevice;
    type Source: DesktopSource<Self::Device>;

    /// Lists every monitor attached to the desktop, in index order.
    fn enumerate(&mut self) -> EngineResult<Vec<CaptureTarget<Self::Device, Self::Source>>>;
}

/// DXGI outputs duplicated through Direct3D 11.
#[cfg(windows)]
#[derive(Debug, Default)]
pub struct DxgiPlatform;

#[cfg(windows)]
impl CapturePlatform for DxgiPlatform {
    type Device = xrdesk_capture::d3d11::D3D11Device;
    type Source = xrdesk_capture::d3d11::DxgiDuplication;

    fn enumerate(&mut self) -> EngineResult<Vec<CaptureTarget<Self::Device, Self::Source>>> {
        let monitors = xrdesk_capture::d3d11::enumerate_monitors()?;
        Ok(monitors
            .into_iter()
            .map(xrdesk_capture::d3d11::MonitorOutput::into_target)
            .collect())
    }
}
