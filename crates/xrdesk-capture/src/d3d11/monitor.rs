//! Monitor enumeration through DXGI.

use tracing::{debug, instrument, warn};
use windows::core::Interface;
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_MODE_ROTATION, DXGI_MODE_ROTATION_ROTATE180, DXGI_MODE_ROTATION_ROTATE270,
    DXGI_MODE_ROTATION_ROTATE90,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, IDXGIAdapter1, IDXGIFactory1, IDXGIOutput1, DXGI_ERROR_NOT_FOUND,
};
use windows::Win32::Graphics::Gdi::{GetMonitorInfoW, MONITORINFO, MONITORINFOF_PRIMARY};
use xrdesk_ipc::{AdapterLuid, MonitorDescriptor, Rotation, ScreenRect};

use super::device::D3D11Device;
use super::duplication::DxgiDuplication;
use crate::worker::CaptureTarget;
use crate::{CaptureError, CaptureResult};

/// One desktop-attached output with a device on its adapter.
pub struct MonitorOutput {
    pub descriptor: MonitorDescriptor,

    /// `HMONITOR` of the output.
    pub handle: isize,
    pub output: IDXGIOutput1,
    pub device: D3D11Device,
}

impl MonitorOutput {
    /// Turns the output into a capture target.
    pub fn into_target(self) -> CaptureTarget<D3D11Device, DxgiDuplication> {
        CaptureTarget {
            descriptor: self.descriptor,
            device: self.device,
            source: DxgiDuplication::new(self.output),
        }
    }
}

fn rotation(value: DXGI_MODE_ROTATION) -> Rotation {
    match value {
        DXGI_MODE_ROTATION_ROTATE90 => Rotation::Rotate90,
        DXGI_MODE_ROTATION_ROTATE180 => Rotation::Rotate180,
        DXGI_MODE_ROTATION_ROTATE270 => Rotation::Rotate270,
        _ => Rotation::Identity,
    }
}

fn utf16_name(raw: &[u16]) -> String {
    let len = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf16_lossy(&raw[..len])
}

fn adapters(factory: &IDXGIFactory1) -> CaptureResult<Vec<IDXGIAdapter1>> {
    let mut adapters = Vec::new();
    for i in 0.. {
        match unsafe { factory.EnumAdapters1(i) } {
            Ok(adapter) => adapters.push(adapter),
            Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(adapters)
}

fn adapter_luid(adapter: &IDXGIAdapter1) -> CaptureResult<AdapterLuid> {
    let desc = unsafe { adapter.GetDesc1() }?;
    Ok(AdapterLuid::new(desc.AdapterLuid.LowPart, desc.AdapterLuid.HighPart))
}

/// Enumerates every output attached to the desktop, across all adapters.
///
/// One D3D11 device is created per adapter that drives at least one output.
/// Adapters whose device cannot be created are skipped with a warning.
#[instrument(name = "enumerate_monitors")]
pub fn enumerate_monitors() -> CaptureResult<Vec<MonitorOutput>> {
    let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1() }?;
    let mut monitors = Vec::new();

    for adapter in adapters(&factory)? {
        let luid = adapter_luid(&adapter)?;
        let mut device: Option<D3D11Device> = None;

        for j in 0.. {
            let output = match unsafe { adapter.EnumOutputs(j) } {
                Ok(output) => output,
                Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
                Err(e) => return Err(e.into()),
            };
            let desc = unsafe { output.GetDesc() }?;
            if !desc.AttachedToDesktop.as_bool() {
                continue;
            }

            if device.is_none() {
                match D3D11Device::new(&adapter, luid) {
                    Ok(created) => device = Some(created),
                    Err(e) => {
                        warn!(adapter = %luid, error = %e, "Skipping adapter without a D3D11 device");
                        break;
                    }
                }
            }
            let Some(device) = device.clone() else {
                break;
            };

            let mut info = MONITORINFO {
                cbSize: std::mem::size_of::<MONITORINFO>() as u32,
                ..Default::default()
            };
            let is_primary = unsafe { GetMonitorInfoW(desc.Monitor, &mut info) }.as_bool()
                && info.dwFlags & MONITORINFOF_PRIMARY != 0;

            let r = desc.DesktopCoordinates;
            let descriptor = MonitorDescriptor {
                index: monitors.len(),
                name: utf16_name(&desc.DeviceName),
                is_primary,
                screen_rect: ScreenRect::new(r.left, r.top, r.right, r.bottom),
                rotation: rotation(desc.Rotation),
                adapter: luid,
            };
            debug!(
                index = descriptor.index,
                name = %descriptor.name,
                adapter = %luid,
                "Found monitor"
            );

            monitors.push(MonitorOutput {
                descriptor,
                handle: desc.Monitor.0 as isize,
                output: output.cast()?,
                device,
            });
        }
    }

    debug!(count = monitors.len(), "Enumerated monitors");
    Ok(monitors)
}

/// Creates a device on the adapter with `luid`, for the HMD.
#[instrument(name = "create_device_for_adapter")]
pub fn create_device_for_adapter(luid: AdapterLuid) -> CaptureResult<D3D11Device> {
    let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1() }?;
    for adapter in adapters(&factory)? {
        if adapter_luid(&adapter)? == luid {
            return D3D11Device::new(&adapter, luid);
        }
    }
    Err(CaptureError::MonitorNotFound(format!("no adapter with LUID {luid}")))
}

/// Creates a device on the first adapter, for hosts that do not know the HMD adapter.
pub fn create_default_device() -> CaptureResult<D3D11Device> {
    let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1() }?;
    let adapter = adapters(&factory)?
        .into_iter()
        .next()
        .ok_or_else(|| CaptureError::MonitorNotFound("no DXGI adapter".into()))?;
    let luid = adapter_luid(&adapter)?;
    D3D11Device::new(&adapter, luid)
}
