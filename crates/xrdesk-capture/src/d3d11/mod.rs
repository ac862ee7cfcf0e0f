//! Direct3D 11 and DXGI backend.

mod device;
mod duplication;
mod monitor;

pub use device::{D3D11Device, D3D11Texture, DxgiKeyedMutex, SharedHandle};
pub use duplication::DxgiDuplication;
pub use monitor::{create_default_device, create_device_for_adapter, enumerate_monitors, MonitorOutput};
