//! Direct3D 11 implementation of [`GpuDevice`].

use std::time::Duration;

use tracing::{debug, instrument, warn};
use windows::core::{Interface, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, HMODULE};
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_UNKNOWN;
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11Device1, ID3D11DeviceContext, ID3D11Texture2D,
    D3D11_BIND_RENDER_TARGET, D3D11_BIND_SHADER_RESOURCE, D3D11_BOX, D3D11_CPU_ACCESS_READ,
    D3D11_CPU_ACCESS_WRITE, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAPPED_SUBRESOURCE,
    D3D11_MAP_READ, D3D11_MAP_WRITE, D3D11_RESOURCE_MISC_GENERATE_MIPS,
    D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX, D3D11_RESOURCE_MISC_SHARED_NTHANDLE,
    D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    IDXGIAdapter1, IDXGIKeyedMutex, IDXGIResource1, DXGI_SHARED_RESOURCE_READ,
    DXGI_SHARED_RESOURCE_WRITE,
};
use xrdesk_ipc::AdapterLuid;

use crate::gpu::{
    GpuDevice, KeyedMutex, MapMode, MappedSurface, PixelFormat, SharedTexture, TextureDesc,
    TextureUsage,
};
use crate::rect::Rect;
use crate::{CaptureError, CaptureResult};

/// HRESULT `WAIT_TIMEOUT`; a success code, so `windows::core::Result` hides it.
const WAIT_TIMEOUT_HRESULT: i32 = 0x102;

/// A D3D11 device and its immediate context.
///
/// The immediate context is not thread-safe. Each device is used from one
/// thread at a time: capture devices by their capture thread, the HMD
/// device by the render thread.
#[derive(Clone)]
pub struct D3D11Device {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    luid: AdapterLuid,
}

// SAFETY: see the type docs; the device moves to its owning thread once.
unsafe impl Send for D3D11Device {}

impl std::fmt::Debug for D3D11Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("D3D11Device").field("luid", &self.luid).finish()
    }
}

impl D3D11Device {
    /// Creates a device on `adapter`.
    #[instrument(name = "d3d11_create_device", skip(adapter))]
    pub fn new(adapter: &IDXGIAdapter1, luid: AdapterLuid) -> CaptureResult<Self> {
        let mut device = None;
        let mut context = None;

        unsafe {
            D3D11CreateDevice(
                adapter,
                D3D_DRIVER_TYPE_UNKNOWN,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )?;
        }

        let device = device.ok_or_else(|| CaptureError::WindowsApi {
            message: "Failed to create D3D11 device".to_string(),
            source: None,
        })?;
        let context = context.ok_or_else(|| CaptureError::WindowsApi {
            message: "Failed to get D3D11 device context".to_string(),
            source: None,
        })?;

        debug!(%luid, "Created D3D11 device");
        Ok(Self {
            device,
            context,
            luid,
        })
    }

    pub fn device(&self) -> &ID3D11Device {
        &self.device
    }

    pub fn context(&self) -> &ID3D11DeviceContext {
        &self.context
    }

    fn create_raw(&self, desc: &D3D11_TEXTURE2D_DESC) -> CaptureResult<ID3D11Texture2D> {
        let mut texture = None;
        unsafe { self.device.CreateTexture2D(desc, None, Some(&mut texture)) }
            .map_err(|e| CaptureError::AllocationFailed(e.message().to_string()))?;
        texture.ok_or_else(|| CaptureError::AllocationFailed("CreateTexture2D returned no texture".into()))
    }
}

/// A 2D texture on a [`D3D11Device`].
#[derive(Clone)]
pub struct D3D11Texture(pub ID3D11Texture2D);

// SAFETY: COM reference counting is thread-safe; the texture is only used with its device.
unsafe impl Send for D3D11Texture {}

/// NT handle to a shared texture. Closed when the last clone is dropped.
#[derive(Clone)]
pub struct SharedHandle(std::sync::Arc<OwnedHandle>);

struct OwnedHandle(HANDLE);

// SAFETY: a kernel handle value may be used from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if let Err(e) = unsafe { CloseHandle(self.0) } {
            warn!(error = %e, "CloseHandle failed for shared texture");
        }
    }
}

/// The keyed mutex of a shared texture.
pub struct DxgiKeyedMutex(IDXGIKeyedMutex);

// SAFETY: each side uses its own opened mutex from a single thread.
unsafe impl Send for DxgiKeyedMutex {}

impl KeyedMutex for DxgiKeyedMutex {
    fn acquire_sync(&self, key: u64, timeout: Duration) -> CaptureResult<bool> {
        let ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        // Called through the vtable so WAIT_TIMEOUT is not folded into success
        let hr = unsafe { (Interface::vtable(&self.0).AcquireSync)(Interface::as_raw(&self.0), key, ms) };
        if hr.0 == WAIT_TIMEOUT_HRESULT {
            return Ok(false);
        }
        hr.ok()?;
        Ok(true)
    }

    fn release_sync(&self, key: u64) -> CaptureResult<()> {
        unsafe { self.0.ReleaseSync(key) }
            .map_err(|e| CaptureError::KeyedMutex(e.message().to_string()))
    }
}

fn raw_desc(desc: &TextureDesc) -> D3D11_TEXTURE2D_DESC {
    D3D11_TEXTURE2D_DESC {
        Width: desc.width,
        Height: desc.height,
        MipLevels: desc.mip_levels,
        ArraySize: 1,
        Format: DXGI_FORMAT(desc.format.0 as i32),
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: desc.sample_count.max(1),
            Quality: 0,
        },
        ..Default::default()
    }
}

impl GpuDevice for D3D11Device {
    type Texture = D3D11Texture;
    type SharedHandle = SharedHandle;
    type KeyedMutex = DxgiKeyedMutex;

    fn adapter_luid(&self) -> AdapterLuid {
        self.luid
    }

    fn create_texture(&self, desc: &TextureDesc, usage: TextureUsage) -> CaptureResult<D3D11Texture> {
        let mut raw = raw_desc(desc);
        match usage {
            TextureUsage::Staging(mode) => {
                raw.Usage = D3D11_USAGE_STAGING;
                raw.CPUAccessFlags = match mode {
                    MapMode::Read => D3D11_CPU_ACCESS_READ.0 as u32,
                    MapMode::Write => D3D11_CPU_ACCESS_WRITE.0 as u32,
                };
            }
            TextureUsage::Render => {
                raw.Usage = D3D11_USAGE_DEFAULT;
                raw.BindFlags = (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32;
                if desc.mip_levels > 1 {
                    raw.MiscFlags = D3D11_RESOURCE_MISC_GENERATE_MIPS.0 as u32;
                }
            }
        }
        self.create_raw(&raw).map(D3D11Texture)
    }

    fn describe(&self, texture: &D3D11Texture) -> TextureDesc {
        let mut raw = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.0.GetDesc(&mut raw) };
        TextureDesc {
            width: raw.Width,
            height: raw.Height,
            mip_levels: raw.MipLevels,
            format: PixelFormat(raw.Format.0 as u32),
            sample_count: raw.SampleDesc.Count,
        }
    }

    fn map(&self, texture: &D3D11Texture, mode: MapMode) -> CaptureResult<MappedSurface> {
        let map_type = match mode {
            MapMode::Read => D3D11_MAP_READ,
            MapMode::Write => D3D11_MAP_WRITE,
        };
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe { self.context.Map(&texture.0, 0, map_type, 0, Some(&mut mapped)) }
            .map_err(|e| CaptureError::MapFailed(e.message().to_string()))?;

        let desc = self.describe(texture);
        // SAFETY: the driver keeps the mapping valid until Unmap.
        let surface = unsafe {
            MappedSurface::new(mapped.pData.cast(), mapped.RowPitch as usize, desc.width, desc.height)
        };
        surface.ok_or_else(|| {
            unsafe { self.context.Unmap(&texture.0, 0) };
            CaptureError::MapFailed("Map returned a null pointer".into())
        })
    }

    fn unmap(&self, texture: &D3D11Texture) {
        unsafe { self.context.Unmap(&texture.0, 0) };
    }

    fn copy_region(
        &self,
        dst: &D3D11Texture,
        dst_x: u32,
        dst_y: u32,
        src: &D3D11Texture,
        src_rect: &Rect,
    ) {
        if src_rect.is_empty() {
            return;
        }
        let region = D3D11_BOX {
            left: src_rect.left as u32,
            top: src_rect.top as u32,
            front: 0,
            right: src_rect.right as u32,
            bottom: src_rect.bottom as u32,
            back: 1,
        };
        unsafe {
            self.context
                .CopySubresourceRegion(&dst.0, 0, dst_x, dst_y, 0, &src.0, 0, Some(&region));
        }
    }

    fn generate_mips(&self, texture: &D3D11Texture) {
        let mut view = None;
        if let Err(e) = unsafe { self.device.CreateShaderResourceView(&texture.0, None, Some(&mut view)) } {
            warn!(error = %e, "CreateShaderResourceView failed, mips not generated");
            return;
        }
        if let Some(view) = view {
            unsafe { self.context.GenerateMips(&view) };
        }
    }

    fn create_shared_texture(&self, desc: &TextureDesc) -> CaptureResult<SharedTexture<Self>> {
        let mut raw = raw_desc(desc);
        raw.Usage = D3D11_USAGE_DEFAULT;
        raw.BindFlags = (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32;
        raw.MiscFlags =
            (D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX.0 | D3D11_RESOURCE_MISC_SHARED_NTHANDLE.0) as u32;
        let texture = self.create_raw(&raw)?;

        let resource: IDXGIResource1 = texture.cast()?;
        let handle = unsafe {
            resource.CreateSharedHandle(
                None,
                DXGI_SHARED_RESOURCE_READ | DXGI_SHARED_RESOURCE_WRITE,
                PCWSTR::null(),
            )
        }?;
        let mutex: IDXGIKeyedMutex = texture.cast()?;

        Ok(SharedTexture {
            texture: D3D11Texture(texture),
            handle: SharedHandle(std::sync::Arc::new(OwnedHandle(handle))),
            mutex: DxgiKeyedMutex(mutex),
        })
    }

    fn open_shared_texture(
        &self,
        handle: &SharedHandle,
    ) -> CaptureResult<(D3D11Texture, DxgiKeyedMutex)> {
        let device: ID3D11Device1 = self.device.cast()?;
        let texture: ID3D11Texture2D = unsafe { device.OpenSharedResource1(handle.0 .0) }
            .map_err(|e| CaptureError::AllocationFailed(e.message().to_string()))?;
        let mutex: IDXGIKeyedMutex = texture.cast()?;
        Ok((D3D11Texture(texture), DxgiKeyedMutex(mutex)))
    }
}
