//! GPU device abstraction used by the capture pipeline.
//!
//! The pipeline only needs a handful of device operations: create textures,
//! map staging textures for CPU access, copy regions between textures and
//! share a texture with a second device behind a keyed mutex. The D3D11
//! backend implements these on Windows; the software backend implements them
//! over plain memory.

use std::ptr::NonNull;
use std::time::Duration;

use xrdesk_ipc::AdapterLuid;

use crate::copy::{Surface, SurfaceMut};
use crate::rect::Rect;
use crate::CaptureResult;

/// Keyed mutex key held by the capture thread.
pub const DUPE_KEY: u64 = 0;

/// Keyed mutex key held by the render thread.
pub const VR_KEY: u64 = 1;

/// Pixel format identifier (DXGI numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat(pub u32);

impl PixelFormat {
    pub const UNKNOWN: Self = Self(0);
    pub const B8G8R8A8_UNORM: Self = Self(87);

    /// Bytes per pixel; the desktop is always a 32-bit format.
    pub fn bytes_per_pixel(self) -> usize {
        4
    }
}

/// Shape of a 2D texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: PixelFormat,
    pub sample_count: u32,
}

impl TextureDesc {
    /// A single-mip BGRA texture, the format desktop duplication hands out.
    pub fn bgra(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            mip_levels: 1,
            format: PixelFormat::B8G8R8A8_UNORM,
            sample_count: 1,
        }
    }

    /// Returns a copy with a different size.
    pub fn with_size(&self, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..*self
        }
    }

    /// Returns a copy with a different mip count.
    pub fn with_mip_levels(&self, mip_levels: u32) -> Self {
        Self { mip_levels, ..*self }
    }

    /// True if a texture of `self` can stand in for `other` without reallocating.
    pub fn same_shape(&self, other: &TextureDesc) -> bool {
        self.width == other.width && self.height == other.height && self.format == other.format
    }

    pub fn full_rect(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }
}

/// CPU access direction of a staging texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
}

/// What a texture is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureUsage {
    /// CPU-mappable intermediate buffer.
    Staging(MapMode),

    /// Sampled by the host; bindable as shader resource and render target with mip generation.
    Render,
}

/// A CPU view of a mapped texture.
///
/// Holds a raw pointer into driver memory. It is only valid between the map
/// and unmap calls that produced it, which is why reading it is `unsafe`.
#[derive(Debug, Clone, Copy)]
pub struct MappedSurface {
    data: NonNull<u8>,
    pitch: usize,
    width: u32,
    height: u32,
}

// SAFETY: the pointer is plain memory; the map/unmap protocol decides who may touch it.
unsafe impl Send for MappedSurface {}

impl MappedSurface {
    /// Wraps a mapped pointer. Returns `None` for a null pointer.
    ///
    /// # Safety
    /// `data` must be valid for `pitch * (height - 1) + width * 4` bytes until unmapped.
    pub unsafe fn new(data: *mut u8, pitch: usize, width: u32, height: u32) -> Option<Self> {
        NonNull::new(data).map(|data| Self {
            data,
            pitch,
            width,
            height,
        })
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    fn len(&self) -> usize {
        if self.height == 0 {
            return 0;
        }
        self.pitch * (self.height as usize - 1) + self.width as usize * 4
    }

    /// # Safety
    /// The texture must still be mapped and nobody may write it concurrently.
    pub unsafe fn surface(&self) -> Surface<'_> {
        let data = std::slice::from_raw_parts(self.data.as_ptr(), self.len());
        Surface::new(data, self.pitch, self.width, self.height)
    }

    /// # Safety
    /// The texture must still be mapped and nobody else may access it.
    pub unsafe fn surface_mut(&mut self) -> SurfaceMut<'_> {
        let data = std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len());
        SurfaceMut::new(data, self.pitch, self.width, self.height)
    }
}

/// Two-party lock attached to a shared texture.
///
/// Not a general mutex: each side acquires with its own key and releases
/// with the other side's key, so ownership ping-pongs.
pub trait KeyedMutex: Send {
    /// Returns `Ok(false)` if the key was not released to us within `timeout`.
    fn acquire_sync(&self, key: u64, timeout: Duration) -> CaptureResult<bool>;

    /// Hands ownership to whoever acquires with `key`.
    fn release_sync(&self, key: u64) -> CaptureResult<()>;
}

/// A texture created for sharing with another device.
pub struct SharedTexture<G: GpuDevice> {
    pub texture: G::Texture,
    pub handle: G::SharedHandle,
    pub mutex: G::KeyedMutex,
}

/// A GPU device plus its immediate context.
pub trait GpuDevice: Clone + Send + 'static {
    type Texture: Clone + Send + 'static;
    type SharedHandle: Clone + Send + 'static;
    type KeyedMutex: KeyedMutex + 'static;

    /// Adapter the device was created on.
    fn adapter_luid(&self) -> AdapterLuid;

    fn create_texture(&self, desc: &TextureDesc, usage: TextureUsage)
        -> CaptureResult<Self::Texture>;

    fn describe(&self, texture: &Self::Texture) -> TextureDesc;

    fn map(&self, texture: &Self::Texture, mode: MapMode) -> CaptureResult<MappedSurface>;

    fn unmap(&self, texture: &Self::Texture);

    /// Copies `src_rect` of `src` to (`dst_x`, `dst_y`) of `dst`, mip 0.
    fn copy_region(
        &self,
        dst: &Self::Texture,
        dst_x: u32,
        dst_y: u32,
        src: &Self::Texture,
        src_rect: &Rect,
    );

    /// Regenerates the mip chain of a render texture.
    fn generate_mips(&self, _texture: &Self::Texture) {}

    /// Creates a desktop-sized texture another device can open, guarded by a keyed mutex.
    fn create_shared_texture(&self, desc: &TextureDesc) -> CaptureResult<SharedTexture<Self>>;

    /// Opens a texture created by [`GpuDevice::create_shared_texture`] on another device.
    fn open_shared_texture(
        &self,
        handle: &Self::SharedHandle,
    ) -> CaptureResult<(Self::Texture, Self::KeyedMutex)>;
}
