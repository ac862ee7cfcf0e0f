//! CPU-mappable staging textures.

use std::ops::{Deref, DerefMut};

use tracing::{error, trace};

use crate::copy::{Surface, SurfaceMut};
use crate::gpu::{GpuDevice, MapMode, MappedSurface, TextureDesc, TextureUsage};
use crate::{CaptureError, CaptureResult};

/// One CPU-mappable texture with a fixed access mode.
///
/// Map and unmap form a strict bracket: the texture is never reset or
/// dropped while mapped. [`StagingTexture::map_scoped`] returns a guard that
/// unmaps on every exit path; dropping a still-mapped texture unmaps it and
/// logs an error.
pub struct StagingTexture<G: GpuDevice> {
    device: Option<G>,
    texture: Option<G::Texture>,
    desc: Option<TextureDesc>,
    mode: MapMode,
    mapped: Option<MappedSurface>,
}

impl<G: GpuDevice> Default for StagingTexture<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: GpuDevice> StagingTexture<G> {
    pub fn new() -> Self {
        Self {
            device: None,
            texture: None,
            desc: None,
            mode: MapMode::Read,
            mapped: None,
        }
    }

    /// Allocates the texture unless one of the same size, format and mode exists.
    pub fn prepare(&mut self, device: &G, mode: MapMode, desc: &TextureDesc) -> CaptureResult<()> {
        if let Some(current) = &self.desc {
            if current.same_shape(desc) && self.mode == mode && self.texture.is_some() {
                return Ok(());
            }
        }

        self.reset();

        let desc = *desc;
        let texture = device.create_texture(&desc, TextureUsage::Staging(mode))?;
        trace!(width = desc.width, height = desc.height, ?mode, "Staging texture created");

        self.device = Some(device.clone());
        self.texture = Some(texture);
        self.desc = Some(desc);
        self.mode = mode;
        Ok(())
    }

    /// Maps the texture for CPU access in its declared mode.
    pub fn map(&mut self) -> CaptureResult<MappedSurface> {
        debug_assert!(self.mapped.is_none(), "staging texture mapped twice");
        if self.mapped.is_some() {
            return Err(CaptureError::AlreadyMapped);
        }
        let (Some(device), Some(texture)) = (&self.device, &self.texture) else {
            return Err(CaptureError::NotPrepared);
        };

        let surface = device.map(texture, self.mode)?;
        self.mapped = Some(surface);
        Ok(surface)
    }

    /// Unmaps the texture. Does nothing if it is not mapped.
    pub fn unmap(&mut self) {
        if self.mapped.take().is_none() {
            return;
        }
        if let (Some(device), Some(texture)) = (&self.device, &self.texture) {
            device.unmap(texture);
        }
    }

    /// Maps the texture and returns a guard that unmaps it when dropped.
    pub fn map_scoped(&mut self) -> CaptureResult<ScopedMap<'_, G>> {
        let surface = self.map()?;
        Ok(ScopedMap {
            staging: self,
            surface,
        })
    }

    /// Releases the GPU texture.
    pub fn reset(&mut self) {
        debug_assert!(self.mapped.is_none(), "staging texture reset while mapped");
        self.unmap();
        self.texture = None;
        self.desc = None;
    }

    pub fn texture(&self) -> Option<&G::Texture> {
        self.texture.as_ref()
    }

    pub fn desc(&self) -> Option<&TextureDesc> {
        self.desc.as_ref()
    }

    pub fn width(&self) -> u32 {
        self.desc.map_or(0, |d| d.width)
    }

    pub fn height(&self) -> u32 {
        self.desc.map_or(0, |d| d.height)
    }

    pub fn mode(&self) -> MapMode {
        self.mode
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// The current mapping, if any.
    pub fn mapped(&self) -> Option<MappedSurface> {
        self.mapped
    }
}

impl<G: GpuDevice> Drop for StagingTexture<G> {
    fn drop(&mut self) {
        if self.mapped.is_some() {
            error!("Staging texture dropped while mapped");
            self.unmap();
        }
    }
}

/// A mapped staging texture; unmaps on drop.
pub struct ScopedMap<'a, G: GpuDevice> {
    staging: &'a mut StagingTexture<G>,
    surface: MappedSurface,
}

impl<G: GpuDevice> ScopedMap<'_, G> {
    pub fn mapped(&self) -> MappedSurface {
        self.surface
    }

    pub fn pitch(&self) -> usize {
        self.surface.pitch()
    }

    pub fn surface(&self) -> Surface<'_> {
        // SAFETY: the guard keeps the texture mapped and borrows it exclusively.
        unsafe { self.surface.surface() }
    }

    pub fn surface_mut(&mut self) -> SurfaceMut<'_> {
        // SAFETY: as above; `&mut self` rules out other views through this guard.
        unsafe { self.surface.surface_mut() }
    }
}

impl<G: GpuDevice> Deref for ScopedMap<'_, G> {
    type Target = StagingTexture<G>;

    fn deref(&self) -> &Self::Target {
        self.staging
    }
}

impl<G: GpuDevice> DerefMut for ScopedMap<'_, G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.staging
    }
}

impl<G: GpuDevice> Drop for ScopedMap<'_, G> {
    fn drop(&mut self) {
        self.staging.unmap();
    }
}
