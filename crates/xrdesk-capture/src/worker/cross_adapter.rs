//! Capture on one adapter, render on another.
//!
//! The capture thread copies changed regions into a read-mapped staging
//! texture on the monitor's device and keeps it mapped while the frame is in
//! flight. The render thread copies the same regions through CPU memory into
//! write-mapped staging textures on the HMD device, then GPU-copies them
//! into the render texture.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};
use xrdesk_ipc::{CaptureConfig, CaptureState, ScreenRect};

use super::{
    ensure_open, read_delta, read_pointer_shape, CaptureLoop, CaptureTarget, WorkerCore,
    WorkerShared,
};
use crate::copy::{copy_rect_bgra, Surface};
use crate::cursor::{CursorCompositor, PointerPosition, PointerShape, StoredCursor};
use crate::duplication::{AcquiredFrame, DesktopSource};
use crate::gpu::{GpuDevice, MapMode, MappedSurface, TextureDesc};
use crate::pool::{PoolSettings, StagingTexturePool};
use crate::rect::{FrameDelta, Rect};
use crate::staging::StagingTexture;
use crate::{CaptureError, CaptureResult};

/// The frame handed from the capture thread to the render thread.
struct CrossFrame {
    desktop: TextureDesc,
    delta: FrameDelta,
    cursor: CursorCompositor,

    /// The capture-side staging texture, mapped while the frame is in flight.
    mapped: Option<MappedSurface>,
}

/// Limits for the pooled copy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolLimits {
    pub max_rects: usize,
    pub max_width: u32,
    pub max_height: u32,
}

impl From<&CaptureConfig> for PoolLimits {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            max_rects: config.pool_max_rects,
            max_width: config.pool_max_rect_width,
            max_height: config.pool_max_rect_height,
        }
    }
}

impl PoolLimits {
    fn fits(&self, width: i32, height: i32) -> bool {
        width <= self.max_width as i32 && height <= self.max_height as i32
    }

    /// True if every region of the frame can go through small pooled textures.
    pub fn allows(&self, delta: &FrameDelta, erase: &StoredCursor, draw: &StoredCursor) -> bool {
        let cursors = [erase, draw].into_iter().filter(|c| !c.is_empty());
        if delta.rect_count() + cursors.clone().count() > self.max_rects {
            return false;
        }
        delta
            .moves
            .iter()
            .map(|mv| &mv.destination)
            .chain(delta.dirty.iter())
            .all(|r| self.fits(r.width(), r.height()))
            && cursors
                .map(|c| c.rect())
                .all(|r| self.fits(r.width(), r.height()))
    }
}

/// Render-side half of a cross-adapter worker.
pub struct CrossAdapterWorker<G: GpuDevice> {
    core: WorkerCore<G>,
    frame: Arc<Mutex<CrossFrame>>,
    staging: StagingTexture<G>,
    pool: StagingTexturePool<G>,
    epoch: u64,
    limits: PoolLimits,

    /// Set after a skipped frame; the next frame copies the whole desktop.
    resync: bool,
}

impl<G: GpuDevice> CrossAdapterWorker<G> {
    pub(crate) fn start<S: DesktopSource<G>>(
        target: CaptureTarget<G, S>,
        vr_device: G,
        config: &CaptureConfig,
    ) -> CaptureResult<Self> {
        let CaptureTarget {
            descriptor,
            device,
            source,
        } = target;

        let frame = Arc::new(Mutex::new(CrossFrame {
            desktop: TextureDesc::bgra(0, 0),
            delta: FrameDelta::default(),
            cursor: CursorCompositor::new(config.cursor_drag_threshold),
            mapped: None,
        }));

        let mut core = WorkerCore::new(descriptor.clone(), vr_device, config);
        let capture = CrossCapture {
            device,
            source,
            shape: PointerShape::default(),
            staging: StagingTexture::new(),
            delta: FrameDelta::default(),
            first_frame: true,
            monitor: descriptor.screen_rect,
            config: config.clone(),
            frame: Arc::clone(&frame),
            shared: Arc::clone(&core.shared),
        };
        core.spawn(capture)?;

        Ok(Self {
            core,
            frame,
            staging: StagingTexture::new(),
            pool: StagingTexturePool::new(PoolSettings::from(config)),
            epoch: 0,
            limits: PoolLimits::from(config),
            resync: false,
        })
    }

    pub(crate) fn core(&self) -> &WorkerCore<G> {
        &self.core
    }

    /// Copies a ready frame into the render texture. Never blocks.
    pub fn acquire_vr_render_texture(&mut self) -> bool {
        let shared = Arc::clone(&self.core.shared);
        if !shared.handoff.is_ready() {
            return false;
        }

        // Release the capture thread however the copy goes
        let result = self.copy_frame();
        shared.handoff.acknowledge();

        match result {
            Ok(copied) => copied,
            Err(e) => {
                self.resync = true;
                self.core.on_render_error(&e);
                false
            }
        }
    }

    fn copy_frame(&mut self) -> CaptureResult<bool> {
        let frame = self.frame.lock();
        let Some(mapped) = frame.mapped else {
            return Ok(false);
        };
        let render = self.core.render.ensure(&frame.desktop)?;
        let device = self.core.render.device().clone();

        // SAFETY: the capture thread keeps the staging texture mapped and
        // untouched until this frame is acknowledged.
        let src = unsafe { mapped.surface() };

        let full_delta;
        let mut delta = &frame.delta;
        if std::mem::take(&mut self.resync) {
            debug!(monitor = self.core.descriptor.index, "Resynchronizing whole desktop");
            let mut full = FrameDelta::default();
            full.set_full(frame.desktop.width, frame.desktop.height);
            full_delta = full;
            delta = &full_delta;
        }

        let erase = frame.cursor.cursor_to_erase();
        let draw = frame.cursor.cursor_to_write();
        let staging_desc = frame.desktop.with_mip_levels(1);

        if self.limits.allows(delta, erase, draw) {
            self.epoch += 1;
            trace!(epoch = self.epoch, rects = delta.rect_count(), "Pooled copy");
            let mut upload = PoolUpload {
                device: &device,
                pool: &mut self.pool,
                epoch: self.epoch,
                example: &staging_desc,
                render: &render,
            };
            upload.cursor(erase)?;
            for mv in &delta.moves {
                upload.region(&src, &mv.destination)?;
            }
            for rect in &delta.dirty {
                upload.region(&src, rect)?;
            }
            upload.cursor(draw)?;
        } else {
            trace!(rects = delta.rect_count(), "Full staging copy");
            copy_through_staging(
                &device,
                &mut self.staging,
                &staging_desc,
                &render,
                &src,
                delta,
                erase,
                draw,
            )?;
        }

        device.generate_mips(&render);
        Ok(true)
    }

    pub(crate) fn shutdown(&mut self) {
        self.core.shutdown();
    }
}

/// Uploads regions through epoch-tagged pool textures.
pub(super) struct PoolUpload<'a, G: GpuDevice> {
    pub device: &'a G,
    pub pool: &'a mut StagingTexturePool<G>,
    pub epoch: u64,
    pub example: &'a TextureDesc,
    pub render: &'a G::Texture,
}

impl<G: GpuDevice> PoolUpload<'_, G> {
    fn upload(&mut self, pixels: &Surface<'_>, src: &Rect, dst_x: i32, dst_y: i32) -> CaptureResult<()> {
        let (width, height) = (src.width() as u32, src.height() as u32);
        let lease = self.pool.acquire(
            self.device,
            self.example,
            MapMode::Write,
            width,
            height,
            self.epoch,
        )?;
        {
            let mut mapped = lease.texture.map_scoped()?;
            copy_rect_bgra(&mut mapped.surface_mut(), 0, 0, pixels, src);
        }
        let texture = lease.texture.texture().ok_or(CaptureError::NotPrepared)?;
        self.device.copy_region(
            self.render,
            dst_x as u32,
            dst_y as u32,
            texture,
            &Rect::from_size(0, 0, width, height),
        );
        Ok(())
    }

    fn region(&mut self, desktop: &Surface<'_>, rect: &Rect) -> CaptureResult<()> {
        self.upload(desktop, rect, rect.left, rect.top)
    }

    pub fn cursor(&mut self, cursor: &StoredCursor) -> CaptureResult<()> {
        if cursor.is_empty() {
            return Ok(());
        }
        let whole = Rect::from_size(0, 0, cursor.width, cursor.height);
        self.upload(&cursor.surface(), &whole, cursor.x, cursor.y)
    }
}

/// Copies every region through one desktop-sized staging texture.
#[allow(clippy::too_many_arguments)]
fn copy_through_staging<G: GpuDevice>(
    device: &G,
    staging: &mut StagingTexture<G>,
    desc: &TextureDesc,
    render: &G::Texture,
    src: &Surface<'_>,
    delta: &FrameDelta,
    erase: &StoredCursor,
    draw: &StoredCursor,
) -> CaptureResult<()> {
    staging.prepare(device, MapMode::Write, desc)?;
    {
        let mut mapped = staging.map_scoped()?;
        let mut dst = mapped.surface_mut();
        if !erase.is_empty() {
            let whole = Rect::from_size(0, 0, erase.width, erase.height);
            copy_rect_bgra(&mut dst, erase.x, erase.y, &erase.surface(), &whole);
        }
        for mv in &delta.moves {
            let r = &mv.destination;
            copy_rect_bgra(&mut dst, r.left, r.top, src, r);
        }
        for r in &delta.dirty {
            copy_rect_bgra(&mut dst, r.left, r.top, src, r);
        }
        if !draw.is_empty() {
            let whole = Rect::from_size(0, 0, draw.width, draw.height);
            copy_rect_bgra(&mut dst, draw.x, draw.y, &draw.surface(), &whole);
        }
    }

    let texture = staging.texture().ok_or(CaptureError::NotPrepared)?;
    let regions = [erase, draw].map(|c| (!c.is_empty()).then(|| c.rect()));
    let [erase_rect, draw_rect] = regions;

    for rect in erase_rect
        .iter()
        .chain(delta.moves.iter().map(|mv| &mv.destination))
        .chain(delta.dirty.iter())
        .chain(draw_rect.iter())
    {
        device.copy_region(render, rect.left as u32, rect.top as u32, texture, rect);
    }
    Ok(())
}

/// Capture-thread half of a cross-adapter worker.
struct CrossCapture<G: GpuDevice, S: DesktopSource<G>> {
    device: G,
    source: S,
    shape: PointerShape,

    /// Desktop-sized read staging texture; holds the whole last desktop image.
    staging: StagingTexture<G>,
    delta: FrameDelta,
    first_frame: bool,
    monitor: ScreenRect,
    config: CaptureConfig,
    frame: Arc<Mutex<CrossFrame>>,
    shared: Arc<WorkerShared>,
}

impl<G: GpuDevice, S: DesktopSource<G>> CrossCapture<G, S> {
    /// Composites the cursor over the mapped desktop, hands the frame over
    /// and waits for the render thread.
    ///
    /// A pointer-only update is delivered only if there is a cursor to erase
    /// or draw.
    fn publish(
        &mut self,
        pointer: PointerPosition,
        desktop: TextureDesc,
        screen_updated: bool,
    ) -> CaptureResult<()> {
        let mapped = self.staging.map_scoped()?;

        let deliver = {
            let surface = mapped.surface();
            let mut frame = self.frame.lock();
            let frame = &mut *frame;
            let source = &self.source;
            let drew = frame
                .cursor
                .update(&self.shape, pointer, &surface, &self.monitor, || source.global_cursor());
            let erase = !frame.cursor.cursor_to_erase().is_empty();

            if screen_updated || drew || erase {
                frame.desktop = desktop;
                std::mem::swap(&mut frame.delta, &mut self.delta);
                frame.mapped = Some(mapped.mapped());
                true
            } else {
                trace!(monitor = self.shared.monitor_index, "No cursor to erase or draw");
                false
            }
        };

        if deliver {
            self.shared.deliver();
        } else {
            self.shared.set_state(CaptureState::NoChange);
        }

        let mut frame = self.frame.lock();
        frame.mapped = None;
        frame.cursor.finish_cycle();
        Ok(())
    }
}

impl<G: GpuDevice, S: DesktopSource<G>> CaptureLoop for CrossCapture<G, S> {
    fn cycle(&mut self) -> CaptureResult<()> {
        ensure_open(&mut self.source, &self.device, &self.shared)?;
        self.shared.set_state(CaptureState::Polling);

        let timeout = self.config.acquire_timeout();
        let Some(mut frame) = AcquiredFrame::acquire(&mut self.source, timeout)? else {
            self.shared.set_state(CaptureState::NoChange);
            return Ok(());
        };

        let info = frame.info();
        self.shared.set_protected_content_masked(info.protected_content_masked);
        let pointer = info.pointer;
        let pointer_updated = info.pointer_updated();
        let desktop = info.screen_updated().then(|| info.desktop.clone()).flatten();
        read_pointer_shape(&mut frame, &mut self.shape);

        let Some(desktop) = desktop else {
            drop(frame);
            // Redraw the cursor over the last desktop image
            return match self.staging.desc().copied() {
                Some(desc) if pointer_updated => {
                    self.delta.clear();
                    self.publish(pointer, desc, false)
                }
                _ => {
                    self.shared.set_state(CaptureState::NoChange);
                    Ok(())
                }
            };
        };

        let desc = self.device.describe(&desktop);
        let staging_desc = desc.with_mip_levels(1);
        if self.staging.desc().map_or(true, |d| !d.same_shape(&staging_desc)) {
            self.first_frame = true;
            self.frame.lock().cursor.reset();
        }
        self.staging.prepare(&self.device, MapMode::Read, &staging_desc)?;

        read_delta(
            &mut frame,
            &mut self.first_frame,
            &desc,
            self.config.dirty_rect_expansion,
            &mut self.delta,
        )?;

        let target = self.staging.texture().ok_or(CaptureError::NotPrepared)?;
        for rect in self
            .delta
            .moves
            .iter()
            .map(|mv| &mv.destination)
            .chain(self.delta.dirty.iter())
        {
            self.device
                .copy_region(target, rect.left as u32, rect.top as u32, &desktop, rect);
        }

        // The staging copy holds everything needed from the OS frame
        drop(desktop);
        drop(frame);

        self.publish(pointer, desc, true)
    }
}
