//! Capture and render on the same adapter.
//!
//! The capture thread copies changed regions straight into a texture shared
//! with the render device. A keyed mutex passes ownership back and forth:
//! the capture side holds [`DUPE_KEY`] while writing and releases it to
//! [`VR_KEY`] when a frame is ready; the render side releases it back once
//! the host is done with the render texture. Only the cursor goes through
//! CPU memory.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace};
use xrdesk_ipc::{CaptureConfig, CaptureState, ScreenRect};

use super::cross_adapter::PoolUpload;
use super::{
    ensure_open, read_delta, read_pointer_shape, CaptureLoop, CaptureTarget, WorkerCore,
    WorkerShared,
};
use crate::cursor::{CursorCompositor, PointerPosition, PointerShape};
use crate::duplication::{AcquiredFrame, DesktopSource};
use crate::gpu::{GpuDevice, KeyedMutex, MapMode, SharedTexture, TextureDesc, DUPE_KEY, VR_KEY};
use crate::pool::{PoolSettings, StagingTexturePool};
use crate::rect::{FrameDelta, Rect};
use crate::staging::StagingTexture;
use crate::{CaptureError, CaptureResult};

/// What the capture thread tells the render thread about the shared texture.
struct SharedSlot<G: GpuDevice> {
    handle: Option<G::SharedHandle>,

    /// Bumped every time the shared texture is recreated.
    generation: u64,
    desktop: TextureDesc,
    delta: FrameDelta,
    cursor: CursorCompositor,
}

/// The shared texture as opened on the render device.
struct OpenedTexture<G: GpuDevice> {
    texture: G::Texture,
    mutex: G::KeyedMutex,
    generation: u64,
}

/// Render-side half of a same-adapter worker.
pub struct SameAdapterWorker<G: GpuDevice> {
    core: WorkerCore<G>,
    slot: Arc<Mutex<SharedSlot<G>>>,
    opened: Option<OpenedTexture<G>>,

    /// True between a successful acquire and the matching release.
    mutex_held: bool,
    pool: StagingTexturePool<G>,
    epoch: u64,

    /// Where the cursor was drawn into the render texture last time.
    last_cursor: Option<Rect>,
    resync: bool,
}

impl<G: GpuDevice> SameAdapterWorker<G> {
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

        let slot = Arc::new(Mutex::new(SharedSlot {
            handle: None,
            generation: 0,
            desktop: TextureDesc::bgra(0, 0),
            delta: FrameDelta::default(),
            cursor: CursorCompositor::new(config.cursor_drag_threshold),
        }));

        let mut core = WorkerCore::new(descriptor.clone(), vr_device, config);
        let capture = SameCapture {
            device,
            source,
            shape: PointerShape::default(),
            texture: None,
            generation: 0,
            cursor_staging: StagingTexture::new(),
            delta: FrameDelta::default(),
            first_frame: true,
            monitor: descriptor.screen_rect,
            config: config.clone(),
            slot: Arc::clone(&slot),
            shared: Arc::clone(&core.shared),
        };
        core.spawn(capture)?;

        Ok(Self {
            core,
            slot,
            opened: None,
            mutex_held: false,
            pool: StagingTexturePool::new(PoolSettings::from(config)),
            epoch: 0,
            last_cursor: None,
            resync: false,
        })
    }

    pub(crate) fn core(&self) -> &WorkerCore<G> {
        &self.core
    }

    /// Takes the shared texture and brings the render texture up to date.
    ///
    /// Never blocks. On success the keyed mutex stays held until
    /// [`SameAdapterWorker::release_vr_render_texture`].
    pub fn acquire_vr_render_texture(&mut self) -> bool {
        if self.mutex_held {
            error!(
                monitor = self.core.descriptor.index,
                "Keyed mutex never released, releasing it now"
            );
            self.release_vr_render_texture();
        }

        if !self.core.shared.handoff.is_ready() {
            return false;
        }

        match self.lock_texture() {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                // The frame stays pending; a retryable open is tried again next time
                self.core.on_render_error(&e);
                return false;
            }
        }

        match self.copy_frame() {
            Ok(()) => true,
            Err(e) => {
                self.resync = true;
                self.core.on_render_error(&e);
                self.release_vr_render_texture();
                false
            }
        }
    }

    /// Returns the shared texture to the capture thread.
    pub fn release_vr_render_texture(&mut self) {
        if !std::mem::take(&mut self.mutex_held) {
            return;
        }
        if let Some(opened) = &self.opened {
            if let Err(e) = opened.mutex.release_sync(DUPE_KEY) {
                error!(monitor = self.core.descriptor.index, error = %e, "Keyed mutex release failed");
            }
        }
        self.core.shared.handoff.acknowledge();
    }

    /// Opens the current shared texture if needed and tries to take it.
    fn lock_texture(&mut self) -> CaptureResult<bool> {
        let (generation, handle) = {
            let slot = self.slot.lock();
            (slot.generation, slot.handle.clone())
        };

        if self.opened.as_ref().map_or(true, |o| o.generation != generation) {
            self.opened = None;
            self.last_cursor = None;
            let handle = handle.ok_or(CaptureError::NotPrepared)?;
            let (texture, mutex) = self.core.render.device().open_shared_texture(&handle)?;
            debug!(monitor = self.core.descriptor.index, generation, "Opened shared desktop texture");
            self.opened = Some(OpenedTexture {
                texture,
                mutex,
                generation,
            });
        }

        let opened = self.opened.as_ref().ok_or(CaptureError::NotPrepared)?;
        if !opened.mutex.acquire_sync(VR_KEY, Duration::ZERO)? {
            trace!("Shared texture not yet released to the render device");
            return Ok(false);
        }
        self.mutex_held = true;
        Ok(true)
    }

    fn copy_frame(&mut self) -> CaptureResult<()> {
        let slot = self.slot.lock();
        let opened = self.opened.as_ref().ok_or(CaptureError::NotPrepared)?;
        let render = self.core.render.ensure(&slot.desktop)?;
        let device = self.core.render.device().clone();
        let src = &opened.texture;

        let full_delta;
        let mut delta = &slot.delta;
        if std::mem::take(&mut self.resync) {
            debug!(monitor = self.core.descriptor.index, "Resynchronizing whole desktop");
            let mut full = FrameDelta::default();
            full.set_full(slot.desktop.width, slot.desktop.height);
            full_delta = full;
            delta = &full_delta;
        }

        // The shared texture never contains the cursor, so it erases it
        if let Some(rect) = self.last_cursor.take() {
            device.copy_region(&render, rect.left as u32, rect.top as u32, src, &rect);
        }
        for rect in delta
            .moves
            .iter()
            .map(|mv| &mv.destination)
            .chain(delta.dirty.iter())
        {
            device.copy_region(&render, rect.left as u32, rect.top as u32, src, rect);
        }

        let draw = slot.cursor.cursor_to_write();
        if !draw.is_empty() {
            self.epoch += 1;
            let example = slot.desktop.with_mip_levels(1);
            PoolUpload {
                device: &device,
                pool: &mut self.pool,
                epoch: self.epoch,
                example: &example,
                render: &render,
            }
            .cursor(draw)?;
            self.last_cursor = Some(draw.rect());
        }

        device.generate_mips(&render);
        Ok(())
    }

    pub(crate) fn shutdown(&mut self) {
        self.release_vr_render_texture();
        self.core.shutdown();
    }
}

/// Waits for the render side to hand the shared texture back.
fn lock_for_capture<M: KeyedMutex>(mutex: &M, timeout: Duration) -> CaptureResult<()> {
    if mutex.acquire_sync(DUPE_KEY, timeout)? {
        Ok(())
    } else {
        Err(CaptureError::KeyedMutex(
            "timed out waiting for the render device".into(),
        ))
    }
}

/// Reads the desktop under the cursor and composites the cursor over it.
///
/// Returns true if a cursor image was produced for this cycle.
#[allow(clippy::too_many_arguments)]
fn capture_cursor<G: GpuDevice, S: DesktopSource<G>>(
    device: &G,
    source: &S,
    shape: &PointerShape,
    pointer: PointerPosition,
    desktop: &G::Texture,
    desc: &TextureDesc,
    monitor: &ScreenRect,
    staging: &mut StagingTexture<G>,
    cursor: &mut CursorCompositor,
) -> CaptureResult<bool> {
    let Some(placement) = cursor.locate(shape, pointer, desc.width, desc.height, monitor, || {
        source.global_cursor()
    }) else {
        return Ok(false);
    };
    let Some((width, height)) = shape.visible_size() else {
        return Ok(false);
    };

    staging.prepare(device, MapMode::Read, &desc.with_mip_levels(1).with_size(width, height))?;
    {
        let target = staging.texture().ok_or(CaptureError::NotPrepared)?;
        device.copy_region(target, 0, 0, desktop, &placement.rect);
    }
    let mapped = staging.map_scoped()?;
    Ok(cursor.composite(shape, &placement, &mapped.surface(), 0, 0))
}

/// Capture-thread half of a same-adapter worker.
struct SameCapture<G: GpuDevice, S: DesktopSource<G>> {
    device: G,
    source: S,
    shape: PointerShape,
    texture: Option<SharedTexture<G>>,
    generation: u64,

    /// Cursor-sized read staging texture.
    cursor_staging: StagingTexture<G>,
    delta: FrameDelta,
    first_frame: bool,
    monitor: ScreenRect,
    config: CaptureConfig,
    slot: Arc<Mutex<SharedSlot<G>>>,
    shared: Arc<WorkerShared>,
}

impl<G: GpuDevice, S: DesktopSource<G>> SameCapture<G, S> {
    /// Composites the cursor, releases the shared texture and waits for the
    /// render thread. The capture side must hold the keyed mutex.
    fn publish(
        &mut self,
        pointer: PointerPosition,
        desktop: TextureDesc,
        screen_updated: bool,
    ) -> CaptureResult<()> {
        let texture = self.texture.as_ref().ok_or(CaptureError::NotPrepared)?;

        let deliver = {
            let mut slot = self.slot.lock();
            let slot = &mut *slot;
            let composited = capture_cursor(
                &self.device,
                &self.source,
                &self.shape,
                pointer,
                &texture.texture,
                &desktop,
                &self.monitor,
                &mut self.cursor_staging,
                &mut slot.cursor,
            );

            let drew = matches!(composited, Ok(true));
            let erase = !slot.cursor.cursor_to_erase().is_empty();
            let deliver = composited.is_ok() && (screen_updated || drew || erase);
            if !deliver && !screen_updated {
                trace!(monitor = self.shared.monitor_index, "No cursor to erase or draw");
            }
            if deliver {
                slot.desktop = desktop;
                std::mem::swap(&mut slot.delta, &mut self.delta);
            }

            // Without a frame to consume the render side would never hand it back
            let key = if deliver { VR_KEY } else { DUPE_KEY };
            texture.mutex.release_sync(key)?;
            composited?;
            deliver
        };

        if deliver {
            self.shared.deliver();
        } else {
            self.shared.set_state(CaptureState::NoChange);
        }

        self.slot.lock().cursor.finish_cycle();
        Ok(())
    }
}

impl<G: GpuDevice, S: DesktopSource<G>> CaptureLoop for SameCapture<G, S> {
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
            let Some(texture) = self.texture.as_ref().filter(|_| pointer_updated) else {
                self.shared.set_state(CaptureState::NoChange);
                return Ok(());
            };
            lock_for_capture(&texture.mutex, timeout)?;
            let desc = self.device.describe(&texture.texture);
            self.delta.clear();
            return self.publish(pointer, desc, false);
        };

        let desc = self.device.describe(&desktop).with_mip_levels(1);
        let recreate = self
            .texture
            .as_ref()
            .map_or(true, |t| !self.device.describe(&t.texture).same_shape(&desc));
        if recreate {
            self.texture = None;
            let texture = self.device.create_shared_texture(&desc)?;
            self.generation += 1;
            info!(
                monitor = self.shared.monitor_index,
                width = desc.width,
                height = desc.height,
                generation = self.generation,
                "Created shared desktop texture"
            );

            let mut slot = self.slot.lock();
            slot.handle = Some(texture.handle.clone());
            slot.generation = self.generation;
            slot.cursor.reset();
            drop(slot);

            self.first_frame = true;
            self.texture = Some(texture);
        }

        read_delta(
            &mut frame,
            &mut self.first_frame,
            &desc,
            self.config.dirty_rect_expansion,
            &mut self.delta,
        )?;

        let texture = self.texture.as_ref().ok_or(CaptureError::NotPrepared)?;
        lock_for_capture(&texture.mutex, timeout)?;
        for rect in self
            .delta
            .moves
            .iter()
            .map(|mv| &mv.destination)
            .chain(self.delta.dirty.iter())
        {
            self.device
                .copy_region(&texture.texture, rect.left as u32, rect.top as u32, &desktop, rect);
        }

        drop(desktop);
        drop(frame);

        self.publish(pointer, desc, true)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use xrdesk_ipc::AdapterLuid;

    use super::*;
    use crate::rect::MoveRect;
    use crate::software::{ScriptProbe, ScriptStep, ScriptedDuplication, ScriptedFrame, SoftDevice};
    use crate::worker::test_support::{black_box_cursor, monitor, pump};
    use crate::worker::{CaptureWorker, WorkerKind};

    const DESKTOP: u32 = 0xFF_336699;
    const RED: u32 = 0xFF_FF0000;
    const MOVED: u32 = 0xFF_22AA44;
    const BLACK: u32 = 0xFF_000000;

    struct Rig {
        worker: CaptureWorker<SoftDevice>,
        dupe: SoftDevice,
        vr: SoftDevice,
        probe: ScriptProbe,
    }

    impl Rig {
        fn new() -> Self {
            let dupe = SoftDevice::with_luid(AdapterLuid::new(7, 0));
            let vr = SoftDevice::with_luid(AdapterLuid::new(7, 0));
            let source = ScriptedDuplication::new(1920, 1080, []);
            let probe = source.probe();
            let target = CaptureTarget {
                descriptor: monitor(1920, 1080),
                device: dupe.clone(),
                source,
            };
            let worker = CaptureWorker::start(target, &vr, &CaptureConfig::default()).unwrap();
            assert_eq!(worker.kind(), WorkerKind::SameAdapter);
            Self {
                worker,
                dupe,
                vr,
                probe,
            }
        }

        fn frame(&mut self, frame: ScriptedFrame) {
            let before = self.worker.frames_delivered();
            self.vr.clear_copy_log();
            self.dupe.clear_copy_log();
            self.probe.push(ScriptStep::Frame(frame));
            assert!(pump(&mut self.worker, |w| w.frames_delivered() > before));
        }

        fn pixel(&self, x: u32, y: u32) -> u32 {
            let texture = self.worker.render_texture().unwrap();
            self.vr.pixel(texture, x, y)
        }
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            self.worker.shutdown();
        }
    }

    fn full() -> Rect {
        Rect::new(0, 0, 1920, 1080)
    }

    #[test]
    fn test_single_dirty_rect_copies_expanded_region_only() {
        let mut rig = Rig::new();
        rig.frame(ScriptedFrame::dirty([Rect::new(40, 40, 60, 60)]));

        // First frame: the whole desktop, once, into the shared texture
        let log = rig.dupe.copy_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].src_rect, full());
        let desc = *rig.worker.render_texture_desc().unwrap();
        assert_eq!((desc.width, desc.height), (1920, 1080));
        assert_eq!(desc.mip_levels, crate::DUPLICATION_MIP_LEVELS);

        rig.frame(ScriptedFrame::dirty([Rect::new(0, 0, 100, 100)]).with_paint(Rect::new(0, 0, 300, 300), RED));

        for log in [rig.dupe.copy_log(), rig.vr.copy_log()] {
            assert_eq!(log.len(), 1);
            assert_eq!((log[0].dst_x, log[0].dst_y), (0, 0));
            assert_eq!(log[0].src_rect, Rect::new(0, 0, 116, 116));
        }
        assert_eq!(rig.pixel(115, 115), RED);
        assert_eq!(rig.pixel(116, 116), 0);
        assert_eq!(rig.vr.count_pixels(rig.worker.render_texture().unwrap(), RED), 116 * 116);
        assert_eq!(rig.vr.stats().shared_opened, 1);
        assert_eq!(rig.vr.stats().mips_generated, 2);
    }

    #[test]
    fn test_dirty_rect_wins_over_overlapping_move() {
        let mut rig = Rig::new();
        rig.frame(ScriptedFrame::dirty([]).with_paint(full(), DESKTOP));

        // A window moved right by 200 px, then partly redrawn
        let source = Rect::new(100, 100, 200, 150);
        let destination = Rect::new(300, 100, 400, 150);
        let dirty = Rect::new(350, 120, 450, 140);
        rig.frame(
            ScriptedFrame::dirty([dirty])
                .with_moves([MoveRect::new(source.left, source.top, destination)])
                .with_paint(source, MOVED)
                .with_paint(destination, MOVED)
                .with_paint(dirty, RED),
        );

        for log in [rig.dupe.copy_log(), rig.vr.copy_log()] {
            let order: Vec<(u32, u32)> = log.iter().map(|c| (c.dst_x, c.dst_y)).collect();
            assert_eq!(order, vec![(300, 100), (350, 120)]);
        }
        assert_eq!(rig.pixel(320, 110), MOVED);
        assert_eq!(rig.pixel(399, 149), MOVED);
        assert_eq!(rig.pixel(350, 120), RED);
        assert_eq!(rig.pixel(399, 139), RED);
        assert_eq!(rig.pixel(440, 130), RED);
        assert_eq!(rig.pixel(150, 120), DESKTOP);
    }

    #[test]
    fn test_cursor_is_erased_from_shared_texture() {
        let mut rig = Rig::new();
        let (info, bytes) = black_box_cursor();

        rig.frame(
            ScriptedFrame::dirty([])
                .with_paint(full(), DESKTOP)
                .with_shape(info, bytes)
                .with_pointer(50, 50),
        );
        assert_eq!(rig.pixel(50, 50), BLACK);
        assert_eq!(rig.pixel(57, 57), BLACK);
        assert_eq!(rig.pixel(58, 58), DESKTOP);

        rig.frame(ScriptedFrame::pointer(200, 200));
        let log = rig.vr.copy_log();
        assert_eq!(log.len(), 2);
        assert_eq!((log[0].dst_x, log[0].dst_y), (50, 50));
        assert_eq!(log[0].src_rect, Rect::new(50, 50, 58, 58));
        assert_eq!((log[1].dst_x, log[1].dst_y), (200, 200));
        assert_eq!(rig.pixel(52, 52), DESKTOP);
        assert_eq!(rig.pixel(203, 203), BLACK);
    }

    #[test]
    fn test_unreleased_mutex_is_released_on_next_acquire() {
        let mut rig = Rig::new();
        rig.probe.push(ScriptStep::Frame(ScriptedFrame::dirty([])));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !rig.worker.acquire_vr_render_texture() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }

        // The capture thread stays parked while the host holds the texture
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(rig.worker.frames_delivered(), 0);

        assert!(!rig.worker.acquire_vr_render_texture());
        assert!(pump(&mut rig.worker, |w| w.frames_delivered() == 1));
        assert!(!rig.worker.capture_failure());

        rig.frame(ScriptedFrame::dirty([Rect::new(0, 0, 4, 4)]));
        assert_eq!(rig.worker.frames_delivered(), 2);
    }

    #[test]
    fn test_failed_open_keeps_frame_pending() {
        let mut rig = Rig::new();
        rig.vr.fail_allocations(true);
        rig.probe.push(ScriptStep::Frame(ScriptedFrame::dirty([])));

        let deadline = Instant::now() + Duration::from_millis(100);
        while Instant::now() < deadline {
            assert!(!rig.worker.acquire_vr_render_texture());
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!rig.worker.capture_failure());
        assert_eq!(rig.worker.frames_delivered(), 0);

        rig.vr.fail_allocations(false);
        assert!(pump(&mut rig.worker, |w| w.frames_delivered() == 1));
        assert!(rig.worker.render_texture().is_some());
    }

    #[test]
    fn test_skipped_frame_resynchronizes() {
        let mut rig = Rig::new();
        let (info, bytes) = black_box_cursor();
        rig.frame(ScriptedFrame::dirty([]).with_shape(info, bytes).with_pointer(50, 50));

        rig.vr.fail_maps(true);
        rig.frame(ScriptedFrame::pointer(300, 300));
        assert!(!rig.worker.capture_failure());

        rig.vr.fail_maps(false);
        rig.frame(ScriptedFrame::dirty([Rect::new(500, 500, 510, 510)]));
        assert!(rig.vr.copy_log().iter().any(|c| c.src_rect == full()));
        assert!(!rig.worker.capture_failure());
    }

    #[test]
    fn test_pointer_only_update_keeps_mutex_with_capture() {
        let mut rig = Rig::new();
        rig.frame(ScriptedFrame::dirty([]));

        // No cursor shape: nothing to draw, nothing delivered
        rig.probe.push(ScriptStep::Frame(ScriptedFrame::pointer(10, 10)));
        assert!(pump(&mut rig.worker, |_| rig.probe.frames_released() == 2));
        assert_eq!(rig.worker.frames_delivered(), 1);

        // The capture side can still take the texture for the next frame
        rig.frame(ScriptedFrame::dirty([Rect::new(0, 0, 4, 4)]));
        assert_eq!(rig.worker.frames_delivered(), 2);
        assert!(!rig.worker.capture_failure());
    }

    #[test]
    fn test_hidden_pointer_shape_change_is_not_delivered() {
        let mut rig = Rig::new();
        rig.frame(ScriptedFrame::dirty([]));

        // New shape while the pointer is hidden: nothing composited, nothing to erase
        let (info, bytes) = black_box_cursor();
        rig.probe
            .push(ScriptStep::Frame(ScriptedFrame::default().with_shape(info, bytes)));
        assert!(pump(&mut rig.worker, |_| rig.probe.frames_released() == 2));
        assert_eq!(rig.worker.frames_delivered(), 1);

        rig.frame(ScriptedFrame::dirty([Rect::new(0, 0, 4, 4)]));
        assert_eq!(rig.worker.frames_delivered(), 2);
        assert_eq!(rig.vr.copy_log().len(), 1);
        assert!(!rig.worker.capture_failure());
    }
}
