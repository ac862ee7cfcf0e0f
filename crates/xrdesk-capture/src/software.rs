//! In-memory GPU device and scripted duplication source.
//!
//! Lets the capture workers run without a graphics adapter: textures are
//! pitched byte buffers, the keyed mutex is a condvar ping-pong and the
//! duplication session replays a script of frames, timeouts and errors.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;
use xrdesk_ipc::AdapterLuid;

use crate::copy::{copy_rect_bgra, Surface, SurfaceMut};
use crate::cursor::{GlobalCursor, PointerPosition, PointerShape, PointerShapeInfo};
use crate::duplication::{DesktopSource, FrameInfo};
use crate::gpu::{
    GpuDevice, KeyedMutex, MapMode, MappedSurface, SharedTexture, TextureDesc, TextureUsage,
};
use crate::rect::{MoveRect, Rect};
use crate::{CaptureError, CaptureResult};

/// Row pitch alignment, matching what desktop drivers hand out.
const PITCH_ALIGNMENT: usize = 256;

/// Counters kept by a [`SoftDevice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftStats {
    pub textures_created: u64,
    pub maps: u64,
    pub mapped_now: u64,
    pub destroyed_while_mapped: u64,
    pub copies: u64,
    pub mips_generated: u64,
    pub shared_opened: u64,
}

/// One `copy_region` call, for checking copy order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRecord {
    pub dst: u64,
    pub src: u64,
    pub dst_x: u32,
    pub dst_y: u32,
    pub src_rect: Rect,
}

#[derive(Debug)]
struct DeviceState {
    luid: AdapterLuid,
    fail_allocations: AtomicBool,
    fail_maps: AtomicBool,
    stats: Mutex<SoftStats>,
    copies: Mutex<Vec<CopyRecord>>,
}

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

/// A GPU device backed by plain memory.
#[derive(Debug, Clone)]
pub struct SoftDevice {
    state: Arc<DeviceState>,
}

impl Default for SoftDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftDevice {
    pub fn new() -> Self {
        Self::with_luid(AdapterLuid::new(1, 0))
    }

    /// A device on a specific adapter, to exercise adapter matching.
    pub fn with_luid(luid: AdapterLuid) -> Self {
        Self {
            state: Arc::new(DeviceState {
                luid,
                fail_allocations: AtomicBool::new(false),
                fail_maps: AtomicBool::new(false),
                stats: Mutex::new(SoftStats::default()),
                copies: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn stats(&self) -> SoftStats {
        *self.state.stats.lock()
    }

    /// Makes every following texture allocation fail.
    pub fn fail_allocations(&self, fail: bool) {
        self.state.fail_allocations.store(fail, Ordering::SeqCst);
    }

    /// Makes every following map fail.
    pub fn fail_maps(&self, fail: bool) {
        self.state.fail_maps.store(fail, Ordering::SeqCst);
    }

    pub fn copy_log(&self) -> Vec<CopyRecord> {
        self.state.copies.lock().clone()
    }

    pub fn clear_copy_log(&self) {
        self.state.copies.lock().clear();
    }

    /// Fills `rect` of mip 0 with one BGRA value.
    pub fn fill_rect(&self, texture: &SoftTexture, rect: &Rect, value: u32) {
        let desc = texture.inner.desc;
        let Some(rect) = rect.clamp_to(desc.width, desc.height) else {
            return;
        };
        let mut pixels = texture.inner.pixels.lock();
        let mut surface = SurfaceMut::new(&mut pixels, texture.inner.pitch, desc.width, desc.height);
        for y in rect.top..rect.bottom {
            for x in rect.left..rect.right {
                surface.set_pixel(x as u32, y as u32, value);
            }
        }
    }

    /// Reads one pixel of mip 0.
    pub fn pixel(&self, texture: &SoftTexture, x: u32, y: u32) -> u32 {
        let desc = texture.inner.desc;
        let pixels = texture.inner.pixels.lock();
        Surface::new(&pixels, texture.inner.pitch, desc.width, desc.height).pixel(x, y)
    }

    /// Counts pixels of mip 0 equal to `value`.
    pub fn count_pixels(&self, texture: &SoftTexture, value: u32) -> usize {
        let desc = texture.inner.desc;
        let pixels = texture.inner.pixels.lock();
        let surface = Surface::new(&pixels, texture.inner.pitch, desc.width, desc.height);
        (0..desc.height)
            .flat_map(|y| (0..desc.width).map(move |x| (x, y)))
            .filter(|&(x, y)| surface.pixel(x, y) == value)
            .count()
    }

    fn allocate(&self, desc: &TextureDesc, usage: TextureUsage) -> CaptureResult<SoftTexture> {
        if self.state.fail_allocations.load(Ordering::SeqCst) {
            return Err(CaptureError::AllocationFailed("injected failure".into()));
        }
        if desc.width == 0 || desc.height == 0 {
            return Err(CaptureError::AllocationFailed(format!(
                "empty texture {}x{}",
                desc.width, desc.height
            )));
        }

        let pitch = (desc.width as usize * desc.format.bytes_per_pixel()).next_multiple_of(PITCH_ALIGNMENT);
        let texture = SoftTexture {
            inner: Arc::new(TextureInner {
                id: NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed),
                desc: *desc,
                usage,
                pitch,
                pixels: Mutex::new(vec![0u8; pitch * desc.height as usize]),
                mapped: AtomicBool::new(false),
                device: Arc::clone(&self.state),
            }),
        };
        self.state.stats.lock().textures_created += 1;
        Ok(texture)
    }
}

struct TextureInner {
    id: u64,
    desc: TextureDesc,
    usage: TextureUsage,
    pitch: usize,
    pixels: Mutex<Vec<u8>>,
    mapped: AtomicBool,
    device: Arc<DeviceState>,
}

impl Drop for TextureInner {
    fn drop(&mut self) {
        if self.mapped.load(Ordering::SeqCst) {
            let mut stats = self.device.stats.lock();
            stats.destroyed_while_mapped += 1;
            stats.mapped_now -= 1;
        }
    }
}

/// A texture of a [`SoftDevice`].
#[derive(Clone)]
pub struct SoftTexture {
    inner: Arc<TextureInner>,
}

impl std::fmt::Debug for SoftTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftTexture")
            .field("id", &self.inner.id)
            .field("desc", &self.inner.desc)
            .field("usage", &self.inner.usage)
            .finish()
    }
}

impl SoftTexture {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn usage(&self) -> TextureUsage {
        self.inner.usage
    }

    pub fn is_mapped(&self) -> bool {
        self.inner.mapped.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct KeyedLock {
    /// Key the mutex was last released with; `None` while held.
    released_with: Mutex<Option<u64>>,
    cond: Condvar,
}

/// Handle for opening a shared [`SoftTexture`] on another device.
#[derive(Debug, Clone)]
pub struct SoftSharedHandle {
    texture: SoftTexture,
    lock: Arc<KeyedLock>,
}

/// Keyed mutex over a [`KeyedLock`]; starts released with key 0.
#[derive(Debug, Clone)]
pub struct SoftKeyedMutex {
    lock: Arc<KeyedLock>,
}

impl SoftKeyedMutex {
    /// True if no side currently holds the mutex.
    pub fn is_released(&self) -> bool {
        self.lock.released_with.lock().is_some()
    }
}

impl KeyedMutex for SoftKeyedMutex {
    fn acquire_sync(&self, key: u64, timeout: Duration) -> CaptureResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock.released_with.lock();
        loop {
            if *state == Some(key) {
                *state = None;
                return Ok(true);
            }
            if self.lock.cond.wait_until(&mut state, deadline).timed_out() {
                if *state == Some(key) {
                    *state = None;
                    return Ok(true);
                }
                return Ok(false);
            }
        }
    }

    fn release_sync(&self, key: u64) -> CaptureResult<()> {
        let mut state = self.lock.released_with.lock();
        if state.is_some() {
            return Err(CaptureError::KeyedMutex("released while not held".into()));
        }
        *state = Some(key);
        self.lock.cond.notify_all();
        Ok(())
    }
}

impl GpuDevice for SoftDevice {
    type Texture = SoftTexture;
    type SharedHandle = SoftSharedHandle;
    type KeyedMutex = SoftKeyedMutex;

    fn adapter_luid(&self) -> AdapterLuid {
        self.state.luid
    }

    fn create_texture(&self, desc: &TextureDesc, usage: TextureUsage) -> CaptureResult<SoftTexture> {
        self.allocate(desc, usage)
    }

    fn describe(&self, texture: &SoftTexture) -> TextureDesc {
        texture.inner.desc
    }

    fn map(&self, texture: &SoftTexture, mode: MapMode) -> CaptureResult<MappedSurface> {
        if self.state.fail_maps.load(Ordering::SeqCst) {
            return Err(CaptureError::MapFailed("injected failure".into()));
        }
        if texture.inner.usage != TextureUsage::Staging(mode) {
            return Err(CaptureError::MapFailed(format!(
                "{:?} texture cannot be mapped for {:?}",
                texture.inner.usage, mode
            )));
        }
        if texture.inner.mapped.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::MapFailed("texture is already mapped".into()));
        }

        let desc = texture.inner.desc;
        let data = texture.inner.pixels.lock().as_mut_ptr();
        // SAFETY: the buffer is never resized and lives as long as the texture.
        let surface = unsafe { MappedSurface::new(data, texture.inner.pitch, desc.width, desc.height) }
            .ok_or_else(|| CaptureError::MapFailed("null mapping".into()))?;

        let mut stats = self.state.stats.lock();
        stats.maps += 1;
        stats.mapped_now += 1;
        Ok(surface)
    }

    fn unmap(&self, texture: &SoftTexture) {
        if texture.inner.mapped.swap(false, Ordering::SeqCst) {
            self.state.stats.lock().mapped_now -= 1;
        }
    }

    fn copy_region(
        &self,
        dst: &SoftTexture,
        dst_x: u32,
        dst_y: u32,
        src: &SoftTexture,
        src_rect: &Rect,
    ) {
        let (dx, dy) = (dst_x as i32, dst_y as i32);
        let (sd, dd) = (src.inner.desc, dst.inner.desc);

        if Arc::ptr_eq(&src.inner, &dst.inner) {
            let mut pixels = dst.inner.pixels.lock();
            let snapshot = pixels.clone();
            let from = Surface::new(&snapshot, src.inner.pitch, sd.width, sd.height);
            let mut to = SurfaceMut::new(&mut pixels, dst.inner.pitch, dd.width, dd.height);
            copy_rect_bgra(&mut to, dx, dy, &from, src_rect);
        } else {
            // Lock in id order so concurrent copies cannot deadlock
            let (src_pixels, mut dst_pixels) = if src.inner.id < dst.inner.id {
                let s = src.inner.pixels.lock();
                (s, dst.inner.pixels.lock())
            } else {
                let d = dst.inner.pixels.lock();
                (src.inner.pixels.lock(), d)
            };
            let from = Surface::new(&src_pixels, src.inner.pitch, sd.width, sd.height);
            let mut to = SurfaceMut::new(&mut dst_pixels, dst.inner.pitch, dd.width, dd.height);
            copy_rect_bgra(&mut to, dx, dy, &from, src_rect);
        }

        self.state.stats.lock().copies += 1;
        self.state.copies.lock().push(CopyRecord {
            dst: dst.inner.id,
            src: src.inner.id,
            dst_x,
            dst_y,
            src_rect: *src_rect,
        });
    }

    fn generate_mips(&self, _texture: &SoftTexture) {
        self.state.stats.lock().mips_generated += 1;
    }

    fn create_shared_texture(&self, desc: &TextureDesc) -> CaptureResult<SharedTexture<Self>> {
        let texture = self.allocate(desc, TextureUsage::Render)?;
        let lock = Arc::new(KeyedLock {
            released_with: Mutex::new(Some(crate::gpu::DUPE_KEY)),
            cond: Condvar::new(),
        });
        Ok(SharedTexture {
            handle: SoftSharedHandle {
                texture: texture.clone(),
                lock: Arc::clone(&lock),
            },
            mutex: SoftKeyedMutex { lock },
            texture,
        })
    }

    fn open_shared_texture(
        &self,
        handle: &SoftSharedHandle,
    ) -> CaptureResult<(SoftTexture, SoftKeyedMutex)> {
        if self.state.fail_allocations.load(Ordering::SeqCst) {
            return Err(CaptureError::AllocationFailed("injected failure".into()));
        }
        self.state.stats.lock().shared_opened += 1;
        Ok((
            handle.texture.clone(),
            SoftKeyedMutex {
                lock: Arc::clone(&handle.lock),
            },
        ))
    }
}

/// A scripted duplication frame.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFrame {
    /// Regions painted into the desktop image before the frame is handed out.
    pub paint: Vec<(Rect, u32)>,
    pub moves: Vec<MoveRect>,
    pub dirty: Vec<Rect>,

    /// False for a pointer-only update with no new desktop image.
    pub present: bool,

    /// Reported pointer position; `None` reports an invisible pointer at (0, 0).
    pub pointer: Option<PointerPosition>,

    /// New pointer shape.
    pub shape: Option<(PointerShapeInfo, Vec<u8>)>,

    pub protected_content: bool,
}

impl ScriptedFrame {
    /// A desktop update with the given dirty rects.
    pub fn dirty(rects: impl IntoIterator<Item = Rect>) -> Self {
        Self {
            dirty: rects.into_iter().collect(),
            present: true,
            ..Self::default()
        }
    }

    /// A pointer-only update.
    pub fn pointer(x: i32, y: i32) -> Self {
        Self {
            pointer: Some(PointerPosition { x, y, visible: true }),
            ..Self::default()
        }
    }

    pub fn with_paint(mut self, rect: Rect, value: u32) -> Self {
        self.paint.push((rect, value));
        self
    }

    pub fn with_moves(mut self, moves: impl IntoIterator<Item = MoveRect>) -> Self {
        self.moves.extend(moves);
        self
    }

    pub fn with_pointer(mut self, x: i32, y: i32) -> Self {
        self.pointer = Some(PointerPosition { x, y, visible: true });
        self
    }

    pub fn with_shape(mut self, info: PointerShapeInfo, bytes: Vec<u8>) -> Self {
        self.shape = Some((info, bytes));
        self
    }

    pub fn with_protected_content(mut self) -> Self {
        self.protected_content = true;
        self
    }
}

/// One step of a duplication script.
#[derive(Debug)]
pub enum ScriptStep {
    Timeout,
    Frame(ScriptedFrame),
    Fail(CaptureError),
}

#[derive(Debug, Default)]
struct ScriptState {
    steps: Mutex<VecDeque<ScriptStep>>,
    opens: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    timeouts: AtomicU64,
    global_cursor: Mutex<Option<GlobalCursor>>,
    desktop: Mutex<Option<SoftTexture>>,
}

/// Observes and feeds a [`ScriptedDuplication`] after it moved into a worker.
#[derive(Debug, Clone)]
pub struct ScriptProbe {
    state: Arc<ScriptState>,
}

impl ScriptProbe {
    pub fn push(&self, step: ScriptStep) {
        self.state.steps.lock().push_back(step);
    }

    pub fn remaining(&self) -> usize {
        self.state.steps.lock().len()
    }

    pub fn opens(&self) -> u64 {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn frames_acquired(&self) -> u64 {
        self.state.acquired.load(Ordering::SeqCst)
    }

    pub fn frames_released(&self) -> u64 {
        self.state.released.load(Ordering::SeqCst)
    }

    pub fn timeouts(&self) -> u64 {
        self.state.timeouts.load(Ordering::SeqCst)
    }

    pub fn set_global_cursor(&self, cursor: Option<GlobalCursor>) {
        *self.state.global_cursor.lock() = cursor;
    }

    /// The desktop image texture, once the session is open.
    pub fn desktop(&self) -> Option<SoftTexture> {
        self.state.desktop.lock().clone()
    }
}

/// A duplication session that replays a script.
///
/// When the script runs dry every acquire times out after a short sleep.
pub struct ScriptedDuplication {
    device: Option<SoftDevice>,
    desc: TextureDesc,
    desktop: Option<SoftTexture>,
    current: Option<ScriptedFrame>,
    open_failure: Option<CaptureError>,
    present_counter: i64,
    state: Arc<ScriptState>,
}

impl ScriptedDuplication {
    pub fn new(width: u32, height: u32, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        let state = ScriptState {
            steps: Mutex::new(steps.into_iter().collect()),
            ..ScriptState::default()
        };
        Self {
            device: None,
            desc: TextureDesc::bgra(width, height),
            desktop: None,
            current: None,
            open_failure: None,
            present_counter: 0,
            state: Arc::new(state),
        }
    }

    /// Makes the first [`DesktopSource::open`] fail with `error`.
    pub fn fail_open_with(mut self, error: CaptureError) -> Self {
        self.open_failure = Some(error);
        self
    }

    pub fn probe(&self) -> ScriptProbe {
        ScriptProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn idle(&self, timeout: Duration) {
        thread::sleep(timeout.min(Duration::from_millis(1)));
        self.state.timeouts.fetch_add(1, Ordering::SeqCst);
    }
}

impl DesktopSource<SoftDevice> for ScriptedDuplication {
    fn is_open(&self) -> bool {
        self.desktop.is_some()
    }

    fn open(&mut self, device: &SoftDevice) -> CaptureResult<()> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.open_failure.take() {
            return Err(error);
        }
        let desktop = device.create_texture(&self.desc, TextureUsage::Render)?;
        *self.state.desktop.lock() = Some(desktop.clone());
        self.desktop = Some(desktop);
        self.device = Some(device.clone());
        Ok(())
    }

    fn acquire_next_frame(
        &mut self,
        timeout: Duration,
    ) -> CaptureResult<Option<FrameInfo<SoftTexture>>> {
        let (Some(device), Some(desktop)) = (&self.device, &self.desktop) else {
            return Err(CaptureError::AccessLost);
        };

        let step = self.state.steps.lock().pop_front();
        let frame = match step {
            None | Some(ScriptStep::Timeout) => {
                self.idle(timeout);
                return Ok(None);
            }
            Some(ScriptStep::Fail(error)) => return Err(error),
            Some(ScriptStep::Frame(frame)) => frame,
        };

        for (rect, value) in &frame.paint {
            device.fill_rect(desktop, rect, *value);
        }

        self.present_counter += 1;
        let info = FrameInfo {
            desktop: frame.present.then(|| desktop.clone()),
            last_present_time: if frame.present { self.present_counter } else { 0 },
            last_mouse_update_time: if frame.pointer.is_some() || frame.shape.is_some() {
                self.present_counter
            } else {
                0
            },
            accumulated_frames: 1,
            protected_content_masked: frame.protected_content,
            pointer: frame.pointer.unwrap_or_default(),
            pointer_shape_size: frame.shape.as_ref().map_or(0, |(_, bytes)| bytes.len() as u32),
            metadata_size: (frame.moves.len() * 24 + frame.dirty.len() * 16) as u32,
        };
        trace!(moves = frame.moves.len(), dirty = frame.dirty.len(), "Scripted frame");

        self.current = Some(frame);
        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Some(info))
    }

    fn move_rects(&mut self, out: &mut Vec<MoveRect>) -> CaptureResult<()> {
        if let Some(frame) = &self.current {
            out.extend_from_slice(&frame.moves);
        }
        Ok(())
    }

    fn dirty_rects(&mut self, out: &mut Vec<Rect>) -> CaptureResult<()> {
        if let Some(frame) = &self.current {
            out.extend_from_slice(&frame.dirty);
        }
        Ok(())
    }

    fn pointer_shape(&mut self, shape: &mut PointerShape) -> CaptureResult<()> {
        if let Some((info, bytes)) = self.current.as_ref().and_then(|f| f.shape.as_ref()) {
            shape.update(*info, bytes);
        }
        Ok(())
    }

    fn release_frame(&mut self) {
        if self.current.take().is_some() {
            self.state.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn global_cursor(&self) -> Option<GlobalCursor> {
        *self.state.global_cursor.lock()
    }
}
