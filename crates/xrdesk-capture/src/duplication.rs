//! The OS desktop duplication interface the capture threads poll.

use std::marker::PhantomData;
use std::time::Duration;

use crate::cursor::{GlobalCursor, PointerPosition, PointerShape};
use crate::gpu::GpuDevice;
use crate::rect::{MoveRect, Rect};
use crate::CaptureResult;

/// Per-frame information returned by [`DesktopSource::acquire_next_frame`].
#[derive(Debug, Clone)]
pub struct FrameInfo<T> {
    /// The desktop image, when the OS handed one out.
    pub desktop: Option<T>,

    /// Non-zero when the desktop image changed.
    pub last_present_time: i64,

    /// Non-zero when the pointer shape or position changed.
    pub last_mouse_update_time: i64,

    /// Frames the OS coalesced into this one.
    pub accumulated_frames: u32,

    /// Protected content was blacked out in this frame.
    pub protected_content_masked: bool,

    pub pointer: PointerPosition,

    /// Size of the new pointer shape, zero if the shape did not change.
    pub pointer_shape_size: u32,

    /// Bytes needed to read the move and dirty rects.
    pub metadata_size: u32,
}

impl<T> Default for FrameInfo<T> {
    fn default() -> Self {
        Self {
            desktop: None,
            last_present_time: 0,
            last_mouse_update_time: 0,
            accumulated_frames: 0,
            protected_content_masked: false,
            pointer: PointerPosition::default(),
            pointer_shape_size: 0,
            metadata_size: 0,
        }
    }
}

impl<T> FrameInfo<T> {
    /// True if a new desktop image came with this frame.
    pub fn screen_updated(&self) -> bool {
        self.last_present_time != 0 && self.desktop.is_some()
    }

    /// True if the pointer moved or changed shape.
    pub fn pointer_updated(&self) -> bool {
        self.last_mouse_update_time != 0
    }
}

/// One monitor's duplication session.
///
/// Mirrors the OS call sequence: open once, then acquire a frame, read its
/// metadata and release it. Only the acquire timeout is non-fatal; it is
/// reported as `Ok(None)`.
pub trait DesktopSource<G: GpuDevice>: Send + 'static {
    /// True once [`DesktopSource::open`] succeeded.
    fn is_open(&self) -> bool;

    /// Obtains the exclusive duplication handle for the output.
    fn open(&mut self, device: &G) -> CaptureResult<()>;

    /// Waits up to `timeout` for the next frame.
    fn acquire_next_frame(&mut self, timeout: Duration)
        -> CaptureResult<Option<FrameInfo<G::Texture>>>;

    /// Move rects of the acquired frame, appended to `out`.
    fn move_rects(&mut self, out: &mut Vec<MoveRect>) -> CaptureResult<()>;

    /// Dirty rects of the acquired frame, appended to `out`.
    fn dirty_rects(&mut self, out: &mut Vec<Rect>) -> CaptureResult<()>;

    /// Reads the new pointer shape of the acquired frame.
    fn pointer_shape(&mut self, shape: &mut PointerShape) -> CaptureResult<()>;

    /// Returns the acquired frame to the OS.
    fn release_frame(&mut self);

    /// System cursor position in virtual desktop coordinates.
    fn global_cursor(&self) -> Option<GlobalCursor>;
}

/// An acquired frame that is released back to the OS when dropped.
pub struct AcquiredFrame<'a, G: GpuDevice, S: DesktopSource<G>> {
    source: &'a mut S,
    info: FrameInfo<G::Texture>,
    _device: PhantomData<G>,
}

impl<'a, G: GpuDevice, S: DesktopSource<G>> AcquiredFrame<'a, G, S> {
    /// Acquires the next frame, or `None` on timeout.
    pub fn acquire(source: &'a mut S, timeout: Duration) -> CaptureResult<Option<Self>> {
        Ok(source.acquire_next_frame(timeout)?.map(|info| Self {
            source,
            info,
            _device: PhantomData,
        }))
    }

    pub fn info(&self) -> &FrameInfo<G::Texture> {
        &self.info
    }

    pub fn source(&mut self) -> &mut S {
        self.source
    }
}

impl<G: GpuDevice, S: DesktopSource<G>> Drop for AcquiredFrame<'_, G, S> {
    fn drop(&mut self) {
        // The desktop resource must not outlive the frame
        self.info.desktop = None;
        self.source.release_frame();
    }
}
