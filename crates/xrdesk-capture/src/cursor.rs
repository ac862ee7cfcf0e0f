//! Hardware cursor compositing.
//!
//! Desktop duplication hands out the desktop image without the cursor, plus
//! the cursor shape and position as side data. The compositor keeps two
//! buffers per cycle: the desktop pixels under the cursor (so the next cycle
//! can erase it) and the same region with the cursor blended on top.

use tracing::trace;
use xrdesk_ipc::ScreenRect;

use crate::copy::Surface;
use crate::rect::Rect;

/// Cursor bitmap formats reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerShapeType {
    /// 1bpp AND mask followed by 1bpp XOR mask.
    Monochrome,
    /// 32bpp BGRA.
    Color,
    /// 32bpp BGR plus a mask bit in the top byte.
    MaskedColor,
}

impl PointerShapeType {
    /// Maps the DXGI `DXGI_OUTDUPL_POINTER_SHAPE_TYPE` value.
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Monochrome),
            2 => Some(Self::Color),
            4 => Some(Self::MaskedColor),
            _ => None,
        }
    }
}

/// Layout of a cursor bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerShapeInfo {
    pub shape_type: PointerShapeType,
    pub width: u32,
    /// For monochrome cursors this covers both masks, so twice the visible height.
    pub height: u32,
    pub pitch: u32,
    pub hot_spot: (i32, i32),
}

/// The most recent cursor bitmap.
#[derive(Debug, Clone, Default)]
pub struct PointerShape {
    info: Option<PointerShapeInfo>,
    buffer: Vec<u8>,
}

impl PointerShape {
    /// Replaces the bitmap. An empty `bytes` clears the shape.
    pub fn update(&mut self, info: PointerShapeInfo, bytes: &[u8]) {
        self.buffer.clear();
        self.buffer.extend_from_slice(bytes);
        self.info = (!bytes.is_empty()).then_some(info);
    }

    pub fn clear(&mut self) {
        self.info = None;
        self.buffer.clear();
    }

    pub fn info(&self) -> Option<&PointerShapeInfo> {
        self.info.as_ref()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.info.is_none()
    }

    /// Visible size of the cursor in pixels.
    pub fn visible_size(&self) -> Option<(u32, u32)> {
        self.info.map(|info| match info.shape_type {
            PointerShapeType::Monochrome => (info.width, info.height / 2),
            _ => (info.width, info.height),
        })
    }
}

/// Pointer position from the duplication frame info, in desktop texture coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointerPosition {
    pub x: i32,
    pub y: i32,
    pub visible: bool,
}

/// System cursor state in virtual desktop coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalCursor {
    pub x: i32,
    pub y: i32,
    pub showing: bool,
}

/// A rectangle of BGRA pixels at a desktop position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredCursor {
    pub rgba: Vec<u8>,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl StoredCursor {
    /// Sizes the buffer for a `width` x `height` image at (`x`, `y`).
    pub fn prepare_write(&mut self, x: i32, y: i32, width: u32, height: u32) {
        self.x = x;
        self.y = y;
        self.width = width;
        self.height = height;
        self.rgba.resize(width as usize * height as usize * 4, 0);
    }

    pub fn is_empty(&self) -> bool {
        self.rgba.is_empty()
    }

    /// Marks the buffer empty, keeping its allocation.
    pub fn clear(&mut self) {
        self.rgba.clear();
    }

    pub fn rect(&self) -> Rect {
        Rect::from_size(self.x, self.y, self.width, self.height)
    }

    pub fn pitch(&self) -> usize {
        self.width as usize * 4
    }

    /// A surface view of the stored pixels.
    pub fn surface(&self) -> Surface<'_> {
        Surface::new(&self.rgba, self.pitch(), self.width, self.height)
    }
}

/// Where the visible part of the cursor lands this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPlacement {
    /// Clipped destination in desktop texture coordinates.
    pub rect: Rect,

    /// Pixels clipped off the left/top of the cursor bitmap.
    pub offset_x: u32,
    pub offset_y: u32,
}

/// Tracks the cursor across capture cycles and composites it.
#[derive(Debug, Clone)]
pub struct CursorCompositor {
    under: [StoredCursor; 2],
    current: usize,
    cursor: StoredCursor,
    last_valid: (i32, i32),
    drag_threshold: i32,
}

impl CursorCompositor {
    pub fn new(drag_threshold: i32) -> Self {
        Self {
            under: [StoredCursor::default(), StoredCursor::default()],
            current: 0,
            cursor: StoredCursor::default(),
            last_valid: (0, 0),
            drag_threshold,
        }
    }

    /// Decides where to draw the cursor this cycle, or `None` to skip it.
    ///
    /// `global_cursor` is only queried when the duplication API did not
    /// report a visible pointer position.
    pub fn locate(
        &mut self,
        shape: &PointerShape,
        position: PointerPosition,
        desktop_width: u32,
        desktop_height: u32,
        monitor: &ScreenRect,
        global_cursor: impl FnOnce() -> Option<GlobalCursor>,
    ) -> Option<CursorPlacement> {
        let (width, height) = shape.visible_size()?;
        let (mut width, mut height) = (width as i32, height as i32);
        let (mut x, mut y) = (position.x, position.y);

        // A still cursor is reported as invisible at (0, 0)
        if !position.visible {
            if x != 0 || y != 0 {
                return None;
            }
            let global = global_cursor()?;
            if !global.showing {
                return None;
            }
            if global.x < monitor.left
                || global.x > monitor.right
                || global.y < monitor.top
                || global.y > monitor.bottom
            {
                return None;
            }

            // A large jump means a window is being dragged and owns the cursor
            let approx_x = global.x - monitor.left;
            let approx_y = global.y - monitor.top;
            if (approx_x - self.last_valid.0).abs() > self.drag_threshold
                || (approx_y - self.last_valid.1).abs() > self.drag_threshold
            {
                trace!(approx_x, approx_y, "Cursor looks dragged, skipping");
                return None;
            }

            // GetCursorInfo reports the hotspot, not the bitmap corner
            (x, y) = self.last_valid;
        }

        self.last_valid = (x, y);

        let (desktop_width, desktop_height) = (desktop_width as i32, desktop_height as i32);
        let mut offset_x = 0;
        let mut offset_y = 0;

        if x < 0 {
            offset_x = -x;
            if offset_x >= width {
                return None;
            }
            x = 0;
            width -= offset_x;
        } else if x + width > desktop_width {
            if x >= desktop_width {
                return None;
            }
            width = desktop_width - x;
        }

        if y < 0 {
            offset_y = -y;
            if offset_y >= height {
                return None;
            }
            y = 0;
            height -= offset_y;
        } else if y + height > desktop_height {
            if y >= desktop_height {
                return None;
            }
            height = desktop_height - y;
        }

        if width <= 0 || height <= 0 {
            return None;
        }

        Some(CursorPlacement {
            rect: Rect::new(x, y, x + width, y + height),
            offset_x: offset_x as u32,
            offset_y: offset_y as u32,
        })
    }

    /// Saves the pixels under the cursor and blends the cursor over them.
    ///
    /// `under` holds the desktop pixels; the cursor rect starts at
    /// (`src_x`, `src_y`) in it. Returns false if the shape bitmap is too
    /// short for the placement, in which case nothing is stored.
    pub fn composite(
        &mut self,
        shape: &PointerShape,
        placement: &CursorPlacement,
        under: &Surface<'_>,
        src_x: u32,
        src_y: u32,
    ) -> bool {
        let Some(info) = shape.info() else {
            return false;
        };
        let rect = placement.rect;
        let (width, height) = (rect.width() as usize, rect.height() as usize);
        if src_x as usize + width > under.width() as usize
            || src_y as usize + height > under.height() as usize
        {
            return false;
        }
        if !shape_covers(info, shape.bytes().len(), placement, width, height) {
            trace!(?info, "Pointer shape buffer too small, skipping cursor");
            return false;
        }

        let row_bytes = width * 4;
        let saved = &mut self.under[self.current];
        saved.prepare_write(rect.left, rect.top, width as u32, height as u32);
        for row in 0..height {
            let src = under.row(src_x, src_y + row as u32, width as u32);
            saved.rgba[row * row_bytes..(row + 1) * row_bytes].copy_from_slice(src);
        }

        let cursor = &mut self.cursor;
        cursor.prepare_write(rect.left, rect.top, width as u32, height as u32);

        let bytes = shape.bytes();
        let pitch = info.pitch as usize;
        let (ox, oy) = (placement.offset_x as usize, placement.offset_y as usize);

        for row in 0..height {
            let desktop = &saved.rgba[row * row_bytes..(row + 1) * row_bytes];
            let out = &mut cursor.rgba[row * row_bytes..(row + 1) * row_bytes];
            let shape_row = (oy + row) * pitch;

            match info.shape_type {
                PointerShapeType::Color => {
                    let src = &bytes[shape_row + ox * 4..shape_row + (ox + width) * 4];
                    blend_row(src, desktop, out, blend_color);
                }
                PointerShapeType::MaskedColor => {
                    let src = &bytes[shape_row + ox * 4..shape_row + (ox + width) * 4];
                    blend_row(src, desktop, out, blend_masked_color);
                }
                PointerShapeType::Monochrome => {
                    let xor_offset = (info.height / 2) as usize * pitch;
                    let and_row = &bytes[shape_row..];
                    let xor_row = &bytes[xor_offset + shape_row..];
                    blend_monochrome_row(and_row, xor_row, ox, desktop, out);
                }
            }
        }
        true
    }

    /// Locates and composites against a full desktop surface.
    pub fn update(
        &mut self,
        shape: &PointerShape,
        position: PointerPosition,
        desktop: &Surface<'_>,
        monitor: &ScreenRect,
        global_cursor: impl FnOnce() -> Option<GlobalCursor>,
    ) -> bool {
        let Some(placement) = self.locate(
            shape,
            position,
            desktop.width(),
            desktop.height(),
            monitor,
            global_cursor,
        ) else {
            return false;
        };
        let (x, y) = (placement.rect.left as u32, placement.rect.top as u32);
        self.composite(shape, &placement, desktop, x, y)
    }

    /// The cursor image to draw this cycle (empty if none).
    pub fn cursor_to_write(&self) -> &StoredCursor {
        &self.cursor
    }

    /// Desktop pixels that restore the previous cycle's cursor area (empty if none).
    pub fn cursor_to_erase(&self) -> &StoredCursor {
        &self.under[self.current ^ 1]
    }

    /// True if there is a cursor to erase or draw.
    pub fn has_pending(&self) -> bool {
        !self.cursor_to_erase().is_empty() || !self.cursor_to_write().is_empty()
    }

    /// Swaps the under-cursor slots and empties this cycle's output.
    pub fn finish_cycle(&mut self) {
        self.current ^= 1;
        self.under[self.current].clear();
        self.cursor.clear();
    }

    /// Forgets all cursor state, e.g. after the desktop texture was recreated.
    pub fn reset(&mut self) {
        self.under[0].clear();
        self.under[1].clear();
        self.cursor.clear();
    }
}

fn shape_covers(
    info: &PointerShapeInfo,
    len: usize,
    placement: &CursorPlacement,
    width: usize,
    height: usize,
) -> bool {
    if width == 0 || height == 0 {
        return false;
    }
    let pitch = info.pitch as usize;
    let (ox, oy) = (placement.offset_x as usize, placement.offset_y as usize);
    let last_row = (oy + height - 1) * pitch;
    let needed = match info.shape_type {
        PointerShapeType::Color | PointerShapeType::MaskedColor => last_row + (ox + width) * 4,
        PointerShapeType::Monochrome => {
            (info.height / 2) as usize * pitch + last_row + (ox + width).div_ceil(8)
        }
    };
    needed <= len
}

fn read_px(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn blend_row(cursor: &[u8], desktop: &[u8], out: &mut [u8], blend: fn(u32, u32) -> u32) {
    for ((c, d), o) in cursor
        .chunks_exact(4)
        .zip(desktop.chunks_exact(4))
        .zip(out.chunks_exact_mut(4))
    {
        o.copy_from_slice(&blend(read_px(c), read_px(d)).to_le_bytes());
    }
}

/// Cursor pixel wins when its alpha is at least 50%. No partial blending.
pub fn blend_color(cursor: u32, desktop: u32) -> u32 {
    if cursor >= 0x8000_0000 {
        cursor
    } else {
        desktop
    }
}

/// Desktop top bit clear: the desktop color forced opaque. Set: XOR the
/// cursor color into it.
pub fn blend_masked_color(cursor: u32, desktop: u32) -> u32 {
    if desktop < 0x8000_0000 {
        (desktop & 0x00FF_FFFF) | 0xFF00_0000
    } else {
        desktop ^ (cursor & 0x00FF_FFFF)
    }
}

/// Applies one AND/XOR bit pair to a desktop pixel.
pub fn blend_monochrome(and_bit: bool, xor_bit: bool, desktop: u32) -> u32 {
    let and_mask = if and_bit { 0xFFFF_FFFF } else { 0xFF00_0000 };
    let xor_mask = if xor_bit { 0x00FF_FFFF } else { 0 };
    (desktop & and_mask) ^ xor_mask
}

fn blend_monochrome_row(and_row: &[u8], xor_row: &[u8], skip_x: usize, desktop: &[u8], out: &mut [u8]) {
    let mut mask = 0x80u8 >> (skip_x % 8);
    let mut byte = skip_x / 8;

    for (d, o) in desktop.chunks_exact(4).zip(out.chunks_exact_mut(4)) {
        let and_bit = and_row[byte] & mask != 0;
        let xor_bit = xor_row[byte] & mask != 0;
        o.copy_from_slice(&blend_monochrome(and_bit, xor_bit, read_px(d)).to_le_bytes());

        mask = mask.rotate_right(1);
        if mask == 0x80 {
            byte += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MONITOR: ScreenRect = ScreenRect::new(0, 0, 1920, 1080);

    fn desktop(width: u32, height: u32, value: u32) -> Vec<u8> {
        value.to_le_bytes().repeat((width * height) as usize)
    }

    fn color_shape(width: u32, height: u32, value: u32) -> PointerShape {
        let mut shape = PointerShape::default();
        let info = PointerShapeInfo {
            shape_type: PointerShapeType::Color,
            width,
            height,
            pitch: width * 4,
            hot_spot: (0, 0),
        };
        shape.update(info, &value.to_le_bytes().repeat((width * height) as usize));
        shape
    }

    /// 8x8 monochrome cursor: AND plane all zero (black box), XOR plane all zero.
    fn mono_shape() -> PointerShape {
        let mut shape = PointerShape::default();
        let info = PointerShapeInfo {
            shape_type: PointerShapeType::Monochrome,
            width: 8,
            height: 16,
            pitch: 1,
            hot_spot: (0, 0),
        };
        shape.update(info, &[0u8; 16]);
        shape
    }

    fn visible(x: i32, y: i32) -> PointerPosition {
        PointerPosition { x, y, visible: true }
    }

    #[test]
    fn test_blend_color_is_binary() {
        assert_eq!(blend_color(0x80_112233, 0xFF_000000), 0x80_112233);
        assert_eq!(blend_color(0x7F_112233, 0xFF_445566), 0xFF_445566);
        assert_eq!(blend_color(0x00_000000, 0xFF_445566), 0xFF_445566);
    }

    #[test]
    fn test_blend_masked_color() {
        // Desktop top bit clear: desktop color, forced opaque, cursor ignored
        assert_eq!(blend_masked_color(0xFF_445566, 0x00_112233), 0xFF_112233);
        assert_eq!(blend_masked_color(0x00_FFFFFF, 0x7F_000000), 0xFF_000000);
        // Desktop top bit set: cursor RGB XORed into the desktop
        assert_eq!(blend_masked_color(0xFF_FFFFFF, 0xFF_0F0F0F), 0xFF_F0F0F0);
        assert_eq!(blend_masked_color(0x00_000000, 0xFF_123456), 0xFF_123456);
        assert_eq!(blend_masked_color(0x12_00FF00, 0x80_123456), 0x80_12CB56);
    }

    #[test]
    fn test_blend_monochrome_truth_table() {
        let d = 0xFF_123456;
        assert_eq!(blend_monochrome(false, false, d), 0xFF_000000); // black
        assert_eq!(blend_monochrome(false, true, d), 0xFF_FFFFFF); // white
        assert_eq!(blend_monochrome(true, false, d), d); // transparent
        assert_eq!(blend_monochrome(true, true, d), 0xFF_EDCBA9); // inverted
    }

    #[test]
    fn test_monochrome_row_honors_skip() {
        // AND bits 1010_1010, XOR bits 0000_0000, skipping the first 3 pixels
        let desktop = 0xFF_123456u32.to_le_bytes().repeat(5);
        let mut out = vec![0u8; 20];
        blend_monochrome_row(&[0b1010_1010], &[0], 3, &desktop, &mut out);
        let px: Vec<u32> = out.chunks_exact(4).map(read_px).collect();
        assert_eq!(px, vec![0xFF_000000, 0xFF_123456, 0xFF_000000, 0xFF_123456, 0xFF_000000]);
    }

    #[test]
    fn test_monochrome_row_crosses_byte_boundary() {
        let desktop = 0xFF_123456u32.to_le_bytes().repeat(4);
        let mut out = vec![0u8; 16];
        blend_monochrome_row(&[0b0000_0001, 0b1000_0000], &[0, 0b0100_0000], 6, &desktop, &mut out);
        let px: Vec<u32> = out.chunks_exact(4).map(read_px).collect();
        assert_eq!(px, vec![0xFF_000000, 0xFF_123456, 0xFF_123456, 0xFF_FFFFFF]);
    }

    #[test]
    fn test_color_cursor_composite() {
        let desk = desktop(16, 16, 0xFF_0000FF);
        let surface = Surface::new(&desk, 64, 16, 16);
        let shape = color_shape(4, 4, 0xFF_FF0000);
        let mut compositor = CursorCompositor::new(32);

        assert!(compositor.update(&shape, visible(2, 3), &surface, &MONITOR, || None));
        let drawn = compositor.cursor_to_write();
        assert_eq!(drawn.rect(), Rect::new(2, 3, 6, 7));
        assert!(drawn.rgba.chunks_exact(4).all(|p| read_px(p) == 0xFF_FF0000));
        assert!(compositor.cursor_to_erase().is_empty());
    }

    #[test]
    fn test_clips_cursor_at_top_left() {
        let desk = desktop(16, 16, 0xFF_000000);
        let surface = Surface::new(&desk, 64, 16, 16);
        let shape = color_shape(4, 4, 0xFF_FFFFFF);
        let mut compositor = CursorCompositor::new(32);

        let placement = compositor
            .locate(&shape, visible(-1, -3), 16, 16, &MONITOR, || None)
            .unwrap();
        assert_eq!(placement.rect, Rect::new(0, 0, 3, 1));
        assert_eq!((placement.offset_x, placement.offset_y), (1, 3));
        assert!(compositor.composite(&shape, &placement, &surface, 0, 0));

        // Fully off-screen
        assert!(compositor.locate(&shape, visible(-4, 0), 16, 16, &MONITOR, || None).is_none());
        assert!(compositor.locate(&shape, visible(16, 0), 16, 16, &MONITOR, || None).is_none());
    }

    #[test]
    fn test_clips_cursor_at_bottom_right() {
        let shape = color_shape(4, 4, 0xFF_FFFFFF);
        let mut compositor = CursorCompositor::new(32);
        let placement = compositor
            .locate(&shape, visible(14, 15), 16, 16, &MONITOR, || None)
            .unwrap();
        assert_eq!(placement.rect, Rect::new(14, 15, 16, 16));
        assert_eq!((placement.offset_x, placement.offset_y), (0, 0));
    }

    #[test]
    fn test_no_shape_means_no_cursor() {
        let mut compositor = CursorCompositor::new(32);
        let shape = PointerShape::default();
        assert!(compositor.locate(&shape, visible(5, 5), 16, 16, &MONITOR, || None).is_none());
    }

    #[test]
    fn test_hidden_cursor_reuses_last_position() {
        let shape = color_shape(4, 4, 0xFF_FFFFFF);
        let mut compositor = CursorCompositor::new(32);
        compositor.locate(&shape, visible(100, 100), 1920, 1080, &MONITOR, || None).unwrap();

        // Still cursor: hotspot query lands near the last position
        let global = GlobalCursor { x: 110, y: 95, showing: true };
        let placement = compositor
            .locate(&shape, PointerPosition::default(), 1920, 1080, &MONITOR, || Some(global))
            .unwrap();
        assert_eq!(placement.rect.left, 100);
        assert_eq!(placement.rect.top, 100);
    }

    #[test]
    fn test_hidden_cursor_drag_is_skipped() {
        let shape = color_shape(4, 4, 0xFF_FFFFFF);
        let mut compositor = CursorCompositor::new(32);
        compositor.locate(&shape, visible(100, 100), 1920, 1080, &MONITOR, || None).unwrap();

        let far = GlobalCursor { x: 133, y: 100, showing: true };
        let hidden = PointerPosition::default();
        assert!(compositor.locate(&shape, hidden, 1920, 1080, &MONITOR, || Some(far)).is_none());

        let edge = GlobalCursor { x: 132, y: 68, showing: true };
        assert!(compositor.locate(&shape, hidden, 1920, 1080, &MONITOR, || Some(edge)).is_some());
    }

    #[test]
    fn test_hidden_cursor_other_cases() {
        let shape = color_shape(4, 4, 0xFF_FFFFFF);
        let mut compositor = CursorCompositor::new(32);
        let hidden = PointerPosition::default();

        // Not showing
        let off = GlobalCursor { x: 0, y: 0, showing: false };
        assert!(compositor.locate(&shape, hidden, 1920, 1080, &MONITOR, || Some(off)).is_none());

        // On another monitor
        let other = GlobalCursor { x: 2500, y: 10, showing: true };
        assert!(compositor.locate(&shape, hidden, 1920, 1080, &MONITOR, || Some(other)).is_none());

        // Invisible but with a position: no pointer
        let moved = PointerPosition { x: 5, y: 5, visible: false };
        assert!(compositor.locate(&shape, moved, 1920, 1080, &MONITOR, || None).is_none());

        // Query failed
        assert!(compositor.locate(&shape, hidden, 1920, 1080, &MONITOR, || None).is_none());
    }

    #[test]
    fn test_monitor_offset_applies_to_drag_check() {
        let monitor = ScreenRect::new(1920, 0, 3840, 1080);
        let shape = color_shape(4, 4, 0xFF_FFFFFF);
        let mut compositor = CursorCompositor::new(32);
        compositor.locate(&shape, visible(10, 10), 1920, 1080, &monitor, || None).unwrap();

        let global = GlobalCursor { x: 1935, y: 20, showing: true };
        let hidden = PointerPosition::default();
        assert!(compositor.locate(&shape, hidden, 1920, 1080, &monitor, || Some(global)).is_some());
    }

    #[test]
    fn test_erase_follows_previous_draw() {
        let desk = desktop(300, 300, 0xFF_336699);
        let surface = Surface::new(&desk, 1200, 300, 300);
        let shape = mono_shape();
        let mut compositor = CursorCompositor::new(32);

        // Cycle N
        assert!(compositor.update(&shape, visible(50, 50), &surface, &MONITOR, || None));
        assert!(compositor.cursor_to_erase().is_empty());
        assert_eq!(compositor.cursor_to_write().rect(), Rect::new(50, 50, 58, 58));
        assert!(compositor
            .cursor_to_write()
            .rgba
            .chunks_exact(4)
            .all(|p| read_px(p) == 0xFF_000000));
        let drawn = compositor.cursor_to_write().rect();
        compositor.finish_cycle();

        // Cycle N+1
        assert!(compositor.update(&shape, visible(200, 200), &surface, &MONITOR, || None));
        assert_eq!(compositor.cursor_to_erase().rect(), drawn);
        assert!(compositor
            .cursor_to_erase()
            .rgba
            .chunks_exact(4)
            .all(|p| read_px(p) == 0xFF_336699));
        assert_eq!(compositor.cursor_to_write().rect(), Rect::new(200, 200, 208, 208));
        compositor.finish_cycle();

        // Cursor gone: only the erase remains
        assert!(!compositor.update(&shape, visible(400, 400), &surface, &MONITOR, || None));
        assert_eq!(compositor.cursor_to_erase().rect(), Rect::new(200, 200, 208, 208));
        assert!(compositor.cursor_to_write().is_empty());
        assert!(compositor.has_pending());
        compositor.finish_cycle();
        assert!(!compositor.has_pending());
    }

    #[test]
    fn test_short_shape_buffer_is_rejected() {
        let desk = desktop(16, 16, 0);
        let surface = Surface::new(&desk, 64, 16, 16);
        let mut shape = PointerShape::default();
        let info = PointerShapeInfo {
            shape_type: PointerShapeType::Color,
            width: 4,
            height: 4,
            pitch: 16,
            hot_spot: (0, 0),
        };
        shape.update(info, &[0xFF; 20]);
        let mut compositor = CursorCompositor::new(32);
        assert!(!compositor.update(&shape, visible(0, 0), &surface, &MONITOR, || None));
    }

    #[test]
    fn test_shape_type_from_raw() {
        assert_eq!(PointerShapeType::from_raw(1), Some(PointerShapeType::Monochrome));
        assert_eq!(PointerShapeType::from_raw(2), Some(PointerShapeType::Color));
        assert_eq!(PointerShapeType::from_raw(4), Some(PointerShapeType::MaskedColor));
        assert_eq!(PointerShapeType::from_raw(3), None);
    }
}
