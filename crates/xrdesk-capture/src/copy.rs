//! Pitched BGRA surface views and rectangle copies between them.

use crate::rect::Rect;

const BYTES_PER_PIXEL: usize = 4;

/// Read-only view of a pitched 32-bit surface.
#[derive(Debug, Clone, Copy)]
pub struct Surface<'a> {
    data: &'a [u8],
    pitch: usize,
    width: u32,
    height: u32,
}

impl<'a> Surface<'a> {
    pub fn new(data: &'a [u8], pitch: usize, width: u32, height: u32) -> Self {
        debug_assert!(pitch >= width as usize * BYTES_PER_PIXEL);
        debug_assert!(height == 0 || data.len() >= pitch * (height as usize - 1) + width as usize * 4);
        Self {
            data,
            pitch,
            width,
            height,
        }
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

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }

    /// Bytes of row `y` starting at column `x`, `width` pixels long.
    pub fn row(&self, x: u32, y: u32, width: u32) -> &'a [u8] {
        let start = y as usize * self.pitch + x as usize * BYTES_PER_PIXEL;
        &self.data[start..start + width as usize * BYTES_PER_PIXEL]
    }

    /// Reads one pixel as a little-endian `u32`.
    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        let row = self.row(x, y, 1);
        u32::from_le_bytes([row[0], row[1], row[2], row[3]])
    }
}

/// Mutable view of a pitched 32-bit surface.
#[derive(Debug)]
pub struct SurfaceMut<'a> {
    data: &'a mut [u8],
    pitch: usize,
    width: u32,
    height: u32,
}

impl<'a> SurfaceMut<'a> {
    pub fn new(data: &'a mut [u8], pitch: usize, width: u32, height: u32) -> Self {
        debug_assert!(pitch >= width as usize * BYTES_PER_PIXEL);
        debug_assert!(height == 0 || data.len() >= pitch * (height as usize - 1) + width as usize * 4);
        Self {
            data,
            pitch,
            width,
            height,
        }
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

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }

    pub fn as_surface(&self) -> Surface<'_> {
        Surface::new(&*self.data, self.pitch, self.width, self.height)
    }

    pub fn row_mut(&mut self, x: u32, y: u32, width: u32) -> &mut [u8] {
        let start = y as usize * self.pitch + x as usize * BYTES_PER_PIXEL;
        &mut self.data[start..start + width as usize * BYTES_PER_PIXEL]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, value: u32) {
        self.row_mut(x, y, 1).copy_from_slice(&value.to_le_bytes());
    }

    pub fn fill(&mut self, value: u32) {
        let (width, height) = (self.width, self.height);
        for y in 0..height {
            for px in self.row_mut(0, y, width).chunks_exact_mut(BYTES_PER_PIXEL) {
                px.copy_from_slice(&value.to_le_bytes());
            }
        }
    }
}

/// Copies `src_rect` of `src` to (`dst_x`, `dst_y`) of `dst`.
///
/// The region is clipped against both surfaces. Returns the destination
/// rectangle actually written, or `None` if nothing overlapped.
pub fn copy_rect_bgra(
    dst: &mut SurfaceMut<'_>,
    dst_x: i32,
    dst_y: i32,
    src: &Surface<'_>,
    src_rect: &Rect,
) -> Option<Rect> {
    let src_clip = src_rect.intersect(&src.bounds())?;
    let dx = dst_x + (src_clip.left - src_rect.left);
    let dy = dst_y + (src_clip.top - src_rect.top);
    let dst_rect = Rect::from_size(dx, dy, src_clip.width() as u32, src_clip.height() as u32)
        .intersect(&dst.bounds())?;

    let sx = src_clip.left + (dst_rect.left - dx);
    let sy = src_clip.top + (dst_rect.top - dy);
    let row_bytes = dst_rect.width() as usize * BYTES_PER_PIXEL;
    let rows = dst_rect.height() as usize;

    let src_offset = sy as usize * src.pitch + sx as usize * BYTES_PER_PIXEL;
    let dst_offset = dst_rect.top as usize * dst.pitch + dst_rect.left as usize * BYTES_PER_PIXEL;
    let src_len = (rows - 1) * src.pitch + row_bytes;
    let dst_len = (rows - 1) * dst.pitch + row_bytes;

    copy_2d(
        &mut dst.data[dst_offset..dst_offset + dst_len],
        dst.pitch,
        &src.data[src_offset..src_offset + src_len],
        src.pitch,
        row_bytes,
        rows,
    );
    Some(dst_rect)
}

/// Copies `rows` rows of `row_bytes` bytes between pitched buffers.
///
/// Uses 32-byte streaming loads/stores when both buffers and both pitches
/// are 32-byte aligned and rows are at least 64 bytes wide; mapped staging
/// memory is write-combined, so bypassing the cache matters for 4K copies.
pub fn copy_2d(
    dst: &mut [u8],
    dst_pitch: usize,
    src: &[u8],
    src_pitch: usize,
    row_bytes: usize,
    rows: usize,
) {
    if rows == 0 || row_bytes == 0 {
        return;
    }
    assert!(src.len() >= (rows - 1) * src_pitch + row_bytes);
    assert!(dst.len() >= (rows - 1) * dst_pitch + row_bytes);

    #[cfg(target_arch = "x86_64")]
    {
        if stream_copy_eligible(dst.as_ptr(), dst_pitch, src.as_ptr(), src_pitch, row_bytes)
            && std::arch::is_x86_feature_detected!("avx2")
        {
            // SAFETY: bounds asserted above, alignment checked, AVX2 detected.
            unsafe {
                stream::copy_2d_avx2(
                    dst.as_mut_ptr(),
                    dst_pitch,
                    src.as_ptr(),
                    src_pitch,
                    row_bytes,
                    rows,
                );
            }
            return;
        }
    }

    if row_bytes == src_pitch && row_bytes == dst_pitch {
        let total = row_bytes * rows;
        dst[..total].copy_from_slice(&src[..total]);
        return;
    }
    for row in 0..rows {
        let s = row * src_pitch;
        let d = row * dst_pitch;
        dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
    }
}

/// Returns true if the streaming copy path applies to these buffers.
pub fn stream_copy_eligible(
    dst: *const u8,
    dst_pitch: usize,
    src: *const u8,
    src_pitch: usize,
    row_bytes: usize,
) -> bool {
    (dst as usize) % 32 == 0
        && (src as usize) % 32 == 0
        && dst_pitch % 32 == 0
        && src_pitch % 32 == 0
        && row_bytes >= 64
}

#[cfg(target_arch = "x86_64")]
mod stream {
    use std::arch::x86_64::{
        __m256i, _mm256_stream_load_si256, _mm256_stream_si256, _mm_sfence,
    };

    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn copy_2d_avx2(
        dst: *mut u8,
        dst_pitch: usize,
        src: *const u8,
        src_pitch: usize,
        row_bytes: usize,
        rows: usize,
    ) {
        let blocks = row_bytes / 64;
        let tail = row_bytes % 64;

        for row in 0..rows {
            let mut s = src.add(row * src_pitch);
            let mut d = dst.add(row * dst_pitch);

            for _ in 0..blocks {
                let a = _mm256_stream_load_si256(s as *const __m256i);
                let b = _mm256_stream_load_si256(s.add(32) as *const __m256i);
                _mm256_stream_si256(d as *mut __m256i, a);
                _mm256_stream_si256(d.add(32) as *mut __m256i, b);
                s = s.add(64);
                d = d.add(64);
            }
            if tail > 0 {
                std::ptr::copy_nonoverlapping(s, d, tail);
            }
        }

        _mm_sfence();
    }
}
