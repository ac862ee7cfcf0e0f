//! DXGI output duplication as a [`DesktopSource`].

use std::ffi::c_void;
use std::mem;
use std::time::Duration;

use tracing::{debug, warn};
use windows::core::Interface;
use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D11::ID3D11Texture2D;
use windows::Win32::Graphics::Dxgi::{
    IDXGIOutput1, IDXGIOutputDuplication, IDXGIResource, DXGI_ERROR_WAIT_TIMEOUT,
    DXGI_OUTDUPL_FRAME_INFO, DXGI_OUTDUPL_MOVE_RECT, DXGI_OUTDUPL_POINTER_SHAPE_INFO,
};
use windows::Win32::UI::WindowsAndMessaging::{GetCursorInfo, CURSORINFO, CURSOR_SHOWING};

use super::device::{D3D11Device, D3D11Texture};
use crate::cursor::{GlobalCursor, PointerPosition, PointerShape, PointerShapeInfo, PointerShapeType};
use crate::duplication::{DesktopSource, FrameInfo};
use crate::rect::{MoveRect, Rect};
use crate::CaptureResult;

/// Duplication of one DXGI output.
pub struct DxgiDuplication {
    output: IDXGIOutput1,
    duplication: Option<IDXGIOutputDuplication>,
    frame: Option<DXGI_OUTDUPL_FRAME_INFO>,
    moves: Vec<DXGI_OUTDUPL_MOVE_RECT>,
    dirty: Vec<RECT>,
}

// SAFETY: the session is created and used by its capture thread only.
unsafe impl Send for DxgiDuplication {}

impl DxgiDuplication {
    pub fn new(output: IDXGIOutput1) -> Self {
        Self {
            output,
            duplication: None,
            frame: None,
            moves: Vec::new(),
            dirty: Vec::new(),
        }
    }

    fn session(&self) -> CaptureResult<&IDXGIOutputDuplication> {
        self.duplication.as_ref().ok_or(crate::CaptureError::AccessLost)
    }

    fn metadata_size(&self) -> u32 {
        self.frame.map_or(0, |f| f.TotalMetadataBufferSize)
    }
}

fn to_rect(r: &RECT) -> Rect {
    Rect::new(r.left, r.top, r.right, r.bottom)
}

impl DesktopSource<D3D11Device> for DxgiDuplication {
    fn is_open(&self) -> bool {
        self.duplication.is_some()
    }

    fn open(&mut self, device: &D3D11Device) -> CaptureResult<()> {
        let duplication = unsafe { self.output.DuplicateOutput(device.device()) }?;
        self.duplication = Some(duplication);
        Ok(())
    }

    fn acquire_next_frame(
        &mut self,
        timeout: Duration,
    ) -> CaptureResult<Option<FrameInfo<D3D11Texture>>> {
        let session = self.session()?;
        let ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;

        match unsafe { session.AcquireNextFrame(ms, &mut info, &mut resource) } {
            Ok(()) => {}
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        self.frame = Some(info);

        let desktop = match resource.map(|r| r.cast::<ID3D11Texture2D>()).transpose() {
            Ok(texture) => texture.map(D3D11Texture),
            Err(e) => {
                self.release_frame();
                return Err(e.into());
            }
        };

        let position = info.PointerPosition;
        Ok(Some(FrameInfo {
            desktop,
            last_present_time: info.LastPresentTime,
            last_mouse_update_time: info.LastMouseUpdateTime,
            accumulated_frames: info.AccumulatedFrames,
            protected_content_masked: info.ProtectedContentMaskedOut.as_bool(),
            pointer: PointerPosition {
                x: position.Position.x,
                y: position.Position.y,
                visible: position.Visible.as_bool(),
            },
            pointer_shape_size: info.PointerShapeBufferSize,
            metadata_size: info.TotalMetadataBufferSize,
        }))
    }

    fn move_rects(&mut self, out: &mut Vec<MoveRect>) -> CaptureResult<()> {
        let size = self.metadata_size();
        if size == 0 {
            return Ok(());
        }
        let capacity = size as usize / mem::size_of::<DXGI_OUTDUPL_MOVE_RECT>();
        self.moves.resize(capacity.max(1), DXGI_OUTDUPL_MOVE_RECT::default());

        let mut required = 0u32;
        let session = self.duplication.as_ref().ok_or(crate::CaptureError::AccessLost)?;
        unsafe {
            session.GetFrameMoveRects(
                (self.moves.len() * mem::size_of::<DXGI_OUTDUPL_MOVE_RECT>()) as u32,
                self.moves.as_mut_ptr(),
                &mut required,
            )
        }?;

        let count = required as usize / mem::size_of::<DXGI_OUTDUPL_MOVE_RECT>();
        out.extend(self.moves[..count].iter().map(|mv| {
            MoveRect::new(mv.SourcePoint.x, mv.SourcePoint.y, to_rect(&mv.DestinationRect))
        }));
        Ok(())
    }

    fn dirty_rects(&mut self, out: &mut Vec<Rect>) -> CaptureResult<()> {
        let size = self.metadata_size();
        if size == 0 {
            return Ok(());
        }
        let capacity = size as usize / mem::size_of::<RECT>();
        self.dirty.resize(capacity.max(1), RECT::default());

        let mut required = 0u32;
        let session = self.duplication.as_ref().ok_or(crate::CaptureError::AccessLost)?;
        unsafe {
            session.GetFrameDirtyRects(
                (self.dirty.len() * mem::size_of::<RECT>()) as u32,
                self.dirty.as_mut_ptr(),
                &mut required,
            )
        }?;

        let count = required as usize / mem::size_of::<RECT>();
        out.extend(self.dirty[..count].iter().map(to_rect));
        Ok(())
    }

    fn pointer_shape(&mut self, shape: &mut PointerShape) -> CaptureResult<()> {
        let size = self.frame.map_or(0, |f| f.PointerShapeBufferSize);
        if size == 0 {
            return Ok(());
        }
        let session = self.session()?;

        let mut buffer = vec![0u8; size as usize];
        let mut required = 0u32;
        let mut info = DXGI_OUTDUPL_POINTER_SHAPE_INFO::default();
        unsafe {
            session.GetFramePointerShape(
                size,
                buffer.as_mut_ptr() as *mut c_void,
                &mut required,
                &mut info,
            )
        }?;
        buffer.truncate(required as usize);

        let Some(shape_type) = PointerShapeType::from_raw(info.Type) else {
            warn!(shape_type = info.Type, "Unknown pointer shape type");
            return Ok(());
        };
        shape.update(
            PointerShapeInfo {
                shape_type,
                width: info.Width,
                height: info.Height,
                pitch: info.Pitch,
                hot_spot: (info.HotSpot.x, info.HotSpot.y),
            },
            &buffer,
        );
        Ok(())
    }

    fn release_frame(&mut self) {
        if self.frame.take().is_none() {
            return;
        }
        if let Some(session) = &self.duplication {
            if let Err(e) = unsafe { session.ReleaseFrame() } {
                debug!(error = %e, "ReleaseFrame failed");
            }
        }
    }

    fn global_cursor(&self) -> Option<GlobalCursor> {
        let mut info = CURSORINFO {
            cbSize: mem::size_of::<CURSORINFO>() as u32,
            ..Default::default()
        };
        unsafe { GetCursorInfo(&mut info) }.ok()?;
        Some(GlobalCursor {
            x: info.ptScreenPos.x,
            y: info.ptScreenPos.y,
            showing: info.flags.0 & CURSOR_SHOWING.0 != 0,
        })
    }
}
