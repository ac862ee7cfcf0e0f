//! Per-monitor desktop duplication for the VR desktop.
//!
//! Every monitor gets a [`CaptureWorker`] with its own capture thread. The
//! thread polls the OS duplication API, tracks changed regions and the
//! cursor, and delivers frames into a render texture on the HMD device.
//! The GPU is abstracted behind [`GpuDevice`] and the OS behind
//! [`DesktopSource`]; the Direct3D 11 backend lives in [`d3d11`].

pub mod copy;
pub mod cursor;
pub mod duplication;
mod error;
pub mod gpu;
mod handoff;
pub mod pool;
pub mod rect;
pub mod staging;
mod worker;

#[cfg(windows)]
pub mod d3d11;

#[cfg(any(test, feature = "software"))]
pub mod software;

pub use cursor::{GlobalCursor, PointerPosition, PointerShape, PointerShapeInfo, PointerShapeType};
pub use duplication::{DesktopSource, FrameInfo};
pub use error::CaptureError;
pub use gpu::{GpuDevice, KeyedMutex, MapMode, TextureDesc, TextureUsage};
pub use rect::{FrameDelta, MoveRect, Rect};
pub use worker::{CaptureTarget, CaptureWorker, CrossAdapterWorker, SameAdapterWorker, WorkerKind};

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Mip levels of every render texture: full size plus one half-size level
/// for sampling at a distance.
pub const DUPLICATION_MIP_LEVELS: u32 = 2;
