//! Per-monitor capture workers.
//!
//! Each worker owns one background thread that polls the duplication API
//! and one render-side half that the host drives once per HMD frame. The
//! two halves meet in a [`FrameHandoff`]; at most one frame is in flight.

mod cross_adapter;
mod same_adapter;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};
use xrdesk_ipc::{CaptureConfig, CaptureState, MonitorDescriptor};

pub use cross_adapter::CrossAdapterWorker;
pub use same_adapter::SameAdapterWorker;

use crate::cursor::PointerShape;
use crate::duplication::{AcquiredFrame, DesktopSource};
use crate::gpu::{GpuDevice, TextureDesc, TextureUsage};
use crate::handoff::{Delivery, FrameHandoff};
use crate::rect::FrameDelta;
use crate::{CaptureError, CaptureResult, DUPLICATION_MIP_LEVELS};

/// A monitor plus what is needed to duplicate it.
pub struct CaptureTarget<G: GpuDevice, S: DesktopSource<G>> {
    pub descriptor: MonitorDescriptor,

    /// Device created on the adapter that drives the monitor.
    pub device: G,

    pub source: S,
}

/// Which copy strategy a worker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Capture and render devices are on different adapters; frames travel through CPU memory.
    CrossAdapter,

    /// Both devices share an adapter; frames travel through a keyed-mutex shared texture.
    SameAdapter,
}

/// State shared between a worker's capture thread and its render-side half.
#[derive(Debug)]
pub(crate) struct WorkerShared {
    pub monitor_index: usize,
    pub handoff: FrameHandoff,
    terminated: AtomicBool,
    capture_failure: AtomicBool,
    protected_content_masked: AtomicBool,
    rendering_falling_behind: AtomicBool,
    state: Mutex<CaptureState>,
    stall_threshold: Duration,
}

impl WorkerShared {
    pub fn new(monitor_index: usize, stall_threshold: Duration) -> Self {
        Self {
            monitor_index,
            handoff: FrameHandoff::new(),
            terminated: AtomicBool::new(false),
            capture_failure: AtomicBool::new(false),
            protected_content_masked: AtomicBool::new(false),
            rendering_falling_behind: AtomicBool::new(false),
            state: Mutex::new(CaptureState::default()),
            stall_threshold,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn capture_failure(&self) -> bool {
        self.capture_failure.load(Ordering::Acquire)
    }

    pub fn rendering_falling_behind(&self) -> bool {
        self.rendering_falling_behind.load(Ordering::Relaxed)
    }

    pub fn protected_content_masked(&self) -> bool {
        self.protected_content_masked.load(Ordering::Relaxed)
    }

    pub fn set_protected_content_masked(&self, masked: bool) {
        self.protected_content_masked.store(masked, Ordering::Relaxed);
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock()
    }

    pub fn set_state(&self, next: CaptureState) {
        let mut state = self.state.lock();
        if *state != next && state.can_transition_to(next) {
            trace!(from = state.name(), to = next.name(), "Capture state");
            *state = next;
        }
    }

    /// Marks the worker failed. Only the first call has any effect.
    ///
    /// Returns true if this call recorded the failure.
    pub fn on_capture_failure(&self) -> bool {
        if self.capture_failure.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.set_state(CaptureState::Failed);
        self.terminated.store(true, Ordering::Release);
        self.handoff.wake();
        error!(
            monitor = self.monitor_index,
            "Unrecoverable desktop capture failure encountered"
        );
        true
    }

    /// Asks the capture thread to stop without waiting for it.
    pub fn start_shutdown(&self) {
        self.terminated.store(true, Ordering::Release);
        self.handoff.wake();
    }

    /// Publishes the prepared frame and parks until the render side consumed it.
    ///
    /// Returns false if the worker was terminated while waiting.
    pub fn deliver(&self) -> bool {
        self.set_state(CaptureState::FrameReady);
        match self.handoff.deliver(&self.terminated) {
            Delivery::Consumed { waited } => {
                let behind = waited > self.stall_threshold;
                let was_behind = self.rendering_falling_behind.swap(behind, Ordering::Relaxed);
                if behind && !was_behind {
                    warn!(
                        monitor = self.monitor_index,
                        waited_ms = waited.as_millis() as u64,
                        "Rendering is falling behind desktop capture"
                    );
                }
                true
            }
            Delivery::Terminated => false,
        }
    }
}

/// One iteration of a capture thread's loop.
pub(crate) trait CaptureLoop: Send + 'static {
    /// Runs one poll cycle. An error ends the thread and fails the worker.
    fn cycle(&mut self) -> CaptureResult<()>;
}

/// Spawns the named capture thread running `capture` until termination.
///
/// Errors and panics inside the loop are turned into a capture failure;
/// nothing propagates out of the thread.
pub(crate) fn spawn_capture_thread<L: CaptureLoop>(
    shared: Arc<WorkerShared>,
    mut capture: L,
) -> CaptureResult<JoinHandle<()>> {
    let name = format!("xrdesk-capture-{}", shared.monitor_index);
    let handle = thread::Builder::new().name(name).spawn(move || {
        debug!(monitor = shared.monitor_index, "Capture thread started");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            while !shared.is_terminated() {
                if let Err(e) = capture.cycle() {
                    debug!(error = %e, "Capture cycle failed: stopping desktop duplication");
                    shared.on_capture_failure();
                    break;
                }
            }
        }));
        if outcome.is_err() {
            error!(monitor = shared.monitor_index, "Capture thread panicked");
            shared.on_capture_failure();
        }

        shared.set_state(CaptureState::Terminated);
        debug!(monitor = shared.monitor_index, "Capture thread exiting");
    })?;
    Ok(handle)
}

/// Opens the duplication session if needed, logging the actionable case apart.
pub(crate) fn ensure_open<G: GpuDevice, S: DesktopSource<G>>(
    source: &mut S,
    device: &G,
    shared: &WorkerShared,
) -> CaptureResult<()> {
    if source.is_open() {
        return Ok(());
    }
    match source.open(device) {
        Ok(()) => {
            info!(monitor = shared.monitor_index, "Desktop duplication started");
            shared.set_state(CaptureState::Polling);
            Ok(())
        }
        Err(e) if e.is_duplication_unavailable() => {
            error!(
                monitor = shared.monitor_index,
                "DuplicateOutput failed: too many applications are using desktop duplication"
            );
            Err(e)
        }
        Err(e) => {
            warn!(monitor = shared.monitor_index, error = %e, "DuplicateOutput failed");
            Err(e)
        }
    }
}

/// Reads the new pointer shape of `frame`, if it has one.
///
/// A failed read keeps the previous shape.
pub(crate) fn read_pointer_shape<G: GpuDevice, S: DesktopSource<G>>(
    frame: &mut AcquiredFrame<'_, G, S>,
    shape: &mut PointerShape,
) {
    if !frame.info().pointer_updated() || frame.info().pointer_shape_size == 0 {
        return;
    }
    if let Err(e) = frame.source().pointer_shape(shape) {
        warn!(error = %e, "GetFramePointerShape failed");
    }
}

/// Fills `delta` with the rects of `frame`.
///
/// The first frame after (re)creating the destination is one full-desktop
/// dirty rect. Dirty rects are widened by `expansion` and clamped to `desc`.
pub(crate) fn read_delta<G: GpuDevice, S: DesktopSource<G>>(
    frame: &mut AcquiredFrame<'_, G, S>,
    first_frame: &mut bool,
    desc: &TextureDesc,
    expansion: u32,
    delta: &mut FrameDelta,
) -> CaptureResult<()> {
    delta.clear();
    if std::mem::take(first_frame) {
        info!(width = desc.width, height = desc.height, "Copying whole screen on the first capture");
        delta.set_full(desc.width, desc.height);
        return Ok(());
    }

    frame.source().move_rects(&mut delta.moves)?;
    frame.source().dirty_rects(&mut delta.dirty)?;
    delta.expand_dirty(expansion, desc.width, desc.height);
    delta.clip_to(desc.width, desc.height);
    Ok(())
}

/// The texture the host samples; recreated when the desktop shape changes.
pub(crate) struct RenderTarget<G: GpuDevice> {
    device: G,
    texture: Option<G::Texture>,
    desc: Option<TextureDesc>,
}

impl<G: GpuDevice> RenderTarget<G> {
    pub fn new(device: G) -> Self {
        Self {
            device,
            texture: None,
            desc: None,
        }
    }

    pub fn device(&self) -> &G {
        &self.device
    }

    /// Returns a render texture matching `desktop`, creating it if needed.
    pub fn ensure(&mut self, desktop: &TextureDesc) -> CaptureResult<G::Texture> {
        if let (Some(texture), Some(desc)) = (&self.texture, &self.desc) {
            if desc.same_shape(desktop) {
                return Ok(texture.clone());
            }
        }

        info!(width = desktop.width, height = desktop.height, "Recreating render texture");
        self.texture = None;
        self.desc = None;

        let desc = desktop.with_mip_levels(DUPLICATION_MIP_LEVELS);
        let texture = self.device.create_texture(&desc, TextureUsage::Render)?;
        self.texture = Some(texture.clone());
        self.desc = Some(desc);
        Ok(texture)
    }

    pub fn texture(&self) -> Option<&G::Texture> {
        self.texture.as_ref()
    }

    pub fn desc(&self) -> Option<&TextureDesc> {
        self.desc.as_ref()
    }
}

/// Parts common to both worker variants.
pub(crate) struct WorkerCore<G: GpuDevice> {
    pub descriptor: MonitorDescriptor,
    pub shared: Arc<WorkerShared>,
    pub render: RenderTarget<G>,
    thread: Option<JoinHandle<()>>,
}

impl<G: GpuDevice> WorkerCore<G> {
    pub fn new(descriptor: MonitorDescriptor, vr_device: G, config: &CaptureConfig) -> Self {
        let shared = Arc::new(WorkerShared::new(
            descriptor.index,
            config.render_stall_threshold(),
        ));
        Self {
            descriptor,
            shared,
            render: RenderTarget::new(vr_device),
            thread: None,
        }
    }

    pub fn spawn<L: CaptureLoop>(&mut self, capture: L) -> CaptureResult<()> {
        self.thread = Some(spawn_capture_thread(Arc::clone(&self.shared), capture)?);
        Ok(())
    }

    /// Handles an error raised while copying a frame on the render side.
    ///
    /// Resource pressure only skips the frame; anything else fails the worker.
    pub fn on_render_error(&self, error: &CaptureError) {
        if error.is_retryable() {
            warn!(monitor = self.descriptor.index, error = %error, "Skipping frame");
        } else {
            error!(monitor = self.descriptor.index, error = %error, "Render-side copy failed");
            self.shared.on_capture_failure();
        }
    }

    pub fn shutdown(&mut self) {
        self.shared.start_shutdown();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!(monitor = self.descriptor.index, "Capture thread join failed");
            }
        }
    }
}

impl<G: GpuDevice> Drop for WorkerCore<G> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One monitor's capture pipeline, with the strategy picked at construction.
pub enum CaptureWorker<G: GpuDevice> {
    CrossAdapter(CrossAdapterWorker<G>),
    SameAdapter(SameAdapterWorker<G>),
}

impl<G: GpuDevice> CaptureWorker<G> {
    /// Starts capturing `target`, delivering into textures on `vr_device`.
    ///
    /// Picks the same-adapter strategy when the monitor's adapter is the HMD's.
    #[instrument(name = "capture_worker_start", skip_all, fields(monitor = target.descriptor.index))]
    pub fn start<S: DesktopSource<G>>(
        target: CaptureTarget<G, S>,
        vr_device: &G,
        config: &CaptureConfig,
    ) -> CaptureResult<Self> {
        let same_adapter = target.device.adapter_luid() == vr_device.adapter_luid();
        info!(
            name = %target.descriptor.name,
            adapter = %target.descriptor.adapter,
            same_adapter,
            "Starting capture worker"
        );

        if same_adapter {
            Ok(Self::SameAdapter(SameAdapterWorker::start(target, vr_device.clone(), config)?))
        } else {
            Ok(Self::CrossAdapter(CrossAdapterWorker::start(target, vr_device.clone(), config)?))
        }
    }

    fn core(&self) -> &WorkerCore<G> {
        match self {
            Self::CrossAdapter(worker) => worker.core(),
            Self::SameAdapter(worker) => worker.core(),
        }
    }

    pub fn kind(&self) -> WorkerKind {
        match self {
            Self::CrossAdapter(_) => WorkerKind::CrossAdapter,
            Self::SameAdapter(_) => WorkerKind::SameAdapter,
        }
    }

    /// Brings the render texture up to date if a new frame is ready.
    ///
    /// Never blocks. Returns true if the render texture changed; for the
    /// same-adapter strategy the caller must then call
    /// [`CaptureWorker::release_vr_render_texture`] once done with it.
    pub fn acquire_vr_render_texture(&mut self) -> bool {
        match self {
            Self::CrossAdapter(worker) => worker.acquire_vr_render_texture(),
            Self::SameAdapter(worker) => worker.acquire_vr_render_texture(),
        }
    }

    /// Hands the frame back to the capture thread.
    pub fn release_vr_render_texture(&mut self) {
        match self {
            Self::CrossAdapter(_) => {}
            Self::SameAdapter(worker) => worker.release_vr_render_texture(),
        }
    }

    /// Asks the capture thread to stop without waiting for it.
    pub fn start_shutdown(&self) {
        self.core().shared.start_shutdown();
    }

    /// Stops the capture thread and waits for it.
    pub fn shutdown(&mut self) {
        match self {
            Self::CrossAdapter(worker) => worker.shutdown(),
            Self::SameAdapter(worker) => worker.shutdown(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.core().shared.is_terminated()
    }

    pub fn capture_failure(&self) -> bool {
        self.core().shared.capture_failure()
    }

    pub fn rendering_falling_behind(&self) -> bool {
        self.core().shared.rendering_falling_behind()
    }

    pub fn protected_content_masked(&self) -> bool {
        self.core().shared.protected_content_masked()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.core().shared.handoff.frames_delivered()
    }

    pub fn state(&self) -> CaptureState {
        self.core().shared.state()
    }

    pub fn descriptor(&self) -> &MonitorDescriptor {
        &self.core().descriptor
    }

    /// The texture the host samples, once the first frame arrived.
    pub fn render_texture(&self) -> Option<&G::Texture> {
        self.core().render.texture()
    }

    pub fn render_texture_desc(&self) -> Option<&TextureDesc> {
        self.core().render.desc()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::{Duration, Instant};

    use xrdesk_ipc::{AdapterLuid, MonitorDescriptor, Rotation, ScreenRect};

    use super::CaptureWorker;
    use crate::cursor::{PointerShapeInfo, PointerShapeType};
    use crate::software::SoftDevice;

    pub fn monitor(width: u32, height: u32) -> MonitorDescriptor {
        MonitorDescriptor {
            index: 0,
            name: "\\\\.\\DISPLAY1".into(),
            is_primary: true,
            screen_rect: ScreenRect::new(0, 0, width as i32, height as i32),
            rotation: Rotation::Identity,
            adapter: AdapterLuid::new(1, 0),
        }
    }

    /// 8x8 monochrome cursor that paints a solid black box.
    pub fn black_box_cursor() -> (PointerShapeInfo, Vec<u8>) {
        let info = PointerShapeInfo {
            shape_type: PointerShapeType::Monochrome,
            width: 8,
            height: 16,
            pitch: 1,
            hot_spot: (0, 0),
        };
        (info, vec![0u8; 16])
    }

    /// Polls the worker like the host does until `done` holds or time runs out.
    pub fn pump(
        worker: &mut CaptureWorker<SoftDevice>,
        mut done: impl FnMut(&CaptureWorker<SoftDevice>) -> bool,
    ) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if worker.acquire_vr_render_texture() {
                worker.release_vr_render_texture();
            }
            if done(worker) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use xrdesk_ipc::AdapterLuid;

    use super::test_support::{monitor, pump};
    use super::*;
    use crate::rect::Rect;
    use crate::software::{ScriptStep, ScriptedDuplication, ScriptedFrame, SoftDevice};

    fn start(
        source: ScriptedDuplication,
        same_adapter: bool,
    ) -> (CaptureWorker<SoftDevice>, SoftDevice) {
        let dupe = SoftDevice::with_luid(AdapterLuid::new(1, 0));
        let vr = if same_adapter {
            SoftDevice::with_luid(AdapterLuid::new(1, 0))
        } else {
            SoftDevice::with_luid(AdapterLuid::new(2, 0))
        };
        let target = CaptureTarget {
            descriptor: monitor(1920, 1080),
            device: dupe,
            source,
        };
        let worker = CaptureWorker::start(target, &vr, &CaptureConfig::default()).unwrap();
        (worker, vr)
    }

    #[test]
    fn test_strategy_follows_adapter() {
        let (mut worker, _) = start(ScriptedDuplication::new(64, 64, []), true);
        assert_eq!(worker.kind(), WorkerKind::SameAdapter);
        worker.shutdown();

        let (mut worker, _) = start(ScriptedDuplication::new(64, 64, []), false);
        assert_eq!(worker.kind(), WorkerKind::CrossAdapter);
        worker.shutdown();
        assert_eq!(worker.state(), CaptureState::Terminated);
    }

    #[test]
    fn test_timeouts_are_healthy() {
        for same_adapter in [false, true] {
            let source = ScriptedDuplication::new(
                1920,
                1080,
                std::iter::repeat_with(|| ScriptStep::Timeout).take(10),
            );
            let probe = source.probe();
            let (mut worker, vr) = start(source, same_adapter);

            assert!(pump(&mut worker, |_| probe.timeouts() >= 10));
            assert!(!worker.is_terminated());
            assert!(!worker.capture_failure());
            assert!(worker.render_texture().is_none());
            assert_eq!(vr.stats().copies, 0);
            assert_eq!(worker.frames_delivered(), 0);
            worker.shutdown();
            assert!(!worker.capture_failure());
        }
    }

    #[test]
    fn test_duplication_unavailable_fails_once() {
        for same_adapter in [false, true] {
            let source = ScriptedDuplication::new(64, 64, [])
                .fail_open_with(CaptureError::DuplicationUnavailable);
            let probe = source.probe();
            let (mut worker, _) = start(source, same_adapter);

            let deadline = Instant::now() + Duration::from_secs(5);
            while !worker.is_terminated() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            assert!(worker.is_terminated());
            assert!(worker.capture_failure());
            assert_eq!(worker.state(), CaptureState::Failed);

            worker.shutdown();
            assert_eq!(probe.opens(), 1);
            // Later reports are swallowed
            assert!(!worker.core().shared.on_capture_failure());
            assert!(!worker.acquire_vr_render_texture());
        }
    }

    #[test]
    fn test_script_error_fails_worker() {
        let source = ScriptedDuplication::new(
            64,
            64,
            [
                ScriptStep::Frame(ScriptedFrame::dirty([Rect::new(0, 0, 8, 8)])),
                ScriptStep::Fail(CaptureError::AccessLost),
            ],
        );
        let probe = source.probe();
        let (mut worker, _) = start(source, false);

        assert!(pump(&mut worker, |w| w.capture_failure()));
        assert_eq!(worker.frames_delivered(), 1);
        worker.shutdown();
        assert_eq!(probe.frames_released(), 1);
    }

    #[test]
    fn test_shutdown_wakes_parked_capture_thread() {
        for same_adapter in [false, true] {
            let source = ScriptedDuplication::new(
                64,
                64,
                [ScriptStep::Frame(ScriptedFrame::dirty([Rect::new(0, 0, 8, 8)]))],
            );
            let probe = source.probe();
            let (mut worker, _) = start(source, same_adapter);

            // Never consume: the capture thread parks in delivery
            let deadline = Instant::now() + Duration::from_secs(5);
            while worker.state() != CaptureState::FrameReady && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(worker.state(), CaptureState::FrameReady);

            worker.start_shutdown();
            worker.shutdown();
            assert!(worker.is_terminated());
            assert!(!worker.capture_failure());
            assert_eq!(probe.frames_released(), probe.frames_acquired());
        }
    }

    #[test]
    fn test_shared_state_transitions() {
        let shared = WorkerShared::new(3, Duration::from_millis(250));
        assert_eq!(shared.state(), CaptureState::AwaitingDuplicationHandle);
        shared.set_state(CaptureState::FrameReady);
        assert_eq!(shared.state(), CaptureState::AwaitingDuplicationHandle);
        shared.set_state(CaptureState::Polling);
        shared.set_state(CaptureState::NoChange);
        assert_eq!(shared.state(), CaptureState::NoChange);

        assert!(shared.on_capture_failure());
        assert!(!shared.on_capture_failure());
        assert!(shared.is_terminated());
        shared.set_state(CaptureState::Polling);
        assert_eq!(shared.state(), CaptureState::Failed);
    }
}
