//! The monitor fleet: one capture worker per monitor.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use tracing::{debug, error, info, instrument, warn};

use xrdesk_capture::{CaptureWorker, GpuDevice, TextureDesc, WorkerKind};
use xrdesk_ipc::{CaptureConfig, FleetEvent, MonitorDescriptor};

use crate::metrics::FleetMetricsCollector;
use crate::platform::CapturePlatform;
use crate::signal::MonitorChangeSignal;

/// What the host needs to draw one monitor.
pub struct MonitorView<'a, G: GpuDevice> {
    pub descriptor: &'a MonitorDescriptor,

    /// Render texture on the HMD device; `None` until the first frame.
    pub texture: Option<&'a G::Texture>,
    pub desc: Option<&'a TextureDesc>,

    /// The texture changed in the last acquire pass.
    pub updated: bool,
    pub kind: WorkerKind,
    pub protected_content_masked: bool,
}

/// Owns the capture workers and keeps them matched to the monitor layout.
///
/// Driven from the render thread: [`update_enumeration`] and
/// [`acquire_pass`] before drawing, [`release_pass`] after.
///
/// [`update_enumeration`]: MonitorFleetCoordinator::update_enumeration
/// [`acquire_pass`]: MonitorFleetCoordinator::acquire_pass
/// [`release_pass`]: MonitorFleetCoordinator::release_pass
pub struct MonitorFleetCoordinator<P: CapturePlatform> {
    platform: P,
    vr_device: P::Device,
    config: CaptureConfig,
    signal: MonitorChangeSignal,
    settle_started: Option<Instant>,
    workers: Vec<CaptureWorker<P::Device>>,
    acquired: Vec<bool>,
    failure_reported: Vec<bool>,
    falling_behind: Vec<bool>,
    rebuild_pending: bool,
    last_rebuild: Option<Instant>,
    metrics: Arc<FleetMetricsCollector>,
    event_tx: Option<Sender<FleetEvent>>,
}

impl<P: CapturePlatform> MonitorFleetCoordinator<P> {
    /// Creates an empty fleet delivering into textures on `vr_device`.
    ///
    /// The first enumeration is already signalled, so the fleet is built once
    /// the settle delay passes; call [`MonitorFleetCoordinator::rebuild`] to
    /// build it right away.
    pub fn new(platform: P, vr_device: P::Device, config: CaptureConfig) -> Self {
        let metrics = Arc::new(FleetMetricsCollector::new(config.slow_acquire_threshold()));
        metrics.start();

        let signal = MonitorChangeSignal::new();
        signal.notify();

        Self {
            platform,
            vr_device,
            config,
            signal,
            settle_started: None,
            workers: Vec::new(),
            acquired: Vec::new(),
            failure_reported: Vec::new(),
            falling_behind: Vec::new(),
            rebuild_pending: false,
            last_rebuild: None,
            metrics,
            event_tx: None,
        }
    }

    /// Publishes fleet events on `event_tx`.
    pub fn with_events(mut self, event_tx: Sender<FleetEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Signal to hand to a monitor change watcher.
    pub fn signal(&self) -> MonitorChangeSignal {
        self.signal.clone()
    }

    pub fn metrics(&self) -> Arc<FleetMetricsCollector> {
        Arc::clone(&self.metrics)
    }

    /// Requests a re-enumeration, subject to the settle delay.
    pub fn trigger_enumeration(&self) {
        self.signal.notify();
    }

    /// Rebuilds the fleet if the monitor layout settled or a worker failed.
    ///
    /// A pending change signal restarts the settle timer. Returns true if
    /// the fleet was rebuilt.
    pub fn update_enumeration(&mut self) -> bool {
        let now = Instant::now();
        let settle = self.config.hotplug_settle_delay();

        if self.signal.take() {
            if self.settle_started.is_none() {
                debug!("Monitor change signalled, waiting for the layout to settle");
            }
            self.settle_started = Some(now);
            return false;
        }

        if let Some(started) = self.settle_started {
            if now.duration_since(started) < settle {
                return false;
            }
            self.settle_started = None;
            self.rebuild();
            return true;
        }

        // Failures rebuild at most once per settle delay
        let cooled_down = self
            .last_rebuild
            .map_or(true, |at| now.duration_since(at) >= settle);
        if self.rebuild_pending && cooled_down {
            error!("Restarting monitor enumeration on duplication failure");
            self.rebuild();
            return true;
        }

        false
    }

    /// Tears the fleet down and starts one worker per enumerated monitor.
    #[instrument(name = "fleet_rebuild", skip(self))]
    pub fn rebuild(&mut self) {
        info!("Updating monitor enumeration");
        self.stop_workers();
        // This enumeration covers every change signalled so far
        self.signal.take();
        self.settle_started = None;
        self.rebuild_pending = false;
        self.last_rebuild = Some(Instant::now());

        let targets = match self.platform.enumerate() {
            Ok(targets) => targets,
            Err(e) => {
                error!(error = %e, "Monitor enumeration failed");
                self.metrics.record_rebuild(0);
                self.send_event(FleetEvent::EnumerationFailed {
                    message: e.to_string(),
                });
                return;
            }
        };

        info!(count = targets.len(), "Starting duplication");
        for target in targets {
            let index = target.descriptor.index;
            match CaptureWorker::start(target, &self.vr_device, &self.config) {
                Ok(worker) => self.workers.push(worker),
                Err(e) => {
                    error!(monitor = index, error = %e, "Failed to start capture worker");
                    self.rebuild_pending = true;
                }
            }
        }

        let count = self.workers.len();
        self.acquired = vec![false; count];
        self.failure_reported = vec![false; count];
        self.falling_behind = vec![false; count];
        self.metrics.record_rebuild(count);

        let monitors = self.workers.iter().map(|w| w.descriptor().clone()).collect();
        self.send_event(FleetEvent::FleetRebuilt { monitors });
    }

    /// Polls every worker for a new frame. Never blocks.
    ///
    /// Returns how many render textures changed. A terminated worker
    /// schedules a rebuild for the next [`MonitorFleetCoordinator::update_enumeration`].
    pub fn acquire_pass(&mut self) -> usize {
        let started = Instant::now();
        let mut updated = 0;
        let mut needs_restart = false;

        for (i, worker) in self.workers.iter_mut().enumerate() {
            let acquired = worker.acquire_vr_render_texture();
            self.acquired[i] = acquired;
            if acquired {
                updated += 1;
            }

            let index = worker.descriptor().index;
            if worker.is_terminated() {
                needs_restart = true;
                if worker.capture_failure() && !self.failure_reported[i] {
                    self.failure_reported[i] = true;
                    self.metrics.record_capture_failure(index);
                    if let Some(tx) = &self.event_tx {
                        let event = FleetEvent::WorkerFailed {
                            monitor_index: index,
                        };
                        if let Err(e) = tx.try_send(event) {
                            warn!("Failed to send event: {}", e);
                        }
                    }
                }
            }

            let behind = worker.rendering_falling_behind();
            if behind && !self.falling_behind[i] {
                self.metrics.record_falling_behind(index);
            }
            self.falling_behind[i] = behind;
        }

        let elapsed = started.elapsed();
        if self.metrics.record_acquire_pass(elapsed) {
            warn!(
                elapsed_us = elapsed.as_micros() as u64,
                "Slow duplication: acquire pass exceeded threshold"
            );
        }
        self.metrics.record_frames(updated as u64);

        if needs_restart {
            self.rebuild_pending = true;
        }
        updated
    }

    /// Hands every frame taken in the last acquire pass back to its worker.
    pub fn release_pass(&mut self) {
        for (worker, acquired) in self.workers.iter_mut().zip(self.acquired.iter_mut()) {
            if std::mem::take(acquired) {
                worker.release_vr_render_texture();
            }
        }
    }

    /// One view per worker, in monitor order.
    pub fn views(&self) -> Vec<MonitorView<'_, P::Device>> {
        self.workers
            .iter()
            .zip(&self.acquired)
            .map(|(worker, &updated)| MonitorView {
                descriptor: worker.descriptor(),
                texture: worker.render_texture(),
                desc: worker.render_texture_desc(),
                updated,
                kind: worker.kind(),
                protected_content_masked: worker.protected_content_masked(),
            })
            .collect()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Sends a metrics snapshot and any warnings gathered since the last call.
    pub fn emit_metrics(&self) {
        self.send_event(FleetEvent::Metrics(self.metrics.snapshot()));
        for warning in self.metrics.check_warnings() {
            self.send_event(FleetEvent::PerformanceWarning(warning));
        }
        self.metrics.mark_reported();
    }

    /// Stops every worker and announces the shutdown.
    #[instrument(name = "fleet_shutdown", skip(self))]
    pub fn shutdown(&mut self) {
        info!(workers = self.workers.len(), "Shutting down monitor fleet");
        self.stop_workers();
        self.settle_started = None;
        self.rebuild_pending = false;
        self.metrics.stop();
        self.send_event(FleetEvent::Shutdown);
    }

    /// Signals every worker first so their threads wind down in parallel, then joins.
    fn stop_workers(&mut self) {
        self.release_pass();
        for worker in &self.workers {
            worker.start_shutdown();
        }
        for worker in &mut self.workers {
            worker.shutdown();
        }
        self.workers.clear();
        self.acquired.clear();
        self.failure_reported.clear();
        self.falling_behind.clear();
    }

    fn send_event(&self, event: FleetEvent) {
        if let Some(tx) = &self.event_tx {
            if let Err(e) = tx.try_send(event) {
                warn!("Failed to send event: {}", e);
            }
        }
    }
}

impl<P: CapturePlatform> Drop for MonitorFleetCoordinator<P> {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crossbeam_channel::Receiver;
    use xrdesk_capture::software::{
        ScriptProbe, ScriptStep, ScriptedDuplication, ScriptedFrame, SoftDevice,
    };
    use xrdesk_capture::{CaptureError, CaptureTarget, Rect};
    use xrdesk_ipc::{event_channel, AdapterLuid, Rotation, ScreenRect, WarningType};

    use super::*;
    use crate::{EngineError, EngineResult};

    type Targets = Vec<CaptureTarget<SoftDevice, ScriptedDuplication>>;

    struct FnPlatform<F>(F);

    impl<F> CapturePlatform for FnPlatform<F>
    where
        F: FnMut() -> EngineResult<Targets>,
    {
        type Device = SoftDevice;
        type Source = ScriptedDuplication;

        fn enumerate(&mut self) -> EngineResult<Targets> {
            (self.0)()
        }
    }

    fn target(
        index: usize,
        luid: u32,
        steps: Vec<ScriptStep>,
    ) -> (CaptureTarget<SoftDevice, ScriptedDuplication>, ScriptProbe) {
        let left = index as i32 * 64;
        let descriptor = MonitorDescriptor {
            index,
            name: format!("\\\\.\\DISPLAY{}", index + 1),
            is_primary: index == 0,
            screen_rect: ScreenRect::new(left, 0, left + 64, 64),
            rotation: Rotation::Identity,
            adapter: AdapterLuid::new(luid, 0),
        };
        let source = ScriptedDuplication::new(64, 64, steps);
        let probe = source.probe();
        let target = CaptureTarget {
            descriptor,
            device: SoftDevice::with_luid(AdapterLuid::new(luid, 0)),
            source,
        };
        (target, probe)
    }

    fn config(settle_ms: u64) -> CaptureConfig {
        CaptureConfig {
            hotplug_settle_ms: settle_ms,
            ..CaptureConfig::default()
        }
    }

    fn fleet<F>(
        platform: F,
        settle_ms: u64,
    ) -> (MonitorFleetCoordinator<FnPlatform<F>>, Receiver<FleetEvent>)
    where
        F: FnMut() -> EngineResult<Targets>,
    {
        let (tx, rx) = event_channel();
        let vr = SoftDevice::with_luid(AdapterLuid::new(1, 0));
        let coordinator = MonitorFleetCoordinator::new(FnPlatform(platform), vr, config(settle_ms))
            .with_events(tx);
        (coordinator, rx)
    }

    /// Drives the fleet like the render loop until `done` holds or time runs out.
    fn drive<P: CapturePlatform>(
        coordinator: &mut MonitorFleetCoordinator<P>,
        mut done: impl FnMut(&MonitorFleetCoordinator<P>, bool) -> bool,
    ) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let rebuilt = coordinator.update_enumeration();
            coordinator.acquire_pass();
            let finished = done(coordinator, rebuilt);
            coordinator.release_pass();
            if finished {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_rebuild_picks_strategy_per_adapter() {
        let (mut coordinator, events) = fleet(
            || Ok(vec![target(0, 1, vec![]).0, target(1, 2, vec![]).0]),
            500,
        );
        coordinator.rebuild();

        let views = coordinator.views();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].kind, WorkerKind::SameAdapter);
        assert_eq!(views[1].kind, WorkerKind::CrossAdapter);
        assert!(views[0].texture.is_none());
        assert_eq!(views[1].descriptor.name, "\\\\.\\DISPLAY2");
        drop(views);

        match events.try_recv().unwrap() {
            FleetEvent::FleetRebuilt { monitors } => {
                assert_eq!(monitors.len(), 2);
                assert!(monitors[0].is_primary);
            }
            other => panic!("unexpected event {other:?}"),
        }
        let snapshot = coordinator.metrics().snapshot();
        assert_eq!(snapshot.rebuilds, 1);
        assert_eq!(snapshot.worker_count, 2);
    }

    #[test]
    fn test_change_signal_is_debounced() {
        let enumerations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&enumerations);
        let (mut coordinator, _events) = fleet(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![target(0, 1, vec![]).0])
            },
            100,
        );

        // The initial signal starts the settle timer
        assert!(!coordinator.update_enumeration());
        assert!(!coordinator.update_enumeration());

        std::thread::sleep(Duration::from_millis(20));
        coordinator.trigger_enumeration();
        assert!(!coordinator.update_enumeration());

        // A second signal restarted the timer
        std::thread::sleep(Duration::from_millis(40));
        assert!(!coordinator.update_enumeration());
        assert_eq!(enumerations.load(Ordering::SeqCst), 0);

        std::thread::sleep(Duration::from_millis(80));
        assert!(coordinator.update_enumeration());
        assert_eq!(enumerations.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.worker_count(), 1);
        assert!(!coordinator.update_enumeration());
    }

    #[test]
    fn test_frames_reach_views() {
        let (mut coordinator, _events) = fleet(
            || {
                let frame = ScriptedFrame::dirty([Rect::new(0, 0, 8, 8)]);
                Ok(vec![
                    target(0, 1, vec![ScriptStep::Frame(frame.clone())]).0,
                    target(1, 2, vec![ScriptStep::Frame(frame)]).0,
                ])
            },
            500,
        );
        coordinator.rebuild();

        let mut seen = [false, false];
        assert!(drive(&mut coordinator, |c, _| {
            for (i, view) in c.views().iter().enumerate() {
                if view.updated {
                    assert_eq!(view.desc.map(|d| (d.width, d.height)), Some((64, 64)));
                    assert!(view.texture.is_some());
                    seen[i] = true;
                }
            }
            seen == [true, true]
        }));
        assert_eq!(coordinator.metrics().snapshot().frames_delivered, 2);
    }

    #[test]
    fn test_failed_worker_triggers_rebuild() {
        let enumerations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&enumerations);
        let (mut coordinator, events) = fleet(
            move || {
                let steps = if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    vec![ScriptStep::Fail(CaptureError::AccessLost)]
                } else {
                    vec![]
                };
                Ok(vec![target(0, 2, steps).0])
            },
            20,
        );
        coordinator.rebuild();

        assert!(drive(&mut coordinator, |_, rebuilt| rebuilt));
        assert_eq!(enumerations.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.worker_count(), 1);

        let received: Vec<_> = events.try_iter().collect();
        assert!(matches!(received[0], FleetEvent::FleetRebuilt { .. }));
        assert!(matches!(received[1], FleetEvent::WorkerFailed { monitor_index: 0 }));
        assert!(matches!(received[2], FleetEvent::FleetRebuilt { .. }));

        coordinator.emit_metrics();
        let received: Vec<_> = events.try_iter().collect();
        match &received[0] {
            FleetEvent::Metrics(metrics) => assert_eq!(metrics.rebuilds, 2),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(received.iter().any(|e| matches!(
            e,
            FleetEvent::PerformanceWarning(WarningType::CaptureFailed { monitor_index: 0 })
        )));

        // Warnings are reported once
        coordinator.emit_metrics();
        assert_eq!(events.try_iter().count(), 1);
    }

    #[test]
    fn test_enumeration_failure_leaves_fleet_empty() {
        let (mut coordinator, events) =
            fleet(|| Err(EngineError::Capture(CaptureError::NotSupported)), 500);
        coordinator.rebuild();

        assert_eq!(coordinator.worker_count(), 0);
        assert_eq!(coordinator.acquire_pass(), 0);
        assert!(coordinator.views().is_empty());
        assert!(matches!(
            events.try_recv().unwrap(),
            FleetEvent::EnumerationFailed { .. }
        ));
    }

    #[test]
    fn test_shutdown_stops_parked_workers() {
        let probes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&probes);
        let (mut coordinator, events) = fleet(
            move || {
                let frame = ScriptedFrame::dirty([Rect::new(0, 0, 8, 8)]);
                let (a, pa) = target(0, 1, vec![ScriptStep::Frame(frame.clone())]);
                let (b, pb) = target(1, 2, vec![ScriptStep::Frame(frame)]);
                sink.lock().extend([pa, pb]);
                Ok(vec![a, b])
            },
            500,
        );
        coordinator.rebuild();

        // Nobody acquires, so both capture threads park in delivery
        let deadline = Instant::now() + Duration::from_secs(5);
        while probes.lock().iter().any(|p| p.frames_acquired() == 0) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        coordinator.shutdown();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(coordinator.worker_count(), 0);
        for probe in probes.lock().iter() {
            assert_eq!(probe.frames_released(), probe.frames_acquired());
        }
        assert!(events
            .try_iter()
            .any(|e| matches!(e, FleetEvent::Shutdown)));
    }
}
