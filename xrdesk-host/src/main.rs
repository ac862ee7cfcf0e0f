//! Stand-in VR host: builds the monitor fleet and polls it every HMD frame.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::Receiver;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xrdesk_ipc::{CaptureConfig, FleetEvent};

/// Headset refresh the loop paces itself to.
#[cfg_attr(not(windows), allow(dead_code))]
const HMD_FRAME_INTERVAL: Duration = Duration::from_nanos(1_000_000_000 / 90);

/// How often fleet metrics are reported.
#[cfg_attr(not(windows), allow(dead_code))]
const METRICS_INTERVAL: Duration = Duration::from_secs(5);

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "xrdesk_host=debug,xrdesk_engine=debug,xrdesk_capture=debug,xrdesk_ipc=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Reads `XRDESK_CONFIG` if set, otherwise the defaults.
fn load_config() -> anyhow::Result<CaptureConfig> {
    match std::env::var_os("XRDESK_CONFIG") {
        Some(path) => {
            let path = Path::new(&path);
            let config = CaptureConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            info!(path = %path.display(), "Loaded capture config");
            Ok(config)
        }
        None => Ok(CaptureConfig::default()),
    }
}

/// Optional run length from `XRDESK_RUN_SECONDS`; runs until killed otherwise.
fn run_limit() -> anyhow::Result<Option<Duration>> {
    match std::env::var("XRDESK_RUN_SECONDS") {
        Ok(value) => {
            let seconds: u64 = value
                .parse()
                .with_context(|| format!("XRDESK_RUN_SECONDS is not a number: {value}"))?;
            Ok(Some(Duration::from_secs(seconds)))
        }
        Err(_) => Ok(None),
    }
}

#[cfg_attr(not(windows), allow(dead_code))]
fn log_events(events: &Receiver<FleetEvent>) {
    for event in events.try_iter() {
        match event {
            FleetEvent::FleetRebuilt { monitors } => {
                info!(count = monitors.len(), "Fleet rebuilt");
                for monitor in &monitors {
                    info!(
                        index = monitor.index,
                        name = %monitor.name,
                        primary = monitor.is_primary,
                        adapter = %monitor.adapter,
                        rect = ?monitor.screen_rect,
                        rotation = ?monitor.rotation,
                        "Monitor"
                    );
                }
            }
            FleetEvent::WorkerFailed { monitor_index } => {
                warn!(monitor = monitor_index, "Capture worker failed");
            }
            FleetEvent::PerformanceWarning(warning) => warn!(?warning, "Performance warning"),
            FleetEvent::Metrics(metrics) => info!(
                workers = metrics.worker_count,
                frames = metrics.frames_delivered,
                last_acquire_us = metrics.last_acquire_us,
                max_acquire_us = metrics.max_acquire_us,
                slow_passes = metrics.slow_passes,
                rebuilds = metrics.rebuilds,
                uptime = metrics.uptime_seconds,
                "Fleet status"
            ),
            FleetEvent::EnumerationFailed { message } => {
                error!(%message, "Monitor enumeration failed");
            }
            FleetEvent::Shutdown => info!("Fleet shut down"),
        }
    }
}

#[cfg(windows)]
fn run(config: CaptureConfig, limit: Option<Duration>) -> anyhow::Result<()> {
    use std::time::Instant;

    use xrdesk_capture::d3d11::create_default_device;
    use xrdesk_engine::{DxgiPlatform, MonitorChangeWatcher, MonitorFleetCoordinator};

    let vr_device = create_default_device().context("Failed to create the HMD device")?;
    let (event_tx, event_rx) = xrdesk_ipc::event_channel();
    let mut fleet =
        MonitorFleetCoordinator::new(DxgiPlatform, vr_device, config).with_events(event_tx);

    let _watcher = match MonitorChangeWatcher::start(fleet.signal()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "Monitor hot-plug will go unnoticed");
            None
        }
    };

    fleet.rebuild();
    log_events(&event_rx);

    let started = Instant::now();
    let mut last_metrics = Instant::now();
    while limit.map_or(true, |limit| started.elapsed() < limit) {
        let frame_start = Instant::now();

        fleet.update_enumeration();
        fleet.acquire_pass();
        // A real host samples fleet.views() here
        fleet.release_pass();

        if last_metrics.elapsed() >= METRICS_INTERVAL {
            fleet.emit_metrics();
            last_metrics = Instant::now();
        }
        log_events(&event_rx);

        let elapsed = frame_start.elapsed();
        if elapsed < HMD_FRAME_INTERVAL {
            std::thread::sleep(HMD_FRAME_INTERVAL - elapsed);
        }
    }

    fleet.shutdown();
    log_events(&event_rx);
    Ok(())
}

#[cfg(not(windows))]
fn run(_config: CaptureConfig, _limit: Option<Duration>) -> anyhow::Result<()> {
    anyhow::bail!("desktop duplication requires Windows")
}

fn main() -> anyhow::Result<()> {
    init_logging();
    info!("xrdesk host starting");

    let config = load_config()?;
    let limit = run_limit()?;
    run(config, limit)?;

    info!("xrdesk host stopped");
    Ok(())
}
