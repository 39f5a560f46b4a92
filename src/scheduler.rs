//! Scheduler / Reconfiguration Controller.
//!
//! Two kinds of threads:
//!
//! - a periodic timer that only ticks, one per applied configuration;
//! - a single long-lived cycle worker that runs scan cycles.
//!
//! They meet on a rendezvous channel. A tick that finds the worker busy is
//! dropped, so cycles never overlap, and cancelling a timer never waits on an
//! in-flight cycle. Each tick carries the snapshot it was armed with plus a
//! generation number; the worker ignores ticks from superseded generations.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::detect::{ModelLoader, SharedDetector};
use crate::error::ConfigError;
use crate::scan::ScanOrchestrator;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Unconfigured,
    Running,
    Reconfiguring,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Unconfigured => "unconfigured",
            ControllerState::Running => "running",
            ControllerState::Reconfiguring => "reconfiguring",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Everything one cycle needs, frozen at (re)configuration time.
struct ScanContext {
    generation: u64,
    config: Arc<PipelineConfig>,
    detector: SharedDetector,
}

/// Decrements the live-timer count when the timer thread ends.
struct LiveTimer(Arc<AtomicUsize>);

impl LiveTimer {
    fn new(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count.clone())
    }
}

impl Drop for LiveTimer {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PeriodicTimer {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

type TimerSpawner = fn(
    Arc<ScanContext>,
    SyncSender<Arc<ScanContext>>,
    &Arc<AtomicUsize>,
) -> std::io::Result<PeriodicTimer>;

impl PeriodicTimer {
    fn start(
        context: Arc<ScanContext>,
        ticks: SyncSender<Arc<ScanContext>>,
        live: &Arc<AtomicUsize>,
    ) -> std::io::Result<Self> {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let interval = context.config.scan_interval();
        let guard = LiveTimer::new(live);
        let handle = std::thread::Builder::new()
            .name(format!("scan-timer-{}", context.generation))
            .spawn(move || {
                let _guard = guard;
                tick_loop(interval, &context, &ticks, &cancelled);
            })?;
        Ok(Self { cancel, handle })
    }

    /// Stop ticking and wait for the timer thread to exit. Returns promptly:
    /// the timer never runs a cycle itself.
    fn cancel(self) {
        let _ = self.cancel.send(());
        if self.handle.join().is_err() {
            log::error!("scan timer thread panicked");
        }
    }
}

fn tick_loop(
    interval: Duration,
    context: &Arc<ScanContext>,
    ticks: &SyncSender<Arc<ScanContext>>,
    cancelled: &Receiver<()>,
) {
    loop {
        match cancelled.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => match ticks.try_send(context.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => log::warn!(
                    "generation {}: previous scan cycle still running, skipping tick",
                    context.generation
                ),
                Err(TrySendError::Disconnected(_)) => return,
            },
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn run_worker(
    orchestrator: ScanOrchestrator,
    ticks: Receiver<Arc<ScanContext>>,
    current_generation: Arc<AtomicU64>,
    cycles: Arc<AtomicU64>,
) {
    for context in ticks {
        if context.generation != current_generation.load(Ordering::SeqCst) {
            log::debug!("dropping tick from superseded generation {}", context.generation);
            continue;
        }
        let started = Instant::now();
        log::debug!(
            "generation {}: scan cycle over {} cameras",
            context.generation,
            context.config.cameras.len()
        );
        orchestrator.run_cycle(&context.config, &context.detector);
        cycles.fetch_add(1, Ordering::SeqCst);
        log::debug!(
            "generation {}: scan cycle took {:?}",
            context.generation,
            started.elapsed()
        );
    }
    log::debug!("scan worker exiting");
}

struct Inner {
    active: Option<Arc<ScanContext>>,
    timer: Option<PeriodicTimer>,
    ticks: Option<SyncSender<Arc<ScanContext>>>,
    worker: Option<JoinHandle<()>>,
}

/// Owns the timer, the model handle and the current configuration snapshot.
///
/// All configuration changes go through [`PipelineController::apply`]; it is the
/// only writer of the current snapshot.
pub struct PipelineController {
    inner: Mutex<Inner>,
    state: Mutex<ControllerState>,
    loader: Arc<dyn ModelLoader>,
    spawn_timer: TimerSpawner,
    generation: Arc<AtomicU64>,
    live_timers: Arc<AtomicUsize>,
    cycles: Arc<AtomicU64>,
}

impl PipelineController {
    /// Start the cycle worker. No cycles run until a configuration is applied.
    pub fn new(orchestrator: ScanOrchestrator, loader: Arc<dyn ModelLoader>) -> Result<Self> {
        let generation = Arc::new(AtomicU64::new(0));
        let cycles = Arc::new(AtomicU64::new(0));
        let (ticks, tick_rx) = mpsc::sync_channel::<Arc<ScanContext>>(0);

        let worker = {
            let generation = generation.clone();
            let cycles = cycles.clone();
            std::thread::Builder::new()
                .name("scan-worker".to_string())
                .spawn(move || run_worker(orchestrator, tick_rx, generation, cycles))
                .context("spawn scan worker")?
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                active: None,
                timer: None,
                ticks: Some(ticks),
                worker: Some(worker),
            }),
            state: Mutex::new(ControllerState::Unconfigured),
            loader,
            spawn_timer: PeriodicTimer::start,
            generation,
            live_timers: Arc::new(AtomicUsize::new(0)),
            cycles,
        })
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot currently driving the timer, if any.
    pub fn current_config(&self) -> Option<Arc<PipelineConfig>> {
        self.lock_inner()
            .active
            .as_ref()
            .map(|context| context.config.clone())
    }

    /// Number of timer threads alive right now. At most one.
    pub fn active_timers(&self) -> usize {
        self.live_timers.load(Ordering::SeqCst)
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Parse an inbound JSON configuration and apply it.
    pub fn reconfigure(&self, raw: &str) -> Result<(), ConfigError> {
        let config = PipelineConfig::from_json(raw).map_err(|err| {
            log::error!("configuration rejected: {}", err);
            err
        })?;
        self.apply(config)
    }

    /// Swap in a new configuration. On any error the previous state stays in effect.
    ///
    /// The model is loaded before the controller lock is taken, so a slow load
    /// never blocks readers of the current snapshot.
    pub fn apply(&self, config: PipelineConfig) -> Result<(), ConfigError> {
        if let Err(err) = config.validate() {
            log::error!("configuration rejected: {}", err);
            return Err(err);
        }
        let loaded = {
            let inner = self.lock_inner();
            if self.state() == ControllerState::Stopped {
                return Err(ConfigError::Stopped);
            }
            inner
                .active
                .as_ref()
                .filter(|active| active.config.model_path == config.model_path)
                .map(|active| active.detector.clone())
        };
        let detector = match loaded {
            Some(detector) => detector,
            None => match self.loader.load(&config.model_path) {
                Ok(detector) => {
                    log::info!("detection model '{}' loaded", config.model_path);
                    detector
                }
                Err(err) => {
                    log::error!("configuration rejected: model '{}': {:#}", config.model_path, err);
                    return Err(ConfigError::Model {
                        path: config.model_path.clone(),
                        reason: format!("{:#}", err),
                    });
                }
            },
        };

        let mut inner = self.lock_inner();
        let previous = self.state();
        if previous == ControllerState::Stopped {
            return Err(ConfigError::Stopped);
        }
        let ticks = match inner.ticks.clone() {
            Some(ticks) => ticks,
            None => return Err(ConfigError::Stopped),
        };
        self.set_state(ControllerState::Reconfiguring);

        if let Some(timer) = inner.timer.take() {
            timer.cancel();
        }
        let superseded = self.generation.fetch_add(1, Ordering::SeqCst);
        let generation = superseded + 1;
        let context = Arc::new(ScanContext {
            generation,
            config: Arc::new(config),
            detector,
        });

        match (self.spawn_timer)(context.clone(), ticks.clone(), &self.live_timers) {
            Ok(timer) => {
                log::info!(
                    "generation {}: scanning {} cameras every {}s (site {}, client {})",
                    generation,
                    context.config.cameras.len(),
                    context.config.scan_interval_secs,
                    context.config.site,
                    context.config.client
                );
                inner.timer = Some(timer);
                inner.active = Some(context);
                self.set_state(ControllerState::Running);
                Ok(())
            }
            Err(err) => {
                log::error!("scan timer could not be started: {}", err);
                self.generation.store(superseded, Ordering::SeqCst);
                self.restore(&mut inner, ticks, previous);
                Err(ConfigError::Timer(err.to_string()))
            }
        }
    }

    /// Re-arm the previous snapshot after a failed swap.
    fn restore(&self, inner: &mut Inner, ticks: SyncSender<Arc<ScanContext>>, previous: ControllerState) {
        let Some(active) = inner.active.clone() else {
            self.set_state(previous);
            return;
        };
        match (self.spawn_timer)(active, ticks, &self.live_timers) {
            Ok(timer) => {
                inner.timer = Some(timer);
                self.set_state(previous);
            }
            Err(err) => {
                log::error!("previous scan timer could not be restarted: {}", err);
                inner.active = None;
                self.set_state(ControllerState::Unconfigured);
            }
        }
    }

    /// Cancel the timer and stop. A cycle already running finishes first.
    pub fn shutdown(&self) {
        let worker = {
            let mut inner = self.lock_inner();
            if let Some(timer) = inner.timer.take() {
                timer.cancel();
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            inner.ticks = None;
            if self.state() != ControllerState::Stopped {
                log::info!("pipeline controller stopped");
            }
            self.set_state(ControllerState::Stopped);
            inner.worker.take()
        };
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("scan worker panicked");
            }
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ControllerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::FrameSource;
    use crate::config::CameraConfig;
    use crate::detect::{DetectorAdapter, RawDetection, StubDetector};
    use crate::error::FetchError;
    use crate::publish::MemoryPublisher;
    use image::{DynamicImage, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::AtomicBool;

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
            .unwrap();
        bytes
    }

    /// Counts loads; fails for paths containing "broken".
    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
    }

    impl ModelLoader for CountingLoader {
        fn load(&self, model_path: &str) -> Result<SharedDetector> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if model_path.contains("broken") {
                anyhow::bail!("no such model");
            }
            Ok(Arc::new(Mutex::new(StubDetector::with_detections(vec![RawDetection::new(
                "person",
                0.9,
                [0.0, 0.0, 10.0, 10.0],
            )]))))
        }
    }

    fn controller_with(
        source: Arc<dyn FrameSource>,
    ) -> (PipelineController, Arc<MemoryPublisher>, Arc<CountingLoader>) {
        let publisher = Arc::new(MemoryPublisher::new());
        let loader = Arc::new(CountingLoader::default());
        let orchestrator =
            ScanOrchestrator::new(source, DetectorAdapter::without_store(), publisher.clone());
        let controller = PipelineController::new(orchestrator, loader.clone()).unwrap();
        (controller, publisher, loader)
    }

    /// Refuses to start timers for snapshots whose site is "no-threads".
    fn picky_spawner(
        context: Arc<ScanContext>,
        ticks: SyncSender<Arc<ScanContext>>,
        live: &Arc<AtomicUsize>,
    ) -> std::io::Result<PeriodicTimer> {
        if context.config.site == "no-threads" {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "thread limit reached"));
        }
        PeriodicTimer::start(context, ticks, live)
    }

    fn static_source() -> Arc<dyn FrameSource> {
        let frame = jpeg(100, 100);
        Arc::new(move |_: &CameraConfig| -> Result<Vec<u8>, FetchError> { Ok(frame.clone()) })
    }

    fn config(cameras: &[&str], interval: u64, model: &str) -> PipelineConfig {
        PipelineConfig {
            cameras: cameras
                .iter()
                .map(|name| CameraConfig::new(*name, format!("http://cam/{}", name), "u", "p"))
                .collect(),
            scan_interval_secs: interval,
            filter_classes: ["person".to_string()].into_iter().collect(),
            confidence_threshold: 0.5,
            model_path: model.to_string(),
            ..PipelineConfig::default()
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        done()
    }

    #[test]
    fn invalid_first_config_stays_unconfigured() {
        let (controller, _, loader) = controller_with(static_source());

        assert!(matches!(
            controller.reconfigure(r#"{"scan_interval": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(controller.reconfigure("{not json"), Err(ConfigError::Parse(_))));

        assert_eq!(controller.state(), ControllerState::Unconfigured);
        assert_eq!(controller.active_timers(), 0);
        assert!(controller.current_config().is_none());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rapid_reconfiguration_leaves_one_timer() {
        let (controller, _, _) = controller_with(static_source());
        let controller = Arc::new(controller);

        controller.apply(config(&["a"], 60, "stub:m")).unwrap();
        controller.apply(config(&["b"], 60, "stub:m")).unwrap();
        assert_eq!(controller.active_timers(), 1);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let controller = controller.clone();
                std::thread::spawn(move || {
                    controller
                        .apply(config(&["a"], 30 + i, "stub:m"))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(controller.active_timers(), 1);
        assert_eq!(controller.state(), ControllerState::Running);
    }

    #[test]
    fn model_reloads_only_when_path_changes() {
        let (controller, _, loader) = controller_with(static_source());

        controller.apply(config(&["a"], 60, "stub:one")).unwrap();
        controller.apply(config(&["a", "b"], 30, "stub:one")).unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

        controller.apply(config(&["a"], 30, "stub:two")).unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_model_load_keeps_previous_configuration() {
        let (controller, _, _) = controller_with(static_source());
        let good = config(&["a"], 60, "stub:good");
        controller.apply(good.clone()).unwrap();

        let err = controller.apply(config(&["b"], 5, "broken.onnx")).unwrap_err();

        assert!(matches!(err, ConfigError::Model { ref path, .. } if path == "broken.onnx"));
        assert_eq!(controller.state(), ControllerState::Running);
        assert_eq!(controller.current_config().as_deref(), Some(&good));
        assert_eq!(controller.active_timers(), 1);
    }

    #[test]
    fn shutdown_stops_everything() {
        let (controller, _, _) = controller_with(static_source());
        controller.apply(config(&["a"], 60, "stub:m")).unwrap();

        controller.shutdown();

        assert_eq!(controller.state(), ControllerState::Stopped);
        assert_eq!(controller.active_timers(), 0);
        assert!(matches!(
            controller.apply(config(&["a"], 60, "stub:m")),
            Err(ConfigError::Stopped)
        ));
        controller.shutdown();
    }

    #[test]
    fn periodic_cycle_publishes_summary() {
        let (controller, publisher, _) = controller_with(static_source());
        controller.apply(config(&["C1"], 1, "stub:m")).unwrap();

        assert!(wait_until(Duration::from_secs(5), || !publisher.is_empty()));
        controller.shutdown();

        let message = &publisher.messages()[0];
        assert_eq!(message.topic, "devices/clienttest/sitetest/cameras/C1/all");
        assert_eq!(
            String::from_utf8(message.payload.clone()).unwrap(),
            r#"[{"online":1,"top-left-quadrant/person":1,"total/person":1}]"#
        );
        assert!(controller.cycles_completed() >= 1);
    }

    #[test]
    fn superseded_configuration_never_scans() {
        let (controller, publisher, _) = controller_with(static_source());
        controller.apply(config(&["old"], 1, "stub:m")).unwrap();
        controller.apply(config(&["new"], 1, "stub:m")).unwrap();

        assert!(wait_until(Duration::from_secs(5), || !publisher.is_empty()));
        controller.shutdown();

        assert!(publisher
            .messages()
            .iter()
            .all(|message| message.topic.ends_with("/new/all")));
    }

    #[test]
    fn reconfiguration_does_not_wait_for_running_cycle() {
        let started = Arc::new(AtomicBool::new(false));
        let frame = jpeg(16, 16);
        let source: Arc<dyn FrameSource> = {
            let started = started.clone();
            Arc::new(move |_: &CameraConfig| -> Result<Vec<u8>, FetchError> {
                started.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1500));
                Ok(frame.clone())
            })
        };
        let (controller, publisher, _) = controller_with(source);
        controller.apply(config(&["slow"], 1, "stub:m")).unwrap();
        assert!(wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst)));

        let before = Instant::now();
        controller.apply(config(&["slow"], 60, "stub:m")).unwrap();
        assert!(before.elapsed() < Duration::from_millis(500));
        assert_eq!(controller.active_timers(), 1);

        controller.shutdown();
        assert_eq!(publisher.len(), 1);
    }

    #[test]
    fn failed_timer_start_rearms_previous_configuration() {
        let (mut controller, publisher, _) = controller_with(static_source());
        controller.spawn_timer = picky_spawner;
        let good = config(&["kept"], 1, "stub:m");
        controller.apply(good.clone()).unwrap();

        let mut starved = config(&["lost"], 1, "stub:m");
        starved.site = "no-threads".to_string();
        let err = controller.apply(starved).unwrap_err();

        assert!(matches!(err, ConfigError::Timer(_)));
        assert_eq!(controller.state(), ControllerState::Running);
        assert_eq!(controller.current_config().as_deref(), Some(&good));
        assert_eq!(controller.active_timers(), 1);

        assert!(wait_until(Duration::from_secs(5), || !publisher.is_empty()));
        controller.shutdown();
        assert!(publisher
            .messages()
            .iter()
            .all(|message| message.topic.ends_with("/kept/all")));
    }

    #[test]
    fn slow_model_load_does_not_block_snapshot_readers() {
        let loading = Arc::new(AtomicBool::new(false));
        let loader = {
            let loading = loading.clone();
            Arc::new(move |model_path: &str| -> Result<SharedDetector> {
                if model_path == "stub:slow" {
                    loading.store(true, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(1000));
                }
                Ok(Arc::new(Mutex::new(StubDetector::new())))
            })
        };
        let orchestrator = ScanOrchestrator::new(
            static_source(),
            DetectorAdapter::without_store(),
            Arc::new(MemoryPublisher::new()),
        );
        let controller = Arc::new(PipelineController::new(orchestrator, loader).unwrap());
        let first = config(&["a"], 60, "stub:fast");
        controller.apply(first.clone()).unwrap();

        let applying = {
            let controller = controller.clone();
            std::thread::spawn(move || controller.apply(config(&["b"], 60, "stub:slow")))
        };
        assert!(wait_until(Duration::from_secs(5), || loading.load(Ordering::SeqCst)));

        let before = Instant::now();
        assert_eq!(controller.current_config().as_deref(), Some(&first));
        assert!(before.elapsed() < Duration::from_millis(300));

        applying.join().unwrap().unwrap();
        assert_eq!(controller.current_config().unwrap().cameras[0].name, "b");
        assert_eq!(controller.active_timers(), 1);
    }
}
