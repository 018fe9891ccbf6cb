//! The synchronized capture loop.
//!
//! Each iteration pulls one thermal frame and one color frame, stamps both
//! with a single wall-clock timestamp taken after the second capture,
//! persists them, optionally shows a composite preview, then sleeps out the
//! rest of the frame budget. Overruns shorten the sleep and accumulate as
//! drift; no frame is skipped.

use crate::composite::Compositor;
use crate::types::{FramePair, PairRecord, SessionReport, SessionState};
use image::RgbImage;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thermsync_hw::color::{ColorDevice, V4l2ColorDevice};
use thermsync_hw::persist::{color_file_name, thermal_file_name};
use thermsync_hw::queue::{frame_queue, QUEUE_CAPACITY};
use thermsync_hw::{
    ColorAdapter, FrameShape, RawColorFrame, RawThermalFrame, SensorAdapter, SensorError,
    StreamDriver, ThermalAdapter, ThermalStream,
};
use thiserror::Error;

/// Where a session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Arm,
    ThermalInit,
    ColorInit,
    ThermalCapture,
    ColorCapture,
    ThermalSave,
    ColorSave,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Arm => "thermal stream start",
            Self::ThermalInit => "thermal sensor init",
            Self::ColorInit => "color sensor init",
            Self::ThermalCapture => "thermal capture",
            Self::ColorCapture => "color capture",
            Self::ThermalSave => "thermal save",
            Self::ColorSave => "color save",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{stage} failed: {source}")]
    Sensor {
        stage: Stage,
        #[source]
        source: SensorError,
    },
    #[error("capture loop requires an armed session (state: {0:?})")]
    NotArmed(SessionState),
}

impl SessionError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Sensor { stage, .. } => Some(*stage),
            Self::NotArmed(_) => None,
        }
    }
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, SessionError>;
}

impl<T> AtStage<T> for Result<T, SensorError> {
    fn at(self, stage: Stage) -> Result<T, SessionError> {
        self.map_err(|source| SessionError::Sensor { stage, source })
    }
}

/// Receives one composite image per display tick.
pub trait PreviewSink {
    fn show(&mut self, composite: &RgbImage);
}

/// Discards previews.
pub struct NullPreview;

impl PreviewSink for NullPreview {
    fn show(&mut self, _composite: &RgbImage) {}
}

/// Holds the frame cadence.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Loop timing.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Target capture rate, frames per second.
    pub frame_rate: u32,
    /// Preview updates per second.
    pub display_rate: u32,
    pub duration: Duration,
}

impl LoopConfig {
    /// Total iterations: duration × frame rate.
    pub fn iterations(&self) -> u64 {
        (self.duration.as_secs_f64() * self.frame_rate as f64).round() as u64
    }

    /// Per-iteration time budget.
    pub fn frame_budget(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }

    /// A preview is built every this many iterations.
    pub fn display_every(&self) -> u64 {
        (self.frame_rate / self.display_rate.max(1)).max(1) as u64
    }
}

/// Opens a color device by index during probing.
pub type ColorOpener = Box<dyn FnMut(u32) -> Result<Box<dyn ColorDevice>, SensorError>>;

/// How to obtain thermal frames.
pub enum ThermalSource {
    Disabled,
    Stream {
        driver: Box<dyn StreamDriver>,
        timeout: Duration,
    },
}

/// How to obtain color frames.
pub enum ColorSource {
    Disabled,
    Probe { opener: ColorOpener, attempts: u32 },
}

impl ColorSource {
    /// Probe V4L2 nodes `/dev/video0..attempts`.
    pub fn v4l2(expected: FrameShape, attempts: u32) -> Self {
        Self::Probe {
            opener: Box::new(move |index| {
                V4l2ColorDevice::open(index, expected).map(|d| Box::new(d) as Box<dyn ColorDevice>)
            }),
            attempts,
        }
    }
}

/// Sensors for one session.
pub struct SensorSources {
    pub thermal: ThermalSource,
    pub thermal_shape: FrameShape,
    pub color: ColorSource,
    pub color_shape: FrameShape,
}

pub struct CaptureSession {
    config: LoopConfig,
    output_dir: PathBuf,
    compositor: Compositor,
    preview: Box<dyn PreviewSink>,
    sleeper: Box<dyn Sleeper>,
    state: SessionState,
}

impl CaptureSession {
    /// `output_dir` must exist and be writable.
    pub fn new(config: LoopConfig, output_dir: impl Into<PathBuf>, compositor: Compositor) -> Self {
        Self {
            config,
            output_dir: output_dir.into(),
            compositor,
            preview: Box::new(NullPreview),
            sleeper: Box::new(ThreadSleeper),
            state: SessionState::Idle,
        }
    }

    pub fn with_preview(mut self, preview: Box<dyn PreviewSink>) -> Self {
        self.preview = preview;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Run a complete session: start the thermal stream, bring up both
    /// sensors, capture, and tear the stream down on every exit path.
    pub fn run(&mut self, sources: SensorSources) -> Result<SessionReport, SessionError> {
        let result = self.run_armed(sources);
        self.state = SessionState::Stopped;
        match &result {
            Ok(report) => tracing::info!(pairs = report.pairs.len(), "session complete"),
            Err(e) => tracing::error!(error = %e, "session aborted"),
        }
        result.map(|mut report| {
            report.state = SessionState::Stopped;
            report
        })
    }

    fn run_armed(&mut self, sources: SensorSources) -> Result<SessionReport, SessionError> {
        // `_stream` tears the driver down when this function returns, however it returns.
        let (_stream, mut thermal) = match sources.thermal {
            ThermalSource::Disabled => {
                self.state = SessionState::Armed;
                (None, ThermalAdapter::disabled(sources.thermal_shape))
            }
            ThermalSource::Stream { driver, timeout } => {
                let (producer, consumer) = frame_queue(QUEUE_CAPACITY);
                let stream =
                    ThermalStream::start(driver, producer, sources.thermal_shape).at(Stage::Arm)?;
                self.state = SessionState::Armed;
                let adapter = ThermalAdapter::open(consumer, sources.thermal_shape, timeout)
                    .at(Stage::ThermalInit)?;
                (Some(stream), adapter)
            }
        };

        let mut color = match sources.color {
            ColorSource::Disabled => ColorAdapter::disabled(sources.color_shape),
            ColorSource::Probe { opener, attempts } => {
                ColorAdapter::probe(opener, sources.color_shape, attempts).at(Stage::ColorInit)?
            }
        };

        self.capture(&mut thermal, &mut color)
    }

    /// Run the loop over already-constructed adapters. Ends in `Stopped`.
    pub fn run_loop<T, C>(&mut self, thermal: &mut T, color: &mut C) -> Result<SessionReport, SessionError>
    where
        T: SensorAdapter<Frame = RawThermalFrame>,
        C: SensorAdapter<Frame = RawColorFrame>,
    {
        if self.state == SessionState::Idle {
            self.state = SessionState::Armed;
        }
        let result = self.capture(thermal, color);
        self.state = SessionState::Stopped;
        result.map(|mut report| {
            report.state = SessionState::Stopped;
            report
        })
    }

    fn capture<T, C>(&mut self, thermal: &mut T, color: &mut C) -> Result<SessionReport, SessionError>
    where
        T: SensorAdapter<Frame = RawThermalFrame>,
        C: SensorAdapter<Frame = RawColorFrame>,
    {
        if self.state != SessionState::Armed {
            return Err(SessionError::NotArmed(self.state));
        }
        self.state = SessionState::Capturing;

        let iterations = self.config.iterations();
        let budget = self.config.frame_budget();
        let display_every = self.config.display_every();
        tracing::info!(
            iterations,
            frame_rate = self.config.frame_rate,
            display_every,
            dir = %self.output_dir.display(),
            "capture loop started"
        );

        let mut report = SessionReport {
            state: SessionState::Capturing,
            pairs: Vec::with_capacity(iterations as usize),
            previews: 0,
            overruns: 0,
        };

        for index in 0..iterations {
            let started = Instant::now();
            if let Err(e) = self.iterate(index, display_every, thermal, color, &mut report) {
                self.state = SessionState::Stopped;
                return Err(e);
            }

            match budget.checked_sub(started.elapsed()) {
                Some(remaining) if !remaining.is_zero() => self.sleeper.sleep(remaining),
                _ => {
                    report.overruns += 1;
                    tracing::debug!(index, budget = ?budget, "frame budget overrun");
                }
            }
        }

        self.state = SessionState::Draining;
        report.state = SessionState::Draining;
        tracing::info!(pairs = report.pairs.len(), overruns = report.overruns, "capture loop finished");
        Ok(report)
    }

    fn iterate<T, C>(
        &mut self,
        index: u64,
        display_every: u64,
        thermal: &mut T,
        color: &mut C,
        report: &mut SessionReport,
    ) -> Result<(), SessionError>
    where
        T: SensorAdapter<Frame = RawThermalFrame>,
        C: SensorAdapter<Frame = RawColorFrame>,
    {
        thermal.capture().at(Stage::ThermalCapture)?;
        color.capture().at(Stage::ColorCapture)?;
        // One timestamp for both frames, after both captures.
        let captured_at = chrono::Local::now().naive_local();

        thermal
            .save(&self.output_dir.join(thermal_file_name(index)), captured_at)
            .at(Stage::ThermalSave)?;
        color
            .save(&self.output_dir.join(color_file_name(index)), captured_at)
            .at(Stage::ColorSave)?;

        let pair = FramePair {
            thermal: thermal.last_frame(),
            color: color.last_frame(),
            captured_at,
            sequence_index: index,
        };

        if index % display_every == 0 {
            let composite = self.compositor.compose(&pair);
            self.preview.show(&composite);
            report.previews += 1;
        }

        tracing::debug!(index, captured_at = %captured_at, "pair captured");
        report.pairs.push(PairRecord::from(&pair));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::{CompositorConfig, DEFAULT_ALIGNMENT_RECT};
    use std::sync::{Arc, Mutex};
    use thermsync_hw::uvc::{FrameCallback, FrameDescriptor};

    struct NoSleep;

    impl Sleeper for NoSleep {
        fn sleep(&mut self, _duration: Duration) {}
    }

    struct CountingPreview(Arc<Mutex<Vec<(u32, u32)>>>);

    impl PreviewSink for CountingPreview {
        fn show(&mut self, composite: &RgbImage) {
            self.0.lock().unwrap().push(composite.dimensions());
        }
    }

    fn session(dir: &Path, seconds: u64, thermal_enabled: bool) -> CaptureSession {
        let config = LoopConfig {
            frame_rate: 4,
            display_rate: 1,
            duration: Duration::from_secs(seconds),
        };
        let compositor = Compositor::new(
            CompositorConfig {
                thermal_enabled,
                ..CompositorConfig::default()
            },
            DEFAULT_ALIGNMENT_RECT,
            None,
        );
        CaptureSession::new(config, dir, compositor).with_sleeper(Box::new(NoSleep))
    }

    fn disabled_sources() -> SensorSources {
        SensorSources {
            thermal: ThermalSource::Disabled,
            thermal_shape: FrameShape::thermal(),
            color: ColorSource::Disabled,
            color_shape: FrameShape::new(192, 108),
        }
    }

    #[test]
    fn test_loop_config() {
        let c = LoopConfig {
            frame_rate: 4,
            display_rate: 1,
            duration: Duration::from_secs(60),
        };
        assert_eq!(c.iterations(), 240);
        assert_eq!(c.frame_budget(), Duration::from_millis(250));
        assert_eq!(c.display_every(), 4);

        let fast_display = LoopConfig { display_rate: 8, ..c };
        assert_eq!(fast_display.display_every(), 1);
    }

    #[test]
    fn test_sixty_seconds_both_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let previews = Arc::new(Mutex::new(Vec::new()));
        let mut s = session(dir.path(), 60, false)
            .with_preview(Box::new(CountingPreview(Arc::clone(&previews))));
        assert_eq!(s.state(), SessionState::Idle);

        let report = s.run(disabled_sources()).unwrap();

        assert_eq!(s.state(), SessionState::Stopped);
        assert_eq!(report.state, SessionState::Stopped);
        assert_eq!(report.pairs.len(), 240);
        assert!(report
            .pairs
            .windows(2)
            .all(|w| w[1].sequence_index == w[0].sequence_index + 1));
        assert!(report.pairs.windows(2).all(|w| w[1].captured_at >= w[0].captured_at));
        assert_eq!(report.pairs[0].sequence_index, 0);

        // One preview per second of capture.
        assert_eq!(report.previews, 60);
        let shown = previews.lock().unwrap();
        assert_eq!(shown.len(), 60);
        // 160 thermal + 192 * 120 / 108 = 213 color
        assert_eq!(shown[0], (160 + 213, 120));

        // Disabled sensors write nothing.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// Thermal driver that delivers `frames` frames then goes silent.
    struct StallingDriver {
        shape: FrameShape,
        frames: usize,
        log: Arc<Mutex<Vec<&'static str>>>,
        callback: Option<FrameCallback>,
    }

    impl StreamDriver for StallingDriver {
        fn init(&mut self) -> Result<(), SensorError> {
            self.log.lock().unwrap().push("init");
            Ok(())
        }
        fn find_device(&mut self) -> Result<(), SensorError> {
            Ok(())
        }
        fn open(&mut self) -> Result<(), SensorError> {
            Ok(())
        }
        fn frame_shape(&self) -> FrameShape {
            self.shape
        }
        fn start_streaming(&mut self, mut callback: FrameCallback) -> Result<(), SensorError> {
            self.log.lock().unwrap().push("start");
            let data: Vec<u8> = std::iter::repeat(30315u16.to_le_bytes())
                .take(self.shape.pixels())
                .flatten()
                .collect();
            // Deliver synchronously, one at a time, so none are dropped.
            for _ in 0..self.frames.min(QUEUE_CAPACITY) {
                callback(&FrameDescriptor {
                    width: self.shape.width,
                    height: self.shape.height,
                    data_bytes: data.len(),
                    data: &data,
                });
            }
            // Held so the queue stays connected while the stream is silent.
            self.callback = Some(callback);
            Ok(())
        }
        fn stop_streaming(&mut self) {
            self.log.lock().unwrap().push("stop");
            self.callback = None;
        }
        fn close(&mut self) {
            self.log.lock().unwrap().push("close");
        }
        fn exit(&mut self) {
            self.log.lock().unwrap().push("exit");
        }
    }

    #[test]
    fn test_thermal_stall_aborts_and_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let shape = FrameShape::new(8, 6);
        let sources = SensorSources {
            thermal: ThermalSource::Stream {
                driver: Box::new(StallingDriver {
                    shape,
                    frames: 2,
                    log: Arc::clone(&log),
                    callback: None,
                }),
                timeout: Duration::from_millis(50),
            },
            thermal_shape: shape,
            color: ColorSource::Disabled,
            color_shape: FrameShape::new(16, 9),
        };

        let mut s = session(dir.path(), 10, true);
        let err = s.run(sources).unwrap_err();

        // Frame 1 feeds the self-check, frame 2 the first iteration; the
        // second iteration stalls.
        assert_eq!(err.stage(), Some(Stage::ThermalCapture));
        assert!(matches!(
            err,
            SessionError::Sensor {
                source: SensorError::SensorTimeout(_),
                ..
            }
        ));
        assert_eq!(s.state(), SessionState::Stopped);
        assert_eq!(*log.lock().unwrap(), vec!["init", "start", "stop", "close", "exit"]);

        // The one completed iteration was persisted with its timestamp.
        let saved = dir.path().join(thermal_file_name(0));
        assert!(saved.exists());
        assert!(thermsync_hw::persist::read_timestamp(&saved).unwrap().is_some());
        assert!(!dir.path().join(thermal_file_name(1)).exists());
    }

    #[test]
    fn test_thermal_init_failure_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let shape = FrameShape::new(8, 6);
        let sources = SensorSources {
            thermal: ThermalSource::Stream {
                driver: Box::new(StallingDriver {
                    shape,
                    frames: 0,
                    log: Arc::clone(&log),
                    callback: None,
                }),
                timeout: Duration::from_millis(20),
            },
            thermal_shape: shape,
            color: ColorSource::Disabled,
            color_shape: FrameShape::new(16, 9),
        };
        let err = session(dir.path(), 1, true).run(sources).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::ThermalInit));
        assert!(log.lock().unwrap().ends_with(&["stop", "close", "exit"]));
    }

    struct SolidCamera(RgbImage);

    impl ColorDevice for SolidCamera {
        fn read(&mut self) -> Result<RawColorFrame, SensorError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_pairs_share_index_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let expected = FrameShape::new(32, 18);
        let sources = SensorSources {
            thermal: ThermalSource::Disabled,
            thermal_shape: FrameShape::thermal(),
            color: ColorSource::Probe {
                opener: Box::new(move |_| {
                    Ok(Box::new(SolidCamera(expected.zero_color())) as Box<dyn ColorDevice>)
                }),
                attempts: 3,
            },
            color_shape: expected,
        };

        let report = session(dir.path(), 2, false).run(sources).unwrap();
        assert_eq!(report.pairs.len(), 8);
        for i in 0..8 {
            assert!(dir.path().join(color_file_name(i)).exists());
            assert!(!dir.path().join(thermal_file_name(i)).exists());
        }
    }

    #[test]
    fn test_color_not_found_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let sources = SensorSources {
            color: ColorSource::Probe {
                opener: Box::new(|_| Err(SensorError::HardwareInit("absent".into()))),
                attempts: 3,
            },
            ..disabled_sources()
        };
        let err = session(dir.path(), 1, false).run(sources).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::ColorInit));
    }

    #[test]
    fn test_run_loop_with_prebuilt_adapters() {
        let dir = tempfile::tempdir().unwrap();
        let mut thermal = ThermalAdapter::disabled(FrameShape::thermal());
        let mut color = ColorAdapter::disabled(FrameShape::new(16, 9));
        let mut s = session(dir.path(), 1, false);
        let report = s.run_loop(&mut thermal, &mut color).unwrap();
        assert_eq!(report.pairs.len(), 4);
        assert_eq!(s.state(), SessionState::Stopped);

        // A stopped session cannot be re-run.
        let err = s.run_loop(&mut thermal, &mut color).unwrap_err();
        assert!(matches!(err, SessionError::NotArmed(SessionState::Stopped)));
    }
}
