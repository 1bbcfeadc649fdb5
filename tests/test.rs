use std::{
    cell::Cell,
    num::NonZeroU32,
    path::{Path, PathBuf},
    rc::Rc,
    sync::atomic::Ordering,
    time::Duration,
};

use anyhow::{Result, bail};
use image::{Rgb, RgbImage};
use print_sentinel::config::{PrinterConfig, RenderConfig, SourceConfig};
use print_sentinel::detector::{Candidate, ModelArtifact};
use print_sentinel::frame_source::{ImageSequenceSource, open_source};
use print_sentinel::monitor::CycleOutcome;
use print_sentinel::printer::Firmware;
use print_sentinel::render::FrameRenderer;
use print_sentinel::{
    AcquisitionError, Actuation, Config, DetectionModel, DetectorConfig, FailureClass,
    FailureDetector, FilterState, FrameSource, Monitor, MonitorError, PersistenceFilter,
    PrinterActuator, PrinterMode, SourceDescriptor, StopReason,
};

/// Reports a failure on the frames whose call index is `true` in the script.
struct ScriptedModel {
    script: Vec<bool>,
    calls: usize,
}

impl DetectionModel for ScriptedModel {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn infer(&mut self, _frame: &RgbImage, _threshold: f32, _iou: f32) -> Result<Vec<Candidate>> {
        let hit = self.script.get(self.calls).copied().unwrap_or(false);
        self.calls += 1;
        if !hit {
            return Ok(Vec::new());
        }
        Ok(vec![centered_candidate()])
    }
}

fn centered_candidate() -> Candidate {
    Candidate {
        class_id: 0,
        confidence: 0.9,
        center_x: 0.5,
        center_y: 0.5,
        width: 0.5,
        height: 0.5,
    }
}

#[derive(Clone, Copy)]
enum Step {
    Hit,
    Clean,
    Fail,
}

/// Like `ScriptedModel`, but a `Fail` step makes inference itself error out.
struct FlakyModel {
    script: Vec<Step>,
    calls: usize,
}

impl DetectionModel for FlakyModel {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn infer(&mut self, _frame: &RgbImage, _threshold: f32, _iou: f32) -> Result<Vec<Candidate>> {
        let step = self.script.get(self.calls).copied().unwrap_or(Step::Clean);
        self.calls += 1;
        match step {
            Step::Hit => Ok(vec![centered_candidate()]),
            Step::Clean => Ok(Vec::new()),
            Step::Fail => bail!("backend crashed on call {}", self.calls),
        }
    }
}

#[derive(Clone, Default)]
struct Calls {
    status: Rc<Cell<u32>>,
    pause: Rc<Cell<u32>>,
}

struct StubPrinter {
    printing: bool,
    accepts_pause: bool,
    calls: Calls,
}

impl PrinterActuator for StubPrinter {
    fn is_printing(&self) -> bool {
        self.calls.status.set(self.calls.status.get() + 1);
        self.printing
    }

    fn pause_print(&self) -> bool {
        self.calls.pause.set(self.calls.pause.get() + 1);
        self.accepts_pause
    }

    fn mode(&self) -> PrinterMode {
        PrinterMode::Mock
    }
}

fn write_frames(dir: &Path, count: usize) -> PathBuf {
    let frames = dir.join("frames");
    std::fs::create_dir_all(&frames).unwrap();
    for i in 0..count {
        let image = RgbImage::from_pixel(16, 16, Rgb([i as u8, 40, 40]));
        image.save(frames.join(format!("frame_{:03}.png", i))).unwrap();
    }
    frames
}

fn detector_config(persistence: u32) -> DetectorConfig {
    DetectorConfig {
        artifact: ModelArtifact {
            model_cfg: PathBuf::from("models/missing.cfg"),
            weights: PathBuf::from("models/missing.weights"),
            labels: PathBuf::from("models/missing.names"),
        },
        confidence_threshold: 0.55,
        iou_threshold: 0.5,
        persistence_frames: NonZeroU32::new(persistence).unwrap(),
    }
}

fn build_monitor(
    dir: &Path,
    script: Vec<bool>,
    persistence: u32,
    printing: bool,
    accepts_pause: bool,
) -> (Monitor, Calls) {
    let frame_count = script.len();
    build_monitor_with_model(
        dir,
        Box::new(ScriptedModel { script, calls: 0 }),
        frame_count,
        persistence,
        printing,
        accepts_pause,
    )
}

fn build_monitor_with_model(
    dir: &Path,
    model: Box<dyn DetectionModel>,
    frame_count: usize,
    persistence: u32,
    printing: bool,
    accepts_pause: bool,
) -> (Monitor, Calls) {
    let frames = write_frames(dir, frame_count);
    let mut source = ImageSequenceSource::new(frames);
    source.open().unwrap();

    let config = detector_config(persistence);
    let detector = FailureDetector::with_model(model, vec![FailureClass::Spaghetti], &config);

    let calls = Calls::default();
    let printer = StubPrinter {
        printing,
        accepts_pause,
        calls: calls.clone(),
    };

    let monitor = Monitor::new(
        Box::new(source),
        detector,
        PersistenceFilter::new(config.persistence_frames),
        Box::new(printer),
        Duration::ZERO,
    );
    (monitor, calls)
}

fn step_all(monitor: &mut Monitor) -> Vec<print_sentinel::monitor::CycleReport> {
    let mut reports = Vec::new();
    while let CycleOutcome::Processed(report) = monitor.step().unwrap() {
        reports.push(report);
    }
    reports
}

#[test]
fn sustained_failure_pauses_once_and_resets_hits() {
    let dir = tempfile::tempdir().unwrap();
    let (mut monitor, calls) = build_monitor(dir.path(), vec![true; 3], 3, true, true);

    let reports = step_all(&mut monitor);
    let actuations: Vec<_> = reports.iter().map(|r| r.actuation).collect();
    assert_eq!(
        actuations,
        vec![Actuation::Idle, Actuation::Idle, Actuation::Paused]
    );
    assert_eq!(reports[1].consecutive_hits, 2);
    assert_eq!(reports[2].consecutive_hits, 0);
    assert_eq!(calls.pause.get(), 1);

    let state = monitor.state();
    assert!(state.paused);
    assert_eq!(state.consecutive_hits, 0);
}

#[test]
fn interrupted_run_delays_the_pause() {
    let dir = tempfile::tempdir().unwrap();
    let script = vec![true, true, false, true, true, true];
    let (mut monitor, calls) = build_monitor(dir.path(), script, 3, true, true);

    let reports = step_all(&mut monitor);
    let hits: Vec<u32> = reports.iter().map(|r| r.consecutive_hits).collect();
    // last entry is 0 because the pause resets the counter
    assert_eq!(hits, vec![1, 2, 0, 1, 2, 0]);
    assert!(reports[..5].iter().all(|r| r.actuation == Actuation::Idle));
    assert_eq!(reports[5].actuation, Actuation::Paused);
    assert_eq!(reports[5].cycle, 6);
    assert_eq!(calls.pause.get(), 1);
}

#[test]
fn inference_error_counts_as_clean_frame() {
    let dir = tempfile::tempdir().unwrap();
    let script = vec![Step::Hit, Step::Hit, Step::Fail, Step::Hit, Step::Hit, Step::Hit];
    let frame_count = script.len();
    let model = FlakyModel { script, calls: 0 };
    let (mut monitor, calls) =
        build_monitor_with_model(dir.path(), Box::new(model), frame_count, 3, true, true);

    let reports = step_all(&mut monitor);
    assert_eq!(reports.len(), 6);

    assert!(reports[2].detections.is_empty());
    assert_eq!(reports[2].consecutive_hits, 0);
    assert_eq!(reports[2].filter_state, FilterState::Idle);

    let hits: Vec<u32> = reports.iter().map(|r| r.consecutive_hits).collect();
    assert_eq!(hits, vec![1, 2, 0, 1, 2, 0]);
    assert!(reports[..5].iter().all(|r| r.actuation == Actuation::Idle));
    assert_eq!(reports[5].actuation, Actuation::Paused);
    assert_eq!(calls.pause.get(), 1);
}

#[test]
fn clean_stream_runs_to_exhaustion_without_actuation() {
    let dir = tempfile::tempdir().unwrap();
    let (mut monitor, calls) = build_monitor(dir.path(), vec![false; 10], 3, true, true);

    let summary = monitor.run().unwrap();
    assert_eq!(summary.cycles, 10);
    assert_eq!(summary.hit_frames, 0);
    assert_eq!(summary.pause_attempts, 0);
    assert_eq!(summary.stop_reason, StopReason::Exhausted);
    assert_eq!(calls.status.get(), 0);
    assert_eq!(calls.pause.get(), 0);
}

#[test]
fn missing_source_path_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("no_such_recording");
    let result = open_source(&SourceConfig {
        descriptor: SourceDescriptor::Path(missing.clone()),
        flip_vertical: false,
        max_grab_failures: 5,
    });

    match result {
        Err(AcquisitionError::NotFound { path }) => assert_eq!(path, missing),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("missing path opened"),
    }
}

#[test]
fn rejected_pause_keeps_count_and_retries() {
    let dir = tempfile::tempdir().unwrap();
    let (mut monitor, calls) = build_monitor(dir.path(), vec![true; 4], 2, true, false);

    let reports = step_all(&mut monitor);
    assert_eq!(reports[0].actuation, Actuation::Idle);
    assert_eq!(reports[1].actuation, Actuation::Rejected);
    assert_eq!(reports[1].consecutive_hits, 2);
    assert_eq!(reports[1].filter_state, FilterState::Triggered);
    assert_eq!(reports[2].actuation, Actuation::Rejected);
    assert_eq!(calls.pause.get(), 3);

    let state = monitor.state();
    assert!(!state.paused);
    assert_eq!(state.consecutive_hits, 4);
}

#[test]
fn idle_printer_is_not_paused_and_count_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let (mut monitor, calls) = build_monitor(dir.path(), vec![true; 3], 2, false, true);

    let reports = step_all(&mut monitor);
    assert_eq!(reports[1].actuation, Actuation::NotPrinting);
    assert_eq!(reports[2].actuation, Actuation::NotPrinting);
    assert_eq!(reports[2].consecutive_hits, 3);
    assert_eq!(calls.status.get(), 2);
    assert_eq!(calls.pause.get(), 0);
    assert!(!monitor.state().paused);
}

#[test]
fn paused_session_does_not_pause_again() {
    let dir = tempfile::tempdir().unwrap();
    let (mut monitor, calls) = build_monitor(dir.path(), vec![true; 3], 1, true, true);

    let reports = step_all(&mut monitor);
    assert_eq!(reports[0].actuation, Actuation::Paused);
    assert_eq!(reports[1].actuation, Actuation::AlreadyPaused);
    assert_eq!(reports[2].actuation, Actuation::AlreadyPaused);
    assert_eq!(calls.pause.get(), 1);
}

#[test]
fn resume_rearms_the_monitor() {
    let dir = tempfile::tempdir().unwrap();
    let (mut monitor, calls) = build_monitor(dir.path(), vec![true; 3], 1, true, true);

    let CycleOutcome::Processed(first) = monitor.step().unwrap() else {
        panic!("expected a frame");
    };
    assert_eq!(first.actuation, Actuation::Paused);

    monitor.resume();
    assert!(!monitor.state().paused);

    let CycleOutcome::Processed(second) = monitor.step().unwrap() else {
        panic!("expected a frame");
    };
    assert_eq!(second.actuation, Actuation::Paused);
    assert_eq!(calls.pause.get(), 2);
}

#[test]
fn quit_flag_stops_before_the_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let (mut monitor, _calls) = build_monitor(dir.path(), vec![true; 5], 3, true, true);

    monitor.shutdown_handle().store(true, Ordering::SeqCst);
    let summary = monitor.run().unwrap();
    assert_eq!(summary.stop_reason, StopReason::Quit);
    assert_eq!(summary.cycles, 0);
}

#[test]
fn rendering_writes_latest_frame_and_pause_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let output_dir = dir.path().join("out");
    let (monitor, _calls) = build_monitor(dir.path(), vec![true; 2], 2, true, true);
    let renderer = FrameRenderer::new(&RenderConfig {
        output_dir: output_dir.clone(),
        font: None,
    })
    .unwrap();
    let mut monitor = monitor.with_renderer(renderer);

    let summary = monitor.run().unwrap();
    assert_eq!(summary.pauses, 1);
    assert!(output_dir.join("latest.jpg").is_file());

    let snapshots = std::fs::read_dir(&output_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("pause_"))
        .count();
    assert_eq!(snapshots, 1);
}

#[test]
fn missing_model_fails_startup_with_model_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let frames = write_frames(dir.path(), 1);
    let config = Config {
        detector: detector_config(5),
        source: SourceConfig {
            descriptor: SourceDescriptor::Path(frames),
            flip_vertical: false,
            max_grab_failures: 5,
        },
        sample_interval: Duration::ZERO,
        render: None,
        printer: PrinterConfig {
            mode: PrinterMode::Mock,
            firmware: Firmware::Moonraker,
            api_url: String::new(),
            api_key: None,
            timeout: Duration::from_secs(3),
        },
        discord_webhook: None,
    };

    let err = match Monitor::start(&config) {
        Err(err) => err,
        Ok(_) => panic!("monitor started without a model"),
    };
    assert!(matches!(err, MonitorError::ModelLoad(_)));
    assert_eq!(err.exit_code(), 3);
}
