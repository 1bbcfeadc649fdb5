use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::alerts::AlertService;
use crate::config::Config;
use crate::detector::{Detection, FailureDetector};
use crate::error::MonitorError;
use crate::frame_source::{self, Frame, FrameSource, Grab};
use crate::persistence::{FilterState, PersistenceFilter};
use crate::printer::{self, PrinterActuator};
use crate::render::{self, FrameRenderer, HitCounter};

/// Why the loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The recorded source ran out of frames.
    Exhausted,
    /// The quit flag was raised.
    Quit,
}

/// What the actuation step did in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actuation {
    /// The filter is not triggered.
    Idle,
    /// Triggered, but a pause was already issued this session.
    AlreadyPaused,
    /// Triggered, but the printer reported no running job.
    NotPrinting,
    /// The printer accepted the pause.
    Paused,
    /// The printer rejected the pause or could not be reached.
    Rejected,
}

/// Session state owned by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorState {
    pub consecutive_hits: u32,
    pub paused: bool,
}

/// Outcome of one processed frame.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// 1-based cycle number.
    pub cycle: u64,
    pub frame_index: u64,
    pub detections: Vec<Detection>,
    /// Hit count after the cycle, including any reset after a pause.
    pub consecutive_hits: u32,
    pub filter_state: FilterState,
    pub actuation: Actuation,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Processed(CycleReport),
    Stopped(StopReason),
}

/// Totals for a finished monitoring session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub hit_frames: u64,
    pub pause_attempts: u64,
    pub pauses: u64,
    pub stop_reason: StopReason,
}

/// Sleeps out the remainder of a fixed sampling interval.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    interval: Duration,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Time left in the interval after `elapsed`; zero when the cycle overran.
    pub fn remaining(&self, elapsed: Duration) -> Duration {
        self.interval.saturating_sub(elapsed)
    }

    pub fn wait(&self, cycle_started: Instant) {
        let remaining = self.remaining(cycle_started.elapsed());
        if !remaining.is_zero() {
            thread::sleep(remaining);
        }
    }
}

/// The real-time control loop.
///
/// Each cycle runs strictly in order on the calling thread: grab a frame,
/// detect failures, update the persistence filter, pause the printer when the
/// filter is triggered, render, then sleep out the sampling interval. The
/// quit flag is only checked at the top of a cycle.
pub struct Monitor {
    source: Box<dyn FrameSource>,
    detector: FailureDetector,
    filter: PersistenceFilter,
    printer: Box<dyn PrinterActuator>,
    renderer: Option<FrameRenderer>,
    alerts: Option<AlertService>,
    throttle: Throttle,
    shutdown: Arc<AtomicBool>,
    paused: bool,
    cycles: u64,
    hit_frames: u64,
    pause_attempts: u64,
    pauses: u64,
}

impl Monitor {
    /// Build a monitor from already-constructed parts. `source` must be open.
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: FailureDetector,
        filter: PersistenceFilter,
        printer: Box<dyn PrinterActuator>,
        sample_interval: Duration,
    ) -> Self {
        Self {
            source,
            detector,
            filter,
            printer,
            renderer: None,
            alerts: None,
            throttle: Throttle::new(sample_interval),
            shutdown: Arc::new(AtomicBool::new(false)),
            paused: false,
            cycles: 0,
            hit_frames: 0,
            pause_attempts: 0,
            pauses: 0,
        }
    }

    /// Load the model, open the source and connect the printer described by `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`MonitorError`] if the model cannot be loaded, the source
    /// cannot be opened, the output directory cannot be prepared, or an HTTP
    /// client cannot be built. Nothing is left open on failure.
    pub fn start(config: &Config) -> Result<Self, MonitorError> {
        let detector = FailureDetector::load(&config.detector)?;
        info!(
            "Failure detector initialized (conf {:.2}, iou {:.2})",
            detector.confidence_threshold(),
            detector.iou_threshold()
        );

        let renderer = match &config.render {
            Some(render_config) => {
                let renderer = FrameRenderer::new(render_config)?;
                info!(
                    "Annotated frames will be written to {}",
                    renderer.output_dir().display()
                );
                Some(renderer)
            }
            None => None,
        };

        let printer = printer::connect(&config.printer)?;
        let alerts = match &config.discord_webhook {
            Some(webhook) => Some(AlertService::new(webhook.clone())?),
            None => None,
        };

        // Opened last so an earlier failure never leaves the camera held.
        let source = frame_source::open_source(&config.source)?;
        let filter = PersistenceFilter::new(config.detector.persistence_frames);

        let mut monitor = Self::new(source, detector, filter, printer, config.sample_interval);
        if let Some(renderer) = renderer {
            monitor = monitor.with_renderer(renderer);
        }
        if let Some(alerts) = alerts {
            info!("Pause alerts enabled");
            monitor = monitor.with_alerts(alerts);
        }
        Ok(monitor)
    }

    pub fn with_renderer(mut self, renderer: FrameRenderer) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_alerts(mut self, alerts: AlertService) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Flag that stops the loop at the top of the next cycle when set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn state(&self) -> MonitorState {
        MonitorState {
            consecutive_hits: self.filter.consecutive_hits(),
            paused: self.paused,
        }
    }

    /// Record that the operator resumed the print, re-arming the monitor.
    pub fn resume(&mut self) {
        if self.paused {
            info!("Print resumed; monitoring re-armed");
        }
        self.paused = false;
        self.filter.reset();
    }

    /// Run until the source is exhausted or the quit flag is raised.
    ///
    /// The source is closed on every exit path.
    ///
    /// # Errors
    ///
    /// Returns an error only when a live source is lost.
    pub fn run(&mut self) -> Result<RunSummary, MonitorError> {
        info!(
            "Monitoring {}: pause after {} consecutive frame(s), one frame every {:.2}s",
            self.source.name(),
            self.filter.persistence_frames(),
            self.throttle.interval.as_secs_f64()
        );

        let stop_reason = loop {
            let cycle_started = Instant::now();
            match self.step() {
                Ok(CycleOutcome::Processed(_)) => {}
                Ok(CycleOutcome::Stopped(reason)) => break reason,
                Err(e) => {
                    self.source.close();
                    return Err(e);
                }
            }
            self.throttle.wait(cycle_started);
        };

        self.source.close();

        let summary = self.summary(stop_reason);
        match stop_reason {
            StopReason::Exhausted => info!("Stream ended."),
            StopReason::Quit => info!("Quit requested."),
        }
        info!(
            "Monitoring stopped after {} cycle(s): {} hit frame(s), {} pause(s) issued",
            summary.cycles, summary.hit_frames, summary.pauses
        );
        Ok(summary)
    }

    /// Run one cycle without throttling.
    pub fn step(&mut self) -> Result<CycleOutcome, MonitorError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(CycleOutcome::Stopped(StopReason::Quit));
        }

        let frame = match self.source.grab_frame()? {
            Grab::Frame(frame) => frame,
            Grab::Exhausted => return Ok(CycleOutcome::Stopped(StopReason::Exhausted)),
        };
        self.cycles += 1;

        let detections = match self.detector.detect(&frame) {
            Ok(detections) => detections,
            Err(e) => {
                warn!("Detection failed on frame {}: {}", frame.index, e);
                Vec::new()
            }
        };

        let triggered = self.filter.observe(&detections);
        let hits_before_actuation = self.filter.consecutive_hits();
        if !detections.is_empty() {
            self.hit_frames += 1;
            self.log_hit(&detections);
        } else {
            debug!("Frame {}: no failure detected", frame.index);
        }

        let actuation = if triggered { self.actuate() } else { Actuation::Idle };

        self.present(&frame, &detections, hits_before_actuation, actuation);

        Ok(CycleOutcome::Processed(CycleReport {
            cycle: self.cycles,
            frame_index: frame.index,
            detections,
            consecutive_hits: self.filter.consecutive_hits(),
            filter_state: self.filter.state(),
            actuation,
        }))
    }

    fn actuate(&mut self) -> Actuation {
        if self.paused {
            debug!("Failure still confirmed; printer already paused");
            return Actuation::AlreadyPaused;
        }

        // Printer state is queried fresh for every decision.
        if !self.printer.is_printing() {
            info!("Failure confirmed but the printer is not printing; nothing to pause");
            return Actuation::NotPrinting;
        }

        warn!("*** DEFECT CONFIRMED - Pausing printer! ***");
        self.pause_attempts += 1;
        if self.printer.pause_print() {
            self.paused = true;
            self.pauses += 1;
            self.filter.reset();
            info!("Printer paused. Monitoring continues.");
            Actuation::Paused
        } else {
            error!("Printer did not accept the pause; will retry on the next confirmed frame");
            Actuation::Rejected
        }
    }

    fn log_hit(&self, detections: &[Detection]) {
        for detection in detections {
            let b = detection.bounding_box;
            warn!(
                "Hit {}/{}: {} print failure with {:.2}% confidence at ({:.0}, {:.0})-({:.0}, {:.0})",
                self.filter.consecutive_hits(),
                self.filter.persistence_frames(),
                detection.class_name,
                detection.confidence_percent(),
                b.x1,
                b.y1,
                b.x2,
                b.y2
            );
        }
    }

    /// Rendering and alerts. Failures here are logged and never stop the loop.
    fn present(&self, frame: &Frame, detections: &[Detection], hits: u32, actuation: Actuation) {
        let paused_now = actuation == Actuation::Paused;
        if self.renderer.is_none() && !(paused_now && self.alerts.is_some()) {
            return;
        }

        let shown_hits = if paused_now {
            hits
        } else {
            self.filter.consecutive_hits()
        };
        let counter = HitCounter {
            hits: shown_hits,
            window: self.filter.persistence_frames(),
        };

        let annotated = match &self.renderer {
            Some(renderer) => {
                let annotated = renderer.annotate(&frame.image, detections, counter);
                if let Err(e) = renderer.write_latest(&annotated) {
                    error!("Failed to write annotated frame: {:#}", e);
                }
                if paused_now {
                    match renderer.write_pause_snapshot(&annotated) {
                        Ok(path) => info!("Pause snapshot saved to {}", path.display()),
                        Err(e) => error!("Failed to save pause snapshot: {:#}", e),
                    }
                }
                annotated
            }
            None => frame.image.clone(),
        };

        if !paused_now {
            return;
        }
        if let Some(alerts) = &self.alerts {
            let jpeg = match render::encode_jpeg(&annotated) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    error!("Failed to encode pause image: {:#}", e);
                    None
                }
            };
            match alerts.send_print_pause_alert(hits, detections, jpeg.as_deref()) {
                Ok(()) => info!("Pause alert sent to Discord"),
                Err(e) => error!("Failed to send pause alert: {:#}", e),
            }
        }
    }

    fn summary(&self, stop_reason: StopReason) -> RunSummary {
        RunSummary {
            cycles: self.cycles,
            hit_frames: self.hit_frames,
            pause_attempts: self.pause_attempts,
            pauses: self.pauses,
            stop_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_never_goes_negative() {
        let throttle = Throttle::new(Duration::from_millis(1000));
        assert_eq!(
            throttle.remaining(Duration::from_millis(250)),
            Duration::from_millis(750)
        );
        assert_eq!(throttle.remaining(Duration::from_secs(3)), Duration::ZERO);
    }

    #[test]
    fn zero_interval_does_not_sleep() {
        let throttle = Throttle::new(Duration::ZERO);
        let started = Instant::now();
        throttle.wait(started);
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
