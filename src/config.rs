use std::{num::NonZeroU32, path::PathBuf, time::Duration};

use clap::Parser;

use crate::detector::ModelArtifact;
use crate::error::ConfigError;
use crate::printer::{Firmware, PrinterMode};

/// Command-line arguments for the Print Sentinel monitor.
///
/// Every flag can also be set through the environment variable shown in
/// `--help`, which is how containerized deployments configure the monitor.
#[derive(Debug, Clone, Parser)]
#[command(name = "print-sentinel", version, about = "3D print failure monitor")]
pub struct Cli {
    /// Camera device index (e.g. 0) or path to a recorded video, image, or directory of frames.
    #[arg(long, env = "SOURCE", default_value = "0")]
    pub source: String,

    /// Darknet network definition.
    #[arg(long, env = "MODEL_CFG", default_value = "./model.cfg")]
    pub model_cfg: PathBuf,

    /// Trained model weights.
    #[arg(long, env = "WEIGHTS_FILE", default_value = "./model/model-weights.darknet")]
    pub weights: PathBuf,

    /// Class labels, one per line in class index order.
    #[arg(long, env = "LABEL_FILE", default_value = "./labels.txt")]
    pub labels: PathBuf,

    /// Minimum confidence for a detection to count (0-1).
    #[arg(long, env = "CONF_THRESHOLD", allow_negative_numbers = true, default_value_t = constants::CONFIDENCE_THRESHOLD)]
    pub conf: f32,

    /// Overlap above which boxes are merged, across all classes (0-1).
    #[arg(long, env = "IOU_THRESHOLD", allow_negative_numbers = true, default_value_t = constants::IOU_THRESHOLD)]
    pub iou: f32,

    /// Consecutive frames with a detection required before pausing.
    #[arg(long, env = "PERSISTENCE_FRAMES", default_value_t = constants::PERSISTENCE_FRAMES)]
    pub persistence: u32,

    /// Frames analysed per second.
    #[arg(long, env = "TARGET_FPS", allow_negative_numbers = true, default_value_t = constants::TARGET_FPS)]
    pub fps: f64,

    /// Write annotated frames to the output directory.
    #[arg(long, env = "RENDER")]
    pub render: bool,

    /// Where annotated frames and pause snapshots are written.
    #[arg(long, env = "OUTPUT_DIR", default_value = "./output")]
    pub output_dir: PathBuf,

    /// TrueType font for overlay text. Boxes and the hit bar are drawn without it.
    #[arg(long, env = "FONT_FILE")]
    pub font: Option<PathBuf>,

    /// Flip frames vertically (camera mounted upside-down).
    #[arg(long, env = "FLIP_IMAGE")]
    pub flip: bool,

    /// Consecutive failed grabs tolerated from a live camera.
    #[arg(long, env = "MAX_GRAB_FAILURES", default_value_t = constants::MAX_GRAB_FAILURES)]
    pub max_grab_failures: u32,

    /// Printer actuation mode.
    #[arg(long, env = "PRINTER_MODE", value_enum, ignore_case = true, default_value_t = PrinterMode::Mock)]
    pub printer_mode: PrinterMode,

    /// Printer firmware API flavour used in live mode.
    #[arg(long, env = "PRINTER_FIRMWARE", value_enum, ignore_case = true, default_value_t = Firmware::Moonraker)]
    pub printer_firmware: Firmware,

    /// Base URL of the firmware API (e.g. http://printer.local:7125).
    #[arg(long, env = "PRINTER_API_URL")]
    pub printer_url: Option<String>,

    /// API key sent as X-Api-Key.
    #[arg(long, env = "PRINTER_API_KEY", hide_env_values = true)]
    pub printer_api_key: Option<String>,

    /// Timeout for each firmware request, in seconds.
    #[arg(long, env = "PRINTER_TIMEOUT_SECS", default_value_t = constants::PRINTER_TIMEOUT_SECONDS)]
    pub printer_timeout_secs: u64,

    /// Discord webhook notified when the printer is paused.
    #[arg(long, env = "DISCORD_WEBHOOK", hide_env_values = true)]
    pub discord_webhook: Option<String>,
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// Live camera by device index.
    Device(u32),
    /// Recorded video, single image, or directory of frames.
    Path(PathBuf),
}

impl SourceDescriptor {
    /// An all-digit string is a device index; anything else is a path.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<u32>() {
            Ok(index) => SourceDescriptor::Device(index),
            Err(_) => SourceDescriptor::Path(PathBuf::from(trimmed)),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, SourceDescriptor::Device(_))
    }
}

impl std::fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceDescriptor::Device(index) => write!(f, "camera #{}", index),
            SourceDescriptor::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Immutable detector settings bound at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub artifact: ModelArtifact,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub persistence_frames: NonZeroU32,
}

/// Frame acquisition settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub descriptor: SourceDescriptor,
    pub flip_vertical: bool,
    pub max_grab_failures: u32,
}

/// Annotated-frame output settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    pub output_dir: PathBuf,
    pub font: Option<PathBuf>,
}

/// Live printer connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterConfig {
    pub mode: PrinterMode,
    pub firmware: Firmware,
    pub api_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Validated configuration for one monitoring session.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub detector: DetectorConfig,
    pub source: SourceConfig,
    pub sample_interval: Duration,
    pub render: Option<RenderConfig>,
    pub printer: PrinterConfig,
    pub discord_webhook: Option<String>,
}

impl Config {
    /// Parse the process arguments and environment, then validate them.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any value is out of range or a setting
    /// required by the selected printer mode is missing. Model and source
    /// paths are checked when those components open, so their errors carry
    /// the matching remediation hint.
    pub fn load() -> Result<Self, ConfigError> {
        Cli::parse().into_config()
    }
}

impl Cli {
    /// Validate the raw arguments into a [`Config`].
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let confidence_threshold = unit_interval("conf", self.conf)?;
        let iou_threshold = unit_interval("iou", self.iou)?;

        let persistence_frames = NonZeroU32::new(self.persistence)
            .ok_or_else(|| ConfigError::invalid("persistence", self.persistence, "must be at least 1"))?;

        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(ConfigError::invalid("fps", self.fps, "must be a positive number"));
        }
        let sample_interval = Duration::try_from_secs_f64(1.0 / self.fps)
            .map_err(|_| ConfigError::invalid("fps", self.fps, "is too small to schedule"))?;

        if self.source.trim().is_empty() {
            return Err(ConfigError::invalid("source", &self.source, "must not be empty"));
        }

        if let Some(font) = &self.font {
            if !font.is_file() {
                return Err(ConfigError::MissingFile { path: font.clone() });
            }
        }

        if self.printer_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "printer-timeout-secs",
                self.printer_timeout_secs,
                "must be at least 1",
            ));
        }

        let api_url = match (self.printer_mode, self.printer_url) {
            (PrinterMode::Live, None) => {
                return Err(ConfigError::Missing {
                    field: "printer-url".to_string(),
                    context: "when PRINTER_MODE is live".to_string(),
                });
            }
            (_, Some(url)) => url.trim_end_matches('/').to_string(),
            (PrinterMode::Mock, None) => String::new(),
        };

        let render = self.render.then(|| RenderConfig {
            output_dir: self.output_dir.clone(),
            font: self.font.clone(),
        });

        Ok(Config {
            detector: DetectorConfig {
                artifact: ModelArtifact {
                    model_cfg: self.model_cfg,
                    weights: self.weights,
                    labels: self.labels,
                },
                confidence_threshold,
                iou_threshold,
                persistence_frames,
            },
            source: SourceConfig {
                descriptor: SourceDescriptor::parse(&self.source),
                flip_vertical: self.flip,
                max_grab_failures: self.max_grab_failures.max(1),
            },
            sample_interval,
            render,
            printer: PrinterConfig {
                mode: self.printer_mode,
                firmware: self.printer_firmware,
                api_url,
                api_key: self.printer_api_key.filter(|key| !key.is_empty()),
                timeout: Duration::from_secs(self.printer_timeout_secs),
            },
            discord_webhook: self.discord_webhook.filter(|url| !url.is_empty()),
        })
    }
}

fn unit_interval(field: &str, value: f32) -> Result<f32, ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::invalid(field, value, "must be between 0 and 1"))
    }
}

/// Defaults used throughout the system.
pub mod constants {
    /// Confidence needed to count a detection.
    pub const CONFIDENCE_THRESHOLD: f32 = 0.55;

    /// IoU above which overlapping boxes are merged.
    pub const IOU_THRESHOLD: f32 = 0.50;

    /// Consecutive hit frames before the printer is paused.
    pub const PERSISTENCE_FRAMES: u32 = 5;

    /// Frames analysed per second; one is enough for slow-developing failures.
    pub const TARGET_FPS: f64 = 1.0;

    /// Consecutive failed grabs tolerated from a live camera.
    pub const MAX_GRAB_FAILURES: u32 = 5;

    /// Timeout for each printer firmware request.
    pub const PRINTER_TIMEOUT_SECONDS: u64 = 3;
}
