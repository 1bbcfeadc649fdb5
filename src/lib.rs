//! Print Sentinel - camera-based 3D print failure monitor.
//!
//! Watches the build plate through a camera or a recording, runs a trained
//! object detector on each sampled frame, and pauses the printer once a
//! failure has been seen in several consecutive frames.
//!
//! # Core Components
//!
//! * [`frame_source`] - Frame acquisition from cameras, videos and image sequences
//! * [`detector`] - Failure detection with class-agnostic overlap suppression
//! * [`persistence`] - Debounce filter turning per-frame hits into a pause decision
//! * [`printer`] - Mock and live (Moonraker / OctoPrint) printer actuation
//! * [`monitor`] - The control loop tying the pieces together
//! * [`render`] - Annotated frame output
//! * [`alerts`] - Discord notification when the printer is paused
//! * [`config`] - Command-line and environment configuration
//! * [`error`] - Error types and exit codes
//!
//! # Quick Start
//!
//! ```no_run
//! use print_sentinel::{Config, Monitor};
//!
//! let config = Config::load()?;
//! let mut monitor = Monitor::start(&config)?;
//! let summary = monitor.run()?;
//! println!("processed {} frames", summary.cycles);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod alerts;
pub mod config;
#[cfg(feature = "darknet")]
pub mod darknet_backend;
pub mod detector;
pub mod error;
pub mod frame_source;
pub mod monitor;
pub mod persistence;
pub mod printer;
pub mod render;
#[cfg(feature = "opencv")]
pub mod video_capture;

// Re-export commonly used types for convenience
pub use config::{Config, DetectorConfig, SourceDescriptor};
pub use detector::{Detection, DetectionModel, FailureClass, FailureDetector};
pub use error::{AcquisitionError, ConfigError, ModelLoadError, MonitorError};
pub use frame_source::{Frame, FrameSource, Grab};
pub use monitor::{Actuation, Monitor, RunSummary, StopReason};
pub use persistence::{FilterState, PersistenceFilter};
pub use printer::{LivePrinter, MockPrinter, PrinterActuator, PrinterMode};
