//! Error types for the Print Sentinel monitor.
//!
//! Only startup-time conditions surface as errors to the caller. Steady-state
//! problems (a bad frame, an unreachable printer) are logged where they occur
//! and converted into safe defaults, so they never reach these types.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error for fatal monitor conditions.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The frame source could not be opened or failed permanently.
    #[error("Acquisition error: {0}")]
    Acquisition(#[from] AcquisitionError),

    /// The detection model could not be loaded.
    #[error("Model load error: {0}")]
    ModelLoad(#[from] ModelLoadError),

    /// Invalid runtime configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The live printer client could not be set up.
    #[error("Printer error: {0}")]
    Printer(#[from] PrinterError),

    /// Any other failure during startup (output directory, signal handler).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MonitorError {
    /// Process exit status for this error.
    ///
    /// Each fatal startup category has its own status so supervisors can tell
    /// a missing model apart from a missing camera.
    pub fn exit_code(&self) -> i32 {
        match self {
            MonitorError::Config(_) => 2,
            MonitorError::ModelLoad(_) => 3,
            MonitorError::Acquisition(_) => 4,
            MonitorError::Printer(_) | MonitorError::Other(_) => 1,
        }
    }

    /// A short operator-facing hint on how to fix the problem.
    pub fn remediation(&self) -> &'static str {
        match self {
            MonitorError::Config(_) => "check the command-line flags and environment variables",
            MonitorError::ModelLoad(_) => {
                "check MODEL_CFG, WEIGHTS_FILE and LABEL_FILE, or run training first"
            }
            MonitorError::Acquisition(AcquisitionError::DeviceUnavailable { .. }) => {
                "check the device index and that the camera is connected"
            }
            MonitorError::Acquisition(AcquisitionError::Unsupported { .. }) => {
                "use valid image frames, or rebuild with the `opencv` feature for cameras and video"
            }
            MonitorError::Acquisition(_) => "check that the source path exists and is readable",
            MonitorError::Printer(_) => "check PRINTER_API_URL and PRINTER_TIMEOUT_SECS",
            MonitorError::Other(_) => "see the log output above for details",
        }
    }
}

/// Errors raised while opening or reading a frame source.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    /// The recorded stream path does not exist.
    #[error("source not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// The capture device could not be opened.
    #[error("camera device {index} could not be opened: {reason}")]
    DeviceUnavailable { index: u32, reason: String },

    /// The source kind is not supported by this build, the file type is
    /// unknown, or none of its frames can be decoded.
    #[error("unsupported source '{source_name}': {reason}")]
    Unsupported { source_name: String, reason: String },

    /// The source exists but contains nothing that can be replayed.
    #[error("source '{}' contains no image frames", path.display())]
    Empty { path: PathBuf },

    /// A frame could not be read or decoded.
    #[error("failed to read frame from '{source_name}': {reason}")]
    ReadFailed { source_name: String, reason: String },

    /// A live source failed too many times in a row.
    #[error("source '{source_name}' failed {attempts} consecutive grabs: {last_reason}")]
    Lost {
        source_name: String,
        attempts: u32,
        last_reason: String,
    },

    /// `grab_frame` was called on a closed source.
    #[error("source '{source_name}' is not open")]
    NotOpen { source_name: String },
}

/// Errors raised while loading the detection model.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    /// A model artifact file is missing.
    #[error("model file not found: {}", path.display())]
    MissingFile { path: PathBuf },

    /// The labels file could not be read.
    #[error("failed to read labels from '{}': {reason}", path.display())]
    LabelsReadFailed { path: PathBuf, reason: String },

    /// A label does not name a known failure class.
    #[error("unknown failure class '{label}' on line {line} of '{}'", path.display())]
    UnknownLabel {
        path: PathBuf,
        line: usize,
        label: String,
    },

    /// The labels file has no entries.
    #[error("labels file '{}' is empty", path.display())]
    NoLabels { path: PathBuf },

    /// The network config or weights could not be parsed.
    #[error("failed to load network from '{}': {reason}", path.display())]
    NetworkLoadFailed { path: PathBuf, reason: String },

    /// This build has no inference backend.
    #[error("no inference backend compiled in (enable the `darknet` feature)")]
    BackendUnavailable,
}

/// Errors related to configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric value is outside its allowed range.
    #[error("invalid value '{value}' for '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    /// A setting required by the selected mode is missing.
    #[error("'{field}' is required {context}")]
    Missing { field: String, context: String },

    /// A configured file does not exist.
    #[error("required file not found: {}", path.display())]
    MissingFile { path: PathBuf },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, value: impl ToString, reason: &str) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors from the live printer transport.
///
/// Only `Client` escapes, at startup. The rest never leave the actuator: they
/// are logged and converted into a negative result at the boundary.
#[derive(Debug, Error)]
pub enum PrinterError {
    /// The HTTP client with the configured timeout could not be built.
    #[error("failed to build printer HTTP client: {source}")]
    Client {
        #[source]
        source: reqwest::Error,
    },

    /// The HTTP request could not be completed (refused, timed out, DNS).
    #[error("request to '{endpoint}' failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The firmware answered with a non-success status.
    #[error("printer API error at '{endpoint}' (HTTP {status})")]
    Status { endpoint: String, status: u16 },

    /// The response body did not have the expected shape.
    #[error("malformed response from '{endpoint}': {reason}")]
    Malformed { endpoint: String, reason: String },
}
