use std::{process, sync::atomic::Ordering};

use log::{error, info, warn};

use print_sentinel::{Config, Monitor, MonitorError, StopReason};

/// Print Sentinel - camera-based 3D print failure monitor.
///
/// Samples frames from a camera or recording, detects print failures such as
/// spaghetti, warping and layer shifts, and pauses the printer once a failure
/// has been seen in `PERSISTENCE_FRAMES` consecutive frames.
///
/// # Environment Variables
///
/// Every command-line flag has an environment equivalent; see `--help`.
/// The most common ones:
/// * `SOURCE` - Camera index (e.g. "0") or path to a recording (default: "0")
/// * `MODEL_CFG`, `WEIGHTS_FILE`, `LABEL_FILE` - Trained detector files
/// * `CONF_THRESHOLD` - Detection confidence threshold (default: "0.55")
/// * `PERSISTENCE_FRAMES` - Consecutive hits before pausing (default: "5")
/// * `PRINTER_MODE` - "mock" or "live" (default: "mock")
/// * `PRINTER_API_URL` - Firmware API base URL (required in live mode)
///
/// # Exit Status
///
/// 0 when the stream ends or Ctrl-C is pressed; 2 for invalid configuration,
/// 3 when the model cannot be loaded, 4 when the frame source cannot be opened.
///
/// # Usage
///
/// ```bash
/// # Replay a directory of recorded frames against a mock printer:
/// print-sentinel --source data/real_world_test --render
///
/// # Live camera and Moonraker:
/// export PRINTER_MODE=live
/// export PRINTER_API_URL="http://printer.local:7125"
/// print-sentinel --source 0
/// ```
fn main() {
    // Initialize logger to output to stdout, using RUST_LOG env var or info level by default
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(log::LevelFilter::Info),
        )
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => fail(MonitorError::from(e)),
    };

    info!("Print Sentinel starting...");
    info!("Source: {}", config.source.descriptor);

    let mut monitor = match Monitor::start(&config) {
        Ok(monitor) => monitor,
        Err(e) => fail(e),
    };

    let shutdown = monitor.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)) {
        warn!("Failed to install Ctrl-C handler: {}", e);
    }
    info!("Press Ctrl-C to quit.");

    match monitor.run() {
        Ok(summary) => {
            if summary.stop_reason == StopReason::Quit {
                info!("Shut down on request");
            }
        }
        Err(e) => fail(e),
    }
}

fn fail(err: MonitorError) -> ! {
    error!("{}", err);
    error!("Hint: {}", err.remediation());
    process::exit(err.exit_code());
}
