use clap::ValueEnum;
use log::{error, info};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde_json::{Value, json};

use crate::config::PrinterConfig;
use crate::error::PrinterError;

/// How the monitor talks to the printer, fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PrinterMode {
    /// Simulated printer: always printing, every pause succeeds, no I/O.
    Mock,
    /// Real firmware API over HTTP.
    Live,
}

/// Firmware API used in live mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Firmware {
    Moonraker,
    Octoprint,
}

/// The actuation boundary between the monitor and the printer.
///
/// Neither method may fail: implementations convert transport problems into
/// the safe answer (`false`) and log them, so an unreachable printer can never
/// stop the monitoring loop.
pub trait PrinterActuator {
    /// Whether a print job is currently running.
    fn is_printing(&self) -> bool;

    /// Ask the printer to pause. Returns whether the request was accepted.
    fn pause_print(&self) -> bool;

    fn mode(&self) -> PrinterMode;
}

/// Build the actuator selected by `config.mode`.
///
/// # Errors
///
/// Returns [`PrinterError::Client`] if the live HTTP client cannot be built.
pub fn connect(config: &PrinterConfig) -> Result<Box<dyn PrinterActuator>, PrinterError> {
    info!("Printer mode: {:?}", config.mode);
    Ok(match config.mode {
        PrinterMode::Mock => Box::new(MockPrinter),
        PrinterMode::Live => Box::new(LivePrinter::new(config)?),
    })
}

/// Simulated printer for running the full pipeline without hardware.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockPrinter;

impl PrinterActuator for MockPrinter {
    fn is_printing(&self) -> bool {
        info!("MOCK: is_printing() -> true");
        true
    }

    fn pause_print(&self) -> bool {
        info!("MOCK: pause_print() -> paused");
        true
    }

    fn mode(&self) -> PrinterMode {
        PrinterMode::Mock
    }
}

/// Printer control over the Moonraker or OctoPrint HTTP API.
pub struct LivePrinter {
    client: Client,
    firmware: Firmware,
    api_url: String,
    api_key: Option<String>,
}

impl LivePrinter {
    /// Create a live printer client.
    ///
    /// # Arguments
    ///
    /// * `config` - Base URL (e.g., "http://printer.local:7125"), optional API key,
    ///   firmware flavour and per-request timeout
    ///
    /// # Errors
    ///
    /// Returns [`PrinterError::Client`] if the HTTP client cannot be built;
    /// the monitor never talks to a printer without its request timeout.
    pub fn new(config: &PrinterConfig) -> Result<Self, PrinterError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|source| PrinterError::Client { source })?;

        Ok(Self {
            client,
            firmware: config.firmware,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn firmware(&self) -> Firmware {
        self.firmware
    }

    /// URL of the print status endpoint.
    pub fn status_url(&self) -> String {
        match self.firmware {
            Firmware::Moonraker => format!("{}/printer/objects/query?print_stats", self.api_url),
            Firmware::Octoprint => format!("{}/api/job", self.api_url),
        }
    }

    /// URL of the pause endpoint.
    pub fn pause_url(&self) -> String {
        match self.firmware {
            Firmware::Moonraker => format!("{}/printer/print/pause", self.api_url),
            Firmware::Octoprint => format!("{}/api/job", self.api_url),
        }
    }

    /// Query the firmware for the current print state.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The HTTP request fails or times out
    /// - The API returns an error status
    /// - The response does not contain a print state
    pub fn query_printing(&self) -> Result<bool, PrinterError> {
        let endpoint = self.status_url();
        let response = self.send(self.client.get(&endpoint), &endpoint)?;

        let body: Value = response.json().map_err(|e| PrinterError::Malformed {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;

        parse_print_state(self.firmware, &body).ok_or_else(|| PrinterError::Malformed {
            endpoint,
            reason: "response has no print state".to_string(),
        })
    }

    /// Send the pause command.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The HTTP request fails or times out
    /// - The API returns an error status (e.g., nothing is printing)
    pub fn request_pause(&self) -> Result<(), PrinterError> {
        let endpoint = self.pause_url();
        let request = match self.firmware {
            Firmware::Moonraker => self.client.post(&endpoint),
            Firmware::Octoprint => self
                .client
                .post(&endpoint)
                .json(&json!({ "command": "pause", "action": "pause" })),
        };
        self.send(request, &endpoint)?;
        Ok(())
    }

    fn send(&self, request: RequestBuilder, endpoint: &str) -> Result<Response, PrinterError> {
        let request = match &self.api_key {
            Some(key) => request.header("X-Api-Key", key),
            None => request,
        };

        let response = request.send().map_err(|source| PrinterError::Request {
            endpoint: endpoint.to_string(),
            source,
        })?;

        if !response.status().is_success() {
            return Err(PrinterError::Status {
                endpoint: endpoint.to_string(),
                status: response.status().as_u16(),
            });
        }

        Ok(response)
    }
}

impl PrinterActuator for LivePrinter {
    fn is_printing(&self) -> bool {
        match self.query_printing() {
            Ok(printing) => printing,
            Err(e) => {
                error!("Failed to query printer status: {}", e);
                false
            }
        }
    }

    fn pause_print(&self) -> bool {
        match self.request_pause() {
            Ok(()) => {
                info!("Pause command accepted by {}", self.api_url);
                true
            }
            Err(e) => {
                error!("Failed to pause print: {}", e);
                false
            }
        }
    }

    fn mode(&self) -> PrinterMode {
        PrinterMode::Live
    }
}

/// Extract "is a job printing" from a status response body.
fn parse_print_state(firmware: Firmware, body: &Value) -> Option<bool> {
    match firmware {
        Firmware::Moonraker => body["result"]["status"]["print_stats"]["state"]
            .as_str()
            .map(|state| state == "printing"),
        Firmware::Octoprint => body["state"].as_str().map(|state| state == "Printing"),
    }
}
