use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::{Client, multipart};
use serde_json::{Value, json};

use crate::detector::Detection;

const ALERT_TIMEOUT: Duration = Duration::from_secs(10);
const PAUSE_COLOR: u32 = 0xFF0000;

/// Discord alert service for pause notifications.
///
/// Alerts are best-effort: callers log a failed send and carry on.
pub struct AlertService {
    webhook_url: String,
    client: Client,
}

impl AlertService {
    /// Create a new AlertService with the provided Discord webhook URL.
    ///
    /// Fails if the HTTP client with the alert timeout cannot be built.
    pub fn new(webhook_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(ALERT_TIMEOUT)
            .build()
            .context("failed to build Discord HTTP client")?;
        Ok(Self {
            webhook_url,
            client,
        })
    }

    /// Notify that the printer was paused after a confirmed failure.
    ///
    /// # Arguments
    ///
    /// * `consecutive_hits` - Number of consecutive frames that confirmed the failure
    /// * `detections` - Detections from the frame that triggered the pause
    /// * `annotated_image` - Optional annotated frame (JPEG) to attach
    pub fn send_print_pause_alert(
        &self,
        consecutive_hits: u32,
        detections: &[Detection],
        annotated_image: Option<&[u8]>,
    ) -> Result<()> {
        let description = pause_description(consecutive_hits, detections);
        let title = "Print Paused: Failure Confirmed";

        match annotated_image {
            Some(image_data) => {
                let filename = format!("print_pause_{}.jpg", chrono::Utc::now().timestamp());
                self.send_alert_with_image(title, &description, image_data, &filename)
            }
            None => self.post_json(&embed(title, &description, None)),
        }
    }

    /// Send an embed with an attached JPEG.
    pub fn send_alert_with_image(
        &self,
        title: &str,
        description: &str,
        image_data: &[u8],
        filename: &str,
    ) -> Result<()> {
        let payload = embed(title, description, Some(filename));

        let form = multipart::Form::new()
            .text("payload_json", payload.to_string())
            .part(
                "files[0]",
                multipart::Part::bytes(image_data.to_vec())
                    .file_name(filename.to_string())
                    .mime_str("image/jpeg")?,
            );

        let response = self.client.post(&self.webhook_url).multipart(form).send()?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Failed to send Discord alert with image: HTTP {}",
                response.status()
            ));
        }
        Ok(())
    }

    fn post_json(&self, payload: &Value) -> Result<()> {
        let response = self.client.post(&self.webhook_url).json(payload).send()?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Failed to send Discord alert: HTTP {}",
                response.status()
            ));
        }
        Ok(())
    }
}

fn pause_description(consecutive_hits: u32, detections: &[Detection]) -> String {
    let mut description = format!(
        "Print has been paused after a failure was seen in **{}** consecutive frames. Please check the printer.",
        consecutive_hits
    );
    for detection in detections {
        let b = detection.bounding_box;
        description.push_str(&format!(
            "\n• **{}** {:.1}% at ({:.0}, {:.0})-({:.0}, {:.0})",
            detection.class_name,
            detection.confidence_percent(),
            b.x1,
            b.y1,
            b.x2,
            b.y2
        ));
    }
    description
}

fn embed(title: &str, description: &str, attachment: Option<&str>) -> Value {
    let mut embed = json!({
        "title": format!("🚨 {}", title),
        "description": description,
        "color": PAUSE_COLOR,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "footer": { "text": "Print Sentinel" }
    });
    if let Some(filename) = attachment {
        embed["image"] = json!({ "url": format!("attachment://{}", filename) });
    }
    json!({ "embeds": [embed] })
}
