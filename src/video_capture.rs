#![cfg(feature = "opencv")]

use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use image::RgbImage;
use log::{info, warn};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture},
};

use crate::error::AcquisitionError;
use crate::frame_source::{Frame, FrameSource, Grab};

/// Pause between grab attempts on a live camera.
const GRAB_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
enum CaptureTarget {
    Device(u32),
    File(PathBuf),
}

/// Camera device or video file read through OpenCV.
///
/// For files, a failed read is end of stream. For devices, a failed read is
/// retried up to `max_grab_failures` times, after which the camera is
/// considered lost.
pub struct VideoCaptureSource {
    target: CaptureTarget,
    capture: Option<VideoCapture>,
    max_grab_failures: u32,
    next_index: u64,
}

impl VideoCaptureSource {
    pub fn device(index: u32, max_grab_failures: u32) -> Self {
        Self {
            target: CaptureTarget::Device(index),
            capture: None,
            max_grab_failures: max_grab_failures.max(1),
            next_index: 0,
        }
    }

    pub fn file(path: &Path) -> Self {
        Self {
            target: CaptureTarget::File(path.to_path_buf()),
            capture: None,
            max_grab_failures: 1,
            next_index: 0,
        }
    }

    fn open_failure(&self, reason: String) -> AcquisitionError {
        match &self.target {
            CaptureTarget::Device(index) => AcquisitionError::DeviceUnavailable {
                index: *index,
                reason,
            },
            CaptureTarget::File(path) => AcquisitionError::Unsupported {
                source_name: path.display().to_string(),
                reason,
            },
        }
    }

    /// One read attempt. `Ok(None)` means the capture produced no frame.
    fn read_once(&mut self) -> Result<Option<RgbImage>, String> {
        let capture = self.capture.as_mut().ok_or("capture not open")?;
        let mut mat = Mat::default();
        let got_frame = capture.read(&mut mat).map_err(|e| e.to_string())?;
        if !got_frame || mat.empty() {
            return Ok(None);
        }
        mat_to_rgb(&mat).map(Some)
    }
}

impl FrameSource for VideoCaptureSource {
    fn name(&self) -> String {
        match &self.target {
            CaptureTarget::Device(index) => format!("camera #{}", index),
            CaptureTarget::File(path) => path.display().to_string(),
        }
    }

    fn open(&mut self) -> Result<(), AcquisitionError> {
        self.close();

        let capture = match &self.target {
            CaptureTarget::Device(index) => VideoCapture::new(*index as i32, videoio::CAP_ANY),
            CaptureTarget::File(path) => {
                VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)
            }
        }
        .map_err(|e| self.open_failure(e.to_string()))?;

        let opened = capture
            .is_opened()
            .map_err(|e| self.open_failure(e.to_string()))?;
        if !opened {
            return Err(self.open_failure("capture backend could not open the source".to_string()));
        }

        info!("VideoCaptureSource: connected to {}", self.name());
        self.capture = Some(capture);
        self.next_index = 0;
        Ok(())
    }

    fn grab_frame(&mut self) -> Result<Grab, AcquisitionError> {
        if self.capture.is_none() {
            return Err(AcquisitionError::NotOpen {
                source_name: self.name(),
            });
        }

        let is_device = matches!(self.target, CaptureTarget::Device(_));
        let mut last_reason = String::from("no frame returned");

        for attempt in 1..=self.max_grab_failures {
            match self.read_once() {
                Ok(Some(image)) => {
                    let frame = Frame::new(self.next_index, image);
                    self.next_index += 1;
                    return Ok(Grab::Frame(frame));
                }
                Ok(None) if !is_device => return Ok(Grab::Exhausted),
                Ok(None) => last_reason = "no frame returned".to_string(),
                Err(reason) if !is_device => {
                    return Err(AcquisitionError::ReadFailed {
                        source_name: self.name(),
                        reason,
                    });
                }
                Err(reason) => last_reason = reason,
            }

            warn!(
                "{}: grab attempt {}/{} failed: {}",
                self.name(),
                attempt,
                self.max_grab_failures,
                last_reason
            );
            thread::sleep(GRAB_RETRY_DELAY);
        }

        Err(AcquisitionError::Lost {
            source_name: self.name(),
            attempts: self.max_grab_failures,
            last_reason,
        })
    }

    fn close(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                warn!("Failed to release {}: {}", self.name(), e);
            }
        }
    }
}

impl Drop for VideoCaptureSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Convert an 8-bit BGR matrix into an RGB image.
fn mat_to_rgb(mat: &Mat) -> Result<RgbImage, String> {
    if mat.typ() != opencv::core::CV_8UC3 {
        return Err(format!("unsupported pixel type {}", mat.typ()));
    }

    let width = u32::try_from(mat.cols()).map_err(|e| e.to_string())?;
    let height = u32::try_from(mat.rows()).map_err(|e| e.to_string())?;

    let owned;
    let continuous = if mat.is_continuous() {
        mat
    } else {
        owned = mat.try_clone().map_err(|e| e.to_string())?;
        &owned
    };

    let bgr = continuous.data_bytes().map_err(|e| e.to_string())?;
    let rgb: Vec<u8> = bgr
        .chunks_exact(3)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect();

    RgbImage::from_raw(width, height, rgb).ok_or_else(|| "frame buffer size mismatch".to_string())
}
