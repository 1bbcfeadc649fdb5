//! Frame acquisition.
//!
//! Sources hand out one RGB frame at a time. Everything downstream sees the
//! same [`Frame`] type whether it came from a live camera or a recording.
//!
//! - Image sequences (a single image or a directory of frames) are always available.
//! - Camera devices and video files need the `opencv` feature.

use std::{
    fs,
    path::{Path, PathBuf},
};

use image::{RgbImage, imageops};
use log::{debug, info, warn};

use crate::config::{SourceConfig, SourceDescriptor};
use crate::error::AcquisitionError;

/// File extensions replayed as still frames.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// File extensions decoded as video.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm"];

/// One acquired frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position in the stream, starting at zero.
    pub index: u64,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(index: u64, image: RgbImage) -> Self {
        Self { index, image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Result of a successful grab.
#[derive(Debug)]
pub enum Grab {
    Frame(Frame),
    /// A recorded source has no more frames. Not an error.
    Exhausted,
}

/// A camera or recording that yields frames one at a time.
pub trait FrameSource {
    /// Human-readable name for logs.
    fn name(&self) -> String;

    /// Acquire the underlying capture resource.
    fn open(&mut self) -> Result<(), AcquisitionError>;

    /// Read the next frame, or [`Grab::Exhausted`] at the end of a recording.
    fn grab_frame(&mut self) -> Result<Grab, AcquisitionError>;

    /// Release the capture resource. Safe to call when not open and more than once.
    fn close(&mut self);
}

/// Build and open the source named by `config`.
///
/// # Errors
///
/// Returns an [`AcquisitionError`] if:
/// - The path does not exist
/// - The directory holds no image frames
/// - The camera cannot be opened
/// - The source needs a feature this build does not have
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>, AcquisitionError> {
    let source: Box<dyn FrameSource> = match &config.descriptor {
        SourceDescriptor::Device(index) => device_source(*index, config.max_grab_failures)?,
        SourceDescriptor::Path(path) => path_source(path)?,
    };

    let mut source = if config.flip_vertical {
        Box::new(FlippedSource { inner: source })
    } else {
        source
    };

    source.open()?;
    info!("Frame source opened: {}", source.name());
    Ok(source)
}

fn path_source(path: &Path) -> Result<Box<dyn FrameSource>, AcquisitionError> {
    if !path.exists() {
        return Err(AcquisitionError::NotFound {
            path: path.to_path_buf(),
        });
    }

    if path.is_dir() || has_extension(path, IMAGE_EXTENSIONS) {
        return Ok(Box::new(ImageSequenceSource::new(path)));
    }

    if has_extension(path, VIDEO_EXTENSIONS) {
        return video_file_source(path);
    }

    Err(AcquisitionError::Unsupported {
        source_name: path.display().to_string(),
        reason: "unrecognized file type".to_string(),
    })
}

#[cfg(feature = "opencv")]
fn device_source(index: u32, max_grab_failures: u32) -> Result<Box<dyn FrameSource>, AcquisitionError> {
    Ok(Box::new(crate::video_capture::VideoCaptureSource::device(
        index,
        max_grab_failures,
    )))
}

#[cfg(not(feature = "opencv"))]
fn device_source(index: u32, _max_grab_failures: u32) -> Result<Box<dyn FrameSource>, AcquisitionError> {
    Err(AcquisitionError::Unsupported {
        source_name: format!("camera #{}", index),
        reason: "camera capture requires the `opencv` feature".to_string(),
    })
}

#[cfg(feature = "opencv")]
fn video_file_source(path: &Path) -> Result<Box<dyn FrameSource>, AcquisitionError> {
    Ok(Box::new(crate::video_capture::VideoCaptureSource::file(path)))
}

#[cfg(not(feature = "opencv"))]
fn video_file_source(path: &Path) -> Result<Box<dyn FrameSource>, AcquisitionError> {
    Err(AcquisitionError::Unsupported {
        source_name: path.display().to_string(),
        reason: "video decoding requires the `opencv` feature".to_string(),
    })
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

/// Replays a single image or a directory of image frames in file-name order.
///
/// Opening decodes the first frame, so a recording nothing can be read from
/// fails at startup. Later files that fail to decode are skipped with a
/// warning; the stream is exhausted after the last file.
pub struct ImageSequenceSource {
    path: PathBuf,
    frames: Vec<PathBuf>,
    cursor: usize,
    pending: Option<RgbImage>,
    next_index: u64,
    is_open: bool,
}

impl ImageSequenceSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            frames: Vec::new(),
            cursor: 0,
            pending: None,
            next_index: 0,
            is_open: false,
        }
    }

    /// Number of frames queued when the source was opened.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn list_frames(&self) -> Result<Vec<PathBuf>, AcquisitionError> {
        if !self.path.exists() {
            return Err(AcquisitionError::NotFound {
                path: self.path.clone(),
            });
        }

        if !self.path.is_dir() {
            return Ok(vec![self.path.clone()]);
        }

        let entries = fs::read_dir(&self.path).map_err(|e| AcquisitionError::ReadFailed {
            source_name: self.path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut frames: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && has_extension(p, IMAGE_EXTENSIONS))
            .collect();
        frames.sort();

        if frames.is_empty() {
            return Err(AcquisitionError::Empty {
                path: self.path.clone(),
            });
        }
        Ok(frames)
    }

    /// Decode the next readable file after the cursor, skipping unreadable ones.
    fn decode_next(&mut self) -> Option<RgbImage> {
        while let Some(path) = self.frames.get(self.cursor) {
            self.cursor += 1;
            match image::open(path) {
                Ok(decoded) => return Some(decoded.to_rgb8()),
                Err(e) => warn!("Skipping unreadable frame {}: {}", path.display(), e),
            }
        }
        None
    }
}

impl FrameSource for ImageSequenceSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn open(&mut self) -> Result<(), AcquisitionError> {
        self.frames = self.list_frames()?;
        self.cursor = 0;
        self.next_index = 0;

        let Some(first) = self.decode_next() else {
            let checked = self.frames.len();
            self.frames.clear();
            return Err(AcquisitionError::Unsupported {
                source_name: self.name(),
                reason: format!("none of the {} image file(s) could be decoded", checked),
            });
        };
        self.pending = Some(first);
        self.is_open = true;
        debug!("{} frame(s) queued from {}", self.frames.len(), self.path.display());
        Ok(())
    }

    fn grab_frame(&mut self) -> Result<Grab, AcquisitionError> {
        if !self.is_open {
            return Err(AcquisitionError::NotOpen {
                source_name: self.name(),
            });
        }

        let image = match self.pending.take() {
            Some(image) => Some(image),
            None => self.decode_next(),
        };

        Ok(match image {
            Some(image) => {
                let frame = Frame::new(self.next_index, image);
                self.next_index += 1;
                Grab::Frame(frame)
            }
            None => Grab::Exhausted,
        })
    }

    fn close(&mut self) {
        if self.is_open {
            debug!("Closing {}", self.path.display());
        }
        self.is_open = false;
        self.frames.clear();
        self.pending = None;
        self.cursor = 0;
    }
}

/// Flips every frame vertically, for cameras mounted upside-down.
struct FlippedSource {
    inner: Box<dyn FrameSource>,
}

impl FrameSource for FlippedSource {
    fn name(&self) -> String {
        format!("{} (flipped)", self.inner.name())
    }

    fn open(&mut self) -> Result<(), AcquisitionError> {
        self.inner.open()
    }

    fn grab_frame(&mut self) -> Result<Grab, AcquisitionError> {
        Ok(match self.inner.grab_frame()? {
            Grab::Frame(mut frame) => {
                imageops::flip_vertical_in_place(&mut frame.image);
                Grab::Frame(frame)
            }
            Grab::Exhausted => Grab::Exhausted,
        })
    }

    fn close(&mut self) {
        self.inner.close();
    }
}
