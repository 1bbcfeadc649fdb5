use std::{
    fs,
    io::Cursor,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use log::debug;
use rusttype::{Font, Scale};

use crate::config::RenderConfig;
use crate::detector::Detection;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: i32 = 3;
const IDLE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const ACCUMULATING_COLOR: Rgb<u8> = Rgb([255, 165, 0]);
const EMPTY_SEGMENT_COLOR: Rgb<u8> = Rgb([64, 64, 64]);
const LABEL_SCALE: f32 = 18.0;
const STATUS_SCALE: f32 = 24.0;
const SEGMENT_SIZE: u32 = 14;
const SEGMENT_GAP: u32 = 4;
const MARGIN: i32 = 10;

/// Hit counter shown on the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitCounter {
    pub hits: u32,
    pub window: u32,
}

/// Draws detections and the hit counter onto frames and writes them to disk.
///
/// Rendering is presentation only; nothing it does feeds back into the
/// persistence filter.
pub struct FrameRenderer {
    output_dir: PathBuf,
    font: Option<Font<'static>>,
}

impl FrameRenderer {
    /// Create the output directory and load the optional overlay font.
    pub fn new(config: &RenderConfig) -> Result<Self> {
        fs::create_dir_all(&config.output_dir).with_context(|| {
            format!(
                "failed to create output directory {}",
                config.output_dir.display()
            )
        })?;

        let font = match &config.font {
            Some(path) => Some(load_font(path)?),
            None => None,
        };

        Ok(Self {
            output_dir: config.output_dir.clone(),
            font,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Draw bounding boxes, labels and the hit counter on a copy of `frame`.
    pub fn annotate(
        &self,
        frame: &RgbImage,
        detections: &[Detection],
        counter: HitCounter,
    ) -> RgbImage {
        let mut canvas = frame.clone();
        let (width, height) = canvas.dimensions();

        for detection in detections {
            let b = detection.bounding_box;
            let x = b.x1.max(0.0) as i32;
            let y = b.y1.max(0.0) as i32;
            let w = b.width().max(1.0) as u32;
            let h = b.height().max(1.0) as u32;

            // Draw the bounding box with a thick border, growing inwards so it stays in frame
            for t in 0..BOX_THICKNESS {
                let tw = w.saturating_sub(2 * t as u32);
                let th = h.saturating_sub(2 * t as u32);
                if tw == 0 || th == 0 {
                    break;
                }
                let rect = Rect::at(x + t, y + t).of_size(
                    tw.min(width.saturating_sub((x + t) as u32).max(1)),
                    th.min(height.saturating_sub((y + t) as u32).max(1)),
                );
                draw_hollow_rect_mut(&mut canvas, rect, BOX_COLOR);
            }

            if let Some(font) = &self.font {
                let label = format!("{} {:.2}", detection.class_name, detection.confidence);
                let label_y = (y - LABEL_SCALE as i32 - 2).max(0);
                draw_text_mut(
                    &mut canvas,
                    BOX_COLOR,
                    x,
                    label_y,
                    Scale::uniform(LABEL_SCALE),
                    font,
                    &label,
                );
            }
        }

        self.draw_counter(&mut canvas, counter);
        canvas
    }

    /// Hit bar: one segment per frame of the persistence window, filled up to the current count.
    fn draw_counter(&self, canvas: &mut RgbImage, counter: HitCounter) {
        let color = if counter.hits == 0 {
            IDLE_COLOR
        } else {
            ACCUMULATING_COLOR
        };

        let mut bar_y = MARGIN;
        if let Some(font) = &self.font {
            let status = format!("Hits: {}/{}", counter.hits, counter.window);
            draw_text_mut(
                canvas,
                color,
                MARGIN,
                MARGIN,
                Scale::uniform(STATUS_SCALE),
                font,
                &status,
            );
            bar_y += STATUS_SCALE as i32 + 4;
        }

        let (width, height) = canvas.dimensions();
        for segment in 0..counter.window {
            let x = MARGIN + (segment * (SEGMENT_SIZE + SEGMENT_GAP)) as i32;
            if x as u32 + SEGMENT_SIZE > width || bar_y as u32 + SEGMENT_SIZE > height {
                break;
            }
            let rect = Rect::at(x, bar_y).of_size(SEGMENT_SIZE, SEGMENT_SIZE);
            if segment < counter.hits {
                draw_filled_rect_mut(canvas, rect, color);
            } else {
                draw_hollow_rect_mut(canvas, rect, EMPTY_SEGMENT_COLOR);
            }
        }
    }

    /// Overwrite `latest.jpg` with the annotated frame.
    pub fn write_latest(&self, annotated: &RgbImage) -> Result<PathBuf> {
        let path = self.output_dir.join("latest.jpg");
        self.write_jpeg(annotated, &path)?;
        Ok(path)
    }

    /// Write a timestamped snapshot taken when the printer was paused.
    pub fn write_pause_snapshot(&self, annotated: &RgbImage) -> Result<PathBuf> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = self.output_dir.join(format!("pause_{}.jpg", stamp));
        self.write_jpeg(annotated, &path)?;
        Ok(path)
    }

    fn write_jpeg(&self, annotated: &RgbImage, path: &Path) -> Result<()> {
        let bytes = encode_jpeg(annotated)?;
        fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        debug!("Wrote annotated frame to {}", path.display());
        Ok(())
    }
}

/// Encode an RGB image as JPEG bytes.
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut cursor = Cursor::new(&mut buffer);
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut cursor, ImageOutputFormat::Jpeg(85))
        .context("failed to encode JPEG")?;
    Ok(buffer)
}

fn load_font(path: &Path) -> Result<Font<'static>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read font {}", path.display()))?;
    Font::try_from_vec(bytes).with_context(|| format!("{} is not a usable TrueType font", path.display()))
}
