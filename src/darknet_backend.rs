use std::path::Path;

use anyhow::Result;
use darknet::{Image, Network};
use image::{DynamicImage, RgbImage};

use crate::detector::{Candidate, DetectionModel};
use crate::error::ModelLoadError;

/// Hierarchical threshold passed through to Darknet; only used by YOLO9000-style trees.
const HIER_THRESHOLD: f32 = 0.5;

/// YOLO/Darknet network backend.
pub struct DarknetModel {
    network: Network,
}

impl DarknetModel {
    /// Load the network definition and trained weights.
    pub fn load(model_cfg: &Path, weights: &Path) -> Result<Self, ModelLoadError> {
        let network = Network::load(model_cfg, Some(weights), false).map_err(|e| {
            ModelLoadError::NetworkLoadFailed {
                path: weights.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self { network })
    }
}

impl DetectionModel for DarknetModel {
    fn name(&self) -> &'static str {
        "darknet"
    }

    fn infer(
        &mut self,
        frame: &RgbImage,
        threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<Candidate>> {
        let image = Image::from(DynamicImage::ImageRgb8(frame.clone()));

        // Darknet's own NMS is per-class; the engine runs the class-agnostic pass afterwards.
        let detections = self
            .network
            .predict(&image, threshold, HIER_THRESHOLD, iou_threshold, true);

        let candidates = detections
            .iter()
            .filter_map(|det| {
                let (class_id, confidence) = det.best_class(Some(threshold))?;
                let bbox = det.bbox();
                Some(Candidate {
                    class_id,
                    confidence,
                    center_x: bbox.x,
                    center_y: bbox.y,
                    width: bbox.w,
                    height: bbox.h,
                })
            })
            .collect();

        Ok(candidates)
    }
}
