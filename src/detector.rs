use std::{
    cmp::Ordering,
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::Result;
use image::RgbImage;
use log::{debug, info};

use crate::config::DetectorConfig;
use crate::error::ModelLoadError;
use crate::frame_source::Frame;

/// The failure signatures a trained model can report.
///
/// Labels files map onto this enumeration line by line. `Failure` covers
/// single-class models that only distinguish "failed" from "fine".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Spaghetti,
    Warping,
    LayerShifting,
    Stringing,
    OffPlatform,
    Cracking,
    Failure,
}

impl FailureClass {
    pub const ALL: [FailureClass; 7] = [
        FailureClass::Spaghetti,
        FailureClass::Warping,
        FailureClass::LayerShifting,
        FailureClass::Stringing,
        FailureClass::OffPlatform,
        FailureClass::Cracking,
        FailureClass::Failure,
    ];

    /// Parse a label from a labels file.
    ///
    /// Matching ignores case, spaces, dashes and underscores, so `Layer_shifting`,
    /// `layer-shift` and `LayerShifting` all resolve to the same class.
    pub fn from_label(label: &str) -> Option<Self> {
        let key: String = label
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();

        match key.as_str() {
            "spaghetti" => Some(FailureClass::Spaghetti),
            "warping" | "warp" => Some(FailureClass::Warping),
            "layershifting" | "layershift" => Some(FailureClass::LayerShifting),
            "stringing" => Some(FailureClass::Stringing),
            // the public dataset ships this class misspelled
            "offplatform" | "offplatfrom" => Some(FailureClass::OffPlatform),
            "cracking" | "crack" => Some(FailureClass::Cracking),
            "failure" => Some(FailureClass::Failure),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Spaghetti => "spaghetti",
            FailureClass::Warping => "warping",
            FailureClass::LayerShifting => "layer_shifting",
            FailureClass::Stringing => "stringing",
            FailureClass::OffPlatform => "off_platform",
            FailureClass::Cracking => "cracking",
            FailureClass::Failure => "failure",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis-aligned box in pixel coordinates, `x1 < x2` and `y1 < y2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build a pixel box from a normalized center/size box, clamped to the frame.
    ///
    /// Returns `None` when the clamped box has no area.
    pub fn from_normalized_center(
        center_x: f32,
        center_y: f32,
        width: f32,
        height: f32,
        frame_width: u32,
        frame_height: u32,
    ) -> Option<Self> {
        let fw = frame_width as f32;
        let fh = frame_height as f32;

        let x1 = ((center_x - width / 2.0) * fw).clamp(0.0, fw);
        let y1 = ((center_y - height / 2.0) * fh).clamp(0.0, fh);
        let x2 = ((center_x + width / 2.0) * fw).clamp(0.0, fw);
        let y2 = ((center_y + height / 2.0) * fh).clamp(0.0, fh);

        if x2 > x1 && y2 > y1 {
            Some(Self { x1, y1, x2, y2 })
        } else {
            None
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        if x2 > x1 && y2 > y1 {
            (x2 - x1) * (y2 - y1)
        } else {
            0.0
        }
    }

    /// Intersection over union.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// A single print failure detection in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Index of the class in the model's labels file.
    pub class_id: usize,

    /// The type of print failure detected.
    pub class_name: FailureClass,

    /// Confidence score from 0.0 to 1.0.
    pub confidence: f32,

    /// Location of the failure in pixel coordinates.
    pub bounding_box: BoundingBox,
}

impl Detection {
    /// Get the confidence as a percentage.
    pub fn confidence_percent(&self) -> f32 {
        self.confidence * 100.0
    }
}

/// Raw model output before thresholding and suppression.
///
/// Box coordinates are normalized to the frame (0.0 to 1.0) and given as
/// center and size, the way YOLO-family networks report them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub class_id: usize,
    pub confidence: f32,
    pub center_x: f32,
    pub center_y: f32,
    pub width: f32,
    pub height: f32,
}

/// A loaded object-detection network.
///
/// Implementations run the forward pass only. Confidence filtering, box
/// conversion and overlap suppression are applied by [`FailureDetector`] so
/// every backend behaves the same way downstream.
pub trait DetectionModel {
    /// Backend identifier for logging.
    fn name(&self) -> &'static str;

    /// Run the network on one RGB frame.
    ///
    /// `threshold` and `iou_threshold` are hints a backend may use to prune its
    /// own output early; they must not be relied on for correctness.
    fn infer(
        &mut self,
        frame: &RgbImage,
        threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<Candidate>>;
}

/// Locations of the three files that make up a trained detector.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifact {
    /// Network definition, usually with a `.cfg` extension.
    pub model_cfg: PathBuf,
    /// Trained weights.
    pub weights: PathBuf,
    /// One class label per line, in class index order.
    pub labels: PathBuf,
}

impl ModelArtifact {
    /// Fail with [`ModelLoadError::MissingFile`] on the first file that does not exist.
    pub fn ensure_present(&self) -> Result<(), ModelLoadError> {
        for path in [&self.model_cfg, &self.weights, &self.labels] {
            if !path.is_file() {
                return Err(ModelLoadError::MissingFile { path: path.clone() });
            }
        }
        Ok(())
    }
}

/// Read and validate a labels file.
pub fn load_labels(path: &Path) -> Result<Vec<FailureClass>, ModelLoadError> {
    let contents = fs::read_to_string(path).map_err(|e| ModelLoadError::LabelsReadFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let lines: Vec<&str> = contents.lines().map(str::trim).collect();
    let used = lines
        .iter()
        .rposition(|line| !line.is_empty())
        .map_or(0, |last| last + 1);

    if used == 0 {
        return Err(ModelLoadError::NoLabels {
            path: path.to_path_buf(),
        });
    }

    lines[..used]
        .iter()
        .enumerate()
        .map(|(index, label)| {
            FailureClass::from_label(label).ok_or_else(|| ModelLoadError::UnknownLabel {
                path: path.to_path_buf(),
                line: index + 1,
                label: label.to_string(),
            })
        })
        .collect()
}

/// Print failure detection service.
///
/// Wraps a [`DetectionModel`] with the configured confidence threshold and a
/// class-agnostic overlap suppression pass. The engine keeps no state between
/// calls, so the same frame always yields the same detections for a
/// deterministic model.
pub struct FailureDetector {
    model: Box<dyn DetectionModel>,
    labels: Vec<FailureClass>,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl FailureDetector {
    /// Load the model artifact named by `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`ModelLoadError`] if:
    /// - Any of the model files is missing
    /// - The labels file is empty or names an unknown class
    /// - The network cannot be parsed
    /// - The crate was built without an inference backend
    pub fn load(config: &DetectorConfig) -> Result<Self, ModelLoadError> {
        let artifact = &config.artifact;
        artifact.ensure_present()?;

        let labels = load_labels(&artifact.labels)?;
        info!(
            "Loaded {} class label(s): {}",
            labels.len(),
            labels
                .iter()
                .map(FailureClass::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let model = load_backend(artifact)?;
        info!("Detector backend '{}' ready", model.name());

        Ok(Self::with_model(model, labels, config))
    }

    /// Build a detector around an already-loaded model.
    pub fn with_model(
        model: Box<dyn DetectionModel>,
        labels: Vec<FailureClass>,
        config: &DetectorConfig,
    ) -> Self {
        Self {
            model,
            labels,
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
        }
    }

    /// Detect print failures in one frame.
    ///
    /// Detections below the confidence threshold are dropped, boxes are
    /// converted to pixel corners, and overlapping boxes are collapsed to the
    /// most confident one regardless of class. The result is sorted by
    /// descending confidence.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails on this frame.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (width, height) = frame.image.dimensions();
        let candidates =
            self.model
                .infer(&frame.image, self.confidence_threshold, self.iou_threshold)?;

        let mut detections: Vec<Detection> = candidates
            .into_iter()
            .filter(|c| c.confidence >= self.confidence_threshold)
            .filter_map(|c| self.to_detection(c, width, height))
            .collect();

        detections.sort_by(compare_detections);
        Ok(suppress_overlaps(detections, self.iou_threshold))
    }

    fn to_detection(&self, candidate: Candidate, width: u32, height: u32) -> Option<Detection> {
        let Some(class_name) = self.labels.get(candidate.class_id).copied() else {
            debug!(
                "Dropping candidate with class index {} outside the {} known labels",
                candidate.class_id,
                self.labels.len()
            );
            return None;
        };

        let bounding_box = BoundingBox::from_normalized_center(
            candidate.center_x,
            candidate.center_y,
            candidate.width,
            candidate.height,
            width,
            height,
        )?;

        Some(Detection {
            class_id: candidate.class_id,
            class_name,
            confidence: candidate.confidence.clamp(0.0, 1.0),
            bounding_box,
        })
    }

    /// Get the list of class labels.
    pub fn labels(&self) -> &[FailureClass] {
        &self.labels
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    pub fn iou_threshold(&self) -> f32 {
        self.iou_threshold
    }
}

/// Descending confidence, then class and position so ties order deterministically.
fn compare_detections(a: &Detection, b: &Detection) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then(a.class_id.cmp(&b.class_id))
        .then(a.bounding_box.x1.total_cmp(&b.bounding_box.x1))
        .then(a.bounding_box.y1.total_cmp(&b.bounding_box.y1))
}

/// Greedy non-maximum suppression across all classes.
///
/// `sorted` must already be in descending confidence order. A box is dropped
/// when its IoU with any kept box exceeds `iou_threshold`.
pub fn suppress_overlaps(sorted: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let mut kept: Vec<Detection> = Vec::with_capacity(sorted.len());
    for detection in sorted {
        let overlaps = kept
            .iter()
            .any(|k| k.bounding_box.iou(&detection.bounding_box) > iou_threshold);
        if !overlaps {
            kept.push(detection);
        }
    }
    kept
}

#[cfg(feature = "darknet")]
fn load_backend(artifact: &ModelArtifact) -> Result<Box<dyn DetectionModel>, ModelLoadError> {
    let model = crate::darknet_backend::DarknetModel::load(&artifact.model_cfg, &artifact.weights)?;
    Ok(Box::new(model))
}

#[cfg(not(feature = "darknet"))]
fn load_backend(_artifact: &ModelArtifact) -> Result<Box<dyn DetectionModel>, ModelLoadError> {
    Err(ModelLoadError::BackendUnavailable)
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;

    struct FixedModel(Vec<Candidate>);

    impl DetectionModel for FixedModel {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn infer(&mut self, _frame: &RgbImage, _threshold: f32, _iou: f32) -> Result<Vec<Candidate>> {
            Ok(self.0.clone())
        }
    }

    fn config(conf: f32, iou: f32) -> DetectorConfig {
        DetectorConfig {
            artifact: ModelArtifact {
                model_cfg: PathBuf::from("model.cfg"),
                weights: PathBuf::from("model.weights"),
                labels: PathBuf::from("labels.txt"),
            },
            confidence_threshold: conf,
            iou_threshold: iou,
            persistence_frames: NonZeroU32::new(3).unwrap(),
        }
    }

    fn candidate(class_id: usize, confidence: f32, cx: f32, cy: f32, size: f32) -> Candidate {
        Candidate {
            class_id,
            confidence,
            center_x: cx,
            center_y: cy,
            width: size,
            height: size,
        }
    }

    fn frame() -> Frame {
        Frame::new(0, RgbImage::new(100, 100))
    }

    fn detector(candidates: Vec<Candidate>, conf: f32, iou: f32) -> FailureDetector {
        FailureDetector::with_model(
            Box::new(FixedModel(candidates)),
            vec![FailureClass::Spaghetti, FailureClass::Warping],
            &config(conf, iou),
        )
    }

    #[test]
    fn drops_candidates_below_threshold() {
        let mut d = detector(
            vec![
                candidate(0, 0.40, 0.2, 0.2, 0.1),
                candidate(1, 0.55, 0.8, 0.8, 0.1),
            ],
            0.55,
            0.5,
        );
        let detections = d.detect(&frame()).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_name, FailureClass::Warping);
    }

    #[test]
    fn suppression_is_class_agnostic() {
        // Same region, different classes: only the stronger box survives.
        let mut d = detector(
            vec![
                candidate(0, 0.70, 0.5, 0.5, 0.4),
                candidate(1, 0.90, 0.51, 0.5, 0.4),
            ],
            0.25,
            0.5,
        );
        let detections = d.detect(&frame()).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_name, FailureClass::Warping);
        assert!((detections[0].confidence - 0.90).abs() < f32::EPSILON);
    }

    #[test]
    fn keeps_separate_regions_sorted_by_confidence() {
        let mut d = detector(
            vec![
                candidate(0, 0.60, 0.2, 0.2, 0.2),
                candidate(0, 0.95, 0.8, 0.8, 0.2),
            ],
            0.5,
            0.5,
        );
        let detections = d.detect(&frame()).unwrap();
        assert_eq!(detections.len(), 2);
        assert!(detections[0].confidence > detections[1].confidence);
    }

    #[test]
    fn boxes_are_clamped_to_frame() {
        let mut d = detector(vec![candidate(0, 0.9, 0.05, 0.95, 0.2)], 0.5, 0.5);
        let detections = d.detect(&frame()).unwrap();
        let b = detections[0].bounding_box;
        assert_eq!(b.x1, 0.0);
        assert_eq!(b.y2, 100.0);
        assert!(b.x1 < b.x2 && b.y1 < b.y2);
    }

    #[test]
    fn unknown_class_index_is_dropped() {
        let mut d = detector(vec![candidate(7, 0.9, 0.5, 0.5, 0.2)], 0.5, 0.5);
        assert!(d.detect(&frame()).unwrap().is_empty());
    }

    #[test]
    fn detect_is_repeatable() {
        let candidates = vec![
            candidate(0, 0.8, 0.3, 0.3, 0.2),
            candidate(1, 0.7, 0.7, 0.7, 0.2),
        ];
        let mut d = detector(candidates, 0.5, 0.5);
        let first = d.detect(&frame()).unwrap();
        let second = d.detect(&frame()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn degenerate_box_is_rejected() {
        assert!(BoundingBox::from_normalized_center(0.5, 0.5, 0.0, 0.2, 100, 100).is_none());
        assert!(BoundingBox::from_normalized_center(1.5, 0.5, 0.2, 0.2, 100, 100).is_none());
    }

    #[test]
    fn labels_accept_dataset_spellings() {
        assert_eq!(
            FailureClass::from_label("Layer_shifting"),
            Some(FailureClass::LayerShifting)
        );
        assert_eq!(
            FailureClass::from_label("Offplatfrom"),
            Some(FailureClass::OffPlatform)
        );
        assert_eq!(FailureClass::from_label("failure"), Some(FailureClass::Failure));
        assert_eq!(FailureClass::from_label("banana"), None);
        for class in FailureClass::ALL {
            assert_eq!(FailureClass::from_label(class.as_str()), Some(class));
        }
    }

    #[test]
    fn load_labels_reports_unknown_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        fs::write(&path, "Spaghetti\nWarping\nBlob\n").unwrap();

        match load_labels(&path) {
            Err(ModelLoadError::UnknownLabel { line, label, .. }) => {
                assert_eq!(line, 3);
                assert_eq!(label, "Blob");
            }
            other => panic!("expected unknown label error, got {other:?}"),
        }
    }

    #[test]
    fn load_labels_ignores_trailing_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        fs::write(&path, "Spaghetti\nStringing\n\n").unwrap();

        let labels = load_labels(&path).unwrap();
        assert_eq!(labels, vec![FailureClass::Spaghetti, FailureClass::Stringing]);
    }

    #[test]
    fn missing_artifact_fails_before_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(0.5, 0.5);
        cfg.artifact.model_cfg = dir.path().join("missing.cfg");

        match FailureDetector::load(&cfg) {
            Err(ModelLoadError::MissingFile { path }) => {
                assert!(path.ends_with("missing.cfg"))
            }
            Err(other) => panic!("expected missing file, got {other}"),
            Ok(_) => panic!("expected missing file error"),
        }
    }
}
