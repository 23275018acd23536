use crate::config::ExtractionConfig;
use crate::core::image::{load_image, to_nchw, Normalization};
use crate::core::onnx::{ModelError, OnnxModel, OutputTensor};
use crate::core::similarity::l2_normalize;
use crate::core::ExtractError;
use crate::database::models::{BoundingBox, DetectedFace, Gender};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use std::cmp::Ordering;
use std::path::Path;

const DETECTOR_INPUT_WIDTH: u32 = 320;
const DETECTOR_INPUT_HEIGHT: u32 = 240;
const EMBEDDER_INPUT_SIZE: u32 = 112;
const ATTRIBUTE_INPUT_SIZE: u32 = 96;

/// Detects faces and embeds each one.
pub trait FaceExtractor: Send + Sync {
    fn available(&self) -> bool;

    fn version(&self) -> &str;

    /// Faces with confidence at or above the detection threshold.
    fn detect(&self, img: &DynamicImage) -> Result<Vec<DetectedFace>, ExtractError>;

    fn detect_file(&self, path: &Path) -> Result<Vec<DetectedFace>, ExtractError> {
        if !self.available() {
            return Err(ExtractError::NotInitialized { extractor: "face" });
        }
        let img = load_image(path)?;
        self.detect(&img)
    }

    /// Faces for a file; empty when disabled, unavailable or on any failure.
    fn faces_for(&self, path: &Path) -> Vec<DetectedFace> {
        if !self.available() {
            return Vec::new();
        }
        match self.detect_file(path) {
            Ok(faces) => faces,
            Err(e) => {
                log::debug!("Face extraction failed for {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }
}

/// Candidate box in normalised corner coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
}

impl Detection {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);

    let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

/// Greedy non-maximum suppression, highest score first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in detections {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Decode UltraFace-style outputs: `scores [1, N, 2]` (background, face) and
/// `boxes [1, N, 4]`. Candidates below `threshold` are dropped.
pub fn decode_detections(scores: &[f32], boxes: &[f32], threshold: f32) -> Vec<Detection> {
    scores
        .chunks_exact(2)
        .zip(boxes.chunks_exact(4))
        .filter(|(score, _)| score[1] >= threshold)
        .map(|(score, bbox)| Detection {
            x1: bbox[0].clamp(0.0, 1.0),
            y1: bbox[1].clamp(0.0, 1.0),
            x2: bbox[2].clamp(0.0, 1.0),
            y2: bbox[3].clamp(0.0, 1.0),
            score: score[1],
        })
        .collect()
}

/// Map a normalised detection to pixel coordinates. `None` for boxes under one pixel.
pub fn to_pixel_box(detection: &Detection, width: u32, height: u32) -> Option<BoundingBox> {
    let x = detection.x1 * width as f32;
    let y = detection.y1 * height as f32;
    let w = (detection.x2 - detection.x1) * width as f32;
    let h = (detection.y2 - detection.y1) * height as f32;

    if w < 1.0 || h < 1.0 {
        return None;
    }

    Some(BoundingBox {
        x,
        y,
        width: w,
        height: h,
    })
}

/// UltraFace detector + ArcFace embedder, with an optional gender/age head.
pub struct OnnxFaceExtractor {
    detector: Option<OnnxModel>,
    embedder: Option<OnnxModel>,
    attributes: Option<OnnxModel>,
    confidence_threshold: f32,
    nms_iou_threshold: f32,
    version: String,
}

impl OnnxFaceExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        let (detector, embedder, attributes) = if config.faces_enabled {
            (
                OnnxModel::load_optional(config.face_detector_model.as_deref(), "face detector"),
                OnnxModel::load_optional(config.face_embedder_model.as_deref(), "face embedder"),
                OnnxModel::load_optional(
                    config.face_attribute_model.as_deref(),
                    "face attribute",
                ),
            )
        } else {
            log::info!("Face extraction disabled by configuration");
            (None, None, None)
        };

        let version = match (&detector, &embedder) {
            (Some(d), Some(e)) => format!("faces:{}+{}", d.tag(), e.tag()),
            (Some(d), None) => format!("faces:{}", d.tag()),
            _ => "faces:unavailable".to_string(),
        };

        Self {
            detector,
            embedder,
            attributes,
            confidence_threshold: config.detection_confidence_threshold,
            nms_iou_threshold: config.nms_iou_threshold,
            version,
        }
    }

    fn embed(&self, model: &OnnxModel, crop: &DynamicImage) -> Result<Vec<f32>, ExtractError> {
        let input = crop.resize_exact(EMBEDDER_INPUT_SIZE, EMBEDDER_INPUT_SIZE, FilterType::Triangle);
        let outputs = model.run(to_nchw(&input, Normalization::ARCFACE))?;
        let mut embedding = first_output(&outputs)?.data.clone();
        l2_normalize(&mut embedding);
        Ok(embedding)
    }

    fn estimate_attributes(
        &self,
        model: &OnnxModel,
        crop: &DynamicImage,
    ) -> Result<(Option<f32>, Option<Gender>), ExtractError> {
        let input = crop.resize_exact(ATTRIBUTE_INPUT_SIZE, ATTRIBUTE_INPUT_SIZE, FilterType::Triangle);
        let outputs = model.run(to_nchw(&input, Normalization::RAW))?;
        Ok(decode_attributes(&first_output(&outputs)?.data))
    }
}

impl FaceExtractor for OnnxFaceExtractor {
    fn available(&self) -> bool {
        self.detector.is_some()
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn detect(&self, img: &DynamicImage) -> Result<Vec<DetectedFace>, ExtractError> {
        let detector = self
            .detector
            .as_ref()
            .ok_or(ExtractError::NotInitialized { extractor: "face" })?;

        let input = img.resize_exact(DETECTOR_INPUT_WIDTH, DETECTOR_INPUT_HEIGHT, FilterType::Triangle);
        let outputs = detector.run(to_nchw(&input, Normalization::ULTRAFACE))?;

        let scores = output_with_last_dim(&outputs, 2)?;
        let boxes = output_with_last_dim(&outputs, 4)?;
        let candidates = decode_detections(&scores.data, &boxes.data, self.confidence_threshold);
        let kept = non_max_suppression(candidates, self.nms_iou_threshold);

        let (width, height) = img.dimensions();
        let mut faces = Vec::with_capacity(kept.len());

        for detection in &kept {
            let Some(bbox) = to_pixel_box(detection, width, height) else {
                continue;
            };

            let crop = img.crop_imm(
                bbox.x as u32,
                bbox.y as u32,
                bbox.width.round().max(1.0) as u32,
                bbox.height.round().max(1.0) as u32,
            );

            let embedding = match &self.embedder {
                Some(model) => Some(self.embed(model, &crop)?),
                None => None,
            };

            let (age, gender) = match &self.attributes {
                Some(model) => self.estimate_attributes(model, &crop)?,
                None => (None, None),
            };

            faces.push(DetectedFace {
                bbox,
                confidence: detection.score,
                age,
                gender,
                embedding,
            });
        }

        log::debug!(
            "Detected {} face(s) from {} candidate box(es)",
            faces.len(),
            kept.len()
        );

        Ok(faces)
    }
}

/// `[female_logit, male_logit, age / 100]`.
pub fn decode_attributes(data: &[f32]) -> (Option<f32>, Option<Gender>) {
    if data.len() < 3 {
        return (None, None);
    }

    let gender = if data[0] > data[1] {
        Gender::Female
    } else {
        Gender::Male
    };
    let age = (data[2] * 100.0).max(0.0);

    (Some(age), Some(gender))
}

fn first_output(outputs: &[OutputTensor]) -> Result<&OutputTensor, ModelError> {
    outputs.first().ok_or_else(|| ModelError::UnexpectedOutput {
        message: "model produced no outputs".to_string(),
    })
}

fn output_with_last_dim(outputs: &[OutputTensor], last_dim: i64) -> Result<&OutputTensor, ModelError> {
    outputs
        .iter()
        .find(|output| output.shape.last() == Some(&last_dim))
        .ok_or_else(|| ModelError::UnexpectedOutput {
            message: format!("detector has no output with trailing dimension {}", last_dim),
        })
}
