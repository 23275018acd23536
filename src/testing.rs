//! Fixtures shared by unit tests.

use crate::core::faces::FaceExtractor;
use crate::core::features::ImageFeatureExtractor;
use crate::core::ExtractError;
use crate::database::models::{BoundingBox, DetectedFace, NewPhoto, PhotoId};
use crate::database::Database;
use image::{DynamicImage, ImageBuffer, Rgb};
use std::path::{Path, PathBuf};

/// Deterministic 32x32 gradient; different seeds give visibly different images.
pub fn pattern_image(seed: u8) -> DynamicImage {
    let seed = seed as u32;
    let img = ImageBuffer::from_fn(32, 32, |x, y| {
        Rgb([
            ((x * 8 + seed * 13) % 256) as u8,
            ((y * 8 + seed * 29) % 256) as u8,
            (((x + y) * 4 + seed * 7) % 256) as u8,
        ])
    });
    DynamicImage::ImageRgb8(img)
}

pub fn write_image(dir: &Path, name: &str, img: &DynamicImage) -> PathBuf {
    let path = dir.join(name);
    img.save(&path).unwrap();
    path
}

pub fn register(db: &Database, path: &Path) -> PhotoId {
    db.insert_photo(&NewPhoto {
        path: path.to_string_lossy().to_string(),
        taken_at: None,
        latitude: None,
        longitude: None,
    })
    .unwrap()
}

/// Mean colour descriptor.
pub struct StubFeatureExtractor {
    pub available: bool,
}

impl ImageFeatureExtractor for StubFeatureExtractor {
    fn available(&self) -> bool {
        self.available
    }

    fn version(&self) -> &str {
        "stub:mean"
    }

    fn extract(&self, img: &DynamicImage) -> Result<Vec<f32>, ExtractError> {
        let rgb = img.to_rgb8();
        let count = (rgb.width() * rgb.height()).max(1) as f32;
        let mut sums = [0.0f32; 3];
        for pixel in rgb.pixels() {
            for (sum, &channel) in sums.iter_mut().zip(pixel.0.iter()) {
                *sum += channel as f32;
            }
        }
        Ok(sums.iter().map(|s| s / count / 255.0 + 0.1).collect())
    }
}

pub struct PanickingFeatureExtractor;

impl ImageFeatureExtractor for PanickingFeatureExtractor {
    fn available(&self) -> bool {
        true
    }

    fn version(&self) -> &str {
        "stub:panic"
    }

    fn extract(&self, _img: &DynamicImage) -> Result<Vec<f32>, ExtractError> {
        panic!("backbone exploded")
    }
}

/// Reports one centred face per image.
pub struct StubFaceExtractor {
    pub available: bool,
}

impl FaceExtractor for StubFaceExtractor {
    fn available(&self) -> bool {
        self.available
    }

    fn version(&self) -> &str {
        "faces:stub"
    }

    fn detect(&self, img: &DynamicImage) -> Result<Vec<DetectedFace>, ExtractError> {
        let width = img.width() as f32;
        let height = img.height() as f32;
        Ok(vec![DetectedFace {
            bbox: BoundingBox {
                x: width / 4.0,
                y: height / 4.0,
                width: width / 2.0,
                height: height / 2.0,
            },
            confidence: 0.9,
            age: Some(30.0),
            gender: None,
            embedding: Some(vec![0.6, 0.8, 0.0]),
        }])
    }
}
