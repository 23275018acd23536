use crate::core::image::{center_crop, load_image, resize_short_side, to_nchw, Normalization};
use crate::core::onnx::{ModelError, OnnxModel, OutputTensor};
use crate::core::ExtractError;
use image::DynamicImage;
use ndarray::Array4;
use std::path::Path;

const RESIZE_SHORT_SIDE: u32 = 256;
const CROP_SIZE: u32 = 224;

/// Produces one global descriptor per image.
pub trait ImageFeatureExtractor: Send + Sync {
    fn available(&self) -> bool;

    /// Tag stored with every descriptor; a change invalidates stored vectors.
    fn version(&self) -> &str;

    fn extract(&self, img: &DynamicImage) -> Result<Vec<f32>, ExtractError>;

    fn extract_file(&self, path: &Path) -> Result<Vec<f32>, ExtractError> {
        if !self.available() {
            return Err(ExtractError::NotInitialized {
                extractor: "image feature",
            });
        }
        let img = load_image(path)?;
        self.extract(&img)
    }

    /// Descriptor for a file, or `None` when the file is missing, undecodable or the
    /// extractor is unavailable.
    fn descriptor_for(&self, path: &Path) -> Option<Vec<f32>> {
        match self.extract_file(path) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                log::debug!("No descriptor for {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// Convolutional backbone (classification head removed) served through ONNX Runtime.
pub struct OnnxFeatureExtractor {
    model: Option<OnnxModel>,
    version: String,
}

impl OnnxFeatureExtractor {
    pub fn new(model_path: Option<&Path>) -> Self {
        let model = OnnxModel::load_optional(model_path, "descriptor");
        let version = match &model {
            Some(model) => format!("backbone:{}", model.tag()),
            None => "backbone:unavailable".to_string(),
        };

        Self { model, version }
    }
}

impl ImageFeatureExtractor for OnnxFeatureExtractor {
    fn available(&self) -> bool {
        self.model.is_some()
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn extract(&self, img: &DynamicImage) -> Result<Vec<f32>, ExtractError> {
        let model = self.model.as_ref().ok_or(ExtractError::NotInitialized {
            extractor: "image feature",
        })?;

        let outputs = model.run(backbone_input(img))?;
        let first = outputs
            .first()
            .ok_or_else(|| ModelError::UnexpectedOutput {
                message: "backbone produced no outputs".to_string(),
            })?;

        Ok(pool_output(first)?)
    }
}

/// Short side to 256, center crop 224x224, ImageNet normalisation.
pub fn backbone_input(img: &DynamicImage) -> Array4<f32> {
    let resized = resize_short_side(img, RESIZE_SHORT_SIDE);
    let cropped = center_crop(&resized, CROP_SIZE, CROP_SIZE);
    to_nchw(&cropped, Normalization::IMAGENET)
}

/// Reduce a backbone output to a flat descriptor: `[1, C, H, W]` is globally average
/// pooled, `[1, C]` is taken as is.
pub fn pool_output(output: &OutputTensor) -> Result<Vec<f32>, ModelError> {
    let dims: Vec<usize> = output.shape.iter().map(|&d| d.max(0) as usize).collect();

    match dims.as_slice() {
        [1, channels] if output.data.len() == *channels => Ok(output.data.clone()),
        [1, channels, height, width] if output.data.len() == channels * height * width => {
            let plane = height * width;
            if plane == 0 {
                return Ok(vec![0.0; *channels]);
            }
            Ok(output
                .data
                .chunks(plane)
                .map(|chunk| chunk.iter().sum::<f32>() / plane as f32)
                .collect())
        }
        _ => Err(ModelError::UnexpectedOutput {
            message: format!("cannot pool output {} with shape {:?}", output.name, output.shape),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn test_backbone_input_shape() {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(640, 480, Rgb([10, 20, 30])));
        let tensor = backbone_input(&img);
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);
    }

    #[test]
    fn test_pool_output_global_average() {
        let output = OutputTensor {
            name: "features".to_string(),
            shape: vec![1, 2, 2, 2],
            data: vec![1.0, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 10.0],
        };
        let pooled = pool_output(&output).unwrap();
        assert_eq!(pooled.len(), 2);
        assert_relative_eq!(pooled[0], 2.5);
        assert_relative_eq!(pooled[1], 10.0);
    }

    #[test]
    fn test_pool_output_flat_and_invalid() {
        let flat = OutputTensor {
            name: "pooled".to_string(),
            shape: vec![1, 3],
            data: vec![0.1, 0.2, 0.3],
        };
        assert_eq!(pool_output(&flat).unwrap(), vec![0.1, 0.2, 0.3]);

        let bad = OutputTensor {
            name: "logits".to_string(),
            shape: vec![2, 3],
            data: vec![0.0; 6],
        };
        assert!(pool_output(&bad).is_err());
    }

    #[test]
    fn test_unconfigured_extractor_is_inert() {
        let extractor = OnnxFeatureExtractor::new(None);
        assert!(!extractor.available());

        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(8, 8, Rgb([0, 0, 0])));
        assert!(matches!(
            extractor.extract(&img),
            Err(ExtractError::NotInitialized { .. })
        ));
        assert!(extractor
            .descriptor_for(Path::new("/non/existent/photo.jpg"))
            .is_none());
    }
}
