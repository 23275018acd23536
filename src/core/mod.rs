pub mod dbscan;
pub mod exif;
pub mod faces;
pub mod features;
pub mod fingerprint;
pub mod image;
pub mod onnx;
pub mod similarity;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{extractor} extractor not initialized")]
    NotInitialized { extractor: &'static str },

    #[error("Image load error: {0}")]
    Image(#[from] crate::core::image::ImageLoadError),

    #[error("Model error: {0}")]
    Model(#[from] crate::core::onnx::ModelError),
}
