use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageReader};
use ndarray::Array4;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageLoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decoding error: {0}")]
    Decode(#[from] image::ImageError),
}

/// Per-channel affine normalisation applied when converting pixels to a tensor:
/// `(pixel * scale - mean) / std`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub scale: f32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    pub const IMAGENET: Normalization = Normalization {
        scale: 1.0 / 255.0,
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };

    pub const ARCFACE: Normalization = Normalization {
        scale: 1.0,
        mean: [127.5, 127.5, 127.5],
        std: [127.5, 127.5, 127.5],
    };

    pub const ULTRAFACE: Normalization = Normalization {
        scale: 1.0,
        mean: [127.0, 127.0, 127.0],
        std: [128.0, 128.0, 128.0],
    };

    pub const RAW: Normalization = Normalization {
        scale: 1.0,
        mean: [0.0, 0.0, 0.0],
        std: [1.0, 1.0, 1.0],
    };
}

/// Decode an image from disk. The container is sniffed from content, so a WebP or TIFF
/// saved with a `.jpg` extension still decodes.
pub fn load_image(path: &Path) -> Result<DynamicImage, ImageLoadError> {
    let img = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(img)
}

/// Resize so the shorter side equals `short_side`, preserving aspect ratio.
pub fn resize_short_side(img: &DynamicImage, short_side: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img.clone();
    }

    let (new_width, new_height) = if width <= height {
        let ratio = short_side as f32 / width as f32;
        (short_side, ((height as f32 * ratio).round() as u32).max(1))
    } else {
        let ratio = short_side as f32 / height as f32;
        (((width as f32 * ratio).round() as u32).max(1), short_side)
    };

    img.resize_exact(new_width, new_height, FilterType::Triangle)
}

/// Crop the central `width` x `height` region (clamped to the image bounds).
pub fn center_crop(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    let (src_width, src_height) = img.dimensions();
    let crop_width = width.min(src_width);
    let crop_height = height.min(src_height);
    let x = (src_width - crop_width) / 2;
    let y = (src_height - crop_height) / 2;

    img.crop_imm(x, y, crop_width, crop_height)
}

/// Convert an image to a `[1, 3, H, W]` RGB tensor.
pub fn to_nchw(img: &DynamicImage, norm: Normalization) -> Array4<f32> {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] =
                (pixel[c] as f32 * norm.scale - norm.mean[c]) / norm.std[c];
        }
    }

    tensor
}
