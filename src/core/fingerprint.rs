use crate::core::image::{load_image, ImageLoadError};
use image::DynamicImage;
use image_hasher::{HashAlg, Hasher, HasherConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub const FINGERPRINT_VERSION: &str = "phash-dct-mean-8x8";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("Invalid fingerprint hex: {value}")]
    InvalidHex { value: String },
}

/// Fixed-width perceptual bit string. Stored as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn bit_width(&self) -> u32 {
        self.0.len() as u32 * 8
    }

    pub fn from_hex(value: &str) -> Result<Self, FingerprintError> {
        let invalid = || FingerprintError::InvalidHex {
            value: value.to_string(),
        };

        if value.is_empty() || value.len() % 2 != 0 {
            return Err(invalid());
        }

        let mut bytes = Vec::with_capacity(value.len() / 2);
        for chunk in value.as_bytes().chunks(2) {
            let pair = std::str::from_utf8(chunk).map_err(|_| invalid())?;
            bytes.push(u8::from_str_radix(pair, 16).map_err(|_| invalid())?);
        }

        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Number of differing bits, or `None` when the widths differ.
    pub fn hamming_distance(&self, other: &Fingerprint) -> Option<u32> {
        if self.0.len() != other.0.len() {
            return None;
        }

        Some(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| (a ^ b).count_ones())
                .sum(),
        )
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Fingerprint::from_hex(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.to_hex()
    }
}

/// Computes 64-bit DCT mean hashes.
pub struct FingerprintExtractor;

impl FingerprintExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn version(&self) -> &'static str {
        FINGERPRINT_VERSION
    }

    pub fn fingerprint_image(&self, img: &DynamicImage) -> Fingerprint {
        let hash = Self::hasher().hash_image(img);
        Fingerprint::from_bytes(hash.as_bytes().to_vec())
    }

    pub fn fingerprint_file(&self, path: &Path) -> Result<Fingerprint, ImageLoadError> {
        let img = load_image(path)?;
        Ok(self.fingerprint_image(&img))
    }

    fn hasher() -> Hasher {
        HasherConfig::new()
            .hash_size(8, 8)
            .hash_alg(HashAlg::Mean)
            .preproc_dct()
            .to_hasher()
    }
}

impl Default for FingerprintExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    fn pattern(seed: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(128, 96, |x, y| {
            let v = ((x * (seed + 1) + y * 3 * seed) % 256) as u8;
            Rgb([v, v / 2, 255 - v])
        }))
    }

    fn checkerboard() -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(128, 96, |x, y| {
            if (x / 16 + y / 16) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        }))
    }

    #[test]
    fn test_fingerprint_is_64_bits() {
        let extractor = FingerprintExtractor::new();
        let fp = extractor.fingerprint_image(&pattern(1));
        assert_eq!(fp.bit_width(), 64);
        assert_eq!(fp.to_hex().len(), 16);
    }

    #[test]
    fn test_stable_under_lossless_reencoding() {
        let temp_dir = TempDir::new().unwrap();
        let png = temp_dir.path().join("a.png");
        let bmp = temp_dir.path().join("a.bmp");

        let img = pattern(2);
        img.save(&png).unwrap();
        img.save(&bmp).unwrap();

        let extractor = FingerprintExtractor::new();
        let from_memory = extractor.fingerprint_image(&img);
        assert_eq!(extractor.fingerprint_file(&png).unwrap(), from_memory);
        assert_eq!(extractor.fingerprint_file(&bmp).unwrap(), from_memory);
    }

    #[test]
    fn test_distinct_images_differ() {
        let extractor = FingerprintExtractor::new();
        let a = extractor.fingerprint_image(&pattern(1));
        let b = extractor.fingerprint_image(&checkerboard());
        assert!(a.hamming_distance(&b).unwrap() > 0);
    }

    #[test]
    fn test_hex_round_trip_and_rejects_garbage() {
        let fp = Fingerprint::from_bytes(vec![0x00, 0xff, 0x1a, 0x2b]);
        assert_eq!(fp.to_hex(), "00ff1a2b");
        assert_eq!(Fingerprint::from_hex("00ff1a2b").unwrap(), fp);

        assert!(Fingerprint::from_hex("").is_err());
        assert!(Fingerprint::from_hex("abc").is_err());
        assert!(Fingerprint::from_hex("zz").is_err());
    }

    #[test]
    fn test_hamming_distance() {
        let a = Fingerprint::from_bytes(vec![0b0000_0000, 0xff]);
        let b = Fingerprint::from_bytes(vec![0b0000_0111, 0xff]);
        assert_eq!(a.hamming_distance(&b), Some(3));
        assert_eq!(a.hamming_distance(&a), Some(0));

        let narrow = Fingerprint::from_bytes(vec![0]);
        assert_eq!(a.hamming_distance(&narrow), None);
    }
}
