use crate::database::models::ExifData;
use chrono::{DateTime, Utc};
use exif::{Exif, In, Reader, Tag, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExifError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("EXIF parsing error: {0}")]
    Parse(#[from] exif::Error),
}

/// Reads capture time and GPS position from image files
pub struct ExifService;

impl ExifService {
    pub fn new() -> Self {
        Self
    }

    /// Extract EXIF data from an image file. Unreadable files and files without EXIF
    /// yield `Ok(None)`.
    pub fn extract_exif(&self, file_path: &Path) -> Result<Option<ExifData>, ExifError> {
        let file = match File::open(file_path) {
            Ok(f) => f,
            Err(_) => return Ok(None),
        };

        let mut buf_reader = BufReader::new(file);

        let exif_reader = match Reader::new().read_from_container(&mut buf_reader) {
            Ok(reader) => reader,
            Err(_) => return Ok(None),
        };

        let mut exif_data = ExifData::default();

        // Capture time
        let datetime_field = exif_reader
            .get_field(Tag::DateTimeOriginal, In::PRIMARY)
            .or_else(|| exif_reader.get_field(Tag::DateTime, In::PRIMARY));
        if let Some(field) = datetime_field {
            if let Some(datetime_str) = self.field_to_string(&field.value) {
                exif_data.taken_at = self.parse_exif_datetime(&datetime_str);
            }
        }

        // GPS position
        exif_data.latitude =
            self.gps_coordinate(&exif_reader, Tag::GPSLatitude, Tag::GPSLatitudeRef, 'S');
        exif_data.longitude =
            self.gps_coordinate(&exif_reader, Tag::GPSLongitude, Tag::GPSLongitudeRef, 'W');

        let mut camera_parts = Vec::new();
        for tag in [Tag::Make, Tag::Model] {
            if let Some(field) = exif_reader.get_field(tag, In::PRIMARY) {
                if let Some(part) = self.field_to_string(&field.value) {
                    camera_parts.push(part.trim().to_string());
                }
            }
        }
        if !camera_parts.is_empty() {
            exif_data.camera = Some(camera_parts.join(" "));
        }

        if exif_data.taken_at.is_some()
            || exif_data.latitude.is_some()
            || exif_data.longitude.is_some()
            || exif_data.camera.is_some()
        {
            Ok(Some(exif_data))
        } else {
            Ok(None)
        }
    }

    /// Degrees/minutes/seconds to signed decimal degrees.
    fn gps_coordinate(&self, exif: &Exif, value_tag: Tag, ref_tag: Tag, negative: char) -> Option<f64> {
        let field = exif.get_field(value_tag, In::PRIMARY)?;
        let degrees = match &field.value {
            Value::Rational(parts) if !parts.is_empty() => {
                let mut total = 0.0;
                for (part, divisor) in parts.iter().zip([1.0, 60.0, 3600.0]) {
                    if part.denom == 0 {
                        return None;
                    }
                    total += part.num as f64 / part.denom as f64 / divisor;
                }
                total
            }
            _ => return None,
        };

        let sign = exif
            .get_field(ref_tag, In::PRIMARY)
            .and_then(|field| self.field_to_string(&field.value))
            .map(|reference| {
                if reference.trim().starts_with(negative) {
                    -1.0
                } else {
                    1.0
                }
            })
            .unwrap_or(1.0);

        Some(degrees * sign)
    }

    fn field_to_string(&self, value: &Value) -> Option<String> {
        match value {
            Value::Ascii(vec) => vec.first().map(|ascii_val| {
                String::from_utf8_lossy(ascii_val)
                    .trim_end_matches('\0')
                    .to_string()
            }),
            Value::Undefined(data, _) => Some(
                String::from_utf8_lossy(data)
                    .trim_end_matches('\0')
                    .to_string(),
            ),
            _ => None,
        }
    }

    /// Parse EXIF datetime ("YYYY:MM:DD HH:MM:SS") as UTC
    fn parse_exif_datetime(&self, datetime_str: &str) -> Option<DateTime<Utc>> {
        match chrono::NaiveDateTime::parse_from_str(datetime_str.trim(), "%Y:%m:%d %H:%M:%S") {
            Ok(dt) => Some(dt.and_utc()),
            Err(_) => {
                log::warn!("Failed to parse EXIF datetime: {}", datetime_str);
                None
            }
        }
    }
}

impl Default for ExifService {
    fn default() -> Self {
        Self::new()
    }
}
