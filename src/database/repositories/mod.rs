pub mod cluster;
pub mod face;
pub mod photo;

pub use cluster::ClusterRepository;
pub use face::FaceRepository;
pub use photo::PhotoRepository;

use super::DatabaseError;
use chrono::{DateTime, Utc};

/// Little-endian `f32` BLOB encoding for vectors.
pub(crate) fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>, DatabaseError> {
    if bytes.len() % 4 != 0 {
        return Err(DatabaseError::Corrupt {
            field: "vector",
            message: format!("blob length {} is not a multiple of 4", bytes.len()),
        });
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub(crate) fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Corrupt {
            field,
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_blob_encoding() {
        let values = vec![0.0, -1.25, 3.5e-7, f32::MAX];
        let blob = encode_vector(&values);
        assert_eq!(blob.len(), 16);
        assert_eq!(decode_vector(&blob).unwrap(), values);

        assert!(matches!(
            decode_vector(&[0, 1, 2]),
            Err(DatabaseError::Corrupt { field: "vector", .. })
        ));
    }
}
