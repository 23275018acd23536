use crate::core::fingerprint::Fingerprint;
use crate::database::DatabaseError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type PhotoId = i64;
pub type FaceId = i64;

// Photo models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: PhotoId,
    pub path: String,
    pub taken_at: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub fingerprint: Option<Fingerprint>,
    pub descriptor: Option<Descriptor>,
}

impl PhotoRecord {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPhoto {
    pub path: String,
    pub taken_at: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    pub version: String,
    pub extracted_at: DateTime<Utc>,
}

// EXIF data structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExifData {
    pub taken_at: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub camera: Option<String>,
}

// Face models
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A face as returned by a detector, before it has a row id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub age: Option<f32>,
    pub gender: Option<Gender>,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceObservation {
    pub id: FaceId,
    pub photo_id: PhotoId,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub age: Option<f32>,
    pub gender: Option<Gender>,
    pub embedding: Option<Vec<f32>>,
    pub embedding_version: Option<String>,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceEmbedding {
    pub face_id: FaceId,
    pub values: Vec<f32>,
}

// Cluster models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceCluster {
    pub id: String,
    pub member_count: usize,
    pub representative_face_id: FaceId,
    pub quality_score: f32,
    pub quality_tier: QualityTier,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMembership {
    pub face_id: FaceId,
    pub cluster_id: String,
    pub similarity: f32,
}

/// Buffered output of one item, written with the rest of its sub-batch.
#[derive(Debug, Clone)]
pub enum Extraction {
    Image {
        photo_id: PhotoId,
        fingerprint: Fingerprint,
        descriptor: Option<Descriptor>,
    },
    Faces {
        photo_id: PhotoId,
        faces: Vec<DetectedFace>,
        version: String,
    },
}

impl Extraction {
    pub fn photo_id(&self) -> PhotoId {
        match self {
            Extraction::Image { photo_id, .. } | Extraction::Faces { photo_id, .. } => *photo_id,
        }
    }
}

// Enums for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Female,
    Male,
}

impl TryFrom<String> for Gender {
    type Error = DatabaseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "female" => Ok(Gender::Female),
            "male" => Ok(Gender::Male),
            _ => Err(DatabaseError::Corrupt {
                field: "gender",
                message: format!("unknown gender '{}'", s),
            }),
        }
    }
}

impl From<Gender> for String {
    fn from(gender: Gender) -> Self {
        match gender {
            Gender::Female => "female".to_string(),
            Gender::Male => "male".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    High,
    Medium,
}

impl TryFrom<String> for QualityTier {
    type Error = DatabaseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "high" => Ok(QualityTier::High),
            "medium" => Ok(QualityTier::Medium),
            _ => Err(DatabaseError::Corrupt {
                field: "quality_tier",
                message: format!("unknown tier '{}'", s),
            }),
        }
    }
}

impl From<QualityTier> for String {
    fn from(tier: QualityTier) -> Self {
        match tier {
            QualityTier::High => "high".to_string(),
            QualityTier::Medium => "medium".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionKind {
    /// Perceptual fingerprint only
    Fingerprint,
    /// Fingerprint plus global image descriptor
    Descriptor,
    /// Face observations with embeddings
    Faces,
}

impl std::str::FromStr for ExtractionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fingerprint" => Ok(ExtractionKind::Fingerprint),
            "descriptor" => Ok(ExtractionKind::Descriptor),
            "faces" => Ok(ExtractionKind::Faces),
            other => Err(format!(
                "unknown extraction kind '{}' (expected fingerprint, descriptor or faces)",
                other
            )),
        }
    }
}

impl From<ExtractionKind> for String {
    fn from(kind: ExtractionKind) -> Self {
        match kind {
            ExtractionKind::Fingerprint => "fingerprint".to_string(),
            ExtractionKind::Descriptor => "descriptor".to_string(),
            ExtractionKind::Faces => "faces".to_string(),
        }
    }
}
