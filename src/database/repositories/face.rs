use super::{decode_vector, encode_vector, parse_timestamp, DatabaseError};
use crate::database::models::{
    BoundingBox, DetectedFace, FaceEmbedding, FaceObservation, Gender, PhotoId,
};
use chrono::Utc;
use rusqlite::{params, Connection, Row};

struct FaceRow {
    id: i64,
    photo_id: i64,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    confidence: f64,
    age: Option<f64>,
    gender: Option<String>,
    embedding: Option<Vec<u8>>,
    embedding_version: Option<String>,
    extracted_at: String,
}

impl FaceRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            photo_id: row.get(1)?,
            x: row.get(2)?,
            y: row.get(3)?,
            width: row.get(4)?,
            height: row.get(5)?,
            confidence: row.get(6)?,
            age: row.get(7)?,
            gender: row.get(8)?,
            embedding: row.get(9)?,
            embedding_version: row.get(10)?,
            extracted_at: row.get(11)?,
        })
    }
}

impl TryFrom<FaceRow> for FaceObservation {
    type Error = DatabaseError;

    fn try_from(row: FaceRow) -> Result<Self, Self::Error> {
        Ok(FaceObservation {
            id: row.id,
            photo_id: row.photo_id,
            bbox: BoundingBox {
                x: row.x as f32,
                y: row.y as f32,
                width: row.width as f32,
                height: row.height as f32,
            },
            confidence: row.confidence as f32,
            age: row.age.map(|a| a as f32),
            gender: row.gender.map(Gender::try_from).transpose()?,
            embedding: row.embedding.as_deref().map(decode_vector).transpose()?,
            embedding_version: row.embedding_version,
            extracted_at: parse_timestamp("extracted_at", &row.extracted_at)?,
        })
    }
}

pub struct FaceRepository<'a> {
    conn: &'a Connection,
}

impl<'a> FaceRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Replace every face of `photo_id` with `faces`. Clusters holding the old rows must
    /// be dissolved first, see `ClusterRepository::delete_touching_photo`.
    pub fn replace_for_photo(
        &self,
        photo_id: PhotoId,
        faces: &[DetectedFace],
        version: &str,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute("DELETE FROM faces WHERE photo_id = ?1", params![photo_id])?;

        let now = Utc::now().to_rfc3339();
        let mut stmt = self.conn.prepare(
            "INSERT INTO faces (photo_id, x, y, width, height, confidence, age, gender,
                embedding, embedding_version, extracted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;

        for face in faces {
            let embedding = face.embedding.as_deref().map(encode_vector);
            let embedding_version = embedding.as_ref().map(|_| version);
            stmt.execute(params![
                photo_id,
                face.bbox.x as f64,
                face.bbox.y as f64,
                face.bbox.width as f64,
                face.bbox.height as f64,
                face.confidence as f64,
                face.age.map(|a| a as f64),
                face.gender.map(String::from),
                embedding,
                embedding_version,
                now,
            ])?;
        }

        Ok(())
    }

    pub fn find_by_photo(&self, photo_id: PhotoId) -> Result<Vec<FaceObservation>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, photo_id, x, y, width, height, confidence, age, gender,
                embedding, embedding_version, extracted_at
             FROM faces WHERE photo_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![photo_id], FaceRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(FaceObservation::try_from).collect()
    }

    /// Stored embeddings in face id order, restricted to `version` when given.
    pub fn embeddings(&self, version: Option<&str>) -> Result<Vec<FaceEmbedding>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, embedding FROM faces
             WHERE embedding IS NOT NULL AND (?1 IS NULL OR embedding_version = ?1)
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![version], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(face_id, blob)| {
                Ok(FaceEmbedding {
                    face_id,
                    values: decode_vector(&blob)?,
                })
            })
            .collect()
    }
}
