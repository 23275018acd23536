use super::{decode_vector, encode_vector, parse_timestamp, DatabaseError};
use crate::core::fingerprint::Fingerprint;
use crate::database::models::{Descriptor, ExtractionKind, NewPhoto, PhotoId, PhotoRecord};
use crate::services::prescreen::CandidateFilter;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

const PHOTO_COLUMNS: &str = "id, path, taken_at, latitude, longitude, fingerprint, \
     descriptor, descriptor_version, descriptor_extracted_at";

// Well under SQLite's bound-parameter limit
const ID_CHUNK_SIZE: usize = 500;

/// Raw column values, converted outside the rusqlite row closure.
struct PhotoRow {
    id: i64,
    path: String,
    taken_at: Option<i64>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    fingerprint: Option<String>,
    descriptor: Option<Vec<u8>>,
    descriptor_version: Option<String>,
    descriptor_extracted_at: Option<String>,
}

impl PhotoRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            path: row.get(1)?,
            taken_at: row.get(2)?,
            latitude: row.get(3)?,
            longitude: row.get(4)?,
            fingerprint: row.get(5)?,
            descriptor: row.get(6)?,
            descriptor_version: row.get(7)?,
            descriptor_extracted_at: row.get(8)?,
        })
    }
}

impl TryFrom<PhotoRow> for PhotoRecord {
    type Error = DatabaseError;

    fn try_from(row: PhotoRow) -> Result<Self, Self::Error> {
        let taken_at = match row.taken_at {
            Some(secs) => Some(DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
                DatabaseError::Corrupt {
                    field: "taken_at",
                    message: format!("timestamp {} out of range", secs),
                }
            })?),
            None => None,
        };

        let fingerprint = match row.fingerprint {
            Some(hex) => Some(Fingerprint::from_hex(&hex).map_err(|e| DatabaseError::Corrupt {
                field: "fingerprint",
                message: e.to_string(),
            })?),
            None => None,
        };

        let descriptor = match (
            row.descriptor,
            row.descriptor_version,
            row.descriptor_extracted_at,
        ) {
            (Some(blob), Some(version), Some(extracted_at)) => Some(Descriptor {
                values: decode_vector(&blob)?,
                version,
                extracted_at: parse_timestamp("descriptor_extracted_at", &extracted_at)?,
            }),
            _ => None,
        };

        Ok(PhotoRecord {
            id: row.id,
            path: row.path,
            taken_at,
            latitude: row.latitude,
            longitude: row.longitude,
            fingerprint,
            descriptor,
        })
    }
}

pub struct PhotoRepository<'a> {
    conn: &'a Connection,
}

impl<'a> PhotoRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a photo, or refresh its metadata if the path is already registered.
    pub fn insert(&self, photo: &NewPhoto) -> Result<PhotoId, DatabaseError> {
        let id = self.conn.query_row(
            "INSERT INTO photos (path, taken_at, latitude, longitude)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET
                taken_at = excluded.taken_at,
                latitude = excluded.latitude,
                longitude = excluded.longitude
             RETURNING id",
            params![
                photo.path,
                photo.taken_at.map(|t| t.timestamp()),
                photo.latitude,
                photo.longitude
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn delete(&self, id: PhotoId) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn
            .execute("DELETE FROM photos WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn all_ids(&self) -> Result<Vec<PhotoId>, DatabaseError> {
        let mut stmt = self.conn.prepare("SELECT id FROM photos ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<PhotoId>, _>>()?;
        Ok(ids)
    }

    pub fn find_by_id(&self, id: PhotoId) -> Result<Option<PhotoRecord>, DatabaseError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM photos WHERE id = ?1", PHOTO_COLUMNS),
                params![id],
                PhotoRow::from_row,
            )
            .optional()?;

        row.map(PhotoRecord::try_from).transpose()
    }

    pub fn find_by_ids(&self, ids: &[PhotoId]) -> Result<Vec<PhotoRecord>, DatabaseError> {
        let mut photos = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(ID_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM photos WHERE id IN ({}) ORDER BY id",
                PHOTO_COLUMNS, placeholders
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), PhotoRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            for row in rows {
                photos.push(PhotoRecord::try_from(row)?);
            }
        }

        photos.sort_by_key(|photo| photo.id);
        photos.dedup_by_key(|photo| photo.id);
        Ok(photos)
    }

    /// Photos with a fingerprint that satisfy every active condition of `filter`.
    pub fn find_candidates(
        &self,
        filter: &CandidateFilter,
    ) -> Result<Vec<PhotoRecord>, DatabaseError> {
        let mut sql = format!(
            "SELECT {} FROM photos WHERE fingerprint IS NOT NULL",
            PHOTO_COLUMNS
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(id) = filter.exclude_id {
            sql.push_str(" AND id != ?");
            values.push(Value::Integer(id));
        }

        if let Some((start, end)) = filter.taken_between {
            sql.push_str(" AND taken_at BETWEEN ? AND ?");
            values.push(Value::Integer(start.timestamp()));
            values.push(Value::Integer(end.timestamp()));
        }

        if let Some(bounds) = &filter.bounds {
            if bounds.crosses_antimeridian() {
                sql.push_str(" AND latitude BETWEEN ? AND ? AND (longitude >= ? OR longitude <= ?)");
            } else {
                sql.push_str(" AND latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ?");
            }
            values.push(Value::Real(bounds.min_latitude));
            values.push(Value::Real(bounds.max_latitude));
            values.push(Value::Real(bounds.min_longitude));
            values.push(Value::Real(bounds.max_longitude));
        }

        sql.push_str(" ORDER BY id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), PhotoRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(PhotoRecord::try_from).collect()
    }

    pub fn update_features(
        &self,
        id: PhotoId,
        fingerprint: &Fingerprint,
        descriptor: Option<&Descriptor>,
    ) -> Result<(), DatabaseError> {
        let updated = match descriptor {
            Some(descriptor) => self.conn.execute(
                "UPDATE photos SET fingerprint = ?1, descriptor = ?2, descriptor_version = ?3,
                    descriptor_extracted_at = ?4
                 WHERE id = ?5",
                params![
                    fingerprint.to_hex(),
                    encode_vector(&descriptor.values),
                    descriptor.version,
                    descriptor.extracted_at.to_rfc3339(),
                    id
                ],
            )?,
            None => self.conn.execute(
                "UPDATE photos SET fingerprint = ?1 WHERE id = ?2",
                params![fingerprint.to_hex(), id],
            )?,
        };

        if updated == 0 {
            log::warn!("Photo {} vanished before its features were saved", id);
        }
        Ok(())
    }

    pub fn mark_faces_extracted(&self, id: PhotoId, version: &str) -> Result<(), DatabaseError> {
        self.conn.execute(
            "UPDATE photos SET faces_version = ?1, faces_extracted_at = ?2 WHERE id = ?3",
            params![version, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn stale_ids(&self, kind: ExtractionKind, version: &str) -> Result<Vec<PhotoId>, DatabaseError> {
        let (sql, needs_version) = match kind {
            ExtractionKind::Fingerprint => {
                ("SELECT id FROM photos WHERE fingerprint IS NULL ORDER BY id", false)
            }
            ExtractionKind::Descriptor => (
                "SELECT id FROM photos
                 WHERE descriptor IS NULL OR descriptor_version IS NULL OR descriptor_version != ?1
                 ORDER BY id",
                true,
            ),
            ExtractionKind::Faces => (
                "SELECT id FROM photos
                 WHERE faces_version IS NULL OR faces_version != ?1
                 ORDER BY id",
                true,
            ),
        };

        let mut stmt = self.conn.prepare(sql)?;
        let ids = if needs_version {
            stmt.query_map(params![version], |row| row.get(0))?
                .collect::<Result<Vec<PhotoId>, _>>()?
        } else {
            stmt.query_map([], |row| row.get(0))?
                .collect::<Result<Vec<PhotoId>, _>>()?
        };
        Ok(ids)
    }
}
