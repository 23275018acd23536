pub mod models;
pub mod repositories;

use crate::services::clustering::ClusterResult;
use crate::services::prescreen::CandidateFilter;
use models::{
    ClusterMembership, ExtractionKind, Extraction, FaceCluster, FaceEmbedding, FaceObservation,
    NewPhoto, PhotoId, PhotoRecord,
};
use repositories::{ClusterRepository, FaceRepository, PhotoRepository};
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database query error: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt {field} value: {message}")]
    Corrupt { field: &'static str, message: String },

    #[error("Database lock poisoned")]
    Poisoned,
}

/// Everything the similarity and clustering core needs from persistent storage.
///
/// `save_extractions` and `replace_clusters` must be atomic: either every row lands or
/// none does.
pub trait LibraryStore: Send + Sync {
    /// Records for the given ids, in id order. Unknown ids are omitted.
    fn photos_by_ids(&self, ids: &[PhotoId]) -> Result<Vec<PhotoRecord>, DatabaseError>;

    fn photo(&self, id: PhotoId) -> Result<Option<PhotoRecord>, DatabaseError>;

    /// Photos with a fingerprint matching `filter`, in id order.
    fn find_candidates(&self, filter: &CandidateFilter)
        -> Result<Vec<PhotoRecord>, DatabaseError>;

    fn photos_with_fingerprint(&self) -> Result<Vec<PhotoRecord>, DatabaseError>;

    fn save_extractions(&self, extractions: &[Extraction]) -> Result<(), DatabaseError>;

    /// Stored face embeddings in face id order. With `version`, only embeddings
    /// produced by that extractor version.
    fn face_embeddings(&self, version: Option<&str>) -> Result<Vec<FaceEmbedding>, DatabaseError>;

    /// Drop every persisted cluster and membership, then store `clusters`.
    fn replace_clusters(&self, clusters: &[ClusterResult]) -> Result<(), DatabaseError>;

    fn clusters(&self) -> Result<Vec<FaceCluster>, DatabaseError>;

    fn cluster_members(&self, cluster_id: &str) -> Result<Vec<ClusterMembership>, DatabaseError>;

    /// Photos whose output for `kind` is missing or was produced by another version.
    fn stale_photo_ids(
        &self,
        kind: ExtractionKind,
        version: &str,
    ) -> Result<Vec<PhotoId>, DatabaseError>;
}

/// SQLite-backed library store. Access is serialised through one connection.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DatabaseError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::Poisoned)?;
        f(&conn)
    }

    fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let mut conn = self.conn.lock().map_err(|_| DatabaseError::Poisoned)?;
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn insert_photo(&self, photo: &NewPhoto) -> Result<PhotoId, DatabaseError> {
        self.with_conn(|conn| PhotoRepository::new(conn).insert(photo))
    }

    pub fn photo_ids(&self) -> Result<Vec<PhotoId>, DatabaseError> {
        self.with_conn(|conn| PhotoRepository::new(conn).all_ids())
    }

    pub fn faces_for_photo(&self, photo_id: PhotoId) -> Result<Vec<FaceObservation>, DatabaseError> {
        self.with_conn(|conn| FaceRepository::new(conn).find_by_photo(photo_id))
    }

    /// Delete a photo with its faces, dissolving any cluster that held one of them.
    pub fn delete_photo(&self, photo_id: PhotoId) -> Result<bool, DatabaseError> {
        self.with_transaction(|tx| {
            let dissolved = ClusterRepository::new(tx).delete_touching_photo(photo_id)?;
            if dissolved > 0 {
                log::info!(
                    "Dissolved {} cluster(s) holding faces of photo {}",
                    dissolved,
                    photo_id
                );
            }
            PhotoRepository::new(tx).delete(photo_id)
        })
    }
}

impl LibraryStore for Database {
    fn photos_by_ids(&self, ids: &[PhotoId]) -> Result<Vec<PhotoRecord>, DatabaseError> {
        self.with_conn(|conn| PhotoRepository::new(conn).find_by_ids(ids))
    }

    fn photo(&self, id: PhotoId) -> Result<Option<PhotoRecord>, DatabaseError> {
        self.with_conn(|conn| PhotoRepository::new(conn).find_by_id(id))
    }

    fn find_candidates(
        &self,
        filter: &CandidateFilter,
    ) -> Result<Vec<PhotoRecord>, DatabaseError> {
        self.with_conn(|conn| PhotoRepository::new(conn).find_candidates(filter))
    }

    fn photos_with_fingerprint(&self) -> Result<Vec<PhotoRecord>, DatabaseError> {
        self.with_conn(|conn| PhotoRepository::new(conn).find_candidates(&CandidateFilter::default()))
    }

    fn save_extractions(&self, extractions: &[Extraction]) -> Result<(), DatabaseError> {
        self.with_transaction(|tx| {
            let photos = PhotoRepository::new(tx);
            let faces = FaceRepository::new(tx);
            let clusters = ClusterRepository::new(tx);

            for extraction in extractions {
                match extraction {
                    Extraction::Image {
                        photo_id,
                        fingerprint,
                        descriptor,
                    } => photos.update_features(*photo_id, fingerprint, descriptor.as_ref())?,
                    Extraction::Faces {
                        photo_id,
                        faces: detected,
                        version,
                    } => {
                        let dissolved = clusters.delete_touching_photo(*photo_id)?;
                        if dissolved > 0 {
                            log::info!(
                                "Dissolved {} cluster(s) after re-extracting faces of photo {}",
                                dissolved,
                                photo_id
                            );
                        }
                        faces.replace_for_photo(*photo_id, detected, version)?;
                        photos.mark_faces_extracted(*photo_id, version)?;
                    }
                }
            }

            Ok(())
        })
    }

    fn face_embeddings(&self, version: Option<&str>) -> Result<Vec<FaceEmbedding>, DatabaseError> {
        self.with_conn(|conn| FaceRepository::new(conn).embeddings(version))
    }

    fn replace_clusters(&self, clusters: &[ClusterResult]) -> Result<(), DatabaseError> {
        self.with_transaction(|tx| {
            let repository = ClusterRepository::new(tx);
            repository.delete_all()?;
            for cluster in clusters {
                repository.insert(cluster)?;
            }
            Ok(())
        })
    }

    fn clusters(&self) -> Result<Vec<FaceCluster>, DatabaseError> {
        self.with_conn(|conn| ClusterRepository::new(conn).find_all())
    }

    fn cluster_members(&self, cluster_id: &str) -> Result<Vec<ClusterMembership>, DatabaseError> {
        self.with_conn(|conn| ClusterRepository::new(conn).members(cluster_id))
    }

    fn stale_photo_ids(
        &self,
        kind: ExtractionKind,
        version: &str,
    ) -> Result<Vec<PhotoId>, DatabaseError> {
        self.with_conn(|conn| PhotoRepository::new(conn).stale_ids(kind, version))
    }
}

fn initialize_schema(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS photos (
            id INTEGER PRIMARY KEY,
            path TEXT UNIQUE NOT NULL,
            taken_at INTEGER,
            latitude REAL,
            longitude REAL,
            fingerprint TEXT,
            descriptor BLOB,
            descriptor_version TEXT,
            descriptor_extracted_at TEXT,
            faces_version TEXT,
            faces_extracted_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_photos_taken_at ON photos(taken_at)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_photos_location ON photos(latitude, longitude)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS faces (
            id INTEGER PRIMARY KEY,
            photo_id INTEGER NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
            x REAL NOT NULL,
            y REAL NOT NULL,
            width REAL NOT NULL,
            height REAL NOT NULL,
            confidence REAL NOT NULL,
            age REAL,
            gender TEXT,
            embedding BLOB,
            embedding_version TEXT,
            extracted_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS face_clusters (
            id TEXT PRIMARY KEY,
            member_count INTEGER NOT NULL,
            representative_face_id INTEGER NOT NULL REFERENCES faces(id) ON DELETE CASCADE,
            quality_score REAL NOT NULL,
            quality_tier TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // face_id as primary key: a face belongs to at most one cluster
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cluster_memberships (
            face_id INTEGER PRIMARY KEY REFERENCES faces(id) ON DELETE CASCADE,
            cluster_id TEXT NOT NULL REFERENCES face_clusters(id) ON DELETE CASCADE,
            similarity REAL NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_memberships_cluster ON cluster_memberships(cluster_id)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fingerprint::Fingerprint;
    use crate::database::models::{BoundingBox, Descriptor, DetectedFace, QualityTier};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn new_photo(path: &str) -> NewPhoto {
        NewPhoto {
            path: path.to_string(),
            taken_at: Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()),
            latitude: Some(48.85),
            longitude: Some(2.35),
        }
    }

    fn face(confidence: f32, embedding: Vec<f32>) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x: 1.0,
                y: 2.0,
                width: 30.0,
                height: 40.0,
            },
            confidence,
            age: Some(30.0),
            gender: None,
            embedding: Some(embedding),
        }
    }

    #[test]
    fn test_open_file_database() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("library.db");

        let db = Database::open(&db_path).unwrap();
        let id = db.insert_photo(&new_photo("/photos/a.jpg")).unwrap();
        drop(db);

        // Schema creation is idempotent and data persists
        let db = Database::open(&db_path).unwrap();
        let photo = db.photo(id).unwrap().unwrap();
        assert_eq!(photo.path, "/photos/a.jpg");
        assert_eq!(photo.latitude, Some(48.85));
        assert!(photo.fingerprint.is_none());
    }

    #[test]
    fn test_save_image_extraction() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_photo(&new_photo("/photos/a.jpg")).unwrap();

        let descriptor = Descriptor {
            values: vec![0.25, -1.5, 3.0],
            version: "backbone:test".to_string(),
            extracted_at: Utc::now(),
        };
        db.save_extractions(&[Extraction::Image {
            photo_id: id,
            fingerprint: Fingerprint::from_bytes(vec![0xab; 8]),
            descriptor: Some(descriptor.clone()),
        }])
        .unwrap();

        let photo = db.photo(id).unwrap().unwrap();
        assert_eq!(photo.fingerprint.unwrap().to_hex(), "abababababababab");
        let stored = photo.descriptor.unwrap();
        assert_eq!(stored.values, descriptor.values);
        assert_eq!(stored.version, "backbone:test");

        assert!(db
            .stale_photo_ids(ExtractionKind::Descriptor, "backbone:test")
            .unwrap()
            .is_empty());
        assert_eq!(
            db.stale_photo_ids(ExtractionKind::Descriptor, "backbone:v2")
                .unwrap(),
            vec![id]
        );
    }

    #[test]
    fn test_face_reextraction_replaces_rows() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_photo(&new_photo("/photos/a.jpg")).unwrap();

        let first = Extraction::Faces {
            photo_id: id,
            faces: vec![face(0.9, vec![1.0, 0.0]), face(0.8, vec![0.0, 1.0])],
            version: "faces:v1".to_string(),
        };
        db.save_extractions(&[first]).unwrap();
        assert_eq!(db.faces_for_photo(id).unwrap().len(), 2);
        assert_eq!(db.face_embeddings(None).unwrap().len(), 2);

        let second = Extraction::Faces {
            photo_id: id,
            faces: vec![face(0.95, vec![0.6, 0.8])],
            version: "faces:v1".to_string(),
        };
        db.save_extractions(&[second]).unwrap();

        let faces = db.faces_for_photo(id).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].embedding.as_deref(), Some(&[0.6, 0.8][..]));
        assert!(db
            .stale_photo_ids(ExtractionKind::Faces, "faces:v1")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_save_extractions_is_atomic() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_photo(&new_photo("/photos/a.jpg")).unwrap();

        // The second item references a photo that does not exist, so the face insert
        // violates the foreign key and the whole write rolls back.
        let result = db.save_extractions(&[
            Extraction::Image {
                photo_id: id,
                fingerprint: Fingerprint::from_bytes(vec![0x01; 8]),
                descriptor: None,
            },
            Extraction::Faces {
                photo_id: 9999,
                faces: vec![face(0.9, vec![1.0, 0.0])],
                version: "faces:v1".to_string(),
            },
        ]);

        assert!(result.is_err());
        assert!(db.photo(id).unwrap().unwrap().fingerprint.is_none());
    }

    fn cluster(cluster_id: &str, members: &[i64]) -> ClusterResult {
        ClusterResult {
            cluster_id: cluster_id.to_string(),
            member_face_ids: members.to_vec(),
            representative_face_id: members[0],
            quality_tier: QualityTier::Medium,
            member_count: members.len(),
            quality_score: 1.0,
            memberships: members
                .iter()
                .map(|&face_id| ClusterMembership {
                    face_id,
                    cluster_id: cluster_id.to_string(),
                    similarity: 1.0,
                })
                .collect(),
        }
    }

    /// Three photos with one face each, stored as one cluster represented by the first.
    fn clustered_trio(db: &Database) -> Vec<PhotoId> {
        let mut photo_ids = Vec::new();
        let mut face_ids = Vec::new();
        for i in 0..3 {
            let id = db
                .insert_photo(&new_photo(&format!("/photos/{}.jpg", i)))
                .unwrap();
            db.save_extractions(&[Extraction::Faces {
                photo_id: id,
                faces: vec![face(0.9, vec![1.0, 0.0])],
                version: "faces:v1".to_string(),
            }])
            .unwrap();
            face_ids.push(db.faces_for_photo(id).unwrap()[0].id);
            photo_ids.push(id);
        }
        db.replace_clusters(&[cluster("cls_trio", &face_ids)]).unwrap();
        assert_eq!(db.clusters().unwrap()[0].member_count, 3);
        photo_ids
    }

    fn assert_counts_match_memberships(db: &Database) {
        for stored in db.clusters().unwrap() {
            assert_eq!(
                stored.member_count,
                db.cluster_members(&stored.id).unwrap().len()
            );
        }
    }

    #[test]
    fn test_face_reextraction_dissolves_affected_cluster() {
        let db = Database::open_in_memory().unwrap();
        let photo_ids = clustered_trio(&db);

        // A non-representative photo now yields no faces
        db.save_extractions(&[Extraction::Faces {
            photo_id: photo_ids[2],
            faces: Vec::new(),
            version: "faces:v2".to_string(),
        }])
        .unwrap();

        assert!(db.clusters().unwrap().is_empty());
        assert!(db.cluster_members("cls_trio").unwrap().is_empty());
        assert_counts_match_memberships(&db);
        // Faces of the untouched photos remain available for the next run
        assert_eq!(db.face_embeddings(None).unwrap().len(), 2);
    }

    #[test]
    fn test_delete_photo_dissolves_affected_cluster() {
        let db = Database::open_in_memory().unwrap();
        let photo_ids = clustered_trio(&db);

        assert!(db.delete_photo(photo_ids[1]).unwrap());

        assert!(db.clusters().unwrap().is_empty());
        assert!(db.cluster_members("cls_trio").unwrap().is_empty());
        assert_counts_match_memberships(&db);
    }

    #[test]
    fn test_unrelated_extraction_keeps_clusters() {
        let db = Database::open_in_memory().unwrap();
        clustered_trio(&db);
        let loner = db.insert_photo(&new_photo("/photos/loner.jpg")).unwrap();

        db.save_extractions(&[Extraction::Faces {
            photo_id: loner,
            faces: vec![face(0.9, vec![0.0, 1.0])],
            version: "faces:v1".to_string(),
        }])
        .unwrap();

        let clusters = db.clusters().unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_count, 3);
        assert_counts_match_memberships(&db);
    }

    #[test]
    fn test_unknown_quality_tier_is_corrupt() {
        let db = Database::open_in_memory().unwrap();
        clustered_trio(&db);
        db.with_conn(|conn| {
            conn.execute("UPDATE face_clusters SET quality_tier = 'legendary'", [])?;
            Ok(())
        })
        .unwrap();

        match db.clusters() {
            Err(DatabaseError::Corrupt { field, .. }) => assert_eq!(field, "quality_tier"),
            other => panic!("expected corrupt tier, got {:?}", other),
        }
    }

    #[test]
    fn test_replace_clusters_discards_previous() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_photo(&new_photo("/photos/a.jpg")).unwrap();
        db.save_extractions(&[Extraction::Faces {
            photo_id: id,
            faces: vec![
                face(0.9, vec![1.0, 0.0]),
                face(0.9, vec![1.0, 0.0]),
                face(0.9, vec![1.0, 0.0]),
            ],
            version: "faces:v1".to_string(),
        }])
        .unwrap();
        let face_ids: Vec<i64> = db
            .face_embeddings(None)
            .unwrap()
            .into_iter()
            .map(|e| e.face_id)
            .collect();

        db.replace_clusters(&[cluster("cls_a", &face_ids)]).unwrap();
        assert_eq!(db.clusters().unwrap().len(), 1);
        assert_eq!(db.cluster_members("cls_a").unwrap().len(), 3);

        db.replace_clusters(&[cluster("cls_b", &face_ids[..2])]).unwrap();
        let clusters = db.clusters().unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].id, "cls_b");
        assert_eq!(clusters[0].member_count, 2);
        assert!(db.cluster_members("cls_a").unwrap().is_empty());
    }

    #[test]
    fn test_delete_photo_cascades() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_photo(&new_photo("/photos/a.jpg")).unwrap();
        db.save_extractions(&[Extraction::Faces {
            photo_id: id,
            faces: vec![face(0.9, vec![1.0, 0.0])],
            version: "faces:v1".to_string(),
        }])
        .unwrap();

        assert!(db.delete_photo(id).unwrap());
        assert!(db.face_embeddings(None).unwrap().is_empty());
        assert!(db.photo(id).unwrap().is_none());
    }
}
