use super::{parse_timestamp, DatabaseError};
use crate::database::models::{ClusterMembership, FaceCluster, PhotoId, QualityTier};
use crate::services::clustering::ClusterResult;
use chrono::Utc;
use rusqlite::{params, Connection};

pub struct ClusterRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ClusterRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn delete_all(&self) -> Result<(), DatabaseError> {
        self.conn.execute("DELETE FROM cluster_memberships", [])?;
        self.conn.execute("DELETE FROM face_clusters", [])?;
        Ok(())
    }

    /// Dissolve every cluster with a member face on `photo_id`. Memberships cascade.
    pub fn delete_touching_photo(&self, photo_id: PhotoId) -> Result<usize, DatabaseError> {
        let deleted = self.conn.execute(
            "DELETE FROM face_clusters WHERE id IN (
                SELECT m.cluster_id FROM cluster_memberships m
                JOIN faces f ON f.id = m.face_id
                WHERE f.photo_id = ?1
             )",
            params![photo_id],
        )?;
        Ok(deleted)
    }

    pub fn insert(&self, cluster: &ClusterResult) -> Result<(), DatabaseError> {
        self.conn.execute(
            "INSERT INTO face_clusters (id, member_count, representative_face_id, quality_score,
                quality_tier, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                cluster.cluster_id,
                cluster.member_count as i64,
                cluster.representative_face_id,
                cluster.quality_score as f64,
                String::from(cluster.quality_tier),
                Utc::now().to_rfc3339(),
            ],
        )?;

        let mut stmt = self.conn.prepare(
            "INSERT INTO cluster_memberships (face_id, cluster_id, similarity)
             VALUES (?1, ?2, ?3)",
        )?;
        for membership in &cluster.memberships {
            stmt.execute(params![
                membership.face_id,
                membership.cluster_id,
                membership.similarity as f64
            ])?;
        }

        Ok(())
    }

    /// All clusters, largest first.
    pub fn find_all(&self) -> Result<Vec<FaceCluster>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, member_count, representative_face_id, quality_score, quality_tier,
                created_at
             FROM face_clusters ORDER BY member_count DESC, id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(id, member_count, representative_face_id, quality_score, tier, created_at)| {
                    Ok(FaceCluster {
                        id,
                        member_count: member_count.max(0) as usize,
                        representative_face_id,
                        quality_score: quality_score as f32,
                        quality_tier: QualityTier::try_from(tier)?,
                        created_at: parse_timestamp("created_at", &created_at)?,
                    })
                },
            )
            .collect()
    }

    pub fn members(&self, cluster_id: &str) -> Result<Vec<ClusterMembership>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT face_id, cluster_id, similarity FROM cluster_memberships
             WHERE cluster_id = ?1 ORDER BY similarity DESC, face_id",
        )?;
        let members = stmt
            .query_map(params![cluster_id], |row| {
                Ok(ClusterMembership {
                    face_id: row.get(0)?,
                    cluster_id: row.get(1)?,
                    similarity: row.get::<_, f64>(2)? as f32,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(members)
    }
}
