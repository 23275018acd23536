use crate::config::ClusteringConfig;
use crate::core::dbscan::{dbscan, group_labels};
use crate::core::similarity::{l2_normalize, unit_cosine};
use crate::database::models::{ClusterMembership, FaceEmbedding, FaceId, QualityTier};
use crate::database::{DatabaseError, LibraryStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterResult {
    pub cluster_id: String,
    /// Ascending face ids
    pub member_face_ids: Vec<FaceId>,
    pub representative_face_id: FaceId,
    pub quality_tier: QualityTier,
    pub member_count: usize,
    /// Mean pairwise cosine similarity between members
    pub quality_score: f32,
    pub memberships: Vec<ClusterMembership>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterRunSummary {
    pub clusters: Vec<ClusterResult>,
    pub faces_considered: usize,
    /// Faces left unclustered by the density pass
    pub noise: usize,
    /// Faces whose cluster fell outside the top-N cap
    pub dropped: usize,
}

/// Density-based face clustering with top-N capping and representative selection.
#[derive(Debug, Clone)]
pub struct ClusteringEngine {
    config: ClusteringConfig,
}

impl ClusteringEngine {
    pub fn new(config: ClusteringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    pub fn cluster(&self, embeddings: &[FaceEmbedding]) -> ClusterRunSummary {
        let min_size = self.config.min_cluster_size;
        if embeddings.len() < min_size {
            log::info!(
                "Only {} face embedding(s), need {} to cluster",
                embeddings.len(),
                min_size
            );
            return ClusterRunSummary {
                faces_considered: embeddings.len(),
                ..ClusterRunSummary::default()
            };
        }

        // Vectors that cannot be compared with the majority never join a cluster
        let dimension = dominant_dimension(embeddings).unwrap_or(0);
        let (faces, vectors): (Vec<FaceId>, Vec<Vec<f32>>) = embeddings
            .iter()
            .filter(|e| e.values.len() == dimension && e.values.iter().any(|&v| v != 0.0))
            .map(|e| {
                let mut values = e.values.clone();
                l2_normalize(&mut values);
                (e.face_id, values)
            })
            .unzip();
        let invalid = embeddings.len() - faces.len();
        if invalid > 0 {
            log::warn!(
                "Ignoring {} embedding(s) with zero norm or dimension other than {}",
                invalid,
                dimension
            );
        }

        let eps = 1.0 - self.config.similarity_threshold;
        let labels = dbscan(&vectors, eps, min_size);
        let noise = labels.iter().filter(|l| l.is_none()).count() + invalid;

        let mut groups = group_labels(&labels);
        groups.sort_by(|a, b| {
            b.len()
                .cmp(&a.len())
                .then_with(|| min_face_id(a, &faces).cmp(&min_face_id(b, &faces)))
        });

        let dropped: usize = groups
            .iter()
            .skip(self.config.max_clusters)
            .map(|group| group.len())
            .sum();
        groups.truncate(self.config.max_clusters);

        let clusters: Vec<ClusterResult> = groups
            .iter()
            .map(|group| self.summarise(group, &faces, &vectors))
            .collect();

        log::info!(
            "Clustered {} face(s): {} cluster(s), {} noise, {} dropped by cap",
            embeddings.len(),
            clusters.len(),
            noise,
            dropped
        );

        ClusterRunSummary {
            clusters,
            faces_considered: embeddings.len(),
            noise,
            dropped,
        }
    }

    fn summarise(&self, group: &[usize], faces: &[FaceId], vectors: &[Vec<f32>]) -> ClusterResult {
        let n = group.len();
        let mut totals = vec![0.0f32; n];
        let mut pair_sum = 0.0f64;

        for a in 0..n {
            for b in (a + 1)..n {
                let sim = unit_cosine(&vectors[group[a]], &vectors[group[b]]);
                totals[a] += sim;
                totals[b] += sim;
                pair_sum += sim as f64;
            }
        }

        // Medoid: highest mean similarity to the others, ties to the lowest face id
        let mut representative = 0;
        for candidate in 1..n {
            let better = totals[candidate] > totals[representative]
                || (totals[candidate] == totals[representative]
                    && faces[group[candidate]] < faces[group[representative]]);
            if better {
                representative = candidate;
            }
        }

        let pairs = n * n.saturating_sub(1) / 2;
        let quality_score = if pairs == 0 {
            1.0
        } else {
            (pair_sum / pairs as f64) as f32
        };

        let cluster_id = format!("cls_{}", Uuid::new_v4().simple());
        let representative_vector = &vectors[group[representative]];

        let mut memberships: Vec<ClusterMembership> = group
            .iter()
            .enumerate()
            .map(|(position, &index)| ClusterMembership {
                face_id: faces[index],
                cluster_id: cluster_id.clone(),
                similarity: if position == representative {
                    1.0
                } else {
                    unit_cosine(&vectors[index], representative_vector)
                },
            })
            .collect();
        memberships.sort_by_key(|m| m.face_id);

        let member_face_ids: Vec<FaceId> = memberships.iter().map(|m| m.face_id).collect();
        let quality_tier = if n >= self.config.high_quality_min_members {
            QualityTier::High
        } else {
            QualityTier::Medium
        };

        ClusterResult {
            cluster_id,
            member_face_ids,
            representative_face_id: faces[group[representative]],
            quality_tier,
            member_count: n,
            quality_score,
            memberships,
        }
    }
}

/// Most common length among non-zero vectors; ties go to the length seen first.
fn dominant_dimension(embeddings: &[FaceEmbedding]) -> Option<usize> {
    let mut counts: Vec<(usize, usize)> = Vec::new();
    for embedding in embeddings {
        if !embedding.values.iter().any(|&v| v != 0.0) {
            continue;
        }
        let len = embedding.values.len();
        match counts.iter_mut().find(|(dimension, _)| *dimension == len) {
            Some((_, count)) => *count += 1,
            None => counts.push((len, 1)),
        }
    }

    counts
        .into_iter()
        .fold(None, |best: Option<(usize, usize)>, (dimension, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((dimension, count)),
        })
        .map(|(dimension, _)| dimension)
}

fn min_face_id(group: &[usize], faces: &[FaceId]) -> FaceId {
    group.iter().map(|&i| faces[i]).min().unwrap_or(FaceId::MAX)
}

/// Full re-cluster of every stored face embedding.
pub struct ClusteringService {
    store: Arc<dyn LibraryStore>,
    engine: ClusteringEngine,
    embedding_version: Option<String>,
}

impl ClusteringService {
    pub fn new(store: Arc<dyn LibraryStore>, config: ClusteringConfig) -> Self {
        Self {
            store,
            engine: ClusteringEngine::new(config),
            embedding_version: None,
        }
    }

    /// Only cluster embeddings produced by this face extractor version.
    pub fn with_embedding_version(mut self, version: impl Into<String>) -> Self {
        self.embedding_version = Some(version.into());
        self
    }

    /// Discard all persisted clusters and store a fresh set. With too few embeddings
    /// nothing is clustered and storage is left as it was.
    pub fn recluster(&self) -> Result<ClusterRunSummary, DatabaseError> {
        let embeddings = self
            .store
            .face_embeddings(self.embedding_version.as_deref())?;
        let summary = self.engine.cluster(&embeddings);
        if embeddings.len() < self.engine.config().min_cluster_size {
            return Ok(summary);
        }

        self.store.replace_clusters(&summary.clusters)?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{BoundingBox, DetectedFace, Extraction, NewPhoto};
    use crate::database::Database;
    use approx::assert_relative_eq;

    fn config(min_cluster_size: usize, max_clusters: usize) -> ClusteringConfig {
        ClusteringConfig {
            similarity_threshold: 0.9,
            min_cluster_size,
            max_clusters,
            high_quality_min_members: 5,
        }
    }

    fn embedding(face_id: FaceId, values: &[f32]) -> FaceEmbedding {
        FaceEmbedding {
            face_id,
            values: values.to_vec(),
        }
    }

    /// `count` tight points around basis axis `axis` of a 6-d space.
    fn blob(first_id: FaceId, axis: usize, count: usize) -> Vec<FaceEmbedding> {
        (0..count)
            .map(|k| {
                let mut v = vec![0.0; 6];
                v[axis] = 1.0;
                v[(axis + 1) % 6] = 0.02 * k as f32;
                embedding(first_id + k as FaceId, &v)
            })
            .collect()
    }

    #[test]
    fn test_four_close_faces_form_one_cluster() {
        let embeddings = vec![
            embedding(1, &[1.0, 0.0, 0.0]),
            embedding(2, &[0.99, 0.05, 0.0]),
            embedding(3, &[0.98, 0.0, 0.08]),
            embedding(4, &[0.97, 0.05, 0.05]),
        ];
        let engine = ClusteringEngine::new(ClusteringConfig {
            min_cluster_size: 3,
            ..ClusteringConfig::default()
        });

        let summary = engine.cluster(&embeddings);
        assert_eq!(summary.clusters.len(), 1);
        assert_eq!(summary.clusters[0].member_count, 4);
        assert_eq!(summary.clusters[0].member_face_ids, vec![1, 2, 3, 4]);
        assert_eq!(summary.clusters[0].quality_tier, QualityTier::Medium);
        assert_eq!(summary.noise, 0);
    }

    #[test]
    fn test_two_dense_groups_exclude_outliers() {
        let mut embeddings = blob(1, 0, 6);
        embeddings.extend(blob(100, 2, 4));
        embeddings.push(embedding(200, &[0.0, 0.0, 0.0, 0.0, 1.0, 0.0]));
        embeddings.push(embedding(201, &[0.0, 0.0, 0.0, 0.0, 0.0, 1.0]));
        embeddings.push(embedding(202, &[0.0, 1.0, 0.0, 1.0, 0.0, 0.0]));

        let summary = ClusteringEngine::new(config(3, 50)).cluster(&embeddings);

        assert_eq!(summary.clusters.len(), 2);
        assert_eq!(summary.clusters[0].member_count, 6);
        assert_eq!(summary.clusters[0].quality_tier, QualityTier::High);
        assert_eq!(summary.clusters[1].member_count, 4);
        assert_eq!(summary.clusters[1].quality_tier, QualityTier::Medium);
        assert_eq!(summary.noise, 3);

        let clustered: Vec<FaceId> = summary
            .clusters
            .iter()
            .flat_map(|c| c.member_face_ids.iter().copied())
            .collect();
        assert!(!clustered.iter().any(|id| [200, 201, 202].contains(id)));
    }

    #[test]
    fn test_top_n_keeps_largest_clusters() {
        let mut embeddings = blob(1, 0, 3);
        embeddings.extend(blob(10, 1, 5));
        embeddings.extend(blob(20, 2, 4));
        embeddings.extend(blob(30, 3, 6));

        let summary = ClusteringEngine::new(config(3, 2)).cluster(&embeddings);

        let sizes: Vec<usize> = summary.clusters.iter().map(|c| c.member_count).collect();
        assert_eq!(sizes, vec![6, 5]);
        assert_eq!(summary.dropped, 7);
        assert_eq!(summary.clusters[0].member_face_ids[0], 30);
    }

    #[test]
    fn test_representative_is_medoid() {
        // Face 3 sits between the others
        let embeddings = vec![
            embedding(1, &[1.0, 0.0]),
            embedding(2, &[0.96, 0.28]),
            embedding(3, &[0.995, 0.0998]),
        ];
        let summary = ClusteringEngine::new(ClusteringConfig {
            similarity_threshold: 0.9,
            min_cluster_size: 3,
            max_clusters: 10,
            high_quality_min_members: 5,
        })
        .cluster(&embeddings);

        let cluster = &summary.clusters[0];
        assert_eq!(cluster.representative_face_id, 3);
        let representative = cluster
            .memberships
            .iter()
            .find(|m| m.face_id == 3)
            .unwrap();
        assert_eq!(representative.similarity, 1.0);
        assert!(cluster.memberships.iter().all(|m| m.cluster_id == cluster.cluster_id));
        assert!(cluster.memberships.iter().all(|m| m.similarity > 0.9));
        assert!(cluster.quality_score > 0.9 && cluster.quality_score <= 1.0);
    }

    #[test]
    fn test_identical_members_tie_to_lowest_face_id() {
        let embeddings = vec![
            embedding(9, &[0.0, 1.0]),
            embedding(4, &[0.0, 1.0]),
            embedding(6, &[0.0, 1.0]),
        ];
        let summary = ClusteringEngine::new(config(3, 10)).cluster(&embeddings);
        assert_eq!(summary.clusters[0].representative_face_id, 4);
        assert_relative_eq!(summary.clusters[0].quality_score, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_too_few_embeddings_is_empty_success() {
        let embeddings = vec![embedding(1, &[1.0, 0.0]), embedding(2, &[1.0, 0.0])];
        let summary = ClusteringEngine::new(config(3, 10)).cluster(&embeddings);
        assert!(summary.clusters.is_empty());
        assert_eq!(summary.faces_considered, 2);
    }

    #[test]
    fn test_odd_first_embedding_does_not_hide_the_rest() {
        let embeddings = vec![
            embedding(1, &[1.0, 0.0]),
            embedding(2, &[1.0, 0.0, 0.0]),
            embedding(3, &[0.99, 0.05, 0.0]),
            embedding(4, &[0.98, 0.0, 0.08]),
            embedding(5, &[0.97, 0.05, 0.05]),
        ];
        let summary = ClusteringEngine::new(config(3, 10)).cluster(&embeddings);

        assert_eq!(summary.clusters.len(), 1);
        assert_eq!(summary.clusters[0].member_face_ids, vec![2, 3, 4, 5]);
        assert_eq!(summary.noise, 1);
        assert_eq!(summary.faces_considered, 5);
    }

    #[test]
    fn test_all_zero_embeddings_are_noise() {
        let embeddings = vec![
            embedding(1, &[0.0, 0.0]),
            embedding(2, &[0.0, 0.0]),
            embedding(3, &[0.0, 0.0]),
        ];
        let summary = ClusteringEngine::new(config(3, 10)).cluster(&embeddings);
        assert!(summary.clusters.is_empty());
        assert_eq!(summary.noise, 3);
    }

    fn store_faces(db: &Database, vectors: &[Vec<f32>]) {
        store_versioned_faces(db, "/p/crowd.jpg", "faces:test", vectors);
    }

    fn store_versioned_faces(db: &Database, path: &str, version: &str, vectors: &[Vec<f32>]) {
        let photo_id = db
            .insert_photo(&NewPhoto {
                path: path.to_string(),
                taken_at: None,
                latitude: None,
                longitude: None,
            })
            .unwrap();
        let faces = vectors
            .iter()
            .map(|v| DetectedFace {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 10.0,
                    height: 10.0,
                },
                confidence: 0.9,
                age: None,
                gender: None,
                embedding: Some(v.clone()),
            })
            .collect();
        db.save_extractions(&[Extraction::Faces {
            photo_id,
            faces,
            version: version.to_string(),
        }])
        .unwrap();
    }

    #[test]
    fn test_recluster_ignores_embeddings_of_other_versions() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        store_versioned_faces(
            &db,
            "/p/current.jpg",
            "faces:v2",
            &[vec![1.0, 0.0], vec![0.99, 0.05], vec![0.98, 0.1]],
        );
        // Same dimension, older model: must not join the current clusters
        store_versioned_faces(
            &db,
            "/p/stale.jpg",
            "faces:v1",
            &[vec![1.0, 0.01], vec![0.99, 0.04]],
        );

        let service =
            ClusteringService::new(db.clone(), config(3, 10)).with_embedding_version("faces:v2");
        let summary = service.recluster().unwrap();

        assert_eq!(summary.faces_considered, 3);
        assert_eq!(summary.clusters.len(), 1);
        assert_eq!(summary.clusters[0].member_count, 3);

        let current: Vec<FaceId> = db
            .face_embeddings(Some("faces:v2"))
            .unwrap()
            .into_iter()
            .map(|e| e.face_id)
            .collect();
        assert_eq!(summary.clusters[0].member_face_ids, current);
    }

    #[test]
    fn test_recluster_replaces_persisted_clusters() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        store_faces(
            &db,
            &[
                vec![1.0, 0.0],
                vec![0.99, 0.05],
                vec![0.98, 0.1],
                vec![0.0, 1.0],
            ],
        );

        let service = ClusteringService::new(db.clone(), config(3, 10));
        let first = service.recluster().unwrap();
        assert_eq!(first.clusters.len(), 1);
        assert_eq!(first.noise, 1);

        let second = service.recluster().unwrap();
        let stored = db.clusters().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, second.clusters[0].cluster_id);
        assert_ne!(stored[0].id, first.clusters[0].cluster_id);
        assert_eq!(db.cluster_members(&stored[0].id).unwrap().len(), 3);
    }

    #[test]
    fn test_recluster_with_too_few_faces_leaves_storage_untouched() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        store_faces(&db, &[vec![1.0, 0.0], vec![1.0, 0.01], vec![1.0, 0.02]]);

        let service = ClusteringService::new(db.clone(), config(3, 10));
        let summary = service.recluster().unwrap();
        assert_eq!(summary.clusters.len(), 1);

        let strict = ClusteringService::new(db.clone(), config(4, 10));
        let degenerate = strict.recluster().unwrap();
        assert!(degenerate.clusters.is_empty());

        let stored = db.clusters().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, summary.clusters[0].cluster_id);
    }
}
