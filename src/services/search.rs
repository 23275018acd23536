use crate::config::SimilarityConfig;
use crate::core::similarity::{cosine_similarity, fingerprint_similarity};
use crate::database::models::{PhotoId, PhotoRecord};
use crate::database::{DatabaseError, LibraryStore};
use crate::services::prescreen::PrescreenService;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Photo not found: {id}")]
    PhotoNotFound { id: PhotoId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarPhoto {
    pub photo_id: PhotoId,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Exact,
    Similar,
}

impl From<GroupKind> for String {
    fn from(kind: GroupKind) -> Self {
        match kind {
            GroupKind::Exact => "exact".to_string(),
            GroupKind::Similar => "similar".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarGroup {
    pub id: String,
    pub photo_ids: Vec<PhotoId>,
    /// Weakest link that holds the group together
    pub min_score: f32,
    pub kind: GroupKind,
}

/// Combined score of `candidate` against `reference`.
///
/// When both fingerprints exist and their similarity is below `prefilter`, the
/// candidate is rejected (`None`) without touching descriptors. Descriptors from the
/// same extractor version are authoritative; otherwise the fingerprint score stands.
pub fn score_candidate(
    reference: &PhotoRecord,
    candidate: &PhotoRecord,
    prefilter: f32,
) -> Option<f32> {
    let fingerprint_score = match (&reference.fingerprint, &candidate.fingerprint) {
        (Some(a), Some(b)) => Some(fingerprint_similarity(Some(a), Some(b))),
        _ => None,
    };

    if let Some(score) = fingerprint_score {
        if score < prefilter {
            return None;
        }
    }

    if let (Some(a), Some(b)) = (&reference.descriptor, &candidate.descriptor) {
        if a.version == b.version && a.values.len() == b.values.len() {
            return Some(cosine_similarity(&a.values, &b.values));
        }
    }

    Some(fingerprint_score.unwrap_or(0.0))
}

/// First-layer similar-photo search over pre-screened candidates.
pub struct SearchService {
    store: Arc<dyn LibraryStore>,
    prescreen: PrescreenService,
    fingerprint_prefilter: f32,
}

impl SearchService {
    pub fn new(store: Arc<dyn LibraryStore>, config: &SimilarityConfig) -> Self {
        Self {
            store,
            prescreen: PrescreenService::new(config),
            fingerprint_prefilter: config.fingerprint_prefilter,
        }
    }

    /// Photos similar to `reference_id`, best first, at most `limit`, all scoring at
    /// least `threshold`. Equal scores are ordered by photo id.
    pub fn find_similar(
        &self,
        reference_id: PhotoId,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<SimilarPhoto>, SearchError> {
        let reference = self
            .store
            .photo(reference_id)?
            .ok_or(SearchError::PhotoNotFound { id: reference_id })?;

        let candidates = self.prescreen.candidates(self.store.as_ref(), &reference)?;
        let candidate_count = candidates.len();

        let mut results: Vec<SimilarPhoto> = candidates
            .par_iter()
            .filter_map(|candidate| {
                score_candidate(&reference, candidate, self.fingerprint_prefilter).map(|score| {
                    SimilarPhoto {
                        photo_id: candidate.id,
                        score,
                    }
                })
            })
            .filter(|result| result.score >= threshold)
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.photo_id.cmp(&b.photo_id))
        });
        results.truncate(limit);

        log::info!(
            "Photo {}: {} candidate(s) scored, {} similar at threshold {:.2}",
            reference_id,
            candidate_count,
            results.len(),
            threshold
        );

        Ok(results)
    }

    /// Connected groups of similar photos across the whole library.
    pub fn similar_groups(&self, threshold: f32) -> Result<Vec<SimilarGroup>, SearchError> {
        let photos = self.store.photos_with_fingerprint()?;
        let filters: Vec<_> = photos
            .iter()
            .map(|photo| self.prescreen.filter_for(photo))
            .collect();

        let edges: Vec<(usize, usize, f32)> = (0..photos.len())
            .into_par_iter()
            .flat_map_iter(|i| {
                let photos = &photos;
                let filters = &filters;
                (i + 1..photos.len()).filter_map(move |j| {
                    if !filters[i].matches(&photos[j]) && !filters[j].matches(&photos[i]) {
                        return None;
                    }
                    score_candidate(&photos[i], &photos[j], self.fingerprint_prefilter)
                        .filter(|&score| score >= threshold)
                        .map(|score| (i, j, score))
                })
            })
            .collect();

        let mut components = UnionFind::new(photos.len());
        for &(i, j, _) in &edges {
            components.union(i, j);
        }

        let mut min_scores: HashMap<usize, f32> = HashMap::new();
        for &(i, _, score) in &edges {
            let root = components.find(i);
            let entry = min_scores.entry(root).or_insert(score);
            *entry = entry.min(score);
        }

        let mut members: HashMap<usize, Vec<usize>> = HashMap::new();
        for index in 0..photos.len() {
            let root = components.find(index);
            if min_scores.contains_key(&root) {
                members.entry(root).or_default().push(index);
            }
        }

        let mut groups: Vec<SimilarGroup> = members
            .into_iter()
            .map(|(root, indices)| {
                let first = &photos[indices[0]].fingerprint;
                let exact = indices.iter().all(|&i| &photos[i].fingerprint == first);
                let mut photo_ids: Vec<PhotoId> = indices.iter().map(|&i| photos[i].id).collect();
                photo_ids.sort_unstable();

                SimilarGroup {
                    id: format!("grp_{}", Uuid::new_v4().simple()),
                    photo_ids,
                    min_score: min_scores.get(&root).copied().unwrap_or(0.0),
                    kind: if exact {
                        GroupKind::Exact
                    } else {
                        GroupKind::Similar
                    },
                }
            })
            .collect();

        groups.sort_by_key(|group| group.photo_ids[0]);

        log::info!(
            "Grouped {} photo(s) into {} similar group(s)",
            photos.len(),
            groups.len()
        );

        Ok(groups)
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}
