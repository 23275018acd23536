use crate::config::SimilarityConfig;
use crate::database::models::{PhotoId, PhotoRecord};
use crate::database::{DatabaseError, LibraryStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

impl GeoBounds {
    /// Box of `radius_degrees` around a point. Latitude is clamped at the poles and
    /// longitude wraps at ±180, so `min_longitude > max_longitude` means the box
    /// crosses the antimeridian. A box touching a pole spans every longitude.
    pub fn around(latitude: f64, longitude: f64, radius_degrees: f64) -> Self {
        let min_latitude = (latitude - radius_degrees).max(-90.0);
        let max_latitude = (latitude + radius_degrees).min(90.0);

        let (min_longitude, max_longitude) =
            if radius_degrees >= 180.0 || min_latitude <= -90.0 || max_latitude >= 90.0 {
                (-180.0, 180.0)
            } else {
                (
                    wrap_longitude(longitude - radius_degrees),
                    wrap_longitude(longitude + radius_degrees),
                )
            };

        Self {
            min_latitude,
            max_latitude,
            min_longitude,
            max_longitude,
        }
    }

    pub fn crosses_antimeridian(&self) -> bool {
        self.min_longitude > self.max_longitude
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        let longitude_ok = if self.crosses_antimeridian() {
            longitude >= self.min_longitude || longitude <= self.max_longitude
        } else {
            (self.min_longitude..=self.max_longitude).contains(&longitude)
        };
        (self.min_latitude..=self.max_latitude).contains(&latitude) && longitude_ok
    }
}

/// Map any longitude into [-180, 180).
fn wrap_longitude(longitude: f64) -> f64 {
    (longitude + 180.0).rem_euclid(360.0) - 180.0
}

/// Conditions a candidate must satisfy. Active conditions combine with AND; a
/// fingerprint is always required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateFilter {
    pub exclude_id: Option<PhotoId>,
    pub taken_between: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub bounds: Option<GeoBounds>,
}

impl CandidateFilter {
    pub fn matches(&self, photo: &PhotoRecord) -> bool {
        if photo.fingerprint.is_none() || self.exclude_id == Some(photo.id) {
            return false;
        }

        if let Some((start, end)) = self.taken_between {
            // Compared at second precision, as stored
            match photo.taken_at {
                Some(taken_at) => {
                    let t = taken_at.timestamp();
                    if t < start.timestamp() || t > end.timestamp() {
                        return false;
                    }
                }
                None => return false,
            }
        }

        if let Some(bounds) = &self.bounds {
            match photo.coordinates() {
                Some((lat, lon)) if bounds.contains(lat, lon) => {}
                _ => return false,
            }
        }

        true
    }
}

/// Narrows the comparison population for a reference photo using capture time and
/// location.
#[derive(Debug, Clone)]
pub struct PrescreenService {
    time_window: Duration,
    geo_radius_degrees: f64,
}

impl PrescreenService {
    pub fn new(config: &SimilarityConfig) -> Self {
        Self {
            time_window: Duration::days(config.time_window_days),
            geo_radius_degrees: config.geo_radius_degrees,
        }
    }

    pub fn filter_for(&self, reference: &PhotoRecord) -> CandidateFilter {
        CandidateFilter {
            exclude_id: Some(reference.id),
            taken_between: reference
                .taken_at
                .map(|t| (t - self.time_window, t + self.time_window)),
            bounds: reference
                .coordinates()
                .map(|(lat, lon)| GeoBounds::around(lat, lon, self.geo_radius_degrees)),
        }
    }

    pub fn candidates(
        &self,
        store: &dyn LibraryStore,
        reference: &PhotoRecord,
    ) -> Result<Vec<PhotoRecord>, DatabaseError> {
        let filter = self.filter_for(reference);
        let candidates = store.find_candidates(&filter)?;

        log::debug!(
            "Pre-screening photo {} (time: {}, geo: {}) kept {} candidate(s)",
            reference.id,
            filter.taken_between.is_some(),
            filter.bounds.is_some(),
            candidates.len()
        );

        Ok(candidates)
    }
}

impl Default for PrescreenService {
    fn default() -> Self {
        Self::new(&SimilarityConfig::default())
    }
}
