use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("Could not find home directory")]
    NoHomeDir,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub extraction: ExtractionConfig,
    pub similarity: SimilarityConfig,
    pub clustering: ClusteringConfig,
    pub batch: BatchConfig,
    pub database: DatabaseConfig,
}

/// Model locations and face detection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub descriptor_model: Option<PathBuf>,
    pub face_detector_model: Option<PathBuf>,
    pub face_embedder_model: Option<PathBuf>,
    pub face_attribute_model: Option<PathBuf>,
    pub faces_enabled: bool,
    pub detection_confidence_threshold: f32,
    pub nms_iou_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub fingerprint_prefilter: f32,
    pub time_window_days: i64,
    pub geo_radius_degrees: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub similarity_threshold: f32,
    pub min_cluster_size: usize,
    pub max_clusters: usize,
    pub high_quality_min_members: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_threshold: usize,
    pub max_concurrent_items: usize,
    pub sub_batch_pause_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            descriptor_model: None,
            face_detector_model: None,
            face_embedder_model: None,
            face_attribute_model: None,
            faces_enabled: true,
            detection_confidence_threshold: 0.7,
            nms_iou_threshold: 0.4,
        }
    }
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            fingerprint_prefilter: 0.5,
            time_window_days: 3,
            geo_radius_degrees: 0.01,
        }
    }
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            min_cluster_size: 3,
            max_clusters: 50,
            high_quality_min_members: 5,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_threshold: 150,
            max_concurrent_items: num_cpus::get(),
            sub_batch_pause_ms: 100,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        unit_interval(
            "extraction.detection_confidence_threshold",
            self.extraction.detection_confidence_threshold,
        )?;
        unit_interval(
            "extraction.nms_iou_threshold",
            self.extraction.nms_iou_threshold,
        )?;
        unit_interval(
            "similarity.fingerprint_prefilter",
            self.similarity.fingerprint_prefilter,
        )?;
        unit_interval(
            "clustering.similarity_threshold",
            self.clustering.similarity_threshold,
        )?;

        if self.similarity.time_window_days < 0 {
            return Err(ConfigError::Invalid {
                field: "similarity.time_window_days",
                message: "must not be negative".to_string(),
            });
        }
        if !(self.similarity.geo_radius_degrees >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "similarity.geo_radius_degrees",
                message: "must not be negative".to_string(),
            });
        }
        if self.clustering.min_cluster_size < 2 {
            return Err(ConfigError::Invalid {
                field: "clustering.min_cluster_size",
                message: "a cluster needs at least 2 members".to_string(),
            });
        }
        at_least_one("clustering.max_clusters", self.clustering.max_clusters)?;
        at_least_one("batch.batch_size", self.batch.batch_size)?;
        at_least_one("batch.max_concurrent_items", self.batch.max_concurrent_items)?;

        Ok(())
    }

    /// Database path from config, falling back to `~/Documents/Likeness/likeness.db`.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.database.path {
            return Ok(path.clone());
        }

        let home_dir = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        let app_dir = home_dir.join("Documents").join("Likeness");
        fs::create_dir_all(&app_dir)?;

        Ok(app_dir.join("likeness.db"))
    }
}

fn unit_interval(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            message: format!("{} is outside [0, 1]", value),
        })
    }
}

fn at_least_one(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value >= 1 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            message: "must be at least 1".to_string(),
        })
    }
}
