use crate::config::{BatchConfig, ExtractionConfig};
use crate::core::faces::{FaceExtractor, OnnxFaceExtractor};
use crate::core::features::{ImageFeatureExtractor, OnnxFeatureExtractor};
use crate::core::fingerprint::FingerprintExtractor;
use crate::core::image::load_image;
use crate::core::ExtractError;
use crate::database::models::{Descriptor, Extraction, ExtractionKind, PhotoId, PhotoRecord};
use crate::database::{DatabaseError, LibraryStore};
use crate::services::registry::TaskRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("{kind} extractor not initialized")]
    NotInitialized { kind: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl From<TaskState> for String {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Created => "created".to_string(),
            TaskState::Processing => "processing".to_string(),
            TaskState::Completed => "completed".to_string(),
            TaskState::Failed => "failed".to_string(),
            TaskState::Cancelled => "cancelled".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub photo_id: PhotoId,
    pub message: String,
}

/// Outcome of one sub-batch. `index` is 1-based.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubBatchReport {
    pub index: usize,
    pub size: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub state: TaskState,
    pub error: Option<String>,
}

/// Polling snapshot of a batch task.
///
/// `completed + failed + in_flight == total` holds for every snapshot. Skipped items are
/// counted in `completed` as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatus {
    pub task_id: String,
    pub kind: ExtractionKind,
    #[serde(rename = "status")]
    pub state: TaskState,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub in_flight: usize,
    /// Extractions currently holding an admission permit
    pub running: usize,
    /// 1-based; 0 until the first sub-batch starts
    pub current_sub_batch: usize,
    pub total_sub_batches: usize,
    pub sub_batches: Vec<SubBatchReport>,
    pub error_details: Vec<ItemError>,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchStatus {
    pub fn new(task_id: String, kind: ExtractionKind, total: usize, total_sub_batches: usize) -> Self {
        Self {
            task_id,
            kind,
            state: TaskState::Created,
            total,
            completed: 0,
            failed: 0,
            skipped: 0,
            in_flight: total,
            running: 0,
            current_sub_batch: 0,
            total_sub_batches,
            sub_batches: Vec::new(),
            error_details: Vec::new(),
            message: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// `completed / total * 100` rounded to two decimals; 0 for an empty task.
    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let percent = self.completed as f64 / self.total as f64 * 100.0;
        (percent * 100.0).round() / 100.0
    }

    pub(crate) fn recompute_in_flight(&mut self) {
        self.in_flight = self
            .total
            .saturating_sub(self.completed)
            .saturating_sub(self.failed);
    }
}

/// Number of sub-batches for `total` items: fixed-size chunks above `threshold`,
/// otherwise a single sub-batch.
pub fn sub_batch_count(total: usize, batch_size: usize, threshold: usize) -> usize {
    if total == 0 {
        0
    } else if total > threshold {
        total.div_ceil(batch_size.max(1))
    } else {
        1
    }
}

pub fn plan_sub_batches(ids: &[PhotoId], batch_size: usize, threshold: usize) -> Vec<Vec<PhotoId>> {
    if ids.is_empty() {
        return Vec::new();
    }
    if ids.len() > threshold {
        ids.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect()
    } else {
        vec![ids.to_vec()]
    }
}

/// The extractors a batch can drive, shared across tasks.
#[derive(Clone)]
pub struct Extractors {
    pub fingerprints: Arc<FingerprintExtractor>,
    pub features: Arc<dyn ImageFeatureExtractor>,
    pub faces: Arc<dyn FaceExtractor>,
}

impl Extractors {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            fingerprints: Arc::new(FingerprintExtractor::new()),
            features: Arc::new(OnnxFeatureExtractor::new(config.descriptor_model.as_deref())),
            faces: Arc::new(OnnxFaceExtractor::new(config)),
        }
    }

    pub fn available(&self, kind: ExtractionKind) -> bool {
        match kind {
            ExtractionKind::Fingerprint => true,
            ExtractionKind::Descriptor => self.features.available(),
            ExtractionKind::Faces => self.faces.available(),
        }
    }

    /// Version tag persisted for `kind`; used to find stale photos.
    pub fn version_for(&self, kind: ExtractionKind) -> String {
        match kind {
            ExtractionKind::Fingerprint => self.fingerprints.version().to_string(),
            ExtractionKind::Descriptor => self.features.version().to_string(),
            ExtractionKind::Faces => self.faces.version().to_string(),
        }
    }

    fn extract(&self, kind: ExtractionKind, photo: &PhotoRecord) -> Result<Extraction, ExtractError> {
        let path = PathBuf::from(&photo.path);
        match kind {
            ExtractionKind::Fingerprint => Ok(Extraction::Image {
                photo_id: photo.id,
                fingerprint: self.fingerprints.fingerprint_file(&path)?,
                descriptor: None,
            }),
            ExtractionKind::Descriptor => {
                let img = load_image(&path)?;
                let values = self.features.extract(&img)?;
                Ok(Extraction::Image {
                    photo_id: photo.id,
                    fingerprint: self.fingerprints.fingerprint_image(&img),
                    descriptor: Some(Descriptor {
                        values,
                        version: self.features.version().to_string(),
                        extracted_at: Utc::now(),
                    }),
                })
            }
            ExtractionKind::Faces => Ok(Extraction::Faces {
                photo_id: photo.id,
                faces: self.faces.detect_file(&path)?,
                version: self.faces.version().to_string(),
            }),
        }
    }
}

/// Runs extraction tasks in sub-batches and publishes their status to a registry.
pub struct BatchOrchestrator {
    store: Arc<dyn LibraryStore>,
    registry: Arc<TaskRegistry>,
    extractors: Extractors,
    config: BatchConfig,
    semaphore: Arc<Semaphore>,
}

impl BatchOrchestrator {
    pub fn new(
        store: Arc<dyn LibraryStore>,
        registry: Arc<TaskRegistry>,
        extractors: Extractors,
        config: BatchConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_items.max(1)));
        Self {
            store,
            registry,
            extractors,
            config,
            semaphore,
        }
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.registry.clone()
    }

    /// Register a task for `ids` and start it in the background. Duplicate ids are
    /// processed once.
    pub async fn submit(&self, kind: ExtractionKind, ids: Vec<PhotoId>) -> TaskHandle {
        let mut seen = HashSet::new();
        let ids: Vec<PhotoId> = ids.into_iter().filter(|id| seen.insert(*id)).collect();

        let task_id = format!("task_{}", Uuid::new_v4().simple());
        let total_sub_batches =
            sub_batch_count(ids.len(), self.config.batch_size, self.config.batch_threshold);
        self.registry
            .put(BatchStatus::new(task_id.clone(), kind, ids.len(), total_sub_batches))
            .await;

        log::info!(
            "Submitted {} task {} for {} photo(s) in {} sub-batch(es)",
            String::from(kind),
            task_id,
            ids.len(),
            total_sub_batches
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let run = Arc::new(TaskRun {
            task_id: task_id.clone(),
            kind,
            ids,
            store: self.store.clone(),
            registry: self.registry.clone(),
            extractors: self.extractors.clone(),
            config: self.config.clone(),
            semaphore: self.semaphore.clone(),
            cancel: cancel.clone(),
        });
        let join = tokio::spawn(run.drive());

        TaskHandle {
            task_id,
            cancel,
            registry: self.registry.clone(),
            join,
        }
    }

    pub async fn status(&self, task_id: &str) -> Result<BatchStatus, BatchError> {
        self.registry
            .get(task_id)
            .await
            .ok_or_else(|| BatchError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }
}

/// Caller's side of a submitted task.
pub struct TaskHandle {
    task_id: String,
    cancel: Arc<AtomicBool>,
    registry: Arc<TaskRegistry>,
    join: JoinHandle<Option<BatchStatus>>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Request cancellation; takes effect before the next sub-batch starts.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub async fn status(&self) -> Option<BatchStatus> {
        self.registry.get(&self.task_id).await
    }

    /// Wait for the task to reach a terminal state.
    pub async fn wait(self) -> Result<BatchStatus, BatchError> {
        let TaskHandle { task_id, join, .. } = self;
        join.await?.ok_or(BatchError::TaskNotFound { task_id })
    }
}

enum ItemOutcome {
    Extracted(Extraction),
    Skipped,
    Failed(String),
}

struct TaskRun {
    task_id: String,
    kind: ExtractionKind,
    ids: Vec<PhotoId>,
    store: Arc<dyn LibraryStore>,
    registry: Arc<TaskRegistry>,
    extractors: Extractors,
    config: BatchConfig,
    semaphore: Arc<Semaphore>,
    cancel: Arc<AtomicBool>,
}

impl TaskRun {
    async fn drive(self: Arc<Self>) -> Option<BatchStatus> {
        let run = self.clone();
        match tokio::spawn(async move { run.run().await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("Task {} failed: {}", self.task_id, e);
                self.finish(TaskState::Failed, Some(e.to_string())).await;
            }
            Err(e) => {
                log::error!("Task {} aborted: {}", self.task_id, e);
                self.finish(TaskState::Failed, Some(format!("Task aborted: {}", e)))
                    .await;
            }
        }

        self.registry.get(&self.task_id).await
    }

    async fn run(self: Arc<Self>) -> Result<(), BatchError> {
        if !self.extractors.available(self.kind) {
            return Err(BatchError::NotInitialized {
                kind: String::from(self.kind),
            });
        }

        self.update(|s| s.state = TaskState::Processing).await;

        let plan = plan_sub_batches(&self.ids, self.config.batch_size, self.config.batch_threshold);
        let total_sub_batches = plan.len();

        for (offset, chunk) in plan.iter().enumerate() {
            let index = offset + 1;

            if offset > 0 && self.config.sub_batch_pause_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.sub_batch_pause_ms)).await;
            }

            // A cancel issued during the pause stops the next sub-batch
            if self.cancel.load(Ordering::Relaxed) {
                log::info!("Task {} cancelled before sub-batch {}", self.task_id, index);
                self.finish(
                    TaskState::Cancelled,
                    Some(format!(
                        "Cancelled after {} of {} sub-batch(es)",
                        offset, total_sub_batches
                    )),
                )
                .await;
                return Ok(());
            }

            self.update(|s| s.current_sub_batch = index).await;
            log::info!(
                "Task {}: sub-batch {}/{} ({} item(s))",
                self.task_id,
                index,
                total_sub_batches,
                chunk.len()
            );

            let report = self.run_sub_batch(index, chunk).await;
            log::info!(
                "Task {}: sub-batch {} done ({} completed, {} failed, {} skipped)",
                self.task_id,
                index,
                report.completed,
                report.failed,
                report.skipped
            );
            self.update(|s| s.sub_batches.push(report)).await;
        }

        self.finish(TaskState::Completed, None).await;
        Ok(())
    }

    async fn run_sub_batch(self: &Arc<Self>, index: usize, ids: &[PhotoId]) -> SubBatchReport {
        let store = self.store.clone();
        let lookup = ids.to_vec();
        let photos = match tokio::task::spawn_blocking(move || store.photos_by_ids(&lookup)).await {
            Ok(Ok(photos)) => photos,
            Ok(Err(e)) => return self.fail_sub_batch(index, ids, e.to_string()).await,
            Err(e) => return self.fail_sub_batch(index, ids, e.to_string()).await,
        };

        let known: HashSet<PhotoId> = photos.iter().map(|p| p.id).collect();
        let mut skipped_ids: Vec<PhotoId> = ids.iter().copied().filter(|id| !known.contains(id)).collect();
        if !skipped_ids.is_empty() {
            log::warn!("Skipping {} unknown photo id(s)", skipped_ids.len());
        }

        let mut outstanding = known;
        let mut items = JoinSet::new();
        for photo in photos {
            let run = self.clone();
            items.spawn(async move { run.process_item(photo).await });
        }

        let mut extractions = Vec::new();
        let mut failed = 0;
        while let Some(joined) = items.join_next().await {
            match joined {
                Ok((photo_id, outcome)) => {
                    outstanding.remove(&photo_id);
                    match outcome {
                        ItemOutcome::Extracted(extraction) => extractions.push(extraction),
                        ItemOutcome::Skipped => skipped_ids.push(photo_id),
                        ItemOutcome::Failed(message) => {
                            failed += 1;
                            self.record_failures(vec![ItemError { photo_id, message }]).await;
                        }
                    }
                }
                Err(e) => log::error!("Item task in {} ended abnormally: {}", self.task_id, e),
            }
        }

        // Items whose task vanished without reporting
        if !outstanding.is_empty() {
            failed += outstanding.len();
            let errors = outstanding
                .into_iter()
                .map(|photo_id| ItemError {
                    photo_id,
                    message: "Extraction task ended without a result".to_string(),
                })
                .collect();
            self.record_failures(errors).await;
        }

        let mut pending: Vec<PhotoId> = extractions.iter().map(|e| e.photo_id()).collect();
        pending.extend(skipped_ids.iter().copied());
        let skipped = skipped_ids.len();

        let written = if extractions.is_empty() {
            Ok(())
        } else {
            let store = self.store.clone();
            match tokio::task::spawn_blocking(move || store.save_extractions(&extractions)).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        };

        match written {
            Ok(()) => {
                let done = pending.len();
                self.update(|s| {
                    s.completed += done;
                    s.skipped += skipped;
                })
                .await;
                SubBatchReport {
                    index,
                    size: ids.len(),
                    completed: done,
                    failed,
                    skipped,
                    state: TaskState::Completed,
                    error: None,
                }
            }
            Err(message) => {
                log::error!(
                    "Task {}: write for sub-batch {} failed: {}",
                    self.task_id,
                    index,
                    message
                );
                let lost = pending.len();
                let errors = pending
                    .into_iter()
                    .map(|photo_id| ItemError {
                        photo_id,
                        message: format!("Write failed: {}", message),
                    })
                    .collect();
                self.record_failures(errors).await;
                SubBatchReport {
                    index,
                    size: ids.len(),
                    completed: 0,
                    failed: failed + lost,
                    skipped: 0,
                    state: TaskState::Failed,
                    error: Some(message),
                }
            }
        }
    }

    async fn process_item(self: Arc<Self>, photo: PhotoRecord) -> (PhotoId, ItemOutcome) {
        let photo_id = photo.id;
        let path = PathBuf::from(&photo.path);

        match tokio::fs::try_exists(&path).await {
            Ok(true) => {}
            Ok(false) => {
                log::debug!("Skipping photo {}: {} not found", photo_id, path.display());
                return (photo_id, ItemOutcome::Skipped);
            }
            Err(e) => {
                return (
                    photo_id,
                    ItemOutcome::Failed(format!("Cannot access {}: {}", path.display(), e)),
                )
            }
        }

        let permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return (
                    photo_id,
                    ItemOutcome::Failed("Admission gate closed".to_string()),
                )
            }
        };
        self.update(|s| s.running += 1).await;

        let extractors = self.extractors.clone();
        let kind = self.kind;
        let result = tokio::task::spawn_blocking(move || extractors.extract(kind, &photo)).await;

        self.update(|s| s.running = s.running.saturating_sub(1)).await;
        drop(permit);

        let outcome = match result {
            Ok(Ok(extraction)) => ItemOutcome::Extracted(extraction),
            Ok(Err(e)) => {
                log::warn!("Extraction failed for photo {}: {}", photo_id, e);
                ItemOutcome::Failed(e.to_string())
            }
            Err(e) if e.is_panic() => {
                log::error!("Extraction panicked for photo {}", photo_id);
                ItemOutcome::Failed(format!("Extraction panicked: {}", panic_message(e)))
            }
            Err(e) => ItemOutcome::Failed(e.to_string()),
        };
        (photo_id, outcome)
    }

    async fn fail_sub_batch(&self, index: usize, ids: &[PhotoId], message: String) -> SubBatchReport {
        log::error!(
            "Task {}: sub-batch {} failed: {}",
            self.task_id,
            index,
            message
        );
        let errors = ids
            .iter()
            .map(|&photo_id| ItemError {
                photo_id,
                message: message.clone(),
            })
            .collect();
        self.record_failures(errors).await;

        SubBatchReport {
            index,
            size: ids.len(),
            completed: 0,
            failed: ids.len(),
            skipped: 0,
            state: TaskState::Failed,
            error: Some(message),
        }
    }

    async fn record_failures(&self, errors: Vec<ItemError>) {
        if errors.is_empty() {
            return;
        }
        self.update(move |s| {
            s.failed += errors.len();
            s.error_details.extend(errors);
        })
        .await;
    }

    async fn finish(&self, state: TaskState, message: Option<String>) {
        self.update(|s| {
            s.state = state;
            s.running = 0;
            s.message = message;
            s.finished_at = Some(Utc::now());
        })
        .await;
        log::info!("Task {} finished: {}", self.task_id, String::from(state));
    }

    async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut BatchStatus),
    {
        if !self.registry.update(&self.task_id, f).await {
            log::warn!("Task {} is no longer registered", self.task_id);
        }
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
