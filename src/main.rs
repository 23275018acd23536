use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use likeness::config::Config;
use likeness::core::exif::ExifService;
use likeness::database::models::{ExtractionKind, NewPhoto, PhotoId};
use likeness::database::{Database, LibraryStore};
use likeness::services::batch::{BatchOrchestrator, BatchStatus, Extractors};
use likeness::services::{ClusteringService, SearchService, TaskRegistry};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "tif", "tiff", "webp", "bmp", "gif"];

#[derive(Parser, Debug)]
#[command(name = "likeness", version, about = "Find similar photos and group faces")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file, overrides the configured one
    #[arg(long, global = true, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register image files found under a directory
    Register {
        /// Directory to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },

    /// Extract fingerprints, descriptors or faces in batches
    Extract {
        /// fingerprint, descriptor or faces
        #[arg(short, long)]
        kind: ExtractionKind,

        /// Re-extract every registered photo instead of only stale ones
        #[arg(long, conflicts_with = "ids")]
        all: bool,

        /// Photo ids to process
        ids: Vec<PhotoId>,
    },

    /// List photos similar to a reference photo
    Similar {
        id: PhotoId,

        #[arg(long, default_value_t = 0.8)]
        threshold: f32,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Group visually similar photos across the library
    Groups {
        #[arg(long, default_value_t = 0.9)]
        threshold: f32,
    },

    /// Re-cluster all stored face embeddings
    Cluster,

    /// List stored face clusters
    Clusters,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(db) = &cli.db {
        config.database.path = Some(db.clone());
    }
    config.validate().context("Invalid configuration")?;

    let db_path = config.database_path()?;
    let db = Arc::new(
        Database::open(&db_path)
            .with_context(|| format!("Failed to open database {}", db_path.display()))?,
    );

    match cli.command {
        Commands::Register { path } => register(&db, &path, cli.json)?,

        Commands::Extract { kind, all, ids } => {
            let status = extract(&config, db, kind, all, ids).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }

        Commands::Similar {
            id,
            threshold,
            limit,
        } => {
            let search = SearchService::new(db.clone(), &config.similarity);
            let results = search.find_similar(id, threshold, limit)?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No photos similar to {} at threshold {:.2}.", id, threshold);
            } else {
                println!("Photos similar to {}:", id);
                for result in &results {
                    let path = db
                        .photo(result.photo_id)?
                        .map(|p| p.path)
                        .unwrap_or_default();
                    println!("  {:>6}  {:.3}  {}", result.photo_id, result.score, path);
                }
            }
        }

        Commands::Groups { threshold } => {
            let search = SearchService::new(db.clone(), &config.similarity);
            let groups = search.similar_groups(threshold)?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&groups)?);
            } else if groups.is_empty() {
                println!("No similar groups found.");
            } else {
                println!("Found {} group(s):", groups.len());
                for (i, group) in groups.iter().enumerate() {
                    println!(
                        " Group {} ({:?}, min score {:.3}):",
                        i + 1,
                        group.kind,
                        group.min_score
                    );
                    for photo_id in &group.photo_ids {
                        let path = db.photo(*photo_id)?.map(|p| p.path).unwrap_or_default();
                        println!("   ▶ {}", path);
                    }
                }
            }
        }

        Commands::Cluster => {
            let store: Arc<dyn LibraryStore> = db.clone();
            let mut clustering = ClusteringService::new(store, config.clustering.clone());
            let extractors = Extractors::from_config(&config.extraction);
            if extractors.available(ExtractionKind::Faces) {
                clustering = clustering
                    .with_embedding_version(extractors.version_for(ExtractionKind::Faces));
            } else {
                log::warn!("Face models not loaded, clustering embeddings of every version");
            }
            let summary = tokio::task::spawn_blocking(move || clustering.recluster())
                .await
                .context("Clustering task failed")??;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "Clustered {} face(s) into {} cluster(s); {} unclustered, {} beyond the cluster cap.",
                    summary.faces_considered,
                    summary.clusters.len(),
                    summary.noise,
                    summary.dropped
                );
            }
        }

        Commands::Clusters => {
            let clusters = db.clusters()?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&clusters)?);
            } else if clusters.is_empty() {
                println!("No face clusters stored. Run `likeness cluster` first.");
            } else {
                for cluster in &clusters {
                    println!(
                        "{}  {} member(s)  {}  quality {:.3}  representative face {}",
                        cluster.id,
                        cluster.member_count,
                        String::from(cluster.quality_tier),
                        cluster.quality_score,
                        cluster.representative_face_id
                    );
                }
            }
        }
    }

    Ok(())
}

/// Walk `dir` and register every image with its capture time and location.
fn register(db: &Database, dir: &Path, json: bool) -> Result<()> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(100));

    let exif = ExifService::new();
    let mut registered = Vec::new();

    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_file() || !is_image(path) {
            continue;
        }

        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let metadata = match exif.extract_exif(&path) {
            Ok(metadata) => metadata.unwrap_or_default(),
            Err(e) => {
                log::warn!("Ignoring EXIF of {}: {}", path.display(), e);
                Default::default()
            }
        };

        let id = db.insert_photo(&NewPhoto {
            path: path.to_string_lossy().into_owned(),
            taken_at: metadata.taken_at,
            latitude: metadata.latitude,
            longitude: metadata.longitude,
        })?;
        spinner.set_message(format!("Registered {}", path.display()));
        registered.push(id);
    }

    spinner.finish_with_message(format!("Registered {} photo(s)", registered.len()));
    if json {
        println!("{}", serde_json::to_string(&registered)?);
    }
    Ok(())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

async fn extract(
    config: &Config,
    db: Arc<Database>,
    kind: ExtractionKind,
    all: bool,
    ids: Vec<PhotoId>,
) -> Result<BatchStatus> {
    let extractors = Extractors::from_config(&config.extraction);
    let ids = if !ids.is_empty() {
        ids
    } else if all {
        db.photo_ids()?
    } else {
        db.stale_photo_ids(kind, &extractors.version_for(kind))?
    };

    let store: Arc<dyn LibraryStore> = db;
    let orchestrator = BatchOrchestrator::new(
        store,
        Arc::new(TaskRegistry::new()),
        extractors,
        config.batch.clone(),
    );
    let handle = orchestrator.submit(kind, ids).await;

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, stopping after the current sub-batch");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    while let Some(status) = handle.status().await {
        bar.set_length(status.total as u64);
        bar.set_position((status.completed + status.failed) as u64);
        bar.set_message(format!(
            "sub-batch {}/{}, {} failed",
            status.current_sub_batch, status.total_sub_batches, status.failed
        ));
        if status.state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    bar.finish_and_clear();

    Ok(handle.wait().await?)
}

fn print_status(status: &BatchStatus) {
    println!(
        "Task {} {}: {}/{} completed ({:.2}%), {} failed, {} skipped",
        status.task_id,
        String::from(status.state),
        status.completed,
        status.total,
        status.progress_percent(),
        status.failed,
        status.skipped
    );
    if let Some(message) = &status.message {
        println!("  {}", message);
    }
    for error in &status.error_details {
        println!("  ⚠️  photo {}: {}", error.photo_id, error.message);
    }
}
