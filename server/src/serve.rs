use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::annotations::{AnnotationStore, ImageAnnotations, ImageLines};
use crate::error::AppError;
use crate::image_access::ImageGateway;
use crate::transcode::ImageCrateTranscoder;
use crate::volume_index::{IndexColumns, VolumeIndex};

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    #[arg(long, default_value_t = 5005)]
    port: u16,
    /// CSV mapping volumes to image paths
    #[arg(long)]
    image_paths: Option<PathBuf>,
    #[arg(long, default_value = "id")]
    volume_column: String,
    #[arg(long, default_value = "file_path_coris")]
    path_column: String,
    #[arg(long, default_value = "ImageNumber")]
    image_number_column: String,
    #[arg(long, default_value = "resolution")]
    resolution_column: String,
    /// Directory holding the per-volume annotation CSVs
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,
    /// URL prefix when running behind a reverse proxy, e.g. /ga_segmentation_app
    #[arg(long, env = "BASE_PATH", default_value = "")]
    base_path: String,
    #[arg(long, default_value_t = 75)]
    jpeg_quality: u8,
    /// Converted images kept in memory (0 disables)
    #[arg(long, default_value_t = 256)]
    cache_entries: u64,
    #[arg(long, default_value_t = 4)]
    tokio_workers: usize,
}

impl ServeArgs {
    fn columns(&self) -> IndexColumns {
        IndexColumns {
            volume: self.volume_column.clone(),
            path: self.path_column.clone(),
            image_number: self.image_number_column.clone(),
            resolution: self.resolution_column.clone(),
        }
    }
}

/// Shared per-request state. Everything behind it is read-only except the
/// annotation files on disk.
#[derive(Clone)]
pub struct AppState {
    index: Arc<VolumeIndex>,
    store: Arc<AnnotationStore>,
    gateway: Arc<ImageGateway>,
    base_path: Arc<str>,
}

impl AppState {
    pub fn new(
        index: Arc<VolumeIndex>,
        store: AnnotationStore,
        gateway: ImageGateway,
        base_path: &str,
    ) -> Self {
        Self {
            index,
            store: Arc::new(store),
            gateway: Arc::new(gateway),
            base_path: Arc::from(base_path.trim_end_matches('/')),
        }
    }
}

#[derive(Deserialize)]
struct VolumeQuery {
    volume: Option<String>,
}

#[derive(Deserialize)]
struct ImageQuery {
    volume: Option<String>,
    filename: Option<String>,
}

#[derive(Deserialize)]
struct SaveLinesRequest {
    #[serde(default)]
    volume: Option<String>,
    lines: Vec<ImageLines>,
}

#[derive(Serialize)]
struct VolumeSummary<'a> {
    name: &'a str,
    has_annotation: bool,
    file_count: usize,
}

pub fn run(args: ServeArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.tokio_workers.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: ServeArgs) -> Result<()> {
    let index = match &args.image_paths {
        Some(path) => VolumeIndex::load(path, &args.columns()),
        None => {
            info!("no --image-paths given; starting with empty index");
            VolumeIndex::empty()
        }
    };
    let index = Arc::new(index);
    let transcoder = Arc::new(ImageCrateTranscoder::new(args.jpeg_quality));
    let gateway = ImageGateway::new(index.clone(), transcoder).with_cache(args.cache_entries);
    let store = AnnotationStore::new(&args.output_dir);
    let state = AppState::new(index.clone(), store, gateway, &args.base_path);

    let app = build_router(state);
    let addr = format!("{}:{}", args.host, args.port);
    info!(
        "listening on http://{} (volumes={}, output_dir={}, base_path={:?}, jpeg_quality={}, cache_entries={})",
        addr,
        index.len(),
        args.output_dir.display(),
        args.base_path,
        args.jpeg_quality,
        args.cache_entries
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/volumes", get(list_volumes))
        .route("/images_in_volume", get(images_in_volume))
        .route("/image", get(serve_image))
        .route("/image_resolution", get(image_resolution))
        .route("/save_lines", post(save_lines))
        .route("/annotations", get(get_annotations))
        .route("/next_volume", get(next_volume))
        .route("/previous_volume", get(previous_volume))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn root(State(state): State<AppState>) -> Redirect {
    Redirect::to(&format!("{}/volumes", state.base_path))
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn list_volumes(State(state): State<AppState>) -> Json<serde_json::Value> {
    let volumes: Vec<VolumeSummary> = state
        .index
        .volume_ids()
        .map(|name| VolumeSummary {
            name,
            has_annotation: state.store.exists(name),
            file_count: state.index.image_paths(name).len(),
        })
        .collect();
    Json(json!(volumes))
}

async fn images_in_volume(
    State(state): State<AppState>,
    Query(query): Query<VolumeQuery>,
) -> Json<Vec<String>> {
    let images = match query.volume.as_deref().filter(|v| !v.is_empty()) {
        Some(volume) => state
            .index
            .image_paths(volume)
            .into_iter()
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    };
    Json(images)
}

async fn serve_image(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
) -> Result<Response, AppError> {
    let gateway = state.gateway.clone();
    let payload =
        task::spawn_blocking(move || gateway.fetch(query.volume.as_deref(), query.filename.as_deref()))
            .await
            .map_err(|e| AppError::Internal(e.to_string()))??;
    Ok(([(header::CONTENT_TYPE, payload.content_type)], payload.bytes).into_response())
}

async fn image_resolution(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
) -> Json<serde_json::Value> {
    let volume = query.volume.as_deref().unwrap_or("");
    let filename = query.filename.as_deref().unwrap_or("");
    let resolution = state.index.resolution(volume, filename);
    debug!(
        "resolution volume={} filename={} resolution={}",
        volume, filename, resolution
    );
    Json(json!({ "resolution": resolution }))
}

async fn save_lines(
    State(state): State<AppState>,
    payload: Result<Json<SaveLinesRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(request) = payload.map_err(|e| AppError::InvalidPayload(e.body_text()))?;
    let store = state.store.clone();
    task::spawn_blocking(move || store.save(request.volume.as_deref(), &request.lines))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map_err(AppError::AnnotationStore)?;
    Ok(Json(json!({ "status": "success", "message": "Lines saved" })))
}

async fn get_annotations(
    State(state): State<AppState>,
    Query(query): Query<VolumeQuery>,
) -> Result<Json<Vec<ImageAnnotations>>, AppError> {
    let Some(volume) = query.volume.filter(|v| !v.is_empty()) else {
        return Ok(Json(Vec::new()));
    };
    let store = state.store.clone();
    let annotations = task::spawn_blocking(move || store.load(&volume))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map_err(AppError::AnnotationStore)?;
    Ok(Json(annotations))
}

async fn next_volume(
    State(state): State<AppState>,
    Query(query): Query<VolumeQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let current = required_volume(&query)?;
    let next = state.index.next_volume(current)?;
    Ok(Json(json!({ "next_volume": next, "is_last": next.is_none() })))
}

async fn previous_volume(
    State(state): State<AppState>,
    Query(query): Query<VolumeQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let current = required_volume(&query)?;
    let previous = state.index.previous_volume(current)?;
    Ok(Json(
        json!({ "previous_volume": previous, "is_first": previous.is_none() }),
    ))
}

fn required_volume(query: &VolumeQuery) -> Result<&str, AppError> {
    query
        .volume
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or(AppError::MissingParameter("current volume"))
}
