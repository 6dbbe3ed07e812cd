//! HTTP surface for `/videos`.
//!
//! Handlers validate input, move blocking work (SQLite, media host) onto the
//! blocking pool, and wrap the outcome in an [`Envelope`]. Every failure path
//! ends up as an [`ApiError`], which renders as an envelope too.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        DefaultBodyLimit, Multipart, Path, Query, State,
        multipart::MultipartRejection,
        rejection::{PathRejection, QueryRejection},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, patch},
};
use tokio::task;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::envelope::{ApiError, ApiResult, Envelope};
use crate::media::{MediaKind, MediaUploader, UploadedMedia};
use crate::models::{NewVideo, Video, VideoChanges};
use crate::multipart::UploadForm;
use crate::query::ListQuery;
use crate::store::VideoStore;

/// Header carrying the authenticated user id, set by the upstream auth layer.
pub const OWNER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    store: VideoStore,
    uploader: Arc<dyn MediaUploader>,
    spool_dir: Arc<PathBuf>,
}

impl AppState {
    pub fn new(store: VideoStore, uploader: Arc<dyn MediaUploader>, spool_dir: PathBuf) -> Self {
        Self {
            store,
            uploader,
            spool_dir: Arc::new(spool_dir),
        }
    }

    /// Runs a store call on the blocking pool. `message` is what clients see
    /// if it fails.
    async fn with_store<F, T>(&self, message: &'static str, f: F) -> ApiResult<T>
    where
        F: FnOnce(&VideoStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        task::spawn_blocking(move || f(&store))
            .await
            .map_err(|err| ApiError::infrastructure(message, format!("task join error: {err}")))?
            .map_err(|err| ApiError::infrastructure(message, format!("{err:#}")))
    }

    async fn upload(&self, path: PathBuf, kind: MediaKind) -> ApiResult<UploadedMedia> {
        let uploader = self.uploader.clone();
        let media = task::spawn_blocking(move || uploader.upload(&path, kind))
            .await
            .map_err(|err| {
                ApiError::infrastructure("Error while uploading media", format!("task join error: {err}"))
            })??;
        tracing::info!(public_id = %media.public_id, %kind, "media uploaded");
        Ok(media)
    }

    /// Best-effort removal of assets whose video record never made it into
    /// (or out of) the store. Failures are logged and swallowed.
    async fn discard(&self, assets: Vec<UploadedMedia>) {
        let uploader = self.uploader.clone();
        let outcome = task::spawn_blocking(move || {
            for media in &assets {
                match uploader.destroy(media) {
                    Ok(()) => tracing::info!(public_id = %media.public_id, "discarded orphaned media"),
                    Err(err) => tracing::warn!(
                        public_id = %media.public_id,
                        error = %err,
                        "failed to discard orphaned media"
                    ),
                }
            }
        })
        .await;
        if let Err(err) = outcome {
            tracing::warn!(error = %err, "media cleanup task failed");
        }
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/videos", get(list_videos).post(publish_video))
        .route(
            "/videos/{video_id}",
            get(get_video).patch(update_video).delete(delete_video),
        )
        .route("/videos/{video_id}/toggle-publish", patch(toggle_publish))
        .fallback(route_not_found)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn list_videos(
    State(state): State<AppState>,
    params: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Envelope<Vec<Video>>> {
    let Query(params) = params?;
    let query = params.build()?;
    tracing::debug!(?query, "listing videos");

    let videos = state
        .with_store("Error fetching videos", move |store| store.find_videos(&query))
        .await?;
    Ok(Envelope::ok(videos, "Videos fetched successfully"))
}

async fn publish_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Envelope<Video>> {
    let owner = owner_from_headers(&headers)?;
    let form = UploadForm::collect(multipart?, &state.spool_dir).await?;

    let (Some(title), Some(description)) = (form.text("title"), form.text("description")) else {
        return Err(ApiError::validation("title and description are required"));
    };
    let video_file = form
        .file("video", MediaKind::Video)?
        .ok_or_else(|| ApiError::validation("video file is required"))?;
    let thumbnail_file = form
        .file("thumbnail", MediaKind::Image)?
        .ok_or_else(|| ApiError::validation("thumbnail is required"))?;

    let video_asset = state
        .upload(video_file.path().to_path_buf(), MediaKind::Video)
        .await?;
    let thumbnail_asset = match state
        .upload(thumbnail_file.path().to_path_buf(), MediaKind::Image)
        .await
    {
        Ok(asset) => asset,
        Err(err) => {
            state.discard(vec![video_asset]).await;
            return Err(err);
        }
    };

    let new = NewVideo {
        video_file: video_asset.url.clone(),
        thumbnail: thumbnail_asset.url.clone(),
        title,
        description,
        duration: video_asset.duration,
        owner,
    };
    match state
        .with_store("Error while uploading video", move |store| {
            store.create_video(&new)
        })
        .await
    {
        Ok(video) => {
            tracing::info!(video_id = %video.id, "video published");
            Ok(Envelope::ok(video, "Video uploaded successfully"))
        }
        Err(err) => {
            state.discard(vec![video_asset, thumbnail_asset]).await;
            Err(err)
        }
    }
}

async fn get_video(
    State(state): State<AppState>,
    video_id: Result<Path<String>, PathRejection>,
) -> ApiResult<Envelope<Video>> {
    let Path(video_id) = video_id?;
    let id = parse_video_id(&video_id)?;
    let video = state
        .with_store("Error fetching video", move |store| {
            store.find_video_by_id(id, true)
        })
        .await?
        .ok_or_else(video_not_found)?;
    Ok(Envelope::ok(video, "Video fetched successfully"))
}

async fn update_video(
    State(state): State<AppState>,
    video_id: Result<Path<String>, PathRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Envelope<Video>> {
    let Path(video_id) = video_id?;
    let id = parse_video_id(&video_id)?;
    let form = UploadForm::collect(multipart?, &state.spool_dir).await?;
    let thumbnail_file = form
        .file("thumbnail", MediaKind::Image)?
        .ok_or_else(|| ApiError::validation("thumbnail is required"))?;

    // Checked up front so an unknown id never leaves an uploaded thumbnail behind.
    state
        .with_store("Error while updating video", move |store| {
            store.find_video_by_id(id, false)
        })
        .await?
        .ok_or_else(video_not_found)?;

    let thumbnail_asset = state
        .upload(thumbnail_file.path().to_path_buf(), MediaKind::Image)
        .await?;
    let changes = VideoChanges {
        title: form.text("title"),
        description: form.text("description"),
        thumbnail: Some(thumbnail_asset.url.clone()),
    };

    let updated = state
        .with_store("Error while updating video", move |store| {
            store.update_video(id, &changes)
        })
        .await;
    match updated {
        Ok(Some(video)) => Ok(Envelope::ok(video, "Video updated successfully")),
        Ok(None) => {
            state.discard(vec![thumbnail_asset]).await;
            Err(video_not_found())
        }
        Err(err) => {
            state.discard(vec![thumbnail_asset]).await;
            Err(err)
        }
    }
}

async fn delete_video(
    State(state): State<AppState>,
    video_id: Result<Path<String>, PathRejection>,
) -> ApiResult<Envelope<Video>> {
    let Path(video_id) = video_id?;
    let id = parse_video_id(&video_id)?;
    let video = state
        .with_store("Error while deleting video", move |store| {
            store.delete_video(id)
        })
        .await?
        .ok_or_else(video_not_found)?;
    tracing::info!(video_id = %video.id, "video deleted");
    Ok(Envelope::ok(video, "Video deleted successfully"))
}

async fn toggle_publish(
    State(state): State<AppState>,
    video_id: Result<Path<String>, PathRejection>,
) -> ApiResult<Envelope<Video>> {
    let Path(video_id) = video_id?;
    let id = parse_video_id(&video_id)?;
    let video = state
        .with_store("Error while publishing/toggling a video", move |store| {
            store.toggle_publish(id)
        })
        .await?
        .ok_or_else(video_not_found)?;
    let message = if video.is_published {
        "Video published successfully"
    } else {
        "Video unpublished successfully"
    };
    Ok(Envelope::ok(video, message))
}

async fn route_not_found() -> ApiError {
    ApiError::not_found("Route not found")
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    ApiError::infrastructure("Internal server error", detail).into_response()
}

fn parse_video_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::validation(format!("invalid videoId: {raw}")))
}

fn owner_from_headers(headers: &HeaderMap) -> ApiResult<Option<Uuid>> {
    let Some(value) = headers.get(OWNER_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
        .map(Some)
        .ok_or_else(|| ApiError::validation(format!("invalid {OWNER_HEADER} header")))
}

fn video_not_found() -> ApiError {
    ApiError::not_found("Video not found")
}
