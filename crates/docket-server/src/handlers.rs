use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use docket_core::duplicates::compute_stats;
use docket_shared::{
    AuthResponse, BulkCreateRequest, LoginRequest, MAX_BULK_TASKS, MessageResponse,
    RegisterRequest, SearchQuery, StatsDto, TaskCreate, TaskDto, TaskPatch, UploadResponse,
};
use tracing::{info, warn};

use crate::auth::{AuthUser, hash_password, verify_password};
use crate::config::MAX_UPLOAD_BYTES;
use crate::convert::DocumentKind;
use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::RepoError;
use crate::validation::{validate_patch, validate_registration, validate_task};

const INVALID_CREDENTIALS: &str = "Invalid username or password";

impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::UserExists => ApiError::bad_request("Username or email already exists"),
            RepoError::TaskNotFound(_) => ApiError::not_found("Task not found"),
            RepoError::DuplicateIds => ApiError::bad_request("Duplicate task ids"),
            RepoError::Io(err) => ApiError::from(err),
        }
    }
}

#[tracing::instrument(skip_all, fields(username = %req.username))]
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), ApiError> {
    let new_user = validate_registration(&req)?.map_err(ApiError::bad_request)?;
    let password_hash = hash_password(&req.password)?;
    let user = state
        .repo
        .insert_user(&new_user.username, &new_user.email, password_hash, Utc::now())?;

    let token = state.tokens.issue(&user.id);
    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            message: "Registered successfully".to_string(),
            token,
            user: user.to_dto(),
        }),
    ))
}

#[tracing::instrument(skip_all, fields(username = %req.username))]
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let login = req.username.trim();
    if login.is_empty() || req.password.is_empty() {
        return Err(ApiError::bad_request("Username and password are required"));
    }

    if let Some(remaining) = state.login_guard.locked_for(login) {
        warn!(login, "login attempt on locked account");
        return Err(ApiError::locked(remaining));
    }

    let verified = match state.repo.find_login(login) {
        Some(user) if user.is_active => {
            verify_password(&user.password_hash, &req.password)?.then_some(user)
        }
        _ => None,
    };
    let Some(user) = verified else {
        if let Some(lockout) = state.login_guard.record_failure(login) {
            return Err(ApiError::locked(lockout));
        }
        return Err(ApiError::unauthorized(INVALID_CREDENTIALS));
    };

    state.login_guard.record_success(login);
    state.repo.record_login(&user.id, Utc::now())?;
    let token = state.tokens.issue(&user.id);
    info!(user_id = %user.id, "login succeeded");

    Ok(Json(AuthResponse {
        message: "Logged in successfully".to_string(),
        token,
        user: user.to_dto(),
    }))
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Json<Vec<TaskDto>> {
    Json(state.repo.list_tasks(&user.id))
}

pub async fn search_tasks(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<SearchQuery>,
) -> Json<Vec<TaskDto>> {
    Json(state.repo.search_tasks(&user.id, &query.q))
}

#[tracing::instrument(skip_all, fields(user_id = %user.id))]
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(mut create): Json<TaskCreate>,
) -> Result<(StatusCode, Json<TaskDto>), ApiError> {
    validate_task(&create).map_err(ApiError::bad_request)?;
    create.id = None;
    let task = state.repo.insert_task(&user.id, create, Utc::now())?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[tracing::instrument(skip_all, fields(user_id = %user.id, count = req.tasks.len()))]
pub async fn create_tasks_bulk(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<BulkCreateRequest>,
) -> Result<(StatusCode, Json<Vec<TaskDto>>), ApiError> {
    if req.tasks.is_empty() {
        return Err(ApiError::bad_request("A list of tasks is required"));
    }
    if req.tasks.len() > MAX_BULK_TASKS {
        return Err(ApiError::bad_request(format!(
            "Cannot create more than {MAX_BULK_TASKS} tasks at once"
        )));
    }
    for (index, create) in req.tasks.iter().enumerate() {
        validate_task(create)
            .map_err(|message| ApiError::bad_request(format!("task {}: {message}", index + 1)))?;
    }

    let created = state.repo.insert_tasks(&user.id, req.tasks, Utc::now())?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[tracing::instrument(skip_all, fields(user_id = %user.id, id = %id))]
pub async fn update_task(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> Result<Json<TaskDto>, ApiError> {
    validate_patch(&patch).map_err(ApiError::bad_request)?;
    let task = state.repo.update_task(&user.id, &id, &patch, Utc::now())?;
    Ok(Json(task))
}

#[tracing::instrument(skip_all, fields(user_id = %user.id, id = %id))]
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.repo.delete_task(&user.id, &id)?;
    Ok(Json(MessageResponse {
        message: "Task deleted".to_string(),
    }))
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Json<StatsDto> {
    Json(compute_stats(&state.repo.list_tasks(&user.id)))
}

/// Type and size are checked before the converter ever sees the bytes.
#[tracing::instrument(skip_all, fields(user_id = %user.id))]
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("Invalid upload: {}", err.body_text())))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or("upload").to_string();
        let kind = field
            .content_type()
            .and_then(DocumentKind::from_mime)
            .ok_or_else(|| ApiError::bad_request("Only .docx and .pdf files are allowed"))?;

        let bytes = field
            .bytes()
            .await
            .map_err(|_| ApiError::bad_request("File too large (maximum 10MB)"))?;
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(ApiError::bad_request("File too large (maximum 10MB)"));
        }

        info!(%filename, ?kind, size = bytes.len(), "converting upload");
        let html = state
            .converter
            .convert(kind, bytes.to_vec())
            .await
            .map_err(|err| ApiError::internal(format!("{err:#}")))?;

        return Ok(Json(UploadResponse { html, filename }));
    }

    Err(ApiError::bad_request("No file was sent"))
}
