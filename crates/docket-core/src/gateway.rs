//! The single entry point the CLI talks to.
//!
//! Task reads and writes go to the server while it is reachable and fall
//! back to the local store otherwise; account and search features need the
//! server. A transport failure flips the gateway offline and the same call
//! is retried locally, so callers never see [`ApiError::Offline`] for an
//! offline-capable operation.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use docket_shared::{
    LoginRequest, MAX_BULK_TASKS, RegisterRequest, StatsDto, TaskCreate, TaskDto, TaskPatch,
    UploadResponse, UserDto,
};
use tracing::{debug, info, warn};

use crate::api::{ApiError, TaskService};
use crate::datastore::{LocalStore, StoreError};
use crate::duplicates::compute_stats;
use crate::session::{AppState, AuthSession, SessionStore};
use crate::sync::{SyncError, SyncReport, run_cycle};
use crate::task::Task;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GatewayError {
    /// Text safe to show the user; storage internals stay in the log.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Api(err) => err.to_string(),
            GatewayError::Store(StoreError::NotFound(_)) => "task not found".to_string(),
            GatewayError::Store(StoreError::DuplicateId(id)) => {
                format!("a task with id {id} already exists")
            }
            GatewayError::Store(StoreError::Storage(_)) => {
                "local storage failed; your change was not saved".to_string()
            }
        }
    }

    pub fn is_auth_required(&self) -> bool {
        matches!(self, GatewayError::Api(ApiError::AuthRequired))
    }
}

pub struct Gateway<S: TaskService> {
    service: S,
    store: LocalStore,
    session: SessionStore,
}

impl<S: TaskService> Gateway<S> {
    /// Opens the local stores and restores the saved session.
    ///
    /// Nothing is usable before this returns.
    #[tracing::instrument(skip(service, data_dir))]
    pub async fn initialize(mut service: S, data_dir: &Path) -> anyhow::Result<Self> {
        let dir: PathBuf = data_dir.to_path_buf();
        let (mut store, session) = tokio::task::spawn_blocking(move || {
            let store = LocalStore::open(&dir)?;
            let session = SessionStore::open(&dir)?;
            anyhow::Ok((store, session))
        })
        .await
        .context("local store initialization was interrupted")??;

        if let Some(auth) = session.auth() {
            debug!(user = %auth.user.username, "restoring saved session");
            service.set_token(Some(auth.token));
            store.set_current_user(Some(auth.user.id));
        }
        if session.settings().offline_mode {
            store.set_online(false);
        }

        info!(
            online = store.is_online(),
            queued = store.pending_count(),
            "gateway ready"
        );
        Ok(Self {
            service,
            store,
            session,
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn is_online(&self) -> bool {
        self.store.is_online()
    }

    pub fn current_user(&self) -> Option<UserDto> {
        self.session.auth().map(|auth| auth.user)
    }

    #[tracing::instrument(skip(self, request), fields(username = %request.username))]
    pub async fn register(&mut self, request: &RegisterRequest) -> Result<UserDto, GatewayError> {
        self.require_online()?;
        let response = self.service.register(request).await;
        let auth = self.remote(response)?;
        self.start_session(auth.token, auth.user)
    }

    #[tracing::instrument(skip(self, request), fields(username = %request.username))]
    pub async fn login(&mut self, request: &LoginRequest) -> Result<UserDto, GatewayError> {
        self.require_online()?;
        let response = self.service.login(request).await;
        let auth = self.remote(response)?;
        self.start_session(auth.token, auth.user)
    }

    /// Ends the session. With `purge`, the task cache, the queue and every
    /// saved setting go too.
    #[tracing::instrument(skip(self))]
    pub fn logout(&mut self, purge: bool) -> Result<(), GatewayError> {
        self.end_session();
        if purge {
            self.store.clear_all_data()?;
            self.session
                .clear_all()
                .map_err(|err| GatewayError::Store(err.into()))?;
            info!("local data purged");
        }
        Ok(())
    }

    /// Online with queued work, this syncs first; online without, it
    /// refreshes the cache from the server. Offline it reads the cache.
    #[tracing::instrument(skip(self))]
    pub async fn get_tasks(&mut self) -> Result<Vec<Task>, GatewayError> {
        if self.is_online() {
            if self.store.pending_count() > 0 {
                self.sync_now().await?;
            } else {
                match self.service.list_tasks().await {
                    Ok(snapshot) => {
                        self.store.update_local_tasks(snapshot)?;
                    }
                    Err(ApiError::Offline) => self.fall_offline(),
                    Err(err) => return Err(self.handle_remote_error(err)),
                }
            }
        }
        Ok(self.store.get_all_tasks())
    }

    #[tracing::instrument(skip(self, task))]
    pub async fn create_task(&mut self, task: Task) -> Result<Task, GatewayError> {
        if self.is_online() {
            self.drain_queue().await?;
            match self.service.create_task(&task.to_create()).await {
                Ok(dto) => return Ok(self.store.cache_remote(dto)?),
                Err(ApiError::Offline) => self.fall_offline(),
                Err(err) => return Err(self.handle_remote_error(err)),
            }
        }
        Ok(self.store.add_task(task)?)
    }

    /// Bulk import. Offline, each record is queued on its own.
    #[tracing::instrument(skip(self, tasks), fields(count = tasks.len()))]
    pub async fn create_tasks(&mut self, tasks: Vec<TaskCreate>) -> Result<Vec<Task>, GatewayError> {
        if tasks.is_empty() || tasks.len() > MAX_BULK_TASKS {
            return Err(ApiError::Validation(format!(
                "a bulk import needs between 1 and {MAX_BULK_TASKS} tasks"
            ))
            .into());
        }

        if self.is_online() {
            self.drain_queue().await?;
            match self.service.create_tasks(&tasks).await {
                Ok(created) => {
                    return created
                        .into_iter()
                        .map(|dto| self.store.cache_remote(dto).map_err(GatewayError::from))
                        .collect();
                }
                Err(ApiError::Offline) => self.fall_offline(),
                Err(err) => return Err(self.handle_remote_error(err)),
            }
        }

        let now = Utc::now();
        tasks
            .into_iter()
            .map(|create| {
                let mut task = Task::from_create(create, now);
                // Client ids only matter to the bulk endpoint.
                task.id.clear();
                self.store.add_task(task).map_err(GatewayError::from)
            })
            .collect()
    }

    #[tracing::instrument(skip(self, patch))]
    pub async fn update_task(&mut self, id: &str, patch: TaskPatch) -> Result<Task, GatewayError> {
        if self.is_online() {
            self.drain_queue().await?;
            let id = self.store.resolve_id(id);
            match self.service.update_task(&id, &patch).await {
                Ok(dto) => return Ok(self.store.cache_remote(dto)?),
                Err(ApiError::Offline) => self.fall_offline(),
                Err(err) => return Err(self.handle_remote_error(err)),
            }
        }
        Ok(self.store.update_task(id, patch)?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_task(&mut self, id: &str) -> Result<(), GatewayError> {
        if self.is_online() {
            self.drain_queue().await?;
            let id = self.store.resolve_id(id);
            match self.service.delete_task(&id).await {
                Ok(()) | Err(ApiError::NotFound) => return Ok(self.store.forget(&id)?),
                Err(ApiError::Offline) => self.fall_offline(),
                Err(err) => return Err(self.handle_remote_error(err)),
            }
        }
        Ok(self.store.delete_task(id)?)
    }

    pub async fn search_tasks(&mut self, query: &str) -> Result<Vec<TaskDto>, GatewayError> {
        self.require_online()?;
        let response = self.service.search_tasks(query).await;
        self.remote(response)
    }

    pub async fn stats(&mut self) -> Result<StatsDto, GatewayError> {
        self.require_online()?;
        let response = self.service.stats().await;
        self.remote(response)
    }

    /// Counts computed from the local cache; always available.
    pub fn local_stats(&self) -> StatsDto {
        compute_stats(&self.store.get_all_tasks())
    }

    #[tracing::instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn upload_document(
        &mut self,
        filename: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse, GatewayError> {
        self.require_online()?;
        let response = self
            .service
            .upload_document(filename, content_type, bytes)
            .await;
        self.remote(response)
    }

    pub fn go_offline(&mut self) {
        self.store.set_online(false);
        self.remember_mode(true);
    }

    /// Switches back online and, when work is queued, syncs.
    pub async fn go_online(&mut self) -> Result<Option<SyncReport>, GatewayError> {
        self.store.set_online(true);
        self.remember_mode(false);
        if self.store.pending_count() == 0 {
            return Ok(None);
        }
        self.sync_now().await.map(Some)
    }

    /// Replays the queue and refreshes the cache. A rejected session ends it.
    pub async fn sync_now(&mut self) -> Result<SyncReport, GatewayError> {
        let report = match run_cycle(&mut self.store, &self.service).await {
            Ok(report) => report,
            Err(SyncError::Store(err)) => return Err(err.into()),
            Err(SyncError::Api(err)) => return Err(self.handle_remote_error(err)),
        };
        let mut state = self.session.app_state();
        if report.refreshed {
            state.last_sync = Some(Utc::now());
        }
        state.offline_changes = self.store.pending_count();
        self.save_app_state(&state);
        Ok(report)
    }

    pub fn clear_conflicts(&mut self) -> Result<usize, GatewayError> {
        Ok(self.store.clear_conflicts()?)
    }

    async fn drain_queue(&mut self) -> Result<(), GatewayError> {
        if self.store.pending_count() > 0 {
            debug!(queued = self.store.pending_count(), "draining queue before remote write");
            self.sync_now().await?;
        }
        Ok(())
    }

    fn require_online(&self) -> Result<(), GatewayError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(ApiError::Offline.into())
        }
    }

    /// Result of an online-only call; a transport failure also flips the
    /// gateway offline.
    fn remote<T>(&mut self, response: Result<T, ApiError>) -> Result<T, GatewayError> {
        response.map_err(|err| {
            if err == ApiError::Offline {
                self.fall_offline();
            }
            self.handle_remote_error(err)
        })
    }

    fn handle_remote_error(&mut self, err: ApiError) -> GatewayError {
        if err == ApiError::AuthRequired {
            warn!("server rejected credentials; clearing session");
            self.end_session();
        }
        err.into()
    }

    fn fall_offline(&mut self) {
        warn!("server unreachable; continuing offline");
        self.store.set_online(false);
    }

    fn start_session(&mut self, token: String, user: UserDto) -> Result<UserDto, GatewayError> {
        let auth = AuthSession {
            token: token.clone(),
            user: user.clone(),
        };
        self.session
            .save_auth(&auth)
            .map_err(|err| GatewayError::Store(err.into()))?;
        self.service.set_token(Some(token));
        self.store.set_current_user(Some(user.id.clone()));
        info!(user = %user.username, "session started");
        Ok(user)
    }

    fn end_session(&mut self) {
        if let Err(err) = self.session.clear_auth() {
            warn!(error = %err, "failed clearing saved session");
        }
        self.service.set_token(None);
        self.store.set_current_user(None);
    }

    fn remember_mode(&self, offline: bool) {
        let mut settings = self.session.settings();
        settings.offline_mode = offline;
        if let Err(err) = self.session.save_settings(&settings) {
            warn!(error = %err, "failed saving connectivity preference");
        }
    }

    fn save_app_state(&self, state: &AppState) {
        if let Err(err) = self.session.save_app_state(state) {
            warn!(error = %err, "failed saving sync bookkeeping");
        }
    }
}
