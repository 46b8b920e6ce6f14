//! An in-process [`TaskService`] holding one user's tasks in memory.
//!
//! It behaves like the REST server for task CRUD (server-assigned ids,
//! 404 for unknown ids, bulk limits) and can be switched to look unreachable
//! or to reject the session. Built for tests only, behind `test-util`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use docket_shared::{
    AuthResponse, LoginRequest, MAX_BULK_TASKS, RegisterRequest, StatsDto, TaskCreate, TaskDto,
    TaskPatch, UploadResponse, UserDto,
};

use crate::api::{ApiError, TaskService};
use crate::duplicates::compute_stats;

#[derive(Debug, Default)]
struct MemoryState {
    tasks: Vec<TaskDto>,
    next_id: u64,
    offline: bool,
    /// Authenticated calls left before the session counts as expired.
    session_calls_left: Option<usize>,
    rejections: HashMap<String, ApiError>,
}

#[derive(Debug)]
pub struct MemoryTaskService {
    user: UserDto,
    state: Mutex<MemoryState>,
}

impl MemoryTaskService {
    pub fn new(user_id: &str) -> Self {
        Self {
            user: UserDto {
                id: user_id.to_string(),
                username: user_id.to_string(),
                email: format!("{user_id}@localhost"),
            },
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// While set, every call fails with [`ApiError::Offline`].
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// From now on every task call fails with [`ApiError::AuthRequired`]
    /// until the next login.
    pub fn expire_session(&self) {
        self.expire_session_after(0);
    }

    /// Lets `calls` more task calls through, then expires the session.
    pub fn expire_session_after(&self, calls: usize) {
        self.state().session_calls_left = Some(calls);
    }

    /// Creates whose description equals `description` fail with `err`.
    pub fn reject_description(&self, description: &str, err: ApiError) {
        self.state()
            .rejections
            .insert(description.to_string(), err);
    }

    pub fn snapshot(&self) -> Vec<TaskDto> {
        self.state().tasks.clone()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reachable(&self) -> Result<MutexGuard<'_, MemoryState>, ApiError> {
        let state = self.state();
        if state.offline {
            return Err(ApiError::Offline);
        }
        Ok(state)
    }

    fn authorized(&self) -> Result<MutexGuard<'_, MemoryState>, ApiError> {
        let mut state = self.reachable()?;
        match state.session_calls_left {
            Some(0) => Err(ApiError::AuthRequired),
            Some(left) => {
                state.session_calls_left = Some(left - 1);
                Ok(state)
            }
            None => Ok(state),
        }
    }

    fn insert(&self, state: &mut MemoryState, create: TaskCreate, id: Option<String>) -> TaskDto {
        let id = id.unwrap_or_else(|| {
            state.next_id += 1;
            format!("mem-{}", state.next_id)
        });
        let dto = TaskDto::from_create(id, self.user.id.clone(), create, Utc::now());
        state.tasks.push(dto.clone());
        dto
    }

    fn session(&self) -> AuthResponse {
        self.state().session_calls_left = None;
        AuthResponse {
            message: "ok".to_string(),
            token: format!("mem-token-{}", self.user.id),
            user: self.user.clone(),
        }
    }
}

#[async_trait]
impl TaskService for MemoryTaskService {
    fn set_token(&mut self, _token: Option<String>) {}

    async fn register(&self, _request: &RegisterRequest) -> Result<AuthResponse, ApiError> {
        self.reachable()?;
        Ok(self.session())
    }

    async fn login(&self, _request: &LoginRequest) -> Result<AuthResponse, ApiError> {
        self.reachable()?;
        Ok(self.session())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskDto>, ApiError> {
        Ok(self.authorized()?.tasks.clone())
    }

    async fn search_tasks(&self, query: &str) -> Result<Vec<TaskDto>, ApiError> {
        let needle = query.to_lowercase();
        Ok(self
            .authorized()?
            .tasks
            .iter()
            .filter(|task| task.task_description.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn create_task(&self, task: &TaskCreate) -> Result<TaskDto, ApiError> {
        let mut state = self.authorized()?;
        if let Some(err) = state.rejections.get(&task.task_description) {
            return Err(err.clone());
        }
        Ok(self.insert(&mut state, task.clone(), None))
    }

    async fn create_tasks(&self, tasks: &[TaskCreate]) -> Result<Vec<TaskDto>, ApiError> {
        let mut state = self.authorized()?;
        if tasks.is_empty() || tasks.len() > MAX_BULK_TASKS {
            return Err(ApiError::Validation(format!(
                "between 1 and {MAX_BULK_TASKS} tasks are required"
            )));
        }
        Ok(tasks
            .iter()
            .map(|task| {
                let id = task.id.clone();
                self.insert(&mut state, task.clone(), id)
            })
            .collect())
    }

    async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<TaskDto, ApiError> {
        let mut state = self.authorized()?;
        let task = state
            .tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or(ApiError::NotFound)?;
        task.apply_patch(patch, Utc::now());
        Ok(task.clone())
    }

    async fn delete_task(&self, id: &str) -> Result<(), ApiError> {
        let mut state = self.authorized()?;
        let before = state.tasks.len();
        state.tasks.retain(|task| task.id != id);
        if state.tasks.len() == before {
            return Err(ApiError::NotFound);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StatsDto, ApiError> {
        Ok(compute_stats(&self.authorized()?.tasks))
    }

    async fn upload_document(
        &self,
        _filename: &str,
        _content_type: &str,
        _bytes: Vec<u8>,
    ) -> Result<UploadResponse, ApiError> {
        self.authorized()?;
        Err(ApiError::Validation(
            "document conversion is not available".to_string(),
        ))
    }
}
