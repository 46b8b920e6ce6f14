//! Remote task API: the error taxonomy callers see, the [`TaskService`]
//! seam, and its HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use docket_shared::{
    AuthResponse, BulkCreateRequest, ErrorBody, LoginRequest, MessageResponse, RegisterRequest,
    StatsDto, TaskCreate, TaskDto, TaskPatch, UploadResponse,
};
use reqwest::{Client, RequestBuilder, StatusCode, Url, multipart};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Failures of a remote call, phrased for the person at the keyboard.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("your session has expired; please log in again")]
    AuthRequired,
    #[error("account temporarily locked after repeated failed logins; try again later")]
    AccountLocked,
    #[error("too many requests; please wait and try again")]
    RateLimited,
    #[error("{0}")]
    Validation(String),
    #[error("task not found")]
    NotFound,
    #[error("the server is unreachable; working offline")]
    Offline,
    #[error("the server could not complete the request; please try again")]
    Server,
}

impl ApiError {
    /// Maps a non-success status and its optional `{error}` body.
    pub fn from_status(status: StatusCode, body: Option<ErrorBody>) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::AuthRequired,
            StatusCode::LOCKED => ApiError::AccountLocked,
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited,
            StatusCode::NOT_FOUND => ApiError::NotFound,
            StatusCode::BAD_REQUEST
            | StatusCode::CONFLICT
            | StatusCode::PAYLOAD_TOO_LARGE
            | StatusCode::UNPROCESSABLE_ENTITY => ApiError::Validation(
                body.map(|b| b.error)
                    .filter(|msg| !msg.trim().is_empty())
                    .unwrap_or_else(|| "the request was rejected".to_string()),
            ),
            _ => ApiError::Server,
        }
    }
}

/// Everything the gateway needs from the server.
#[async_trait]
pub trait TaskService: Send + Sync {
    fn set_token(&mut self, token: Option<String>);

    async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, ApiError>;
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, ApiError>;

    async fn list_tasks(&self) -> Result<Vec<TaskDto>, ApiError>;
    async fn search_tasks(&self, query: &str) -> Result<Vec<TaskDto>, ApiError>;
    async fn create_task(&self, task: &TaskCreate) -> Result<TaskDto, ApiError>;
    async fn create_tasks(&self, tasks: &[TaskCreate]) -> Result<Vec<TaskDto>, ApiError>;
    async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<TaskDto, ApiError>;
    async fn delete_task(&self, id: &str) -> Result<(), ApiError>;
    async fn stats(&self) -> Result<StatsDto, ApiError>;

    async fn upload_document(
        &self,
        filename: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse, ApiError>;
}

/// [`TaskService`] over the JSON REST API.
#[derive(Debug, Clone)]
pub struct HttpTaskService {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTaskService {
    /// `base_url` is the API root, e.g. `http://localhost:3000/api`.
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|err| anyhow::anyhow!("invalid server url '{base_url}': {err}"))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| anyhow::anyhow!("failed to build HTTP client: {err}"))?;
        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let request = match self.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await.map_err(|err| {
            warn!(error = %err, "request did not reach the server");
            ApiError::Offline
        })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|err| {
                warn!(%status, error = %err, "unreadable response body");
                ApiError::Server
            });
        }

        let bytes = response.bytes().await.unwrap_or_default();
        let body = serde_json::from_slice::<ErrorBody>(&bytes).ok();
        let err = ApiError::from_status(status, body);
        debug!(%status, error = %err, "request rejected by server");
        Err(err)
    }
}

#[async_trait]
impl TaskService for HttpTaskService {
    fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    #[tracing::instrument(skip(self, request), fields(username = %request.username))]
    async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, ApiError> {
        self.send(self.client.post(self.url("/register")).json(request))
            .await
    }

    #[tracing::instrument(skip(self, request), fields(username = %request.username))]
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, ApiError> {
        self.send(self.client.post(self.url("/login")).json(request))
            .await
    }

    async fn list_tasks(&self) -> Result<Vec<TaskDto>, ApiError> {
        self.send(self.client.get(self.url("/tasks"))).await
    }

    async fn search_tasks(&self, query: &str) -> Result<Vec<TaskDto>, ApiError> {
        self.send(
            self.client
                .get(self.url("/tasks/search"))
                .query(&[("q", query)]),
        )
        .await
    }

    async fn create_task(&self, task: &TaskCreate) -> Result<TaskDto, ApiError> {
        self.send(self.client.post(self.url("/tasks")).json(task))
            .await
    }

    #[tracing::instrument(skip(self, tasks), fields(count = tasks.len()))]
    async fn create_tasks(&self, tasks: &[TaskCreate]) -> Result<Vec<TaskDto>, ApiError> {
        let body = BulkCreateRequest {
            tasks: tasks.to_vec(),
        };
        self.send(self.client.post(self.url("/tasks/bulk")).json(&body))
            .await
    }

    async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<TaskDto, ApiError> {
        self.send(
            self.client
                .put(self.url(&format!("/tasks/{id}")))
                .json(patch),
        )
        .await
    }

    async fn delete_task(&self, id: &str) -> Result<(), ApiError> {
        let _: MessageResponse = self
            .send(self.client.delete(self.url(&format!("/tasks/{id}"))))
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<StatsDto, ApiError> {
        self.send(self.client.get(self.url("/stats"))).await
    }

    #[tracing::instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn upload_document(
        &self,
        filename: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse, ApiError> {
        let part = multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(content_type)
            .map_err(|_| ApiError::Validation(format!("unsupported file type: {content_type}")))?;
        let form = multipart::Form::new().part("file", part);
        self.send(self.client.post(self.url("/upload")).multipart(form))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use docket_shared::{LoginRequest, TaskCreate, TaskDto, TaskPatch};
    use httpmock::prelude::*;
    use reqwest::StatusCode;
    use serde_json::json;

    use super::{ApiError, HttpTaskService, TaskService};

    fn service(server: &MockServer) -> HttpTaskService {
        HttpTaskService::new(&server.url("/api"), Duration::from_secs(5)).expect("service")
    }

    #[tokio::test]
    async fn list_sends_bearer_token() {
        let server = MockServer::start_async().await;
        let dto = TaskDto::from_create(
            "t1".to_string(),
            "u1".to_string(),
            TaskCreate::new("Water plants"),
            Utc::now(),
        );
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/tasks")
                .header("authorization", "Bearer tok-1");
            then.status(200).json_body(json!([dto]));
        });

        let mut svc = service(&server);
        svc.set_token(Some("tok-1".to_string()));
        let tasks = svc.list_tasks().await.expect("list");

        mock.assert();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_description, "Water plants");
    }

    #[tokio::test]
    async fn validation_errors_carry_the_server_message() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(PUT).path("/api/tasks/t1");
            then.status(400)
                .json_body(json!({ "error": "Task description is required" }));
        });

        let err = service(&server)
            .update_task("t1", &TaskPatch::default())
            .await
            .expect_err("400");
        assert_eq!(
            err,
            ApiError::Validation("Task description is required".to_string())
        );
    }

    #[tokio::test]
    async fn locked_and_limited_statuses_are_distinct() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/api/login");
            then.status(423).json_body(json!({ "error": "locked" }));
        });
        let login = LoginRequest {
            username: "alice".to_string(),
            password: "Secret1".to_string(),
        };
        assert!(matches!(
            service(&server).login(&login).await,
            Err(ApiError::AccountLocked)
        ));

        assert_eq!(
            ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, None),
            ApiError::RateLimited
        );
        assert_eq!(
            ApiError::from_status(StatusCode::INTERNAL_SERVER_ERROR, None),
            ApiError::Server
        );
    }

    #[tokio::test]
    async fn unreachable_server_reads_as_offline() {
        let svc = HttpTaskService::new("http://127.0.0.1:9/api", Duration::from_millis(500))
            .expect("service");
        assert!(matches!(svc.list_tasks().await, Err(ApiError::Offline)));
    }

    #[tokio::test]
    async fn delete_accepts_message_body() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(DELETE).path("/api/tasks/t9");
            then.status(200).json_body(json!({ "message": "Task deleted" }));
        });

        service(&server).delete_task("t9").await.expect("delete");
        mock.assert();
    }
}
