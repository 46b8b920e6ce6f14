//! JSON-file repository for users and tasks.
//!
//! Both collections live in memory behind one mutex; every mutation is
//! written to a temp file and renamed over the old one before the in-memory
//! copy advances.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use docket_shared::{TaskCreate, TaskDto, TaskPatch, UserDto};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uuid::Uuid;

const USERS_FILE: &str = "users.json";
const TASKS_FILE: &str = "tasks.json";

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("username or email already exists")]
    UserExists,
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("duplicate task ids in request")]
    DuplicateIds,
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl UserRecord {
    pub fn to_dto(&self) -> UserDto {
        UserDto {
            id: self.id.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Collections {
    users: Vec<UserRecord>,
    tasks: Vec<TaskDto>,
}

#[derive(Debug)]
pub struct Repository {
    users_path: PathBuf,
    tasks_path: PathBuf,
    inner: Mutex<Collections>,
}

impl Repository {
    #[tracing::instrument(skip_all, fields(dir = %dir.display()))]
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data dir {}", dir.display()))?;

        let users_path = dir.join(USERS_FILE);
        let tasks_path = dir.join(TASKS_FILE);
        let users: Vec<UserRecord> = load_collection(&users_path)?;
        let tasks: Vec<TaskDto> = load_collection(&tasks_path)?;

        info!(users = users.len(), tasks = tasks.len(), "repository opened");

        Ok(Self {
            users_path,
            tasks_path,
            inner: Mutex::new(Collections { users, tasks }),
        })
    }

    pub fn insert_user(
        &self,
        username: &str,
        email: &str,
        password_hash: String,
        now: DateTime<Utc>,
    ) -> Result<UserRecord, RepoError> {
        let mut inner = self.inner.lock();
        if inner
            .users
            .iter()
            .any(|u| u.username == username || u.email == email)
        {
            return Err(RepoError::UserExists);
        }

        let user = UserRecord {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            created_at: now,
            last_login: None,
            is_active: true,
        };
        let mut next = inner.users.clone();
        next.push(user.clone());
        save_collection(&self.users_path, &next)?;
        inner.users = next;

        info!(user_id = %user.id, username = %user.username, "user registered");
        Ok(user)
    }

    /// Matches either the username or the email.
    pub fn find_login(&self, login: &str) -> Option<UserRecord> {
        self.inner
            .lock()
            .users
            .iter()
            .find(|u| u.username == login || u.email == login)
            .cloned()
    }

    pub fn find_user(&self, id: &str) -> Option<UserRecord> {
        self.inner.lock().users.iter().find(|u| u.id == id).cloned()
    }

    pub fn record_login(&self, id: &str, now: DateTime<Utc>) -> Result<(), RepoError> {
        let mut inner = self.inner.lock();
        let mut next = inner.users.clone();
        if let Some(user) = next.iter_mut().find(|u| u.id == id) {
            user.last_login = Some(now);
        }
        save_collection(&self.users_path, &next)?;
        inner.users = next;
        Ok(())
    }

    pub fn list_tasks(&self, user_id: &str) -> Vec<TaskDto> {
        self.inner
            .lock()
            .tasks
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Case-insensitive substring match over description, section,
    /// responsible and notes.
    pub fn search_tasks(&self, user_id: &str, query: &str) -> Vec<TaskDto> {
        let needle = query.trim().to_lowercase();
        self.inner
            .lock()
            .tasks
            .iter()
            .filter(|t| t.user_id == user_id)
            .filter(|t| {
                needle.is_empty()
                    || [
                        Some(t.task_description.as_str()),
                        t.section.as_deref(),
                        t.responsible.as_deref(),
                        t.notes.as_deref(),
                    ]
                    .into_iter()
                    .flatten()
                    .any(|field| field.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect()
    }

    /// Single create always gets a server-assigned id.
    pub fn insert_task(
        &self,
        user_id: &str,
        create: TaskCreate,
        now: DateTime<Utc>,
    ) -> Result<TaskDto, RepoError> {
        let task = TaskDto::from_create(Uuid::new_v4().to_string(), user_id.to_string(), create, now);

        let mut inner = self.inner.lock();
        let mut next = inner.tasks.clone();
        next.push(task.clone());
        save_collection(&self.tasks_path, &next)?;
        inner.tasks = next;

        debug!(id = %task.id, user_id, "task created");
        Ok(task)
    }

    /// Client-supplied ids are kept; a repeat within the batch or a clash with
    /// a stored task rejects the whole batch.
    pub fn insert_tasks(
        &self,
        user_id: &str,
        creates: Vec<TaskCreate>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskDto>, RepoError> {
        let mut inner = self.inner.lock();

        let mut seen: HashSet<String> = inner.tasks.iter().map(|t| t.id.clone()).collect();
        let mut created = Vec::with_capacity(creates.len());
        for mut create in creates {
            let id = match create.id.take().filter(|id| !id.trim().is_empty()) {
                Some(id) => id,
                None => Uuid::new_v4().to_string(),
            };
            if !seen.insert(id.clone()) {
                return Err(RepoError::DuplicateIds);
            }
            created.push(TaskDto::from_create(id, user_id.to_string(), create, now));
        }

        let mut next = inner.tasks.clone();
        next.extend(created.iter().cloned());
        save_collection(&self.tasks_path, &next)?;
        inner.tasks = next;

        info!(user_id, count = created.len(), "bulk tasks created");
        Ok(created)
    }

    pub fn update_task(
        &self,
        user_id: &str,
        id: &str,
        patch: &TaskPatch,
        now: DateTime<Utc>,
    ) -> Result<TaskDto, RepoError> {
        let mut inner = self.inner.lock();
        let mut next = inner.tasks.clone();
        let task = next
            .iter_mut()
            .find(|t| t.id == id && t.user_id == user_id)
            .ok_or_else(|| RepoError::TaskNotFound(id.to_string()))?;
        task.apply_patch(patch, now);
        let updated = task.clone();

        save_collection(&self.tasks_path, &next)?;
        inner.tasks = next;

        debug!(id, user_id, "task updated");
        Ok(updated)
    }

    pub fn delete_task(&self, user_id: &str, id: &str) -> Result<(), RepoError> {
        let mut inner = self.inner.lock();
        let before = inner.tasks.len();
        let next: Vec<TaskDto> = inner
            .tasks
            .iter()
            .filter(|t| !(t.id == id && t.user_id == user_id))
            .cloned()
            .collect();
        if next.len() == before {
            return Err(RepoError::TaskNotFound(id.to_string()));
        }

        save_collection(&self.tasks_path, &next)?;
        inner.tasks = next;

        debug!(id, user_id, "task deleted");
        Ok(())
    }
}

fn load_collection<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    if !path.exists() {
        debug!(file = %path.display(), "collection file missing; starting empty");
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn save_collection<T: Serialize>(path: &Path, items: &[T]) -> anyhow::Result<()> {
    debug!(file = %path.display(), count = items.len(), "saving collection atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut temp, items)?;
    writeln!(temp)?;
    temp.flush()?;
    temp.as_file().sync_all()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use docket_shared::{TaskCreate, TaskPatch};
    use tempfile::tempdir;

    use super::{RepoError, Repository};

    #[test]
    fn tasks_persist_and_stay_scoped_to_their_owner() {
        let temp = tempdir().expect("tempdir");
        let now = Utc::now();
        {
            let repo = Repository::open(temp.path()).expect("open");
            repo.insert_task("alice", TaskCreate::new("Order chairs"), now)
                .expect("insert");
            repo.insert_task("bob", TaskCreate::new("Book venue"), now)
                .expect("insert");
        }

        let repo = Repository::open(temp.path()).expect("reopen");
        let alice = repo.list_tasks("alice");
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].task_description, "Order chairs");

        let err = repo
            .update_task("bob", &alice[0].id, &TaskPatch::default(), now)
            .expect_err("other owner");
        assert!(matches!(err, RepoError::TaskNotFound(_)));
        assert!(repo.delete_task("bob", &alice[0].id).is_err());
        repo.delete_task("alice", &alice[0].id).expect("delete");
        assert!(repo.list_tasks("alice").is_empty());
    }

    #[test]
    fn bulk_insert_rejects_repeated_or_existing_ids() {
        let temp = tempdir().expect("tempdir");
        let repo = Repository::open(temp.path()).expect("open");
        let now = Utc::now();

        let with_id = |id: &str| TaskCreate {
            id: Some(id.to_string()),
            ..TaskCreate::new(format!("Task {id}"))
        };

        let created = repo
            .insert_tasks("alice", vec![with_id("a"), TaskCreate::new("No id")], now)
            .expect("bulk");
        assert_eq!(created[0].id, "a");
        assert_ne!(created[1].id, "");

        assert!(matches!(
            repo.insert_tasks("alice", vec![with_id("b"), with_id("b")], now),
            Err(RepoError::DuplicateIds)
        ));
        assert!(matches!(
            repo.insert_tasks("alice", vec![with_id("a")], now),
            Err(RepoError::DuplicateIds)
        ));
        assert_eq!(repo.list_tasks("alice").len(), 2);
    }

    #[test]
    fn search_matches_any_text_field_ignoring_case() {
        let temp = tempdir().expect("tempdir");
        let repo = Repository::open(temp.path()).expect("open");
        let now = Utc::now();

        repo.insert_task(
            "alice",
            TaskCreate {
                responsible: Some("Finance Team".to_string()),
                ..TaskCreate::new("Close the quarter")
            },
            now,
        )
        .expect("insert");
        repo.insert_task("alice", TaskCreate::new("Paint fence"), now)
            .expect("insert");

        assert_eq!(repo.search_tasks("alice", "finance").len(), 1);
        assert_eq!(repo.search_tasks("alice", "QUARTER").len(), 1);
        assert!(repo.search_tasks("bob", "fence").is_empty());
    }

    #[test]
    fn usernames_and_emails_are_unique() {
        let temp = tempdir().expect("tempdir");
        let repo = Repository::open(temp.path()).expect("open");
        let now = Utc::now();

        repo.insert_user("dana", "dana@example.com", "hash".to_string(), now)
            .expect("insert");
        assert!(matches!(
            repo.insert_user("other", "dana@example.com", "hash".to_string(), now),
            Err(RepoError::UserExists)
        ));
        assert!(repo.find_login("dana@example.com").is_some());
        assert!(repo.find_login("nobody").is_none());
    }
}
