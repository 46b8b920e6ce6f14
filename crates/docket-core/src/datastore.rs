use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use docket_shared::{TaskCreate, TaskDto, TaskPatch};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::task::{SyncStatus, Task, new_local_id};

const STORE_FILE: &str = "store.json";
const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("task id already exists: {0}")]
    DuplicateId(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Operation {
    Create { data: TaskCreate },
    Update { data: TaskPatch },
    Delete,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Update { .. } => "update",
            Operation::Delete => "delete",
        }
    }
}

/// One queued local mutation awaiting replay. `seq` orders the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub seq: u64,
    pub task_id: String,
    #[serde(flatten)]
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
}

/// Result of overwriting the cache with a server snapshot.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub synced: usize,
    /// Records that were still pending locally but are absent from the
    /// snapshot. They are no longer in the task collection.
    pub conflicts: Vec<Task>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    tasks: BTreeMap<String, Task>,
    #[serde(default)]
    queue: Vec<PendingOperation>,
    #[serde(default)]
    conflicts: Vec<Task>,
    #[serde(default)]
    next_seq: u64,
    /// Local ids of replayed creates, keyed to the id the server assigned.
    #[serde(default)]
    aliases: HashMap<String, String>,
}

impl StoreDocument {
    fn enqueue(&mut self, task_id: &str, operation: Operation, now: DateTime<Utc>) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        debug!(seq, task_id, action = operation.name(), "queued pending operation");
        self.queue.push(PendingOperation {
            seq,
            task_id: task_id.to_string(),
            operation,
            timestamp: now,
        });
        seq
    }

    fn resolve(&self, id: &str) -> String {
        self.aliases
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }
}

/// Local task cache plus pending-operation queue.
///
/// Both collections live in one document; every mutation writes the whole
/// document to a temp file and renames it into place, so the task records and
/// the queue always change together.
#[derive(Debug)]
pub struct LocalStore {
    pub data_dir: PathBuf,
    pub store_path: PathBuf,
    doc: StoreDocument,
    online: bool,
    current_user: Option<String>,
}

impl LocalStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let store_path = data_dir.join(STORE_FILE);
        let doc = if store_path.exists() {
            load_document(&store_path)?
        } else {
            let doc = StoreDocument {
                version: STORE_FORMAT_VERSION,
                ..StoreDocument::default()
            };
            save_document_atomic(&store_path, &doc)?;
            doc
        };

        info!(
            data_dir = %data_dir.display(),
            store = %store_path.display(),
            tasks = doc.tasks.len(),
            queued = doc.queue.len(),
            "opened local store"
        );

        Ok(Self {
            data_dir,
            store_path,
            doc,
            online: true,
            current_user: None,
        })
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn set_online(&mut self, online: bool) {
        if self.online != online {
            info!(online, "local store connectivity changed");
        }
        self.online = online;
    }

    pub fn current_user(&self) -> Option<&str> {
        self.current_user.as_deref()
    }

    pub fn set_current_user(&mut self, user_id: Option<String>) {
        self.current_user = user_id;
    }

    #[tracing::instrument(skip(self, task), fields(online = self.online))]
    pub fn add_task(&mut self, mut task: Task) -> Result<Task, StoreError> {
        let now = Utc::now();
        if task.id.trim().is_empty() {
            task.id = new_local_id();
        }
        if task.user_id.is_none() {
            task.user_id = self.current_user.clone();
        }
        task.updated_at = now;
        task.mark_pending();
        task.local_only = !self.online;

        let online = self.online;
        self.transact(|doc| {
            if doc.tasks.contains_key(&task.id) {
                return Err(StoreError::DuplicateId(task.id.clone()));
            }
            doc.tasks.insert(task.id.clone(), task.clone());
            if !online {
                doc.enqueue(
                    &task.id,
                    Operation::Create {
                        data: task.to_create(),
                    },
                    now,
                );
            }
            Ok(task)
        })
    }

    pub fn get_all_tasks(&self) -> Vec<Task> {
        let user = self.current_user.as_deref();
        let mut tasks: Vec<Task> = self
            .doc
            .tasks
            .values()
            .filter(|task| task.user_id.as_deref() == user)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn get_task(&self, id: &str) -> Option<&Task> {
        self.doc.tasks.get(id)
    }

    /// The id a task is known by now. A local id whose create has been
    /// replayed maps to the server id; anything else comes back unchanged.
    pub fn resolve_id(&self, id: &str) -> String {
        self.doc.resolve(id)
    }

    #[tracing::instrument(skip(self, patch), fields(online = self.online))]
    pub fn update_task(&mut self, id: &str, patch: TaskPatch) -> Result<Task, StoreError> {
        let now = Utc::now();
        let online = self.online;
        self.transact(|doc| {
            let id = doc.resolve(id);
            let task = doc
                .tasks
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            task.apply_patch(&patch, now);
            task.mark_pending();
            let updated = task.clone();
            if !online {
                doc.enqueue(&id, Operation::Update { data: patch }, now);
            }
            Ok(updated)
        })
    }

    /// Removing an unknown id is not an error.
    #[tracing::instrument(skip(self), fields(online = self.online))]
    pub fn delete_task(&mut self, id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let online = self.online;
        self.transact(|doc| {
            let id = doc.resolve(id);
            if doc.tasks.remove(&id).is_none() {
                debug!(id = %id, "delete of unknown task id");
            }
            if !online {
                doc.enqueue(&id, Operation::Delete, now);
            }
            Ok(())
        })
    }

    /// Replaces the whole task collection with `server_tasks`.
    ///
    /// Anything pending locally that the snapshot does not contain, and that
    /// has no queued operation left to replay, is moved to the conflict
    /// collection.
    #[tracing::instrument(skip(self, server_tasks), fields(count = server_tasks.len()))]
    pub fn update_local_tasks(
        &mut self,
        server_tasks: Vec<TaskDto>,
    ) -> Result<Reconciliation, StoreError> {
        self.transact(|doc| {
            let incoming: BTreeMap<String, Task> = server_tasks
                .into_iter()
                .map(|dto| {
                    let task = Task::from_remote(dto);
                    (task.id.clone(), task)
                })
                .collect();

            let mut conflicts = Vec::new();
            for (id, task) in &doc.tasks {
                if task.sync_status != SyncStatus::Pending || incoming.contains_key(id) {
                    continue;
                }
                if doc.queue.iter().any(|op| &op.task_id == id) {
                    debug!(id = %id, "pending task still queued; it returns after replay");
                } else {
                    let mut lost = task.clone();
                    lost.mark_conflict();
                    warn!(
                        id = %lost.id,
                        local_only = lost.local_only,
                        "pending task missing from server snapshot; moved to conflicts"
                    );
                    conflicts.push(lost);
                }
            }

            for conflict in &conflicts {
                doc.conflicts.retain(|existing| existing.id != conflict.id);
                doc.conflicts.push(conflict.clone());
            }

            let synced = incoming.len();
            doc.tasks = incoming;
            info!(synced, conflicts = conflicts.len(), "local cache replaced by server snapshot");
            Ok(Reconciliation { synced, conflicts })
        })
    }

    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        let mut queue = self.doc.queue.clone();
        queue.sort_by_key(|op| op.seq);
        queue
    }

    pub fn pending_operation(&self, seq: u64) -> Option<PendingOperation> {
        self.doc.queue.iter().find(|op| op.seq == seq).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.doc.queue.len()
    }

    /// Removes a replayed queue entry. When `server_id` differs from the
    /// entry's task id (a create acknowledged under a new id) the local record
    /// and every later queued entry for it are re-keyed in the same write, and
    /// the old id is kept as an alias for [`LocalStore::resolve_id`].
    #[tracing::instrument(skip(self))]
    pub fn complete_operation(
        &mut self,
        seq: u64,
        server_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.transact(|doc| {
            let Some(idx) = doc.queue.iter().position(|op| op.seq == seq) else {
                debug!(seq, "queue entry already removed");
                return Ok(());
            };
            let op = doc.queue.remove(idx);

            let Some(server_id) = server_id else {
                return Ok(());
            };
            if server_id == op.task_id {
                return Ok(());
            }

            if let Some(mut task) = doc.tasks.remove(&op.task_id) {
                task.id = server_id.to_string();
                task.local_only = false;
                doc.tasks.insert(task.id.clone(), task);
            }
            let mut rewritten = 0usize;
            for later in doc.queue.iter_mut().filter(|later| later.task_id == op.task_id) {
                later.task_id = server_id.to_string();
                rewritten += 1;
            }
            doc.aliases.insert(op.task_id.clone(), server_id.to_string());
            info!(
                local_id = %op.task_id,
                server_id,
                rewritten,
                "remapped local task id to server id"
            );
            Ok(())
        })
    }

    /// Records a write the server has already confirmed.
    #[tracing::instrument(skip(self, dto), fields(id = %dto.id))]
    pub fn cache_remote(&mut self, dto: TaskDto) -> Result<Task, StoreError> {
        let task = Task::from_remote(dto);
        self.transact(|doc| {
            doc.tasks.insert(task.id.clone(), task.clone());
            Ok(task)
        })
    }

    #[tracing::instrument(skip(self))]
    pub fn forget(&mut self, id: &str) -> Result<(), StoreError> {
        self.transact(|doc| {
            doc.tasks.remove(id);
            Ok(())
        })
    }

    pub fn conflicts(&self) -> &[Task] {
        &self.doc.conflicts
    }

    #[tracing::instrument(skip(self))]
    pub fn clear_conflicts(&mut self) -> Result<usize, StoreError> {
        self.transact(|doc| {
            let cleared = doc.conflicts.len();
            doc.conflicts.clear();
            Ok(cleared)
        })
    }

    #[tracing::instrument(skip(self))]
    pub fn clear_all_data(&mut self) -> Result<(), StoreError> {
        self.transact(|doc| {
            info!(
                tasks = doc.tasks.len(),
                queued = doc.queue.len(),
                "clearing local store"
            );
            doc.tasks.clear();
            doc.queue.clear();
            doc.conflicts.clear();
            doc.aliases.clear();
            Ok(())
        })
    }

    /// Applies `f` to a copy of the document and persists it; the in-memory
    /// state only advances once the write has landed.
    fn transact<T>(
        &mut self,
        f: impl FnOnce(&mut StoreDocument) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut next = self.doc.clone();
        let out = f(&mut next)?;
        next.version = STORE_FORMAT_VERSION;
        save_document_atomic(&self.store_path, &next)?;
        self.doc = next;
        Ok(out)
    }
}

#[tracing::instrument(skip(path))]
fn load_document(path: &Path) -> anyhow::Result<StoreDocument> {
    debug!(file = %path.display(), "loading store document");
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(StoreDocument::default());
    }
    let doc: StoreDocument = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing {}", path.display()))?;
    if doc.version > STORE_FORMAT_VERSION {
        return Err(anyhow!(
            "{} was written by a newer version (format {})",
            path.display(),
            doc.version
        ));
    }
    Ok(doc)
}

#[tracing::instrument(skip(path, doc))]
fn save_document_atomic(path: &Path, doc: &StoreDocument) -> anyhow::Result<()> {
    debug!(
        file = %path.display(),
        tasks = doc.tasks.len(),
        queued = doc.queue.len(),
        "saving store document atomically"
    );

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut temp, doc)?;
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
    use docket_shared::{TaskCreate, TaskDto, TaskPatch};
    use tempfile::tempdir;

    use super::{LocalStore, Operation, StoreError};
    use crate::task::{SyncStatus, Task};

    fn offline_store(dir: &std::path::Path) -> LocalStore {
        let mut store = LocalStore::open(dir).expect("open store");
        store.set_current_user(Some("u1".to_string()));
        store.set_online(false);
        store
    }

    #[test]
    fn offline_add_assigns_local_id_and_queues_create() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());

        let stored = store
            .add_task(Task::draft("Order supplies", Utc::now()))
            .expect("add");

        assert!(stored.is_local_id());
        assert!(stored.local_only);
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert_eq!(stored.user_id.as_deref(), Some("u1"));

        let queue = store.pending_operations();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].task_id, stored.id);
        assert!(matches!(queue[0].operation, Operation::Create { .. }));
    }

    #[test]
    fn online_add_marks_pending_without_queueing() {
        let temp = tempdir().expect("tempdir");
        let mut store = LocalStore::open(temp.path()).expect("open store");

        let stored = store
            .add_task(Task::draft("Order supplies", Utc::now()))
            .expect("add");

        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert!(!stored.local_only);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());
        let mut task = Task::draft("First", Utc::now());
        task.id = "fixed".to_string();
        store.add_task(task.clone()).expect("first add");

        let err = store.add_task(task).expect_err("duplicate must fail");
        assert!(matches!(err, StoreError::DuplicateId(id) if id == "fixed"));
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn update_of_missing_task_is_not_found_and_queues_nothing() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());

        let err = store
            .update_task("nope", TaskPatch::default())
            .expect_err("missing task");
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn delete_is_idempotent_and_queued_when_offline() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());

        store.delete_task("ghost").expect("delete unknown id");
        let queue = store.pending_operations();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].operation, Operation::Delete);
    }

    #[test]
    fn queue_survives_reopen_in_insertion_order() {
        let temp = tempdir().expect("tempdir");
        let id = {
            let mut store = offline_store(temp.path());
            let task = store
                .add_task(Task::draft("Draft agenda", Utc::now()))
                .expect("add");
            store
                .update_task(
                    &task.id,
                    TaskPatch {
                        task_description: Some("Final agenda".to_string()),
                        ..TaskPatch::default()
                    },
                )
                .expect("update");
            store.delete_task(&task.id).expect("delete");
            task.id
        };

        let reopened = LocalStore::open(temp.path()).expect("reopen");
        let actions: Vec<&str> = reopened
            .pending_operations()
            .iter()
            .map(|op| op.operation.name())
            .collect();
        assert_eq!(actions, vec!["create", "update", "delete"]);
        assert!(reopened.pending_operations().iter().all(|op| op.task_id == id));
        assert!(reopened.get_task(&id).is_none());
    }

    #[test]
    fn snapshot_overwrite_keeps_exactly_the_snapshot() {
        let temp = tempdir().expect("tempdir");
        let mut store = LocalStore::open(temp.path()).expect("open store");
        store.set_current_user(Some("u1".to_string()));
        let lost = store
            .add_task(Task::draft("Never queued", Utc::now()))
            .expect("add online");
        store.set_online(false);
        let queued = store
            .add_task(Task::draft("Queued offline", Utc::now()))
            .expect("add offline");

        let snapshot = vec![
            TaskDto::from_create(
                "s1".to_string(),
                "u1".to_string(),
                TaskCreate::new("From server"),
                Utc::now(),
            ),
            TaskDto::from_create(
                "s2".to_string(),
                "u1".to_string(),
                TaskCreate::new("Also from server"),
                Utc::now(),
            ),
        ];
        let outcome = store.update_local_tasks(snapshot).expect("overwrite");

        let ids: Vec<String> = store.get_all_tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"s1".to_string()) && ids.contains(&"s2".to_string()));
        assert!(
            store
                .get_all_tasks()
                .iter()
                .all(|t| t.sync_status == SyncStatus::Synced)
        );

        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].id, lost.id);
        assert_eq!(store.conflicts()[0].sync_status, SyncStatus::Conflict);
        assert!(store.get_task(&queued.id).is_none());
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn completing_a_create_remaps_later_entries() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());
        let task = store
            .add_task(Task::draft("Book room", Utc::now()))
            .expect("add");
        store
            .update_task(
                &task.id,
                TaskPatch {
                    is_completed: Some(true),
                    ..TaskPatch::default()
                },
            )
            .expect("update");

        let create_seq = store.pending_operations()[0].seq;
        store
            .complete_operation(create_seq, Some("srv-42"))
            .expect("complete");

        assert!(store.get_task(&task.id).is_none());
        let remapped = store.get_task("srv-42").expect("remapped task");
        assert!(!remapped.local_only);
        let queue = store.pending_operations();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].task_id, "srv-42");
    }

    #[test]
    fn replayed_local_id_still_reaches_the_task() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());
        let local = store
            .add_task(Task::draft("Book room", Utc::now()))
            .expect("add");
        let create_seq = store.pending_operations()[0].seq;
        store
            .complete_operation(create_seq, Some("srv-7"))
            .expect("complete");

        assert_eq!(store.resolve_id(&local.id), "srv-7");
        assert_eq!(store.resolve_id("srv-7"), "srv-7");
        assert_eq!(store.resolve_id("unrelated"), "unrelated");

        let updated = store
            .update_task(
                &local.id,
                TaskPatch {
                    is_completed: Some(true),
                    ..TaskPatch::default()
                },
            )
            .expect("update by old id");
        assert_eq!(updated.id, "srv-7");
        store.delete_task(&local.id).expect("delete by old id");

        assert!(store.get_task("srv-7").is_none());
        let queued: Vec<String> = store
            .pending_operations()
            .into_iter()
            .map(|op| op.task_id)
            .collect();
        assert_eq!(queued, vec!["srv-7".to_string(), "srv-7".to_string()]);

        let reopened = LocalStore::open(temp.path()).expect("reopen");
        assert_eq!(reopened.resolve_id(&local.id), "srv-7");
    }

    #[test]
    fn clear_all_data_empties_every_collection() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());
        let task = store
            .add_task(Task::draft("Wipe me", Utc::now()))
            .expect("add");
        let seq = store.pending_operations()[0].seq;
        store.complete_operation(seq, Some("srv-1")).expect("complete");
        store.add_task(Task::draft("Queued", Utc::now())).expect("add");

        store.clear_all_data().expect("clear");

        assert!(store.get_all_tasks().is_empty());
        assert_eq!(store.pending_count(), 0);
        assert!(store.conflicts().is_empty());
        assert_eq!(store.resolve_id(&task.id), task.id);
        let reopened = LocalStore::open(temp.path()).expect("reopen");
        assert!(reopened.get_all_tasks().is_empty());
        assert_eq!(reopened.pending_count(), 0);
    }

    #[test]
    fn get_all_tasks_is_scoped_to_current_user() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());
        store
            .add_task(Task::draft("Mine", Utc::now()))
            .expect("add mine");
        let mut other = Task::draft("Theirs", Utc::now());
        other.user_id = Some("u2".to_string());
        store.add_task(other).expect("add theirs");

        let visible = store.get_all_tasks();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].task_description, "Mine");
    }
}
