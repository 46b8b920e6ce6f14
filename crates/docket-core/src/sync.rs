use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::api::{ApiError, TaskService};
use crate::datastore::{LocalStore, Operation, StoreError};
use crate::task::Task;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The server refused the session; nothing later in the queue can succeed.
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub replayed: usize,
    pub failed: usize,
    /// Entries skipped because an earlier create for the same task failed in
    /// this cycle.
    pub deferred: usize,
    /// Updates and deletes whose target no longer exists remotely.
    pub dropped: usize,
    pub refreshed: bool,
    pub conflicts: Vec<Task>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.deferred == 0 && self.conflicts.is_empty()
    }
}

/// Replays the pending queue in insertion order, then replaces the local
/// cache with a fresh server snapshot.
///
/// A remote failure leaves its entry queued and the next one is tried.
/// [`ApiError::AuthRequired`] and local storage failures abort the cycle.
#[tracing::instrument(skip(store, service), fields(queued = store.pending_count()))]
pub async fn run_cycle<S>(store: &mut LocalStore, service: &S) -> Result<SyncReport, SyncError>
where
    S: TaskService + ?Sized,
{
    let mut report = SyncReport::default();
    let seqs: Vec<u64> = store
        .pending_operations()
        .iter()
        .map(|op| op.seq)
        .collect();
    let mut blocked: HashSet<String> = HashSet::new();

    for seq in seqs {
        // Re-read each entry; an earlier create may have re-keyed it.
        let Some(entry) = store.pending_operation(seq) else {
            continue;
        };
        if blocked.contains(&entry.task_id) {
            debug!(seq, task_id = %entry.task_id, "deferring entry behind failed create");
            report.deferred += 1;
            continue;
        }

        let outcome = match &entry.operation {
            Operation::Create { data } => service
                .create_task(data)
                .await
                .map(|dto| Some(dto.id)),
            Operation::Update { data } => service
                .update_task(&entry.task_id, data)
                .await
                .map(|_| None),
            Operation::Delete => service.delete_task(&entry.task_id).await.map(|_| None),
        };

        match outcome {
            Ok(server_id) => {
                store.complete_operation(seq, server_id.as_deref())?;
                report.replayed += 1;
            }
            Err(ApiError::NotFound) if !matches!(entry.operation, Operation::Create { .. }) => {
                warn!(
                    seq,
                    task_id = %entry.task_id,
                    action = entry.operation.name(),
                    "target already gone remotely; dropping entry"
                );
                store.complete_operation(seq, None)?;
                report.dropped += 1;
            }
            Err(ApiError::AuthRequired) => {
                warn!(seq, task_id = %entry.task_id, "session rejected; stopping sync");
                return Err(ApiError::AuthRequired.into());
            }
            Err(err) => {
                warn!(
                    seq,
                    task_id = %entry.task_id,
                    action = entry.operation.name(),
                    error = %err,
                    "sync entry failed; leaving it queued"
                );
                if matches!(entry.operation, Operation::Create { .. }) {
                    blocked.insert(entry.task_id.clone());
                }
                report.failed += 1;
            }
        }
    }

    match service.list_tasks().await {
        Ok(snapshot) => {
            let reconciliation = store.update_local_tasks(snapshot)?;
            report.refreshed = true;
            report.conflicts = reconciliation.conflicts;
        }
        Err(ApiError::AuthRequired) => {
            warn!("session rejected while fetching snapshot");
            return Err(ApiError::AuthRequired.into());
        }
        Err(err) => warn!(error = %err, "snapshot fetch failed; local cache left as is"),
    }

    info!(
        replayed = report.replayed,
        failed = report.failed,
        deferred = report.deferred,
        dropped = report.dropped,
        refreshed = report.refreshed,
        conflicts = report.conflicts.len(),
        "sync cycle finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use docket_shared::TaskPatch;
    use tempfile::tempdir;

    use super::{SyncError, run_cycle};
    use crate::api::ApiError;
    use crate::datastore::LocalStore;
    use crate::memory::MemoryTaskService;
    use crate::task::{SyncStatus, Task};

    fn offline_store(dir: &std::path::Path) -> LocalStore {
        let mut store = LocalStore::open(dir).expect("open store");
        store.set_current_user(Some("u1".to_string()));
        store.set_online(false);
        store
    }

    #[tokio::test]
    async fn create_update_delete_leaves_nothing_behind() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());
        let task = store
            .add_task(Task::draft("Temporary", Utc::now()))
            .expect("add");
        store
            .update_task(
                &task.id,
                TaskPatch {
                    task_description: Some("Still temporary".to_string()),
                    ..TaskPatch::default()
                },
            )
            .expect("update");
        store.delete_task(&task.id).expect("delete");

        let service = MemoryTaskService::new("u1");
        store.set_online(true);
        let report = run_cycle(&mut store, &service).await.expect("sync");

        assert_eq!(report.replayed, 3);
        assert!(report.is_clean());
        assert!(service.snapshot().is_empty());
        assert!(store.get_all_tasks().is_empty());
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn offline_create_ends_up_synced_under_server_id() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());
        let local = store
            .add_task(Task::draft("Renew license", Utc::now()))
            .expect("add");

        let service = MemoryTaskService::new("u1");
        let report = run_cycle(&mut store, &service).await.expect("sync");

        assert!(report.refreshed);
        let tasks = store.get_all_tasks();
        assert_eq!(tasks.len(), 1);
        assert_ne!(tasks[0].id, local.id);
        assert_eq!(tasks[0].sync_status, SyncStatus::Synced);
        assert_eq!(tasks[0].task_description, "Renew license");
    }

    #[tokio::test]
    async fn failed_create_defers_its_followers_but_not_others() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());
        let doomed = store
            .add_task(Task::draft("reject me", Utc::now()))
            .expect("add doomed");
        store
            .update_task(
                &doomed.id,
                TaskPatch {
                    is_completed: Some(true),
                    ..TaskPatch::default()
                },
            )
            .expect("update doomed");
        store
            .add_task(Task::draft("Fine", Utc::now()))
            .expect("add fine");

        let service = MemoryTaskService::new("u1");
        service.reject_description("reject me", ApiError::Validation("bad".to_string()));
        let report = run_cycle(&mut store, &service).await.expect("sync");

        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.replayed, 1);
        assert_eq!(store.pending_count(), 2);
        assert_eq!(service.snapshot().len(), 1);
        assert!(report.conflicts.is_empty());
    }

    #[tokio::test]
    async fn replayed_delete_of_missing_task_is_dropped() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());
        store.delete_task("srv-gone").expect("queue delete");

        let service = MemoryTaskService::new("u1");
        let report = run_cycle(&mut store, &service).await.expect("sync");

        assert_eq!(report.dropped, 1);
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn snapshot_failure_keeps_cache() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());
        store
            .add_task(Task::draft("Kept", Utc::now()))
            .expect("add");

        let service = MemoryTaskService::new("u1");
        service.set_offline(true);
        let report = run_cycle(&mut store, &service).await.expect("sync");

        assert!(!report.refreshed);
        assert_eq!(report.failed, 1);
        assert_eq!(store.get_all_tasks().len(), 1);
        assert_eq!(store.pending_count(), 1);
    }

    #[tokio::test]
    async fn rejected_session_stops_the_cycle() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());
        store
            .add_task(Task::draft("First", Utc::now()))
            .expect("add first");
        store
            .add_task(Task::draft("Second", Utc::now()))
            .expect("add second");

        let service = MemoryTaskService::new("u1");
        service.expire_session();
        let err = run_cycle(&mut store, &service)
            .await
            .expect_err("expired session");

        assert!(matches!(err, SyncError::Api(ApiError::AuthRequired)));
        assert_eq!(store.pending_count(), 2);
        assert_eq!(store.get_all_tasks().len(), 2);
    }

    #[tokio::test]
    async fn rejected_snapshot_fetch_is_reported() {
        let temp = tempdir().expect("tempdir");
        let mut store = offline_store(temp.path());
        store.delete_task("srv-gone").expect("queue delete");

        let service = MemoryTaskService::new("u1");
        service.expire_session_after(1);
        let err = run_cycle(&mut store, &service)
            .await
            .expect_err("snapshot refused");

        assert!(matches!(err, SyncError::Api(ApiError::AuthRequired)));
        assert_eq!(store.pending_count(), 0);
    }
}
