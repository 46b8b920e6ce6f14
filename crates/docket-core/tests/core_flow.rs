use chrono::Utc;
use docket_core::datastore::LocalStore;
use docket_core::duplicates::{DuplicateKey, compute_stats, mark_duplicates};
use docket_core::gateway::Gateway;
use docket_core::memory::MemoryTaskService;
use docket_core::task::{SyncStatus, Task};
use docket_shared::{LoginRequest, TaskPatch, TaskPriority};
use tempfile::tempdir;

#[tokio::test]
async fn offline_session_survives_restart_and_syncs() {
    let temp = tempdir().expect("tempdir");

    {
        let mut gw = Gateway::initialize(MemoryTaskService::new("u1"), temp.path())
            .await
            .expect("initialize");
        gw.login(&LoginRequest {
            username: "u1".to_string(),
            password: "Secret1".to_string(),
        })
        .await
        .expect("login");
        gw.go_offline();

        let kept = gw
            .create_task(Task::draft("Prepare budget draft", Utc::now()))
            .await
            .expect("offline create");
        gw.update_task(
            &kept.id,
            TaskPatch {
                priority: Some(TaskPriority::High),
                ..TaskPatch::default()
            },
        )
        .await
        .expect("offline update");

        let dropped = gw
            .create_task(Task::draft("Scratch", Utc::now()))
            .await
            .expect("offline create");
        gw.delete_task(&dropped.id).await.expect("offline delete");

        assert_eq!(gw.store().pending_count(), 4);
    }

    // A fresh process sees the same queue; the service here is a new, empty
    // server.
    let reopened = LocalStore::open(temp.path()).expect("reopen store");
    assert_eq!(reopened.pending_count(), 4);
    drop(reopened);

    let mut gw = Gateway::initialize(MemoryTaskService::new("u1"), temp.path())
        .await
        .expect("reinitialize");
    assert!(!gw.is_online());

    let report = gw.go_online().await.expect("online").expect("sync ran");
    assert_eq!(report.replayed, 4);
    assert!(report.is_clean());

    let remote = gw.service().snapshot();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].task_description, "Prepare budget draft");
    assert_eq!(remote[0].priority, TaskPriority::High);

    let local = gw.get_tasks().await.expect("tasks");
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].id, remote[0].id);
    assert_eq!(local[0].sync_status, SyncStatus::Synced);
    assert_eq!(gw.store().pending_count(), 0);
}

#[test]
fn stats_over_local_cache() {
    let now = Utc::now();
    let mut tasks = vec![
        Task::draft("Call the auditor", now),
        Task::draft("call the  auditor", now),
        Task::draft("Sign lease", now),
    ];
    tasks[2].is_completed = true;
    tasks[0].priority = TaskPriority::Low;

    assert_eq!(mark_duplicates(&mut tasks, DuplicateKey::Description), 1);
    let stats = compute_stats(&tasks);
    assert_eq!(stats.total_tasks, 3);
    assert_eq!(stats.completed_tasks, 1);
    assert_eq!(stats.prioritized_tasks, 1);
    assert_eq!(stats.duplicate_tasks, 1);
}
