use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use docket_shared::{TaskCreate, TaskDto, TaskPatch, TaskPriority};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Written locally, not yet confirmed by a server snapshot.
    #[default]
    Pending,
    Synced,
    /// Was pending, but the snapshot taken after draining the queue no longer
    /// contains it.
    Conflict,
}

/// A task as held in the local store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,

    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub global_id: Option<u64>,

    #[serde(default)]
    pub number_from_file: Option<String>,

    #[serde(default)]
    pub section: Option<String>,

    pub task_description: String,

    #[serde(default)]
    pub responsible: Option<String>,

    #[serde(default)]
    pub timeline: Option<String>,

    #[serde(default)]
    pub document_type: Option<String>,

    #[serde(default)]
    pub protocol_date: Option<String>,

    #[serde(default)]
    pub priority: TaskPriority,

    #[serde(default)]
    pub is_duplicate: bool,

    #[serde(default)]
    pub is_completed: bool,

    #[serde(default)]
    pub completed_date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub notes: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub sync_status: SyncStatus,

    #[serde(default)]
    pub local_only: bool,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Task {
    /// A fresh local draft; the store fills in id, owner and timestamps.
    pub fn draft(description: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: String::new(),
            user_id: None,
            global_id: None,
            number_from_file: None,
            section: None,
            task_description: description.into(),
            responsible: None,
            timeline: None,
            document_type: None,
            protocol_date: None,
            priority: TaskPriority::None,
            is_duplicate: false,
            is_completed: false,
            completed_date: None,
            notes: None,
            created_at: now,
            updated_at: now,
            sync_status: SyncStatus::Pending,
            local_only: false,
            extra: BTreeMap::new(),
        }
    }

    pub fn from_create(create: TaskCreate, now: DateTime<Utc>) -> Self {
        let mut task = Self::draft(create.task_description, now);
        task.id = create.id.unwrap_or_default();
        task.global_id = create.global_id;
        task.number_from_file = create.number_from_file;
        task.section = create.section;
        task.responsible = create.responsible;
        task.timeline = create.timeline;
        task.document_type = create.document_type;
        task.protocol_date = create.protocol_date;
        task.priority = create.priority;
        task.is_duplicate = create.is_duplicate;
        task.is_completed = create.is_completed;
        task.notes = create.notes;
        task
    }

    /// Converts a server record; the result is `synced`.
    pub fn from_remote(dto: TaskDto) -> Self {
        let updated_at = dto.updated_at.unwrap_or(dto.created_date);
        Self {
            id: dto.id,
            user_id: Some(dto.user_id),
            global_id: dto.global_id,
            number_from_file: dto.number_from_file,
            section: dto.section,
            task_description: dto.task_description,
            responsible: dto.responsible,
            timeline: dto.timeline,
            document_type: dto.document_type,
            protocol_date: dto.protocol_date,
            priority: dto.priority,
            is_duplicate: dto.is_duplicate,
            is_completed: dto.is_completed,
            completed_date: dto.completed_date,
            notes: dto.notes,
            created_at: dto.created_date,
            updated_at,
            sync_status: SyncStatus::Synced,
            local_only: false,
            extra: BTreeMap::new(),
        }
    }

    /// The payload used to replay this task's creation remotely. The local id
    /// is deliberately not sent; the server assigns its own.
    pub fn to_create(&self) -> TaskCreate {
        TaskCreate {
            id: None,
            global_id: self.global_id,
            number_from_file: self.number_from_file.clone(),
            section: self.section.clone(),
            task_description: self.task_description.clone(),
            responsible: self.responsible.clone(),
            timeline: self.timeline.clone(),
            document_type: self.document_type.clone(),
            protocol_date: self.protocol_date.clone(),
            priority: self.priority,
            is_duplicate: self.is_duplicate,
            is_completed: self.is_completed,
            notes: self.notes.clone(),
        }
    }

    pub fn apply_patch(&mut self, patch: &TaskPatch, now: DateTime<Utc>) {
        if let Some(description) = patch.task_description.as_ref() {
            self.task_description = description.clone();
        }
        patch.apply_text_fields(
            &mut self.section,
            &mut self.responsible,
            &mut self.timeline,
            &mut self.notes,
        );
        if let Some(number) = patch.number_from_file.as_ref() {
            self.number_from_file = number.clone();
        }
        if let Some(kind) = patch.document_type.as_ref() {
            self.document_type = kind.clone();
        }
        if let Some(date) = patch.protocol_date.as_ref() {
            self.protocol_date = date.clone();
        }
        if let Some(global_id) = patch.global_id {
            self.global_id = global_id;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(duplicate) = patch.is_duplicate {
            self.is_duplicate = duplicate;
        }
        if let Some(completed) = patch.is_completed {
            if completed && !self.is_completed {
                self.completed_date = Some(now);
            }
            if !completed {
                self.completed_date = None;
            }
            self.is_completed = completed;
        }
        if let Some(date) = patch.completed_date {
            self.completed_date = date;
        }
        self.updated_at = now;
    }

    pub fn is_local_id(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn mark_pending(&mut self) {
        self.sync_status = SyncStatus::Pending;
    }

    pub fn mark_conflict(&mut self) {
        self.sync_status = SyncStatus::Conflict;
    }
}

pub fn new_local_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use docket_shared::{TaskCreate, TaskDto, TaskPatch, TaskPriority};

    use super::{SyncStatus, Task};

    #[test]
    fn remote_records_arrive_synced_and_round_trip_to_create() {
        let now = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).single().expect("valid timestamp");
        let mut create = TaskCreate::new("Prepare minutes");
        create.section = Some("Board".to_string());
        create.priority = TaskPriority::Low;
        let dto = TaskDto::from_create("srv-1".to_string(), "u1".to_string(), create.clone(), now);

        let task = Task::from_remote(dto);
        assert_eq!(task.sync_status, SyncStatus::Synced);
        assert_eq!(task.user_id.as_deref(), Some("u1"));
        assert_eq!(task.to_create(), create);
    }

    #[test]
    fn patch_clears_nullable_fields_and_restamps() {
        let created = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).single().expect("valid timestamp");
        let later = Utc.with_ymd_and_hms(2026, 4, 2, 8, 0, 0).single().expect("valid timestamp");
        let mut task = Task::draft("Call vendor", created);
        task.section = Some("Ops".to_string());

        let patch = TaskPatch {
            section: Some(None),
            priority: Some(TaskPriority::High),
            ..TaskPatch::default()
        };
        task.apply_patch(&patch, later);

        assert_eq!(task.section, None);
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.updated_at, later);
        assert_eq!(task.created_at, created);
    }
}
