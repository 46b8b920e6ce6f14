use chrono::{
  DateTime,
  Utc
};
use serde::{
  Deserialize,
  Serialize
};

pub const MAX_BULK_TASKS: usize = 100;

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum TaskPriority {
  #[default]
  None,
  Low,
  Medium,
  High
}

impl TaskPriority {
  /// Cycles none → low → medium → high → none.
  pub fn next(self) -> Self {
    match self {
      | Self::None => Self::Low,
      | Self::Low => Self::Medium,
      | Self::Medium => Self::High,
      | Self::High => Self::None
    }
  }

  pub fn is_set(self) -> bool {
    self != Self::None
  }
}

impl TryFrom<u8> for TaskPriority {
  type Error = String;

  fn try_from(
    value: u8
  ) -> Result<Self, Self::Error> {
    match value {
      | 0 => Ok(Self::None),
      | 1 => Ok(Self::Low),
      | 2 => Ok(Self::Medium),
      | 3 => Ok(Self::High),
      | other => Err(format!(
        "priority must be between 0 \
         and 3, got {other}"
      ))
    }
  }
}

impl From<TaskPriority> for u8 {
  fn from(priority: TaskPriority) -> Self {
    match priority {
      | TaskPriority::None => 0,
      | TaskPriority::Low => 1,
      | TaskPriority::Medium => 2,
      | TaskPriority::High => 3
    }
  }
}

/// A task as the task service stores and returns it.
#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct TaskDto {
  pub id:               String,
  pub user_id:          String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub global_id:        Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub number_from_file: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub section:          Option<String>,
  pub task_description: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub responsible:      Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeline:         Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub document_type:    Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub protocol_date:    Option<String>,
  #[serde(default)]
  pub priority:         TaskPriority,
  #[serde(default)]
  pub is_duplicate:     bool,
  #[serde(default)]
  pub is_completed:     bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_date:   Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notes:            Option<String>,
  pub created_date:     DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub updated_at:       Option<DateTime<Utc>>
}

impl TaskDto {
  pub fn from_create(
    id: String,
    user_id: String,
    create: TaskCreate,
    now: DateTime<Utc>
  ) -> Self {
    Self {
      id,
      user_id,
      global_id: create.global_id,
      number_from_file: create
        .number_from_file,
      section: create.section,
      task_description: create
        .task_description,
      responsible: create.responsible,
      timeline: create.timeline,
      document_type: create
        .document_type,
      protocol_date: create
        .protocol_date,
      priority: create.priority,
      is_duplicate: create.is_duplicate,
      is_completed: create.is_completed,
      completed_date: None,
      notes: create.notes,
      created_date: now,
      updated_at: Some(now)
    }
  }

  /// Applies every field present in `patch`; `now` stamps `updatedAt`
  /// and, when a task flips to completed, `completedDate`.
  pub fn apply_patch(
    &mut self,
    patch: &TaskPatch,
    now: DateTime<Utc>
  ) {
    if let Some(description) =
      patch.task_description.as_ref()
    {
      self.task_description =
        description.clone();
    }
    patch.apply_text_fields(
      &mut self.section,
      &mut self.responsible,
      &mut self.timeline,
      &mut self.notes
    );
    if let Some(number) =
      patch.number_from_file.as_ref()
    {
      self.number_from_file =
        number.clone();
    }
    if let Some(kind) =
      patch.document_type.as_ref()
    {
      self.document_type = kind.clone();
    }
    if let Some(date) =
      patch.protocol_date.as_ref()
    {
      self.protocol_date = date.clone();
    }
    if let Some(global_id) =
      patch.global_id
    {
      self.global_id = global_id;
    }
    if let Some(priority) = patch.priority
    {
      self.priority = priority;
    }
    if let Some(duplicate) =
      patch.is_duplicate
    {
      self.is_duplicate = duplicate;
    }
    if let Some(completed) =
      patch.is_completed
    {
      if completed && !self.is_completed {
        self.completed_date = Some(now);
      }
      if !completed {
        self.completed_date = None;
      }
      self.is_completed = completed;
    }
    if let Some(date) = patch.completed_date
    {
      self.completed_date = date;
    }
    self.updated_at = Some(now);
  }
}

#[derive(
  Debug,
  Clone,
  Default,
  Serialize,
  Deserialize,
  PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreate {
  /// Client-chosen identifier; only
  /// honoured by bulk creation.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id:               Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub global_id:        Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub number_from_file: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub section:          Option<String>,
  pub task_description: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub responsible:      Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeline:         Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub document_type:    Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub protocol_date:    Option<String>,
  #[serde(default)]
  pub priority:         TaskPriority,
  #[serde(default)]
  pub is_duplicate:     bool,
  #[serde(default)]
  pub is_completed:     bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notes:            Option<String>
}

impl TaskCreate {
  pub fn new(
    description: impl Into<String>
  ) -> Self {
    Self {
      task_description: description
        .into(),
      ..Self::default()
    }
  }
}

/// Partial update. `Some(None)` on a
/// nullable field clears it; an absent
/// field leaves it untouched.
#[derive(
  Debug,
  Clone,
  Default,
  Serialize,
  Deserialize,
  PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub task_description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
  pub section: Option<Option<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
  pub responsible: Option<Option<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
  pub timeline: Option<Option<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
  pub notes: Option<Option<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
  pub number_from_file: Option<Option<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
  pub document_type: Option<Option<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
  pub protocol_date: Option<Option<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
  pub global_id: Option<Option<u64>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub priority: Option<TaskPriority>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub is_duplicate: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub is_completed: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
  pub completed_date:
    Option<Option<DateTime<Utc>>>
}

impl TaskPatch {
  pub fn is_empty(&self) -> bool {
    self == &Self::default()
  }

  pub fn apply_text_fields(
    &self,
    section: &mut Option<String>,
    responsible: &mut Option<String>,
    timeline: &mut Option<String>,
    notes: &mut Option<String>
  ) {
    if let Some(value) = self.section.as_ref()
    {
      *section = value.clone();
    }
    if let Some(value) =
      self.responsible.as_ref()
    {
      *responsible = value.clone();
    }
    if let Some(value) =
      self.timeline.as_ref()
    {
      *timeline = value.clone();
    }
    if let Some(value) = self.notes.as_ref()
    {
      *notes = value.clone();
    }
  }
}

mod double_option {
  use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    Serializer
  };

  pub fn serialize<S, T>(
    value: &Option<Option<T>>,
    serializer: S
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
    T: Serialize
  {
    match value {
      | Some(inner) => {
        inner.serialize(serializer)
      }
      | None => serializer.serialize_none()
    }
  }

  pub fn deserialize<'de, D, T>(
    deserializer: D
  ) -> Result<Option<Option<T>>, D::Error>
  where
    D: Deserializer<'de>,
    T: Deserialize<'de>
  {
    Option::<T>::deserialize(deserializer)
      .map(Some)
  }
}

#[derive(
  Debug, Clone, Serialize, Deserialize,
)]
pub struct BulkCreateRequest {
  pub tasks: Vec<TaskCreate>
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct StatsDto {
  pub total_tasks:       usize,
  pub completed_tasks:   usize,
  pub prioritized_tasks: usize,
  pub duplicate_tasks:   usize
}

#[derive(
  Debug, Clone, Serialize, Deserialize,
)]
pub struct RegisterRequest {
  pub username: String,
  pub email:    String,
  pub password: String
}

#[derive(
  Debug, Clone, Serialize, Deserialize,
)]
pub struct LoginRequest {
  /// Username or email.
  pub username: String,
  pub password: String
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct UserDto {
  pub id:       String,
  pub username: String,
  pub email:    String
}

#[derive(
  Debug, Clone, Serialize, Deserialize,
)]
pub struct AuthResponse {
  #[serde(default)]
  pub message: String,
  pub token:   String,
  pub user:    UserDto
}

#[derive(
  Debug, Clone, Serialize, Deserialize,
)]
pub struct MessageResponse {
  pub message: String
}

#[derive(
  Debug, Clone, Serialize, Deserialize,
)]
pub struct ErrorBody {
  pub error: String
}

#[derive(
  Debug, Clone, Serialize, Deserialize,
)]
pub struct UploadResponse {
  pub html:     String,
  pub filename: String
}

#[derive(
  Debug, Clone, Serialize, Deserialize,
)]
pub struct SearchQuery {
  pub q: String
}
