//! Small key-value entries that live beside the task store: user settings,
//! the auth session, sync bookkeeping and the last UI state.
//!
//! Reads are best-effort. A missing or unreadable entry is treated as absent
//! and logged, never surfaced as an error.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Duration, Utc};
use docket_shared::UserDto;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const KV_DIR: &str = "kv";
const SETTINGS_KEY: &str = "userSettings";
const AUTH_KEY: &str = "authSession";
const APP_STATE_KEY: &str = "appState";
const UI_STATE_KEY: &str = "appFullState";

/// UI state older than this is discarded instead of restored.
pub const UI_STATE_MAX_AGE_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    pub theme: String,
    pub language: String,
    pub notifications: bool,
    pub auto_sync: bool,
    /// Forces offline mode regardless of connectivity.
    pub offline_mode: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            theme: "light".to_string(),
            language: "he".to_string(),
            notifications: true,
            auto_sync: true,
            offline_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSession {
    pub token: String,
    pub user: UserDto,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub last_sync: Option<DateTime<Utc>>,
    pub offline_changes: usize,
    pub current_filter: String,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            last_sync: None,
            offline_changes: 0,
            current_filter: "all".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ScrollPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub timestamp: DateTime<Utc>,
    pub current_view: String,
    pub current_filter: String,
    #[serde(default)]
    pub search_query: String,
    pub sort_by: String,
    #[serde(default)]
    pub expanded_tasks: Vec<String>,
    #[serde(default)]
    pub scroll_position: ScrollPosition,
    #[serde(default)]
    pub sidebar_open: bool,
    #[serde(default)]
    pub last_task_viewed: Option<String>,
    #[serde(default)]
    pub unsaved_changes: BTreeMap<String, String>,
}

impl UiState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now,
            current_view: "list".to_string(),
            current_filter: "all".to_string(),
            search_query: String::new(),
            sort_by: "date".to_string(),
            expanded_tasks: vec![],
            scroll_position: ScrollPosition::default(),
            sidebar_open: false,
            last_task_viewed: None,
            unsaved_changes: BTreeMap::new(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.timestamp > Duration::hours(UI_STATE_MAX_AGE_HOURS)
    }
}

/// One JSON file per key under `<data_dir>/kv`.
#[derive(Debug, Clone)]
pub struct KvStore {
    dir: PathBuf,
}

impl KvStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let dir = data_dir.join(KV_DIR);
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn get_item<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.path_for(key).ok()?;
        if !path.exists() {
            return None;
        }
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(key, error = %err, "failed reading key-value entry");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "discarding unreadable key-value entry");
                None
            }
        }
    }

    #[tracing::instrument(skip(self, value))]
    pub fn set_item<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut temp, value)?;
        temp.flush()?;
        temp.persist(&path)
            .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;
        debug!(key, "stored key-value entry");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn remove_item(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed removing {}", path.display()))?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn clear(&self) -> anyhow::Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(&path)
                    .with_context(|| format!("failed removing {}", path.display()))?;
            }
        }
        Ok(())
    }

    fn path_for(&self, key: &str) -> anyhow::Result<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
        {
            return Err(anyhow!("invalid key-value key: {key:?}"));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

/// Typed accessors over [`KvStore`].
#[derive(Debug, Clone)]
pub struct SessionStore {
    kv: KvStore,
}

impl SessionStore {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            kv: KvStore::open(data_dir)?,
        })
    }

    pub fn settings(&self) -> UserSettings {
        self.kv.get_item(SETTINGS_KEY).unwrap_or_default()
    }

    pub fn save_settings(&self, settings: &UserSettings) -> anyhow::Result<()> {
        self.kv.set_item(SETTINGS_KEY, settings)
    }

    pub fn auth(&self) -> Option<AuthSession> {
        self.kv.get_item(AUTH_KEY)
    }

    pub fn save_auth(&self, session: &AuthSession) -> anyhow::Result<()> {
        self.kv.set_item(AUTH_KEY, session)
    }

    pub fn clear_auth(&self) -> anyhow::Result<()> {
        self.kv.remove_item(AUTH_KEY)
    }

    pub fn app_state(&self) -> AppState {
        self.kv.get_item(APP_STATE_KEY).unwrap_or_default()
    }

    pub fn save_app_state(&self, state: &AppState) -> anyhow::Result<()> {
        self.kv.set_item(APP_STATE_KEY, state)
    }

    pub fn save_ui_state(&self, state: &UiState) -> anyhow::Result<()> {
        self.kv.set_item(UI_STATE_KEY, state)
    }

    /// Returns the saved UI state unless it is older than
    /// [`UI_STATE_MAX_AGE_HOURS`], in which case it is deleted.
    #[tracing::instrument(skip(self, now))]
    pub fn restore_ui_state(&self, now: DateTime<Utc>) -> Option<UiState> {
        let state: UiState = self.kv.get_item(UI_STATE_KEY)?;
        if state.is_expired(now) {
            debug!(saved_at = %state.timestamp, "discarding stale ui state");
            if let Err(err) = self.kv.remove_item(UI_STATE_KEY) {
                warn!(error = %err, "failed removing stale ui state");
            }
            return None;
        }
        Some(state)
    }

    /// Drops every saved key: session, settings and bookkeeping.
    pub fn clear_all(&self) -> anyhow::Result<()> {
        self.kv.clear()
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    use super::{SessionStore, UiState, UserSettings};

    #[test]
    fn settings_fall_back_to_defaults() {
        let temp = tempdir().expect("tempdir");
        let session = SessionStore::open(temp.path()).expect("open");
        assert_eq!(session.settings(), UserSettings::default());

        let mut settings = UserSettings::default();
        settings.offline_mode = true;
        session.save_settings(&settings).expect("save");
        assert!(session.settings().offline_mode);
    }

    #[test]
    fn ui_state_older_than_a_day_is_discarded() {
        let temp = tempdir().expect("tempdir");
        let session = SessionStore::open(temp.path()).expect("open");
        let now = Utc::now();

        let mut state = UiState::new(now - Duration::hours(25));
        state.search_query = "budget".to_string();
        session.save_ui_state(&state).expect("save");

        assert!(session.restore_ui_state(now).is_none());
        assert!(session.restore_ui_state(now - Duration::hours(2)).is_none());
    }

    #[test]
    fn fresh_ui_state_is_restored() {
        let temp = tempdir().expect("tempdir");
        let session = SessionStore::open(temp.path()).expect("open");
        let now = Utc::now();
        let mut state = UiState::new(now - Duration::hours(3));
        state.expanded_tasks = vec!["t1".to_string()];
        session.save_ui_state(&state).expect("save");

        assert_eq!(session.restore_ui_state(now), Some(state));
    }

    #[test]
    fn corrupt_entries_read_as_absent() {
        let temp = tempdir().expect("tempdir");
        let session = SessionStore::open(temp.path()).expect("open");
        std::fs::write(temp.path().join("kv").join("authSession.json"), "{not json")
            .expect("write garbage");
        assert!(session.auth().is_none());
        assert!(session.kv().set_item("bad key", &1).is_err());
    }

    #[test]
    fn clear_all_forgets_every_key() {
        let temp = tempdir().expect("tempdir");
        let session = SessionStore::open(temp.path()).expect("open");
        let mut settings = UserSettings::default();
        settings.offline_mode = true;
        session.save_settings(&settings).expect("save settings");
        session
            .save_ui_state(&UiState::new(Utc::now()))
            .expect("save ui state");
        std::fs::write(temp.path().join("kv").join("notes.txt"), "keep").expect("write");

        session.clear_all().expect("clear");

        assert_eq!(session.settings(), UserSettings::default());
        assert!(session.restore_ui_state(Utc::now()).is_none());
        assert!(temp.path().join("kv").join("notes.txt").exists());
    }
}
