use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::schedule::model::{AudioReference, NewSchedule, Schedule, ScheduleId, ScheduleWithAudio};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unable to access schedule file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON at line {line}, column {column}: {message}")]
    Json {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("invalid schedule file: {0}")]
    Invalid(String),

    #[error("schedule {0} not found")]
    NotFound(ScheduleId),
}

/// Durable home of schedules, their audio references and the global alarm
/// toggle. Writes are serialized; the last write for an id wins.
pub trait ScheduleStore: Send + Sync {
    fn insert(&self, schedule: &NewSchedule, audio: &[AudioReference]) -> Result<ScheduleId, StoreError>;

    /// Replaces the time fields of an existing schedule.
    fn update(&self, schedule: &Schedule) -> Result<(), StoreError>;

    /// Removes the schedule and its audio references. Returns false if the
    /// id was not present.
    fn delete(&self, id: ScheduleId) -> Result<bool, StoreError>;

    fn get(&self, id: ScheduleId) -> Result<Option<ScheduleWithAudio>, StoreError>;

    fn get_all_once(&self) -> Result<Vec<ScheduleWithAudio>, StoreError>;

    /// Stream of full snapshots: the current one immediately, then one per
    /// committed change.
    fn watch(&self) -> ScheduleWatch;

    fn alarms_enabled(&self) -> Result<bool, StoreError>;

    fn set_alarms_enabled(&self, enabled: bool) -> Result<(), StoreError>;
}

pub struct ScheduleWatch {
    receiver: Receiver<Vec<ScheduleWithAudio>>,
}

impl ScheduleWatch {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Vec<ScheduleWithAudio>, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drains pending snapshots and returns the newest one, if any.
    pub fn latest(&self) -> Option<Vec<ScheduleWithAudio>> {
        self.receiver.try_iter().last()
    }
}

#[derive(Debug, Clone)]
struct StoreState {
    next_id: u64,
    settings: StoreSettings,
    schedules: Vec<ScheduleWithAudio>,
}

#[derive(Debug, Clone, Serialize)]
struct StoreSettings {
    alarms_enabled: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            alarms_enabled: true,
        }
    }
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            next_id: 1,
            settings: StoreSettings::default(),
            schedules: Vec::new(),
        }
    }
}

/// JSON-file store. Without a path it keeps everything in memory.
pub struct JsonScheduleStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
    watchers: Mutex<Vec<Sender<Vec<ScheduleWithAudio>>>>,
}

impl JsonScheduleStore {
    /// Opens the store at `path`; a missing file is treated as an empty store
    /// and created on the first write.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let state = match fs::read_to_string(path) {
            Ok(content) => parse_store_text(&content)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => StoreState::default(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
            watchers: Mutex::new(Vec::new()),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::default()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies `change` to a copy of the state, persists it, then commits and
    /// notifies watchers. The state lock is held throughout so writes land in
    /// invocation order.
    fn write<T>(&self, change: impl FnOnce(&mut StoreState) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut guard = self.lock_state();
        let mut next = guard.clone();
        let value = change(&mut next)?;
        if let Some(path) = &self.path {
            save_store(path, &next)?;
        }
        *guard = next;
        self.notify(&guard.schedules);
        Ok(value)
    }

    fn notify(&self, schedules: &[ScheduleWithAudio]) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        watchers.retain(|sender| sender.send(schedules.to_vec()).is_ok());
        debug!(watchers = watchers.len(), "schedule snapshot published");
    }
}

impl ScheduleStore for JsonScheduleStore {
    fn insert(&self, schedule: &NewSchedule, audio: &[AudioReference]) -> Result<ScheduleId, StoreError> {
        if schedule.repeat_interval_ms == 0 {
            return Err(StoreError::Invalid("repeat_interval_ms must be > 0".to_string()));
        }
        if audio.is_empty() {
            return Err(StoreError::Invalid("a schedule needs at least one audio file".to_string()));
        }
        self.write(|state| {
            let id = ScheduleId(state.next_id);
            state.next_id += 1;
            state.schedules.push(ScheduleWithAudio {
                schedule: Schedule::new(id, schedule.trigger_time_ms, schedule.repeat_interval_ms),
                audio: audio.to_vec(),
            });
            Ok(id)
        })
    }

    fn update(&self, schedule: &Schedule) -> Result<(), StoreError> {
        self.write(|state| {
            let entry = state
                .schedules
                .iter_mut()
                .find(|entry| entry.schedule.id == schedule.id)
                .ok_or(StoreError::NotFound(schedule.id))?;
            entry.schedule = schedule.clone();
            Ok(())
        })
    }

    fn delete(&self, id: ScheduleId) -> Result<bool, StoreError> {
        if self.get(id)?.is_none() {
            return Ok(false);
        }
        self.write(|state| {
            let before = state.schedules.len();
            state.schedules.retain(|entry| entry.schedule.id != id);
            Ok(state.schedules.len() != before)
        })
    }

    fn get(&self, id: ScheduleId) -> Result<Option<ScheduleWithAudio>, StoreError> {
        let guard = self.lock_state();
        Ok(guard.schedules.iter().find(|entry| entry.schedule.id == id).cloned())
    }

    fn get_all_once(&self) -> Result<Vec<ScheduleWithAudio>, StoreError> {
        Ok(self.lock_state().schedules.clone())
    }

    fn watch(&self) -> ScheduleWatch {
        let (sender, receiver) = mpsc::channel();
        let guard = self.lock_state();
        let _ = sender.send(guard.schedules.clone());
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sender);
        drop(guard);
        ScheduleWatch { receiver }
    }

    fn alarms_enabled(&self) -> Result<bool, StoreError> {
        Ok(self.lock_state().settings.alarms_enabled)
    }

    fn set_alarms_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.write(|state| {
            state.settings.alarms_enabled = enabled;
            Ok(())
        })
    }
}

fn parse_store_text(content: &str) -> Result<StoreState, StoreError> {
    let raw = serde_json::from_str::<StoreFile>(content).map_err(|err| StoreError::Json {
        line: err.line(),
        column: err.column(),
        message: err.to_string(),
    })?;

    if raw.version != STORE_VERSION {
        return Err(StoreError::Invalid(format!(
            "unsupported schedule file version {}; expected version {STORE_VERSION}",
            raw.version
        )));
    }

    let mut ids = HashSet::new();
    let mut schedules = Vec::with_capacity(raw.schedules.len());
    for entry in raw.schedules {
        if entry.id == 0 {
            return Err(StoreError::Invalid("schedule id 0 is reserved".to_string()));
        }
        if !ids.insert(entry.id) {
            return Err(StoreError::Invalid(format!("duplicate schedule id found: {}", entry.id)));
        }
        if entry.repeat_interval_ms == 0 {
            return Err(StoreError::Invalid(format!(
                "schedule {} must have repeat_interval_ms > 0",
                entry.id
            )));
        }
        if entry.audio.is_empty() {
            return Err(StoreError::Invalid(format!(
                "schedule {} must include at least one audio file",
                entry.id
            )));
        }
        schedules.push(ScheduleWithAudio {
            schedule: Schedule::new(ScheduleId(entry.id), entry.trigger_time_ms, entry.repeat_interval_ms),
            audio: entry.audio,
        });
    }

    let highest = ids.iter().copied().max().unwrap_or(0);
    Ok(StoreState {
        next_id: raw.next_id.max(highest + 1),
        settings: StoreSettings {
            alarms_enabled: raw.settings.alarms_enabled,
        },
        schedules,
    })
}

fn save_store(path: &Path, state: &StoreState) -> Result<(), StoreError> {
    let schedules = state
        .schedules
        .iter()
        .map(|entry| ScheduleFile {
            id: entry.schedule.id.0,
            trigger_time_ms: entry.schedule.trigger_time_ms,
            repeat_interval_ms: entry.schedule.repeat_interval_ms,
            audio: entry.audio.clone(),
        })
        .collect::<Vec<_>>();
    let payload = json!({
        "version": STORE_VERSION,
        "next_id": state.next_id,
        "settings": state.settings,
        "schedules": schedules,
    });
    let text = serde_json::to_string_pretty(&payload).map_err(|err| StoreError::Invalid(err.to_string()))?;
    fs::write(path, format!("{text}\n")).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default = "default_next_id")]
    next_id: u64,
    #[serde(default)]
    settings: StoreSettingsFile,
    #[serde(default)]
    schedules: Vec<ScheduleFile>,
}

#[derive(Debug, Deserialize)]
struct StoreSettingsFile {
    #[serde(default = "default_alarms_enabled")]
    alarms_enabled: bool,
}

impl Default for StoreSettingsFile {
    fn default() -> Self {
        Self {
            alarms_enabled: default_alarms_enabled(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ScheduleFile {
    id: u64,
    trigger_time_ms: i64,
    repeat_interval_ms: u64,
    audio: Vec<AudioReference>,
}

fn default_next_id() -> u64 {
    1
}

fn default_alarms_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::model::{DAILY_MS, HOUR_MS};

    fn audio(name: &str) -> Vec<AudioReference> {
        vec![AudioReference::from_path(format!("/clips/{name}.wav"))]
    }

    fn new_schedule(trigger_time_ms: i64, repeat_interval_ms: u64) -> NewSchedule {
        NewSchedule {
            trigger_time_ms,
            repeat_interval_ms,
        }
    }

    #[test]
    fn parses_valid_store_file() {
        let json = r#"
{
  "version": 1,
  "next_id": 9,
  "settings": { "alarms_enabled": false },
  "schedules": [
    {
      "id": 3,
      "trigger_time_ms": 1700000000000,
      "repeat_interval_ms": 86400000,
      "audio": [
        { "file_path": "/clips/a.wav", "display_name": "a.wav" },
        { "file_path": "/clips/b.wav", "display_name": "b.wav" }
      ]
    }
  ]
}
"#;
        let state = parse_store_text(json).expect("valid store");
        assert_eq!(state.next_id, 9);
        assert!(!state.settings.alarms_enabled);
        assert_eq!(state.schedules.len(), 1);
        assert_eq!(state.schedules[0].schedule.repeat_interval_ms, DAILY_MS);
        assert_eq!(state.schedules[0].audio_paths(), vec!["/clips/a.wav", "/clips/b.wav"]);
    }

    #[test]
    fn missing_settings_default_to_enabled() {
        let state = parse_store_text(r#"{ "version": 1 }"#).expect("valid store");
        assert!(state.settings.alarms_enabled);
        assert_eq!(state.next_id, 1);
        assert!(state.schedules.is_empty());
    }

    #[test]
    fn rejects_malformed_json_with_position() {
        let err = parse_store_text("{ not-json ").err().expect("malformed JSON should fail");
        assert!(err.to_string().contains("invalid JSON at line 1"));
    }

    #[test]
    fn rejects_duplicate_ids_and_zero_interval() {
        let duplicate = r#"
{ "version": 1, "schedules": [
  { "id": 1, "trigger_time_ms": 0, "repeat_interval_ms": 60000, "audio": [ { "file_path": "a", "display_name": "a" } ] },
  { "id": 1, "trigger_time_ms": 0, "repeat_interval_ms": 120000, "audio": [ { "file_path": "b", "display_name": "b" } ] }
] }"#;
        let err = parse_store_text(duplicate).err().expect("duplicate ids should fail");
        assert!(err.to_string().contains("duplicate schedule id"));

        let zero = r#"
{ "version": 1, "schedules": [
  { "id": 1, "trigger_time_ms": 0, "repeat_interval_ms": 0, "audio": [ { "file_path": "a", "display_name": "a" } ] }
] }"#;
        let err = parse_store_text(zero).err().expect("zero interval should fail");
        assert!(err.to_string().contains("repeat_interval_ms > 0"));
    }

    #[test]
    fn rejects_unknown_version() {
        let err = parse_store_text(r#"{ "version": 2 }"#).err().expect("version 2 should fail");
        assert!(err.to_string().contains("unsupported schedule file version 2"));
    }

    #[test]
    fn next_id_is_kept_above_existing_ids() {
        let json = r#"
{ "version": 1, "next_id": 1, "schedules": [
  { "id": 5, "trigger_time_ms": 0, "repeat_interval_ms": 60000, "audio": [ { "file_path": "a", "display_name": "a" } ] }
] }"#;
        assert_eq!(parse_store_text(json).expect("valid").next_id, 6);
    }

    #[test]
    fn writes_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("schedules.json");

        let store = JsonScheduleStore::open(&path).expect("open empty");
        let first = store.insert(&new_schedule(1_000, HOUR_MS), &audio("a")).expect("insert");
        let second = store.insert(&new_schedule(2_000, DAILY_MS), &audio("b")).expect("insert");
        assert_ne!(first, second);
        store
            .update(&Schedule::new(first, 5_000, HOUR_MS))
            .expect("update");
        assert!(store.delete(second).expect("delete"));
        store.set_alarms_enabled(false).expect("toggle");

        let reopened = JsonScheduleStore::open(&path).expect("reopen");
        let all = reopened.get_all_once().expect("all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].schedule, Schedule::new(first, 5_000, HOUR_MS));
        assert!(!reopened.alarms_enabled().expect("settings"));

        let third = reopened.insert(&new_schedule(3_000, HOUR_MS), &audio("c")).expect("insert");
        assert!(third.0 > second.0);
    }

    #[test]
    fn update_of_unknown_id_is_not_found() {
        let store = JsonScheduleStore::in_memory();
        let err = store
            .update(&Schedule::new(ScheduleId(42), 0, HOUR_MS))
            .err()
            .expect("unknown id");
        assert!(matches!(err, StoreError::NotFound(ScheduleId(42))));
    }

    #[test]
    fn deleting_twice_reports_absence() {
        let store = JsonScheduleStore::in_memory();
        let id = store.insert(&new_schedule(0, HOUR_MS), &audio("a")).expect("insert");
        assert!(store.delete(id).expect("delete"));
        assert!(!store.delete(id).expect("second delete"));
    }

    #[test]
    fn insert_rejects_empty_audio() {
        let store = JsonScheduleStore::in_memory();
        let err = store.insert(&new_schedule(0, HOUR_MS), &[]).err().expect("empty audio");
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn watch_emits_current_snapshot_then_changes() {
        let store = JsonScheduleStore::in_memory();
        let watch = store.watch();
        assert_eq!(watch.recv_timeout(Duration::from_secs(1)).expect("initial").len(), 0);

        let id = store.insert(&new_schedule(0, HOUR_MS), &audio("a")).expect("insert");
        let snapshot = watch.recv_timeout(Duration::from_secs(1)).expect("after insert");
        assert_eq!(snapshot[0].schedule.id, id);

        store.delete(id).expect("delete");
        assert_eq!(watch.latest().expect("after delete").len(), 0);
    }
}
