use std::fmt;
use std::path::Path;

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

pub const MINUTE_MS: u64 = 60_000;
pub const HOUR_MS: u64 = 60 * MINUTE_MS;
/// Sentinel interval meaning "daily".
pub const DAILY_MS: u64 = 24 * HOUR_MS;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub u64);

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A recurring playback schedule. `repeat_interval_ms` is always > 0 once
/// the schedule has been accepted by the store.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub trigger_time_ms: i64,
    pub repeat_interval_ms: u64,
}

impl Schedule {
    pub fn new(id: ScheduleId, trigger_time_ms: i64, repeat_interval_ms: u64) -> Self {
        Self {
            id,
            trigger_time_ms,
            repeat_interval_ms,
        }
    }

    pub fn with_trigger_time(&self, trigger_time_ms: i64) -> Self {
        Self {
            trigger_time_ms,
            ..self.clone()
        }
    }
}

/// A schedule that has not been persisted yet, so it has no id.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewSchedule {
    pub trigger_time_ms: i64,
    pub repeat_interval_ms: u64,
}

impl NewSchedule {
    /// Candidate view used by the overlap check before an id is assigned.
    /// Id 0 is never handed out by the store.
    pub fn as_candidate(&self) -> Schedule {
        Schedule::new(ScheduleId(0), self.trigger_time_ms, self.repeat_interval_ms)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AudioReference {
    pub file_path: String,
    pub display_name: String,
}

impl AudioReference {
    pub fn from_path(file_path: impl Into<String>) -> Self {
        let file_path = file_path.into();
        let display_name = Path::new(&file_path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.clone());
        Self {
            file_path,
            display_name,
        }
    }

    pub fn exists(&self) -> bool {
        Path::new(&self.file_path).is_file()
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ScheduleWithAudio {
    pub schedule: Schedule,
    pub audio: Vec<AudioReference>,
}

impl ScheduleWithAudio {
    pub fn audio_paths(&self) -> Vec<String> {
        self.audio.iter().map(|audio| audio.file_path.clone()).collect()
    }

    pub fn all_audio_missing(&self) -> bool {
        self.audio.iter().all(|audio| !audio.exists())
    }

    pub fn references_path(&self, path: &str) -> bool {
        self.audio.iter().any(|audio| audio.file_path == path)
    }
}

/// Builds an "every N hours M minutes" interval. Zero is rejected.
pub fn every(hours: u64, minutes: u64) -> Option<u64> {
    let total = hours.checked_mul(HOUR_MS)?.checked_add(minutes.checked_mul(MINUTE_MS)?)?;
    (total > 0).then_some(total)
}

pub fn interval_label(repeat_interval_ms: u64) -> String {
    if repeat_interval_ms == DAILY_MS {
        return "Daily".to_string();
    }
    if repeat_interval_ms % HOUR_MS == 0 {
        return format!("Every {}h", repeat_interval_ms / HOUR_MS);
    }
    let total_minutes = repeat_interval_ms / MINUTE_MS;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if hours > 0 {
        format!("Every {hours}h {minutes}m")
    } else {
        format!("Every {minutes}m")
    }
}

/// First whole minute strictly after `now_ms`, so a default start is never
/// already due when the schedule is created.
pub fn first_trigger_at(now_ms: i64) -> i64 {
    let minute = MINUTE_MS as i64;
    now_ms - now_ms.rem_euclid(minute) + minute
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TimeDisplayMode {
    Hour24,
    Hour12,
}

pub fn format_trigger_time(trigger_time_ms: i64, mode: TimeDisplayMode) -> String {
    match Local.timestamp_millis_opt(trigger_time_ms).single() {
        Some(dt) => format_datetime(&dt, mode),
        None => "-".to_string(),
    }
}

fn format_datetime(dt: &DateTime<Local>, mode: TimeDisplayMode) -> String {
    match mode {
        TimeDisplayMode::Hour24 => format!(
            "{:04}-{:02}-{:02} {:02}:{:02}",
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour(),
            dt.minute()
        ),
        TimeDisplayMode::Hour12 => {
            let (is_pm, hour12) = dt.hour12();
            let meridiem = if is_pm { "PM" } else { "AM" };
            format!(
                "{:04}-{:02}-{:02} {:02}:{:02} {}",
                dt.year(),
                dt.month(),
                dt.day(),
                hour12,
                dt.minute(),
                meridiem
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_labels_match_picker_wording() {
        assert_eq!(interval_label(DAILY_MS), "Daily");
        assert_eq!(interval_label(2 * HOUR_MS), "Every 2h");
        assert_eq!(interval_label(90 * MINUTE_MS), "Every 1h 30m");
        assert_eq!(interval_label(15 * MINUTE_MS), "Every 15m");
    }

    #[test]
    fn every_rejects_zero_interval() {
        assert_eq!(every(0, 0), None);
        assert_eq!(every(1, 30), Some(90 * MINUTE_MS));
        assert_eq!(every(0, 1), Some(MINUTE_MS));
    }

    #[test]
    fn first_trigger_is_the_next_whole_minute() {
        assert_eq!(first_trigger_at(120_000), 180_000);
        assert_eq!(first_trigger_at(120_001), 180_000);
        assert_eq!(first_trigger_at(179_999), 180_000);
    }

    #[test]
    fn display_name_is_file_name() {
        let audio = AudioReference::from_path("/music/SelfTalker/morning.wav");
        assert_eq!(audio.display_name, "morning.wav");
        assert!(!audio.exists());
    }

    #[test]
    fn all_audio_missing_requires_every_file_gone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let present = dir.path().join("present.wav");
        std::fs::write(&present, b"x").expect("write");
        let mut entry = ScheduleWithAudio {
            schedule: Schedule::new(ScheduleId(1), 0, DAILY_MS),
            audio: vec![
                AudioReference::from_path(dir.path().join("gone.wav").display().to_string()),
                AudioReference::from_path(present.display().to_string()),
            ],
        };
        assert!(!entry.all_audio_missing());
        entry.audio.pop();
        assert!(entry.all_audio_missing());
    }
}
