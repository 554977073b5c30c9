use anyhow::Result;

use crate::schedule::conflict::will_overlap;
use crate::schedule::model::{Schedule, ScheduleWithAudio, TimeDisplayMode, format_trigger_time, interval_label};
use crate::schedule::reconcile::next_trigger;
use crate::schedule::store::{JsonScheduleStore, ScheduleStore};

pub struct ScheduleReport {
    pub id: u64,
    pub interval: String,
    pub stored_trigger_ms: i64,
    pub next_trigger_ms: i64,
    pub missing_audio: Vec<String>,
    pub audio_count: usize,
    /// Fires at the same instant as another schedule at least once.
    pub overlaps: bool,
}

impl ScheduleReport {
    fn from_entry(entry: &ScheduleWithAudio, all: &[Schedule], now_ms: i64) -> Self {
        Self {
            id: entry.schedule.id.0,
            interval: interval_label(entry.schedule.repeat_interval_ms),
            stored_trigger_ms: entry.schedule.trigger_time_ms,
            next_trigger_ms: next_trigger(&entry.schedule, now_ms).trigger_time_ms,
            missing_audio: entry
                .audio
                .iter()
                .filter(|audio| !audio.exists())
                .map(|audio| audio.file_path.clone())
                .collect(),
            audio_count: entry.audio.len(),
            overlaps: will_overlap(&entry.schedule, all),
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stored_trigger_ms != self.next_trigger_ms
    }

    /// Would be deleted on the next startup or trigger.
    pub fn is_unplayable(&self) -> bool {
        self.missing_audio.len() == self.audio_count
    }
}

pub fn build_reports(entries: &[ScheduleWithAudio], now_ms: i64) -> Vec<ScheduleReport> {
    let all = entries.iter().map(|entry| entry.schedule.clone()).collect::<Vec<_>>();
    entries
        .iter()
        .map(|entry| ScheduleReport::from_entry(entry, &all, now_ms))
        .collect()
}

pub fn run_check(store: &JsonScheduleStore, now_ms: i64, mode: TimeDisplayMode) -> Result<()> {
    let entries = store.get_all_once()?;
    let reports = build_reports(&entries, now_ms);

    println!("selftalker schedule check");
    if let Some(path) = store.path() {
        println!("Store: {}", path.display());
    }
    println!("Alarms enabled: {}", store.alarms_enabled()?);
    println!("Schedules: {}", reports.len());
    for report in &reports {
        println!("  #{} {}", report.id, report.interval);
        if report.overlaps {
            println!("    Overlaps another schedule");
        }
        println!("    Stored trigger: {}", format_trigger_time(report.stored_trigger_ms, mode));
        if report.is_stale() {
            println!(
                "    Next trigger:   {} (reconciled)",
                format_trigger_time(report.next_trigger_ms, mode)
            );
        }
        println!(
            "    Audio files: {} ({} missing)",
            report.audio_count,
            report.missing_audio.len()
        );
        for path in &report.missing_audio {
            println!("      missing: {path}");
        }
        if report.is_unplayable() {
            println!("    Every audio file is missing; the schedule will be removed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::model::{AudioReference, HOUR_MS, Schedule, ScheduleId};

    fn entry(id: u64, trigger_time_ms: i64, paths: &[&str]) -> ScheduleWithAudio {
        ScheduleWithAudio {
            schedule: Schedule::new(ScheduleId(id), trigger_time_ms, HOUR_MS),
            audio: paths.iter().map(|path| AudioReference::from_path(*path)).collect(),
        }
    }

    #[test]
    fn reports_reconcile_past_triggers() {
        let now = 10 * HOUR_MS as i64 + 5;
        let reports = build_reports(&[entry(1, HOUR_MS as i64, &[]), entry(2, now + 1, &[])], now);
        assert!(reports[0].is_stale());
        assert_eq!(reports[0].next_trigger_ms, 11 * HOUR_MS as i64);
        assert!(!reports[1].is_stale());
        assert_eq!(reports[0].interval, "Every 1h");
        assert!(!reports[0].overlaps);
    }

    #[test]
    fn reports_flag_overlapping_schedules() {
        let mut daily = entry(2, 3 * HOUR_MS as i64, &[]);
        daily.schedule.repeat_interval_ms = crate::schedule::model::DAILY_MS;
        let reports = build_reports(&[entry(1, HOUR_MS as i64, &[]), daily, entry(3, 1, &[])], 0);
        assert!(reports[0].overlaps);
        assert!(reports[1].overlaps);
    }

    #[test]
    fn reports_flag_missing_audio() {
        let dir = tempfile::tempdir().expect("tempdir");
        let present = dir.path().join("present.wav");
        std::fs::write(&present, b"RIFF").expect("write");
        let present = present.display().to_string();

        let reports = build_reports(
            &[
                entry(1, 0, &[present.as_str(), "/missing/one.wav"]),
                entry(2, 0, &["/missing/two.wav"]),
            ],
            0,
        );
        assert_eq!(reports[0].missing_audio, vec!["/missing/one.wav"]);
        assert!(!reports[0].is_unplayable());
        assert!(reports[1].is_unplayable());
    }
}
