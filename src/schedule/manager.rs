use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::schedule::conflict::find_overlap;
use crate::schedule::model::{
    AudioReference, NewSchedule, Schedule, ScheduleId, ScheduleWithAudio, interval_label,
};
use crate::schedule::reconcile::{following_trigger, next_trigger};
use crate::schedule::store::{ScheduleStore, ScheduleWatch, StoreError};
use crate::trigger::{ArmRequest, TriggerEvent, TriggerKey, TriggerScheduler};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The schedule is persisted but its trigger is not armed.
    #[error("schedule {id} saved but not armed: {reason}")]
    SchedulingDenied { id: ScheduleId, reason: String },

    #[error("schedule {0} not found")]
    NotFound(ScheduleId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// The caller accepted an overlap conflict and retries.
    pub allow_overlap: bool,
    /// The caller chose to supersede the schedule with the same interval.
    pub replace_existing: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CreateOutcome {
    Created { schedule: Schedule, armed: bool },
    OverlapConflict { existing: Schedule },
    ReplaceConflict { existing: Schedule },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RescheduleReport {
    pub rearmed: usize,
    pub moved: usize,
    pub cancelled: usize,
    pub denied: Vec<ScheduleId>,
}

/// What a delivered trigger turned into.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TriggerOutcome {
    /// Play `batch`; the schedule is persisted for `next_trigger_ms`.
    Play {
        batch: Vec<String>,
        next_trigger_ms: i64,
        rearmed: bool,
    },
    /// Every referenced file is gone, so the schedule was deleted.
    Removed(ScheduleId),
    /// The trigger no longer matches a live schedule.
    Ignored,
}

/// Creates, replaces, cancels and re-arms schedules against the store and
/// the trigger scheduler. Operations run one at a time.
pub struct ScheduleManager {
    store: Arc<dyn ScheduleStore>,
    triggers: Arc<dyn TriggerScheduler>,
    clock: Arc<dyn Clock>,
    op_lock: Mutex<()>,
}

impl ScheduleManager {
    pub fn new(store: Arc<dyn ScheduleStore>, triggers: Arc<dyn TriggerScheduler>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            triggers,
            clock,
            op_lock: Mutex::new(()),
        }
    }

    fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn list(&self) -> Result<Vec<ScheduleWithAudio>, ScheduleError> {
        Ok(self.store.get_all_once()?)
    }

    pub fn get(&self, id: ScheduleId) -> Result<Option<ScheduleWithAudio>, ScheduleError> {
        Ok(self.store.get(id)?)
    }

    pub fn watch(&self) -> ScheduleWatch {
        self.store.watch()
    }

    pub fn alarms_enabled(&self) -> Result<bool, ScheduleError> {
        Ok(self.store.alarms_enabled()?)
    }

    pub fn create(
        &self,
        candidate: NewSchedule,
        audio: Vec<AudioReference>,
        options: CreateOptions,
    ) -> Result<CreateOutcome, ScheduleError> {
        if candidate.repeat_interval_ms == 0 {
            return Err(ScheduleError::InvalidSchedule(
                "repeat interval must be greater than zero".to_string(),
            ));
        }
        if audio.is_empty() {
            return Err(ScheduleError::InvalidSchedule(
                "at least one audio file is required".to_string(),
            ));
        }

        let _guard = self.lock_ops();
        let now = self.clock.now_ms();
        let candidate = NewSchedule {
            trigger_time_ms: next_trigger(&candidate.as_candidate(), now).trigger_time_ms,
            ..candidate
        };
        let existing = self
            .store
            .get_all_once()?
            .into_iter()
            .map(|entry| entry.schedule)
            .collect::<Vec<_>>();

        if !options.allow_overlap
            && let Some(other) = find_overlap(&candidate.as_candidate(), &existing)
        {
            info!(existing = %other.id, "new schedule overlaps an existing one");
            return Ok(CreateOutcome::OverlapConflict {
                existing: other.clone(),
            });
        }

        if let Some(same_interval) = existing
            .iter()
            .find(|other| other.repeat_interval_ms == candidate.repeat_interval_ms)
        {
            if !options.replace_existing {
                info!(
                    existing = %same_interval.id,
                    interval = %interval_label(candidate.repeat_interval_ms),
                    "schedule with the same interval exists"
                );
                return Ok(CreateOutcome::ReplaceConflict {
                    existing: same_interval.clone(),
                });
            }
            info!(replaced = %same_interval.id, "replacing schedule with the same interval");
            self.cancel_trigger(same_interval);
            self.store.delete(same_interval.id)?;
        }

        let id = self.store.insert(&candidate, &audio)?;
        let schedule = Schedule::new(id, candidate.trigger_time_ms, candidate.repeat_interval_ms);
        info!(
            id = %id,
            trigger_time_ms = schedule.trigger_time_ms,
            interval = %interval_label(schedule.repeat_interval_ms),
            files = audio.len(),
            "schedule created"
        );

        if !self.store.alarms_enabled()? {
            info!(id = %id, "alarms are disabled; schedule saved without arming");
            return Ok(CreateOutcome::Created {
                schedule,
                armed: false,
            });
        }
        let paths = audio.iter().map(|entry| entry.file_path.clone()).collect();
        self.arm(&schedule, paths)?;
        Ok(CreateOutcome::Created {
            schedule,
            armed: true,
        })
    }

    /// Deregisters the schedule's trigger. Cancelling twice is harmless.
    pub fn cancel(&self, schedule: &Schedule) {
        let _guard = self.lock_ops();
        self.cancel_trigger(schedule);
    }

    fn cancel_trigger(&self, schedule: &Schedule) {
        let key = TriggerKey::for_schedule(schedule);
        if self.triggers.disarm(&key) {
            info!(%key, "trigger cancelled");
        } else {
            debug!(%key, "trigger was not armed");
        }
    }

    fn arm(&self, schedule: &Schedule, audio_paths: Vec<String>) -> Result<(), ScheduleError> {
        let request = ArmRequest {
            key: TriggerKey::for_schedule(schedule),
            wake_at_ms: schedule.trigger_time_ms,
            audio_paths,
        };
        self.triggers.arm(request).map_err(|err| {
            warn!(id = %schedule.id, %err, "trigger registration refused");
            ScheduleError::SchedulingDenied {
                id: schedule.id,
                reason: err.to_string(),
            }
        })
    }

    /// Moves every persisted schedule onto its next future grid point,
    /// persists it and re-arms it. A refused arm does not stop the others.
    pub fn reschedule_all(&self) -> Result<RescheduleReport, ScheduleError> {
        let _guard = self.lock_ops();
        self.reschedule_locked()
    }

    fn reschedule_locked(&self) -> Result<RescheduleReport, ScheduleError> {
        let now = self.clock.now_ms();
        let mut report = RescheduleReport::default();
        for entry in self.store.get_all_once()? {
            let updated = next_trigger(&entry.schedule, now);
            if updated != entry.schedule {
                self.store.update(&updated)?;
                report.moved += 1;
            }
            match self.arm(&updated, entry.audio_paths()) {
                Ok(()) => report.rearmed += 1,
                Err(ScheduleError::SchedulingDenied { id, .. }) => report.denied.push(id),
                Err(err) => return Err(err),
            }
        }
        info!(
            rearmed = report.rearmed,
            moved = report.moved,
            denied = report.denied.len(),
            "rescheduled all schedules"
        );
        Ok(report)
    }

    /// Deregisters every trigger but keeps the persisted records.
    pub fn cancel_all(&self) -> Result<RescheduleReport, ScheduleError> {
        let _guard = self.lock_ops();
        self.cancel_locked()
    }

    fn cancel_locked(&self) -> Result<RescheduleReport, ScheduleError> {
        let mut report = RescheduleReport::default();
        for entry in self.store.get_all_once()? {
            self.cancel_trigger(&entry.schedule);
            report.cancelled += 1;
        }
        info!(cancelled = report.cancelled, "cancelled all triggers");
        Ok(report)
    }

    /// Persists the global toggle, then re-arms or cancels everything on a
    /// background thread.
    ///
    /// The worker applies whatever toggle is persisted once it holds the
    /// operation lock, so back-to-back toggles always settle on the last one
    /// regardless of which worker runs first.
    pub fn set_alarms_enabled(
        self: &Arc<Self>,
        enabled: bool,
    ) -> Result<JoinHandle<Result<RescheduleReport, ScheduleError>>, ScheduleError> {
        self.store.set_alarms_enabled(enabled)?;
        info!(enabled, "alarm toggle changed");
        let manager = Arc::clone(self);
        Ok(thread::spawn(move || {
            let result = manager.apply_alarm_toggle();
            if let Err(err) = &result {
                error!(%err, "failed to apply alarm toggle");
            }
            result
        }))
    }

    fn apply_alarm_toggle(&self) -> Result<RescheduleReport, ScheduleError> {
        let _guard = self.lock_ops();
        if self.store.alarms_enabled()? {
            self.reschedule_locked()
        } else {
            self.cancel_locked()
        }
    }

    /// Cancels the trigger before removing the record so a trigger can never
    /// fire for a schedule that no longer exists.
    pub fn delete_schedule_and_cancel_alarm(&self, id: ScheduleId) -> Result<(), ScheduleError> {
        let _guard = self.lock_ops();
        self.delete_locked(id)
    }

    fn delete_locked(&self, id: ScheduleId) -> Result<(), ScheduleError> {
        let entry = self.store.get(id)?.ok_or(ScheduleError::NotFound(id))?;
        self.cancel_trigger(&entry.schedule);
        self.store.delete(id)?;
        info!(%id, "schedule deleted");
        Ok(())
    }

    pub fn delete_all(&self) -> Result<usize, ScheduleError> {
        let _guard = self.lock_ops();
        let entries = self.store.get_all_once()?;
        for entry in &entries {
            self.delete_locked(entry.schedule.id)?;
        }
        Ok(entries.len())
    }

    /// Deletes every schedule that references `path`, e.g. after the file
    /// was removed from the library.
    pub fn delete_schedules_by_file_path(&self, path: &str) -> Result<Vec<ScheduleId>, ScheduleError> {
        let _guard = self.lock_ops();
        let mut deleted = Vec::new();
        for entry in self.store.get_all_once()? {
            if entry.references_path(path) {
                self.delete_locked(entry.schedule.id)?;
                deleted.push(entry.schedule.id);
            }
        }
        Ok(deleted)
    }

    /// Deletes schedules whose audio files are all missing. A schedule with
    /// at least one playable file is kept.
    pub fn prune_missing_audio(&self) -> Result<Vec<ScheduleId>, ScheduleError> {
        let _guard = self.lock_ops();
        let mut deleted = Vec::new();
        for entry in self.store.get_all_once()? {
            if entry.all_audio_missing() {
                warn!(id = %entry.schedule.id, "every audio file is missing; deleting schedule");
                self.delete_locked(entry.schedule.id)?;
                deleted.push(entry.schedule.id);
            }
        }
        Ok(deleted)
    }

    /// Handles a delivered trigger: re-arms a repeating schedule for its next
    /// fire time and returns the batch to play.
    pub fn handle_trigger(&self, event: &TriggerEvent) -> Result<TriggerOutcome, ScheduleError> {
        let _guard = self.lock_ops();
        let id = event.key.schedule_id;
        if !self.store.alarms_enabled()? {
            debug!(%id, "alarms disabled; ignoring trigger");
            return Ok(TriggerOutcome::Ignored);
        }
        let Some(entry) = self.store.get(id)? else {
            debug!(%id, "trigger for a deleted schedule");
            return Ok(TriggerOutcome::Ignored);
        };
        if entry.schedule.repeat_interval_ms != event.key.repeat_interval_ms {
            debug!(%id, "trigger key no longer matches the schedule");
            return Ok(TriggerOutcome::Ignored);
        }

        if entry.all_audio_missing() {
            warn!(%id, "every audio file is missing; deleting schedule");
            self.delete_locked(id)?;
            return Ok(TriggerOutcome::Removed(id));
        }

        let now = self.clock.now_ms().max(event.fired_at_ms);
        let next = following_trigger(&entry.schedule, now);
        self.store.update(&next)?;
        let batch = entry.audio_paths();
        let rearmed = match self.arm(&next, batch.clone()) {
            Ok(()) => true,
            Err(err) => {
                warn!(%id, %err, "schedule fired but could not be re-armed");
                false
            }
        };
        info!(%id, files = batch.len(), next_trigger_ms = next.trigger_time_ms, "schedule fired");
        Ok(TriggerOutcome::Play {
            batch,
            next_trigger_ms: next.trigger_time_ms,
            rearmed,
        })
    }
}
