pub mod timer;

use std::fmt;

use thiserror::Error;

use crate::schedule::model::{Schedule, ScheduleId};

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum TriggerError {
    /// The host withholds the precise wake-up capability.
    #[error("precise scheduling not permitted: {0}")]
    PermissionDenied(String),

    #[error("trigger scheduler unavailable: {0}")]
    Unavailable(String),
}

/// Identifies one armed trigger: the schedule id plus its interval-scoped
/// action name. Arm and disarm must use the same key.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct TriggerKey {
    pub schedule_id: ScheduleId,
    pub repeat_interval_ms: u64,
}

impl TriggerKey {
    pub fn for_schedule(schedule: &Schedule) -> Self {
        Self {
            schedule_id: schedule.id,
            repeat_interval_ms: schedule.repeat_interval_ms,
        }
    }

    pub fn action(&self) -> String {
        format!("schedule-alarm-{}", self.schedule_id)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}ms", self.action(), self.repeat_interval_ms)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ArmRequest {
    pub key: TriggerKey,
    pub wake_at_ms: i64,
    pub audio_paths: Vec<String>,
}

/// Delivered by a trigger scheduler at or after the requested wake time.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TriggerEvent {
    pub key: TriggerKey,
    pub wake_at_ms: i64,
    pub fired_at_ms: i64,
    pub audio_paths: Vec<String>,
}

/// Host facility that turns a future timestamp into a delivered trigger.
/// Arming an already-armed key replaces the previous registration;
/// disarming an unknown key is a no-op.
pub trait TriggerScheduler: Send + Sync {
    fn arm(&self, request: ArmRequest) -> Result<(), TriggerError>;

    /// Returns whether a registration was actually removed.
    fn disarm(&self, key: &TriggerKey) -> bool;
}
