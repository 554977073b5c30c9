use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::trigger::{ArmRequest, TriggerError, TriggerEvent, TriggerKey, TriggerScheduler};

const MAX_IDLE_WAIT: Duration = Duration::from_millis(200);

struct TimerShared {
    armed: Mutex<HashMap<TriggerKey, ArmRequest>>,
    wake: Condvar,
    stop: AtomicBool,
    precise_allowed: AtomicBool,
}

impl TimerShared {
    fn lock_armed(&self) -> MutexGuard<'_, HashMap<TriggerKey, ArmRequest>> {
        self.armed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process trigger scheduler: one worker thread sleeps until the earliest
/// armed wake time and delivers [`TriggerEvent`]s on a channel.
pub struct TimerScheduler {
    shared: Arc<TimerShared>,
    join: Option<JoinHandle<()>>,
}

impl TimerScheduler {
    pub fn start(clock: Arc<dyn Clock>, events: Sender<TriggerEvent>, precise_allowed: bool) -> Self {
        let shared = Arc::new(TimerShared {
            armed: Mutex::new(HashMap::new()),
            wake: Condvar::new(),
            stop: AtomicBool::new(false),
            precise_allowed: AtomicBool::new(precise_allowed),
        });
        let shared_for_thread = Arc::clone(&shared);
        let join = thread::spawn(move || run_timer_loop(shared_for_thread, clock, events));
        Self {
            shared,
            join: Some(join),
        }
    }

    pub fn grant_precise_timing(&self) {
        self.shared.precise_allowed.store(true, Ordering::Relaxed);
        info!("precise timing capability granted");
    }

    pub fn precise_timing_allowed(&self) -> bool {
        self.shared.precise_allowed.load(Ordering::Relaxed)
    }

    /// Armed registrations ordered by wake time.
    pub fn armed(&self) -> Vec<ArmRequest> {
        let mut armed = self.shared.lock_armed().values().cloned().collect::<Vec<_>>();
        armed.sort_by_key(|request| (request.wake_at_ms, request.key.schedule_id));
        armed
    }
}

impl TriggerScheduler for TimerScheduler {
    fn arm(&self, request: ArmRequest) -> Result<(), TriggerError> {
        if self.shared.stop.load(Ordering::Relaxed) {
            return Err(TriggerError::Unavailable("timer thread stopped".to_string()));
        }
        if !self.shared.precise_allowed.load(Ordering::Relaxed) {
            return Err(TriggerError::PermissionDenied(
                "precise timing capability has not been granted".to_string(),
            ));
        }
        debug!(key = %request.key, wake_at_ms = request.wake_at_ms, "arming trigger");
        self.shared.lock_armed().insert(request.key.clone(), request);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn disarm(&self, key: &TriggerKey) -> bool {
        let removed = self.shared.lock_armed().remove(key).is_some();
        if removed {
            debug!(%key, "disarmed trigger");
            self.shared.wake.notify_all();
        }
        removed
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.wake.notify_all();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run_timer_loop(shared: Arc<TimerShared>, clock: Arc<dyn Clock>, events: Sender<TriggerEvent>) {
    let mut armed = shared.lock_armed();
    while !shared.stop.load(Ordering::Relaxed) {
        let now = clock.now_ms();
        let due = armed
            .iter()
            .filter(|(_, request)| request.wake_at_ms <= now)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in due {
            let Some(request) = armed.remove(&key) else {
                continue;
            };
            info!(key = %request.key, wake_at_ms = request.wake_at_ms, "trigger fired");
            let event = TriggerEvent {
                key: request.key,
                wake_at_ms: request.wake_at_ms,
                fired_at_ms: now,
                audio_paths: request.audio_paths,
            };
            if events.send(event).is_err() {
                warn!("trigger receiver dropped; stopping timer thread");
                return;
            }
        }

        let wait = armed
            .values()
            .map(|request| request.wake_at_ms.saturating_sub(now))
            .min()
            .map(|remaining_ms| Duration::from_millis(remaining_ms.max(1) as u64))
            .unwrap_or(MAX_IDLE_WAIT)
            .min(MAX_IDLE_WAIT);
        armed = match shared.wake.wait_timeout(armed, wait) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
}
