use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::api::{ApiContext, ApiServer, ApiServerConfig};
use crate::clock::{Clock, SystemClock};
use crate::playback::{ActivityFlag, AudioOutput, PlaybackQueue};
use crate::schedule::manager::{ScheduleManager, TriggerOutcome};
use crate::schedule::store::JsonScheduleStore;
use crate::trigger::timer::TimerScheduler;
use crate::trigger::{TriggerEvent, TriggerScheduler};

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub store_path: PathBuf,
    pub api: Option<ApiServerConfig>,
    pub precise_timing_allowed: bool,
}

/// Owns every long-lived service. Dropping it stops the API first, then the
/// playback engine and the timer thread.
pub struct Daemon {
    api: Option<ApiServer>,
    manager: Arc<ScheduleManager>,
    playback: Arc<PlaybackQueue>,
    timer: Arc<TimerScheduler>,
    events: Receiver<TriggerEvent>,
}

impl Daemon {
    pub fn start(options: DaemonOptions, output: Box<dyn AudioOutput>) -> Result<Self> {
        Self::start_with_clock(options, output, Arc::new(SystemClock))
    }

    fn start_with_clock(options: DaemonOptions, output: Box<dyn AudioOutput>, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = JsonScheduleStore::open(&options.store_path)
            .with_context(|| format!("failed to load {}", options.store_path.display()))?;
        let (events_tx, events) = mpsc::channel();
        let timer = Arc::new(TimerScheduler::start(
            Arc::clone(&clock),
            events_tx,
            options.precise_timing_allowed,
        ));
        let manager = Arc::new(ScheduleManager::new(
            Arc::new(store),
            Arc::clone(&timer) as Arc<dyn TriggerScheduler>,
            Arc::clone(&clock),
        ));

        let pruned = manager.prune_missing_audio().context("pruning schedules")?;
        if !pruned.is_empty() {
            info!(count = pruned.len(), "removed schedules without playable audio");
        }
        if manager.alarms_enabled()? {
            let report = manager.reschedule_all().context("rescheduling at startup")?;
            if !report.denied.is_empty() {
                warn!(
                    denied = report.denied.len(),
                    "precise timing not granted; POST /v1/permissions/precise-timing to arm schedules"
                );
            }
        } else {
            info!("alarms are disabled; no triggers armed");
        }

        let keep_alive = ActivityFlag::new();
        let playback = Arc::new(PlaybackQueue::start(output, Arc::new(keep_alive.clone())));

        let api = match options.api {
            Some(config) => {
                let target = format!("{}:{}", config.bind_addr, config.port);
                let context = ApiContext {
                    manager: Arc::clone(&manager),
                    playback: Arc::clone(&playback),
                    timer: Arc::clone(&timer),
                    keep_alive,
                    clock,
                };
                Some(ApiServer::start(config, context).with_context(|| format!("failed to start local API at {target}"))?)
            }
            None => None,
        };

        Ok(Self {
            api,
            manager,
            playback,
            timer,
            events,
        })
    }

    /// Dispatches triggers until the timer goes away.
    pub fn run(self) -> Result<()> {
        info!(
            api = self.api.is_some(),
            armed = self.timer.armed().len(),
            "selftalker running"
        );
        for event in self.events.iter() {
            dispatch_trigger(&self.manager, &self.playback, &event);
        }
        Ok(())
    }
}

/// Turns one delivered trigger into a playback batch.
pub fn dispatch_trigger(manager: &ScheduleManager, playback: &PlaybackQueue, event: &TriggerEvent) {
    match manager.handle_trigger(event) {
        Ok(TriggerOutcome::Play { batch, .. }) => playback.enqueue(batch),
        Ok(TriggerOutcome::Removed(id)) => info!(%id, "schedule removed instead of playing"),
        Ok(TriggerOutcome::Ignored) => {}
        Err(err) => error!(key = %event.key, %err, "failed to handle trigger"),
    }
}
