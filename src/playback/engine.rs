use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::playback::keep_alive::KeepAlive;
use crate::playback::output::{ActivePlayback, AudioOutput, CompletionSink, PlaybackError};

const STOP_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Ordered file paths submitted together by one trigger.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct PlaybackBatch {
    pub paths: Vec<String>,
}

/// Everything the engine loop reacts to. Only the loop thread mutates
/// playback state, so at most one file is ever active.
pub(crate) enum EngineEvent {
    BatchEnqueued(PlaybackBatch),
    FileFinished { token: u64 },
    FileFailed { token: u64, error: PlaybackError },
    Stop { ack: Sender<()> },
    Shutdown,
}

/// Observable view of the engine, published after every event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlaybackSession {
    pub is_playing: bool,
    pub current_batch: Option<PlaybackBatch>,
    pub current_index: Option<usize>,
    pub queued_batches: usize,
    pub batches_received: u64,
    pub files_completed: u64,
    pub files_failed: u64,
}

impl PlaybackSession {
    pub fn current_file(&self) -> Option<&str> {
        let batch = self.current_batch.as_ref()?;
        let index = self.current_index?;
        batch.paths.get(index).map(String::as_str)
    }
}

type SharedSession = Arc<(Mutex<PlaybackSession>, Condvar)>;

fn lock_session(session: &SharedSession) -> MutexGuard<'_, PlaybackSession> {
    session.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Plays batches of audio files back to back, one file at a time.
pub struct PlaybackQueue {
    events: Sender<EngineEvent>,
    session: SharedSession,
    submitted: AtomicU64,
    join: Option<JoinHandle<()>>,
}

impl PlaybackQueue {
    pub fn start(output: Box<dyn AudioOutput>, keep_alive: Arc<dyn KeepAlive>) -> Self {
        let (events, receiver) = mpsc::channel();
        let session: SharedSession = Arc::new((Mutex::new(PlaybackSession::default()), Condvar::new()));
        let engine = Engine {
            output,
            keep_alive,
            events: events.clone(),
            session: Arc::clone(&session),
            pending: VecDeque::new(),
            active: None,
            holding_keep_alive: false,
            next_token: 1,
            batches_received: 0,
            files_completed: 0,
            files_failed: 0,
        };
        let join = thread::spawn(move || engine.run(receiver));
        Self {
            events,
            session,
            submitted: AtomicU64::new(0),
            join: Some(join),
        }
    }

    /// Queues a batch; it starts immediately when nothing is playing.
    /// Empty batches are ignored.
    pub fn enqueue(&self, paths: Vec<String>) {
        if paths.is_empty() {
            debug!("ignoring empty playback batch");
            return;
        }
        let files = paths.len();
        self.submitted.fetch_add(1, Ordering::SeqCst);
        if self.events.send(EngineEvent::BatchEnqueued(PlaybackBatch { paths })).is_err() {
            self.submitted.fetch_sub(1, Ordering::SeqCst);
            warn!(files, "playback engine has exited; batch dropped");
            return;
        }
        info!(files, "batch enqueued");
    }

    /// Releases the active file, drops every pending batch and returns once
    /// the engine is idle.
    pub fn stop(&self) {
        let (ack, acked) = mpsc::channel();
        if self.events.send(EngineEvent::Stop { ack }).is_err() {
            return;
        }
        if acked.recv_timeout(STOP_ACK_TIMEOUT).is_err() {
            warn!("playback engine did not acknowledge stop");
        }
    }

    pub fn session(&self) -> PlaybackSession {
        lock_session(&self.session).clone()
    }

    /// True when the current batch includes any of `paths`.
    pub fn is_playing_any(&self, paths: &[String]) -> bool {
        let session = lock_session(&self.session);
        session
            .current_batch
            .as_ref()
            .is_some_and(|batch| batch.paths.iter().any(|path| paths.contains(path)))
    }

    /// Blocks until every batch enqueued so far has been played or dropped.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let target = self.submitted.load(Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        let (_, ready) = &*self.session;
        let mut session = lock_session(&self.session);
        loop {
            if !session.is_playing && session.batches_received >= target {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            session = match ready.wait_timeout(session, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        let _ = self.events.send(EngineEvent::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct ActiveBatch {
    batch: PlaybackBatch,
    index: usize,
    token: u64,
    resource: Option<Box<dyn ActivePlayback>>,
}

struct Engine {
    output: Box<dyn AudioOutput>,
    keep_alive: Arc<dyn KeepAlive>,
    events: Sender<EngineEvent>,
    session: SharedSession,
    pending: VecDeque<PlaybackBatch>,
    active: Option<ActiveBatch>,
    holding_keep_alive: bool,
    next_token: u64,
    batches_received: u64,
    files_completed: u64,
    files_failed: u64,
}

impl Engine {
    fn run(mut self, receiver: Receiver<EngineEvent>) {
        for event in receiver.iter() {
            match event {
                EngineEvent::BatchEnqueued(batch) => {
                    self.batches_received += 1;
                    self.pending.push_back(batch);
                    if self.active.is_none() {
                        self.drive();
                    }
                }
                EngineEvent::FileFinished { token } => {
                    if self.finish_current(token) {
                        self.files_completed += 1;
                        self.drive();
                    }
                }
                EngineEvent::FileFailed { token, error } => {
                    if self.finish_current(token) {
                        warn!(%error, "skipping file after playback error");
                        self.files_failed += 1;
                        self.drive();
                    }
                }
                EngineEvent::Stop { ack } => {
                    self.reset();
                    self.publish();
                    let _ = ack.send(());
                    continue;
                }
                EngineEvent::Shutdown => {
                    self.reset();
                    self.publish();
                    return;
                }
            }
            self.publish();
        }
    }

    /// Releases the resource of the file identified by `token` and moves the
    /// cursor past it. Stale tokens from released files are ignored.
    fn finish_current(&mut self, token: u64) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if active.token != token {
            debug!(token, "ignoring completion of a released file");
            return false;
        }
        if let Some(resource) = active.resource.take() {
            resource.release();
        }
        active.index += 1;
        true
    }

    /// Starts the next playable file, moving through batches as they run
    /// out. Files that fail to start are skipped on the spot.
    fn drive(&mut self) {
        loop {
            if self.active.is_none() {
                let Some(batch) = self.pending.pop_front() else {
                    if self.holding_keep_alive {
                        self.keep_alive.release();
                        self.holding_keep_alive = false;
                    }
                    info!("playback queue idle");
                    return;
                };
                if !self.holding_keep_alive {
                    self.keep_alive.acquire();
                    self.holding_keep_alive = true;
                }
                info!(files = batch.paths.len(), "starting batch");
                self.active = Some(ActiveBatch {
                    batch,
                    index: 0,
                    token: 0,
                    resource: None,
                });
            }

            let Some(active) = self.active.as_mut() else {
                continue;
            };
            let Some(path) = active.batch.paths.get(active.index).cloned() else {
                info!(files = active.batch.paths.len(), "batch complete");
                self.active = None;
                continue;
            };

            let token = self.next_token;
            self.next_token += 1;
            active.token = token;
            debug!(%path, index = active.index, "playing file");
            match self.output.start(&path, CompletionSink::new(token, self.events.clone())) {
                Ok(resource) => {
                    active.resource = Some(resource);
                    return;
                }
                Err(error) => {
                    warn!(%path, %error, "skipping file that failed to start");
                    self.files_failed += 1;
                    active.index += 1;
                }
            }
        }
    }

    fn reset(&mut self) {
        if let Some(active) = self.active.take()
            && let Some(resource) = active.resource
        {
            resource.release();
        }
        let dropped = self.pending.len();
        self.pending.clear();
        if self.holding_keep_alive {
            self.keep_alive.release();
            self.holding_keep_alive = false;
        }
        info!(dropped_batches = dropped, "playback stopped");
    }

    fn publish(&self) {
        let (lock, ready) = &*self.session;
        let mut session = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *session = PlaybackSession {
            is_playing: self.active.is_some(),
            current_batch: self.active.as_ref().map(|active| active.batch.clone()),
            current_index: self.active.as_ref().map(|active| active.index),
            queued_batches: self.pending.len(),
            batches_received: self.batches_received,
            files_completed: self.files_completed,
            files_failed: self.files_failed,
        };
        ready.notify_all();
    }
}
