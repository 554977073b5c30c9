use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use hound::WavReader;
use thiserror::Error;
use tracing::debug;

use crate::playback::engine::EngineEvent;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("audio file not found: {0}")]
    MissingFile(String),

    #[error("unable to decode {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("audio device error: {0}")]
    Device(String),
}

impl PlaybackError {
    pub(crate) fn from_open(path: &str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::MissingFile(path.to_string())
        } else {
            Self::Decode {
                path: path.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

/// One-shot report of how a started file ended. Dropping it without
/// reporting (after a release) tells the engine nothing.
pub struct CompletionSink {
    token: u64,
    events: Sender<EngineEvent>,
}

impl CompletionSink {
    pub(crate) fn new(token: u64, events: Sender<EngineEvent>) -> Self {
        Self { token, events }
    }

    pub fn finished(self) {
        let _ = self.events.send(EngineEvent::FileFinished { token: self.token });
    }

    pub fn failed(self, error: PlaybackError) {
        let _ = self.events.send(EngineEvent::FileFailed {
            token: self.token,
            error,
        });
    }
}

/// The resource bound to one playing file.
pub trait ActivePlayback: Send {
    /// Stops output immediately; the completion sink will not fire.
    fn release(self: Box<Self>);
}

/// Starts playback of a single file without blocking. Errors returned from
/// `start` and errors reported later through the sink are handled alike.
pub trait AudioOutput: Send {
    fn start(&mut self, path: &str, completion: CompletionSink) -> Result<Box<dyn ActivePlayback>, PlaybackError>;
}

/// Plays WAV clips on hosts without an audio device: every sample is decoded
/// and paced in real time, so batches take as long as they would audibly.
#[derive(Debug, Default)]
pub struct HeadlessOutput;

struct HeadlessPlayback {
    released: Arc<AtomicBool>,
}

impl ActivePlayback for HeadlessPlayback {
    fn release(self: Box<Self>) {
        self.released.store(true, Ordering::Relaxed);
    }
}

impl AudioOutput for HeadlessOutput {
    fn start(&mut self, path: &str, completion: CompletionSink) -> Result<Box<dyn ActivePlayback>, PlaybackError> {
        let file = File::open(Path::new(path)).map_err(|err| PlaybackError::from_open(path, err))?;
        let reader = WavReader::new(BufReader::new(file)).map_err(|err| PlaybackError::Decode {
            path: path.to_string(),
            reason: err.to_string(),
        })?;
        let released = Arc::new(AtomicBool::new(false));
        let released_for_thread = Arc::clone(&released);
        let path = path.to_string();
        thread::spawn(move || {
            match pace_wav(reader, &released_for_thread) {
                Ok(PaceOutcome::Completed) => completion.finished(),
                Ok(PaceOutcome::Released) => debug!(%path, "headless playback released"),
                Err(err) => completion.failed(PlaybackError::Decode {
                    path,
                    reason: err.to_string(),
                }),
            }
        });
        Ok(Box::new(HeadlessPlayback { released }))
    }
}

enum PaceOutcome {
    Completed,
    Released,
}

fn pace_wav(mut reader: WavReader<BufReader<File>>, released: &AtomicBool) -> Result<PaceOutcome, hound::Error> {
    let spec = reader.spec();
    let samples_per_second = f64::from(spec.sample_rate.max(1)) * f64::from(spec.channels.max(1));
    match spec.sample_format {
        hound::SampleFormat::Float => pace_samples(reader.samples::<f32>(), samples_per_second, released),
        hound::SampleFormat::Int => pace_samples(reader.samples::<i32>(), samples_per_second, released),
    }
}

fn pace_samples<S>(
    samples: impl Iterator<Item = hound::Result<S>>,
    samples_per_second: f64,
    released: &AtomicBool,
) -> Result<PaceOutcome, hound::Error> {
    let chunk = ((samples_per_second / 20.0) as u64).max(1);
    let started = Instant::now();
    let mut decoded = 0_u64;
    for sample in samples {
        sample?;
        decoded += 1;
        if decoded % chunk != 0 {
            continue;
        }
        if released.load(Ordering::Relaxed) {
            return Ok(PaceOutcome::Released);
        }
        let due = Duration::from_secs_f64(decoded as f64 / samples_per_second);
        if let Some(remaining) = due.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }
    if released.load(Ordering::Relaxed) {
        return Ok(PaceOutcome::Released);
    }
    let due = Duration::from_secs_f64(decoded as f64 / samples_per_second);
    if let Some(remaining) = due.checked_sub(started.elapsed()) {
        thread::sleep(remaining);
    }
    Ok(PaceOutcome::Completed)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::Sender;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Test output: reports every started path, fails the configured ones
    /// and either finishes immediately or holds the completion for the test.
    pub struct ScriptedOutput {
        pub started: Sender<String>,
        pub fail_on_start: HashSet<String>,
        pub fail_while_playing: HashSet<String>,
        pub auto_finish: bool,
        pub held: Arc<Mutex<Vec<CompletionSink>>>,
        pub released: Arc<AtomicUsize>,
    }

    impl ScriptedOutput {
        pub fn new(started: Sender<String>) -> Self {
            Self {
                started,
                fail_on_start: HashSet::new(),
                fail_while_playing: HashSet::new(),
                auto_finish: true,
                held: Arc::new(Mutex::new(Vec::new())),
                released: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct ScriptedPlayback {
        released: Arc<AtomicUsize>,
    }

    impl ActivePlayback for ScriptedPlayback {
        fn release(self: Box<Self>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AudioOutput for ScriptedOutput {
        fn start(&mut self, path: &str, completion: CompletionSink) -> Result<Box<dyn ActivePlayback>, PlaybackError> {
            let _ = self.started.send(path.to_string());
            if self.fail_on_start.contains(path) {
                return Err(PlaybackError::Decode {
                    path: path.to_string(),
                    reason: "scripted start failure".to_string(),
                });
            }
            if self.fail_while_playing.contains(path) {
                completion.failed(PlaybackError::Device("scripted device failure".to_string()));
            } else if self.auto_finish {
                completion.finished();
            } else {
                self.held.lock().unwrap().push(completion);
            }
            Ok(Box::new(ScriptedPlayback {
                released: Arc::clone(&self.released),
            }))
        }
    }
}
