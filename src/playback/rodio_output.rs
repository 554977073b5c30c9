use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use rodio::{Decoder, OutputStream, Sink};
use tracing::debug;

use crate::playback::output::{ActivePlayback, AudioOutput, CompletionSink, PlaybackError};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Plays clips through the default output device. The stream is opened per
/// file on the playback thread because rodio's stream handle is not `Send`.
pub struct RodioOutput;

struct RodioPlayback {
    released: Arc<AtomicBool>,
}

impl ActivePlayback for RodioPlayback {
    fn release(self: Box<Self>) {
        self.released.store(true, Ordering::Relaxed);
    }
}

impl AudioOutput for RodioOutput {
    fn start(&mut self, path: &str, completion: CompletionSink) -> Result<Box<dyn ActivePlayback>, PlaybackError> {
        let file = File::open(path).map_err(|err| PlaybackError::from_open(path, err))?;
        let source = Decoder::new(BufReader::new(file)).map_err(|err| PlaybackError::Decode {
            path: path.to_string(),
            reason: err.to_string(),
        })?;
        let released = Arc::new(AtomicBool::new(false));
        let released_for_thread = Arc::clone(&released);
        let path = path.to_string();
        thread::spawn(move || {
            let (_stream, handle) = match OutputStream::try_default() {
                Ok(pair) => pair,
                Err(err) => {
                    completion.failed(PlaybackError::Device(err.to_string()));
                    return;
                }
            };
            let sink = match Sink::try_new(&handle) {
                Ok(sink) => sink,
                Err(err) => {
                    completion.failed(PlaybackError::Device(err.to_string()));
                    return;
                }
            };
            sink.append(source);
            while !sink.empty() {
                if released_for_thread.load(Ordering::Relaxed) {
                    sink.stop();
                    debug!(%path, "rodio playback released");
                    return;
                }
                thread::sleep(POLL_INTERVAL);
            }
            completion.finished();
        });
        Ok(Box::new(RodioPlayback { released }))
    }
}
