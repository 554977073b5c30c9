pub mod engine;
pub mod keep_alive;
pub mod output;
#[cfg(feature = "rodio")]
pub mod rodio_output;

pub use engine::{PlaybackQueue, PlaybackSession};
pub use keep_alive::{ActivityFlag, KeepAlive};
pub use output::{AudioOutput, HeadlessOutput};
