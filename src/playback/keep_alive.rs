use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::debug;

/// Asks the hosting environment to keep the process running while a batch
/// is playing. Acquire and release calls are always paired by the engine.
pub trait KeepAlive: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Keep-alive that only records state, for hosts where the process already
/// outlives playback. The daemon exposes it through the API and `--play`
/// waits on the engine instead.
#[derive(Debug, Clone, Default)]
pub struct ActivityFlag {
    active: Arc<AtomicBool>,
    acquisitions: Arc<AtomicU64>,
}

impl ActivityFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

impl KeepAlive for ActivityFlag {
    fn acquire(&self) {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        debug!("keep-alive acquired");
    }

    fn release(&self) {
        self.active.store(false, Ordering::SeqCst);
        debug!("keep-alive released");
    }
}
