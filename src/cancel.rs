use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag allowing an external caller to stop a long decode/retest batch
///
/// Checked between work items, so cancellation stops new work rather than interrupting a running
/// per-cell decode.
///
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
