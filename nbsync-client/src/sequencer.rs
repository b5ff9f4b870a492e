//! Update sequencer.
//!
//! One FIFO turnstile per document: the diff/send step of each outgoing
//! mutation runs alone, in the order callers arrived. Waiting for the
//! acknowledgement happens after the turn is released.

use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct UpdateSequencer {
    issued: Mutex<u64>,
}

/// Exclusive right to diff and send. Released on drop.
#[derive(Debug)]
pub struct Turn<'a> {
    guard: MutexGuard<'a, u64>,
}

impl Turn<'_> {
    /// Position of this turn in the sequence, starting at 1.
    pub fn number(&self) -> u64 {
        *self.guard
    }
}

impl UpdateSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for this caller's turn. Turns are granted first come, first served.
    pub async fn turn(&self) -> Turn<'_> {
        let mut guard = self.issued.lock().await;
        *guard += 1;
        Turn { guard }
    }
}
