//! Ordering guard for inbound diffs.
//!
//! The remote party numbers its diffs with a monotonic counter. The guard only
//! remembers the last accepted value; anything not strictly greater is stale
//! (a duplicate or a regression) and is dropped, never buffered for later.

/// Outcome of checking one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Stale { counter: u64, last_seen: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct OrderingGuard {
    last_seen: Option<u64>,
}

impl OrderingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    /// Accept `counter` if it moves forward; accepted counters are recorded.
    pub fn check(&mut self, counter: u64) -> Verdict {
        match self.last_seen {
            Some(last_seen) if counter <= last_seen => Verdict::Stale { counter, last_seen },
            _ => {
                self.last_seen = Some(counter);
                Verdict::Accept
            }
        }
    }

    /// Restart from a counter obtained with a full state.
    pub fn reset(&mut self, counter: u64) {
        self.last_seen = Some(counter);
    }
}
