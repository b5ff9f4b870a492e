//! Idle detection and the deferred-bonds buffer.
//!
//! The document is [`Activity::Idle`] when no cell is queued or running and no
//! local update is waiting for its acknowledgement. Bond edits made while the
//! document is busy are held in a [`BondBuffer`] and leave as one combined
//! patch once it turns idle, so intermediate values a fast UI control produces
//! never reach the remote party.

use std::collections::{BTreeMap, BTreeSet};

use nbsync_core::{fields, BondValue, Diff, Notebook, Patch, PatchOp, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Busy,
}

/// One update waiting for its acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UpdateTicket(u64);

#[derive(Debug, Clone, Default)]
pub struct IdleGate {
    cells_busy: bool,
    next_ticket: u64,
    in_flight: BTreeSet<UpdateTicket>,
}

impl IdleGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activity(&self) -> Activity {
        if self.cells_busy || !self.in_flight.is_empty() {
            Activity::Busy
        } else {
            Activity::Idle
        }
    }

    pub fn is_idle(&self) -> bool {
        self.activity() == Activity::Idle
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Track the busy flags of a freshly applied snapshot.
    pub fn observe(&mut self, notebook: &Notebook) -> Activity {
        self.cells_busy = notebook.has_busy_cells();
        self.activity()
    }

    pub fn begin_update(&mut self) -> UpdateTicket {
        let ticket = UpdateTicket(self.next_ticket);
        self.next_ticket += 1;
        self.in_flight.insert(ticket);
        ticket
    }

    /// Settle `ticket`. A ticket dropped by [`IdleGate::clear_in_flight`] is
    /// ignored, so it never settles a later update.
    pub fn finish_update(&mut self, ticket: UpdateTicket) -> Activity {
        self.in_flight.remove(&ticket);
        self.activity()
    }

    /// Forget in-flight updates; their acknowledgements no longer count.
    pub fn clear_in_flight(&mut self) {
        self.in_flight.clear();
    }
}

/// Bonds changed locally while busy, with their value before the first change.
#[derive(Debug, Clone, Default)]
pub struct BondBuffer {
    base: BTreeMap<String, Option<Value>>,
}

impl BondBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.base.keys().map(String::as_str)
    }

    /// Remember bond `name`, keeping the value it had before its first deferral.
    pub fn defer(&mut self, name: &str, before: Option<Value>) {
        self.base.entry(name.to_string()).or_insert(before);
    }

    /// Defer every bond touched by `ops`, reading base values from `before`.
    pub fn defer_ops(&mut self, ops: &Patch, before: &Notebook) {
        let base_of = |name: &str| before.bonds.get(name).map(BondValue::to_value);
        for op in ops.iter().filter(|op| op.touches(fields::BONDS)) {
            match op.path() {
                [_, name, ..] => self.defer(name, base_of(name)),
                _ => {
                    // the whole bonds map was swapped
                    let mut names: Vec<String> = before.bonds.keys().cloned().collect();
                    if let PatchOp::Replace { value, .. } | PatchOp::Add { value, .. } = op {
                        if let Some(map) = value.as_map() {
                            names.extend(map.keys().cloned());
                        }
                    }
                    for name in names {
                        let base = base_of(&name);
                        self.defer(&name, base);
                    }
                }
            }
        }
    }

    /// Drain the buffer into one patch taking the remote party from the base
    /// values to the bonds of `current`, plus its inverse. Bonds that ended
    /// where they started produce no operation.
    pub fn take_patch(&mut self, current: &Notebook) -> Diff {
        let mut ops = Vec::new();
        let mut undo = Vec::new();
        for (name, base) in std::mem::take(&mut self.base) {
            let now = current.bonds.get(&name).map(BondValue::to_value);
            let path = vec![fields::BONDS.to_string(), name];
            match (base, now) {
                (None, Some(value)) => {
                    undo.push(PatchOp::Remove { path: path.clone() });
                    ops.push(PatchOp::Add { path, value });
                }
                (Some(old), Some(value)) if old != value => {
                    undo.push(PatchOp::Replace {
                        path: path.clone(),
                        value: old,
                    });
                    ops.push(PatchOp::Replace { path, value });
                }
                (Some(old), None) => {
                    undo.push(PatchOp::Add {
                        path: path.clone(),
                        value: old,
                    });
                    ops.push(PatchOp::Remove { path });
                }
                _ => {}
            }
        }
        undo.reverse();
        Diff {
            patch: Patch::new(ops),
            inverse: Patch::new(undo),
        }
    }

    pub fn clear(&mut self) {
        self.base.clear();
    }
}
