//! Derived per-process and per-system state
//!
//! `SystemState` holds the merged CRDT fields of a system. Both merges are
//! commutative and idempotent, so replicas that ingest the same events in any
//! order converge.
//!
//! Register ties (equal timestamps) go to the lexicographically greater value
//! bytes. Set ties between an add and a remove of the same element go to the
//! add.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::{ContentType, LwwElement, LwwElementSetDelta, LwwSetOperation, Pointer, Process};
use crate::ranges::RangesForProcess;

/// What is stored locally for one process.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    pub ranges: RangesForProcess,
    /// Highest clock ever stored for this process.
    pub frontier: Option<u64>,
}

impl ProcessState {
    /// Next clock the authoring process should use.
    pub fn next_clock(&self) -> u64 {
        self.frontier.map_or(1, |c| c + 1)
    }

    /// Record `clock` as stored. Returns false if it was already covered.
    pub fn record(&mut self, clock: u64) -> bool {
        if !self.ranges.insert(clock) {
            return false;
        }
        self.frontier = Some(self.frontier.map_or(clock, |f| f.max(clock)));
        true
    }
}

/// Latest state of one element of a set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwSetEntry {
    pub operation: LwwSetOperation,
    pub unix_milliseconds: u64,
}

/// Last-writer-wins element set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwElementSet {
    elements: BTreeMap<Vec<u8>, LwwSetEntry>,
}

impl LwwElementSet {
    /// Fold in one delta. Returns true if the set's state changed.
    pub fn merge(&mut self, delta: &LwwElementSetDelta) -> bool {
        let incoming = LwwSetEntry {
            operation: delta.operation,
            unix_milliseconds: delta.unix_milliseconds,
        };
        match self.elements.get_mut(&delta.value) {
            Some(current) => {
                if set_entry_wins(&incoming, current) {
                    *current = incoming;
                    true
                } else {
                    false
                }
            }
            None => {
                self.elements.insert(delta.value.clone(), incoming);
                true
            }
        }
    }

    pub fn contains(&self, value: &[u8]) -> bool {
        self.elements
            .get(value)
            .is_some_and(|e| e.operation == LwwSetOperation::Add)
    }

    /// Elements currently in the set.
    pub fn members(&self) -> BTreeSet<Vec<u8>> {
        self.elements
            .iter()
            .filter(|(_, e)| e.operation == LwwSetOperation::Add)
            .map(|(v, _)| v.clone())
            .collect()
    }
}

fn set_entry_wins(incoming: &LwwSetEntry, current: &LwwSetEntry) -> bool {
    match incoming.unix_milliseconds.cmp(&current.unix_milliseconds) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => {
            incoming.operation == LwwSetOperation::Add && current.operation == LwwSetOperation::Remove
        }
    }
}

fn register_wins(incoming: &LwwElement, current: &LwwElement) -> bool {
    (incoming.unix_milliseconds, &incoming.value) > (current.unix_milliseconds, &current.value)
}

/// Everything derived about a system.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    pub processes: BTreeSet<Process>,
    pub registers: BTreeMap<ContentType, LwwElement>,
    pub sets: BTreeMap<ContentType, LwwElementSet>,
}

impl SystemState {
    /// Returns true if the process was new.
    pub fn add_process(&mut self, process: Process) -> bool {
        self.processes.insert(process)
    }

    /// Merge a register write. Returns true if the visible value changed.
    pub fn merge_register(&mut self, content_type: ContentType, element: &LwwElement) -> bool {
        match self.registers.get_mut(&content_type) {
            Some(current) => {
                if register_wins(element, current) {
                    *current = element.clone();
                    true
                } else {
                    false
                }
            }
            None => {
                self.registers.insert(content_type, element.clone());
                true
            }
        }
    }

    /// Merge a set delta. Returns true if the set changed.
    pub fn merge_set(&mut self, content_type: ContentType, delta: &LwwElementSetDelta) -> bool {
        self.sets.entry(content_type).or_default().merge(delta)
    }

    pub fn register(&self, content_type: ContentType) -> Option<&LwwElement> {
        self.registers.get(&content_type)
    }

    pub fn set_members(&self, content_type: ContentType) -> BTreeSet<Vec<u8>> {
        self.sets
            .get(&content_type)
            .map(LwwElementSet::members)
            .unwrap_or_default()
    }
}

/// Deletion record of one event location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Lowest of the deletes pointing here.
    pub mutation: Pointer,
    /// Content types named by deletes that arrived before the event. Their
    /// placeholder rows are dropped once the event shows its real type.
    pub announced: BTreeSet<ContentType>,
}

impl Tombstone {
    pub fn new(mutation: Pointer, announced: Option<ContentType>) -> Self {
        Self {
            mutation,
            announced: announced.into_iter().collect(),
        }
    }

    /// Fold in another delete of the same location.
    pub fn merge(&mut self, mutation: Pointer, announced: Option<ContentType>) {
        if mutation < self.mutation {
            self.mutation = mutation;
        }
        self.announced.extend(announced);
    }
}
