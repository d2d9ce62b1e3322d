//! Exact-repetition loop detection over canonicalized operation states.
//!
//! This flags the same state recurring verbatim, not cycles through
//! near-identical states: any changed key or value hashes differently and
//! starts a fresh count.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Default number of identical states before a loop is reported.
pub const DEFAULT_MAX_IDENTICAL_STATES: usize = 3;

#[derive(Debug)]
pub struct LoopDetector {
    max_identical_states: usize,
    history: Vec<u64>,
    counts: HashMap<u64, usize>,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDENTICAL_STATES)
    }
}

impl LoopDetector {
    pub fn new(max_identical_states: usize) -> Self {
        Self {
            max_identical_states: max_identical_states.max(1),
            history: Vec::new(),
            counts: HashMap::new(),
        }
    }

    /// Record a canonicalized state (a `BTreeMap` keeps key order
    /// deterministic). Returns `true` once this exact state has been seen
    /// `max_identical_states` times.
    pub fn record_state(&mut self, state: &BTreeMap<String, String>) -> bool {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for (key, value) in state {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        let state_hash = hasher.finish();

        self.history.push(state_hash);
        let count = self.counts.entry(state_hash).or_insert(0);
        *count += 1;
        *count >= self.max_identical_states
    }

    /// Clear all history. Called at the start of every operation so loop
    /// detection is scoped per operation, never across them.
    pub fn reset(&mut self) {
        self.history.clear();
        self.counts.clear();
    }

    pub fn states_recorded(&self) -> usize {
        self.history.len()
    }
}
