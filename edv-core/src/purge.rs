//! Background tombstone sweeping.
//!
//! Deletes leave tombstones behind; [`PurgeScheduler`] clears them out of
//! band. At most one purge per collection runs at a time; requests made
//! while one is in flight coalesce into a single follow-up pass. Failures
//! are logged and swallowed.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, warn};

use crate::engine::DocumentEngine;
use crate::error::StoreResult;

#[derive(Default)]
struct PurgeState {
    running: bool,
    pending: bool,
}

/// Coalescing per-collection purge scheduler.
pub struct PurgeScheduler<E> {
    engine: Arc<E>,
    states: Mutex<HashMap<String, PurgeState>>,
    idle: Condvar,
}

impl<E: DocumentEngine> PurgeScheduler<E> {
    /// Creates a scheduler over an engine.
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            states: Mutex::new(HashMap::new()),
            idle: Condvar::new(),
        }
    }

    /// Requests a background purge of a collection.
    ///
    /// Returns immediately. When a purge of the collection is already in
    /// flight, the request collapses into one follow-up pass after it.
    pub fn request(self: &Arc<Self>, collection: &str) {
        {
            let mut states = self.states.lock().unwrap();
            let state = states.entry(collection.to_string()).or_default();
            if state.running {
                state.pending = true;
                return;
            }
            state.running = true;
        }

        let scheduler = Arc::clone(self);
        let collection = collection.to_string();
        std::thread::spawn(move || scheduler.run(&collection));
    }

    /// Purges a collection synchronously, returning the number of records
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails; unlike [`Self::request`],
    /// nothing is swallowed.
    pub fn run_now(&self, collection: &str) -> StoreResult<u64> {
        Ok(self.engine.purge_deleted(collection)?)
    }

    /// Blocks until no purge of the collection is in flight.
    pub fn wait_idle(&self, collection: &str) {
        let mut states = self.states.lock().unwrap();
        while states.get(collection).is_some_and(|state| state.running) {
            states = self.idle.wait(states).unwrap();
        }
    }

    fn run(&self, collection: &str) {
        loop {
            match self.engine.purge_deleted(collection) {
                Ok(removed) => debug!(collection, removed, "purged tombstones"),
                Err(err) => warn!(collection, error = %err, "purge failed"),
            }

            let mut states = self.states.lock().unwrap();
            let state = states
                .get_mut(collection)
                .expect("purge state exists while running");
            if state.pending {
                state.pending = false;
                // Another pass picks up whatever arrived mid-run.
                continue;
            }
            state.running = false;
            self.idle.notify_all();
            return;
        }
    }
}

impl<E> std::fmt::Debug for PurgeScheduler<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurgeScheduler").finish_non_exhaustive()
    }
}
