//! Registry of digest computations in progress.
//!
//! One live entry per path at most. Workers that find a live entry join it as
//! waiters and are woken through the entry's `watch` signal once the computer
//! publishes. An entry is reclaimed when it is done and has no waiters left,
//! either at publish time or by the last waiter to copy the outcome.
//!
//! The registry itself is not synchronized; it lives inside the coordinator's
//! lock together with the result cache.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::watch;

/// Digest hex on success, error message on failure. Shared verbatim with
/// every waiter.
pub type DigestOutcome = Result<String, String>;

pub type EntryId = u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Too many digests in progress (capacity {capacity})")]
    Saturated { capacity: usize },
}

struct InFlightEntry {
    path: String,
    done: bool,
    waiters: usize,
    outcome: Option<DigestOutcome>,
    signal: watch::Sender<bool>,
}

/// Handed to a worker that joined somebody else's computation.
#[derive(Debug)]
pub struct WaitHandle {
    pub id: EntryId,
    pub done: watch::Receiver<bool>,
}

pub struct InFlightRegistry {
    entries: HashMap<EntryId, InFlightEntry>,
    /// Path → id of its not-done entry.
    live: HashMap<String, EntryId>,
    next_id: EntryId,
    capacity: usize,
}

impl InFlightRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            live: HashMap::new(),
            next_id: 0,
            capacity,
        }
    }

    /// Joins the live computation for `path`, if any, as one more waiter.
    pub fn join(&mut self, path: &str) -> Option<WaitHandle> {
        let id = *self.live.get(path)?;
        let entry = self.entries.get_mut(&id)?;
        entry.waiters += 1;
        Some(WaitHandle {
            id,
            done: entry.signal.subscribe(),
        })
    }

    /// Creates the live entry for `path`. The caller becomes its computer.
    pub fn register(&mut self, path: &str) -> Result<EntryId, RegistryError> {
        debug_assert!(!self.live.contains_key(path));

        if self.entries.len() >= self.capacity {
            self.compact();
            if self.entries.len() >= self.capacity {
                return Err(RegistryError::Saturated {
                    capacity: self.capacity,
                });
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        let (signal, _) = watch::channel(false);
        self.entries.insert(
            id,
            InFlightEntry {
                path: path.to_string(),
                done: false,
                waiters: 0,
                outcome: None,
                signal,
            },
        );
        self.live.insert(path.to_string(), id);
        Ok(id)
    }

    /// Marks the entry done and wakes its waiters. Returns how many were
    /// waiting; with none the entry is removed on the spot.
    pub fn complete(&mut self, id: EntryId, outcome: DigestOutcome) -> usize {
        let Some(entry) = self.entries.get_mut(&id) else {
            return 0;
        };
        if entry.done {
            return entry.waiters;
        }

        entry.done = true;
        entry.outcome = Some(outcome);
        if self.live.get(&entry.path) == Some(&id) {
            self.live.remove(&entry.path);
        }

        let waiters = entry.waiters;
        if waiters > 0 {
            entry.signal.send_replace(true);
        } else {
            self.entries.remove(&id);
        }
        waiters
    }

    /// Called by a woken waiter: copies the outcome and drops its claim on the
    /// entry, reclaiming it when it was the last one.
    pub fn leave(&mut self, id: EntryId) -> Option<DigestOutcome> {
        let entry = self.entries.get_mut(&id)?;
        entry.waiters = entry.waiters.saturating_sub(1);
        let outcome = entry.outcome.clone();
        if entry.done && entry.waiters == 0 {
            self.entries.remove(&id);
        }
        outcome
    }

    /// Drops completed entries nobody is waiting on. Returns how many went.
    pub fn compact(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !(e.done && e.waiters == 0));
        before - self.entries.len()
    }

    #[cfg(test)]
    pub fn is_live(&self, path: &str) -> bool {
        self.live.contains_key(path)
    }

    #[cfg(test)]
    pub fn waiters(&self, id: EntryId) -> Option<usize> {
        self.entries.get(&id).map(|e| e.waiters)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_then_join() {
        let mut registry = InFlightRegistry::new(4);
        assert!(registry.join("/a").is_none());

        let id = registry.register("/a").unwrap();
        assert!(registry.is_live("/a"));

        let handle = registry.join("/a").unwrap();
        assert_eq!(handle.id, id);
        assert_eq!(registry.waiters(id), Some(1));
        assert!(!*handle.done.borrow());
    }

    #[test]
    fn test_complete_without_waiters_removes_entry() {
        let mut registry = InFlightRegistry::new(4);
        let id = registry.register("/a").unwrap();

        assert_eq!(registry.complete(id, Ok("aa".into())), 0);
        assert_eq!(registry.len(), 0);
        assert!(!registry.is_live("/a"));
    }

    #[test]
    fn test_last_waiter_reclaims_entry() {
        let mut registry = InFlightRegistry::new(4);
        let id = registry.register("/a").unwrap();
        let first = registry.join("/a").unwrap();
        let second = registry.join("/a").unwrap();

        assert_eq!(registry.complete(id, Ok("aa".into())), 2);
        assert!(*first.done.borrow());
        assert!(*second.done.borrow());
        // Done but still held by waiters.
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_live("/a"));

        assert_eq!(registry.leave(first.id), Some(Ok("aa".into())));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.leave(second.id), Some(Ok("aa".into())));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_new_computer_allowed_while_done_entry_drains() {
        let mut registry = InFlightRegistry::new(4);
        let old = registry.register("/a").unwrap();
        let waiter = registry.join("/a").unwrap();
        registry.complete(old, Ok("old".into()));

        let new = registry.register("/a").unwrap();
        assert_ne!(old, new);
        assert!(registry.is_live("/a"));

        // The old waiter still reads the old outcome.
        assert_eq!(registry.leave(waiter.id), Some(Ok("old".into())));
        assert!(registry.is_live("/a"));
    }

    #[test]
    fn test_failure_outcome_reaches_waiters() {
        let mut registry = InFlightRegistry::new(4);
        let id = registry.register("/a").unwrap();
        let waiter = registry.join("/a").unwrap();
        registry.complete(id, Err("boom".into()));
        assert_eq!(registry.leave(waiter.id), Some(Err("boom".into())));
    }

    #[test]
    fn test_saturated_registry_rejects_new_paths() {
        let mut registry = InFlightRegistry::new(2);
        registry.register("/a").unwrap();
        registry.register("/b").unwrap();
        assert_eq!(
            registry.register("/c"),
            Err(RegistryError::Saturated { capacity: 2 })
        );
    }

    #[test]
    fn test_compaction_frees_only_unwatched_done_entries() {
        let mut registry = InFlightRegistry::new(2);
        let a = registry.register("/a").unwrap();
        let _waiter = registry.join("/a").unwrap();
        registry.register("/b").unwrap();
        registry.complete(a, Ok("aa".into()));

        // "/a" is done but has a waiter, "/b" is live: nothing to compact.
        assert_eq!(registry.compact(), 0);
        assert!(registry.register("/c").is_err());
    }

    #[test]
    fn test_double_complete_is_ignored() {
        let mut registry = InFlightRegistry::new(2);
        let id = registry.register("/a").unwrap();
        let waiter = registry.join("/a").unwrap();
        registry.complete(id, Ok("first".into()));
        registry.complete(id, Ok("second".into()));
        assert_eq!(registry.leave(waiter.id), Some(Ok("first".into())));
    }
}
