//! Digest coordination: result cache and in-flight registry under one lock.
//!
//! Cache probe, registry check and registration happen in one critical
//! section, as do cache insert and publish, so no request can observe a path
//! as neither cached nor in flight while its digest is being stored.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::DigestCache;
use crate::inflight::{DigestOutcome, EntryId, InFlightRegistry, RegistryError, WaitHandle};

const ABANDONED: &str = "digest computation abandoned";

struct DaemonState {
    cache: DigestCache,
    in_flight: InFlightRegistry,
}

pub struct Coordinator {
    state: Mutex<DaemonState>,
}

/// What a worker should do for a path.
#[derive(Debug)]
pub enum Claim {
    Cached(String),
    /// The caller computes and must publish through the claim.
    Compute(ComputeClaim),
    /// Somebody else computes; wait on the handle.
    Wait(WaitHandle),
}

/// Ownership of a live registry entry. Dropping it unpublished publishes an
/// "abandoned" failure so waiters are never stranded.
pub struct ComputeClaim {
    coordinator: Arc<Coordinator>,
    path: String,
    id: EntryId,
    published: bool,
}

impl std::fmt::Debug for ComputeClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeClaim")
            .field("path", &self.path)
            .field("id", &self.id)
            .finish()
    }
}

impl Coordinator {
    pub fn new(cache_capacity: usize, registry_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DaemonState {
                cache: DigestCache::new(cache_capacity),
                in_flight: InFlightRegistry::new(registry_capacity),
            }),
        })
    }

    #[cfg(test)]
    pub fn cached(&self, path: &str) -> Option<String> {
        self.state.lock().cache.lookup(path).map(str::to_string)
    }

    /// Probes the cache, then joins or registers the in-flight computation.
    pub fn claim(self: &Arc<Self>, path: &str) -> Result<Claim, RegistryError> {
        let mut state = self.state.lock();

        if let Some(digest) = state.cache.lookup(path) {
            debug!(path = %path, "cache hit");
            return Ok(Claim::Cached(digest.to_string()));
        }

        if let Some(handle) = state.in_flight.join(path) {
            debug!(path = %path, "waiting on in-flight digest");
            return Ok(Claim::Wait(handle));
        }

        let id = state.in_flight.register(path)?;
        Ok(Claim::Compute(ComputeClaim {
            coordinator: Arc::clone(self),
            path: path.to_string(),
            id,
            published: false,
        }))
    }

    /// Suspends until the computer publishes, with the lock released, then
    /// copies the outcome and leaves the entry.
    pub async fn wait(&self, mut handle: WaitHandle) -> DigestOutcome {
        // Err means the sender is gone; the entry is then done or abandoned
        // and `leave` below reports whichever outcome is stored.
        let _ = handle.done.wait_for(|done| *done).await;

        let mut state = self.state.lock();
        state
            .in_flight
            .leave(handle.id)
            .unwrap_or_else(|| Err(ABANDONED.to_string()))
    }

    /// Stores a successful digest in the cache and wakes the entry's waiters.
    pub fn publish(&self, mut claim: ComputeClaim, outcome: DigestOutcome) {
        claim.published = true;
        self.finish(&claim.path, claim.id, outcome);
    }

    fn finish(&self, path: &str, id: EntryId, outcome: DigestOutcome) {
        let mut state = self.state.lock();
        if let Ok(digest) = &outcome
            && !state.cache.insert_if_absent(path, digest)
        {
            debug!(
                path = %path,
                cached = state.cache.len(),
                capacity = state.cache.capacity(),
                "digest not cached"
            );
        }
        let waiters = state.in_flight.complete(id, outcome);
        debug!(path = %path, waiters, "published digest");
    }

    /// Cached digests and registry entries, for diagnostics.
    pub fn usage(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.cache.len(), state.in_flight.len())
    }

    #[cfg(test)]
    pub fn cache_len(&self) -> usize {
        self.usage().0
    }

    #[cfg(test)]
    pub fn in_flight_len(&self) -> usize {
        self.usage().1
    }
}

impl Drop for ComputeClaim {
    fn drop(&mut self) {
        if !self.published {
            self.coordinator
                .finish(&self.path, self.id, Err(ABANDONED.to_string()));
        }
    }
}
