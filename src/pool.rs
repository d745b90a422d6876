//! Admission control for workers.
//!
//! A semaphore bounds concurrent workers. Each worker holds a [`Slot`] for its
//! whole lifetime. Dropping the slot gives the capacity back and wakes one
//! pending `acquire`, including when the worker unwinds from a panic.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    max: usize,
}

pub struct Slot {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(max: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max)),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Waits until fewer than `max` workers run, then takes a slot.
    pub async fn acquire(&self) -> Result<Slot, AcquireError> {
        let permit = Arc::clone(&self.slots).acquire_owned().await?;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        debug_assert!(now <= self.max);
        Ok(Slot {
            _permit: permit,
            active: Arc::clone(&self.active),
        })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously held slots seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // Runs before the permit field is dropped, so `active` never exceeds
        // the permits actually handed out.
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
