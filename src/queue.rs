//! Bounded request queue ordered by ascending file size.
//!
//! Ties on size are broken by the request key (`path::channel`) in byte order;
//! equal keys keep arrival order. Dequeue always takes the head.

use std::cmp::Ordering;
use std::collections::VecDeque;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::protocol::Request;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Request queue full (capacity {capacity}), request dropped")]
    Full { capacity: usize },
}

pub struct RequestQueue {
    items: Mutex<VecDeque<Request>>,
    not_empty: Notify,
    capacity: usize,
}

fn priority(a: &Request, b: &Request) -> Ordering {
    a.file_size
        .cmp(&b.file_size)
        .then_with(|| a.key().cmp(b.key()))
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Notify::new(),
            capacity,
        }
    }

    /// Ordered insert. Never waits for room: a full queue rejects.
    pub fn enqueue(&self, request: Request) -> Result<(), QueueError> {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return Err(QueueError::Full {
                    capacity: self.capacity,
                });
            }

            let at =
                items.partition_point(|queued| priority(queued, &request) != Ordering::Greater);
            debug!(
                key = %request.key(),
                size = request.file_size,
                position = at,
                queued = items.len() + 1,
                "request queued"
            );
            items.insert(at, request);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the smallest request, suspending while the queue is empty.
    pub async fn dequeue(&self) -> Request {
        loop {
            let notified = self.not_empty.notified();
            if let Some(request) = self.try_dequeue() {
                return request;
            }
            notified.await;
        }
    }

    pub fn try_dequeue(&self) -> Option<Request> {
        let mut items = self.items.lock();
        let request = items.pop_front()?;
        debug!(
            key = %request.key(),
            size = request.file_size,
            remaining = items.len(),
            "request dequeued"
        );
        Some(request)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }
}
