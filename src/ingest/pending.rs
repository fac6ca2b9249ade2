use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::models::Quotation;

/// Quotations processed by a consumer but not yet handed to the store.
///
/// Readers take a snapshot under the read lock; append and drain take the
/// write lock, so neither a buffered read nor a flush can see half a batch.
#[derive(Debug, Default)]
pub struct PendingWrites {
    queue: RwLock<VecDeque<Quotation>>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one quotation, returning the queue length afterwards.
    pub fn append(&self, quotation: Quotation) -> usize {
        let mut queue = self.queue.write();
        queue.push_back(quotation);
        queue.len()
    }

    pub fn snapshot(&self) -> Vec<Quotation> {
        self.queue.read().iter().cloned().collect()
    }

    /// Take everything currently queued.
    pub fn drain(&self) -> Vec<Quotation> {
        self.queue.write().drain(..).collect()
    }

    /// Put an undelivered batch back ahead of anything appended since.
    pub fn requeue_front(&self, batch: Vec<Quotation>) {
        let mut queue = self.queue.write();
        for quotation in batch.into_iter().rev() {
            queue.push_front(quotation);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.read().is_empty()
    }
}
