//! Admission control for transfers
//!
//! At most `max_concurrent` transfers run at once; everything else waits in
//! FIFO order. Suspending the queue takes the running transfers out and puts
//! them back at the head of the line, ahead of anything queued meanwhile.

use crate::engine::FetchStrategy;
use crate::key::ResourceKey;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One admitted transfer
pub(crate) struct ActiveTransfer {
    pub key: ResourceKey,
    /// Identifies this attempt; callbacks carrying another id are stale
    pub attempt: u64,
    pub token: CancellationToken,
    pub strategy: Arc<dyn FetchStrategy>,
}

pub(crate) struct AdmissionQueue {
    max_concurrent: usize,
    /// Admission order
    active: Vec<ActiveTransfer>,
    pending: VecDeque<ResourceKey>,
    suspended: bool,
}

impl AdmissionQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            active: Vec::new(),
            pending: VecDeque::new(),
            suspended: false,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Values below 1 are raised to 1
    pub fn set_max_concurrent(&mut self, max: usize) {
        self.max_concurrent = max.max(1);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Nothing running and nothing waiting
    pub fn is_idle(&self) -> bool {
        self.active.is_empty() && self.pending.is_empty()
    }

    /// A new request may start right away
    pub fn can_admit(&self) -> bool {
        !self.suspended && self.active.len() < self.max_concurrent
    }

    pub fn enqueue(&mut self, key: ResourceKey) {
        if !self.pending.contains(&key) {
            self.pending.push_back(key);
        }
    }

    pub fn is_pending(&self, key: &ResourceKey) -> bool {
        self.pending.contains(key)
    }

    pub fn remove_pending(&mut self, key: &ResourceKey) -> bool {
        let before = self.pending.len();
        self.pending.retain(|k| k != key);
        self.pending.len() != before
    }

    /// Empty the pending line, e.g. on shutdown
    pub fn drain_pending(&mut self) -> Vec<ResourceKey> {
        self.pending.drain(..).collect()
    }

    /// Next waiting key, if a slot is free
    pub fn next_admissible(&mut self) -> Option<ResourceKey> {
        if self.can_admit() {
            self.pending.pop_front()
        } else {
            None
        }
    }

    pub fn admit(&mut self, transfer: ActiveTransfer) {
        self.active.push(transfer);
    }

    /// The running transfer for `key` if `attempt` is still the current one
    pub fn current(&self, key: &ResourceKey, attempt: u64) -> Option<&ActiveTransfer> {
        self.active
            .iter()
            .find(|t| &t.key == key && t.attempt == attempt)
    }

    /// Release the slot held by `key`
    pub fn take_active(&mut self, key: &ResourceKey) -> Option<ActiveTransfer> {
        let pos = self.active.iter().position(|t| &t.key == key)?;
        Some(self.active.remove(pos))
    }

    /// Stop admitting and hand back every running transfer in admission order
    ///
    /// Their keys go back to the front of the pending line.
    pub fn suspend(&mut self) -> Vec<ActiveTransfer> {
        self.suspended = true;
        let drained: Vec<ActiveTransfer> = self.active.drain(..).collect();
        for transfer in drained.iter().rev() {
            self.pending.push_front(transfer.key.clone());
        }
        drained
    }

    pub fn resume(&mut self) {
        self.suspended = false;
    }
}
