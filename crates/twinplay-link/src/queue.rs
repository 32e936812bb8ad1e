use std::time::Duration;

use crossbeam_channel as cb;

/// Bounded FIFO between one producer role and one consumer thread.
///
/// Nothing is ever dropped while the caller says the session is alive: a
/// full queue blocks the producer instead. Waits are split into
/// `poll`-sized slices so a dead session is noticed promptly.
pub struct UpdateQueue<T> {
    tx: cb::Sender<T>,
    rx: cb::Receiver<T>,
    capacity: usize,
}

impl<T> UpdateQueue<T> {
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = cb::bounded(capacity);
        Self { tx, rx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Blocks while the queue is full. Hands the item back once
    /// `keep_waiting` returns false.
    pub fn push(&self, item: T, poll: Duration, keep_waiting: impl Fn() -> bool) -> Result<(), T> {
        let mut item = item;
        loop {
            match self.tx.send_timeout(item, poll) {
                Ok(()) => return Ok(()),
                Err(cb::SendTimeoutError::Timeout(back)) => {
                    if !keep_waiting() {
                        return Err(back);
                    }
                    item = back;
                }
                Err(cb::SendTimeoutError::Disconnected(back)) => return Err(back),
            }
        }
    }

    /// Blocks until an item arrives or `keep_waiting` returns false.
    pub fn pop(&self, poll: Duration, keep_waiting: impl Fn() -> bool) -> Option<T> {
        loop {
            match self.rx.recv_timeout(poll) {
                Ok(item) => return Some(item),
                Err(cb::RecvTimeoutError::Timeout) => {
                    if !keep_waiting() {
                        return None;
                    }
                }
                Err(cb::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Discards everything queued; returns how many items were dropped.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }
}
