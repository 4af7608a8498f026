//! Bounded queue between the interrupt handlers and the receive task
//!
//! Producers never block: a full queue drops the item and counts an
//! overflow. The single consumer blocks until an item arrives or every
//! producer is gone.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use crate::device::Device;
use crate::message::Message;

/// A received message and the bus it arrived on
#[derive(Clone)]
pub struct Receipt {
    /// Receiving bus
    pub device: Arc<Device>,
    /// Decoded message
    pub message: Message,
}

/// The consumer has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

/// Fill level bookkeeping, shared by both ends of a queue
#[derive(Debug)]
pub struct QueueStatistics {
    capacity: usize,
    pending: AtomicUsize,
    high_water: AtomicUsize,
    overflows: AtomicUsize,
}

impl QueueStatistics {
    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items currently queued
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Highest number of items queued at once since creation or the last
    /// [`QueueStatistics::reset_high_water`]
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    /// Start tracking the high-water mark afresh
    pub fn reset_high_water(&self) {
        self.high_water.store(self.pending(), Ordering::Relaxed);
    }

    /// Items dropped because the queue was full
    pub fn overflows(&self) -> usize {
        self.overflows.load(Ordering::Relaxed)
    }
}

/// Sending end, one clone per interrupt handler
pub struct Producer<T> {
    tx: SyncSender<T>,
    stats: Arc<QueueStatistics>,
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<T> Producer<T> {
    /// Queue `item` without blocking. When the queue is full the item is
    /// dropped, an overflow is counted and `WouldBlock` is returned.
    pub fn try_push(&self, item: T) -> nb::Result<(), QueueClosed> {
        // Counted before sending so the consumer never sees an item it
        // cannot account for.
        let pending = self.stats.pending.fetch_add(1, Ordering::Relaxed) + 1;
        match self.tx.try_send(item) {
            Ok(()) => {
                self.stats.high_water.fetch_max(pending, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.pending.fetch_sub(1, Ordering::Relaxed);
                match e {
                    TrySendError::Full(_) => {
                        self.stats.overflows.fetch_add(1, Ordering::Relaxed);
                        Err(nb::Error::WouldBlock)
                    }
                    TrySendError::Disconnected(_) => Err(nb::Error::Other(QueueClosed)),
                }
            }
        }
    }

    /// Fill level bookkeeping
    pub fn statistics(&self) -> &Arc<QueueStatistics> {
        &self.stats
    }
}

/// Receiving end
pub struct Consumer<T> {
    rx: Receiver<T>,
    stats: Arc<QueueStatistics>,
}

impl<T> Consumer<T> {
    /// Wait for the next item. Returns `None` once every producer has been
    /// dropped and the queue is drained.
    pub fn pop(&self) -> Option<T> {
        let item = self.rx.recv().ok()?;
        self.stats.pending.fetch_sub(1, Ordering::Relaxed);
        Some(item)
    }
}

/// Create a queue holding at most `capacity` items
pub fn bounded<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = sync_channel(capacity);
    let stats = Arc::new(QueueStatistics {
        capacity,
        pending: AtomicUsize::new(0),
        high_water: AtomicUsize::new(0),
        overflows: AtomicUsize::new(0),
    });
    (
        Producer {
            tx,
            stats: stats.clone(),
        },
        Consumer { rx, stats },
    )
}
