use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::common::error::CoreError;

/// What happens when a bounded event queue is at capacity.
///
/// `Panic` keeps the original crash-based backpressure; the other modes exist
/// because crashing the process on a full queue is an operational hazard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait until the consumer frees a slot.
    Block,
    /// Evict the oldest queued event and enqueue the new one.
    DropOldest,
    /// Return `CoreError::QueueFull` to the producer.
    Reject,
    /// Terminate the process.
    Panic,
}

struct Shared<T> {
    name: &'static str,
    policy: OverflowPolicy,
    items: Mutex<VecDeque<T>>,
    /// Free slots; closed when the receiver is dropped.
    slots: Semaphore,
    consumer: Notify,
    senders: AtomicUsize,
}

/// Multi-producer side of a bounded FIFO event queue.
pub struct QueueSender<T> {
    shared: Arc<Shared<T>>,
}

/// Single-consumer side; dropping it closes the queue for producers.
pub struct QueueReceiver<T> {
    shared: Arc<Shared<T>>,
}

pub fn event_queue<T>(
    name: &'static str,
    capacity: usize,
    policy: OverflowPolicy,
) -> (QueueSender<T>, QueueReceiver<T>) {
    assert!(capacity > 0);
    let shared = Arc::new(Shared {
        name,
        policy,
        items: Mutex::new(VecDeque::new()),
        slots: Semaphore::new(capacity),
        consumer: Notify::new(),
        senders: AtomicUsize::new(1),
    });
    (
        QueueSender {
            shared: shared.clone(),
        },
        QueueReceiver { shared },
    )
}

impl<T> QueueSender<T> {
    /// Enqueue an event, applying the queue's overflow policy when full.
    pub async fn send(&self, item: T) -> crate::Result<()> {
        let shared = &self.shared;
        match shared.policy {
            OverflowPolicy::Block => match shared.slots.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    self.push(item);
                    Ok(())
                }
                Err(_) => Err(CoreError::QueueClosed(shared.name)),
            },
            OverflowPolicy::Reject => {
                if shared.slots.is_closed() {
                    return Err(CoreError::QueueClosed(shared.name));
                }
                match shared.slots.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        self.push(item);
                        Ok(())
                    }
                    Err(_) => Err(CoreError::QueueFull(shared.name)),
                }
            }
            OverflowPolicy::Panic => {
                if shared.slots.is_closed() {
                    return Err(CoreError::QueueClosed(shared.name));
                }
                match shared.slots.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        self.push(item);
                        Ok(())
                    }
                    Err(_) => panic!("Failed to enqueue event, queue '{}' is full", shared.name),
                }
            }
            OverflowPolicy::DropOldest => loop {
                if shared.slots.is_closed() {
                    return Err(CoreError::QueueClosed(shared.name));
                }
                if let Ok(permit) = shared.slots.try_acquire() {
                    permit.forget();
                    self.push(item);
                    return Ok(());
                }
                let mut items = shared.items.lock();
                if let Some(dropped) = items.pop_front() {
                    // The evicted event's slot is reused for the new one.
                    items.push_back(item);
                    drop(items);
                    drop(dropped);
                    log::warn!("Queue '{}' full, dropped the oldest event", shared.name);
                    shared.consumer.notify_one();
                    return Ok(());
                }
                // A concurrent recv freed the slot; retry the acquire.
            },
        }
    }

    pub fn len(&self) -> usize {
        self.shared.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, item: T) {
        let mut items = self.shared.items.lock();
        items.push_back(item);
        log::debug!(
            "Enqueued event into '{}', current queue size={}",
            self.shared.name,
            items.len()
        );
        drop(items);
        self.shared.consumer.notify_one();
    }
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::Relaxed);
        QueueSender {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for QueueSender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.consumer.notify_one();
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Dequeue the next event in FIFO order.
    ///
    /// Returns `None` once every sender is dropped and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut items = self.shared.items.lock();
                if let Some(item) = items.pop_front() {
                    self.shared.slots.add_permits(1);
                    return Some(item);
                }
                if self.shared.senders.load(Ordering::Acquire) == 0 {
                    return None;
                }
            }
            self.shared.consumer.notified().await;
        }
    }
}

impl<T> Drop for QueueReceiver<T> {
    fn drop(&mut self) {
        self.shared.slots.close();
    }
}
