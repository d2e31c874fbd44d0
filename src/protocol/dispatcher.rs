//! Named-event counter/waiter
//!
//! An event raised while nobody waits is counted, and the next waiter
//! consumes it immediately, so an acknowledgement that races ahead of its
//! waiter is never lost. Waiters on the same event are woken oldest first.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct Slot {
    pending: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Debug)]
pub struct EventDispatcher<K> {
    slots: Mutex<HashMap<K, Slot>>,
}

impl<K: Eq + Hash + Clone> Default for EventDispatcher<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> EventDispatcher<K> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Records one occurrence of `event`, handing it straight to the oldest
    /// live waiter if there is one.
    pub fn register_event(&self, event: K) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(event).or_default();

        while let Some(waiter) = slot.waiters.pop_front() {
            // A waiter that gave up (timed out) has dropped its receiver.
            if waiter.send(()).is_ok() {
                return;
            }
        }
        slot.pending += 1;
    }

    /// Resolves once an occurrence of `event` is available.
    pub async fn wait_event(&self, event: K) {
        let receiver = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(event).or_default();
            if slot.pending > 0 {
                slot.pending -= 1;
                return;
            }
            let (sender, receiver) = oneshot::channel();
            slot.waiters.push_back(sender);
            receiver
        };

        // The sender lives in the dispatcher, which outlives `&self`.
        let _ = receiver.await;
    }

    /// Occurrences raised but not yet consumed.
    pub fn pending(&self, event: &K) -> usize {
        self.slots.lock().get(event).map_or(0, |slot| slot.pending)
    }
}
