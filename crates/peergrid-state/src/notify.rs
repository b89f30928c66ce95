//! One-shot change notification.
//!
//! Each table carries a [`NotifyGroup`]. Watchers register a channel sender
//! before issuing their query; when a write touching the table commits, every
//! registered sender is signaled exactly once and dropped from the group.
//! A watcher that wants the next event registers again, which collapses a
//! burst of writes between two polls into a single wake-up.

use std::sync::mpsc::Sender;
use std::sync::Mutex;

/// A set of one-shot subscribers to a single table.
///
/// Registration and firing are mutually excluded, so a subscriber added
/// while a notification is in flight is signaled by the next one.
#[derive(Default)]
pub struct NotifyGroup {
    waiters: Mutex<Vec<Sender<()>>>,
}

impl NotifyGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for the next notification.
    pub fn wait(&self, notify: Sender<()>) {
        self.waiters.lock().unwrap().push(notify);
    }

    /// Signal every registered subscriber once and clear the set.
    /// Subscribers whose receiver has gone away are dropped silently.
    pub fn notify(&self) {
        let mut waiters = self.waiters.lock().unwrap();
        for waiter in waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Number of currently registered subscribers.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{channel, TryRecvError};

    #[test]
    fn notify_signals_each_waiter_once() {
        let group = NotifyGroup::new();
        let (tx1, rx1) = channel();
        let (tx2, rx2) = channel();
        group.wait(tx1);
        group.wait(tx2);

        group.notify();

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert_eq!(rx1.try_recv().unwrap_err(), TryRecvError::Disconnected);
        assert_eq!(rx2.try_recv().unwrap_err(), TryRecvError::Disconnected);
    }

    #[test]
    fn waiters_are_cleared_after_firing() {
        let group = NotifyGroup::new();
        let (tx, rx) = channel();
        group.wait(tx);

        group.notify();
        assert_eq!(group.waiter_count(), 0);
        assert!(rx.try_recv().is_ok());

        // A second notify without re-registration reaches nobody.
        group.notify();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn reregistration_catches_the_next_event() {
        let group = NotifyGroup::new();
        let (tx, rx) = channel();
        group.wait(tx.clone());

        group.notify();
        assert!(rx.try_recv().is_ok());

        group.wait(tx);
        group.notify();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn dropped_receiver_is_ignored() {
        let group = NotifyGroup::new();
        let (tx, rx) = channel();
        group.wait(tx);
        drop(rx);

        group.notify();
        assert_eq!(group.waiter_count(), 0);
    }

    #[test]
    fn notify_without_waiters_is_a_noop() {
        let group = NotifyGroup::new();
        group.notify();
        assert_eq!(group.waiter_count(), 0);
    }
}
