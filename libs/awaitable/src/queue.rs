// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Asynchronous bounded queue.

use crate::awaitable::{Awaitable, Completer};
use coro::PushMaster;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// Single-threaded async producer-consumer queue.
///
/// Pushes complete immediately while there is room, pops complete
/// immediately while there are items; otherwise the returned awaitable
/// completes once the counterpart operation shows up, in FIFO order per
/// side. Abandoning a pending operation (dropping its awaitable) removes it
/// from the queue; an abandoned push drops its value.
///
/// Handles are cheap clones sharing one queue.
///
/// Not thread safe; designed for single-threaded use.
pub struct BoundedQueue<T> {
    inner: Rc<QueueInner<T>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct QueueInner<T> {
    tag: String,
    max_size: usize,
    items: RefCell<VecDeque<T>>,
    /// Pushes waiting for room; the value rides along until admitted.
    pending_pushes: RefCell<VecDeque<(T, Completer)>>,
    /// Pops waiting for an item, each with the slot its value lands in.
    pending_pops: RefCell<VecDeque<(Rc<Cell<Option<T>>>, Completer)>>,
}

/// Receives the value of a [`BoundedQueue::pop_async`] once the pop's
/// awaitable completes.
pub struct PopSlot<T>(Rc<Cell<Option<T>>>);

impl<T> PopSlot<T> {
    /// Takes the popped value out of the slot.
    pub fn take(&self) -> Option<T> {
        self.0.take()
    }
}

// === impl BoundedQueue ===

impl<T: 'static> BoundedQueue<T> {
    /// Creates a queue that holds up to `max_size` items.
    pub fn new(tag: impl Into<String>, max_size: usize) -> Self {
        assert!(max_size > 0, "queue capacity must be at least one");

        Self {
            inner: Rc::new(QueueInner {
                tag: tag.into(),
                max_size,
                items: RefCell::new(VecDeque::new()),
                pending_pushes: RefCell::new(VecDeque::new()),
                pending_pops: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Creates a queue that never blocks pushes.
    pub fn unbounded(tag: impl Into<String>) -> Self {
        Self::new(tag, usize::MAX)
    }

    /// Identifier for debugging.
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// Max queue size.
    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Number of items currently held (pending pushes not included).
    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.inner.max_size
    }

    /// Pushes a value. The push happens immediately unless the queue is
    /// full; the returned awaitable completes once the value is in (or has
    /// been handed straight to a waiting pop).
    pub fn push_async(&self, value: T) -> Awaitable {
        let inner = &*self.inner;
        tracing::trace!(queue = %inner.tag, len = self.len(), "push");

        // A waiting pop takes the value directly; the queue stays empty.
        if let Some((slot, completer)) = inner.next_live_pop() {
            slot.set(Some(value));
            let _master = PushMaster::new();
            completer.complete();
            return Awaitable::completed(format!("{}/push", inner.tag));
        }

        if self.len() < inner.max_size {
            inner.items.borrow_mut().push_back(value);
            return Awaitable::completed(format!("{}/push", inner.tag));
        }

        let mut awt = Awaitable::new(format!("{}/push", inner.tag));
        let completer = awt.take_completer();
        inner.pending_pushes.borrow_mut().push_back((value, completer));
        awt
    }

    /// Pops a value. The pop happens immediately unless the queue is empty;
    /// the returned awaitable completes once the slot holds a value.
    pub fn pop_async(&self) -> (Awaitable, PopSlot<T>) {
        let inner = &*self.inner;
        tracing::trace!(queue = %inner.tag, len = self.len(), "pop");

        let slot = PopSlot(Rc::new(Cell::new(None)));

        let popped = inner.items.borrow_mut().pop_front();
        if let Some(value) = popped {
            slot.0.set(Some(value));
            // Room opened up; admit the longest-waiting live push.
            inner.admit_one();
            return (Awaitable::completed(format!("{}/pop", inner.tag)), slot);
        }

        // Take a waiting push's value directly; the queue stays empty.
        if let Some((value, completer)) = inner.next_live_push() {
            slot.0.set(Some(value));
            let _master = PushMaster::new();
            completer.complete();
            return (Awaitable::completed(format!("{}/pop", inner.tag)), slot);
        }

        let mut awt = Awaitable::new(format!("{}/pop", inner.tag));
        let completer = awt.take_completer();
        inner
            .pending_pops
            .borrow_mut()
            .push_back((slot.0.clone(), completer));
        (awt, slot)
    }
}

impl<T> QueueInner<T> {
    fn next_live_pop(&self) -> Option<(Rc<Cell<Option<T>>>, Completer)> {
        loop {
            let entry = self.pending_pops.borrow_mut().pop_front()?;
            if !entry.1.is_expired() {
                return Some(entry);
            }
        }
    }

    fn next_live_push(&self) -> Option<(T, Completer)> {
        loop {
            // An expired entry's value is dropped here with the entry.
            let entry = self.pending_pushes.borrow_mut().pop_front()?;
            if !entry.1.is_expired() {
                return Some(entry);
            }
        }
    }

    fn admit_one(&self) {
        if let Some((value, completer)) = self.next_live_push() {
            self.items.borrow_mut().push_back(value);
            let _master = PushMaster::new();
            completer.complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awaitable::start_async;

    #[test]
    fn immediate_push_and_pop() {
        let queue = BoundedQueue::new("q", 4);

        assert!(queue.push_async(1_u32).did_complete());
        assert!(queue.push_async(2_u32).did_complete());
        assert_eq!(queue.len(), 2);

        let (awt, slot) = queue.pop_async();
        assert!(awt.did_complete());
        assert_eq!(slot.take(), Some(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn pop_waits_for_a_push() {
        let queue = BoundedQueue::new("q", 4);
        let received = Rc::new(Cell::new(None));

        let consumer = start_async("consumer", {
            let queue = queue.clone();
            let received = received.clone();
            move || {
                let (awt, slot) = queue.pop_async();
                awt.wait();
                received.set(slot.take());
            }
        });

        assert!(!consumer.is_done());
        queue.push_async(7_u32);
        assert!(consumer.did_complete());
        assert_eq!(received.get(), Some(7));
        assert!(queue.is_empty());
    }

    #[test]
    fn push_waits_while_full() {
        let queue = BoundedQueue::new("q", 1);
        assert!(queue.push_async(1_u32).did_complete());
        assert!(queue.is_full());

        let producer = start_async("producer", {
            let queue = queue.clone();
            move || {
                queue.push_async(2_u32).wait();
            }
        });

        assert!(!producer.is_done());

        let (awt, slot) = queue.pop_async();
        assert!(awt.did_complete());
        assert_eq!(slot.take(), Some(1));

        // The pop made room, which admitted the pending push.
        assert!(producer.did_complete());
        assert_eq!(queue.len(), 1);

        let (_, slot) = queue.pop_async();
        assert_eq!(slot.take(), Some(2));
    }

    #[test]
    fn values_flow_through_in_fifo_order() {
        let queue = BoundedQueue::new("q", 2);
        let collected = Rc::new(RefCell::new(Vec::new()));

        let producer = start_async("producer", {
            let queue = queue.clone();
            move || {
                for i in 0..5_u32 {
                    queue.push_async(i).wait();
                }
            }
        });

        // Capacity 2: the producer parks on the third push.
        assert!(!producer.is_done());

        let consumer = start_async("consumer", {
            let queue = queue.clone();
            let collected = collected.clone();
            move || {
                for _ in 0..5 {
                    let (awt, slot) = queue.pop_async();
                    awt.wait();
                    collected.borrow_mut().push(slot.take().unwrap());
                }
            }
        });

        assert!(producer.did_complete());
        assert!(consumer.did_complete());
        assert_eq!(*collected.borrow(), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn abandoned_pushes_are_skipped_and_dropped() {
        struct CountOnDrop(Rc<Cell<u32>>);
        impl Drop for CountOnDrop {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Rc::new(Cell::new(0));
        let queue = BoundedQueue::new("q", 1);

        let first = queue.push_async(CountOnDrop(drops.clone()));
        assert!(first.did_complete());

        let abandoned = queue.push_async(CountOnDrop(drops.clone()));
        assert!(!abandoned.is_done());
        drop(abandoned);
        assert_eq!(drops.get(), 0);

        // The abandoned push is skipped when room opens up; its value dies.
        let (awt, slot) = queue.pop_async();
        assert!(awt.did_complete());
        drop(slot.take());
        assert_eq!(drops.get(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn empty_queue_hands_values_straight_through() {
        let queue = BoundedQueue::new("q", 1);
        let handed = Rc::new(Cell::new(None));

        let consumer = start_async("consumer", {
            let queue = queue.clone();
            let handed = handed.clone();
            move || {
                let (awt, slot) = queue.pop_async();
                awt.wait();
                handed.set(slot.take());
            }
        });

        assert!(!consumer.is_done());
        assert!(queue.push_async(9_u32).did_complete());

        assert!(consumer.did_complete());
        assert_eq!(handed.get(), Some(9));
        // direct hand-off, nothing ever sat in the queue
        assert!(queue.is_empty());
    }
}
