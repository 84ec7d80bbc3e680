// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thin façade over the host main loop.
//!
//! The runtime itself has no loop; it consumes a single `schedule` hook
//! installed by the program (Qt, GLib, Asio, a hand-rolled looper, ...).
//! Hook contract: the action must not run from within the hook itself (no
//! re-entry), and enqueue order is dispatch order.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// A unit of work for the host loop.
pub type Action = Box<dyn FnOnce() + 'static>;

thread_local! {
    static HOOK: RefCell<Option<Rc<dyn Fn(Action)>>> = const { RefCell::new(None) };
}

/// Installs the scheduling hook for this thread. Must be called before
/// anything is scheduled.
pub fn init_scheduler(hook: impl Fn(Action) + 'static) {
    let hook: Rc<dyn Fn(Action)> = Rc::new(hook);
    HOOK.with_borrow_mut(|slot| {
        *slot = Some(hook);
    });
}

/// Enqueues an action on the host loop.
pub fn schedule(action: impl FnOnce() + 'static) {
    schedule_boxed(Box::new(action));
}

fn schedule_boxed(action: Action) {
    let hook = HOOK
        .with_borrow(|slot| slot.clone())
        .expect("scheduler hook not installed, call init_scheduler()");
    hook(action);
}

/// Unique handle for a scheduled action; dropping it cancels the action.
///
/// Cancellation is cooperative: the queue entry stays where it is, but the
/// dispatch wrapper finds an empty cell and does nothing. Dropping the
/// ticket after the action ran has no effect.
pub struct Ticket {
    action: Rc<RefCell<Option<Action>>>,
}

impl Ticket {
    /// Cancels the action. Equivalent to dropping the ticket.
    pub fn cancel(self) {}

    /// Whether the action is still waiting to run.
    pub fn is_pending(&self) -> bool {
        self.action.borrow().is_some()
    }
}

/// Enqueues an action and returns a [`Ticket`] that owns it.
pub fn schedule_with_ticket(action: impl FnOnce() + 'static) -> Ticket {
    let cell = Rc::new(RefCell::new(Some(Box::new(action) as Action)));
    let weak: Weak<RefCell<Option<Action>>> = Rc::downgrade(&cell);

    schedule_boxed(Box::new(move || {
        let Some(cell) = weak.upgrade() else {
            tracing::trace!("skipping canceled action");
            return;
        };
        // Empty the cell so the closure does not linger until the ticket
        // is dropped.
        let action = cell.borrow_mut().take();
        if let Some(action) = action {
            action();
        }
    }));

    Ticket { action: cell }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestQueue;

    #[test]
    fn actions_dispatch_in_fifo_order() {
        let queue = TestQueue::install();
        let order = std::rc::Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            schedule(move || order.borrow_mut().push(i));
        }

        assert_eq!(order.borrow().len(), 0);
        queue.pump();
        assert_eq!(*order.borrow(), [0, 1, 2]);
    }

    #[test]
    fn dropping_a_ticket_cancels_before_dispatch() {
        let queue = TestQueue::install();
        let ran = std::rc::Rc::new(std::cell::Cell::new(false));

        let ticket = schedule_with_ticket({
            let ran = ran.clone();
            move || ran.set(true)
        });
        assert!(ticket.is_pending());
        drop(ticket);

        queue.pump();
        assert!(!ran.get());
    }

    #[test]
    fn dropping_a_ticket_after_dispatch_is_a_no_op() {
        let queue = TestQueue::install();
        let ran = std::rc::Rc::new(std::cell::Cell::new(false));

        let ticket = schedule_with_ticket({
            let ran = ran.clone();
            move || ran.set(true)
        });

        queue.pump();
        assert!(ran.get());
        assert!(!ticket.is_pending());
        drop(ticket);
    }

    #[test]
    #[should_panic(expected = "scheduler hook not installed")]
    fn scheduling_without_a_hook_panics() {
        schedule(|| {});
    }
}
