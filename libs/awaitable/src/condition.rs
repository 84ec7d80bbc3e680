// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Asynchronous condition variable.

use crate::awaitable::{Awaitable, Completer};
use coro::PushMaster;
use std::cell::RefCell;
use std::collections::VecDeque;

/// The coroutine flavor of a condition variable: instead of blocking,
/// waiters suspend on an [`Awaitable`] until the condition is notified.
///
/// Several coroutines may wait at the same time; one or all of them can be
/// notified. A waiter registered while a notification is being delivered is
/// only woken by the next one, so re-waiting from a woken coroutine cannot
/// loop. There are no spurious wakeups. Dropping a wait awaitable simply
/// expires its slot in the queue.
///
/// Notifications complete waiters through their completers under a
/// temporarily elevated master, so they may be issued from any coroutine.
///
/// Not thread safe; designed for single-threaded use.
#[derive(Default)]
pub struct Condition {
    tag: String,
    waiters: RefCell<VecDeque<Completer>>,
}

impl Condition {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            waiters: RefCell::new(VecDeque::new()),
        }
    }

    /// Identifier for debugging.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns an awaitable that completes on the next notification.
    pub fn wait_async(&self) -> Awaitable {
        let mut awt = Awaitable::new(format!("{}/wait", self.tag));
        self.waiters.borrow_mut().push_back(awt.take_completer());
        awt
    }

    /// Wakes the longest-waiting live waiter, if any.
    pub fn notify_one(&self) {
        loop {
            let Some(waiter) = self.waiters.borrow_mut().pop_front() else {
                return;
            };
            if !waiter.is_expired() {
                let _master = PushMaster::new();
                waiter.complete();
                return;
            }
        }
    }

    /// Wakes every waiter registered before this call.
    pub fn notify_all(&self) {
        // Snapshot the queue: waiters added while notifying go to the next
        // round.
        let round: Vec<Completer> = self.waiters.borrow_mut().drain(..).collect();
        for waiter in round {
            if !waiter.is_expired() {
                let _master = PushMaster::new();
                waiter.complete();
            }
        }
    }
}
