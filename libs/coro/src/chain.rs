// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The master-coro chain and the idle-action queue.
//!
//! Each thread owns one runtime instance: a lazily-created main coro that
//! represents the thread's native stack, a pointer to whichever coro is
//! currently executing, and a chain of masters. The chain starts at the main
//! coro; [`PushMaster`] temporarily elevates the current coro so that
//! internal transfers initiated from inside a coroutine land back where they
//! were started rather than on the native stack.

use crate::{CoroInner, CoroRef};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ptr::NonNull;

thread_local! {
    static MAIN: Cell<Option<NonNull<CoroInner>>> = const { Cell::new(None) };
    static CURRENT: Cell<Option<NonNull<CoroInner>>> = const { Cell::new(None) };
    static MASTERS: RefCell<Vec<NonNull<CoroInner>>> = const { RefCell::new(Vec::new()) };
    static IDLE: RefCell<VecDeque<Box<dyn FnOnce()>>> = const { RefCell::new(VecDeque::new()) };
    static DRAINING_IDLE: Cell<bool> = const { Cell::new(false) };
}

/// Creates the main coro for this thread if it does not exist yet.
pub(crate) fn init() {
    if MAIN.get().is_some() {
        return;
    }

    // The main coro is leaked on purpose: it must outlive every handle that
    // was ever created on this thread, teardown order included.
    let main = NonNull::from(Box::leak(Box::new(CoroInner::main())));
    MAIN.set(Some(main));
    CURRENT.set(Some(main));
    MASTERS.with_borrow_mut(|masters| masters.push(main));

    tracing::debug!("coroutine runtime initialized");
}

/// Returns the coro that is currently executing.
pub fn current_coro() -> CoroRef {
    init();
    CoroRef(CURRENT.get().expect("current coro not set"))
}

/// Returns the top of the master chain, the coro that ordinary awaits must
/// yield to.
pub fn master_coro() -> CoroRef {
    init();
    MASTERS.with_borrow(|masters| CoroRef(*masters.last().expect("master chain is empty")))
}

pub(crate) fn set_current(coro: NonNull<CoroInner>) {
    CURRENT.set(Some(coro));
}

/// Temporarily elevates the current coro to master.
///
/// Used whenever internal transfers must be performed from within a coro
/// that is not itself the master, e.g. completing an awaitable from a nested
/// helper. Guards normally nest LIFO; out-of-order drops are tolerated by
/// scanning the chain for the recorded entry.
pub struct PushMaster {
    pushed: NonNull<CoroInner>,
}

impl PushMaster {
    pub fn new() -> Self {
        let pushed = current_coro().0;
        MASTERS.with_borrow_mut(|masters| masters.push(pushed));
        Self { pushed }
    }
}

impl Default for PushMaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PushMaster {
    fn drop(&mut self) {
        MASTERS.with_borrow_mut(|masters| {
            let index = masters
                .iter()
                .rposition(|&entry| entry == self.pushed)
                .expect("master chain entry missing");
            // Index 0 is the main coro, which a guard can never have pushed.
            assert!(index != 0, "attempted to pop the main coro off the master chain");
            masters.remove(index);
        });
    }
}

/// Posts an action to run on the native stack once control next returns to
/// the main coro. FIFO.
pub fn post_idle_action(action: impl FnOnce() + 'static) {
    IDLE.with_borrow_mut(|idle| idle.push_back(Box::new(action)));
}

/// Drains the idle queue if the switch that just returned landed on the main
/// coro. Re-entered drains are skipped so that only the outermost switch
/// runs actions.
pub(crate) fn maybe_drain_idle() {
    if CURRENT.get() != MAIN.get() || DRAINING_IDLE.get() {
        return;
    }

    struct ResetOnDrop;
    impl Drop for ResetOnDrop {
        fn drop(&mut self) {
            DRAINING_IDLE.set(false);
        }
    }

    DRAINING_IDLE.set(true);
    let _reset = ResetOnDrop;
    loop {
        let action = IDLE.with_borrow_mut(|idle| idle.pop_front());
        let Some(action) = action else { break };
        action();
    }
}
