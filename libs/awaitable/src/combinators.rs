// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Suspending on several awaitables at once.

use crate::awaitable::{Awaitable, start_async};
use coro::{current_coro, master_coro};
use std::cell::Cell;
use std::ptr;
use std::rc::Rc;

/// Extracts the awaitable out of a collection element, so the combinators
/// can walk plain slices of richer types. Elements may also hold no
/// awaitable at all; those are skipped.
pub trait AsAwaitable {
    fn as_awaitable(&self) -> Option<&Awaitable>;
}

impl AsAwaitable for Awaitable {
    fn as_awaitable(&self) -> Option<&Awaitable> {
        Some(self)
    }
}

impl<T: AsAwaitable> AsAwaitable for Option<T> {
    fn as_awaitable(&self) -> Option<&Awaitable> {
        self.as_ref()?.as_awaitable()
    }
}

impl<A: AsAwaitable, B> AsAwaitable for (A, B) {
    fn as_awaitable(&self) -> Option<&Awaitable> {
        self.0.as_awaitable()
    }
}

fn awaitables<T: AsAwaitable>(
    collection: &[T],
) -> impl Iterator<Item = (usize, &Awaitable)> {
    collection
        .iter()
        .enumerate()
        .filter_map(|(index, element)| Some((index, element.as_awaitable()?)))
}

/// Suspends until every awaitable in the collection has completed, awaiting
/// them in order. The first failure re-raises here; the remaining elements
/// are left in whatever state they reached.
pub fn await_all<T: AsAwaitable>(collection: &[T]) {
    assert!(
        current_coro() != master_coro(),
        "cannot await from the master coro"
    );

    for (_, awt) in awaitables(collection) {
        awt.wait();
    }
}

/// Suspends until any awaitable in the collection is done, and returns the
/// index of the first done element. The other elements are left untouched
/// and still armed.
///
/// Returns `None` if the collection holds no awaitables at all.
///
/// A failure is not re-raised here; callers surface it by waiting on the
/// returned element.
pub fn await_any<T: AsAwaitable>(collection: &[T]) -> Option<usize> {
    assert!(
        current_coro() != master_coro(),
        "cannot await from the master coro"
    );

    let mut have_pending = false;
    for (index, awt) in awaitables(collection) {
        if awt.is_done() {
            return Some(index);
        }
        have_pending = true;
    }
    if !have_pending {
        return None;
    }

    for (_, awt) in awaitables(collection) {
        debug_assert!(
            awt.awaiting_coro().is_none(),
            "awaitable is already being awaited"
        );
        awt.set_awaiting_coro(Some(current_coro()));
    }

    coro::yield_to(master_coro(), ptr::null_mut());

    let mut done = None;
    for (index, awt) in awaitables(collection) {
        awt.set_awaiting_coro(None);
        if done.is_none() && awt.is_done() {
            done = Some(index);
        }
    }

    Some(done.expect("resumed with no awaitable done"))
}

/// Composes a collection into one awaitable that completes when all of its
/// elements have, or fails with the first failure.
pub fn async_all<T: AsAwaitable + 'static>(collection: Vec<T>) -> Awaitable {
    start_async("async-all", move || await_all(&collection))
}

/// The winning index of an [`async_any`], available once it is done.
#[derive(Clone)]
pub struct AnySelection(Rc<Cell<Option<usize>>>);

impl AnySelection {
    pub fn winner(&self) -> Option<usize> {
        self.0.get()
    }
}

/// Composes a collection into one awaitable that completes as soon as any
/// element is done. An empty collection never completes on its own; the
/// returned awaitable is then finished only by dropping it.
pub fn async_any<T: AsAwaitable + 'static>(collection: Vec<T>) -> (Awaitable, AnySelection) {
    let selection = AnySelection(Rc::new(Cell::new(None)));

    let awt = start_async("async-any", {
        let selection = selection.clone();
        move || {
            if collection.is_empty() {
                coro::yield_to(master_coro(), ptr::null_mut());
            } else {
                selection.0.set(await_any(&collection));
            }
        }
    });

    (awt, selection)
}
