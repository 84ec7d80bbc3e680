// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stackful coroutines with symmetric transfer.
//!
//! A [`Coro`] owns an independent native stack. At various points during its
//! execution a coroutine may yield control to any other coroutine; the
//! yielding one is suspended with its stack intact and a snapshot of the
//! machine context until someone yields back. Both plain values (as raw
//! pointers) and [`Failure`]s can be carried across a switch; failures are
//! re-raised on the receiving stack.
//!
//! Each thread lazily gets a *main* coro representing its native stack, plus
//! a chain of *master* coros (see [`master_coro`] and [`PushMaster`]) that
//! higher layers use to decide where an `await` should land.
//!
//! The context-switching code is heavily based off of [`corosensei`] by
//! Amanieu d'Antras, reduced to a single symmetric switch primitive: since
//! failures travel as payloads rather than unwinding across stacks, none of
//! the cross-stack unwinding machinery is needed.
//!
//! Not thread safe: coroutines are designed for single-threaded use, and no
//! handle type is `Send`.
//!
//! [`corosensei`]: https://github.com/Amanieu/corosensei

mod arch;
mod chain;
mod failure;
mod sequence;
pub mod stack;

pub use chain::{PushMaster, current_coro, master_coro, post_idle_action};
pub use failure::{Failure, ForcedUnwind};
pub use sequence::{SeqYielder, YieldSeq};
pub use stack::{default_stack_size, drain_stack_pool, set_default_stack_size};

use crate::failure::{EncodedTransfer, Transfer};
use crate::stack::{OsStack, StackPointer};
use std::cell::{Cell, RefCell};
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};

type Body = Box<dyn FnOnce(*mut ())>;

pub(crate) struct CoroInner {
    tag: String,
    /// Absent for the main coro, which runs on the thread's native stack.
    stack: Option<OsStack>,
    /// Saved machine context while suspended.
    sp: Cell<Option<StackPointer>>,
    /// The stack pointer right after initialization; used to detect whether
    /// the coro has ever suspended (suspending pushes state, so the initial
    /// value can never recur).
    initial_sp: Cell<Option<StackPointer>>,
    /// Default target for [`suspend`] and for the final yield of the body.
    parent: Cell<Option<NonNull<CoroInner>>>,
    is_running: Cell<bool>,
    fully_unwound: Cell<bool>,
    body: RefCell<Option<Body>>,
}

impl CoroInner {
    fn main() -> Self {
        Self {
            tag: "main".into(),
            stack: None,
            sp: Cell::new(None),
            initial_sp: Cell::new(None),
            parent: Cell::new(None),
            is_running: Cell::new(true),
            fully_unwound: Cell::new(false),
            body: RefCell::new(None),
        }
    }
}

/// A stackful coroutine.
///
/// The handle exclusively owns the coroutine's stack; dropping it returns
/// the stack to the thread's pool. Dropping a started coroutine that has not
/// finished is a programmer error and panics — tear it down first, see
/// [`force_unwind`].
pub struct Coro {
    inner: NonNull<CoroInner>,
}

impl Coro {
    /// Creates a coroutine with the default stack size. The body is not
    /// entered until the coroutine is first resumed; the value carried by
    /// that resume becomes the body's argument.
    pub fn new(tag: impl Into<String>, body: impl FnOnce(*mut ()) + 'static) -> Self {
        Self::with_stack_size(tag, body, stack::default_stack_size())
    }

    /// Creates a coroutine with an explicit stack size.
    pub fn with_stack_size(
        tag: impl Into<String>,
        body: impl FnOnce(*mut ()) + 'static,
        stack_size: usize,
    ) -> Self {
        let coro = Self::empty_with_stack_size(tag, stack_size);
        coro.init(body);
        coro
    }

    /// Creates a coroutine without a body; see [`Coro::init`].
    pub fn empty(tag: impl Into<String>) -> Self {
        Self::empty_with_stack_size(tag, stack::default_stack_size())
    }

    /// Creates a bodyless coroutine with an explicit stack size.
    pub fn empty_with_stack_size(tag: impl Into<String>, stack_size: usize) -> Self {
        chain::init();

        let stack = stack::obtain(stack_size).expect("failed to allocate coroutine stack");
        let inner = NonNull::from(Box::leak(Box::new(CoroInner {
            tag: tag.into(),
            stack: Some(stack),
            sp: Cell::new(None),
            initial_sp: Cell::new(None),
            parent: Cell::new(Some(current_coro().0)),
            is_running: Cell::new(false),
            fully_unwound: Cell::new(false),
            body: RefCell::new(None),
        })));

        // Safety: the stack was freshly obtained and is exclusively ours.
        let inner_ref = unsafe { inner.as_ref() };
        let top = inner_ref.stack.as_ref().expect("coroutine stack missing").top();
        let sp = unsafe { arch::init_stack(top, inner.as_ptr()) };
        inner_ref.sp.set(Some(sp));
        inner_ref.initial_sp.set(Some(sp));

        tracing::debug!(tag = %inner_ref.tag, "create coroutine");

        Self { inner }
    }

    /// Installs the body of a coroutine created with [`Coro::empty`]. The
    /// body is not entered until the coroutine is resumed.
    pub fn init(&self, body: impl FnOnce(*mut ()) + 'static) {
        let inner = self.inner();
        assert!(!self.started(), "coroutine may not be restarted");
        assert!(
            inner.body.borrow().is_none() && !inner.is_running.get(),
            "coroutine already has a body"
        );

        inner.parent.set(Some(current_coro().0));
        inner.body.borrow_mut().replace(Box::new(body));
        inner.is_running.set(true);
    }

    /// A copyable non-owning reference to this coroutine.
    pub fn as_ref(&self) -> CoroRef {
        CoroRef(self.inner)
    }

    /// Identifier for debugging.
    pub fn tag(&self) -> &str {
        &self.inner().tag
    }

    /// True from [`Coro::init`] until the body returns or unwinds.
    pub fn is_running(&self) -> bool {
        self.inner().is_running.get()
    }

    /// Whether this coroutine has ever suspended.
    pub fn started(&self) -> bool {
        let inner = self.inner();
        inner.sp.get() != inner.initial_sp.get()
    }

    fn inner(&self) -> &CoroInner {
        // Safety: the handle owns the allocation.
        unsafe { self.inner.as_ref() }
    }
}

impl Drop for Coro {
    fn drop(&mut self) {
        let inner = self.inner();
        tracing::debug!(tag = %inner.tag, "destroy coroutine");

        assert!(
            current_coro().0 != self.inner,
            "cannot destroy the coroutine that is executing"
        );
        assert!(
            !self.started() || !inner.is_running.get(),
            "cannot destroy a running coroutine"
        );

        // Safety: asserted above that nothing is executing on this stack, so
        // reclaiming the allocation and recycling the stack is sound.
        let mut inner = unsafe { Box::from_raw(self.inner.as_ptr()) };
        if let Some(stack) = inner.stack.take() {
            stack::recycle(stack);
        }
    }
}

/// Non-owning reference to a [`Coro`]. Compares by identity.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CoroRef(pub(crate) NonNull<CoroInner>);

impl CoroRef {
    /// Identifier for debugging.
    pub fn tag(&self) -> &str {
        // Safety: callers keep the coroutine alive for the life of the ref.
        unsafe { self.0.as_ref().tag.as_str() }
    }

    /// True from init until the body returns or unwinds.
    pub fn is_running(&self) -> bool {
        unsafe { self.0.as_ref().is_running.get() }
    }

    /// Coroutine to yield to by default.
    pub fn parent(&self) -> Option<CoroRef> {
        unsafe { self.0.as_ref().parent.get().map(CoroRef) }
    }

    /// Redirects the default yield target.
    pub fn set_parent(&self, parent: CoroRef) {
        assert!(*self != parent, "coroutine cannot be its own parent");
        unsafe { self.0.as_ref().parent.set(Some(parent.0)) }
    }
}

/// Suspends the current coroutine and resumes `target`, carrying `value`.
/// Returns the value carried by whichever transfer later resumes the
/// current coroutine; a carried failure is re-raised here instead.
pub fn yield_to(target: CoroRef, value: *mut ()) -> *mut () {
    match transfer_to(target, Transfer::Value(value)) {
        Transfer::Value(value) => value,
        Transfer::Failure(failure) => failure.raise(),
    }
}

/// Suspends the current coroutine, resuming its parent.
pub fn suspend(value: *mut ()) -> *mut () {
    yield_to(parent_of_current(), value)
}

/// Suspends the current coroutine and raises `failure` on `target`.
pub fn yield_failure_to(target: CoroRef, failure: Failure) -> *mut () {
    match transfer_to(target, Transfer::Failure(failure)) {
        Transfer::Value(value) => value,
        Transfer::Failure(failure) => failure.raise(),
    }
}

/// Suspends the current coroutine and raises `failure` on its parent.
pub fn yield_failure(failure: Failure) -> *mut () {
    yield_failure_to(parent_of_current(), failure)
}

/// Raises the forced-unwind sentinel on `target` and waits for it to finish
/// unwinding. The target's parent must lead back to the current coroutine,
/// or control will not return here; [`Coro::new`] arranges that by default,
/// otherwise redirect with [`CoroRef::set_parent`] first.
///
/// No-op if the target has already finished.
pub fn force_unwind(target: CoroRef) {
    // Safety: same liveness contract as every CoroRef use.
    if unsafe { target.0.as_ref().fully_unwound.get() } {
        return;
    }

    tracing::debug!(tag = %target.tag(), "force unwinding coroutine");
    let value = yield_failure_to(target, Failure::forced_unwind());
    debug_assert!(value.is_null(), "coroutine yielded mid forced unwind");
}

fn parent_of_current() -> CoroRef {
    let current = current_coro();
    current.parent().expect("current coroutine has no parent")
}

fn transfer_to(target: CoroRef, payload: Transfer) -> Transfer {
    let current = current_coro();
    assert!(current != target, "cannot yield to self");

    // Safety: both pointers come from live handles; see CoroRef contract.
    let (current_inner, target_inner) = unsafe { (current.0.as_ref(), target.0.as_ref()) };
    assert!(
        !target_inner.fully_unwound.get(),
        "cannot yield to a finished coroutine"
    );
    let target_sp = target_inner
        .sp
        .get()
        .expect("target coroutine has no saved context");

    tracing::trace!(from = %current_inner.tag, to = %target_inner.tag, "switch");
    chain::set_current(target.0);

    let mut payload = ManuallyDrop::new(payload);
    // Safety: the encoded payload lives on this (suspended, intact) stack
    // until the receiver decodes it immediately after the switch. The save
    // slot is a Cell<Option<NonZeroUsize>>, layout-identical to usize.
    let received = unsafe {
        let encoded = Transfer::encode(&mut payload);
        let slot = current_inner.sp.as_ptr().cast::<usize>();
        arch::switch(encoded, slot, target_sp)
    };
    // Safety: the peer encoded a Transfer on its own suspended stack.
    let received = unsafe { Transfer::decode(received) };

    chain::maybe_drain_idle();

    received
}

/// Body trampoline: first resume lands here with the transfer payload and
/// the coroutine pointer set up by `init_stack`.
pub(crate) unsafe extern "C" fn coro_entry(arg: EncodedTransfer, inner: *mut CoroInner) -> ! {
    // Safety: the pointer was planted by init_stack and the inner outlives
    // the coroutine's entire execution.
    let inner = unsafe { &*inner };
    // Safety: encoded by the transfer that resumed us.
    let first = unsafe { Transfer::decode(arg) };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let value = match first {
            Transfer::Value(value) => value,
            Transfer::Failure(failure) => failure.raise(),
        };
        let body = inner
            .body
            .borrow_mut()
            .take()
            .expect("coroutine resumed without a body");

        tracing::debug!(tag = %inner.tag, "coroutine body starting");
        body(value);
        tracing::debug!(tag = %inner.tag, "coroutine body done");
    }));

    inner.is_running.set(false);

    let reply = match outcome {
        Ok(()) => Transfer::Value(ptr::null_mut()),
        Err(payload) => {
            let failure = Failure::from_panic(payload);
            if failure.is_forced_unwind() {
                tracing::debug!(tag = %inner.tag, "coroutine body done (forced unwind)");
                Transfer::Value(ptr::null_mut())
            } else {
                tracing::debug!(tag = %inner.tag, "coroutine body done (failure)");
                Transfer::Failure(failure)
            }
        }
    };

    // The body and everything it kept on this stack are gone; nobody may
    // resume us past this point.
    inner.fully_unwound.set(true);

    let parent = CoroRef(
        inner
            .parent
            .get()
            .expect("coroutine has no parent to return to"),
    );
    // Safety: parent liveness per the CoroRef contract.
    let parent_inner = unsafe { parent.0.as_ref() };
    let parent_sp = parent_inner
        .sp
        .get()
        .expect("parent coroutine has no saved context");

    tracing::trace!(from = %inner.tag, to = %parent_inner.tag, "final switch");
    chain::set_current(parent.0);

    let mut reply = ManuallyDrop::new(reply);
    // Safety: as in transfer_to; the receiver decodes before this stack can
    // be recycled, and the fully_unwound flag guards against any resume.
    unsafe {
        let encoded = Transfer::encode(&mut reply);
        let slot = inner.sp.as_ptr().cast::<usize>();
        arch::switch(encoded, slot, parent_sp);
    }

    unreachable!("finished coroutine was resumed");
}
