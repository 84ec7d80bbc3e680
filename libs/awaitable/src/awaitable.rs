// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Single-shot async results.
//!
//! An [`Awaitable`] represents a unit of work expected to finish at some
//! point in the future. From inside a coroutine, [`Awaitable::wait`] appears
//! to block until the operation completes or fails; in reality the coroutine
//! suspends and yields to the master coro, leaving the thread free.
//!
//! An awaitable either gets completed from the outside through a
//! [`Completer`] handle, or it is produced by [`start_async`], which binds a
//! coroutine whose body computes the result.
//!
//! The awaitable owns its asynchronous operation: dropping it cancels the
//! operation, force-unwinding a still-running bound coroutine and expiring
//! every completer copy.

use crate::scheduler;
use crate::signal::{Signal, SignalConnection};
use coro::{Coro, CoroRef, Failure, PushMaster, current_coro, master_coro};
use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::rc::{Rc, Weak};
use std::sync::OnceLock;

/// Stored on an awaitable that was destroyed while armed but without a
/// bound coroutine: the completer can no longer resume anyone.
#[derive(Debug)]
pub struct YieldForbidden;

impl fmt::Display for YieldForbidden {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("awaitable was destroyed while still armed")
    }
}

fn yield_forbidden_failure() -> Failure {
    static YIELD_FORBIDDEN: OnceLock<Failure> = OnceLock::new();
    YIELD_FORBIDDEN
        .get_or_init(|| Failure::new(YieldForbidden))
        .clone()
}

pub(crate) struct AwaitableInner {
    tag: RefCell<String>,
    /// Owned coroutine computing the result, if produced by [`start_async`].
    bound: RefCell<Option<Coro>>,
    /// Non-owning back-reference to the coro suspended on this awaitable.
    awaiting: Cell<Option<CoroRef>>,
    did_complete: Cell<bool>,
    failure: RefCell<Option<Failure>>,
    /// Present while a completer is outstanding; dropping it expires every
    /// completer copy at once.
    guard: RefCell<Option<Rc<CompleterGuard>>>,
    completer_taken: Cell<bool>,
    on_done: Signal,
    user_data: RefCell<Option<Box<dyn Any>>>,
}

impl AwaitableInner {
    fn new(tag: String) -> Self {
        Self {
            tag: RefCell::new(tag),
            bound: RefCell::new(None),
            awaiting: Cell::new(None),
            did_complete: Cell::new(false),
            failure: RefCell::new(None),
            guard: RefCell::new(None),
            completer_taken: Cell::new(false),
            on_done: Signal::new(),
            user_data: RefCell::new(None),
        }
    }

    fn is_done(&self) -> bool {
        self.did_complete.get() || self.failure.borrow().is_some()
    }

    fn is_armed(&self) -> bool {
        self.guard.borrow().is_some() || self.bound.borrow().is_some()
    }
}

struct CompleterGuard {
    awt: NonNull<AwaitableInner>,
    done: Cell<bool>,
}

/// Wrapper for an asynchronous operation.
///
/// Not thread safe; designed for single-threaded use.
pub struct Awaitable {
    inner: Box<AwaitableInner>,
}

// === impl Awaitable ===

impl Awaitable {
    /// Creates an awaitable that is not yet armed; see
    /// [`Awaitable::take_completer`].
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            inner: Box::new(AwaitableInner::new(tag.into())),
        }
    }

    /// Creates an already-completed awaitable.
    pub fn completed(tag: impl Into<String>) -> Self {
        let awt = Self::new(tag);
        awt.inner.did_complete.set(true);
        awt
    }

    /// Creates an already-failed awaitable.
    pub fn failed(tag: impl Into<String>, failure: Failure) -> Self {
        let awt = Self::new(tag);
        awt.inner.failure.borrow_mut().replace(failure);
        awt
    }

    /// Arms the awaitable and returns the handle that will finish it.
    /// The completer may be copied freely; completion happens at most once
    /// no matter how many copies exist.
    pub fn take_completer(&mut self) -> Completer {
        let inner = &*self.inner;
        assert!(!inner.completer_taken.get(), "completer already taken");
        assert!(!inner.is_done(), "awaitable is already done");

        let guard = Rc::new(CompleterGuard {
            awt: NonNull::from(inner),
            done: Cell::new(false),
        });
        let completer = Completer {
            guard: Rc::downgrade(&guard),
        };
        inner.guard.borrow_mut().replace(guard);
        inner.completer_taken.set(true);

        completer
    }

    /// Suspends the current coroutine until this awaitable is done.
    ///
    /// Returns immediately if already completed. If the awaitable failed —
    /// before or during the wait — the failure is re-raised here, and again
    /// on every subsequent call.
    ///
    /// Must be called from a coroutine other than the master; the main
    /// stack polls with [`Awaitable::is_done`] instead.
    pub fn wait(&self) {
        // Safety: `self` keeps the inner alive up to the suspension point;
        // see wait_at for the liveness rules beyond it.
        unsafe { wait_at(NonNull::from(&*self.inner)) }
    }

    /// True if the operation has completed successfully.
    pub fn did_complete(&self) -> bool {
        self.inner.did_complete.get()
    }

    /// True if the operation has failed.
    pub fn did_fail(&self) -> bool {
        self.inner.failure.borrow().is_some()
    }

    /// True if completed or failed.
    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    /// The failure set on fail, if any.
    pub fn failure(&self) -> Option<Failure> {
        self.inner.failure.borrow().clone()
    }

    /// Identifier for debugging.
    pub fn tag(&self) -> Ref<'_, str> {
        Ref::map(self.inner.tag.borrow(), String::as_str)
    }

    /// Sets an identifier for debugging.
    pub fn set_tag(&self, tag: impl Into<String>) {
        *self.inner.tag.borrow_mut() = tag.into();
    }

    /// Adds a handler called when the awaitable completes or fails, before
    /// any awaiting coroutine is resumed.
    pub fn connect_done(&self, slot: impl FnMut() + 'static) -> SignalConnection {
        self.inner.on_done.connect(slot)
    }

    /// Like [`Awaitable::connect_done`] but non-removable.
    pub fn connect_done_lite(&self, slot: impl FnMut() + 'static) {
        self.inner.on_done.connect_lite(slot);
    }

    /// Associates custom data with this awaitable, replacing any previous
    /// binding. The data is dropped together with the awaitable.
    pub fn bind_user_data<T: Any>(&self, data: T) {
        self.inner.user_data.borrow_mut().replace(Box::new(data));
    }

    /// Accesses bound user data. Panics if no data of that type is bound.
    pub fn user_data<T: Any>(&self) -> RefMut<'_, T> {
        self.try_user_data()
            .expect("no user data of the requested type is bound")
    }

    /// Accesses bound user data, if any of that type is bound.
    pub fn try_user_data<T: Any>(&self) -> Option<RefMut<'_, T>> {
        RefMut::filter_map(self.inner.user_data.borrow_mut(), |slot| {
            slot.as_mut()?.downcast_mut::<T>()
        })
        .ok()
    }

    pub(crate) fn awaiting_coro(&self) -> Option<CoroRef> {
        self.inner.awaiting.get()
    }

    pub(crate) fn set_awaiting_coro(&self, coro: Option<CoroRef>) {
        self.inner.awaiting.set(coro);
    }

    pub(crate) fn inner_ptr(&self) -> NonNull<AwaitableInner> {
        NonNull::from(&*self.inner)
    }
}

impl Drop for Awaitable {
    fn drop(&mut self) {
        let inner = &*self.inner;
        let status = if inner.did_complete.get() {
            "completed"
        } else if inner.failure.borrow().is_some() {
            "failed"
        } else {
            "interrupted"
        };
        tracing::debug!(awt = %inner.tag.borrow(), status, "destroy awaitable");

        if !inner.is_done() {
            // The awaiter may outlive this awaitable; the back-reference is
            // non-owning and simply goes away.
            inner.awaiting.set(None);

            let bound_running = inner
                .bound
                .borrow()
                .as_ref()
                .is_some_and(Coro::is_running);
            if bound_running {
                let target = inner.bound.borrow().as_ref().expect("bound coro missing").as_ref();
                // The final yield of the unwinding coroutine must land back
                // here, which the elevated master guarantees.
                let _master = PushMaster::new();
                coro::force_unwind(target);
            } else if inner.completer_taken.get() {
                // Safety: `self.inner` is alive; no coroutine is bound, so
                // the call cannot transfer away and use-after-free.
                unsafe { finish_at(NonNull::from(inner), Some(yield_forbidden_failure())) };
            }
        }

        let bound = inner.bound.borrow_mut().take();
        drop(bound);
    }
}

/// Copyable handle that finishes its awaitable.
///
/// A completer expires once the awaitable is completed, failed, or
/// destroyed; operations on an expired completer are no-ops. This gives
/// at-most-once completion regardless of how many copies exist.
#[derive(Clone)]
pub struct Completer {
    guard: Weak<CompleterGuard>,
}

// === impl Completer ===

impl Completer {
    /// Completes the awaitable, resuming its awaiting coroutine if any.
    /// Must be invoked from the master coro.
    pub fn complete(&self) {
        let Some(guard) = self.live() else { return };
        assert!(
            current_coro() == master_coro(),
            "completer must be invoked from the master coro"
        );
        guard.done.set(true);
        // Safety: the guard's liveness proves the awaitable is alive.
        unsafe { finish_at(guard.awt, None) }
    }

    /// Fails the awaitable, raising the failure on its awaiting coroutine
    /// if any. Must be invoked from the master coro.
    pub fn fail(&self, failure: Failure) {
        let Some(guard) = self.live() else { return };
        assert!(
            current_coro() == master_coro(),
            "completer must be invoked from the master coro"
        );
        guard.done.set(true);
        // Safety: as in complete().
        unsafe { finish_at(guard.awt, Some(failure)) }
    }

    /// Whether completion has already happened or the awaitable is gone.
    pub fn is_expired(&self) -> bool {
        self.live().is_none()
    }

    /// Schedules [`Completer::complete`] on the host loop. Unlike
    /// `complete` itself this may be called from any coroutine.
    pub fn schedule_complete(&self) {
        let completer = self.clone();
        scheduler::schedule(move || completer.complete());
    }

    /// Schedules [`Completer::fail`] on the host loop. May be called from
    /// any coroutine.
    pub fn schedule_fail(&self, failure: Failure) {
        let completer = self.clone();
        scheduler::schedule(move || completer.fail(failure));
    }

    /// Adapts a raw callback: runs `callback` and finishes the awaitable
    /// with its outcome. The wrapper is a no-op if the completer has expired
    /// by the time the callback fires.
    pub fn wrap<A>(
        &self,
        callback: impl FnOnce(A) -> Result<(), Failure> + 'static,
    ) -> impl FnOnce(A) + 'static {
        let completer = self.clone();
        move |arg| {
            if completer.is_expired() {
                return;
            }
            match callback(arg) {
                Ok(()) => completer.complete(),
                Err(failure) => completer.fail(failure),
            }
        }
    }

    fn live(&self) -> Option<Rc<CompleterGuard>> {
        self.guard.upgrade().filter(|guard| !guard.done.get())
    }
}

/// Marks the awaitable done and hands control to its awaiter.
///
/// # Safety
///
/// `awt` must point to a live `AwaitableInner`. When an awaiting coroutine
/// is registered, control transfers into it before this returns, and the
/// awaitable may be destroyed in the meantime — nothing touches `awt` after
/// the transfer.
unsafe fn finish_at(awt: NonNull<AwaitableInner>, failure: Option<Failure>) {
    // Safety: per contract.
    let inner = unsafe { awt.as_ref() };

    match failure {
        None => {
            tracing::debug!(awt = %inner.tag.borrow(), "complete awaitable");
            assert!(!inner.did_complete.get(), "awaitable already complete");
            assert!(
                inner.failure.borrow().is_none(),
                "cannot complete an awaitable that has failed"
            );
            inner.did_complete.set(true);
        }
        Some(failure) => {
            tracing::debug!(awt = %inner.tag.borrow(), ?failure, "fail awaitable");
            assert!(
                inner.failure.borrow().is_none(),
                "awaitable already failed"
            );
            assert!(
                !inner.did_complete.get(),
                "cannot fail an awaitable that has completed"
            );
            inner.failure.borrow_mut().replace(failure);
        }
    }

    inner.guard.borrow_mut().take();
    inner.on_done.emit();

    if let Some(awaiter) = inner.awaiting.get() {
        let current = current_coro();
        let from_bound = inner
            .bound
            .borrow()
            .as_ref()
            .is_some_and(|coro| coro.as_ref() == current);
        assert!(
            current == master_coro() || from_bound,
            "awaitable finished from the wrong coroutine"
        );
        coro::yield_to(awaiter, ptr::null_mut());
    }
}

/// Suspends the current coroutine on the awaitable at `awt`.
///
/// # Safety
///
/// `awt` must point to a live `AwaitableInner` and must stay alive for as
/// long as this coroutine is suspended on it — unless the suspension ends by
/// forced unwind, which re-raises out of the transfer without ever touching
/// the pointer again.
unsafe fn wait_at(awt: NonNull<AwaitableInner>) {
    // Safety: per contract.
    let inner = unsafe { awt.as_ref() };

    tracing::debug!(
        coro = %current_coro().tag(),
        awt = %inner.tag.borrow(),
        "await"
    );
    assert!(
        current_coro() != master_coro(),
        "cannot await from the master coro"
    );
    assert!(
        inner.awaiting.get().is_none(),
        "awaitable is already being awaited"
    );

    let failure = inner.failure.borrow().clone();
    if let Some(failure) = failure {
        failure.raise();
    }
    if inner.did_complete.get() {
        return;
    }

    assert!(
        inner.is_armed(),
        "awaitable has no completer and no bound coroutine"
    );
    inner.awaiting.set(Some(current_coro()));

    coro::yield_to(master_coro(), ptr::null_mut());

    // Resumed by the transfer inside finish_at; a forced unwind of this
    // coroutine raises inside yield_to and never gets here.
    // Safety: liveness is guaranteed by whoever finished the awaitable.
    let inner = unsafe { awt.as_ref() };
    debug_assert!(inner.is_done(), "awaiter resumed before the awaitable finished");
    inner.awaiting.set(None);

    let failure = inner.failure.borrow().clone();
    if let Some(failure) = failure {
        failure.raise();
    }
}

/// Runs `body` in a new coroutine and returns an awaitable that finishes
/// when the body does: completed on return, failed with the caught failure
/// on panic.
///
/// The body is run eagerly through its first suspension before this
/// returns. Dropping the returned awaitable while the body is still running
/// interrupts it with a forced unwind; bodies must let that propagate.
pub fn start_async(tag: impl Into<String>, body: impl FnOnce() + 'static) -> Awaitable {
    start_async_with_stack(tag, body, coro::default_stack_size())
}

/// [`start_async`] with an explicit stack size for the bound coroutine.
pub fn start_async_with_stack(
    tag: impl Into<String>,
    body: impl FnOnce() + 'static,
    stack_size: usize,
) -> Awaitable {
    let tag = tag.into();
    tracing::debug!(awt = %tag, "starting async operation");

    let awt = Awaitable::new(tag.clone());
    let target = awt.inner_ptr();

    let coro = Coro::with_stack_size(
        tag,
        move |_| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(body));
            let failure = outcome.err().map(Failure::from_panic);

            // Safety: the awaitable owns this coroutine, so it is alive for
            // the entire body.
            let inner = unsafe { target.as_ref() };
            debug_assert!(!inner.is_done(), "async body finished its own awaitable");

            // The final yield must not happen before this stack has fully
            // unwound, so rather than transferring here, redirect the
            // trampoline's final yield: to the awaiter if one is suspended
            // on us, otherwise back to the master.
            let current = current_coro();
            match inner.awaiting.get() {
                Some(awaiter) => {
                    current.set_parent(awaiter);
                    inner.awaiting.set(None);
                }
                None => current.set_parent(master_coro()),
            }

            // With no awaiter registered this cannot yield from in here.
            // Safety: as above.
            unsafe { finish_at(target, failure) };
        },
        stack_size,
    );

    coro.as_ref().set_parent(master_coro());
    let coro_ref = coro.as_ref();
    awt.inner.bound.borrow_mut().replace(coro);

    {
        // Run the body until it first suspends or completes.
        let _master = PushMaster::new();
        coro::yield_to(coro_ref, ptr::null_mut());
    }

    awt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestQueue;
    use std::cell::RefCell;

    #[test]
    fn completer_flips_the_state() {
        let mut awt = Awaitable::new("manual");
        assert!(!awt.is_done());

        let completer = awt.take_completer();
        assert!(!completer.is_expired());

        completer.complete();
        assert!(awt.did_complete());
        assert!(!awt.did_fail());
        assert!(completer.is_expired());
    }

    #[test]
    fn failing_stores_the_failure() {
        let mut awt = Awaitable::new("manual");
        let completer = awt.take_completer();

        let failure = Failure::new("went sideways");
        completer.fail(failure.clone());

        assert!(awt.did_fail());
        assert!(!awt.did_complete());
        assert!(awt.failure().unwrap().ptr_eq(&failure));
    }

    #[test]
    #[should_panic(expected = "completer already taken")]
    fn second_take_completer_panics() {
        let mut awt = Awaitable::new("manual");
        let _completer = awt.take_completer();
        let _ = awt.take_completer();
    }

    #[test]
    fn extra_completions_are_no_ops() {
        let mut awt = Awaitable::new("manual");
        let completer = awt.take_completer();
        let copy = completer.clone();

        completer.complete();
        copy.complete();
        copy.fail(Failure::new("late"));

        assert!(awt.did_complete());
        assert!(!awt.did_fail());
    }

    #[test]
    fn completers_expire_when_the_awaitable_drops() {
        let mut awt = Awaitable::new("manual");
        let completer = awt.take_completer();
        drop(awt);

        assert!(completer.is_expired());
        completer.complete();
    }

    #[test]
    #[should_panic(expected = "cannot await from the master coro")]
    fn waiting_from_the_master_panics() {
        let mut awt = Awaitable::new("manual");
        let _completer = awt.take_completer();
        awt.wait();
    }

    #[test]
    fn ready_awaitables_return_immediately() {
        let awt = Awaitable::completed("done");

        let outer = start_async("outer", move || {
            awt.wait();
        });

        assert!(outer.did_complete());
    }

    #[test]
    fn body_runs_eagerly_to_completion() {
        let ran = Rc::new(Cell::new(false));

        let awt = start_async("eager", {
            let ran = ran.clone();
            move || ran.set(true)
        });

        assert!(ran.get());
        assert!(awt.did_complete());
    }

    #[test]
    fn body_runs_through_the_first_suspension() {
        let mut gate = Awaitable::new("gate");
        let completer = gate.take_completer();
        let phase = Rc::new(Cell::new(0));

        let awt = start_async("waiter", {
            let phase = phase.clone();
            move || {
                phase.set(1);
                gate.wait();
                phase.set(2);
            }
        });

        // start_async returned at the suspension inside wait()
        assert_eq!(phase.get(), 1);
        assert!(!awt.is_done());

        completer.complete();
        assert_eq!(phase.get(), 2);
        assert!(awt.did_complete());
    }

    #[test]
    fn body_panic_fails_the_awaitable_with_identity() {
        let failure = Failure::new(1234_u32);

        let awt = start_async("exploding", {
            let failure = failure.clone();
            move || failure.raise()
        });

        assert!(awt.did_fail());
        assert!(awt.failure().unwrap().ptr_eq(&failure));
    }

    #[test]
    fn waiting_on_a_failed_awaitable_reraises() {
        let failure = Failure::new("inner broke");
        let inner = Awaitable::failed("inner", failure.clone());

        let outer = start_async("outer", move || {
            inner.wait();
        });

        assert!(outer.did_fail());
        assert!(outer.failure().unwrap().ptr_eq(&failure));
    }

    #[test]
    fn done_signal_fires_before_the_awaiter_resumes() {
        let order = Rc::new(RefCell::new(Vec::new()));

        let mut gate = Awaitable::new("gate");
        let completer = gate.take_completer();
        gate.connect_done_lite({
            let order = order.clone();
            move || order.borrow_mut().push("done-signal")
        });

        let _awt = start_async("waiter", {
            let order = order.clone();
            move || {
                gate.wait();
                order.borrow_mut().push("awaiter");
            }
        });

        completer.complete();
        assert_eq!(*order.borrow(), ["done-signal", "awaiter"]);
    }

    #[test]
    fn dropping_an_armed_awaitable_synthesizes_yield_forbidden() {
        let fired = Rc::new(Cell::new(false));

        let mut awt = Awaitable::new("armed");
        let completer = awt.take_completer();
        awt.connect_done_lite({
            let fired = fired.clone();
            move || fired.set(true)
        });

        drop(awt);
        assert!(fired.get());
        assert!(completer.is_expired());
    }

    #[test]
    fn dropping_a_nil_awaitable_is_quiet() {
        let fired = Rc::new(Cell::new(false));

        let awt = Awaitable::new("nil");
        awt.connect_done_lite({
            let fired = fired.clone();
            move || fired.set(true)
        });

        drop(awt);
        assert!(!fired.get());
    }

    #[test]
    fn dropping_mid_flight_force_unwinds_the_body() {
        struct SetOnDrop(Rc<Cell<bool>>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let unwound = Rc::new(Cell::new(false));
        let mut gate = Awaitable::new("gate");
        let _completer = gate.take_completer();

        let awt = start_async("doomed", {
            let unwound = unwound.clone();
            move || {
                let _guard = SetOnDrop(unwound);
                gate.wait();
            }
        });

        assert!(!unwound.get());
        drop(awt);
        assert!(unwound.get());
    }

    #[test]
    fn nested_start_async_cancels_inner_work() {
        let inner_unwound = Rc::new(Cell::new(false));

        struct SetOnDrop(Rc<Cell<bool>>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let mut gate = Awaitable::new("gate");
        let _completer = gate.take_completer();

        let outer = start_async("outer", {
            let inner_unwound = inner_unwound.clone();
            move || {
                let inner = start_async("inner", {
                    let inner_unwound = inner_unwound.clone();
                    move || {
                        let _guard = SetOnDrop(inner_unwound);
                        gate.wait();
                    }
                });
                inner.wait();
            }
        });

        // Dropping the outer awaitable unwinds its body, which drops the
        // inner awaitable, which unwinds the inner body.
        drop(outer);
        assert!(inner_unwound.get());
    }

    #[test]
    fn schedule_complete_hops_through_the_loop() {
        let queue = TestQueue::install();

        let mut awt = Awaitable::new("hop");
        let completer = awt.take_completer();

        let driver = start_async("driver", move || {
            completer.schedule_complete();
            awt.wait();
        });

        assert!(!driver.is_done());
        queue.pump();
        assert!(driver.did_complete());
    }

    #[test]
    fn user_data_round_trips() {
        let awt = Awaitable::new("carrier");
        awt.bind_user_data(41_u32);
        *awt.user_data::<u32>() += 1;

        assert_eq!(*awt.user_data::<u32>(), 42);
        assert!(awt.try_user_data::<String>().is_none());
    }

    #[test]
    fn wrap_adapts_raw_callbacks() {
        let mut awt = Awaitable::new("wrapped");
        let callback = awt.take_completer().wrap(|code: i32| {
            if code == 0 {
                Ok(())
            } else {
                Err(Failure::new(code))
            }
        });

        callback(0);
        assert!(awt.did_complete());

        let mut awt = Awaitable::new("wrapped-err");
        let callback = awt.take_completer().wrap(|code: i32| {
            if code == 0 {
                Ok(())
            } else {
                Err(Failure::new(code))
            }
        });

        callback(3);
        assert!(awt.did_fail());
        assert_eq!(awt.failure().unwrap().downcast_ref::<i32>(), Some(&3));
    }
}
