// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Awaitables: callback-driven async code that reads linearly.
//!
//! This crate layers single-shot async result objects on top of the
//! stackful coroutines from [`coro`]. The pieces:
//!
//! - [`Awaitable`] — a pending async operation. Inside a coroutine,
//!   [`Awaitable::wait`] reads like a blocking call but actually suspends
//!   and yields to the master coro.
//! - [`Completer`] — copyable completion handle with at-most-once
//!   semantics, for hooking awaitables up to external callbacks.
//! - [`start_async`] — runs a body in a fresh coroutine and hands back an
//!   awaitable that finishes when the body does.
//! - [`await_all`] / [`await_any`] and their composed forms [`async_all`] /
//!   [`async_any`].
//! - [`init_scheduler`] / [`schedule`] / [`schedule_with_ticket`] — the
//!   bridge to the host program's main loop, whatever that is.
//!
//! ```no_run
//! use awaitable::{Awaitable, start_async};
//!
//! # fn async_read(host: &str) -> Awaitable { Awaitable::completed(host) }
//! let transfer = start_async("transfer", || {
//!     let data = async_read("example.org");
//!     data.wait(); // suspends, the thread keeps spinning its loop
//! });
//! ```
//!
//! Everything here is single-threaded by construction: each thread gets its
//! own runtime instance, and callbacks arriving on foreign threads must hop
//! through the host loop before touching an awaitable.

mod awaitable;
mod combinators;
mod condition;
mod queue;
mod scheduler;
mod signal;
#[cfg(test)]
mod test_util;

pub use crate::awaitable::{
    Awaitable, Completer, YieldForbidden, start_async, start_async_with_stack,
};
pub use crate::combinators::{
    AnySelection, AsAwaitable, async_all, async_any, await_all, await_any,
};
pub use crate::condition::Condition;
pub use crate::queue::{BoundedQueue, PopSlot};
pub use crate::scheduler::{Action, Ticket, init_scheduler, schedule, schedule_with_ticket};
pub use crate::signal::{Signal, SignalConnection};

// The coro-level vocabulary that shows up in this crate's API.
pub use coro::{CoroRef, Failure, ForcedUnwind, PushMaster, current_coro, master_coro};
