// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Payloads that cross a coroutine switch.
//!
//! A transfer is either a plain value pointer or a [`Failure`]. Failures are
//! re-raised on the receiving stack via [`std::panic::resume_unwind`], with
//! the `Failure` itself as the panic payload, so the same failure keeps its
//! identity across any number of coroutine hops.

use std::any::Any;
use std::fmt;
use std::mem::ManuallyDrop;
use std::panic;
use std::ptr;
use std::sync::{Arc, OnceLock};

/// What a suspended coroutine hands to the one it resumes.
pub(crate) enum Transfer {
    Value(*mut ()),
    Failure(Failure),
}

/// A transfer as it crosses the switch: a single machine word.
pub(crate) type EncodedTransfer = usize;

impl Transfer {
    /// Encodes for a switch. A transfer is two words and never fits a
    /// register, so it always travels as a pointer to a slot in the sender's
    /// frame. The sender logically gives the slot up here; it must stay
    /// untouched until the receiver has decoded it.
    pub(crate) unsafe fn encode(slot: &mut ManuallyDrop<Transfer>) -> EncodedTransfer {
        ptr::from_mut(slot) as EncodedTransfer
    }

    /// Takes ownership of a transfer encoded by the peer.
    pub(crate) unsafe fn decode(encoded: EncodedTransfer) -> Transfer {
        // Safety: the peer is suspended with its frame intact, and the slot
        // belongs to us since the switch.
        unsafe { ptr::read((encoded as *const ManuallyDrop<Transfer>).cast()) }
    }
}

/// A failure travelling between coroutines.
///
/// Cheap to clone; identity is pointer identity of the shared payload, see
/// [`Failure::ptr_eq`]. Panics caught at a coroutine boundary are converted
/// with [`Failure::from_panic`] and re-raised with [`Failure::raise`].
#[derive(Clone)]
pub struct Failure {
    payload: Arc<dyn Any + Send + Sync>,
}

impl Failure {
    /// Wraps a value in a failure.
    pub fn new<E: Any + Send + Sync>(payload: E) -> Self {
        Self {
            payload: Arc::new(payload),
        }
    }

    /// Converts a caught panic payload into a failure.
    ///
    /// A payload that already is a `Failure` passes through untouched, so
    /// identity survives repeated catch/re-raise cycles. String payloads are
    /// wrapped; anything else is carried opaquely.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<Failure>() {
            Ok(failure) => *failure,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(msg) => Self::new(*msg),
                Err(payload) => match payload.downcast::<String>() {
                    Ok(msg) => Self::new(*msg),
                    Err(payload) => Self {
                        payload: Arc::new(OpaquePanic(payload)),
                    },
                },
            },
        }
    }

    /// Re-raises the failure on the current stack.
    pub fn raise(self) -> ! {
        panic::resume_unwind(Box::new(self))
    }

    /// Accesses the payload if it is a `E`.
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.payload.downcast_ref()
    }

    /// Two failures are the same failure if they share a payload.
    pub fn ptr_eq(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.payload, &other.payload)
    }

    /// The sentinel raised into a coroutine to tear it down.
    ///
    /// Allocated once per process; recognized by identity.
    pub fn forced_unwind() -> Failure {
        static FORCED_UNWIND: OnceLock<Failure> = OnceLock::new();
        FORCED_UNWIND.get_or_init(|| Failure::new(ForcedUnwind)).clone()
    }

    /// Whether this is the forced-unwind sentinel.
    pub fn is_forced_unwind(&self) -> bool {
        self.ptr_eq(&Self::forced_unwind())
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_forced_unwind() {
            f.write_str("Failure(ForcedUnwind)")
        } else if let Some(msg) = self.downcast_ref::<&'static str>() {
            write!(f, "Failure({msg:?})")
        } else if let Some(msg) = self.downcast_ref::<String>() {
            write!(f, "Failure({msg:?})")
        } else {
            f.write_str("Failure(..)")
        }
    }
}

/// Raised into a coroutine that must exit promptly. Swallowed by the
/// coroutine trampoline; user bodies must let it propagate.
#[derive(Debug)]
pub struct ForcedUnwind;

impl fmt::Display for ForcedUnwind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("coroutine forcibly unwound")
    }
}

// Carries a foreign panic payload for identity only; the inner box is never
// read through the shared handle.
struct OpaquePanic(#[allow(dead_code)] Box<dyn Any + Send>);

unsafe impl Sync for OpaquePanic {}
