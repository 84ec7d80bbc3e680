// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lightweight single-threaded signal, used for done notifications.

use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

type Slot = Box<dyn FnMut()>;

struct Hook {
    slot: Slot,
    canceled: Option<Rc<Cell<bool>>>,
}

impl Hook {
    fn is_canceled(&self) -> bool {
        self.canceled.as_ref().is_some_and(|flag| flag.get())
    }
}

/// Multi-subscriber notifier.
///
/// Emission is re-entrant safe: slots connected during an emit are only seen
/// by the next emit, disconnections during an emit are honored. Emitting
/// from inside a slot is a programmer error.
#[derive(Default)]
pub struct Signal {
    hooks: RefCell<SmallVec<[Hook; 2]>>,
    pending: RefCell<Vec<Hook>>,
    emitting: Cell<bool>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a slot; the returned connection can disconnect it again,
    /// also mid-emit.
    pub fn connect(&self, slot: impl FnMut() + 'static) -> SignalConnection {
        let flag = Rc::new(Cell::new(false));
        self.push(Hook {
            slot: Box::new(slot),
            canceled: Some(flag.clone()),
        });

        SignalConnection { flag: Some(flag) }
    }

    /// Connects a slot that can never be disconnected. Slightly cheaper:
    /// no cancellation flag is allocated.
    pub fn connect_lite(&self, slot: impl FnMut() + 'static) {
        self.push(Hook {
            slot: Box::new(slot),
            canceled: None,
        });
    }

    /// Disconnects every slot. May not be called while emitting.
    pub fn disconnect_all(&self) {
        assert!(!self.emitting.get(), "may not disconnect all slots mid-emit");
        self.hooks.borrow_mut().clear();
        self.pending.borrow_mut().clear();
    }

    /// Calls every connected slot in connection order.
    pub fn emit(&self) {
        assert!(!self.emitting.get(), "may not emit a signal from a slot");

        struct EmitGuard<'a>(&'a Cell<bool>);
        impl Drop for EmitGuard<'_> {
            fn drop(&mut self) {
                self.0.set(false);
            }
        }

        self.emitting.set(true);
        let _guard = EmitGuard(&self.emitting);

        let count = self.hooks.borrow().len();
        for index in 0..count {
            let mut hooks = self.hooks.borrow_mut();
            let hook = &mut hooks[index];
            if hook.is_canceled() {
                continue;
            }
            // The borrow is held across the call; re-entrant connects go
            // through `pending`, disconnects only touch their flag.
            (hook.slot)();
        }

        drop(_guard);

        let mut hooks = self.hooks.borrow_mut();
        hooks.extend(self.pending.borrow_mut().drain(..));
        hooks.retain(|hook| !hook.is_canceled());
    }

    fn push(&self, hook: Hook) {
        if self.emitting.get() {
            self.pending.borrow_mut().push(hook);
        } else {
            self.hooks.borrow_mut().push(hook);
        }
    }
}

/// Allows disconnecting a single slot from a [`Signal`].
#[derive(Default)]
pub struct SignalConnection {
    flag: Option<Rc<Cell<bool>>>,
}

impl SignalConnection {
    /// Disconnects the associated slot. Safe to call while the signal is
    /// being emitted and more than once.
    pub fn disconnect(&mut self) {
        if let Some(flag) = self.flag.take() {
            flag.set(true);
        }
    }
}
