//! In-crate test support: a hand-pumped scheduler queue.

use crate::scheduler::{Action, init_scheduler};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Installs a FIFO queue as this thread's scheduler hook; tests drain it by
/// hand with [`TestQueue::pump`].
#[derive(Clone)]
pub struct TestQueue {
    queue: Rc<RefCell<VecDeque<Action>>>,
}

impl TestQueue {
    pub fn install() -> Self {
        let queue: Rc<RefCell<VecDeque<Action>>> = Rc::default();
        init_scheduler({
            let queue = queue.clone();
            move |action| queue.borrow_mut().push_back(action)
        });
        Self { queue }
    }

    /// Runs queued actions until the queue is empty, including actions
    /// queued while pumping.
    pub fn pump(&self) {
        loop {
            let action = self.queue.borrow_mut().pop_front();
            let Some(action) = action else { break };
            action();
        }
    }
}
