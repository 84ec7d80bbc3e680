//! A minimal single-threaded run loop for driving the end-to-end tests:
//! a FIFO action queue as the scheduler hook, plus monotonic-clock timers.

#![allow(dead_code)]

use awaitable::{Action, Awaitable, init_scheduler};
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

struct Timer {
    due: Instant,
    seq: u64,
    action: Action,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest timer wins.
        other.due.cmp(&self.due).then(other.seq.cmp(&self.seq))
    }
}

#[derive(Clone)]
pub struct Looper {
    queue: Rc<RefCell<VecDeque<Action>>>,
    timers: Rc<RefCell<BinaryHeap<Timer>>>,
    seq: Rc<Cell<u64>>,
}

impl Looper {
    /// Creates a looper and installs it as this thread's scheduler hook.
    pub fn install() -> Self {
        let queue: Rc<RefCell<VecDeque<Action>>> = Rc::default();
        init_scheduler({
            let queue = queue.clone();
            move |action| queue.borrow_mut().push_back(action)
        });

        Self {
            queue,
            timers: Rc::default(),
            seq: Rc::default(),
        }
    }

    /// Runs `action` once `delay` has elapsed.
    pub fn schedule_after(&self, delay: Duration, action: impl FnOnce() + 'static) {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        self.timers.borrow_mut().push(Timer {
            due: Instant::now() + delay,
            seq,
            action: Box::new(action),
        });
    }

    /// Dispatches queued actions and due timers until nothing is left,
    /// sleeping through gaps before pending timers.
    pub fn run_until_idle(&self) {
        loop {
            loop {
                let action = self.queue.borrow_mut().pop_front();
                let Some(action) = action else { break };
                action();
            }

            let now = Instant::now();
            let next_due = self.timers.borrow().peek().map(|timer| timer.due);
            match next_due {
                None => break,
                Some(due) if due <= now => {
                    let timer = self.timers.borrow_mut().pop().expect("timer vanished");
                    (timer.action)();
                }
                Some(due) => thread::sleep(due - now),
            }
        }
    }
}

/// An awaitable that completes after `ms` milliseconds, driven by the
/// looper's timer wheel.
pub fn async_delay(looper: &Looper, ms: u64) -> Awaitable {
    let mut awt = Awaitable::new(format!("delay-{ms}"));
    let completer = awt.take_completer();
    looper.schedule_after(Duration::from_millis(ms), move || completer.complete());
    awt
}
