//! Size-keyed recycling of coroutine stacks.
//!
//! Transient coroutines come and go far faster than mmap wants to; recycled
//! stacks keep the churn off the kernel. The pool is thread-local like the
//! rest of the runtime.

use crate::stack::OsStack;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io;

const INITIAL_DEFAULT_STACK_SIZE: usize = 1024 * 1024;

thread_local! {
    static POOL: RefCell<BTreeMap<usize, Vec<OsStack>>> = RefCell::new(BTreeMap::new());
    static DEFAULT_STACK_SIZE: Cell<usize> = const { Cell::new(INITIAL_DEFAULT_STACK_SIZE) };
}

/// Default stack size for new coroutines on this thread.
pub fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE.get()
}

/// Changes the default stack size for new coroutines on this thread.
pub fn set_default_stack_size(size: usize) {
    DEFAULT_STACK_SIZE.set(size);
}

/// Takes the smallest cached stack that satisfies `min_size`, or maps a
/// fresh one on a miss.
pub(crate) fn obtain(min_size: usize) -> io::Result<OsStack> {
    let recycled = POOL.with_borrow_mut(|pool| {
        let size = pool.range(min_size..).next().map(|(&size, _)| size)?;
        let stacks = pool.get_mut(&size).expect("stack pool entry disappeared");
        let stack = stacks.pop();
        if stacks.is_empty() {
            pool.remove(&size);
        }
        stack
    });

    if let Some(stack) = recycled {
        tracing::trace!(top = stack.top().get(), size = stack.size(), "obtained recycled stack");
        return Ok(stack);
    }

    let stack = OsStack::new(min_size)?;
    tracing::trace!(top = stack.top().get(), size = stack.size(), "obtained fresh stack");
    Ok(stack)
}

/// Returns a stack to the pool for later reuse.
pub(crate) fn recycle(stack: OsStack) {
    tracing::trace!(top = stack.top().get(), size = stack.size(), "recycled stack");

    POOL.with_borrow_mut(|pool| {
        pool.entry(stack.size()).or_default().push(stack);
    });
}

/// Discards all cached stack buffers on this thread.
pub fn drain_stack_pool() {
    POOL.with_borrow_mut(|pool| {
        pool.clear();
    });
}
