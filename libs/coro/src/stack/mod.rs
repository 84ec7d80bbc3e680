cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod valgrind;
        mod unix;
        pub(crate) use unix::OsStack;
    } else {
        compile_error!("unsupported target OS");
    }
}

mod pool;

pub use pool::{default_stack_size, drain_stack_pool, set_default_stack_size};
pub(crate) use pool::{obtain, recycle};

pub(crate) type StackPointer = core::num::NonZeroUsize;

/// Minimum size of a stack, excluding guard pages.
pub const MIN_STACK_SIZE: usize = 4096;

pub use crate::arch::STACK_ALIGNMENT;
