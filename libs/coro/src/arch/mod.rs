cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else if #[cfg(target_arch = "riscv64")] {
        mod riscv64;
        pub use riscv64::*;
    } else {
        compile_error!("unsupported target architecture");
    }
}

/// Pushes one machine word onto a stack that is being laid out.
#[inline]
unsafe fn push_word(sp: &mut usize, value: usize) {
    // Safety: ensured by caller
    unsafe {
        *sp -= size_of::<usize>();
        (*sp as *mut usize).write(value);
    }
}
