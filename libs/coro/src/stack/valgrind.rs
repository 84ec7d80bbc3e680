// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Optional support for registering stacks with Valgrind.
//!
//! When running under Valgrind, we need to notify it when we map or unmap a
//! stack, otherwise it gets confused when the stack pointer starts to
//! randomly move to a different address. Because stacks here are pooled and
//! outlive individual coroutines, registration is tied to the mapping in
//! [`OsStack`](crate::stack::OsStack), not to any coroutine: the id handed
//! out below travels with the stack through the pool and is only returned
//! to Valgrind when the mapping itself goes away.
//!
//! The `valgrind_request` instruction sequences are Valgrind's client
//! request ABI: fixed rotate/no-op patterns that its JIT recognizes and
//! that execute as NOPs on real hardware. They cannot be altered.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        type Value = usize;

        // Valgrind doesn't support RISC-V yet, use a no-op for now.
        #[inline]
        unsafe fn valgrind_request(default: Value, _args: &[Value; 6]) -> Value {
            default
        }
    } else if #[cfg(target_arch = "aarch64")] {
        type Value = u64;

        #[inline]
        unsafe fn valgrind_request(default: Value, args: &[Value; 6]) -> Value {
            let result;
            // Safety: inline assembly
            unsafe {
                core::arch::asm!(
                    "ror x12, x12, #3",
                    "ror x12, x12, #13",
                    "ror x12, x12, #61",
                    "ror x12, x12, #51",
                    "orr x10, x10, x10",
                    inout("x3") default => result,
                    in("x4") args.as_ptr(),
                    options(nostack),
                );
            }
            result
        }
    } else if #[cfg(target_arch = "x86_64")] {
        type Value = u64;

        #[inline]
        unsafe fn valgrind_request(default: Value, args: &[Value; 6]) -> Value {
            let result;
            // Safety: inline assembly
            unsafe {
                core::arch::asm!(
                    "rol rdi, 3",
                    "rol rdi, 13",
                    "rol rdi, 61",
                    "rol rdi, 51",
                    "xchg rbx, rbx",
                    inout("rdx") default => result,
                    in("rax") args.as_ptr(),
                    options(nostack),
                );
            }
            result
        }
    } else {
        compile_error!("unsupported target architecture");
    }
}

const STACK_REGISTER: Value = 0x1501;
const STACK_DEREGISTER: Value = 0x1502;

/// Opaque Valgrind handle for one registered stack mapping. Stored in the
/// owning [`OsStack`](crate::stack::OsStack) and handed back on unmap.
///
/// Worthless (but harmless) when not running under Valgrind.
#[derive(Clone, Copy, Debug)]
pub struct StackId(Value);

/// Registers the given region of memory as a stack so that Valgrind can
/// properly recognize legitimate stack switches.
#[inline]
pub fn register_stack(addr: *mut u8, len: usize) -> StackId {
    StackId(unsafe {
        valgrind_request(
            0,
            &[
                STACK_REGISTER,
                addr as Value,
                addr as Value + len as Value,
                0,
                0,
                0,
            ],
        )
    })
}

/// De-registers a stack; must happen before the mapping disappears.
#[inline]
pub fn deregister_stack(id: StackId) {
    unsafe {
        valgrind_request(0, &[STACK_DEREGISTER, id.0, 0, 0, 0, 0]);
    }
}
