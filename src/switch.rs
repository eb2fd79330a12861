// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Raw control transfer between stacks.
//!
//! [`switch_stacks`] is the only way execution moves from one stack to
//! another: it spills the callee-saved register state onto the current
//! stack, publishes the resulting stack pointer through `save`, and restores
//! the state previously spilled at `target`. It carries no payload; all data
//! exchange between the two sides goes through memory they both can reach.
//!
//! [`prepare_stack`] seeds a fresh stack so that the first switch into it
//! "returns" into [`stack_entry`], which hands the prepared argument to the
//! task entry function with a conforming, terminated call frame.

use std::arch::naked_asm;

/// A stack pointer saved by [`switch_stacks`], opaque to everyone but the
/// switch itself. The null value means "nothing saved here".
pub(crate) type SavedSp = *mut u8;

/// Entry function signature for a prepared stack. Receives the argument
/// given to [`prepare_stack`] and must never return; leaving the stack is
/// only possible through [`switch_stacks`].
pub(crate) type EntryFn = extern "C" fn(*mut u8) -> !;

#[cfg(not(all(unix, any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("stackful only supports x86_64 and aarch64 on Unix");

/// Suspends the current side and revives the side saved at `target`.
///
/// The current stack pointer (with callee-saved state spilled below it) is
/// written to `*save` before control moves. The call "returns" when some
/// other side later switches back to the value written to `*save`.
///
/// # Safety
///
/// `target` must be a stack pointer produced by a previous `switch_stacks`
/// save or by [`prepare_stack`], on a stack that is still live, and no other
/// thread may be executing on either stack at the time of the call.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_stacks(save: *mut SavedSp, target: SavedSp) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// First landing point on a freshly prepared stack. The restore sequence in
/// [`switch_stacks`] leaves the entry function in `r12` and its argument in
/// `rbx`; the frame-pointer chain is terminated before tail-jumping so
/// unwinders and profilers stop here.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn stack_entry() -> ! {
    naked_asm!("mov rdi, rbx", "xor ebp, ebp", "jmp r12")
}

/// Number of machine words spilled by [`switch_stacks`], excluding the
/// return address.
#[cfg(target_arch = "x86_64")]
const SPILL_WORDS: usize = 6;

/// Seeds `top` (the high end of a fresh stack) with a spill area that makes
/// the first [`switch_stacks`] into it land in [`stack_entry`], which calls
/// `entry(arg)`.
///
/// Returns the stack pointer to pass as `target` for that first switch.
///
/// # Safety
///
/// `top` must be the high end of at least [`MIN_STACK_WORDS`] words of
/// writable memory that stays alive until the task running on it finishes.
#[cfg(target_arch = "x86_64")]
pub(crate) unsafe fn prepare_stack(top: *mut u8, entry: EntryFn, arg: *mut u8) -> SavedSp {
    let top = (top as usize & !0xf) as *mut u8;
    // Layout below `top`, matching the pop order of switch_stacks:
    //   sp+0x00 r15  sp+0x08 r14  sp+0x10 r13  sp+0x18 r12 (entry)
    //   sp+0x20 rbx (arg)  sp+0x28 rbp (0)  sp+0x30 return address
    let sp = top.sub((SPILL_WORDS + 2) * 8) as *mut usize;
    for slot in 0..SPILL_WORDS {
        sp.add(slot).write(0);
    }
    sp.add(3).write(entry as usize);
    sp.add(4).write(arg as usize);
    sp.add(6).write(stack_entry as usize);
    sp as SavedSp
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_stacks(save: *mut SavedSp, target: SavedSp) {
    naked_asm!(
        "sub sp, sp, 0xa0",
        "stp x19, x20, [sp, 0x00]",
        "stp x21, x22, [sp, 0x10]",
        "stp x23, x24, [sp, 0x20]",
        "stp x25, x26, [sp, 0x30]",
        "stp x27, x28, [sp, 0x40]",
        "stp x29, x30, [sp, 0x50]",
        "stp d8, d9, [sp, 0x60]",
        "stp d10, d11, [sp, 0x70]",
        "stp d12, d13, [sp, 0x80]",
        "stp d14, d15, [sp, 0x90]",
        "mov x2, sp",
        "str x2, [x0]",
        "mov sp, x1",
        "ldp x19, x20, [sp, 0x00]",
        "ldp x21, x22, [sp, 0x10]",
        "ldp x23, x24, [sp, 0x20]",
        "ldp x25, x26, [sp, 0x30]",
        "ldp x27, x28, [sp, 0x40]",
        "ldp x29, x30, [sp, 0x50]",
        "ldp d8, d9, [sp, 0x60]",
        "ldp d10, d11, [sp, 0x70]",
        "ldp d12, d13, [sp, 0x80]",
        "ldp d14, d15, [sp, 0x90]",
        "add sp, sp, 0xa0",
        "ret",
    )
}

/// First landing point on a freshly prepared stack. The restore sequence in
/// [`switch_stacks`] leaves the entry function in `x20` and its argument in
/// `x19`; the frame record is terminated before tail-jumping.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn stack_entry() -> ! {
    naked_asm!("mov x0, x19", "mov x29, xzr", "mov x30, xzr", "br x20")
}

/// Size in bytes of the spill area written by [`switch_stacks`].
#[cfg(target_arch = "aarch64")]
const SPILL_BYTES: usize = 0xa0;

#[cfg(target_arch = "aarch64")]
pub(crate) unsafe fn prepare_stack(top: *mut u8, entry: EntryFn, arg: *mut u8) -> SavedSp {
    let top = (top as usize & !0xf) as *mut u8;
    // Layout below `top`, matching the restore order of switch_stacks:
    //   sp+0x00 x19 (arg)  sp+0x08 x20 (entry)
    //   sp+0x50 x29 (0)    sp+0x58 x30 (stack_entry)
    let sp = top.sub(SPILL_BYTES) as *mut usize;
    for slot in 0..SPILL_BYTES / 8 {
        sp.add(slot).write(0);
    }
    sp.write(arg as usize);
    sp.add(1).write(entry as usize);
    sp.add(11).write(stack_entry as usize);
    sp as SavedSp
}

/// Smallest stack, in machine words, that [`prepare_stack`] can seed. Real
/// stacks need far more; this only bounds the seeding itself.
pub(crate) const MIN_STACK_WORDS: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    // A bare round trip: enter a prepared stack, bounce back, enter again,
    // observe side effects in a shared cell. No allocator, no unwinding.
    struct Shuttle {
        main: SavedSp,
        coro: SavedSp,
        hits: usize,
    }

    extern "C" fn bouncer(arg: *mut u8) -> ! {
        let shuttle = unsafe { &mut *(arg as *mut Shuttle) };
        loop {
            shuttle.hits += 1;
            unsafe { switch_stacks(&mut shuttle.coro, shuttle.main) };
        }
    }

    #[test]
    fn round_trips_preserve_state() {
        let mut stack = vec![0u8; 64 * 1024];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) };

        let mut shuttle = Shuttle {
            main: std::ptr::null_mut(),
            coro: std::ptr::null_mut(),
            hits: 0,
        };
        shuttle.coro =
            unsafe { prepare_stack(top, bouncer, &mut shuttle as *mut Shuttle as *mut u8) };

        for expected in 1..=5 {
            unsafe { switch_stacks(&mut shuttle.main, shuttle.coro) };
            assert_eq!(shuttle.hits, expected);
        }
        // The bouncer is still parked on its own stack; it owns no resources,
        // so abandoning it with the Vec is fine here.
    }

    #[test]
    fn prepared_pointer_is_aligned() {
        let mut stack = vec![0u8; 4096];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) };
        let sp = unsafe { prepare_stack(top, bouncer, std::ptr::null_mut()) };
        assert_eq!(sp as usize % 16, 0);
    }
}
