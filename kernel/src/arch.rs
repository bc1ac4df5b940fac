//! Architecture glue: saved register state and interrupt level control.
//!
//! On hosted builds "interrupt state" is a per-thread depth counter so the
//! lock paths behave the same way they do on hardware.

// ============================================================================
// Saved register state
// ============================================================================

pub const RFLAGS_IF: u64 = 0x200;
pub const USER_CS: u64 = 0x1b;
pub const USER_SS: u64 = 0x23;

/// Callee-saved register context for a kernel thread.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub rip: u64,
}

impl Context {
    pub const fn new() -> Self {
        Context {
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
        }
    }
}

/// User-visible register state captured at the kernel entry boundary.
///
/// `fork` clones this wholesale and patches `rax`, which is how parent and
/// child observe different return values from the same call.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    pub const fn new() -> Self {
        TrapFrame {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    /// Frame for the first entry into user mode: interrupts on, user
    /// segments, execution starting at `entry` with the given stack.
    pub fn user(entry: u64, stack_ptr: u64) -> Self {
        let mut tf = TrapFrame::new();
        tf.rip = entry;
        tf.rsp = stack_ptr;
        tf.cs = USER_CS;
        tf.ss = USER_SS;
        tf.rflags = RFLAGS_IF;
        tf
    }
}

// ============================================================================
// Interrupt level control
// ============================================================================

#[cfg(feature = "hosted")]
mod intr {
    use std::cell::Cell;

    std::thread_local! {
        static OFF_DEPTH: Cell<u32> = const { Cell::new(0) };
    }

    /// Enter an interrupts-off section. Returns true when this call is the
    /// outermost one, so the matching `pop_off` knows to re-enable.
    pub fn push_off() -> bool {
        OFF_DEPTH.with(|d| {
            let depth = d.get();
            d.set(depth + 1);
            depth == 0
        })
    }

    // Locks may be released out of acquisition order (the scheduler drops a
    // caller's lock while holding its own), so only the depth is tracked.
    pub fn pop_off(_was_outermost: bool) {
        OFF_DEPTH.with(|d| {
            let depth = d.get();
            assert!(depth > 0, "pop_off without matching push_off");
            d.set(depth - 1);
        });
    }

    pub fn interrupts_off() -> bool {
        OFF_DEPTH.with(|d| d.get() > 0)
    }
}

#[cfg(all(not(feature = "hosted"), target_arch = "x86_64"))]
mod intr {
    use core::arch::asm;

    fn rflags() -> u64 {
        let flags: u64;
        unsafe {
            asm!("pushfq; pop {}", out(reg) flags, options(preserves_flags));
        }
        flags
    }

    pub fn push_off() -> bool {
        let was_on = rflags() & super::RFLAGS_IF != 0;
        unsafe {
            asm!("cli", options(nomem, nostack));
        }
        was_on
    }

    pub fn pop_off(was_on: bool) {
        if was_on {
            unsafe {
                asm!("sti", options(nomem, nostack));
            }
        }
    }

    pub fn interrupts_off() -> bool {
        rflags() & super::RFLAGS_IF == 0
    }
}

#[cfg(all(not(feature = "hosted"), not(target_arch = "x86_64")))]
mod intr {
    // Single-arch port; other targets only build the hosted flavor.
    pub fn push_off() -> bool {
        false
    }
    pub fn pop_off(_was_on: bool) {}
    pub fn interrupts_off() -> bool {
        true
    }
}

pub use intr::{interrupts_off, pop_off, push_off};

#[cfg(all(not(feature = "hosted"), target_arch = "x86_64"))]
extern "C" {
    /// Provided by the platform trampoline: saves the callee-saved set into
    /// `old` and resumes from `new`.
    pub fn context_switch(old: *mut Context, new: *const Context);
}
