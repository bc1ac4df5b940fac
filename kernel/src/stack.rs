//! Initial user stack construction.
//!
//! The top stack page is populated kernel-side before the process first
//! runs. Layout, from the top of the page downward: the argument strings
//! (NUL terminated), padding to 8-byte alignment, a NULL table terminator,
//! the argv pointer table, then three slots the entry code consumes: the
//! argv pointer, argc, and a fake return address.

use crate::error::{Error, Result};
use crate::pmem::{PageFrame, PAGE_SIZE};
use crate::vm::Vaddr;

/// One past the highest user stack address. The top stack page maps at
/// `USTACK_UPPERBOUND - PAGE_SIZE`.
pub const USTACK_UPPERBOUND: Vaddr = 0x8000_0000_0000;

/// Pages reserved below the top page; faults inside the reserve are
/// demand-zeroed.
pub const USTACK_PAGES: usize = 10;

const WORD: usize = core::mem::size_of::<u64>();

/// User address of byte `offset` within the top stack page.
#[inline]
pub const fn ustack_addr(offset: usize) -> Vaddr {
    USTACK_UPPERBOUND - PAGE_SIZE + offset
}

/// Lay out `argv` in `frame` (the top stack page) and return the initial
/// user stack pointer.
pub fn build_initial_stack(frame: &PageFrame, argv: &[&str]) -> Result<Vaddr> {
    let argc = argv.len();
    let strings: usize = argv.iter().map(|a| a.len() + 1).sum();
    // Strings, worst-case alignment pad, the pointer table and its NULL
    // terminator, plus argv/argc/fake-return slots.
    let worst = strings + WORD + (argc + 1) * WORD + 3 * WORD;
    if worst > PAGE_SIZE {
        return Err(Error::Invalid);
    }

    let mut sp = PAGE_SIZE;
    let mut string_addrs = [0u64; 64];
    if argc > string_addrs.len() {
        return Err(Error::Invalid);
    }
    for (i, arg) in argv.iter().enumerate().rev() {
        sp -= arg.len() + 1;
        frame.write(sp, arg.as_bytes());
        frame.write(sp + arg.len(), &[0u8]);
        string_addrs[i] = ustack_addr(sp) as u64;
    }

    sp &= !(WORD - 1);

    // argv[argc] = NULL
    sp -= WORD;
    frame.write(sp, &0u64.to_ne_bytes());

    // Pointer table, entries in index order.
    sp -= argc * WORD;
    for (i, addr) in string_addrs[..argc].iter().enumerate() {
        frame.write(sp + i * WORD, &addr.to_ne_bytes());
    }
    let argv_table = ustack_addr(sp) as u64;

    sp -= WORD;
    frame.write(sp, &argv_table.to_ne_bytes());
    sp -= WORD;
    frame.write(sp, &(argc as u64).to_ne_bytes());
    // Fake return address slot; main never returns through it.
    sp -= WORD;
    frame.write(sp, &0u64.to_ne_bytes());

    Ok(ustack_addr(sp))
}
