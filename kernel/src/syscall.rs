//! System call numbers and handlers.
//!
//! The numbers are on-disk ABI; they never change. Handlers are thin:
//! fetch arguments, validate user pointers against the address space, call
//! the kernel operation, fold the result into a signed return value
//! (negative values are [`Error`] codes).

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::pmem::{pg_round_up, PAGE_SIZE};
use crate::proc::Pid;
use crate::smem::RegionFlags;
use crate::vm::Vaddr;
use crate::Kernel;

pub const SYS_FORK: u64 = 1;
pub const SYS_SPAWN: u64 = 2;
pub const SYS_WAIT: u64 = 3;
pub const SYS_EXIT: u64 = 4;
pub const SYS_GETPID: u64 = 5;
pub const SYS_SLEEP: u64 = 6;
pub const SYS_OPEN: u64 = 7;
pub const SYS_CLOSE: u64 = 8;
pub const SYS_READ: u64 = 9;
pub const SYS_WRITE: u64 = 10;
pub const SYS_LINK: u64 = 11;
pub const SYS_UNLINK: u64 = 12;
pub const SYS_MKDIR: u64 = 13;
pub const SYS_CHDIR: u64 = 14;
pub const SYS_READDIR: u64 = 15;
pub const SYS_RMDIR: u64 = 16;
pub const SYS_FSTAT: u64 = 17;
pub const SYS_SBRK: u64 = 18;
pub const SYS_MEMINFO: u64 = 19;
pub const SYS_DUP: u64 = 20;
pub const SYS_PIPE: u64 = 21;
pub const SYS_INFO: u64 = 22;
pub const SYS_HALT: u64 = 23;
pub const SYS_CREATE_SHARED_REGION: u64 = 24;
pub const SYS_DESTROY_SHARED_REGION: u64 = 25;
pub const SYS_MAP: u64 = 26;
pub const SYS_UNMAP: u64 = 27;
pub const SYS_LOCK_SHARED_REGION: u64 = 28;
pub const SYS_UNLOCK_SHARED_REGION: u64 = 29;

/// Longest accepted region name, terminator included.
pub const MAX_NAME_LEN: usize = 128;

/// Most arguments a spawn command line may carry.
pub const MAX_ARGS: usize = 32;

/// Entry point from the trap path. Unknown numbers are a user bug, not a
/// kernel one.
pub fn dispatch(kernel: &Kernel, num: u64, args: [u64; 6]) -> i64 {
    let res = match num {
        SYS_FORK => sys_fork(kernel),
        SYS_SPAWN => sys_spawn(kernel, args),
        SYS_WAIT => sys_wait(kernel, args),
        SYS_EXIT => sys_exit(kernel, args),
        SYS_GETPID => kernel.getpid().map(|pid| pid as i64),
        SYS_CLOSE => sys_close(kernel, args),
        SYS_READ => sys_read(kernel, args),
        SYS_WRITE => sys_write(kernel, args),
        SYS_SBRK => sys_sbrk(kernel, args),
        SYS_MEMINFO => sys_meminfo(kernel),
        SYS_DUP => sys_dup(kernel, args),
        SYS_PIPE => sys_pipe(kernel, args),
        SYS_INFO => sys_info(kernel, args),
        SYS_HALT => {
            kernel.halt();
            Ok(0)
        }
        SYS_CREATE_SHARED_REGION => sys_create_shared_region(kernel, args),
        SYS_DESTROY_SHARED_REGION => sys_destroy_shared_region(kernel, args),
        SYS_MAP => sys_map(kernel, args),
        SYS_UNMAP => sys_unmap(kernel, args),
        SYS_LOCK_SHARED_REGION => sys_lock_shared_region(kernel, args),
        SYS_UNLOCK_SHARED_REGION => sys_unlock_shared_region(kernel, args),
        // Filesystem surface lives outside this kernel.
        SYS_SLEEP | SYS_OPEN | SYS_LINK | SYS_UNLINK | SYS_MKDIR | SYS_CHDIR | SYS_READDIR
        | SYS_RMDIR | SYS_FSTAT => Err(Error::NotSupported),
        _ => Err(Error::Invalid),
    };
    match res {
        Ok(v) => v,
        Err(e) => e.code(),
    }
}

// ============================================================================
// Argument validation
// ============================================================================

/// A user buffer is valid iff `[va, va + len)` lies inside one region of
/// the caller's address space.
fn validate_buf(kernel: &Kernel, va: Vaddr, len: usize) -> Result<()> {
    let end = va.checked_add(len).ok_or(Error::Fault)?;
    let pid = kernel.current_pid().ok_or(Error::Fault)?;
    let table = kernel.ptable.lock();
    let p = table.get(&pid).ok_or(Error::Fault)?;
    let region = p.aspace.find_region(va).ok_or(Error::Fault)?;
    if end > region.end {
        return Err(Error::Fault);
    }
    Ok(())
}

/// A user string is valid iff a NUL appears before its region ends.
fn read_str(kernel: &Kernel, va: Vaddr) -> Result<String> {
    let max = {
        let pid = kernel.current_pid().ok_or(Error::Fault)?;
        let table = kernel.ptable.lock();
        let p = table.get(&pid).ok_or(Error::Fault)?;
        let region = p.aspace.find_region(va).ok_or(Error::Fault)?;
        region.end - va
    };
    kernel.read_user_cstr(va, max).map_err(|_| Error::Fault)
}

// ============================================================================
// Process
// ============================================================================

fn sys_fork(kernel: &Kernel) -> Result<i64> {
    kernel.fork().map(|pid| pid as i64)
}

// The command line arrives as one space-separated string; argv[0] names
// the image.
fn sys_spawn(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    let line = read_str(kernel, args[0] as Vaddr)?;
    let argv: Vec<&str> = line.split_whitespace().take(MAX_ARGS).collect();
    let name = *argv.first().ok_or(Error::Invalid)?;
    kernel.spawn(name, &argv).map(|pid| pid as i64)
}

fn sys_wait(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    let target = match args[0] as i64 {
        -1 => None,
        pid if pid >= 0 => Some(pid as Pid),
        _ => return Err(Error::Invalid),
    };
    let status_ptr = args[1] as Vaddr;
    if status_ptr != 0 {
        validate_buf(kernel, status_ptr, core::mem::size_of::<i32>())?;
    }
    let (pid, status) = kernel.wait(target)?;
    if status_ptr != 0 {
        kernel.copy_to_user(status_ptr, &status.to_ne_bytes())?;
    }
    Ok(pid as i64)
}

fn sys_exit(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    if kernel.getpid()? == crate::proc::ROOT_PID {
        kernel.halt();
        return Ok(0);
    }
    kernel.exit(args[0] as i32);
    Ok(0)
}

// ============================================================================
// Descriptors
// ============================================================================

fn sys_close(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    kernel.fd_close(args[0] as usize).map(|_| 0)
}

fn sys_read(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    let (fd, buf_ptr, count) = (args[0] as usize, args[1] as Vaddr, args[2] as usize);
    validate_buf(kernel, buf_ptr, count)?;
    let file = kernel.fd_get(fd)?;
    let mut buf = vec![0u8; count];
    let n = file.read(&mut buf, &kernel.sched)?;
    kernel.copy_to_user(buf_ptr, &buf[..n])?;
    Ok(n as i64)
}

fn sys_write(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    let (fd, buf_ptr, count) = (args[0] as usize, args[1] as Vaddr, args[2] as usize);
    validate_buf(kernel, buf_ptr, count)?;
    let file = kernel.fd_get(fd)?;
    let mut buf = vec![0u8; count];
    kernel.copy_from_user(buf_ptr, &mut buf)?;
    let n = file.write(&buf, &kernel.sched)?;
    Ok(n as i64)
}

fn sys_dup(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    kernel.fd_dup(args[0] as usize).map(|fd| fd as i64)
}

// Both descriptors are written back to back at the given pointer.
fn sys_pipe(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    let fds_ptr = args[0] as Vaddr;
    validate_buf(kernel, fds_ptr, 2 * core::mem::size_of::<i32>())?;
    let (rfd, wfd) = kernel.make_pipe()?;
    kernel.copy_to_user(fds_ptr, &(rfd as i32).to_ne_bytes())?;
    kernel.copy_to_user(fds_ptr + 4, &(wfd as i32).to_ne_bytes())?;
    Ok(0)
}

// ============================================================================
// Memory
// ============================================================================

fn sys_sbrk(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    let old = kernel.sbrk(args[0] as i64 as isize)?;
    Ok(old as i64)
}

fn sys_meminfo(kernel: &Kernel) -> Result<i64> {
    let pid = kernel.getpid()?;
    let table = kernel.ptable.lock();
    let p = table.get(&pid).ok_or(Error::Invalid)?;
    for r in p.aspace.regions() {
        log::info!(
            "pid {}: region {:#x}..{:#x} {:?} {:?}",
            pid,
            r.start,
            r.end,
            r.perm,
            r.kind
        );
    }
    Ok(0)
}

fn sys_info(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    let info_ptr = args[0] as Vaddr;
    validate_buf(kernel, info_ptr, core::mem::size_of::<u64>())?;
    kernel.write_user_u64(info_ptr, kernel.user_fault_count())?;
    Ok(0)
}

// ============================================================================
// Shared regions
// ============================================================================

fn sys_create_shared_region(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    let name = read_str(kernel, args[0] as Vaddr)?;
    if name.len() >= MAX_NAME_LEN {
        return Err(Error::Invalid);
    }
    let pages = pg_round_up(args[1] as usize) / PAGE_SIZE;
    let flags = RegionFlags::from_bits_truncate(args[2] as u32);
    kernel.shm_create(&name, pages, flags).map(|_| 0)
}

// An explicit destroy overrides persistence; only the automatic
// last-unmap teardown leaves persistent regions alone. Mapped regions
// still refuse.
fn sys_destroy_shared_region(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    let name = read_str(kernel, args[0] as Vaddr)?;
    kernel.shm_destroy(&name, true).map(|_| 0)
}

fn sys_map(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    let name = read_str(kernel, args[0] as Vaddr)?;
    let out_ptr = args[1] as Vaddr;
    validate_buf(kernel, out_ptr, core::mem::size_of::<u64>())?;
    let start = kernel.shm_map(&name)?;
    kernel.write_user_u64(out_ptr, start as u64)?;
    Ok(0)
}

fn sys_unmap(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    let name = read_str(kernel, args[0] as Vaddr)?;
    kernel.shm_unmap(&name, args[1] as Vaddr).map(|_| 0)
}

fn sys_lock_shared_region(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    let name = read_str(kernel, args[0] as Vaddr)?;
    kernel.shm_lock(&name).map(|_| 0)
}

fn sys_unlock_shared_region(kernel: &Kernel, args: [u64; 6]) -> Result<i64> {
    let name = read_str(kernel, args[0] as Vaddr)?;
    kernel.shm_unlock(&name).map(|_| 0)
}
