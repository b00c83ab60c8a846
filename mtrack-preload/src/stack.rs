//! Call-stack capture.
//!
//! Two variants: the current thread's stack via glibc `backtrace`, and a
//! sibling thread's stack via ptrace plus a frame-pointer walk over our own
//! address space. Captured instruction pointers are decremented by one so
//! that resolution lands on the call site instead of the return site.
//!
//! Capture never allocates through the hooked allocator. Deep captures use a
//! per-thread scratch area obtained directly from `mmap`; setting
//! `MTRACK_NO_MMAP_STACKS` (or a failed scratch mapping) falls back to a
//! shallow on-stack buffer.

use std::cell::Cell;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{c_int, c_void};

const MAX_DEPTH: usize = 1024;
const SHALLOW_DEPTH: usize = 64;

static NO_MMAP_STACKS: AtomicBool = AtomicBool::new(false);

pub fn set_no_mmap() {
    NO_MMAP_STACKS.store(true, Ordering::Relaxed);
}

fn no_mmap() -> bool {
    NO_MMAP_STACKS.load(Ordering::Relaxed)
}

// Scratch layout: MAX_DEPTH frame pointers followed by MAX_DEPTH converted
// instruction pointers.
const SCRATCH_BYTES: usize = MAX_DEPTH * 8 * 2;

thread_local! {
    static SCRATCH: Cell<*mut c_void> = const { Cell::new(ptr::null_mut()) };
}

fn scratch() -> *mut c_void {
    SCRATCH
        .try_with(|cell| {
            let mut p = cell.get();
            if p.is_null() {
                p = unsafe {
                    libc::mmap(
                        ptr::null_mut(),
                        SCRATCH_BYTES,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };
                if p == libc::MAP_FAILED {
                    p = ptr::null_mut();
                }
                cell.set(p);
            }
            p
        })
        .unwrap_or(ptr::null_mut())
}

/// Capture the current thread's stack and hand it to `f`. `skip` drops the
/// innermost frames (the hook machinery itself).
pub fn with_self_stack<R>(skip: usize, f: impl FnOnce(&[u64]) -> R) -> R {
    unsafe {
        if !no_mmap() {
            let base = scratch();
            if !base.is_null() {
                let frames = base as *mut *mut c_void;
                let count = libc::backtrace(frames, MAX_DEPTH as c_int).max(0) as usize;
                let out = (base as *mut u64).add(MAX_DEPTH);
                let kept = convert(slice::from_raw_parts(frames, count), skip, out, MAX_DEPTH);
                return f(slice::from_raw_parts(out, kept));
            }
        }
        let mut frames = [ptr::null_mut(); SHALLOW_DEPTH];
        let count = libc::backtrace(frames.as_mut_ptr(), SHALLOW_DEPTH as c_int).max(0) as usize;
        let mut out = [0u64; SHALLOW_DEPTH];
        let kept = convert(&frames[..count], skip, out.as_mut_ptr(), SHALLOW_DEPTH);
        f(&out[..kept])
    }
}

unsafe fn convert(frames: &[*mut c_void], skip: usize, out: *mut u64, cap: usize) -> usize {
    let mut kept = 0;
    for frame in frames.iter().skip(skip) {
        if kept == cap {
            break;
        }
        *out.add(kept) = (*frame as u64).wrapping_sub(1);
        kept += 1;
    }
    kept
}

/// Capture another thread of this process by thread id. The target is frozen
/// with `PTRACE_ATTACH`, its registers are read, its frame-pointer chain is
/// walked through our shared address space, and it is released again. Yields
/// an empty stack when the target cannot be attached.
pub fn with_thread_stack<R>(skip: usize, tid: u32, f: impl FnOnce(&[u64]) -> R) -> R {
    let mut buf = [0u64; SHALLOW_DEPTH];
    let count = capture_thread(tid, &mut buf);
    let start = skip.min(count);
    f(&buf[start..count])
}

fn capture_thread(tid: u32, buf: &mut [u64]) -> usize {
    unsafe {
        if libc::ptrace(libc::PTRACE_ATTACH, tid, 0usize, 0usize) == -1 {
            return 0;
        }
        let mut status = 0;
        let r = libc::waitpid(tid as libc::pid_t, &mut status, libc::__WALL);
        let count = if r == tid as libc::pid_t {
            walk_regs(tid, buf)
        } else {
            0
        };
        libc::ptrace(libc::PTRACE_DETACH, tid, 0usize, 0usize);
        count
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        unsafe fn thread_ip_fp(tid: u32) -> Option<(u64, u64)> {
            let mut regs: libc::user_regs_struct = std::mem::zeroed();
            if libc::ptrace(
                libc::PTRACE_GETREGS,
                tid,
                0usize,
                &mut regs as *mut _ as *mut c_void,
            ) == -1
            {
                return None;
            }
            Some((regs.rip, regs.rbp))
        }
    } else if #[cfg(target_arch = "aarch64")] {
        unsafe fn thread_ip_fp(tid: u32) -> Option<(u64, u64)> {
            let mut regs: libc::user_regs_struct = std::mem::zeroed();
            let mut iov = libc::iovec {
                iov_base: &mut regs as *mut _ as *mut c_void,
                iov_len: std::mem::size_of::<libc::user_regs_struct>(),
            };
            if libc::ptrace(
                libc::PTRACE_GETREGSET,
                tid,
                libc::NT_PRSTATUS as usize,
                &mut iov as *mut _ as *mut c_void,
            ) == -1
            {
                return None;
            }
            Some((regs.pc, regs.regs[29]))
        }
    } else {
        unsafe fn thread_ip_fp(_tid: u32) -> Option<(u64, u64)> {
            None
        }
    }
}

unsafe fn walk_regs(tid: u32, buf: &mut [u64]) -> usize {
    let Some((ip, mut fp)) = thread_ip_fp(tid) else {
        return 0;
    };
    let mut count = 0;
    buf[count] = ip.wrapping_sub(1);
    count += 1;
    // Standard frame layout: [fp] is the caller's frame pointer, [fp+8] the
    // return address. The reads go through process_vm_readv so that a stale
    // chain cannot fault the service thread.
    let mut last_fp = 0u64;
    while count < buf.len() {
        if fp == 0 || fp % 8 != 0 || fp <= last_fp {
            break;
        }
        let mut frame = [0u64; 2];
        if !read_self_memory(fp, &mut frame) {
            break;
        }
        let ret = frame[1];
        if ret == 0 {
            break;
        }
        buf[count] = ret.wrapping_sub(1);
        count += 1;
        last_fp = fp;
        fp = frame[0];
    }
    count
}

unsafe fn read_self_memory(addr: u64, out: &mut [u64; 2]) -> bool {
    let local = libc::iovec {
        iov_base: out.as_mut_ptr() as *mut c_void,
        iov_len: 16,
    };
    let remote = libc::iovec {
        iov_base: addr as *mut c_void,
        iov_len: 16,
    };
    libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) == 16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_stack_is_nonempty_and_decremented() {
        with_self_stack(0, |stack| {
            assert!(!stack.is_empty());
            for ip in stack {
                assert_ne!(*ip, 0);
            }
        });
    }

    #[test]
    fn skip_drops_frames() {
        with_self_stack(0, |all| {
            let all_len = all.len();
            with_self_stack(2, |skipped| {
                assert!(skipped.len() <= all_len);
            });
        });
    }

    #[test]
    fn shallow_fallback() {
        set_no_mmap();
        with_self_stack(0, |stack| {
            assert!(stack.len() <= SHALLOW_DEPTH);
            assert!(!stack.is_empty());
        });
    }
}
