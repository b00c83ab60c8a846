//! The interposed libc entry points.
//!
//! Every hook follows the same shape: enter the `MallocFree` scope, install
//! the tracer on first use, call the real function, and only then, if this
//! thread is traced and not nested inside another hook, update the
//! tracker and emit a record. Failures inside the underlying call are
//! returned to the application untouched.

use libc::{c_char, c_int, c_void, off64_t, off_t, pthread_t, size_t};
use mtrack_common::{CommandType, RecordType};

use crate::pipe::PipeEmitter;
use crate::stack;
use crate::tls::{self, MallocFree, NoHook};
use crate::tracer::{self, APP_ID};
use crate::{bootstrap, real};

#[no_mangle]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }

    let Some(real_mmap) = real::mmap() else {
        return libc::MAP_FAILED;
    };
    let ret = real_mmap(addr, length, prot, flags, fd, offset);
    if !tls::hooked() || ret == libc::MAP_FAILED {
        return ret;
    }

    let _nohook = NoHook::new();
    report_mmap(&mf, addr, ret, length, prot, flags, fd);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn mmap64(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off64_t,
) -> *mut c_void {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }

    let Some(real_mmap64) = real::mmap64() else {
        return libc::MAP_FAILED;
    };
    let ret = real_mmap64(addr, length, prot, flags, fd, offset);
    if !tls::hooked() || ret == libc::MAP_FAILED {
        return ret;
    }

    let _nohook = NoHook::new();
    report_mmap(&mf, addr, ret, length, prot, flags, fd);
    ret
}

unsafe fn report_mmap(
    mf: &MallocFree,
    requested: *mut c_void,
    ret: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
) {
    let Some(state) = tracer::state() else { return };

    let anon_private = flags & (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS)
        == (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS);
    let mut kind = RecordType::MmapUntracked;
    if !mf.was_in_malloc_free() && anon_private && fd == -1 {
        tracer::track_mmap(state, ret as u64, length as u64, prot, flags);
        kind = RecordType::MmapTracked;

        if flags & libc::MAP_FIXED != 0 {
            let start = tracer::page_floor(requested as u64);
            let mut emitter = PipeEmitter::new(state.emit_fd);
            emitter.writer().page_remove(
                APP_ID,
                start,
                start + tracer::align_to_page(length as u64),
            );
        }
    }

    let mut emitter = PipeEmitter::new(state.emit_fd);
    tracer::refresh_modules(state, &mut emitter);
    stack::with_self_stack(2, |stack| {
        emitter.writer().mmap(
            kind,
            APP_ID,
            tracer::page_floor(ret as u64),
            tracer::align_to_page(length as u64),
            prot,
            flags,
            tracer::gettid(),
            stack,
        );
    });
}

#[no_mangle]
pub unsafe extern "C" fn munmap(addr: *mut c_void, length: size_t) -> c_int {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }

    let Some(real_munmap) = real::munmap() else {
        return -1;
    };
    let ret = real_munmap(addr, length);
    if !tls::hooked() || ret != 0 {
        return ret;
    }

    let _nohook = NoHook::new();
    if let Some(state) = tracer::state() {
        let removed = {
            let mut tracker = state.tracker.lock();
            tracker.munmap(addr as u64, length as u64)
        };
        let kind = if removed > 0 {
            RecordType::MunmapTracked
        } else {
            RecordType::MunmapUntracked
        };
        let mut emitter = PipeEmitter::new(state.emit_fd);
        emitter.writer().munmap(
            kind,
            APP_ID,
            tracer::page_floor(addr as u64),
            tracer::align_to_page(length as u64),
        );
    }
    ret
}

#[no_mangle]
pub unsafe extern "C" fn mprotect(addr: *mut c_void, length: size_t, prot: c_int) -> c_int {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }

    let Some(real_mprotect) = real::mprotect() else {
        return -1;
    };

    if let Some(state) = tracer::state() {
        if tls::hooked() {
            let _nohook = NoHook::new();
            let flags = {
                let mut tracker = state.tracker.lock();
                tracker.mprotect(addr as u64, length as u64, prot)
            };
            // a range that just became writable needs fault registration
            let anon_private = flags & (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS)
                == (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS);
            if anon_private && prot & libc::PROT_WRITE != 0 && prot & libc::PROT_EXEC == 0 {
                tracer::register_fault_range(state, addr as u64, length as u64);
            }
        }
    }

    real_mprotect(addr, length, prot)
}

// The real mremap is variadic; the optional new-address argument is only
// read when MREMAP_FIXED is set, which makes the fixed five-argument
// signature ABI-compatible on the supported targets.
#[no_mangle]
pub unsafe extern "C" fn mremap(
    addr: *mut c_void,
    old_size: size_t,
    new_size: size_t,
    flags: c_int,
    new_address: *mut c_void,
) -> *mut c_void {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }

    let Some(real_mremap) = real::mremap() else {
        return libc::MAP_FAILED;
    };
    let ret = real_mremap(addr, old_size, new_size, flags, new_address);
    if !tls::hooked() || ret == libc::MAP_FAILED {
        return ret;
    }

    let _nohook = NoHook::new();
    if let Some(state) = tracer::state() {
        let attrs = {
            let mut tracker = state.tracker.lock();
            let attrs = tracker
                .region_at(addr as u64)
                .map(|r| (r.prot, r.flags, r.stack));
            tracker.munmap(addr as u64, old_size as u64);
            if let Some((prot, flags, stack)) = attrs {
                tracker.mmap(ret as u64, new_size as u64, prot, flags, stack);
            }
            attrs
        };
        if let Some((prot, flags, _)) = attrs {
            let mut emitter = PipeEmitter::new(state.emit_fd);
            tracer::refresh_modules(state, &mut emitter);
            emitter.writer().munmap(
                RecordType::MunmapTracked,
                APP_ID,
                tracer::page_floor(addr as u64),
                tracer::align_to_page(old_size as u64),
            );
            stack::with_self_stack(2, |stack| {
                emitter.writer().mmap(
                    RecordType::MmapTracked,
                    APP_ID,
                    tracer::page_floor(ret as u64),
                    tracer::align_to_page(new_size as u64),
                    prot,
                    flags,
                    tracer::gettid(),
                    stack,
                );
            });
        }
    }
    ret
}

#[no_mangle]
pub unsafe extern "C" fn madvise(addr: *mut c_void, length: size_t, advice: c_int) -> c_int {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }

    let Some(real_madvise) = real::madvise() else {
        return -1;
    };
    if !tls::hooked() {
        return real_madvise(addr, length, advice);
    }

    let _nohook = NoHook::new();
    if let Some(state) = tracer::state() {
        if advice == libc::MADV_DONTNEED || advice == libc::MADV_REMOVE {
            let affected = {
                let mut tracker = state.tracker.lock();
                tracker.madvise(addr as u64, length as u64)
            };
            let kind = if affected > 0 {
                RecordType::MadviseTracked
            } else {
                RecordType::MadviseUntracked
            };
            let start = tracer::page_floor(addr as u64);
            let mut emitter = PipeEmitter::new(state.emit_fd);
            emitter.writer().madvise(
                kind,
                APP_ID,
                start,
                tracer::align_to_page(length as u64),
                advice,
            );
            emitter
                .writer()
                .page_remove(APP_ID, start, start + tracer::align_to_page(length as u64));
        }
    }

    real_madvise(addr, length, advice)
}

#[no_mangle]
pub unsafe extern "C" fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }
    let Some(real_dlopen) = real::dlopen() else {
        return std::ptr::null_mut();
    };
    if let Some(state) = tracer::state() {
        state
            .modules_dirty
            .store(true, std::sync::atomic::Ordering::Release);
    }
    real_dlopen(filename, flags)
}

#[no_mangle]
pub unsafe extern "C" fn dlclose(handle: *mut c_void) -> c_int {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }
    let Some(real_dlclose) = real::dlclose() else {
        return -1;
    };
    if let Some(state) = tracer::state() {
        state
            .modules_dirty
            .store(true, std::sync::atomic::Ordering::Release);
    }
    real_dlclose(handle)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_setname_np(thread: pthread_t, name: *const c_char) -> c_int {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }
    let Some(real_setname) = real::pthread_setname_np() else {
        return libc::EINVAL;
    };
    // only the calling thread's id is known; names set on other threads are
    // dropped
    if libc::pthread_equal(thread, libc::pthread_self()) != 0 && !name.is_null() {
        if let Some(state) = tracer::state() {
            let _nohook = NoHook::new();
            let bytes = std::ffi::CStr::from_ptr(name).to_bytes();
            let mut emitter = PipeEmitter::new(state.emit_fd);
            emitter
                .writer()
                .thread_name(APP_ID, tracer::gettid(), bytes);
        }
    }
    real_setname(thread, name)
}

#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }

    let Some(real_malloc) = real::malloc() else {
        return bootstrap::allocate(size);
    };
    let ret = real_malloc(size);
    if !tls::hooked() || ret.is_null() {
        return ret;
    }

    if !mf.was_in_malloc_free() {
        if let Some(state) = tracer::state() {
            tracer::report_malloc(state, ret as u64, size as u64);
        }
    }
    ret
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }

    if bootstrap::contains(ptr) {
        return;
    }

    let Some(real_free) = real::free() else {
        return;
    };
    real_free(ptr);

    if !tls::hooked() {
        return;
    }
    if !mf.was_in_malloc_free() && !ptr.is_null() {
        if let Some(state) = tracer::state() {
            tracer::report_free(state, ptr as u64);
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }

    let Some(real_calloc) = real::calloc() else {
        // dlsym itself allocates through calloc; the arena is zero-filled
        return bootstrap::allocate(nmemb.saturating_mul(size));
    };
    let ret = real_calloc(nmemb, size);
    if !tls::hooked() || ret.is_null() {
        return ret;
    }

    if !mf.was_in_malloc_free() {
        if let Some(state) = tracer::state() {
            tracer::report_malloc(state, ret as u64, nmemb.saturating_mul(size) as u64);
        }
    }
    ret
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }

    let Some(real_realloc) = real::realloc() else {
        return std::ptr::null_mut();
    };
    let ret = real_realloc(ptr, size);
    if !tls::hooked() || ret.is_null() {
        return ret;
    }

    if !mf.was_in_malloc_free() {
        if let Some(state) = tracer::state() {
            if !ptr.is_null() {
                tracer::report_free(state, ptr as u64);
            }
            tracer::report_malloc(state, ret as u64, size as u64);
        }
    }
    ret
}

#[no_mangle]
pub unsafe extern "C" fn reallocarray(ptr: *mut c_void, nmemb: size_t, size: size_t) -> *mut c_void {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }

    let ret = match real::reallocarray() {
        Some(real_reallocarray) => real_reallocarray(ptr, nmemb, size),
        None => match nmemb.checked_mul(size) {
            Some(total) => match real::realloc() {
                Some(real_realloc) => real_realloc(ptr, total),
                None => return std::ptr::null_mut(),
            },
            None => return std::ptr::null_mut(),
        },
    };
    if !tls::hooked() || ret.is_null() {
        return ret;
    }

    if !mf.was_in_malloc_free() {
        if let Some(state) = tracer::state() {
            if !ptr.is_null() {
                tracer::report_free(state, ptr as u64);
            }
            tracer::report_malloc(state, ret as u64, nmemb.saturating_mul(size) as u64);
        }
    }
    ret
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }

    let Some(real_posix_memalign) = real::posix_memalign() else {
        return libc::ENOMEM;
    };
    let ret = real_posix_memalign(memptr, alignment, size);
    if !tls::hooked() || ret != 0 || (*memptr).is_null() {
        return ret;
    }

    if !mf.was_in_malloc_free() {
        if let Some(state) = tracer::state() {
            tracer::report_malloc(state, *memptr as u64, align_up(size, alignment));
        }
    }
    ret
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    let mf = MallocFree::enter();
    if !mf.was_in_malloc_free() {
        tracer::init_once();
    }

    let Some(real_aligned_alloc) = real::aligned_alloc() else {
        return std::ptr::null_mut();
    };
    let ret = real_aligned_alloc(alignment, size);
    if !tls::hooked() || ret.is_null() {
        return ret;
    }

    if !mf.was_in_malloc_free() {
        if let Some(state) = tracer::state() {
            tracer::report_malloc(state, ret as u64, align_up(size, alignment));
        }
    }
    ret
}

fn align_up(size: size_t, align: size_t) -> u64 {
    let size = size as u64;
    let align = align as u64;
    size + ((!size).wrapping_add(1) & (align - 1))
}

/// Emit a named snapshot marker into the trace.
///
/// # Safety
/// `name` must be null or point to at least `name_size` readable bytes (or a
/// nul-terminated string when `name_size` is zero).
#[no_mangle]
pub unsafe extern "C" fn mtrack_snapshot(name: *const c_char, mut name_size: size_t) {
    let Some(state) = tracer::state() else { return };
    let _mf = MallocFree::enter();
    let mut emitter = PipeEmitter::new(state.emit_fd);
    if name.is_null() {
        emitter
            .writer()
            .command(APP_ID, CommandType::Snapshot, b"");
        return;
    }
    if name_size == 0 {
        name_size = libc::strlen(name);
    }
    let bytes = std::slice::from_raw_parts(name as *const u8, name_size);
    emitter.writer().command(APP_ID, CommandType::Snapshot, bytes);
}

#[no_mangle]
pub extern "C" fn mtrack_enable_snapshots() {
    if let Some(state) = tracer::state() {
        let mut emitter = PipeEmitter::new(state.emit_fd);
        emitter
            .writer()
            .command(APP_ID, CommandType::EnableSnapshots, b"");
    }
}

#[no_mangle]
pub extern "C" fn mtrack_disable_snapshots() {
    if let Some(state) = tracer::state() {
        let mut emitter = PipeEmitter::new(state.emit_fd);
        emitter
            .writer()
            .command(APP_ID, CommandType::DisableSnapshots, b"");
    }
}
