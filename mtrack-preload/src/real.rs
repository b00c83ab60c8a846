//! The real libc entry points, resolved with `dlsym(RTLD_NEXT, …)` at hook
//! install. Until resolution has happened the accessors return `None` and the
//! allocator hooks fall back to the bootstrap arena.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_char, c_int, c_void, off64_t, off_t, pthread_t, size_t};

macro_rules! real_fns {
    ($($name:ident: $sig:ty = $sym:literal required $req:literal;)*) => {
        struct Table {
            $($name: AtomicUsize,)*
        }

        static TABLE: Table = Table {
            $($name: AtomicUsize::new(0),)*
        };

        $(
            pub fn $name() -> Option<$sig> {
                let addr = TABLE.$name.load(Ordering::Relaxed);
                if addr == 0 {
                    None
                } else {
                    Some(unsafe { mem::transmute::<usize, $sig>(addr) })
                }
            }
        )*

        /// Resolve every interposed symbol. Returns the name of the first
        /// missing required symbol.
        pub fn resolve_all() -> Result<(), &'static str> {
            $(
                let addr = unsafe {
                    libc::dlsym(
                        libc::RTLD_NEXT,
                        concat!($sym, "\0").as_ptr() as *const c_char,
                    )
                } as usize;
                if addr == 0 && $req {
                    return Err($sym);
                }
                TABLE.$name.store(addr, Ordering::Relaxed);
            )*
            Ok(())
        }
    };
}

real_fns! {
    mmap: unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, off_t) -> *mut c_void
        = "mmap" required true;
    mmap64: unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, off64_t) -> *mut c_void
        = "mmap64" required true;
    munmap: unsafe extern "C" fn(*mut c_void, size_t) -> c_int
        = "munmap" required true;
    mremap: unsafe extern "C" fn(*mut c_void, size_t, size_t, c_int, *mut c_void) -> *mut c_void
        = "mremap" required true;
    madvise: unsafe extern "C" fn(*mut c_void, size_t, c_int) -> c_int
        = "madvise" required true;
    mprotect: unsafe extern "C" fn(*mut c_void, size_t, c_int) -> c_int
        = "mprotect" required true;
    dlopen: unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void
        = "dlopen" required true;
    dlclose: unsafe extern "C" fn(*mut c_void) -> c_int
        = "dlclose" required true;
    pthread_setname_np: unsafe extern "C" fn(pthread_t, *const c_char) -> c_int
        = "pthread_setname_np" required true;
    malloc: unsafe extern "C" fn(size_t) -> *mut c_void
        = "malloc" required true;
    free: unsafe extern "C" fn(*mut c_void)
        = "free" required true;
    calloc: unsafe extern "C" fn(size_t, size_t) -> *mut c_void
        = "calloc" required true;
    realloc: unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void
        = "realloc" required true;
    reallocarray: unsafe extern "C" fn(*mut c_void, size_t, size_t) -> *mut c_void
        = "reallocarray" required false;
    posix_memalign: unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> c_int
        = "posix_memalign" required true;
    aligned_alloc: unsafe extern "C" fn(size_t, size_t) -> *mut c_void
        = "aligned_alloc" required true;
}
