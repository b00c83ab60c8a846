//! Process-global tracer state: hook install, the parser co-process, the
//! userfaultfd service thread, and shutdown.

use std::ffi::{CStr, CString, OsString};
use std::mem;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, Once, OnceLock};
use std::thread;

use libc::{c_int, c_void};
use log::{info, warn};
use mtrack_common::{AppType, MmapTracker, PAGE_SIZE};

use crate::pipe::PipeEmitter;
use crate::real;
use crate::spinlock::Spinlock;
use crate::stack;
use crate::sys;
use crate::tls::{self, NoHook};

pub const APP_ID: u8 = 1;

pub struct TracerState {
    pub fault_fd: AtomicI32,
    pub emit_fd: RawFd,
    quit_pipe: [RawFd; 2],
    parser_pid: libc::pid_t,
    started: u32,
    shutdown: AtomicBool,
    pub modules_dirty: AtomicBool,
    pub tracker: Spinlock<MmapTracker>,
    service: Mutex<Option<thread::JoinHandle<()>>>,
}

static STATE: OnceLock<TracerState> = OnceLock::new();
static INIT: Once = Once::new();

pub fn state() -> Option<&'static TracerState> {
    STATE.get()
}

/// Install the hooks exactly once. Called on entry of every intercepted
/// primitive; cheap after the first call.
pub fn init_once() {
    INIT.call_once(install);
}

pub fn align_to_page(size: u64) -> u64 {
    size + ((!size).wrapping_add(1) & (PAGE_SIZE - 1))
}

pub fn page_floor(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

fn now_ms() -> u32 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC_COARSE, &mut ts);
    }
    (ts.tv_sec as u32).wrapping_mul(1000).wrapping_add((ts.tv_nsec / 1_000_000) as u32)
}

pub fn timestamp(state: &TracerState) -> u32 {
    now_ms().wrapping_sub(state.started)
}

pub fn gettid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

fn safe_print(msg: &str) {
    let _ = unsafe {
        libc::write(
            libc::STDERR_FILENO,
            msg.as_ptr() as *const c_void,
            msg.len(),
        )
    };
}

fn install() {
    unsafe {
        libc::unsetenv(c"LD_PRELOAD".as_ptr());
    }

    if let Err(symbol) = real::resolve_all() {
        safe_print("mtrack: missing hooked symbol ");
        safe_print(symbol);
        safe_print("\n");
        process::abort();
    }

    {
        let _nohook = NoHook::new();
        let _ = env_logger::try_init();
    }

    if std::env::var_os("MTRACK_NO_MMAP_STACKS")
        .map(|v| {
            let v = v.as_bytes();
            v.eq_ignore_ascii_case(b"true") || v == b"1"
        })
        .unwrap_or(false)
    {
        stack::set_no_mmap();
    }

    let mut emit_pipe = [-1 as RawFd; 2];
    if unsafe { libc::pipe2(emit_pipe.as_mut_ptr(), libc::O_DIRECT) } == -1 {
        safe_print("mtrack: could not create the emit pipe\n");
        process::abort();
    }

    let parser_pid = spawn_parser(emit_pipe);
    unsafe {
        libc::close(emit_pipe[0]);
    }

    let fault_fd = unsafe { libc::syscall(libc::SYS_userfaultfd, libc::O_NONBLOCK) } as c_int;
    if fault_fd == -1 {
        safe_print(
            "mtrack: could not initialize userfaultfd\n\
             you might have to run sysctl -w vm.unprivileged_userfaultfd=1\n",
        );
        process::abort();
    }

    let mut api = sys::UffdioApi {
        api: sys::UFFD_API,
        features: sys::UFFD_FEATURE_THREAD_ID,
        ioctls: 0,
    };
    if unsafe { libc::ioctl(fault_fd, sys::UFFDIO_API_IOCTL, &mut api) } != 0
        || api.api != sys::UFFD_API
    {
        safe_print("mtrack: userfaultfd api handshake failed\n");
        process::abort();
    }

    let mut quit_pipe = [-1 as RawFd; 2];
    if unsafe { libc::pipe2(quit_pipe.as_mut_ptr(), libc::O_NONBLOCK) } == -1 {
        safe_print("mtrack: could not create the quit pipe\n");
        process::abort();
    }

    {
        let mut emitter = PipeEmitter::new(emit_pipe[1]);
        let mut writer = emitter.writer();
        writer.version();
        writer.start(APP_ID, AppType::Elf);
    }

    let state = TracerState {
        fault_fd: AtomicI32::new(fault_fd),
        emit_fd: emit_pipe[1],
        quit_pipe,
        parser_pid,
        started: now_ms(),
        shutdown: AtomicBool::new(false),
        modules_dirty: AtomicBool::new(true),
        tracker: Spinlock::new(MmapTracker::new()),
        service: Mutex::new(None),
    };
    if STATE.set(state).is_err() {
        process::abort();
    }
    let state = STATE.get().unwrap();

    let handle = thread::Builder::new()
        .name("mtrack-fault".into())
        .spawn(move || service_thread(state))
        .unwrap_or_else(|_| {
            safe_print("mtrack: could not spawn the fault service thread\n");
            process::abort()
        });
    *state.service.lock().unwrap() = Some(handle);

    unsafe {
        libc::atexit(cleanup);
    }

    let mut emitter = PipeEmitter::new(state.emit_fd);
    match std::fs::read_link("/proc/self/exe") {
        Ok(exe) => {
            emitter
                .writer()
                .executable(APP_ID, exe.as_os_str().as_bytes());
        }
        Err(_) => safe_print("mtrack: no exe\n"),
    }
    match std::env::current_dir() {
        Ok(cwd) => {
            emitter
                .writer()
                .working_directory(APP_ID, cwd.as_os_str().as_bytes());
        }
        Err(_) => safe_print("mtrack: no cwd\n"),
    }

    info!("mtrack hooks installed, parser pid {parser_pid}");
}

/// Fork and exec the parser with the read end of the emit pipe on its stdin.
/// Everything the child needs is prepared before the fork; the child itself
/// only performs async-signal-safe calls.
fn spawn_parser(emit_pipe: [RawFd; 2]) -> libc::pid_t {
    let parser = parser_path();
    let parser_c = CString::new(parser.into_os_string().into_vec()).unwrap_or_else(|_| {
        safe_print("mtrack: parser path contains a nul byte\n");
        process::abort()
    });

    let mut args: Vec<CString> = Vec::new();
    args.push(parser_c.clone());
    args.push(CString::new("--packet-mode").unwrap());
    let mut push_env_flag = |env: &str, flag: &str, with_value: bool| {
        if let Some(value) = std::env::var_os(env) {
            args.push(CString::new(flag).unwrap());
            if with_value {
                if let Ok(value) = CString::new(value.into_vec()) {
                    args.push(value);
                } else {
                    args.pop();
                }
            }
        }
    };
    push_env_flag("MTRACK_LOG_FILE", "--log-file", true);
    push_env_flag("MTRACK_OUTPUT", "--output", true);
    push_env_flag("MTRACK_DUMP", "--dump", false);
    push_env_flag("MTRACK_NO_BUNDLE", "--no-bundle", false);
    push_env_flag("MTRACK_THRESHOLD", "--threshold", true);
    args.push(CString::new("--pid").unwrap());
    args.push(CString::new(unsafe { libc::getpid() }.to_string()).unwrap());

    let mut argv: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv.push(ptr::null());
    let envp: [*const libc::c_char; 1] = [ptr::null()];

    let pid = unsafe { libc::fork() };
    if pid == 0 {
        // child: only async-signal-safe calls from here to execve
        unsafe {
            libc::signal(libc::SIGINT, libc::SIG_IGN);
            libc::close(emit_pipe[1]);
            loop {
                if libc::dup2(emit_pipe[0], libc::STDIN_FILENO) != -1 {
                    break;
                }
                if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                    break;
                }
            }
            libc::close(emit_pipe[0]);
            libc::execve(parser_c.as_ptr(), argv.as_ptr(), envp.as_ptr());
            safe_print("mtrack: unable to exec the parser\n");
            libc::_exit(127);
        }
    }
    if pid == -1 {
        safe_print("mtrack: fork failed\n");
        process::abort();
    }
    pid
}

/// `MTRACK_PARSER` wins; otherwise the parser is expected next to the
/// preload library, at `../bin/mtrack_parser` relative to it.
fn parser_path() -> PathBuf {
    if let Some(parser) = std::env::var_os("MTRACK_PARSER") {
        return PathBuf::from(parser);
    }

    unsafe extern "C" fn find_self(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let out = &mut *(data as *mut Option<PathBuf>);
        let name = (*info).dlpi_name;
        if name.is_null() {
            return 0;
        }
        let bytes = CStr::from_ptr(name).to_bytes();
        if bytes
            .windows(b"libmtrack_preload".len())
            .any(|w| w == b"libmtrack_preload")
        {
            *out = Some(PathBuf::from(OsString::from_vec(bytes.to_vec())));
            return 1;
        }
        0
    }

    let mut own_path: Option<PathBuf> = None;
    unsafe {
        libc::dl_iterate_phdr(Some(find_self), &mut own_path as *mut _ as *mut c_void);
    }
    let Some(own_path) = own_path else {
        safe_print("mtrack: could not find the preload path\n");
        process::abort();
    };
    let own_path = std::fs::canonicalize(&own_path).unwrap_or(own_path);
    let Some(prefix) = own_path.parent().and_then(|lib| lib.parent()) else {
        safe_print("mtrack: invalid preload path\n");
        process::abort();
    };
    prefix.join("bin/mtrack_parser")
}

/// Emit `Library` + `LibraryHeader` records for every loaded module.
fn emit_modules(emitter: &mut PipeEmitter) {
    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let emitter = &mut *(data as *mut PipeEmitter);
        let info = &*info;
        let name = if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
            b"s".as_slice()
        } else {
            CStr::from_ptr(info.dlpi_name).to_bytes()
        };
        emitter.writer().library(APP_ID, name, info.dlpi_addr as u64);
        for i in 0..info.dlpi_phnum {
            let phdr = &*info.dlpi_phdr.add(i as usize);
            if phdr.p_type == libc::PT_LOAD {
                emitter
                    .writer()
                    .library_header(APP_ID, phdr.p_vaddr as u64, phdr.p_memsz as u64);
            }
        }
        0
    }

    unsafe {
        libc::dl_iterate_phdr(Some(callback), emitter as *mut _ as *mut c_void);
    }
}

/// Re-enumerate modules if a dynamic-library hook flagged them dirty.
pub fn refresh_modules(state: &TracerState, emitter: &mut PipeEmitter) {
    if state.modules_dirty.load(Ordering::Acquire) {
        emit_modules(emitter);
        state.modules_dirty.store(false, Ordering::Release);
    }
}

/// Track an anonymous private mapping and register it for missing-page
/// notifications when it is writable but not executable.
pub fn track_mmap(state: &TracerState, addr: u64, length: u64, prot: i32, flags: i32) {
    {
        let mut tracker = state.tracker.lock();
        tracker.mmap(addr, length, prot, flags, 0);
    }

    if prot & libc::PROT_WRITE != 0 && prot & libc::PROT_EXEC == 0 {
        register_fault_range(state, addr, length);
    }
}

pub fn register_fault_range(state: &TracerState, addr: u64, length: u64) {
    let fd = state.fault_fd.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let mut reg = sys::UffdioRegister {
        range: sys::UffdioRange {
            start: addr,
            len: align_to_page(length),
        },
        mode: sys::UFFDIO_REGISTER_MODE_MISSING,
        ioctls: 0,
    };
    if unsafe { libc::ioctl(fd, sys::UFFDIO_REGISTER_IOCTL, &mut reg) } == -1 {
        warn!(
            "userfaultfd register failed for {:#x}+{:#x}: {}",
            addr,
            length,
            std::io::Error::last_os_error()
        );
    }
}

pub fn report_malloc(state: &TracerState, ptr: u64, size: u64) {
    let _nohook = NoHook::new();
    let mut emitter = PipeEmitter::new(state.emit_fd);
    refresh_modules(state, &mut emitter);
    let ts = timestamp(state);
    stack::with_self_stack(3, |stack| {
        emitter
            .writer()
            .malloc(APP_ID, ts, ptr, size, gettid(), stack);
    });
}

pub fn report_free(state: &TracerState, ptr: u64) {
    let _nohook = NoHook::new();
    let mut emitter = PipeEmitter::new(state.emit_fd);
    refresh_modules(state, &mut emitter);
    emitter.writer().free(APP_ID, ptr);
}

fn service_thread(state: &'static TracerState) {
    tls::set_hooked(false);

    let mut emitter = PipeEmitter::new(state.emit_fd);
    loop {
        let fault_fd = state.fault_fd.load(Ordering::Relaxed);
        let mut fds = [
            libc::pollfd {
                fd: fault_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: state.quit_pipe[0],
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        match unsafe { libc::poll(fds.as_mut_ptr(), 2, 1000) } {
            -1 => {
                if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return;
            }
            0 => {
                emitter.writer().time(APP_ID, timestamp(state));
                continue;
            }
            _ => {}
        }

        refresh_modules(state, &mut emitter);

        if fds[0].revents & (libc::POLLERR | libc::POLLHUP) != 0 {
            close_fault_fd(state);
            return;
        }
        if fds[0].revents & libc::POLLIN != 0 && !drain_fault_fd(state, &mut emitter) {
            return;
        }
        if fds[1].revents & libc::POLLIN != 0 {
            return;
        }
    }
}

/// Read and answer one fault descriptor. Returns `false` when the channel is
/// dead and the thread should exit.
fn drain_fault_fd(state: &TracerState, emitter: &mut PipeEmitter) -> bool {
    let fd = state.fault_fd.load(Ordering::Relaxed);
    let mut msg = sys::UffdMsg::zeroed();
    let r = unsafe {
        libc::read(
            fd,
            &mut msg as *mut sys::UffdMsg as *mut c_void,
            mem::size_of::<sys::UffdMsg>(),
        )
    };
    if r != mem::size_of::<sys::UffdMsg>() as isize {
        let errno = std::io::Error::last_os_error().raw_os_error();
        if r == -1 && (errno == Some(libc::EWOULDBLOCK) || errno == Some(libc::EAGAIN)) {
            return true;
        }
        close_fault_fd(state);
        return false;
    }

    match msg.event {
        sys::UFFD_EVENT_PAGEFAULT => {
            let (addr, ptid) = unsafe { (msg.arg.pagefault.address, msg.arg.pagefault.feat.ptid) };
            let ts = timestamp(state);
            stack::with_thread_stack(0, ptid, |stack| {
                emitter.writer().page_fault(APP_ID, ts, addr, ptid, stack);
            });
            // The acknowledgement must go out before the next descriptor is
            // read or the faulting thread stays parked.
            let mut zero = sys::UffdioZeropage {
                range: sys::UffdioRange {
                    start: page_floor(addr),
                    len: PAGE_SIZE,
                },
                mode: 0,
                zeropage: 0,
            };
            let r = unsafe { libc::ioctl(fd, sys::UFFDIO_ZEROPAGE_IOCTL, &mut zero) };
            if r == -1 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EEXIST) {
                warn!(
                    "userfaultfd zeropage failed: {}",
                    std::io::Error::last_os_error()
                );
                close_fault_fd(state);
                return false;
            }
        }
        sys::UFFD_EVENT_REMAP => {
            let remap = unsafe { msg.arg.remap };
            emitter
                .writer()
                .page_remap(APP_ID, remap.from, remap.to, remap.len);
        }
        sys::UFFD_EVENT_REMOVE | sys::UFFD_EVENT_UNMAP => {
            let remove = unsafe { msg.arg.remove };
            emitter
                .writer()
                .page_remove(APP_ID, remove.start, remove.end);
        }
        _ => {}
    }
    true
}

fn close_fault_fd(state: &TracerState) {
    let fd = state.fault_fd.swap(-1, Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

extern "C" fn cleanup() {
    let Some(state) = STATE.get() else { return };
    if !state.shutdown.swap(true, Ordering::SeqCst) {
        unsafe {
            loop {
                if libc::write(state.quit_pipe[1], b"q".as_ptr() as *const c_void, 1) != -1
                    || std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR)
                {
                    break;
                }
            }
        }
        if let Some(handle) = state.service.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    let _nohook = NoHook::new();
    close_fault_fd(state);
    unsafe {
        libc::close(state.emit_fd);
        let mut status = 0;
        loop {
            if libc::waitpid(state.parser_pid, &mut status, 0) != -1
                || std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR)
            {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alignment() {
        assert_eq!(align_to_page(0), 0);
        assert_eq!(align_to_page(1), PAGE_SIZE);
        assert_eq!(align_to_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_to_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
        assert_eq!(page_floor(0x10abc), 0x10000);
        assert_eq!(page_floor(0x10000), 0x10000);
    }
}
