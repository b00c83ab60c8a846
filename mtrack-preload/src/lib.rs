//! `LD_PRELOAD` tracer library.
//!
//! Interposes the allocator and mapping primitives of the host process,
//! streams framed records over a pipe to a forked `mtrack_parser` child, and
//! services a userfaultfd channel so that first-touch page faults on tracked
//! anonymous memory show up in the trace.
//!
//! The hook entry points live in [`hooks`]; everything else is plumbing they
//! share. Nothing in here may allocate through the hooked allocator while a
//! record is being produced; see [`tls`] for the re-entrancy flags that
//! enforce this.

pub mod bootstrap;
#[cfg(not(test))]
pub mod hooks;
pub mod pipe;
pub mod real;
pub mod spinlock;
pub mod stack;
pub mod sys;
pub mod tls;
pub mod tracer;
