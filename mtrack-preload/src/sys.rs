//! userfaultfd kernel ABI.
//!
//! `libc` only carries the syscall number, so the ioctl requests and message
//! layouts are declared here, matching `<linux/userfaultfd.h>`.

#![allow(non_camel_case_types)]

use libc::c_ulong;

const IOC_WRITE: c_ulong = 1;
const IOC_READ: c_ulong = 2;

const fn ioc(dir: c_ulong, kind: c_ulong, nr: c_ulong, size: c_ulong) -> c_ulong {
    (dir << 30) | (size << 16) | (kind << 8) | nr
}

const UFFDIO: c_ulong = 0xAA;

/// The api word handed to `UFFDIO_API`; the kernel echoes it back.
pub const UFFD_API: u64 = 0xAA;

pub const UFFD_FEATURE_THREAD_ID: u64 = 1 << 8;

pub const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;

pub const UFFD_EVENT_PAGEFAULT: u8 = 0x12;
pub const UFFD_EVENT_FORK: u8 = 0x13;
pub const UFFD_EVENT_REMAP: u8 = 0x14;
pub const UFFD_EVENT_REMOVE: u8 = 0x15;
pub const UFFD_EVENT_UNMAP: u8 = 0x16;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UffdioApi {
    pub api: u64,
    pub features: u64,
    pub ioctls: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UffdioRange {
    pub start: u64,
    pub len: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UffdioRegister {
    pub range: UffdioRange,
    pub mode: u64,
    pub ioctls: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UffdioZeropage {
    pub range: UffdioRange,
    pub mode: u64,
    pub zeropage: i64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union PagefaultFeat {
    pub ptid: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct UffdPagefault {
    pub flags: u64,
    pub address: u64,
    pub feat: PagefaultFeat,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct UffdFork {
    pub ufd: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct UffdRemap {
    pub from: u64,
    pub to: u64,
    pub len: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct UffdRemove {
    pub start: u64,
    pub end: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union UffdMsgArg {
    pub pagefault: UffdPagefault,
    pub fork: UffdFork,
    pub remap: UffdRemap,
    pub remove: UffdRemove,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct UffdMsg {
    pub event: u8,
    pub reserved1: u8,
    pub reserved2: u16,
    pub reserved3: u32,
    pub arg: UffdMsgArg,
}

impl UffdMsg {
    pub fn zeroed() -> UffdMsg {
        unsafe { std::mem::zeroed() }
    }
}

pub const UFFDIO_API_IOCTL: c_ulong = ioc(
    IOC_WRITE | IOC_READ,
    UFFDIO,
    0x3F,
    std::mem::size_of::<UffdioApi>() as c_ulong,
);
pub const UFFDIO_REGISTER_IOCTL: c_ulong = ioc(
    IOC_WRITE | IOC_READ,
    UFFDIO,
    0x00,
    std::mem::size_of::<UffdioRegister>() as c_ulong,
);
pub const UFFDIO_UNREGISTER_IOCTL: c_ulong = ioc(
    IOC_READ,
    UFFDIO,
    0x01,
    std::mem::size_of::<UffdioRange>() as c_ulong,
);
pub const UFFDIO_ZEROPAGE_IOCTL: c_ulong = ioc(
    IOC_WRITE | IOC_READ,
    UFFDIO,
    0x04,
    std::mem::size_of::<UffdioZeropage>() as c_ulong,
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn abi_sizes() {
        assert_eq!(size_of::<UffdioApi>(), 24);
        assert_eq!(size_of::<UffdioRange>(), 16);
        assert_eq!(size_of::<UffdioRegister>(), 32);
        assert_eq!(size_of::<UffdioZeropage>(), 32);
        assert_eq!(size_of::<UffdMsg>(), 32);
    }

    #[test]
    fn ioctl_requests() {
        assert_eq!(UFFDIO_API_IOCTL, 0xC018AA3F);
        assert_eq!(UFFDIO_REGISTER_IOCTL, 0xC020AA00);
        assert_eq!(UFFDIO_UNREGISTER_IOCTL, 0x8010AA01);
        assert_eq!(UFFDIO_ZEROPAGE_IOCTL, 0xC020AA04);
    }
}
