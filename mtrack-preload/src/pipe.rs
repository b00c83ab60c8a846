//! Packet transport: one record per atomic pipe write.
//!
//! Records are staged in a fixed buffer no larger than `PIPE_BUF`, so a
//! flushed record is a single packet on the `O_DIRECT` pipe and the parser
//! can read record-by-record without any length framing. A record that does
//! not fit is a programmer error and aborts.

use std::os::unix::io::RawFd;
use std::process;

use mtrack_common::{Emitter, RecordWriter, WriteKind};

pub const PACKET_CAPACITY: usize = libc::PIPE_BUF;

pub struct PipeEmitter {
    fd: RawFd,
    buf: [u8; PACKET_CAPACITY],
    offset: usize,
}

impl PipeEmitter {
    pub fn new(fd: RawFd) -> PipeEmitter {
        PipeEmitter {
            fd,
            buf: [0; PACKET_CAPACITY],
            offset: 0,
        }
    }

    pub fn writer(&mut self) -> RecordWriter<'_, PipeEmitter> {
        RecordWriter::new(self)
    }

    fn flush(&mut self) {
        let mut written = 0;
        while written < self.offset {
            let r = unsafe {
                libc::write(
                    self.fd,
                    self.buf[written..].as_ptr() as *const libc::c_void,
                    self.offset - written,
                )
            };
            if r < 0 {
                let errno = std::io::Error::last_os_error();
                if errno.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                // reader is gone; the tracer is dead from here on
                break;
            }
            written += r as usize;
        }
        self.offset = 0;
    }
}

impl Emitter for PipeEmitter {
    fn write_bytes(&mut self, bytes: &[u8], kind: WriteKind) {
        if self.offset + bytes.len() > PACKET_CAPACITY {
            const MSG: &[u8] = b"mtrack: record exceeds packet capacity\n";
            let _ = unsafe {
                libc::write(
                    libc::STDERR_FILENO,
                    MSG.as_ptr() as *const libc::c_void,
                    MSG.len(),
                )
            };
            process::abort();
        }
        self.buf[self.offset..self.offset + bytes.len()].copy_from_slice(bytes);
        self.offset += bytes.len();
        if kind == WriteKind::Last {
            self.flush();
        }
    }

    fn reserve(&mut self, size: usize) {
        if size > PACKET_CAPACITY {
            process::abort();
        }
    }
}
