//! Decoding side of the event codec.
//!
//! A [`RecordReader`] walks a byte slice; [`Event::read`] consumes one kind
//! byte, dispatches to a per-kind reader mirroring the writer's field order,
//! and yields a typed event. In packet mode every packet must hold exactly
//! one record; the stream form simply concatenates records.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::record::{AppType, CommandType, RecordType};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("truncated record payload")]
    Truncated,
    #[error("unknown record kind {0}")]
    UnknownKind(u8),
    #[error("unknown command {0}")]
    UnknownCommand(u8),
    #[error("unknown application type {0}")]
    UnknownAppType(u8),
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

impl From<std::io::Error> for DecodeError {
    fn from(_: std::io::Error) -> DecodeError {
        DecodeError::Truncated
    }
}

/// Cursor over encoded records.
pub struct RecordReader<'a> {
    data: &'a [u8],
}

impl<'a> RecordReader<'a> {
    pub fn new(data: &'a [u8]) -> RecordReader<'a> {
        RecordReader { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.data.read_u8()?)
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(self.data.read_u32::<LittleEndian>()?)
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.data.read_i32::<LittleEndian>()?)
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(self.data.read_u64::<LittleEndian>()?)
    }

    pub fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        if self.data.len() < len {
            return Err(DecodeError::Truncated);
        }
        let (bytes, rest) = self.data.split_at(len);
        self.data = rest;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// A stack blob: `u32` byte length followed by that many raw bytes,
    /// interpreted as `length / 8` instruction pointers.
    pub fn stack(&mut self) -> Result<Vec<u64>, DecodeError> {
        let len = self.u32()? as usize;
        if self.data.len() < len {
            return Err(DecodeError::Truncated);
        }
        let count = len / 8;
        let mut stack = Vec::with_capacity(count);
        for _ in 0..count {
            stack.push(self.u64()?);
        }
        // tolerate a ragged tail, the count is what matters
        let ragged = len - count * 8;
        if ragged > 0 {
            let mut sink = [0u8; 8];
            self.data.read_exact(&mut sink[..ragged])?;
        }
        Ok(stack)
    }
}

/// A decoded record.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start {
        app_id: u8,
        app_type: AppType,
    },
    Executable {
        app_id: u8,
        path: String,
    },
    WorkingDirectory {
        app_id: u8,
        cwd: String,
    },
    Library {
        app_id: u8,
        name: String,
        load_addr: u64,
    },
    LibraryHeader {
        app_id: u8,
        vaddr: u64,
        size: u64,
    },
    ThreadName {
        app_id: u8,
        tid: u32,
        name: String,
    },
    Malloc {
        app_id: u8,
        ts: u32,
        addr: u64,
        size: u64,
        tid: u32,
        stack: Vec<u64>,
    },
    Free {
        app_id: u8,
        addr: u64,
    },
    Mmap {
        kind: RecordType,
        app_id: u8,
        addr: u64,
        size: u64,
        prot: i32,
        flags: i32,
        tid: u32,
        stack: Vec<u64>,
    },
    Munmap {
        kind: RecordType,
        app_id: u8,
        addr: u64,
        size: u64,
    },
    Madvise {
        kind: RecordType,
        app_id: u8,
        addr: u64,
        size: u64,
        advice: i32,
    },
    PageFault {
        app_id: u8,
        ts: u32,
        addr: u64,
        tid: u32,
        stack: Vec<u64>,
    },
    PageRemove {
        app_id: u8,
        start: u64,
        end: u64,
    },
    PageRemap {
        app_id: u8,
        from: u64,
        to: u64,
        len: u64,
    },
    Command {
        app_id: u8,
        cmd: CommandType,
        name: String,
    },
    Time {
        app_id: u8,
        ts: u32,
    },
}

impl Event {
    /// Consume one record from the reader.
    pub fn read(r: &mut RecordReader) -> Result<Event, DecodeError> {
        let kind_byte = r.u8()?;
        let kind = RecordType::from_u8(kind_byte).ok_or(DecodeError::UnknownKind(kind_byte))?;
        let app_id = match kind {
            RecordType::Invalid => return Err(DecodeError::UnknownKind(kind_byte)),
            _ => r.u8()?,
        };
        Ok(match kind {
            RecordType::Invalid => unreachable!(),
            RecordType::Start => {
                let raw = r.u8()?;
                let app_type = AppType::from_u8(raw).ok_or(DecodeError::UnknownAppType(raw))?;
                let _reserved = r.u32()?;
                Event::Start { app_id, app_type }
            }
            RecordType::Executable => Event::Executable {
                app_id,
                path: r.string()?,
            },
            RecordType::WorkingDirectory => Event::WorkingDirectory {
                app_id,
                cwd: r.string()?,
            },
            RecordType::Library => Event::Library {
                app_id,
                name: r.string()?,
                load_addr: r.u64()?,
            },
            RecordType::LibraryHeader => Event::LibraryHeader {
                app_id,
                vaddr: r.u64()?,
                size: r.u64()?,
            },
            RecordType::ThreadName => Event::ThreadName {
                app_id,
                tid: r.u32()?,
                name: r.string()?,
            },
            RecordType::Malloc => Event::Malloc {
                app_id,
                ts: r.u32()?,
                addr: r.u64()?,
                size: r.u64()?,
                tid: r.u32()?,
                stack: r.stack()?,
            },
            RecordType::Free => Event::Free {
                app_id,
                addr: r.u64()?,
            },
            RecordType::MmapTracked | RecordType::MmapUntracked => Event::Mmap {
                kind,
                app_id,
                addr: r.u64()?,
                size: r.u64()?,
                prot: r.i32()?,
                flags: r.i32()?,
                tid: r.u32()?,
                stack: r.stack()?,
            },
            RecordType::MunmapTracked | RecordType::MunmapUntracked => Event::Munmap {
                kind,
                app_id,
                addr: r.u64()?,
                size: r.u64()?,
            },
            RecordType::MadviseTracked | RecordType::MadviseUntracked => Event::Madvise {
                kind,
                app_id,
                addr: r.u64()?,
                size: r.u64()?,
                advice: r.i32()?,
            },
            RecordType::PageFault => Event::PageFault {
                app_id,
                ts: r.u32()?,
                addr: r.u64()?,
                tid: r.u32()?,
                stack: r.stack()?,
            },
            RecordType::PageRemove => Event::PageRemove {
                app_id,
                start: r.u64()?,
                end: r.u64()?,
            },
            RecordType::PageRemap => Event::PageRemap {
                app_id,
                from: r.u64()?,
                to: r.u64()?,
                len: r.u64()?,
            },
            RecordType::Command => {
                let raw = r.u8()?;
                let cmd = CommandType::from_u8(raw).ok_or(DecodeError::UnknownCommand(raw))?;
                let name = match cmd {
                    CommandType::Snapshot => r.string()?,
                    _ => String::new(),
                };
                Event::Command { app_id, cmd, name }
            }
            RecordType::Time => Event::Time {
                app_id,
                ts: r.u32()?,
            },
        })
    }

    /// Decode a packet that must contain exactly one record.
    pub fn decode_packet(packet: &[u8]) -> Result<Event, DecodeError> {
        let mut r = RecordReader::new(packet);
        let event = Event::read(&mut r)?;
        if !r.is_empty() {
            return Err(DecodeError::TrailingBytes(r.remaining()));
        }
        Ok(event)
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            Event::Start { .. } => RecordType::Start,
            Event::Executable { .. } => RecordType::Executable,
            Event::WorkingDirectory { .. } => RecordType::WorkingDirectory,
            Event::Library { .. } => RecordType::Library,
            Event::LibraryHeader { .. } => RecordType::LibraryHeader,
            Event::ThreadName { .. } => RecordType::ThreadName,
            Event::Malloc { .. } => RecordType::Malloc,
            Event::Free { .. } => RecordType::Free,
            Event::Mmap { kind, .. } | Event::Munmap { kind, .. } | Event::Madvise { kind, .. } => {
                *kind
            }
            Event::PageFault { .. } => RecordType::PageFault,
            Event::PageRemove { .. } => RecordType::PageRemove,
            Event::PageRemap { .. } => RecordType::PageRemap,
            Event::Command { .. } => RecordType::Command,
            Event::Time { .. } => RecordType::Time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::{BufEmitter, RecordWriter};

    fn roundtrip(write: impl FnOnce(&mut RecordWriter<BufEmitter>)) -> Event {
        let mut buf = BufEmitter::new();
        let mut w = RecordWriter::new(&mut buf);
        write(&mut w);
        Event::decode_packet(buf.data()).expect("decode")
    }

    #[test]
    fn malloc_roundtrip() {
        let ev = roundtrip(|w| w.malloc(1, 42, 0xdeadbeef, 128, 7, &[0x100, 0x200]));
        assert_eq!(
            ev,
            Event::Malloc {
                app_id: 1,
                ts: 42,
                addr: 0xdeadbeef,
                size: 128,
                tid: 7,
                stack: vec![0x100, 0x200],
            }
        );
    }

    #[test]
    fn mmap_roundtrip() {
        let ev = roundtrip(|w| {
            w.mmap(
                RecordType::MmapTracked,
                1,
                0x7f00_0000,
                0x4000,
                3,
                0x22,
                9,
                &[0x1000, 0x2000, 0x3000],
            )
        });
        assert_eq!(
            ev,
            Event::Mmap {
                kind: RecordType::MmapTracked,
                app_id: 1,
                addr: 0x7f00_0000,
                size: 0x4000,
                prot: 3,
                flags: 0x22,
                tid: 9,
                stack: vec![0x1000, 0x2000, 0x3000],
            }
        );
    }

    #[test]
    fn library_roundtrip() {
        let ev = roundtrip(|w| w.library(1, b"/usr/lib/libc.so.6", 0x7f12_3456_0000));
        assert_eq!(
            ev,
            Event::Library {
                app_id: 1,
                name: "/usr/lib/libc.so.6".into(),
                load_addr: 0x7f12_3456_0000,
            }
        );
    }

    #[test]
    fn command_roundtrip() {
        let ev = roundtrip(|w| w.command(1, CommandType::Snapshot, b"after-warmup"));
        assert_eq!(
            ev,
            Event::Command {
                app_id: 1,
                cmd: CommandType::Snapshot,
                name: "after-warmup".into(),
            }
        );
        let ev = roundtrip(|w| w.command(1, CommandType::DisableSnapshots, b""));
        assert_eq!(
            ev,
            Event::Command {
                app_id: 1,
                cmd: CommandType::DisableSnapshots,
                name: String::new(),
            }
        );
    }

    #[test]
    fn empty_stack_roundtrip() {
        let ev = roundtrip(|w| w.page_fault(1, 7, 0x10abc, 9, &[]));
        assert_eq!(
            ev,
            Event::PageFault {
                app_id: 1,
                ts: 7,
                addr: 0x10abc,
                tid: 9,
                stack: vec![],
            }
        );
    }

    #[test]
    fn truncated_record() {
        let mut buf = BufEmitter::new();
        RecordWriter::new(&mut buf).free(1, 0xabcd);
        let bytes = buf.into_inner();
        assert!(matches!(
            Event::decode_packet(&bytes[..bytes.len() - 1]),
            Err(DecodeError::Truncated)
        ));
    }

    #[test]
    fn unknown_kind() {
        assert!(matches!(
            Event::decode_packet(&[0xff, 1]),
            Err(DecodeError::UnknownKind(0xff))
        ));
    }

    #[test]
    fn packet_with_trailing_bytes() {
        let mut buf = BufEmitter::new();
        let mut w = RecordWriter::new(&mut buf);
        w.free(1, 0xabcd);
        w.free(1, 0xef01);
        assert!(matches!(
            Event::decode_packet(buf.data()),
            Err(DecodeError::TrailingBytes(10))
        ));
    }
}
