//! Encoding side of the event codec.
//!
//! All integers are written little-endian with no padding. Strings and byte
//! blobs carry a `u32` length prefix; the empty string is a zero length with
//! no bytes. Every write is tagged with a [`WriteKind`] so that packet
//! transports know where a record ends without any extra framing bytes.

use crate::record::{AppType, CommandType, RecordType, FILE_VERSION};

/// Marks the final field of a record. Transports that frame by packet flush
/// on `Last`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    Continuation,
    Last,
}

/// Something record bytes can be pushed into: the pipe transport in the
/// tracer, a growable buffer in tests and in the parser's own tooling.
pub trait Emitter {
    fn write_bytes(&mut self, bytes: &[u8], kind: WriteKind);

    /// Called with the total encoded size of a record before its fields are
    /// written. Buffered emitters use it to reserve space; the pipe emitter
    /// uses it to reject oversized records up front.
    fn reserve(&mut self, _size: usize) {}
}

/// Vec-backed [`Emitter`]. Records are appended back to back.
#[derive(Default)]
pub struct BufEmitter {
    data: Vec<u8>,
}

impl BufEmitter {
    pub fn new() -> BufEmitter {
        BufEmitter::default()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl Emitter for BufEmitter {
    fn write_bytes(&mut self, bytes: &[u8], _kind: WriteKind) {
        self.data.extend_from_slice(bytes);
    }

    fn reserve(&mut self, size: usize) {
        self.data.reserve(size);
    }
}

fn put_u8<E: Emitter + ?Sized>(out: &mut E, value: u8, kind: WriteKind) {
    out.write_bytes(&[value], kind);
}

fn put_u32<E: Emitter + ?Sized>(out: &mut E, value: u32, kind: WriteKind) {
    out.write_bytes(&value.to_le_bytes(), kind);
}

fn put_i32<E: Emitter + ?Sized>(out: &mut E, value: i32, kind: WriteKind) {
    out.write_bytes(&value.to_le_bytes(), kind);
}

fn put_u64<E: Emitter + ?Sized>(out: &mut E, value: u64, kind: WriteKind) {
    out.write_bytes(&value.to_le_bytes(), kind);
}

fn put_str<E: Emitter + ?Sized>(out: &mut E, bytes: &[u8], kind: WriteKind) {
    if bytes.is_empty() {
        put_u32(out, 0, kind);
        return;
    }
    put_u32(out, bytes.len() as u32, WriteKind::Continuation);
    out.write_bytes(bytes, kind);
}

fn put_stack<E: Emitter + ?Sized>(out: &mut E, stack: &[u64], kind: WriteKind) {
    if stack.is_empty() {
        put_u32(out, 0, kind);
        return;
    }
    put_u32(out, (stack.len() * 8) as u32, WriteKind::Continuation);
    for (i, ip) in stack.iter().enumerate() {
        let k = if i + 1 == stack.len() {
            kind
        } else {
            WriteKind::Continuation
        };
        put_u64(out, *ip, k);
    }
}

fn str_size(bytes: &[u8]) -> usize {
    4 + bytes.len()
}

fn stack_size(stack: &[u64]) -> usize {
    4 + stack.len() * 8
}

/// Writes whole records into an [`Emitter`], one method per record kind. The
/// field order here is the single source of truth for the wire format; the
/// decoder in [`crate::event`] mirrors it.
pub struct RecordWriter<'a, E: Emitter + ?Sized> {
    out: &'a mut E,
}

impl<'a, E: Emitter + ?Sized> RecordWriter<'a, E> {
    pub fn new(out: &'a mut E) -> RecordWriter<'a, E> {
        RecordWriter { out }
    }

    /// The stream header: a bare version word, its own packet.
    pub fn version(&mut self) {
        self.out.reserve(4);
        put_u32(self.out, FILE_VERSION, WriteKind::Last);
    }

    pub fn start(&mut self, app_id: u8, app_type: AppType) {
        self.out.reserve(1 + 1 + 1 + 4);
        put_u8(self.out, RecordType::Start as u8, WriteKind::Continuation);
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_u8(self.out, app_type as u8, WriteKind::Continuation);
        put_u32(self.out, 0, WriteKind::Last); // reserved
    }

    pub fn executable(&mut self, app_id: u8, path: &[u8]) {
        self.out.reserve(1 + 1 + str_size(path));
        put_u8(self.out, RecordType::Executable as u8, WriteKind::Continuation);
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_str(self.out, path, WriteKind::Last);
    }

    pub fn working_directory(&mut self, app_id: u8, cwd: &[u8]) {
        self.out.reserve(1 + 1 + str_size(cwd));
        put_u8(
            self.out,
            RecordType::WorkingDirectory as u8,
            WriteKind::Continuation,
        );
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_str(self.out, cwd, WriteKind::Last);
    }

    pub fn library(&mut self, app_id: u8, name: &[u8], load_addr: u64) {
        self.out.reserve(1 + 1 + str_size(name) + 8);
        put_u8(self.out, RecordType::Library as u8, WriteKind::Continuation);
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_str(self.out, name, WriteKind::Continuation);
        put_u64(self.out, load_addr, WriteKind::Last);
    }

    pub fn library_header(&mut self, app_id: u8, vaddr: u64, size: u64) {
        self.out.reserve(1 + 1 + 8 + 8);
        put_u8(
            self.out,
            RecordType::LibraryHeader as u8,
            WriteKind::Continuation,
        );
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_u64(self.out, vaddr, WriteKind::Continuation);
        put_u64(self.out, size, WriteKind::Last);
    }

    pub fn thread_name(&mut self, app_id: u8, tid: u32, name: &[u8]) {
        self.out.reserve(1 + 1 + 4 + str_size(name));
        put_u8(self.out, RecordType::ThreadName as u8, WriteKind::Continuation);
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_u32(self.out, tid, WriteKind::Continuation);
        put_str(self.out, name, WriteKind::Last);
    }

    pub fn malloc(&mut self, app_id: u8, ts: u32, addr: u64, size: u64, tid: u32, stack: &[u64]) {
        self.out.reserve(1 + 1 + 4 + 8 + 8 + 4 + stack_size(stack));
        put_u8(self.out, RecordType::Malloc as u8, WriteKind::Continuation);
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_u32(self.out, ts, WriteKind::Continuation);
        put_u64(self.out, addr, WriteKind::Continuation);
        put_u64(self.out, size, WriteKind::Continuation);
        put_u32(self.out, tid, WriteKind::Continuation);
        put_stack(self.out, stack, WriteKind::Last);
    }

    pub fn free(&mut self, app_id: u8, addr: u64) {
        self.out.reserve(1 + 1 + 8);
        put_u8(self.out, RecordType::Free as u8, WriteKind::Continuation);
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_u64(self.out, addr, WriteKind::Last);
    }

    /// `kind` must be `MmapTracked` or `MmapUntracked`.
    #[allow(clippy::too_many_arguments)]
    pub fn mmap(
        &mut self,
        kind: RecordType,
        app_id: u8,
        addr: u64,
        size: u64,
        prot: i32,
        flags: i32,
        tid: u32,
        stack: &[u64],
    ) {
        debug_assert!(matches!(
            kind,
            RecordType::MmapTracked | RecordType::MmapUntracked
        ));
        self.out
            .reserve(1 + 1 + 8 + 8 + 4 + 4 + 4 + stack_size(stack));
        put_u8(self.out, kind as u8, WriteKind::Continuation);
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_u64(self.out, addr, WriteKind::Continuation);
        put_u64(self.out, size, WriteKind::Continuation);
        put_i32(self.out, prot, WriteKind::Continuation);
        put_i32(self.out, flags, WriteKind::Continuation);
        put_u32(self.out, tid, WriteKind::Continuation);
        put_stack(self.out, stack, WriteKind::Last);
    }

    /// `kind` must be `MunmapTracked` or `MunmapUntracked`.
    pub fn munmap(&mut self, kind: RecordType, app_id: u8, addr: u64, size: u64) {
        debug_assert!(matches!(
            kind,
            RecordType::MunmapTracked | RecordType::MunmapUntracked
        ));
        self.out.reserve(1 + 1 + 8 + 8);
        put_u8(self.out, kind as u8, WriteKind::Continuation);
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_u64(self.out, addr, WriteKind::Continuation);
        put_u64(self.out, size, WriteKind::Last);
    }

    /// `kind` must be `MadviseTracked` or `MadviseUntracked`.
    pub fn madvise(&mut self, kind: RecordType, app_id: u8, addr: u64, size: u64, advice: i32) {
        debug_assert!(matches!(
            kind,
            RecordType::MadviseTracked | RecordType::MadviseUntracked
        ));
        self.out.reserve(1 + 1 + 8 + 8 + 4);
        put_u8(self.out, kind as u8, WriteKind::Continuation);
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_u64(self.out, addr, WriteKind::Continuation);
        put_u64(self.out, size, WriteKind::Continuation);
        put_i32(self.out, advice, WriteKind::Last);
    }

    pub fn page_fault(&mut self, app_id: u8, ts: u32, addr: u64, tid: u32, stack: &[u64]) {
        self.out.reserve(1 + 1 + 4 + 8 + 4 + stack_size(stack));
        put_u8(self.out, RecordType::PageFault as u8, WriteKind::Continuation);
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_u32(self.out, ts, WriteKind::Continuation);
        put_u64(self.out, addr, WriteKind::Continuation);
        put_u32(self.out, tid, WriteKind::Continuation);
        put_stack(self.out, stack, WriteKind::Last);
    }

    pub fn page_remove(&mut self, app_id: u8, start: u64, end: u64) {
        self.out.reserve(1 + 1 + 8 + 8);
        put_u8(self.out, RecordType::PageRemove as u8, WriteKind::Continuation);
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_u64(self.out, start, WriteKind::Continuation);
        put_u64(self.out, end, WriteKind::Last);
    }

    pub fn page_remap(&mut self, app_id: u8, from: u64, to: u64, len: u64) {
        self.out.reserve(1 + 1 + 8 + 8 + 8);
        put_u8(self.out, RecordType::PageRemap as u8, WriteKind::Continuation);
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_u64(self.out, from, WriteKind::Continuation);
        put_u64(self.out, to, WriteKind::Continuation);
        put_u64(self.out, len, WriteKind::Last);
    }

    pub fn time(&mut self, app_id: u8, ts: u32) {
        self.out.reserve(1 + 1 + 4);
        put_u8(self.out, RecordType::Time as u8, WriteKind::Continuation);
        put_u8(self.out, app_id, WriteKind::Continuation);
        put_u32(self.out, ts, WriteKind::Last);
    }

    /// `name` is only meaningful for `CommandType::Snapshot`; pass an empty
    /// slice for an unnamed snapshot.
    pub fn command(&mut self, app_id: u8, cmd: CommandType, name: &[u8]) {
        match cmd {
            CommandType::Snapshot => {
                self.out.reserve(1 + 1 + 1 + str_size(name));
                put_u8(self.out, RecordType::Command as u8, WriteKind::Continuation);
                put_u8(self.out, app_id, WriteKind::Continuation);
                put_u8(self.out, cmd as u8, WriteKind::Continuation);
                put_str(self.out, name, WriteKind::Last);
            }
            CommandType::EnableSnapshots | CommandType::DisableSnapshots => {
                self.out.reserve(1 + 1 + 1);
                put_u8(self.out, RecordType::Command as u8, WriteKind::Continuation);
                put_u8(self.out, app_id, WriteKind::Continuation);
                put_u8(self.out, cmd as u8, WriteKind::Last);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_record_size() {
        // kind + appId + ts + addr + size + tid + (len + 2 ips)
        let mut buf = BufEmitter::new();
        RecordWriter::new(&mut buf).malloc(1, 42, 0xdeadbeef, 128, 7, &[0x100, 0x200]);
        assert_eq!(buf.data().len(), 1 + 1 + 4 + 8 + 8 + 4 + (4 + 16));
        assert_eq!(buf.data().len(), 46);
    }

    #[test]
    fn empty_string_is_zero_length() {
        let mut buf = BufEmitter::new();
        RecordWriter::new(&mut buf).executable(1, b"");
        assert_eq!(buf.data(), &[2, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn version_header() {
        let mut buf = BufEmitter::new();
        RecordWriter::new(&mut buf).version();
        assert_eq!(buf.data(), FILE_VERSION.to_le_bytes());
    }
}
