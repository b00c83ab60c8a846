//! The record state machine.
//!
//! The stream starts with a version word; everything after is a sequence of
//! records. Events are appended to the artifact as they are decoded; stack
//! and string resolution is deferred: new instruction pointers are handed
//! to the resolver worker, and the stacks/strings arrays are written at the
//! end once the worker has drained.

use std::sync::Arc;

use log::warn;
use rustc_hash::FxHashMap;
use thiserror::Error;

use mtrack_common::{
    AppType, DecodeError, Event, Indexer, MmapTracker, RecordReader, RecordType, CommandType,
    FILE_VERSION, PAGE_SIZE,
};

use crate::module::{Module, ModuleRegistry};
use crate::resolver::{Frame, ResolvedAddress, ResolverThread, UnresolvedAddress};
use crate::writer::ArtifactWriter;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid file version (got {got} vs {expected})")]
    Version { got: u32, expected: u32 },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),
}

#[derive(PartialEq, Eq)]
enum ReadState {
    Version,
    Records,
}

#[derive(Debug, Default)]
pub struct Summary {
    pub records: u64,
    pub events: u64,
    pub strings: usize,
    pub string_hits: u64,
    pub string_misses: u64,
    pub stacks: usize,
    pub stack_hits: u64,
    pub stack_misses: u64,
    pub thread_names: usize,
    pub tracked_regions: usize,
}

pub struct Parser {
    writer: ArtifactWriter,
    state: ReadState,
    threshold: u64,

    exe: String,
    cwd: String,
    app_type: AppType,
    thread_names: FxHashMap<u32, String>,
    snapshots_enabled: bool,

    registry: ModuleRegistry,
    current_module: Option<usize>,
    module_cache: Vec<(u64, u64, Arc<Module>)>,
    cache_dirty: bool,

    tracker: MmapTracker,

    string_indexer: Indexer<String>,
    stack_indexer: Indexer<Vec<u64>>,
    address_indexer: Indexer<u64>,
    resolved: Vec<Option<ResolvedAddress>>,
    resolver: ResolverThread,

    records: u64,
    events: u64,
}

impl Parser {
    pub fn new(writer: ArtifactWriter, threshold: u64) -> Parser {
        Parser {
            writer,
            state: ReadState::Version,
            threshold,
            exe: String::new(),
            cwd: String::new(),
            app_type: AppType::Elf,
            thread_names: FxHashMap::default(),
            snapshots_enabled: true,
            registry: ModuleRegistry::new(),
            current_module: None,
            module_cache: Vec::new(),
            cache_dirty: false,
            tracker: MmapTracker::new(),
            string_indexer: Indexer::new(),
            stack_indexer: Indexer::new(),
            address_indexer: Indexer::new(),
            resolved: Vec::new(),
            resolver: ResolverThread::new(),
            records: 0,
            events: 0,
        }
    }

    /// Feed a chunk of the stream: a whole file, or one packet. Records
    /// never straddle chunks.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<(), ParseError> {
        if self.state == ReadState::Version {
            if data.len() < 4 {
                return Err(DecodeError::Truncated.into());
            }
            let got = u32::from_le_bytes(data[..4].try_into().unwrap());
            if got != FILE_VERSION {
                return Err(ParseError::Version {
                    got,
                    expected: FILE_VERSION,
                });
            }
            self.state = ReadState::Records;
            self.writer.begin()?;
            data = &data[4..];
        }

        let mut reader = RecordReader::new(data);
        while !reader.is_empty() {
            let event = Event::read(&mut reader)?;
            self.records += 1;
            self.handle(event)?;
        }
        Ok(())
    }

    fn handle(&mut self, event: Event) -> Result<(), ParseError> {
        match event {
            Event::Start { app_type, .. } => {
                self.app_type = app_type;
            }
            Event::Executable { path, .. } => {
                self.exe = path;
            }
            Event::WorkingDirectory { cwd, .. } => {
                self.cwd = format!("{cwd}/");
            }
            Event::Library {
                name, load_addr, ..
            } => {
                self.handle_library(name, load_addr);
            }
            Event::LibraryHeader { vaddr, size, .. } => {
                let Some(current) = self.current_module else {
                    warn!("library header without a current module");
                    return Ok(());
                };
                self.registry.add_header(current, vaddr, size);
                self.cache_dirty = true;
            }
            Event::ThreadName { tid, name, .. } => {
                self.thread_names.insert(tid, name);
            }
            Event::Malloc {
                addr, size, tid, stack, ..
            } => {
                if size < self.threshold {
                    return Ok(());
                }
                let sid = self.index_stack(stack);
                self.events += 1;
                let tuple = format!(
                    "[{},{},{},{},{}]",
                    RecordType::Malloc as u8,
                    addr,
                    size,
                    tid,
                    sid
                );
                self.writer.event(&tuple)?;
            }
            Event::Free { addr, .. } => {
                self.events += 1;
                let tuple = format!("[{},{}]", RecordType::Free as u8, addr);
                self.writer.event(&tuple)?;
            }
            Event::Mmap {
                kind,
                addr,
                size,
                prot,
                flags,
                tid,
                stack,
                ..
            } => {
                let sid = self.index_stack(stack);
                if kind == RecordType::MmapTracked {
                    self.tracker.mmap(addr, size, prot, flags, sid);
                }
                self.events += 1;
                let tuple = format!(
                    "[{},{},{},{},{},{},{}]",
                    kind as u8, addr, size, prot, flags, tid, sid
                );
                self.writer.event(&tuple)?;
            }
            Event::Munmap { kind, addr, size, .. } => {
                if kind == RecordType::MunmapTracked {
                    self.tracker.munmap(addr, size);
                }
                self.events += 1;
                let tuple = format!("[{},{},{}]", kind as u8, addr, size);
                self.writer.event(&tuple)?;
            }
            Event::Madvise {
                kind,
                addr,
                size,
                advice,
                ..
            } => {
                if kind == RecordType::MadviseTracked {
                    self.tracker.madvise(addr, size);
                }
                self.events += 1;
                let tuple = format!("[{},{},{},{}]", kind as u8, addr, size, advice);
                self.writer.event(&tuple)?;
            }
            Event::PageFault {
                addr, tid, stack, ..
            } => {
                let sid = self.index_stack(stack);
                self.events += 1;
                let tuple = format!(
                    "[{},{},{},{},{}]",
                    RecordType::PageFault as u8,
                    addr,
                    PAGE_SIZE,
                    tid,
                    sid
                );
                self.writer.event(&tuple)?;
            }
            Event::PageRemove { start, end, .. } => {
                self.events += 1;
                let tuple = format!("[{},{},{}]", RecordType::PageRemove as u8, start, end);
                self.writer.event(&tuple)?;
            }
            Event::PageRemap { from, to, len, .. } => {
                self.events += 1;
                let tuple = format!("[{},{},{},{}]", RecordType::PageRemap as u8, from, to, len);
                self.writer.event(&tuple)?;
            }
            Event::Command { cmd, name, .. } => match cmd {
                CommandType::Snapshot => {
                    if self.snapshots_enabled {
                        let (name_id, _) = self.string_indexer.index(&name);
                        self.events += 1;
                        let tuple = format!(
                            "[{},{},{}]",
                            RecordType::Command as u8,
                            cmd as u8,
                            name_id
                        );
                        self.writer.event(&tuple)?;
                    }
                }
                CommandType::EnableSnapshots => self.snapshots_enabled = true,
                CommandType::DisableSnapshots => self.snapshots_enabled = false,
            },
            Event::Time { ts, .. } => {
                self.events += 1;
                let tuple = format!("[{},{}]", RecordType::Time as u8, ts);
                self.writer.event(&tuple)?;
            }
        }
        Ok(())
    }

    fn handle_library(&mut self, name: String, load_addr: u64) {
        if name.starts_with("linux-vdso.so") || name.starts_with("linux-gate.so") {
            return;
        }
        let name = if name == "s" { self.exe.clone() } else { name };
        let name = if !name.starts_with('/') && !name.is_empty() {
            let joined = format!("{}{}", self.cwd, name);
            std::fs::canonicalize(&joined)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or(joined)
        } else {
            name
        };
        let id = self
            .registry
            .create(self.app_type, &mut self.string_indexer, name, load_addr);
        self.current_module = Some(id);
    }

    /// Deduplicate a stack and queue any instruction pointers seen for the
    /// first time. The module cache is rebuilt lazily beforehand so that new
    /// library headers are visible.
    fn index_stack(&mut self, stack: Vec<u64>) -> i32 {
        if self.cache_dirty {
            self.rebuild_module_cache();
        }
        let (sid, inserted) = self.stack_indexer.index(&stack);
        if inserted {
            let mut batch = Vec::new();
            for ip in &stack {
                let (aid, new) = self.address_indexer.index(ip);
                if new {
                    self.resolved.push(None);
                    batch.push(UnresolvedAddress {
                        aid,
                        ip: *ip,
                        module: self.module_for(*ip),
                    });
                }
            }
            self.resolver.enqueue(batch);
        }
        sid
    }

    fn rebuild_module_cache(&mut self) {
        self.module_cache = self.registry.ranges().collect();
        self.module_cache.sort_by_key(|&(start, _, _)| start);
        self.cache_dirty = false;
    }

    fn module_for(&self, ip: u64) -> Option<Arc<Module>> {
        let cache = &self.module_cache;
        if cache.is_empty() {
            return None;
        }
        let mut idx = cache.partition_point(|&(start, _, _)| start <= ip);
        if idx == 0 {
            if cache.len() == 1 {
                idx = 1;
            } else {
                return None;
            }
        }
        let (start, end, module) = &cache[idx - 1];
        // range ends are treated as inclusive here
        if ip >= *start && ip <= *end {
            Some(module.clone())
        } else {
            None
        }
    }

    /// Stop the resolver, collect its results, write the stacks and strings
    /// arrays, and close the artifact. The byte vector is only present for
    /// in-memory writers.
    pub fn finish(mut self) -> Result<(Summary, Option<Vec<u8>>), ParseError> {
        self.resolver.stop();
        for batch in self.resolver.results().try_iter() {
            for address in batch {
                let slot = address.aid as usize;
                if slot < self.resolved.len() {
                    self.resolved[slot] = Some(address);
                }
            }
        }

        self.writer.finish_events()?;

        for stack in self.stack_indexer.values() {
            self.writer.stack_begin()?;
            for ip in stack {
                let aid = self.address_indexer.get(ip).unwrap_or(-1);
                let resolved = usize::try_from(aid)
                    .ok()
                    .and_then(|slot| self.resolved.get(slot))
                    .and_then(Option::as_ref);
                let entry = match resolved {
                    Some(address) => {
                        let mut entry = frame_tuple(&mut self.string_indexer, &address.frame);
                        if !address.inlined.is_empty() {
                            entry.push_str(",[");
                            for (i, frame) in address.inlined.iter().enumerate() {
                                entry.push_str(&frame_tuple(&mut self.string_indexer, frame));
                                entry.push(']');
                                entry.push(if i + 1 == address.inlined.len() { ']' } else { ',' });
                            }
                        }
                        entry.push(']');
                        entry
                    }
                    None => "[-1,-1,-1]".to_string(),
                };
                self.writer.stack_frame(&entry)?;
            }
            self.writer.stack_end()?;
        }
        self.writer.finish_stacks()?;

        for value in self.string_indexer.values() {
            self.writer.string(value)?;
        }

        let summary = Summary {
            records: self.records,
            events: self.events,
            strings: self.string_indexer.len(),
            string_hits: self.string_indexer.hits(),
            string_misses: self.string_indexer.misses(),
            stacks: self.stack_indexer.len(),
            stack_hits: self.stack_indexer.hits(),
            stack_misses: self.stack_indexer.misses(),
            thread_names: self.thread_names.len(),
            tracked_regions: self.tracker.len(),
        };

        let data = self.writer.finish()?;
        Ok((summary, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtrack_common::{BufEmitter, RecordWriter};
    use serde_json::{json, Value};

    fn parse_bytes(data: &[u8], threshold: u64) -> (Summary, Value) {
        let mut parser = Parser::new(ArtifactWriter::buffer(), threshold);
        parser.feed(data).expect("feed");
        let (summary, bytes) = parser.finish().expect("finish");
        let json = serde_json::from_slice(&bytes.unwrap()).expect("valid json");
        (summary, json)
    }

    fn stream(write: impl FnOnce(&mut RecordWriter<BufEmitter>)) -> Vec<u8> {
        let mut buf = BufEmitter::new();
        let mut w = RecordWriter::new(&mut buf);
        w.version();
        write(&mut w);
        buf.into_inner()
    }

    #[test]
    fn version_only_stream() {
        let (summary, json) = parse_bytes(&stream(|_| {}), 0);
        assert_eq!(summary.records, 0);
        assert_eq!(json["events"], json!([null]));
        assert_eq!(json["stacks"], json!([null]));
        assert_eq!(json["strings"], json!([null]));
    }

    #[test]
    fn version_mismatch_aborts() {
        let mut parser = Parser::new(ArtifactWriter::buffer(), 0);
        let err = parser.feed(&99u32.to_le_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::Version { got: 99, .. }));
    }

    #[test]
    fn malloc_with_module_and_stack() {
        let data = stream(|w| {
            w.start(1, AppType::Elf);
            w.working_directory(1, b"/w");
            w.library(1, b"./a.so", 0x1000);
            w.library_header(1, 0, 0x1000);
            w.malloc(1, 1, 0x1080, 32, 3, &[0x1100]);
        });
        let (summary, json) = parse_bytes(&data, 0);
        assert_eq!(summary.records, 5);
        assert_eq!(summary.events, 1);
        assert_eq!(summary.stacks, 1);
        assert_eq!(
            json["events"],
            json!([[RecordType::Malloc as u8, 0x1080, 32, 3, 0], null])
        );
        // one stack with one (unresolved) frame; ./a.so does not exist on
        // disk so only the module name made it into the string table
        assert_eq!(json["stacks"], json!([[[-1, -1, -1], null], null]));
        assert_eq!(json["strings"], json!(["/w/./a.so", null]));
    }

    #[test]
    fn stacks_are_deduplicated() {
        let data = stream(|w| {
            w.malloc(1, 1, 0x10, 32, 3, &[0x100, 0x200]);
            w.malloc(1, 2, 0x20, 64, 3, &[0x100, 0x200]);
            w.malloc(1, 3, 0x30, 64, 3, &[0x300]);
        });
        let (summary, json) = parse_bytes(&data, 0);
        assert_eq!(summary.stacks, 2);
        assert_eq!(summary.stack_hits, 1);
        assert_eq!(summary.stack_misses, 2);
        assert_eq!(json["events"][0][4], json!(0));
        assert_eq!(json["events"][1][4], json!(0));
        assert_eq!(json["events"][2][4], json!(1));
    }

    #[test]
    fn threshold_suppresses_small_mallocs() {
        let data = stream(|w| {
            w.malloc(1, 1, 0x10, 16, 3, &[0x100]);
            w.malloc(1, 2, 0x20, 4096, 3, &[0x200]);
        });
        let (summary, json) = parse_bytes(&data, 1024);
        assert_eq!(summary.records, 2);
        assert_eq!(summary.events, 1);
        assert_eq!(json["events"][0][1], json!(0x20));
        assert_eq!(json["events"][1], json!(null));
    }

    #[test]
    fn tracker_mirror_follows_tracked_records() {
        let data = stream(|w| {
            w.mmap(RecordType::MmapTracked, 1, 0x1000, 4 * PAGE_SIZE, 3, 0x22, 7, &[]);
            w.munmap(RecordType::MunmapTracked, 1, 0x3000, PAGE_SIZE);
            w.mmap(RecordType::MmapUntracked, 1, 0x100000, PAGE_SIZE, 0, 2, 7, &[]);
        });
        let (summary, json) = parse_bytes(&data, 0);
        // [0x1000,0x3000) and [0x4000,0x5000); the untracked mapping is not
        // mirrored
        assert_eq!(summary.tracked_regions, 2);
        assert_eq!(summary.events, 3);
        assert_eq!(
            json["events"][0],
            json!([
                RecordType::MmapTracked as u8,
                0x1000,
                4 * PAGE_SIZE,
                3,
                0x22,
                7,
                -1
            ])
        );
    }

    #[test]
    fn page_fault_event_shape() {
        let data = stream(|w| {
            w.page_fault(1, 9, 0x10abc, 9, &[0x100]);
        });
        let (_, json) = parse_bytes(&data, 0);
        assert_eq!(
            json["events"],
            json!([[RecordType::PageFault as u8, 0x10abc, PAGE_SIZE, 9, 0], null])
        );
    }

    #[test]
    fn snapshot_commands_toggle() {
        let data = stream(|w| {
            w.command(1, CommandType::Snapshot, b"one");
            w.command(1, CommandType::DisableSnapshots, b"");
            w.command(1, CommandType::Snapshot, b"two");
            w.command(1, CommandType::EnableSnapshots, b"");
            w.command(1, CommandType::Snapshot, b"three");
        });
        let (summary, json) = parse_bytes(&data, 0);
        assert_eq!(summary.events, 2);
        assert_eq!(json["events"][0][1], json!(CommandType::Snapshot as u8));
        // "one" and "three" made it, "two" was dropped while disabled
        assert_eq!(json["strings"], json!(["one", "three", null]));
    }

    #[test]
    fn thread_names_and_time() {
        let data = stream(|w| {
            w.thread_name(1, 42, b"worker");
            w.time(1, 1234);
        });
        let (summary, json) = parse_bytes(&data, 0);
        assert_eq!(summary.thread_names, 1);
        assert_eq!(json["events"], json!([[RecordType::Time as u8, 1234], null]));
    }

    #[test]
    fn packet_by_packet_feeding_matches_stream() {
        // feed each record as its own packet, the way packet mode does
        let mut packets: Vec<Vec<u8>> = Vec::new();
        {
            let mut buf = BufEmitter::new();
            RecordWriter::new(&mut buf).version();
            packets.push(buf.into_inner());
        }
        {
            let mut buf = BufEmitter::new();
            RecordWriter::new(&mut buf).malloc(1, 1, 0x10, 32, 3, &[0x100]);
            packets.push(buf.into_inner());
        }
        {
            let mut buf = BufEmitter::new();
            RecordWriter::new(&mut buf).free(1, 0x10);
            packets.push(buf.into_inner());
        }
        let mut parser = Parser::new(ArtifactWriter::buffer(), 0);
        for packet in &packets {
            parser.feed(packet).expect("feed packet");
        }
        let (summary, bytes) = parser.finish().expect("finish");
        assert_eq!(summary.records, 2);
        assert_eq!(summary.events, 2);
        let json: Value = serde_json::from_slice(&bytes.unwrap()).unwrap();
        assert_eq!(json["events"][1], json!([RecordType::Free as u8, 0x10]));
    }

    #[test]
    fn vdso_libraries_are_ignored() {
        let data = stream(|w| {
            w.library(1, b"linux-vdso.so.1", 0x7fff0000);
            w.library_header(1, 0, 0x1000);
        });
        let (summary, _) = parse_bytes(&data, 0);
        assert_eq!(summary.records, 2);
        assert_eq!(summary.strings, 0);
    }
}

/// `[function,file,line` without the closing bracket; the caller appends it so
/// that inline frames can be tacked on.
fn frame_tuple(strings: &mut Indexer<String>, frame: &Frame) -> String {
    let function = frame
        .function
        .as_ref()
        .map(|f| strings.index(f).0)
        .unwrap_or(-1);
    let file = frame
        .file
        .as_ref()
        .map(|f| strings.index(f).0)
        .unwrap_or(-1);
    let line = frame.line.map(i64::from).unwrap_or(-1);
    format!("[{function},{file},{line}")
}
