//! Loaded-module registry and per-module debug state.
//!
//! Modules are identified by file name and created idempotently through the
//! string indexer: the name's string id doubles as the module id. Each
//! module owns an opaque debug handle: an `addr2line` loader for ELF files,
//! or a DWARF context assembled from custom sections for WASM modules. When
//! debug loading fails the handle stays empty and every address in the
//! module resolves to the sentinel frame.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use gimli::{EndianArcSlice, RunTimeEndian, SectionId};
use log::warn;
use mtrack_common::{AppType, Indexer};

use crate::demangle::demangle;
use crate::resolver::{Frame, ResolvedAddress};

type WasmContext = addr2line::Context<EndianArcSlice<RunTimeEndian>>;

enum DebugState {
    Elf(addr2line::Loader),
    Wasm { context: WasmContext, code_addr: u64 },
    None,
}

pub struct Module {
    file_name: String,
    load_addr: u64,
    debug: Mutex<DebugState>,
}

impl Module {
    fn create(app_type: AppType, file_name: String, load_addr: u64) -> Module {
        let debug = match app_type {
            AppType::Elf => match addr2line::Loader::new(&file_name) {
                Ok(loader) => DebugState::Elf(loader),
                Err(err) => {
                    warn!("no debug info for {file_name}: {err}");
                    DebugState::None
                }
            },
            AppType::Wasm => match load_wasm(&file_name, load_addr) {
                Ok((context, code_addr)) => DebugState::Wasm { context, code_addr },
                Err(err) => {
                    warn!("no wasm debug info for {file_name}: {err}");
                    DebugState::None
                }
            },
        };
        Module {
            file_name,
            load_addr,
            debug: Mutex::new(debug),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn load_addr(&self) -> u64 {
        self.load_addr
    }

    /// Resolve a runtime instruction pointer to its frames. The first frame
    /// produced becomes the primary frame, the rest are recorded as inlined
    /// callers. An IP without line info falls back to the symbol table.
    pub fn resolve_address(&self, ip: u64) -> ResolvedAddress {
        let mut address = ResolvedAddress {
            aid: -1,
            ip,
            frame: Frame::default(),
            inlined: Vec::new(),
        };
        match &*self.debug.lock().unwrap() {
            DebugState::Elf(loader) => {
                let probe = ip.wrapping_sub(self.load_addr);
                if let Ok(mut frames) = loader.find_frames(probe) {
                    while let Ok(Some(frame)) = frames.next() {
                        push_frame(&mut address, &frame);
                    }
                }
                if address.frame.function.is_none() {
                    if let Some(name) = loader.find_symbol(probe) {
                        address.frame.function = Some(demangle(name));
                    }
                }
            }
            DebugState::Wasm { context, code_addr } => {
                let probe = ip.wrapping_sub(*code_addr);
                if let Ok(mut frames) = context.find_frames(probe).skip_all_loads() {
                    while let Ok(Some(frame)) = frames.next() {
                        push_frame(&mut address, &frame);
                    }
                }
            }
            DebugState::None => {}
        }
        address
    }
}

fn push_frame<R: gimli::Reader>(address: &mut ResolvedAddress, frame: &addr2line::Frame<R>) {
    let function = frame
        .function
        .as_ref()
        .and_then(|name| name.raw_name().ok())
        .map(|raw| demangle(&raw));
    let (file, line) = match &frame.location {
        Some(location) => (location.file.map(str::to_owned), location.line),
        None => (None, None),
    };
    let converted = Frame {
        function,
        file,
        line,
    };
    if address.frame.is_unset() {
        address.frame = converted;
    } else {
        address.inlined.push(converted);
    }
}

/// Scan a WASM module for its code section and the DWARF custom sections,
/// and build an `addr2line` context from them. Returns the context plus the
/// absolute address the DWARF offsets are relative to.
fn load_wasm(file_name: &str, load_addr: u64) -> Result<(WasmContext, u64), String> {
    const WASM_MAGIC: u32 = 0x6d73_6100;
    const SECTION_CUSTOM: u8 = 0;
    const SECTION_CODE: u8 = 10;

    let mut file = File::open(file_name).map_err(|e| e.to_string())?;
    let mut header = [0u8; 8];
    file.read_exact(&mut header).map_err(|e| e.to_string())?;
    if u32::from_le_bytes(header[0..4].try_into().unwrap()) != WASM_MAGIC {
        return Err("not a wasm module".into());
    }

    let file_len = file.seek(SeekFrom::End(0)).map_err(|e| e.to_string())?;
    let mut code_addr = load_addr;
    let mut sections: Vec<(SectionId, Arc<[u8]>)> = Vec::new();

    let mut offset = 8u64;
    while offset < file_len {
        file.seek(SeekFrom::Start(offset)).map_err(|e| e.to_string())?;
        let mut kind = [0u8; 1];
        if file.read_exact(&mut kind).is_err() {
            break;
        }
        let section_size = read_uleb(&mut file)?;
        let section_offset = file.stream_position().map_err(|e| e.to_string())?;
        match kind[0] {
            SECTION_CODE => {
                code_addr += section_offset;
            }
            SECTION_CUSTOM => {
                let name_size = read_uleb(&mut file)?;
                let mut name = vec![0u8; name_size as usize];
                file.read_exact(&mut name).map_err(|e| e.to_string())?;
                if let Some(id) = debug_section_id(&name) {
                    let consumed = file.stream_position().map_err(|e| e.to_string())? - section_offset;
                    let data_size = section_size.saturating_sub(consumed);
                    let mut data = vec![0u8; data_size as usize];
                    file.read_exact(&mut data).map_err(|e| e.to_string())?;
                    sections.push((id, Arc::from(data.into_boxed_slice())));
                }
            }
            _ => {}
        }
        offset = section_offset + section_size;
    }

    let dwarf = gimli::Dwarf::load(|id| -> Result<_, gimli::Error> {
        let data = sections
            .iter()
            .find(|(section, _)| *section == id)
            .map(|(_, data)| data.clone())
            .unwrap_or_else(|| Arc::from(Vec::new().into_boxed_slice()));
        Ok(EndianArcSlice::new(data, RunTimeEndian::Little))
    })
    .map_err(|e| e.to_string())?;

    let context = addr2line::Context::from_dwarf(dwarf).map_err(|e| e.to_string())?;
    Ok((context, code_addr))
}

fn debug_section_id(name: &[u8]) -> Option<SectionId> {
    Some(match name {
        b".debug_info" => SectionId::DebugInfo,
        b".debug_ranges" => SectionId::DebugRanges,
        b".debug_abbrev" => SectionId::DebugAbbrev,
        b".debug_line" => SectionId::DebugLine,
        b".debug_loc" => SectionId::DebugLoc,
        b".debug_str" => SectionId::DebugStr,
        _ => return None,
    })
}

fn read_uleb(file: &mut File) -> Result<u64, String> {
    let mut result = 0u64;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).map_err(|e| e.to_string())?;
        result |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 63 {
            return Err("unterminated uleb".into());
        }
    }
}

struct ModuleEntry {
    module: Arc<Module>,
    ranges: Vec<(u64, u64)>,
}

/// Modules slotted by their file-name string id.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Option<ModuleEntry>>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry::default()
    }

    /// Create or fetch the module for `file_name`. Exclusive access makes
    /// creation race-free; the returned id is the file name's string id.
    pub fn create(
        &mut self,
        app_type: AppType,
        indexer: &mut Indexer<String>,
        file_name: String,
        load_addr: u64,
    ) -> usize {
        let (id, _) = indexer.index(&file_name);
        let id = id.max(0) as usize;
        if self.modules.len() <= id {
            self.modules.resize_with(id + 1, || None);
        }
        if self.modules[id].is_none() {
            self.modules[id] = Some(ModuleEntry {
                module: Arc::new(Module::create(app_type, file_name, load_addr)),
                ranges: Vec::new(),
            });
        }
        id
    }

    /// Append a loadable segment `[loadAddr+vaddr, loadAddr+vaddr+size)` to
    /// the module's address ranges.
    pub fn add_header(&mut self, id: usize, vaddr: u64, size: u64) {
        if let Some(Some(entry)) = self.modules.get_mut(id) {
            let start = entry.module.load_addr() + vaddr;
            entry.ranges.push((start, start + size));
        }
    }

    pub fn get(&self, id: usize) -> Option<Arc<Module>> {
        self.modules.get(id)?.as_ref().map(|e| e.module.clone())
    }

    pub fn len(&self) -> usize {
        self.modules.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All `(range_start, range_end, module)` triples, for the parser's
    /// module cache.
    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64, Arc<Module>)> + '_ {
        self.modules.iter().flatten().flat_map(|entry| {
            entry
                .ranges
                .iter()
                .map(|&(start, end)| (start, end, entry.module.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_is_idempotent() {
        let mut registry = ModuleRegistry::new();
        let mut strings = Indexer::new();
        let a = registry.create(AppType::Elf, &mut strings, "/no/such/file.so".into(), 0x1000);
        let b = registry.create(AppType::Elf, &mut strings, "/no/such/file.so".into(), 0x9999);
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
        // the original load address sticks
        assert_eq!(registry.get(a).unwrap().load_addr(), 0x1000);
    }

    #[test]
    fn headers_are_rebased_on_the_load_address() {
        let mut registry = ModuleRegistry::new();
        let mut strings = Indexer::new();
        let id = registry.create(AppType::Elf, &mut strings, "/no/such/file.so".into(), 0x1000);
        registry.add_header(id, 0x0, 0x1000);
        registry.add_header(id, 0x2000, 0x500);
        let ranges: Vec<_> = registry.ranges().map(|(s, e, _)| (s, e)).collect();
        assert_eq!(ranges, vec![(0x1000, 0x2000), (0x3000, 0x3500)]);
    }

    #[test]
    fn missing_debug_info_resolves_to_sentinel() {
        let module = Module::create(AppType::Elf, "/no/such/file.so".into(), 0x1000);
        let a = module.resolve_address(0x1234);
        assert!(a.frame.is_unset());
        assert!(a.inlined.is_empty());
        // resolving twice yields the same result
        let b = module.resolve_address(0x1234);
        assert_eq!(a.frame, b.frame);
        assert_eq!(a.inlined, b.inlined);
    }
}
