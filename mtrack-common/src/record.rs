//! Record kinds and wire-level constants.

/// Version word at the head of every stream. The parser refuses anything
/// else.
pub const FILE_VERSION: u32 = 5;

/// Page granularity assumed by the tracker and the page-fault engine.
pub const PAGE_SIZE: u64 = 4096;

/// One byte on the wire, in front of every record payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    Invalid = 0,
    Start = 1,
    Executable = 2,
    WorkingDirectory = 3,
    Library = 4,
    LibraryHeader = 5,
    ThreadName = 6,
    Malloc = 7,
    Free = 8,
    MmapTracked = 9,
    MmapUntracked = 10,
    MunmapTracked = 11,
    MunmapUntracked = 12,
    MadviseTracked = 13,
    MadviseUntracked = 14,
    PageFault = 15,
    PageRemove = 16,
    PageRemap = 17,
    Command = 18,
    Time = 19,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<RecordType> {
        Some(match value {
            0 => RecordType::Invalid,
            1 => RecordType::Start,
            2 => RecordType::Executable,
            3 => RecordType::WorkingDirectory,
            4 => RecordType::Library,
            5 => RecordType::LibraryHeader,
            6 => RecordType::ThreadName,
            7 => RecordType::Malloc,
            8 => RecordType::Free,
            9 => RecordType::MmapTracked,
            10 => RecordType::MmapUntracked,
            11 => RecordType::MunmapTracked,
            12 => RecordType::MunmapUntracked,
            13 => RecordType::MadviseTracked,
            14 => RecordType::MadviseUntracked,
            15 => RecordType::PageFault,
            16 => RecordType::PageRemove,
            17 => RecordType::PageRemap,
            18 => RecordType::Command,
            19 => RecordType::Time,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            RecordType::Invalid => "Invalid",
            RecordType::Start => "Start",
            RecordType::Executable => "Executable",
            RecordType::WorkingDirectory => "WorkingDirectory",
            RecordType::Library => "Library",
            RecordType::LibraryHeader => "LibraryHeader",
            RecordType::ThreadName => "ThreadName",
            RecordType::Malloc => "Malloc",
            RecordType::Free => "Free",
            RecordType::MmapTracked => "MmapTracked",
            RecordType::MmapUntracked => "MmapUntracked",
            RecordType::MunmapTracked => "MunmapTracked",
            RecordType::MunmapUntracked => "MunmapUntracked",
            RecordType::MadviseTracked => "MadviseTracked",
            RecordType::MadviseUntracked => "MadviseUntracked",
            RecordType::PageFault => "PageFault",
            RecordType::PageRemove => "PageRemove",
            RecordType::PageRemap => "PageRemap",
            RecordType::Command => "Command",
            RecordType::Time => "Time",
        }
    }
}

/// Sub-kind of a `Command` record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    Snapshot = 0,
    EnableSnapshots = 1,
    DisableSnapshots = 2,
}

impl CommandType {
    pub fn from_u8(value: u8) -> Option<CommandType> {
        Some(match value {
            0 => CommandType::Snapshot,
            1 => CommandType::EnableSnapshots,
            2 => CommandType::DisableSnapshots,
            _ => return None,
        })
    }
}

/// Kind of application being traced, carried by the `Start` record. Selects
/// how the parser loads per-module debug info.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AppType {
    Elf = 0,
    Wasm = 1,
}

impl AppType {
    pub fn from_u8(value: u8) -> Option<AppType> {
        Some(match value {
            0 => AppType::Elf,
            1 => AppType::Wasm,
            _ => return None,
        })
    }
}
