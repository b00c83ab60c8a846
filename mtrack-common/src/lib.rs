//! Pieces shared between the in-process tracer (`mtrack-preload`) and the
//! out-of-process parser (`mtrack-parser`): the record kinds, the framed
//! binary codec, the interval tracker both sides keep in sync, and the
//! deduplicating indexer used for strings and stacks.

pub mod emitter;
pub mod event;
pub mod indexer;
pub mod mmap_tracker;
pub mod record;

pub use emitter::{BufEmitter, Emitter, RecordWriter, WriteKind};
pub use event::{DecodeError, Event, RecordReader};
pub use indexer::Indexer;
pub use mmap_tracker::MmapTracker;
pub use record::{AppType, CommandType, RecordType, FILE_VERSION, PAGE_SIZE};
