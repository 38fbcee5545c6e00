//! sediment-storage: partitioned append-only event log storage.
//!
//! This crate implements an embedded, single-writer storage engine for a
//! linear sequence of opaque documents:
//! - [`Partition`]: one append-only file of framed documents with buffered
//!   writes, aligned reads, and torn-write detection
//! - [`Index`]: an append-only fixed-record file mapping sequence numbers to
//!   partition byte ranges, with O(1) positional access and O(log n) search
//! - [`Storage`]: orchestration — write routing through a partitioner,
//!   primary and secondary index maintenance, single-writer locking, and
//!   crash recovery
//! - [`Watcher`]: reference-counted directory watching so read-only
//!   instances can follow a concurrent writer
//!
//! # File Layout
//!
//! ```text
//! {data_directory}/
//! ├── events                  <- default partition ("" partitioner route)
//! ├── events.part-0           <- named partition
//! ├── events.part-0-4096.branch  <- quarantined tail from a truncation
//! └── events.lock/            <- writer lock directory
//! {index_directory}/          (defaults to data_directory)
//! ├── events.index            <- primary index
//! └── events.odd.index        <- secondary index "odd"
//! ```
//!
//! # Durability Model
//!
//! Writes are buffered per partition and per index; a record becomes
//! globally visible once its primary-index entry is flushed. The writer
//! flushes partitions ahead of the corresponding index appends, so an index
//! entry never points at bytes that are not yet durable. The inverse case
//! (partition bytes written, index entry lost, power cut mid-record) is
//! detected at writer open by the torn-write check and rolled back.

mod clock;
mod entry;
mod header;
mod index;
mod matcher;
mod partition;
mod storage;
mod watcher;


pub use clock::MonotonicClock;
pub use entry::{EntryCodec, IndexEntry};
pub use index::{Index, IndexEvent, IndexOptions};
pub use matcher::{BuiltinMatcher, Matcher, ScriptEngine, ScriptMatcher, matches};
pub use partition::{Partition, PartitionOptions, RecordBackIter, RecordIter, RecordView, TornWrite};
pub use storage::{DocumentIter, Partitioner, Storage, StorageConfig, StorageEvent};
pub use watcher::{WatchEvent, WatchEventKind, Watcher};

use std::path::PathBuf;

use serde_json::Value;

/// Largest serialized document accepted by a partition (64 MiB).
pub const MAX_DOCUMENT_SIZE: usize = 64 * 1024 * 1024;

/// Errors from the storage engine.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Another writer holds the lock directory.
    #[error("storage is locked by another writer: {path}")]
    StorageLocked { path: PathBuf },

    /// A record header claims bytes past the known end of the file.
    #[error("record at position {position} extends past end of data ({size} bytes)")]
    CorruptFile { position: u64, size: u64 },

    /// The caller-expected payload size disagrees with the record header.
    #[error("expected data size {expected} but record header says {actual}")]
    InvalidDataSize { expected: u32, actual: u32 },

    /// The index file tail does not align to the entry size.
    ///
    /// Carries the number of entries that are still intact; a writer may
    /// truncate the file to that count and continue.
    #[error("index tail does not align to entry size ({intact_entries} intact entries)")]
    CorruptIndex { intact_entries: u64 },

    /// The file does not start with the expected magic bytes.
    #[error("not a valid storage file: {path}")]
    InvalidMagic { path: PathBuf },

    /// The format family matches but the version byte pair differs.
    #[error("file {path} was written by an incompatible library version ({found})")]
    UnsupportedVersion { path: PathBuf, found: String },

    /// The header metadata block is missing, malformed, or out of bounds.
    #[error("invalid file metadata: {reason}")]
    InvalidMetadata { reason: String },

    /// Serialized document exceeds [`MAX_DOCUMENT_SIZE`].
    #[error("document of {size} bytes exceeds maximum of {max} bytes")]
    DocumentTooLarge { size: usize, max: usize },

    /// Read position is not on a 4-byte record alignment.
    #[error("position {position} is not on a record alignment boundary")]
    InvalidPosition { position: u64 },

    /// Truncation target is not a record boundary.
    #[error("can only truncate on valid document boundaries, not at {position}")]
    TruncateNotOnBoundary { position: u64 },

    /// `ensure_index`/`open_index` named an index that does not exist.
    #[error("index {name:?} does not exist")]
    UnknownIndex { name: String },

    /// An index entry references a partition that is not part of the
    /// storage.
    #[error("index entry references unknown partition {id}")]
    UnknownPartition { id: sediment_types::PartitionId },

    /// A range request that does not resolve to valid positions.
    #[error("invalid read range [{from}, {until}]")]
    InvalidRange { from: i64, until: i64 },

    /// A persisted script matcher failed authentication.
    #[error("HMAC verification failed for index {index:?}")]
    HmacMismatch { index: String },

    /// A script matcher was evaluated without a configured script engine.
    #[error("script matchers are rejected without a configured script engine")]
    ScriptRejected,

    /// The index file was created with a different entry codec.
    #[error("index entry class mismatch: expected {expected} ({expected_size} bytes), found {found} ({found_size} bytes)")]
    EntryClassMismatch {
        expected: String,
        expected_size: usize,
        found: String,
        found_size: usize,
    },

    /// A mutating operation was attempted on a read-only instance.
    #[error("operation requires a writable instance")]
    ReadOnly,

    /// The storage has not been opened (or was closed).
    #[error("storage is not open")]
    NotOpen,

    /// The global sequence outgrew the 32-bit record header field.
    #[error("sequence number {sequence} exceeds the record format limit")]
    SequenceOverflow { sequence: u64 },

    /// A partition outgrew the 32-bit byte positions index entries carry.
    #[error("partition byte position {position} exceeds the index entry format limit")]
    PartitionFull { position: u64 },

    /// Document (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying OS I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File-watching backend error.
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

/// Converts documents to and from the opaque byte payload stored on disk.
///
/// The engine treats payloads as opaque; the serializer is the only place
/// the byte encoding is decided. The default is compact JSON text.
pub trait Serializer: Send {
    fn serialize(&self, document: &Value) -> Result<Vec<u8>, StorageError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Value, StorageError>;
}

/// Default serializer: compact JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, document: &Value) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(document)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
