//! Storage orchestration: partitions, indexes, locking, and recovery.
//!
//! [`Storage`] ties the pieces together. Writes are serialized, routed
//! through the configured partitioner to a partition (created on demand),
//! and recorded in the primary index plus every matching secondary index.
//! Reads resolve 1-based positions through an index to `(partition,
//! position, size)` triples and hand the payload to the serializer.
//!
//! # Single Writer
//!
//! Exactly one writable instance may exist per storage, enforced with a
//! lock directory (`<name>.lock`) created atomically under the data
//! directory. Read-only instances open without the lock and follow the
//! writer through directory watching.
//!
//! # Ordering
//!
//! A document becomes globally visible once its primary-index entry is
//! flushed. Partitions are always flushed ahead of the indexes that
//! reference their bytes, so a flushed index entry never points at
//! non-durable data. The inverse — partition bytes lost mid-record by a
//! crash — is handled at writer open: every partition reports its first
//! torn record, the minimum affected sequence is computed, and the storage
//! truncates back to the last globally consistent state.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender, channel};

use sediment_types::{AccessMode, PartitionId, SequenceNumber};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::entry::{EntryCodec, IndexEntry};
use crate::index::{Index, IndexOptions};
use crate::matcher::{Matcher, ScriptEngine, matches};
use crate::partition::{Partition, PartitionOptions, TornWrite};
use crate::watcher::{WatchEventKind, Watcher};
use crate::{JsonSerializer, Serializer, StorageError};

/// Entries fetched per step when iterating a range.
const RANGE_BATCH_SIZE: u64 = 10;

/// Routes a document to a partition name; `""` selects the default
/// partition.
pub type Partitioner = Box<dyn Fn(&Value, u64) -> String + Send>;

/// Lifecycle notifications, delivered to [`Storage::subscribe`] receivers
/// after the corresponding durable transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    Opened,
    /// The document with this sequence number has a flushed index entry.
    Wrote(u64),
    /// A secondary index finished creation and back-fill.
    IndexCreated(String),
    Closed,
}

/// Construction options for a [`Storage`].
pub struct StorageConfig {
    /// Directory holding partition files and the lock.
    pub data_directory: PathBuf,
    /// Directory holding index files; the data directory when `None`.
    pub index_directory: Option<PathBuf>,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_write_buffer_documents: usize,
    pub sync_on_flush: bool,
    pub dirty_reads: bool,
    /// Routes each document to a partition name.
    pub partitioner: Partitioner,
    /// Byte encoding of documents; JSON text by default.
    pub serializer: Box<dyn Serializer>,
    /// Secret authenticating persisted script matchers.
    pub hmac_secret: String,
    /// Pass-through options for indexes.
    pub index_options: IndexOptions,
    /// Extra metadata written into every partition header.
    pub metadata: Map<String, Value>,
    /// Evaluator for script matchers; script evaluation is rejected when
    /// absent.
    pub script_engine: Option<Box<dyn ScriptEngine>>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from("data"),
            index_directory: None,
            read_buffer_size: 64 * 1024,
            write_buffer_size: 16 * 1024,
            max_write_buffer_documents: 0,
            sync_on_flush: false,
            dirty_reads: true,
            partitioner: Box::new(|_, _| String::new()),
            serializer: Box::new(JsonSerializer),
            hmac_secret: String::new(),
            index_options: IndexOptions::default(),
            metadata: Map::new(),
            script_engine: None,
        }
    }
}

impl StorageConfig {
    /// A default configuration rooted at `data_directory`.
    pub fn new(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: data_directory.into(),
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("data_directory", &self.data_directory)
            .field("index_directory", &self.index_directory)
            .field("sync_on_flush", &self.sync_on_flush)
            .field("dirty_reads", &self.dirty_reads)
            .finish_non_exhaustive()
    }
}

/// A secondary index together with its parsed matcher.
struct Secondary {
    index: Index,
    matcher: Option<Matcher>,
}

/// An embedded, single-writer, append-only event storage.
pub struct Storage {
    name: String,
    config: StorageConfig,
    mode: AccessMode,
    opened: bool,
    locked: bool,

    partitions: BTreeMap<PartitionId, Partition>,
    primary: Option<Index>,
    secondaries: BTreeMap<String, Secondary>,

    subscribers: Vec<Sender<StorageEvent>>,
    /// Data-directory watcher for read-only instances.
    watcher: Option<Watcher>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("opened", &self.opened)
            .field("partitions", &self.partitions.len())
            .field("secondaries", &self.secondaries.len())
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Creates a closed storage handle; call [`Storage::open`] before use.
    pub fn new(name: impl Into<String>, mode: AccessMode, config: StorageConfig) -> Self {
        Self {
            name: name.into(),
            config,
            mode,
            opened: false,
            locked: false,
            partitions: BTreeMap::new(),
            primary: None,
            secondaries: BTreeMap::new(),
            subscribers: Vec::new(),
            watcher: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn data_directory(&self) -> &Path {
        &self.config.data_directory
    }

    fn index_directory(&self) -> &Path {
        self.config
            .index_directory
            .as_deref()
            .unwrap_or(&self.config.data_directory)
    }

    fn lock_path(&self) -> PathBuf {
        self.data_directory().join(format!("{}.lock", self.name))
    }

    fn primary_file_name(&self) -> String {
        format!("{}.index", self.name)
    }

    fn secondary_file_name(&self, index_name: &str) -> String {
        format!("{}.{}.index", self.name, index_name)
    }

    fn partition_file_name(&self, partition_name: &str) -> String {
        if partition_name.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, partition_name)
        }
    }

    /// `true` for file names that belong to this storage's partitions.
    fn is_partition_file(&self, file_name: &str) -> bool {
        let own = file_name == self.name;
        let prefixed = file_name
            .strip_prefix(&self.name)
            .is_some_and(|rest| rest.starts_with('.'));
        (own || prefixed)
            && !file_name.ends_with(".index")
            && !file_name.ends_with(".branch")
            && !file_name.ends_with(".lock")
    }

    fn partition_options(&self) -> PartitionOptions {
        PartitionOptions {
            read_buffer_size: self.config.read_buffer_size,
            write_buffer_size: self.config.write_buffer_size,
            max_write_buffer_documents: self.config.max_write_buffer_documents,
            sync_on_flush: self.config.sync_on_flush,
            dirty_reads: self.config.dirty_reads,
            metadata: self.config.metadata.clone(),
        }
    }

    /// Index options for the primary index; a `matcher` key in the
    /// pass-through metadata belongs to secondary indexes only.
    fn primary_index_options(&self) -> IndexOptions {
        let mut options = self.config.index_options.clone();
        options.metadata.remove("matcher");
        options
    }

    fn primary(&self) -> Result<&Index, StorageError> {
        self.primary.as_ref().ok_or(StorageError::NotOpen)
    }

    fn primary_mut(&mut self) -> Result<&mut Index, StorageError> {
        self.primary.as_mut().ok_or(StorageError::NotOpen)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Opens the storage.
    ///
    /// Writer mode acquires the lock directory, opens the primary index
    /// (repairing a torn tail), enumerates partition files, and runs
    /// torn-write recovery. Read-only mode opens without the lock and
    /// starts a directory watcher to follow a concurrent writer.
    pub fn open(&mut self) -> Result<(), StorageError> {
        if self.opened {
            return Ok(());
        }
        fs::create_dir_all(self.data_directory())?;
        fs::create_dir_all(self.index_directory())?;

        if self.mode.is_writable() {
            self.acquire_lock()?;
        }
        match self.open_inner() {
            Ok(()) => {
                self.opened = true;
                info!(storage = %self.name, mode = %self.mode, "storage opened");
                self.emit(StorageEvent::Opened);
                Ok(())
            }
            Err(error) => {
                self.release_lock();
                self.partitions.clear();
                self.primary = None;
                Err(error)
            }
        }
    }

    fn open_inner(&mut self) -> Result<(), StorageError> {
        let primary_name = self.primary_file_name();
        let index_dir = self.index_directory().to_path_buf();
        let primary = match Index::open(
            &index_dir,
            &primary_name,
            self.mode,
            self.primary_index_options(),
        ) {
            Ok(index) => index,
            Err(StorageError::CorruptIndex { intact_entries }) if self.mode.is_writable() => {
                warn!(
                    storage = %self.name,
                    intact_entries, "primary index tail is corrupt, repairing"
                );
                Index::<IndexEntry>::repair_corrupt_tail(&index_dir, &primary_name)?;
                Index::open(
                    &index_dir,
                    &primary_name,
                    self.mode,
                    self.primary_index_options(),
                )?
            }
            Err(error) => return Err(error),
        };
        self.primary = Some(primary);

        for dir_entry in fs::read_dir(self.data_directory())? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_file() {
                continue;
            }
            let file_name = dir_entry.file_name().to_string_lossy().into_owned();
            if self.is_partition_file(&file_name) {
                self.open_partition(&file_name)?;
            }
        }

        if self.mode.is_writable() {
            self.check_torn_writes()?;
        } else {
            self.watcher = Some(Watcher::subscribe(self.data_directory(), None)?);
        }
        Ok(())
    }

    fn open_partition(&mut self, file_name: &str) -> Result<PartitionId, StorageError> {
        let id = PartitionId::from_name(file_name);
        if !self.partitions.contains_key(&id) {
            let partition = Partition::open(
                &self.config.data_directory,
                file_name,
                self.mode,
                self.partition_options(),
            )?;
            debug!(storage = %self.name, partition = file_name, "opened partition");
            self.partitions.insert(id, partition);
        }
        Ok(id)
    }

    fn acquire_lock(&mut self) -> Result<(), StorageError> {
        let path = self.lock_path();
        match fs::create_dir(&path) {
            Ok(()) => {
                self.locked = true;
                debug!(storage = %self.name, "acquired writer lock");
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StorageError::StorageLocked { path })
            }
            Err(error) => Err(error.into()),
        }
    }

    fn release_lock(&mut self) {
        if self.locked {
            if let Err(error) = fs::remove_dir(self.lock_path()) {
                warn!(storage = %self.name, %error, "failed to remove lock directory");
            }
            self.locked = false;
        }
    }

    /// Removes the lock directory even when held by a dead writer.
    ///
    /// This is the explicit reclaim step after [`StorageError::StorageLocked`]:
    /// the caller asserts the previous writer is gone, unlocks, and retries
    /// [`Storage::open`], whose torn-write check then recovers any
    /// half-written state.
    pub fn unlock(&mut self) -> Result<(), StorageError> {
        match fs::remove_dir(self.lock_path()) {
            Ok(()) => {
                warn!(storage = %self.name, "stale writer lock removed");
                self.locked = false;
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Flushes, releases the lock and all handles, and emits `Closed`.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if !self.opened {
            return Ok(());
        }
        if self.mode.is_writable() {
            self.flush()?;
        }
        for (_, mut secondary) in std::mem::take(&mut self.secondaries) {
            secondary.index.close()?;
        }
        if let Some(mut primary) = self.primary.take() {
            primary.close()?;
        }
        for (_, mut partition) in std::mem::take(&mut self.partitions) {
            partition.close()?;
        }
        if let Some(mut watcher) = self.watcher.take() {
            watcher.close();
        }
        self.release_lock();
        self.opened = false;
        info!(storage = %self.name, "storage closed");
        self.emit(StorageEvent::Closed);
        Ok(())
    }

    /// Registers an event receiver.
    pub fn subscribe(&mut self) -> Receiver<StorageEvent> {
        let (tx, rx) = channel();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: StorageEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Appends a document, returning its global 1-based sequence number.
    ///
    /// The document is serialized, routed through the partitioner, written
    /// to its partition, and recorded in the primary index and every
    /// matching secondary index.
    pub fn write(&mut self, document: &Value) -> Result<u64, StorageError> {
        if !self.opened {
            return Err(StorageError::NotOpen);
        }
        if !self.mode.is_writable() {
            return Err(StorageError::ReadOnly);
        }

        let next = self.primary()?.length() + 1;
        if next > u64::from(u32::MAX) {
            return Err(StorageError::SequenceOverflow { sequence: next });
        }
        let sequence = SequenceNumber::new(next as u32);

        let partition_name = (self.config.partitioner)(document, next);
        let file_name = self.partition_file_name(&partition_name);
        let payload = self.config.serializer.serialize(document)?;

        let partition_id = self.open_partition(&file_name)?;
        let partition = self
            .partitions
            .get_mut(&partition_id)
            .expect("partition exists: just opened");
        let position = partition.write(&payload, sequence)?;
        if position > u64::from(u32::MAX) {
            return Err(StorageError::PartitionFull { position });
        }
        let entry = IndexEntry::new(sequence, position as u32, payload.len() as u32, partition_id);

        // An index flush must never get ahead of the partition bytes its
        // entries reference.
        if self.primary()?.buffer_full() {
            flush_partitions(&mut self.partitions)?;
        }
        let subscribers = self.subscribers.clone();
        self.primary_mut()?.add(
            entry,
            Some(Box::new(move |_| {
                for subscriber in &subscribers {
                    let _ = subscriber.send(StorageEvent::Wrote(next));
                }
            })),
        )?;

        let engine = self.config.script_engine.as_deref();
        for secondary in self.secondaries.values_mut() {
            if matches(Some(document), secondary.matcher.as_ref(), engine)? {
                if secondary.index.buffer_full() {
                    flush_partitions(&mut self.partitions)?;
                }
                secondary.index.add(entry, None)?;
            }
        }

        self.service_flush_deadlines()?;
        Ok(next)
    }

    /// Flushes all partitions, then all indexes.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if !self.mode.is_writable() {
            return Err(StorageError::ReadOnly);
        }
        flush_partitions(&mut self.partitions)?;
        if let Some(primary) = self.primary.as_mut() {
            primary.flush()?;
        }
        for secondary in self.secondaries.values_mut() {
            secondary.index.flush()?;
        }
        Ok(())
    }

    /// Runs any flush whose coalescing deadline has passed, preserving the
    /// partitions-before-indexes order.
    fn service_flush_deadlines(&mut self) -> Result<(), StorageError> {
        let index_due = self.primary.as_ref().is_some_and(Index::flush_due)
            || self
                .secondaries
                .values()
                .any(|secondary| secondary.index.flush_due());
        if index_due {
            flush_partitions(&mut self.partitions)?;
            if let Some(primary) = self.primary.as_mut() {
                primary.maybe_flush()?;
            }
            for secondary in self.secondaries.values_mut() {
                secondary.index.maybe_flush()?;
            }
        }
        for partition in self.partitions.values_mut() {
            partition.maybe_flush()?;
        }
        Ok(())
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Number of documents in the storage (via the primary index).
    pub fn length(&self) -> u64 {
        self.primary.as_ref().map_or(0, Index::length)
    }

    /// Number of entries in a secondary index.
    pub fn index_length(&self, index_name: &str) -> Result<u64, StorageError> {
        self.secondaries
            .get(index_name)
            .map(|secondary| secondary.index.length())
            .ok_or_else(|| StorageError::UnknownIndex {
                name: index_name.to_string(),
            })
    }

    /// Reads the document at 1-based position `number` of the chosen index
    /// (primary when `None`); negative positions wrap from the end.
    pub fn read(
        &mut self,
        number: i64,
        index_name: Option<&str>,
    ) -> Result<Option<Value>, StorageError> {
        let entry = match index_name {
            None => self.primary_mut()?.get(number)?,
            Some(name) => {
                let secondary =
                    self.secondaries
                        .get_mut(name)
                        .ok_or_else(|| StorageError::UnknownIndex {
                            name: name.to_string(),
                        })?;
                secondary.index.get(number)?
            }
        };
        match entry {
            Some(entry) => Ok(Some(self.read_entry(&entry)?)),
            None => Ok(None),
        }
    }

    /// Lazily reads the inclusive range `from ..= until` of the chosen
    /// index.
    ///
    /// Negative bounds wrap from the end before validation. A descending
    /// range (`from > until` after wrapping) yields documents newest-first,
    /// fetched in backward batches.
    pub fn read_range(
        &mut self,
        from: i64,
        until: i64,
        index_name: Option<&str>,
    ) -> Result<DocumentIter<'_>, StorageError> {
        let length = match index_name {
            None => self.primary()?.length(),
            Some(name) => self.index_length(name)?,
        };
        let resolve = |bound: i64| -> Option<u64> {
            let position = if bound < 0 {
                length as i64 + bound + 1
            } else {
                bound
            };
            (position >= 1 && position as u64 <= length).then_some(position as u64)
        };
        let (Some(start), Some(end)) = (resolve(from), resolve(until)) else {
            return Err(StorageError::InvalidRange { from, until });
        };

        Ok(DocumentIter {
            storage: self,
            index_name: index_name.map(ToString::to_string),
            next: start,
            until: end,
            descending: start > end,
            batch: Vec::new(),
            finished: false,
        })
    }

    /// Resolves an index entry to its deserialized document.
    fn read_entry(&mut self, entry: &IndexEntry) -> Result<Value, StorageError> {
        let partition = self
            .partitions
            .get_mut(&entry.partition)
            .ok_or(StorageError::UnknownPartition { id: entry.partition })?;
        let payload = partition
            .read_from(u64::from(entry.position), Some(entry.size))?
            .ok_or(StorageError::CorruptFile {
                position: u64::from(entry.position),
                size: partition.size(),
            })?;
        self.config.serializer.deserialize(&payload)
    }

    fn index_range_raw(
        &mut self,
        index_name: Option<&str>,
        from: u64,
        until: u64,
    ) -> Result<Option<Vec<IndexEntry>>, StorageError> {
        let index = match index_name {
            None => self.primary_mut()?,
            Some(name) => {
                &mut self
                    .secondaries
                    .get_mut(name)
                    .ok_or_else(|| StorageError::UnknownIndex {
                        name: name.to_string(),
                    })?
                    .index
            }
        };
        index.range(from as i64, until as i64)
    }

    // ========================================================================
    // Secondary indexes
    // ========================================================================

    /// Opens the named secondary index, creating and back-filling it when
    /// it does not exist yet.
    ///
    /// An existing index keeps its persisted matcher (verified by HMAC when
    /// it is a script); creation requires `matcher`. Script matchers are
    /// re-tagged under this storage's secret before persisting.
    pub fn ensure_index(
        &mut self,
        index_name: &str,
        matcher: Option<Matcher>,
    ) -> Result<(), StorageError> {
        if !self.opened {
            return Err(StorageError::NotOpen);
        }
        if self.secondaries.contains_key(index_name) {
            return Ok(());
        }
        let file_name = self.secondary_file_name(index_name);
        if self.index_directory().join(&file_name).exists() {
            return self.open_existing_index(index_name);
        }
        if !self.mode.is_writable() {
            return Err(StorageError::ReadOnly);
        }
        let Some(matcher) = matcher else {
            return Err(StorageError::UnknownIndex {
                name: index_name.to_string(),
            });
        };
        let matcher = match matcher {
            Matcher::Script(script) => Matcher::script(script.source, &self.config.hmac_secret),
            other => other,
        };

        // Select the matching entries before the file exists, so a matcher
        // that cannot be evaluated leaves nothing behind. The flush keeps
        // the new index from referencing bytes that are not on disk yet.
        flush_partitions(&mut self.partitions)?;
        let length = self.primary()?.length();
        let mut matching = Vec::new();
        for number in 1..=length {
            let entry = self
                .primary_mut()?
                .get(number as i64)?
                .expect("number is within the primary length");
            let document = self.read_entry(&entry)?;
            if matches(
                Some(&document),
                Some(&matcher),
                self.config.script_engine.as_deref(),
            )? {
                matching.push(entry);
            }
        }

        let mut options = self.config.index_options.clone();
        options
            .metadata
            .insert("matcher".to_string(), serde_json::to_value(&matcher)?);
        let mut index = Index::open(
            self.index_directory(),
            &file_name,
            AccessMode::ReadWrite,
            options,
        )?;
        for entry in matching {
            index.add(entry, None)?;
        }
        index.flush()?;
        info!(
            storage = %self.name,
            index = index_name,
            entries = index.length(),
            "created secondary index"
        );
        self.secondaries.insert(
            index_name.to_string(),
            Secondary {
                index,
                matcher: Some(matcher),
            },
        );
        self.emit(StorageEvent::IndexCreated(index_name.to_string()));
        Ok(())
    }

    /// Opens an existing secondary index; never creates one.
    ///
    /// On HMAC mismatch of a persisted script matcher the freshly opened
    /// index file is destroyed and the error returned.
    pub fn open_index(
        &mut self,
        index_name: &str,
        _matcher: Option<Matcher>,
    ) -> Result<(), StorageError> {
        if !self.opened {
            return Err(StorageError::NotOpen);
        }
        if self.secondaries.contains_key(index_name) {
            return Ok(());
        }
        let file_name = self.secondary_file_name(index_name);
        if !self.index_directory().join(&file_name).exists() {
            return Err(StorageError::UnknownIndex {
                name: index_name.to_string(),
            });
        }
        self.open_existing_index(index_name)
    }

    fn open_existing_index(&mut self, index_name: &str) -> Result<(), StorageError> {
        let file_name = self.secondary_file_name(index_name);
        let index = Index::open(
            self.index_directory(),
            &file_name,
            self.mode,
            self.config.index_options.clone(),
        )?;
        let matcher = index
            .metadata_extra()
            .get("matcher")
            .cloned()
            .map(serde_json::from_value::<Matcher>)
            .transpose()
            .map_err(|e| StorageError::InvalidMetadata {
                reason: format!("persisted matcher: {e}"),
            })?;

        if let Some(matcher @ Matcher::Script(_)) = &matcher
            && !matcher.verify_hmac(&self.config.hmac_secret)
        {
            warn!(
                storage = %self.name,
                index = index_name,
                "persisted script matcher failed authentication"
            );
            if self.mode.is_writable() {
                index.destroy()?;
            }
            return Err(StorageError::HmacMismatch {
                index: index_name.to_string(),
            });
        }

        self.secondaries
            .insert(index_name.to_string(), Secondary { index, matcher });
        Ok(())
    }

    // ========================================================================
    // Truncation and recovery
    // ========================================================================

    /// Truncates the storage to `after` documents.
    ///
    /// Every partition holding an index entry above `after` is truncated at
    /// that entry's byte position; then the primary index is cut to `after`
    /// and each secondary to its last position at or below `after`.
    pub fn truncate(&mut self, after: u64) -> Result<(), StorageError> {
        if !self.opened {
            return Err(StorageError::NotOpen);
        }
        if !self.mode.is_writable() {
            return Err(StorageError::ReadOnly);
        }
        self.truncate_inner(after)
    }

    /// Truncation body, also reachable from recovery during `open`.
    fn truncate_inner(&mut self, after: u64) -> Result<(), StorageError> {
        let length = self.length();
        if after < length {
            let entries = self
                .primary_mut()?
                .range((after + 1) as i64, length as i64)?
                .expect("range is within the primary length");
            let mut cut_positions: BTreeMap<PartitionId, u32> = BTreeMap::new();
            for entry in entries {
                // Entries within one partition ascend by position, so the
                // first hit is the cut point.
                cut_positions.entry(entry.partition).or_insert(entry.position);
            }
            for (partition_id, position) in cut_positions {
                match self.partitions.get_mut(&partition_id) {
                    Some(partition) => {
                        // Recovery may already have cut this partition
                        // shorter than the entry's position.
                        let position = u64::from(position);
                        if position < partition.size() {
                            partition.truncate(position)?;
                        }
                    }
                    None => warn!(
                        storage = %self.name,
                        partition = %partition_id,
                        "cannot truncate unknown partition"
                    ),
                }
            }
            self.primary_mut()?.truncate(after)?;
        }

        for secondary in self.secondaries.values_mut() {
            let cut = secondary.index.find(after, false)?;
            secondary.index.truncate(cut)?;
        }
        info!(storage = %self.name, after, "truncated storage");
        Ok(())
    }

    /// Detects and rolls back torn writes across all partitions.
    ///
    /// Runs automatically at writer open. Every partition reports the
    /// start of its first incomplete record; the smallest affected global
    /// sequence (recovered from the primary index where the torn header is
    /// unreadable) bounds the global truncation, and any torn tail the
    /// index never referenced is cut in its partition alone.
    pub fn check_torn_writes(&mut self) -> Result<(), StorageError> {
        if !self.mode.is_writable() {
            return Err(StorageError::ReadOnly);
        }

        let mut torn: Vec<(PartitionId, TornWrite)> = Vec::new();
        for (id, partition) in &mut self.partitions {
            if let Some(found) = partition.check_torn_write()? {
                torn.push((*id, found));
            }
        }
        if torn.is_empty() {
            return Ok(());
        }

        // The index is the ground truth for sequences: a torn header may
        // itself be garbage.
        let length = self.primary()?.length();
        let all_entries = if length == 0 {
            Vec::new()
        } else {
            self.primary_mut()?
                .range(1, length as i64)?
                .expect("full range is valid")
        };

        let mut min_sequence: Option<u64> = None;
        for (partition_id, found) in &torn {
            let indexed = all_entries
                .iter()
                .find(|entry| {
                    entry.partition == *partition_id
                        && u64::from(entry.position) >= found.position
                })
                .map(|entry| entry.number());
            let sequence = indexed.or(found.sequence.map(|s| s.as_u64()));
            if let Some(sequence) = sequence {
                min_sequence = Some(min_sequence.map_or(sequence, |m| m.min(sequence)));
            }
        }

        // Cut each torn tail at its last valid boundary first. The index
        // may hold entries pointing into the removed range (appends hit
        // the page cache in arbitrary order across a crash); the global
        // truncation below drops those.
        for (partition_id, found) in torn {
            let partition = self
                .partitions
                .get_mut(&partition_id)
                .expect("partition exists: reported torn");
            if partition.size() > found.position {
                partition.truncate(found.position)?;
            }
        }

        if let Some(first_invalid) = min_sequence {
            warn!(
                storage = %self.name,
                first_invalid, "torn writes detected, rolling back"
            );
            self.truncate_inner(first_invalid.saturating_sub(1))?;
        }
        Ok(())
    }

    // ========================================================================
    // Read-only following
    // ========================================================================

    /// Processes pending file-system events for a read-only instance:
    /// newly created partitions and secondary indexes are opened, grown
    /// files re-measured, and index changes absorbed.
    pub fn poll(&mut self) -> Result<(), StorageError> {
        if !self.opened {
            return Err(StorageError::NotOpen);
        }
        let events = match self.watcher.as_mut() {
            Some(watcher) => watcher.try_events(),
            None => Vec::new(),
        };
        for event in events {
            let file_name = event.file_name;
            if self.is_partition_file(&file_name) {
                let id = PartitionId::from_name(&file_name);
                if self.partitions.contains_key(&id) {
                    self.partitions
                        .get_mut(&id)
                        .expect("partition exists: just checked")
                        .refresh_size()?;
                } else if event.kind == WatchEventKind::Rename {
                    // The writer may still be mid-header; retry on a
                    // later event.
                    if let Err(error) = self.open_partition(&file_name) {
                        debug!(
                            storage = %self.name,
                            partition = %file_name,
                            %error,
                            "new partition not yet readable"
                        );
                    }
                }
            } else if let Some(index_name) = self.parse_secondary_file_name(&file_name)
                && !self.secondaries.contains_key(&index_name)
                && event.kind == WatchEventKind::Rename
                && let Err(error) = self.open_existing_index(&index_name)
            {
                debug!(
                    storage = %self.name,
                    index = %index_name,
                    %error,
                    "new secondary index not yet readable"
                );
            }
        }

        if let Some(primary) = self.primary.as_mut() {
            primary.poll_watch()?;
        }
        for secondary in self.secondaries.values_mut() {
            secondary.index.poll_watch()?;
        }
        for partition in self.partitions.values_mut() {
            partition.refresh_size()?;
        }
        Ok(())
    }

    /// Extracts the index name from `<storage>.<name>.index`.
    fn parse_secondary_file_name(&self, file_name: &str) -> Option<String> {
        let rest = file_name.strip_prefix(&self.name)?.strip_prefix('.')?;
        let index_name = rest.strip_suffix(".index")?;
        if index_name.is_empty() || index_name.contains('.') {
            return None;
        }
        Some(index_name.to_string())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if self.opened
            && let Err(error) = self.close()
        {
            tracing::error!(storage = %self.name, %error, "failed to close storage");
        }
    }
}

/// Flushes every partition with buffered bytes.
fn flush_partitions(
    partitions: &mut BTreeMap<PartitionId, Partition>,
) -> Result<(), StorageError> {
    for partition in partitions.values_mut() {
        partition.flush()?;
    }
    Ok(())
}

/// Lazy document iterator over an index range; see [`Storage::read_range`].
pub struct DocumentIter<'a> {
    storage: &'a mut Storage,
    index_name: Option<String>,
    /// Next index position to fetch (moving toward `until`).
    next: u64,
    until: u64,
    descending: bool,
    /// Current batch, already in yield order.
    batch: Vec<IndexEntry>,
    finished: bool,
}

impl DocumentIter<'_> {
    fn refill(&mut self) -> Result<(), StorageError> {
        if self.finished {
            return Ok(());
        }
        let (from, until) = if self.descending {
            let from = self.next.saturating_sub(RANGE_BATCH_SIZE - 1).max(self.until);
            (from, self.next)
        } else {
            let until = (self.next + RANGE_BATCH_SIZE - 1).min(self.until);
            (self.next, until)
        };

        let entries = self
            .storage
            .index_range_raw(self.index_name.as_deref(), from, until)?
            .unwrap_or_default();
        if entries.is_empty() {
            self.finished = true;
            return Ok(());
        }
        // The batch is consumed by popping from the back, so it is stored
        // in reverse yield order: a descending scan keeps the ascending
        // load order, an ascending scan reverses it.
        if self.descending {
            self.batch = entries;
            if from == self.until {
                self.finished = true;
            } else {
                self.next = from - 1;
            }
        } else {
            self.batch = entries;
            self.batch.reverse();
            if until == self.until {
                self.finished = true;
            } else {
                self.next = until + 1;
            }
        }
        Ok(())
    }
}

impl Iterator for DocumentIter<'_> {
    type Item = Result<Value, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch.is_empty() {
            if self.finished {
                return None;
            }
            if let Err(error) = self.refill() {
                self.finished = true;
                return Some(Err(error));
            }
        }
        let entry = self.batch.pop()?;
        Some(self.storage.read_entry(&entry))
    }
}
