//! Append-only fixed-record index files.
//!
//! An index maps 1-based positions to fixed-width entries, giving O(1)
//! positional access to documents and O(log n) search by sequence number.
//! The primary index covers every document; secondary indexes persist a
//! matcher in their metadata and cover the matching subset.
//!
//! # File Format
//!
//! ```text
//! ┌──────────┬─────────────────────────────────────────────┐
//! │ 0..8     │ magic "nesidx01"                            │
//! │ 8..12    │ metadata length (u32 BE)                    │
//! │ 12..H    │ JSON {entryClass, entrySize, ...}, padded   │
//! │ H..      │ N entries of fixed entrySize                │
//! └──────────┴─────────────────────────────────────────────┘
//! ```
//!
//! Invariant: `(file_size - H) % entrySize == 0`; entry `k` (1-based) lives
//! at byte `H + (k-1) * entrySize`. A tail that violates the invariant is
//! reported as [`StorageError::CorruptIndex`] carrying the count of entries
//! that are still intact.
//!
//! # Caching
//!
//! Entries are cached in memory as they are read. Sequential scans from the
//! start advance a rolling cursor so the cache grows without holes; ranges
//! fill their uncovered tail with a single positional read.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sediment_types::AccessMode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, trace};

use crate::entry::{EntryCodec, IndexEntry};
use crate::watcher::Watcher;
use crate::{StorageError, header};

/// Magic of index files: family `nesidx`, version `01`.
const MAGIC: &[u8; 8] = b"nesidx01";

/// Delay before a non-empty write buffer is flushed by `maybe_flush`.
const FLUSH_DELAY: Duration = Duration::from_millis(100);

/// Header metadata persisted at the front of every index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexMetadata {
    /// Descriptor of the entry codec the file was created with.
    entry_class: String,
    /// Pinned entry width in bytes.
    entry_size: usize,
    /// Caller fields (e.g. the persisted matcher of a secondary index).
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Tuning options for an index.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Write buffer size in bytes; the entry capacity is this divided by
    /// the entry width.
    pub write_buffer_size: usize,
    /// Extra fields merged into the header metadata at creation.
    pub metadata: Map<String, Value>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            write_buffer_size: 16 * 1024,
            metadata: Map::new(),
        }
    }
}

/// Change reported by a read-only index following a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEvent {
    /// Entries `from+1 ..= to` appeared.
    Append { from: u64, to: u64 },
    /// The index shrank from `from` to `to` entries.
    Truncate { from: u64, to: u64 },
}

/// Callback fired with an entry's 1-based position once it is flushed.
type AddCallback = Box<dyn FnOnce(u64) + Send>;

/// An append-only fixed-record index file.
///
/// Writable indexes buffer appends and flush on capacity, deadline, or
/// explicit request. Read-only indexes watch their file and surface
/// [`IndexEvent`]s through [`Index::poll_watch`].
pub struct Index<E: EntryCodec = IndexEntry> {
    file_name: String,
    path: PathBuf,
    mode: AccessMode,
    file: Option<File>,
    header_size: u64,
    metadata: IndexMetadata,

    /// Lazily filled entry cache; `data.len()` is the index length.
    data: Vec<Option<E>>,
    /// Entries durably on disk; the tail `flushed_length..` is buffered.
    flushed_length: usize,
    /// Length of the contiguous cached prefix.
    cursor: usize,

    buffer_capacity: usize,
    callbacks: Vec<(usize, AddCallback)>,
    flush_deadline: Option<Instant>,

    watcher: Option<Watcher>,
}

impl<E: EntryCodec> std::fmt::Debug for Index<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("file_name", &self.file_name)
            .field("mode", &self.mode)
            .field("length", &self.data.len())
            .field("flushed_length", &self.flushed_length)
            .finish_non_exhaustive()
    }
}

impl<E: EntryCodec> Index<E> {
    /// Opens (or, in writer mode, creates) the index file
    /// `directory/file_name`.
    ///
    /// On reopen the persisted entry class and width must match `E`;
    /// a trailing partial entry is a [`StorageError::CorruptIndex`]. The
    /// last entry is read eagerly. Read-only indexes attach a file watcher.
    pub fn open(
        directory: &Path,
        file_name: &str,
        mode: AccessMode,
        options: IndexOptions,
    ) -> Result<Self, StorageError> {
        let path = directory.join(file_name);
        let file = match mode {
            AccessMode::ReadWrite => OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(&path)?,
            AccessMode::ReadOnly => OpenOptions::new().read(true).open(&path)?,
        };

        let file_size = file.metadata()?.len();
        let (metadata, header_size) = if file_size == 0 {
            if !mode.is_writable() {
                return Err(StorageError::InvalidMagic { path });
            }
            let metadata = IndexMetadata {
                entry_class: E::NAME.to_string(),
                entry_size: E::SIZE,
                extra: options.metadata.clone(),
            };
            let json = serde_json::to_string(&metadata)?;
            let bytes = header::build(MAGIC, &json)?;
            let mut file_ref = &file;
            file_ref.write_all(&bytes)?;
            file_ref.flush()?;
            debug!(index = file_name, "created index file");
            (metadata, bytes.len() as u64)
        } else {
            let (json, header_size) = header::read(&file, MAGIC, &path)?;
            let metadata: IndexMetadata =
                serde_json::from_str(&json).map_err(|e| StorageError::InvalidMetadata {
                    reason: format!("index metadata: {e}"),
                })?;
            if metadata.entry_class != E::NAME || metadata.entry_size != E::SIZE {
                return Err(StorageError::EntryClassMismatch {
                    expected: E::NAME.to_string(),
                    expected_size: E::SIZE,
                    found: metadata.entry_class,
                    found_size: metadata.entry_size,
                });
            }
            (metadata, header_size)
        };

        let data_bytes = file.metadata()?.len().saturating_sub(header_size);
        if data_bytes % E::SIZE as u64 != 0 {
            return Err(StorageError::CorruptIndex {
                intact_entries: data_bytes / E::SIZE as u64,
            });
        }
        let length = (data_bytes / E::SIZE as u64) as usize;

        let watcher = match mode {
            AccessMode::ReadOnly => Some(Watcher::subscribe(&path, None)?),
            AccessMode::ReadWrite => None,
        };

        let mut index = Self {
            file_name: file_name.to_string(),
            path,
            mode,
            file: Some(file),
            header_size,
            metadata,
            data: vec![None; length],
            flushed_length: length,
            cursor: 0,
            buffer_capacity: (options.write_buffer_size / E::SIZE).max(1),
            callbacks: Vec::new(),
            flush_deadline: None,
            watcher,
        };
        if length > 0 {
            index.fetch(length - 1)?;
        }
        Ok(index)
    }

    /// Truncates a corrupt index file back to its last intact entry
    /// boundary, returning the surviving entry count.
    ///
    /// This is the writer-side answer to [`StorageError::CorruptIndex`]:
    /// the misaligned tail is a torn index append and carries no complete
    /// entry.
    pub fn repair_corrupt_tail(directory: &Path, file_name: &str) -> Result<u64, StorageError> {
        let path = directory.join(file_name);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let (_, header_size) = header::read(&file, MAGIC, &path)?;
        let data_bytes = file.metadata()?.len().saturating_sub(header_size);
        let intact = data_bytes / E::SIZE as u64;
        file.set_len(header_size + intact * E::SIZE as u64)?;
        file.sync_all()?;
        info!(index = file_name, intact, "repaired corrupt index tail");
        Ok(intact)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries, including buffered ones.
    pub fn length(&self) -> u64 {
        self.data.len() as u64
    }

    /// Caller metadata persisted in the header (e.g. a matcher).
    pub fn metadata_extra(&self) -> &Map<String, Value> {
        &self.metadata.extra
    }

    fn file(&self) -> Result<&File, StorageError> {
        self.file.as_ref().ok_or(StorageError::NotOpen)
    }

    // ========================================================================
    // Appending
    // ========================================================================

    /// Appends an entry to the write buffer.
    ///
    /// The optional callback fires with the entry's 1-based position once
    /// the buffer holding it is flushed. The buffer flushes itself at
    /// capacity; use [`Index::buffer_full`] to learn that the next `add`
    /// will flush.
    pub fn add(&mut self, entry: E, callback: Option<AddCallback>) -> Result<(), StorageError> {
        if !self.mode.is_writable() {
            return Err(StorageError::ReadOnly);
        }
        debug_assert!(
            self.data
                .last()
                .and_then(|slot| slot.as_ref().map(EntryCodec::number))
                .is_none_or(|last| entry.number() > last),
            "entry numbers must be strictly increasing"
        );

        let position = self.data.len();
        if self.cursor == position {
            self.cursor += 1;
        }
        self.data.push(Some(entry));
        if let Some(callback) = callback {
            self.callbacks.push((position, callback));
        }

        if self.data.len() - self.flushed_length >= self.buffer_capacity {
            self.flush()?;
        } else if self.flush_deadline.is_none() {
            self.flush_deadline = Some(Instant::now() + FLUSH_DELAY);
        }
        Ok(())
    }

    /// `true` when the next [`Index::add`] will trigger a flush.
    pub fn buffer_full(&self) -> bool {
        self.data.len() - self.flushed_length + 1 >= self.buffer_capacity
    }

    /// Entries waiting in the write buffer.
    pub fn buffered_entries(&self) -> usize {
        self.data.len() - self.flushed_length
    }

    /// Writes buffered entries to disk and fires their callbacks, in
    /// registration order, with their 1-based positions.
    pub fn flush(&mut self) -> Result<bool, StorageError> {
        self.flush_deadline = None;
        if !self.mode.is_writable() {
            return Err(StorageError::ReadOnly);
        }
        let pending = self.data.len() - self.flushed_length;
        if pending == 0 {
            return Ok(false);
        }

        let mut buf = vec![0u8; pending * E::SIZE];
        for (i, slot) in self.data[self.flushed_length..].iter().enumerate() {
            let entry = slot.as_ref().expect("buffered entries are always cached");
            entry.write_to(&mut buf[i * E::SIZE..(i + 1) * E::SIZE]);
        }
        {
            let mut file = self.file()?;
            file.write_all(&buf)?;
        }
        self.flushed_length = self.data.len();
        trace!(index = %self.file_name, entries = pending, "flushed index buffer");
        for (position, callback) in self.callbacks.drain(..) {
            callback(position as u64 + 1);
        }
        Ok(true)
    }

    /// Flushes if the coalescing deadline armed by `add` has passed.
    pub fn maybe_flush(&mut self) -> Result<bool, StorageError> {
        match self.flush_deadline {
            Some(deadline) if Instant::now() >= deadline => self.flush(),
            _ => Ok(false),
        }
    }

    /// `true` when a flush deadline is armed and due.
    pub fn flush_due(&self) -> bool {
        self.flush_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Reads entry `number` (1-based; negative wraps from the end).
    ///
    /// `Ok(None)` when the position is out of range. Uncached entries are
    /// read from disk one at a time; reads at the cache frontier advance
    /// the sequential cursor.
    pub fn get(&mut self, number: i64) -> Result<Option<E>, StorageError> {
        let Some(position) = self.normalize(number) else {
            return Ok(None);
        };
        let slot = (position - 1) as usize;
        if let Some(entry) = self.data[slot] {
            return Ok(Some(entry));
        }
        let entry = self.fetch(slot)?;
        Ok(Some(entry))
    }

    /// Reads the inclusive range `from ..= until` (1-based; negatives wrap
    /// from the end). `Ok(None)` on malformed or out-of-range arguments.
    ///
    /// Uncached entries are loaded with a single positional read covering
    /// the uncovered tail of the range.
    pub fn range(&mut self, from: i64, until: i64) -> Result<Option<Vec<E>>, StorageError> {
        let Some((from, until)) = self.valid_range(from, until) else {
            return Ok(None);
        };
        let first = (from - 1) as usize;
        let last = (until - 1) as usize;

        if let Some(uncovered) = (first..=last).find(|&k| self.data[k].is_none()) {
            // Everything past `flushed_length` is buffered and cached, so
            // the uncovered stretch is entirely on disk.
            let stop = (last + 1).min(self.flushed_length);
            let count = stop - uncovered;
            let mut buf = vec![0u8; count * E::SIZE];
            header::read_exact_at(
                self.file()?,
                &mut buf,
                self.header_size + (uncovered * E::SIZE) as u64,
            )?;
            for i in 0..count {
                let entry = E::read_from(&buf[i * E::SIZE..(i + 1) * E::SIZE]);
                self.data[uncovered + i] = Some(entry);
            }
            if self.cursor == uncovered {
                self.advance_cursor();
            }
        }

        let entries = self.data[first..=last]
            .iter()
            .copied()
            .map(|slot| slot.expect("range was just filled"))
            .collect();
        Ok(Some(entries))
    }

    /// All entries, first to last.
    pub fn all(&mut self) -> Result<Option<Vec<E>>, StorageError> {
        if self.data.is_empty() {
            return Ok(Some(Vec::new()));
        }
        self.range(1, self.data.len() as i64)
    }

    /// The most recently appended entry.
    pub fn last_entry(&mut self) -> Result<Option<E>, StorageError> {
        if self.data.is_empty() {
            return Ok(None);
        }
        self.get(self.data.len() as i64)
    }

    /// Binary search on entry numbers.
    ///
    /// Returns the largest position whose entry number is `<= number`, or
    /// with `min` the smallest position whose entry number is `>= number`.
    /// 0 when no entry qualifies. The search range is capped at `number`
    /// itself: entry numbers never fall below their position.
    pub fn find(&mut self, number: u64, min: bool) -> Result<u64, StorageError> {
        // Entry numbers never fall below their position, so a match for
        // `number` can only sit at position <= number.
        let limit = self.length().min(number);
        if limit == 0 {
            // With number 0, every entry (if any) is already >= it.
            return Ok(if min && self.length() > 0 { 1 } else { 0 });
        }

        let mut low = 1u64;
        let mut high = limit;
        let mut result = 0u64;
        while low <= high {
            let mid = low + (high - low) / 2;
            let entry = self
                .get(mid as i64)?
                .expect("mid is within the index length");
            if min {
                if entry.number() >= number {
                    result = mid;
                    high = mid - 1;
                } else {
                    low = mid + 1;
                }
            } else if entry.number() <= number {
                result = mid;
                low = mid + 1;
            } else {
                high = mid - 1;
            }
        }
        Ok(result)
    }

    /// Normalizes and validates an inclusive 1-based range.
    pub fn valid_range(&self, from: i64, until: i64) -> Option<(u64, u64)> {
        let from = self.normalize(from)?;
        let until = self.normalize(until)?;
        if from > until {
            return None;
        }
        Some((from, until))
    }

    /// Maps a possibly negative 1-based position into `1..=length`.
    fn normalize(&self, number: i64) -> Option<u64> {
        let length = self.data.len() as i64;
        let position = if number < 0 { length + number + 1 } else { number };
        if position < 1 || position > length {
            return None;
        }
        Some(position as u64)
    }

    /// Reads one entry from disk into the cache.
    fn fetch(&mut self, slot: usize) -> Result<E, StorageError> {
        let mut buf = vec![0u8; E::SIZE];
        header::read_exact_at(
            self.file()?,
            &mut buf,
            self.header_size + (slot * E::SIZE) as u64,
        )?;
        let entry = E::read_from(&buf);
        self.data[slot] = Some(entry);
        if self.cursor == slot {
            self.advance_cursor();
        }
        Ok(entry)
    }

    fn advance_cursor(&mut self) {
        while self.cursor < self.data.len() && self.data[self.cursor].is_some() {
            self.cursor += 1;
        }
    }

    // ========================================================================
    // Truncation and teardown
    // ========================================================================

    /// Shortens the index to `after` entries.
    ///
    /// Flushes first so the file length is well-defined; a no-op when the
    /// index is already at most `after` entries long.
    pub fn truncate(&mut self, after: u64) -> Result<(), StorageError> {
        if !self.mode.is_writable() {
            return Err(StorageError::ReadOnly);
        }
        self.flush()?;
        let after = after as usize;
        if after >= self.data.len() {
            return Ok(());
        }
        let file = self.file()?;
        file.set_len(self.header_size + (after * E::SIZE) as u64)?;
        file.sync_all()?;
        info!(
            index = %self.file_name,
            from = self.data.len(),
            to = after,
            "truncated index"
        );
        self.data.truncate(after);
        self.flushed_length = after;
        self.cursor = self.cursor.min(after);
        Ok(())
    }

    /// Flushes (writer mode) and releases the file handle.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.close();
        }
        if self.file.is_some() {
            if self.mode.is_writable() {
                self.flush()?;
                self.file()?.sync_all()?;
            }
            self.file = None;
        }
        Ok(())
    }

    /// Closes the index and deletes its file.
    pub fn destroy(mut self) -> Result<(), StorageError> {
        self.close()?;
        std::fs::remove_file(&self.path)?;
        info!(index = %self.file_name, "destroyed index");
        Ok(())
    }

    // ========================================================================
    // Read-only following
    // ========================================================================

    /// Drains watcher events and reconciles the in-memory view with the
    /// file, reporting growth and truncation. Read-only indexes only.
    pub fn poll_watch(&mut self) -> Result<Vec<IndexEvent>, StorageError> {
        let Some(watcher) = self.watcher.as_mut() else {
            return Ok(Vec::new());
        };
        if watcher.try_events().is_empty() {
            return Ok(Vec::new());
        }

        let file_size = self.file()?.metadata()?.len();
        let data_bytes = file_size.saturating_sub(self.header_size);
        // A partial trailing entry is a write in progress; it is ignored
        // until a later poll sees it complete.
        let new_length = (data_bytes / E::SIZE as u64) as usize;
        let old_length = self.data.len();

        let mut events = Vec::new();
        if new_length > old_length {
            self.data.resize(new_length, None);
            self.flushed_length = new_length;
            events.push(IndexEvent::Append {
                from: old_length as u64,
                to: new_length as u64,
            });
        } else if new_length < old_length {
            self.data.truncate(new_length);
            self.flushed_length = new_length;
            self.cursor = self.cursor.min(new_length);
            events.push(IndexEvent::Truncate {
                from: old_length as u64,
                to: new_length as u64,
            });
        }
        Ok(events)
    }
}

impl<E: EntryCodec> Drop for Index<E> {
    fn drop(&mut self) {
        if self.file.is_some()
            && let Err(error) = self.close()
        {
            tracing::error!(index = %self.file_name, %error, "failed to close index");
        }
    }
}
