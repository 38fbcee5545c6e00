//! A single append-only file of framed documents.
//!
//! The partition is the physical storage unit: documents are framed with a
//! fixed header, an alignment pad, and a footer, then appended through a
//! write buffer. Byte positions handed out by [`Partition::write`] are
//! relative to the end of the file header, so index entries stay valid
//! regardless of metadata size.
//!
//! # Record Format
//!
//! ```text
//! ┌──────────┬──────────┬─────────┬─────────┬─────┬──────────┬───────────┐
//! │ dataSize │ sequence │ time64  │ payload │ pad │ size echo│ separator │
//! │ u32 BE   │ u32 BE   │ f64 BE  │ N bytes │ 0-3 │ u32 BE   │ 00001E0A  │
//! └──────────┴──────────┴─────────┴─────────┴─────┴──────────┴───────────┘
//! ```
//!
//! Every record starts and ends on a 4-byte boundary; the pad sits between
//! the payload and the footer so the separator always closes the record.
//! From any record boundary the previous record is reachable in O(1): the
//! 4 bytes before the boundary are the separator, the 4 before those the
//! size echo.
//!
//! # Torn Writes
//!
//! A crash can persist a record prefix. Because a complete file always ends
//! with the separator, a missing separator at the tail identifies the torn
//! record; [`Partition::check_torn_write`] locates its start by scanning
//! backwards to the last boundary that validates (separator, echo, and
//! header agree).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use sediment_types::{AccessMode, SequenceNumber};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, trace, warn};

use crate::clock::MonotonicClock;
use crate::{MAX_DOCUMENT_SIZE, StorageError, header};

/// Magic of partition files: family `nesprt`, version `03`.
const MAGIC: &[u8; 8] = b"nesprt03";

/// Fixed record header: dataSize (4) + sequence (4) + time64 (8).
const DOCUMENT_HEADER_SIZE: u64 = 16;

/// Fixed record footer: size echo (4) + separator (4).
const DOCUMENT_FOOTER_SIZE: u64 = 8;

/// Record boundaries are aligned to this many bytes.
const DOCUMENT_ALIGNMENT: u64 = 4;

/// Closes every record; a missing separator at the tail is a torn write.
const DOCUMENT_SEPARATOR: [u8; 4] = [0x00, 0x00, 0x1E, 0x0A];

/// Smallest possible record: empty payload, no pad.
const MIN_WRITE_SIZE: u64 = DOCUMENT_HEADER_SIZE + DOCUMENT_FOOTER_SIZE;

/// Delay before a non-empty write buffer is flushed by `maybe_flush`.
const FLUSH_DELAY: Duration = Duration::from_millis(100);

/// Pad bytes between payload and footer for a given payload size.
fn padding(data_size: u32) -> u64 {
    (DOCUMENT_ALIGNMENT - u64::from(data_size) % DOCUMENT_ALIGNMENT) % DOCUMENT_ALIGNMENT
}

/// Total bytes a record occupies on disk.
pub(crate) fn write_size(data_size: u32) -> u64 {
    DOCUMENT_HEADER_SIZE + u64::from(data_size) + padding(data_size) + DOCUMENT_FOOTER_SIZE
}

/// Header metadata persisted at the front of every partition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PartitionMetadata {
    /// Wall-clock reference for record timestamps, ms since the Unix epoch.
    epoch: u64,
    /// The partition's own file name.
    name: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Tuning and policy options for a partition.
#[derive(Debug, Clone)]
pub struct PartitionOptions {
    /// Size of the shared read buffer in bytes.
    pub read_buffer_size: usize,
    /// Size of the write buffer in bytes; records above 4/5 of this bypass
    /// buffering entirely.
    pub write_buffer_size: usize,
    /// Flush after this many buffered documents; 0 leaves the byte capacity
    /// as the only bound.
    pub max_write_buffer_documents: usize,
    /// Issue an fsync on every buffer flush.
    pub sync_on_flush: bool,
    /// Serve reads of not-yet-flushed records from the write buffer.
    pub dirty_reads: bool,
    /// Extra fields merged into the header metadata at creation.
    pub metadata: Map<String, Value>,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 64 * 1024,
            write_buffer_size: 16 * 1024,
            max_write_buffer_documents: 0,
            sync_on_flush: false,
            dirty_reads: true,
            metadata: Map::new(),
        }
    }
}

/// A record as returned by partition scans.
#[derive(Debug, Clone)]
pub struct RecordView {
    /// Start offset of the record, relative to the end of the file header.
    pub position: u64,
    /// Caller-supplied sequence number from the record header.
    pub sequence: SequenceNumber,
    /// Microseconds since the partition epoch.
    pub time: f64,
    /// The payload bytes.
    pub payload: Bytes,
}

/// Description of an incomplete record found at the partition tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TornWrite {
    /// Start offset of the torn record.
    pub position: u64,
    /// Sequence number from the torn header, when enough of it survived.
    pub sequence: Option<SequenceNumber>,
}

/// Completion callbacks registered against buffered records.
type FlushCallback = Box<dyn FnOnce() + Send>;

/// A single append-only partition file.
///
/// Writers buffer appends and flush on capacity, document count, deadline,
/// or explicit request; readers go through a positional read buffer. All
/// positions are data-relative (the file header is excluded).
pub struct Partition {
    file_name: String,
    path: PathBuf,
    mode: AccessMode,
    file: Option<File>,
    header_size: u64,
    clock: MonotonicClock,

    /// Logical data size including buffered-but-unflushed bytes.
    size: u64,
    /// Data bytes durably written to the file.
    flushed_size: u64,

    read_buffer: Vec<u8>,
    read_buffer_start: u64,
    read_buffer_len: usize,

    write_buffer: Vec<u8>,
    write_buffer_size: usize,
    buffered_documents: usize,
    max_write_buffer_documents: usize,
    sync_on_flush: bool,
    dirty_reads: bool,
    flush_callbacks: Vec<FlushCallback>,
    flush_deadline: Option<Instant>,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("file_name", &self.file_name)
            .field("mode", &self.mode)
            .field("size", &self.size)
            .field("flushed_size", &self.flushed_size)
            .finish_non_exhaustive()
    }
}

impl Partition {
    /// Opens (or, in writer mode, creates) the partition file
    /// `directory/file_name`.
    ///
    /// An empty file in writer mode receives the magic and metadata header.
    /// A file whose format family matches but whose version differs is
    /// rejected with [`StorageError::UnsupportedVersion`].
    pub fn open(
        directory: &Path,
        file_name: &str,
        mode: AccessMode,
        options: PartitionOptions,
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
            let epoch = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            let metadata = PartitionMetadata {
                epoch,
                name: file_name.to_string(),
                extra: options.metadata.clone(),
            };
            let json = serde_json::to_string(&metadata)?;
            let bytes = header::build(MAGIC, &json)?;
            let mut file_ref = &file;
            file_ref.write_all(&bytes)?;
            file_ref.flush()?;
            debug!(partition = file_name, "created partition file");
            (metadata, bytes.len() as u64)
        } else {
            let (json, header_size) = header::read(&file, MAGIC, &path)?;
            let metadata: PartitionMetadata =
                serde_json::from_str(&json).map_err(|e| StorageError::InvalidMetadata {
                    reason: format!("partition metadata: {e}"),
                })?;
            (metadata, header_size)
        };

        let data_size = file.metadata()?.len().saturating_sub(header_size);
        let clock = MonotonicClock::new(metadata.epoch);

        Ok(Self {
            file_name: file_name.to_string(),
            path,
            mode,
            file: Some(file),
            header_size,
            clock,
            size: data_size,
            flushed_size: data_size,
            read_buffer: vec![0; options.read_buffer_size.max(MIN_WRITE_SIZE as usize)],
            read_buffer_start: 0,
            read_buffer_len: 0,
            write_buffer: Vec::with_capacity(options.write_buffer_size),
            write_buffer_size: options.write_buffer_size,
            buffered_documents: 0,
            max_write_buffer_documents: options.max_write_buffer_documents,
            sync_on_flush: options.sync_on_flush,
            dirty_reads: options.dirty_reads,
            flush_callbacks: Vec::new(),
            flush_deadline: None,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical data size, including buffered bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Data bytes known to be on disk.
    pub fn flushed_size(&self) -> u64 {
        self.flushed_size
    }

    fn file(&self) -> Result<&File, StorageError> {
        self.file.as_ref().ok_or(StorageError::NotOpen)
    }

    /// End of the readable byte range: the durable size, extended over the
    /// write buffer for a dirty-reading writer.
    fn readable_size(&self) -> u64 {
        if self.dirty_reads && self.mode.is_writable() {
            self.size
        } else {
            self.flushed_size
        }
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Appends a framed document, returning its data-relative start offset.
    ///
    /// Small records are buffered; a record larger than 4/5 of the write
    /// buffer flushes it and goes straight to disk.
    pub fn write(
        &mut self,
        payload: &[u8],
        sequence: SequenceNumber,
    ) -> Result<u64, StorageError> {
        self.write_with(payload, sequence, None)
    }

    /// Like [`Partition::write`], registering a completion callback that
    /// fires once the record has been flushed (immediately for unbuffered
    /// records), in registration order.
    pub fn write_with(
        &mut self,
        payload: &[u8],
        sequence: SequenceNumber,
        callback: Option<FlushCallback>,
    ) -> Result<u64, StorageError> {
        if !self.mode.is_writable() {
            return Err(StorageError::ReadOnly);
        }
        if payload.len() > MAX_DOCUMENT_SIZE {
            return Err(StorageError::DocumentTooLarge {
                size: payload.len(),
                max: MAX_DOCUMENT_SIZE,
            });
        }

        let data_size = payload.len() as u32;
        let record_size = write_size(data_size);
        let position = self.size;
        let time = self.clock.time() as f64;

        debug_assert_eq!(position % DOCUMENT_ALIGNMENT, 0, "append must stay aligned");

        let unbuffered = record_size as usize > self.write_buffer_size * 4 / 5;
        if unbuffered {
            self.flush()?;
            let mut frame = Vec::with_capacity(record_size as usize);
            frame_record(&mut frame, payload, sequence, time);
            // Header, then padded body and footer, back to back.
            let mut file = self.file()?;
            file.write_all(&frame[..DOCUMENT_HEADER_SIZE as usize])?;
            file.write_all(&frame[DOCUMENT_HEADER_SIZE as usize..])?;
            if self.sync_on_flush {
                file.sync_data()?;
            }
            self.size += record_size;
            self.flushed_size += record_size;
            if let Some(callback) = callback {
                callback();
            }
            trace!(
                partition = %self.file_name,
                %sequence,
                size = record_size,
                "unbuffered record write"
            );
            return Ok(position);
        }

        if self.write_buffer.len() + record_size as usize > self.write_buffer_size {
            self.flush()?;
        }
        frame_record(&mut self.write_buffer, payload, sequence, time);
        self.size += record_size;
        self.buffered_documents += 1;
        if let Some(callback) = callback {
            self.flush_callbacks.push(callback);
        }

        if self.max_write_buffer_documents > 0
            && self.buffered_documents >= self.max_write_buffer_documents
        {
            self.flush()?;
        } else if self.flush_deadline.is_none() {
            self.flush_deadline = Some(Instant::now() + FLUSH_DELAY);
        }

        Ok(position)
    }

    /// Writes the buffer to disk; fsyncs when `sync_on_flush` is set.
    ///
    /// Completion callbacks fire in registration order, only after the
    /// write succeeded. Returns `true` when bytes were written.
    pub fn flush(&mut self) -> Result<bool, StorageError> {
        self.flush_deadline = None;
        if self.write_buffer.is_empty() {
            return Ok(false);
        }
        let sync = self.sync_on_flush;
        {
            let mut file = self.file()?;
            file.write_all(&self.write_buffer)?;
            if sync {
                file.sync_data()?;
            }
        }
        self.flushed_size += self.write_buffer.len() as u64;
        trace!(
            partition = %self.file_name,
            bytes = self.write_buffer.len(),
            documents = self.buffered_documents,
            "flushed write buffer"
        );
        self.write_buffer.clear();
        self.buffered_documents = 0;
        for callback in self.flush_callbacks.drain(..) {
            callback();
        }
        Ok(true)
    }

    /// Flushes if the coalescing deadline armed by a buffered write has
    /// passed. The single slot means bursts of writes share one flush.
    pub fn maybe_flush(&mut self) -> Result<bool, StorageError> {
        match self.flush_deadline {
            Some(deadline) if Instant::now() >= deadline => self.flush(),
            _ => Ok(false),
        }
    }

    /// Bytes currently sitting in the write buffer.
    pub fn buffered_bytes(&self) -> usize {
        self.write_buffer.len()
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Reads the document payload of the record starting at `position`.
    ///
    /// Returns `Ok(None)` when the record header would extend past the
    /// readable end (a reader may simply not have caught up with the
    /// writer yet).
    ///
    /// # Errors
    ///
    /// - [`StorageError::InvalidPosition`] if `position` is unaligned
    /// - [`StorageError::InvalidDataSize`] if `expected_size` disagrees
    ///   with the record header
    /// - [`StorageError::CorruptFile`] if the header claims bytes past the
    ///   readable end
    pub fn read_from(
        &mut self,
        position: u64,
        expected_size: Option<u32>,
    ) -> Result<Option<Bytes>, StorageError> {
        match self.read_record(position, expected_size)? {
            Some(view) => Ok(Some(view.payload)),
            None => Ok(None),
        }
    }

    /// Reads the full record starting at `position`.
    pub(crate) fn read_record(
        &mut self,
        position: u64,
        expected_size: Option<u32>,
    ) -> Result<Option<RecordView>, StorageError> {
        if position % DOCUMENT_ALIGNMENT != 0 {
            return Err(StorageError::InvalidPosition { position });
        }
        let readable = self.readable_size();
        if position + DOCUMENT_HEADER_SIZE > readable {
            return Ok(None);
        }

        let mut head = [0u8; DOCUMENT_HEADER_SIZE as usize];
        self.read_small(position, &mut head)?;
        let data_size = u32::from_be_bytes(head[0..4].try_into().expect("slice is 4 bytes"));
        let sequence = u32::from_be_bytes(head[4..8].try_into().expect("slice is 4 bytes"));
        let time = f64::from_be_bytes(head[8..16].try_into().expect("slice is 8 bytes"));

        if let Some(expected) = expected_size
            && expected != data_size
        {
            return Err(StorageError::InvalidDataSize {
                expected,
                actual: data_size,
            });
        }
        if position + write_size(data_size) > readable {
            return Err(StorageError::CorruptFile {
                position,
                size: readable,
            });
        }

        let payload = self.read_payload(position + DOCUMENT_HEADER_SIZE, data_size as usize)?;
        Ok(Some(RecordView {
            position,
            sequence: SequenceNumber::new(sequence),
            time,
            payload,
        }))
    }

    /// Fills `buf` from `position`, serving dirty regions out of the write
    /// buffer. The caller has already bounds-checked against
    /// [`Partition::readable_size`]; requests never straddle the flushed
    /// boundary because the buffer only ever holds whole records.
    fn read_small(&mut self, position: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        if position >= self.flushed_size {
            let offset = (position - self.flushed_size) as usize;
            buf.copy_from_slice(&self.write_buffer[offset..offset + buf.len()]);
            return Ok(());
        }

        let len = buf.len();
        if !self.read_buffer_covers(position, len) {
            self.fill_read_buffer(position)?;
        }
        let offset = (position - self.read_buffer_start) as usize;
        buf.copy_from_slice(&self.read_buffer[offset..offset + len]);
        Ok(())
    }

    /// Reads a payload, bypassing the read buffer for payloads larger than
    /// it with a single exact-size positional read.
    fn read_payload(&mut self, position: u64, len: usize) -> Result<Bytes, StorageError> {
        if position >= self.flushed_size {
            let offset = (position - self.flushed_size) as usize;
            return Ok(Bytes::copy_from_slice(
                &self.write_buffer[offset..offset + len],
            ));
        }
        if len > self.read_buffer.len() {
            let mut payload = vec![0u8; len];
            header::read_exact_at(self.file()?, &mut payload, self.header_size + position)?;
            return Ok(Bytes::from(payload));
        }
        if !self.read_buffer_covers(position, len) {
            self.fill_read_buffer(position)?;
        }
        let offset = (position - self.read_buffer_start) as usize;
        Ok(Bytes::copy_from_slice(
            &self.read_buffer[offset..offset + len],
        ))
    }

    fn read_buffer_covers(&self, position: u64, len: usize) -> bool {
        position >= self.read_buffer_start
            && position + len as u64 <= self.read_buffer_start + self.read_buffer_len as u64
    }

    /// Uncached positional read, spanning the flushed/buffered boundary.
    ///
    /// Boundary probes and backward scans use this instead of
    /// [`Partition::read_small`] so they do not evict the read buffer that
    /// forward scans depend on.
    fn read_span(&mut self, position: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let len = buf.len() as u64;
        let disk_len = self.flushed_size.saturating_sub(position).min(len);
        if disk_len > 0 {
            header::read_exact_at(
                self.file()?,
                &mut buf[..disk_len as usize],
                self.header_size + position,
            )?;
        }
        if disk_len < len {
            let start = (position + disk_len - self.flushed_size) as usize;
            let need = (len - disk_len) as usize;
            buf[disk_len as usize..].copy_from_slice(&self.write_buffer[start..start + need]);
        }
        Ok(())
    }

    /// Loads the read buffer starting at `position`, clamped to the
    /// durable size.
    fn fill_read_buffer(&mut self, position: u64) -> Result<(), StorageError> {
        let available = self.flushed_size.saturating_sub(position);
        let want = (self.read_buffer.len() as u64).min(available) as usize;
        let file = self.file.as_ref().ok_or(StorageError::NotOpen)?;
        header::read_exact_at(
            file,
            &mut self.read_buffer[..want],
            self.header_size + position,
        )?;
        self.read_buffer_start = position;
        self.read_buffer_len = want;
        Ok(())
    }

    // ========================================================================
    // Boundary navigation
    // ========================================================================

    /// Checks whether `boundary` closes a complete record: the separator
    /// sits right before it, and the size echo agrees with the header of
    /// the record it would delimit. Payloads may contain separator bytes,
    /// so the echo/header cross-check is not optional.
    fn validate_boundary(&mut self, boundary: u64) -> Result<bool, StorageError> {
        if boundary % DOCUMENT_ALIGNMENT != 0 || boundary < MIN_WRITE_SIZE {
            return Ok(false);
        }
        let mut footer = [0u8; DOCUMENT_FOOTER_SIZE as usize];
        self.read_span(boundary - DOCUMENT_FOOTER_SIZE, &mut footer)?;
        if footer[4..8] != DOCUMENT_SEPARATOR {
            return Ok(false);
        }
        let data_size = u32::from_be_bytes(footer[0..4].try_into().expect("slice is 4 bytes"));
        self.validate_record_at(boundary, data_size)
    }

    /// Cross-checks the header of the record that would end at `boundary`
    /// with the echoed `data_size`.
    fn validate_record_at(&mut self, boundary: u64, data_size: u32) -> Result<bool, StorageError> {
        if data_size as usize > MAX_DOCUMENT_SIZE {
            return Ok(false);
        }
        let record_size = write_size(data_size);
        if record_size > boundary {
            return Ok(false);
        }
        let start = boundary - record_size;
        let mut head = [0u8; 4];
        self.read_span(start, &mut head)?;
        Ok(u32::from_be_bytes(head) == data_size)
    }

    /// Scans backwards from `from` (inclusive) for the greatest boundary
    /// that validates, one read-buffer-sized chunk at a time.
    ///
    /// Candidate boundaries are multiples of 4 and chunk edges are too, so
    /// a separator belonging to a real boundary never straddles chunks.
    fn scan_backward_for_boundary(&mut self, from: u64) -> Result<Option<u64>, StorageError> {
        let top = from - from % DOCUMENT_ALIGNMENT;
        if top < MIN_WRITE_SIZE {
            return Ok(None);
        }
        let chunk_size = (self.read_buffer.len() as u64) & !(DOCUMENT_ALIGNMENT - 1);
        let mut chunk_end = top;
        let mut chunk = vec![0u8; chunk_size as usize];
        loop {
            let chunk_start = chunk_end.saturating_sub(chunk_size);
            let len = (chunk_end - chunk_start) as usize;
            self.read_span(chunk_start, &mut chunk[..len])?;

            let mut candidate = chunk_end;
            while candidate >= chunk_start + DOCUMENT_ALIGNMENT && candidate >= MIN_WRITE_SIZE {
                let offset = (candidate - chunk_start) as usize;
                if chunk[offset - 4..offset] == DOCUMENT_SEPARATOR {
                    let data_size = if candidate - DOCUMENT_FOOTER_SIZE >= chunk_start {
                        u32::from_be_bytes(
                            chunk[offset - 8..offset - 4]
                                .try_into()
                                .expect("slice is 4 bytes"),
                        )
                    } else {
                        let mut echo = [0u8; 4];
                        self.read_span(candidate - DOCUMENT_FOOTER_SIZE, &mut echo)?;
                        u32::from_be_bytes(echo)
                    };
                    if self.validate_record_at(candidate, data_size)? {
                        return Ok(Some(candidate));
                    }
                }
                candidate -= DOCUMENT_ALIGNMENT;
            }

            if chunk_start == 0 {
                return Ok(None);
            }
            chunk_end = chunk_start;
        }
    }

    /// Returns the start position of the record preceding `position`.
    ///
    /// `position` is usually a record boundary, in which case the footer
    /// makes this O(1). A mid-record `position` (torn tail) falls back to
    /// the backward separator scan and returns the start of the record
    /// containing it. `Ok(None)` when `position` is 0.
    pub fn find_document_position_before(
        &mut self,
        position: u64,
    ) -> Result<Option<u64>, StorageError> {
        if position == 0 {
            return Ok(None);
        }
        if position % DOCUMENT_ALIGNMENT != 0 || position > self.readable_size() {
            return Err(StorageError::InvalidPosition { position });
        }

        // Fast path: `position` closes a complete record.
        if self.validate_boundary(position)? {
            let mut echo = [0u8; 4];
            self.read_small(position - DOCUMENT_FOOTER_SIZE, &mut echo)?;
            let data_size = u32::from_be_bytes(echo);
            return Ok(Some(position - write_size(data_size)));
        }

        match self.scan_backward_for_boundary(position - DOCUMENT_ALIGNMENT)? {
            Some(boundary) => Ok(Some(boundary)),
            // No boundary below: the first record contains `position`.
            None => Ok(Some(0)),
        }
    }

    /// Inspects the partition tail for an incomplete record.
    ///
    /// Returns `Ok(None)` when the file is empty or ends with a complete
    /// record. Otherwise the torn record's start position is located, and
    /// its sequence number is reported when at least the first 8 header
    /// bytes survived.
    pub fn check_torn_write(&mut self) -> Result<Option<TornWrite>, StorageError> {
        let tail = self.flushed_size;
        if tail == 0 {
            return Ok(None);
        }
        if tail % DOCUMENT_ALIGNMENT == 0 && self.validate_boundary(tail)? {
            return Ok(None);
        }

        let position = self
            .scan_backward_for_boundary(tail.saturating_sub(1))?
            .unwrap_or(0);
        let sequence = if tail - position >= 8 {
            let mut head = [0u8; 8];
            self.read_small(position, &mut head)?;
            Some(SequenceNumber::new(u32::from_be_bytes(
                head[4..8].try_into().expect("slice is 4 bytes"),
            )))
        } else {
            None
        };
        warn!(
            partition = %self.file_name,
            position,
            sequence = sequence.map(|s| s.as_u32()),
            "torn write detected at partition tail"
        );
        Ok(Some(TornWrite { position, sequence }))
    }

    // ========================================================================
    // Scanning
    // ========================================================================

    /// Lazy forward scan of all records starting at data offset `after`.
    pub fn read_all(&mut self, after: u64) -> RecordIter<'_> {
        RecordIter {
            partition: self,
            position: after,
            done: false,
        }
    }

    /// Lazy backward scan of all records, newest first, starting from the
    /// boundary `before` (the current end when `None`).
    pub fn read_all_backwards(&mut self, before: Option<u64>) -> RecordBackIter<'_> {
        let boundary = before.unwrap_or_else(|| self.readable_size());
        RecordBackIter {
            partition: self,
            boundary,
            done: false,
        }
    }

    // ========================================================================
    // Truncation
    // ========================================================================

    /// Truncates the partition so that `after` data bytes remain.
    ///
    /// The removed tail is first copied into a sibling quarantine file
    /// `<name>-<after>.branch` for operator inspection. `after` must be a
    /// record boundary (or 0).
    pub fn truncate(&mut self, after: u64) -> Result<(), StorageError> {
        if !self.mode.is_writable() {
            return Err(StorageError::ReadOnly);
        }
        self.flush()?;

        if after > self.size {
            return Err(StorageError::InvalidPosition { position: after });
        }
        if after == self.size {
            return Ok(());
        }
        if after != 0 && !self.validate_boundary(after)? {
            return Err(StorageError::TruncateNotOnBoundary { position: after });
        }

        self.quarantine_tail(after)?;

        let file = self.file()?;
        file.set_len(self.header_size + after)?;
        file.sync_all()?;
        info!(
            partition = %self.file_name,
            after,
            removed = self.size - after,
            "truncated partition"
        );
        self.size = after;
        self.flushed_size = after;
        // Drop any cached bytes in the removed range.
        if self.read_buffer_start + self.read_buffer_len as u64 > after {
            self.read_buffer_len = after.saturating_sub(self.read_buffer_start) as usize;
        }
        Ok(())
    }

    /// Copies the file header plus the data tail `[after, size)` into the
    /// branch file.
    fn quarantine_tail(&mut self, after: u64) -> Result<(), StorageError> {
        let branch_name = format!("{}-{}.branch", self.file_name, after);
        let branch_path = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&branch_name);
        let mut branch = File::create(&branch_path)?;

        let mut header_bytes = vec![0u8; self.header_size as usize];
        header::read_exact_at(self.file()?, &mut header_bytes, 0)?;
        branch.write_all(&header_bytes)?;

        let mut position = after;
        let mut chunk = vec![0u8; self.read_buffer.len()];
        while position < self.flushed_size {
            let want = ((self.flushed_size - position) as usize).min(chunk.len());
            header::read_exact_at(
                self.file()?,
                &mut chunk[..want],
                self.header_size + position,
            )?;
            branch.write_all(&chunk[..want])?;
            position += want as u64;
        }
        branch.sync_all()?;
        info!(
            partition = %self.file_name,
            branch = %branch_name,
            bytes = self.flushed_size - after,
            "quarantined truncated tail"
        );
        Ok(())
    }

    /// Flushes, fsyncs (writer mode), and releases the file handle.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if let Some(file) = self.file.take() {
            if self.mode.is_writable() {
                if !self.write_buffer.is_empty() {
                    let mut file_ref = &file;
                    file_ref.write_all(&self.write_buffer)?;
                    self.flushed_size += self.write_buffer.len() as u64;
                    self.write_buffer.clear();
                    self.buffered_documents = 0;
                    for callback in self.flush_callbacks.drain(..) {
                        callback();
                    }
                }
                file.sync_all()?;
            }
            self.flush_deadline = None;
            self.read_buffer_len = 0;
        }
        Ok(())
    }

    /// Re-reads the file size; used by read-only instances following a
    /// writer. Returns `(previous, current)` data sizes.
    pub fn refresh_size(&mut self) -> Result<(u64, u64), StorageError> {
        let previous = self.size;
        let current = self
            .file()?
            .metadata()?
            .len()
            .saturating_sub(self.header_size);
        if current < previous {
            // Writer truncated; cached bytes past the new end are invalid.
            self.read_buffer_len = 0;
        }
        self.size = current;
        self.flushed_size = current;
        Ok((previous, current))
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        if self.file.is_some()
            && let Err(error) = self.close()
        {
            tracing::error!(partition = %self.file_name, %error, "failed to close partition");
        }
    }
}

/// Serializes one record frame into `buf`.
fn frame_record(buf: &mut Vec<u8>, payload: &[u8], sequence: SequenceNumber, time: f64) {
    let data_size = payload.len() as u32;
    buf.extend_from_slice(&data_size.to_be_bytes());
    buf.extend_from_slice(&sequence.as_u32().to_be_bytes());
    buf.extend_from_slice(&time.to_be_bytes());
    buf.extend_from_slice(payload);
    buf.resize(buf.len() + padding(data_size) as usize, 0);
    buf.extend_from_slice(&data_size.to_be_bytes());
    buf.extend_from_slice(&DOCUMENT_SEPARATOR);
}

/// Forward record iterator; see [`Partition::read_all`].
pub struct RecordIter<'a> {
    partition: &'a mut Partition,
    position: u64,
    done: bool,
}

impl Iterator for RecordIter<'_> {
    type Item = Result<RecordView, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.partition.read_record(self.position, None) {
            Ok(Some(view)) => {
                self.position += write_size(view.payload.len() as u32);
                Some(Ok(view))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(error) => {
                self.done = true;
                Some(Err(error))
            }
        }
    }
}

/// Backward record iterator; see [`Partition::read_all_backwards`].
pub struct RecordBackIter<'a> {
    partition: &'a mut Partition,
    boundary: u64,
    done: bool,
}

impl Iterator for RecordBackIter<'_> {
    type Item = Result<RecordView, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let start = match self.partition.find_document_position_before(self.boundary) {
            Ok(Some(start)) => start,
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(error) => {
                self.done = true;
                return Some(Err(error));
            }
        };
        self.boundary = start;
        if start == 0 {
            self.done = true;
        }
        match self.partition.read_record(start, None) {
            Ok(Some(view)) => Some(Ok(view)),
            Ok(None) => None,
            Err(error) => Some(Err(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn open_rw(dir: &Path, options: PartitionOptions) -> Partition {
        Partition::open(dir, "events", AccessMode::ReadWrite, options).unwrap()
    }

    // ========================================================================
    // Framing
    // ========================================================================

    #[test]
    fn write_size_accounts_for_alignment() {
        assert_eq!(write_size(0), 24);
        assert_eq!(write_size(1), 16 + 1 + 3 + 8);
        assert_eq!(write_size(4), 16 + 4 + 8);
        assert_eq!(write_size(5), 16 + 5 + 3 + 8);
    }

    #[test]
    fn frame_layout_matches_format() {
        let mut frame = Vec::new();
        frame_record(&mut frame, b"hello", SequenceNumber::new(3), 99.5);

        assert_eq!(frame.len() as u64, write_size(5));
        // Header: dataSize, sequence, time64 — big-endian.
        assert_eq!(u32::from_be_bytes(frame[0..4].try_into().unwrap()), 5);
        assert_eq!(u32::from_be_bytes(frame[4..8].try_into().unwrap()), 3);
        assert_eq!(f64::from_be_bytes(frame[8..16].try_into().unwrap()), 99.5);
        // Payload then pad to alignment.
        assert_eq!(&frame[16..21], b"hello");
        assert_eq!(&frame[21..24], &[0, 0, 0]);
        // Footer: size echo then separator, closing the record.
        assert_eq!(u32::from_be_bytes(frame[24..28].try_into().unwrap()), 5);
        assert_eq!(&frame[28..32], &DOCUMENT_SEPARATOR);
    }

    #[test]
    fn records_start_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        for i in 0..20u32 {
            let payload = vec![b'x'; 1 + (i as usize * 7) % 23];
            let position = partition
                .write(&payload, SequenceNumber::new(i + 1))
                .unwrap();
            assert_eq!(position % 4, 0, "record {i} misaligned");
        }
    }

    // ========================================================================
    // Round trips
    // ========================================================================

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        let position = partition.write(b"payload", SequenceNumber::new(1)).unwrap();
        partition.flush().unwrap();

        let payload = partition.read_from(position, None).unwrap().unwrap();
        assert_eq!(&payload[..], b"payload");
    }

    #[test]
    fn dirty_reads_serve_from_write_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        let position = partition.write(b"buffered", SequenceNumber::new(1)).unwrap();

        assert!(partition.buffered_bytes() > 0, "record should be buffered");
        let payload = partition.read_from(position, None).unwrap().unwrap();
        assert_eq!(&payload[..], b"buffered");
    }

    #[test]
    fn disabled_dirty_reads_return_none_for_buffered_records() {
        let dir = tempfile::tempdir().unwrap();
        let options = PartitionOptions {
            dirty_reads: false,
            ..PartitionOptions::default()
        };
        let mut partition = open_rw(dir.path(), options);
        let position = partition.write(b"buffered", SequenceNumber::new(1)).unwrap();

        assert!(partition.read_from(position, None).unwrap().is_none());
        partition.flush().unwrap();
        assert!(partition.read_from(position, None).unwrap().is_some());
    }

    #[test]
    fn expected_size_mismatch_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        let position = partition.write(b"12345", SequenceNumber::new(1)).unwrap();
        partition.flush().unwrap();

        assert!(matches!(
            partition.read_from(position, Some(99)),
            Err(StorageError::InvalidDataSize {
                expected: 99,
                actual: 5
            })
        ));
        assert!(partition.read_from(position, Some(5)).unwrap().is_some());
    }

    #[test]
    fn unaligned_position_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        partition.write(b"data", SequenceNumber::new(1)).unwrap();
        partition.flush().unwrap();
        assert!(matches!(
            partition.read_from(2, None),
            Err(StorageError::InvalidPosition { position: 2 })
        ));
    }

    #[test]
    fn large_records_bypass_the_write_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let options = PartitionOptions {
            write_buffer_size: 256,
            ..PartitionOptions::default()
        };
        let mut partition = open_rw(dir.path(), options);
        let big = vec![0xAB; 1000];
        let position = partition.write(&big, SequenceNumber::new(1)).unwrap();

        assert_eq!(partition.buffered_bytes(), 0, "large record must bypass");
        assert_eq!(partition.flushed_size(), write_size(1000));
        let payload = partition.read_from(position, None).unwrap().unwrap();
        assert_eq!(payload.len(), 1000);
    }

    #[test]
    fn buffer_overflow_triggers_flush_first() {
        let dir = tempfile::tempdir().unwrap();
        let options = PartitionOptions {
            write_buffer_size: 256,
            ..PartitionOptions::default()
        };
        let mut partition = open_rw(dir.path(), options);
        // Each record is 16+64+8 = 88 bytes; the third would overflow 256.
        for i in 1..=3u32 {
            partition.write(&[i as u8; 64], SequenceNumber::new(i)).unwrap();
        }
        assert!(partition.flushed_size() > 0, "older records were flushed");
        assert!(partition.buffered_bytes() > 0, "newest record still buffered");
    }

    #[test]
    fn max_buffered_documents_forces_flush() {
        let dir = tempfile::tempdir().unwrap();
        let options = PartitionOptions {
            max_write_buffer_documents: 2,
            ..PartitionOptions::default()
        };
        let mut partition = open_rw(dir.path(), options);
        partition.write(b"a", SequenceNumber::new(1)).unwrap();
        assert!(partition.buffered_bytes() > 0);
        partition.write(b"b", SequenceNumber::new(2)).unwrap();
        assert_eq!(partition.buffered_bytes(), 0, "second write hits the cap");
    }

    #[test]
    fn flush_callbacks_fire_in_registration_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        let order = Arc::new(AtomicUsize::new(0));
        for expected in 0..3usize {
            let order = Arc::clone(&order);
            partition
                .write_with(
                    b"cb",
                    SequenceNumber::new(expected as u32 + 1),
                    Some(Box::new(move || {
                        assert_eq!(order.fetch_add(1, Ordering::SeqCst), expected);
                    })),
                )
                .unwrap();
        }
        partition.flush().unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn payload_larger_than_read_buffer_single_shot() {
        let dir = tempfile::tempdir().unwrap();
        let options = PartitionOptions {
            read_buffer_size: 64,
            write_buffer_size: 64,
            ..PartitionOptions::default()
        };
        let mut partition = open_rw(dir.path(), options);
        let payload: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        let position = partition.write(&payload, SequenceNumber::new(1)).unwrap();
        let read = partition.read_from(position, None).unwrap().unwrap();
        assert_eq!(&read[..], &payload[..]);
    }

    // ========================================================================
    // Scanning
    // ========================================================================

    #[test]
    fn forward_scan_yields_in_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        for i in 1..=5u32 {
            partition
                .write(format!("doc-{i}").as_bytes(), SequenceNumber::new(i))
                .unwrap();
        }
        partition.flush().unwrap();

        let sequences: Vec<u32> = partition
            .read_all(0)
            .map(|r| r.unwrap().sequence.as_u32())
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn backward_scan_is_reverse_of_forward() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        for i in 1..=7u32 {
            let payload = vec![i as u8; (i as usize * 5) % 13 + 1];
            partition.write(&payload, SequenceNumber::new(i)).unwrap();
        }
        partition.flush().unwrap();

        let forward: Vec<u64> = partition
            .read_all(0)
            .map(|r| r.unwrap().position)
            .collect();
        let mut backward: Vec<u64> = partition
            .read_all_backwards(None)
            .map(|r| r.unwrap().position)
            .collect();
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn find_position_before_steps_back_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        let p1 = partition.write(b"first", SequenceNumber::new(1)).unwrap();
        let p2 = partition.write(b"second!", SequenceNumber::new(2)).unwrap();
        partition.flush().unwrap();
        let end = partition.size();

        assert_eq!(partition.find_document_position_before(end).unwrap(), Some(p2));
        assert_eq!(partition.find_document_position_before(p2).unwrap(), Some(p1));
        assert_eq!(partition.find_document_position_before(0).unwrap(), None);
    }

    #[test]
    fn payload_containing_separator_does_not_confuse_backward_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        // Payload full of separator sequences, aligned every which way.
        let mut tricky = Vec::new();
        for _ in 0..8 {
            tricky.extend_from_slice(&DOCUMENT_SEPARATOR);
        }
        let p1 = partition.write(&tricky, SequenceNumber::new(1)).unwrap();
        let p2 = partition.write(&tricky[..9], SequenceNumber::new(2)).unwrap();
        partition.flush().unwrap();

        let positions: Vec<u64> = partition
            .read_all_backwards(None)
            .map(|r| r.unwrap().position)
            .collect();
        assert_eq!(positions, vec![p2, p1]);
    }

    // ========================================================================
    // Torn writes
    // ========================================================================

    fn truncate_file_to(path: &Path, len: u64) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_len(len).unwrap();
    }

    #[test]
    fn intact_partition_reports_no_torn_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        partition.write(b"whole", SequenceNumber::new(1)).unwrap();
        partition.close().unwrap();

        let mut reopened = open_rw(dir.path(), PartitionOptions::default());
        assert_eq!(reopened.check_torn_write().unwrap(), None);
    }

    #[test]
    fn torn_tail_reports_sequence_and_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        partition.write(b"complete", SequenceNumber::new(7)).unwrap();
        let torn_position = partition.write(&[0x55; 600], SequenceNumber::new(8)).unwrap();
        partition.close().unwrap();
        let header_size = partition.header_size;
        let path = partition.path().to_path_buf();
        drop(partition);

        // Cut the second record in the middle of its payload.
        truncate_file_to(&path, header_size + torn_position + 100);

        let mut reopened = open_rw(dir.path(), PartitionOptions::default());
        let torn = reopened.check_torn_write().unwrap().unwrap();
        assert_eq!(torn.position, torn_position);
        assert_eq!(torn.sequence, Some(SequenceNumber::new(8)));
    }

    #[test]
    fn torn_first_record_reports_position_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        partition.write(&[1u8; 1400], SequenceNumber::new(1)).unwrap();
        partition.close().unwrap();
        let header_size = partition.header_size;
        let path = partition.path().to_path_buf();
        drop(partition);

        truncate_file_to(&path, header_size + 512);

        let mut reopened = open_rw(dir.path(), PartitionOptions::default());
        let torn = reopened.check_torn_write().unwrap().unwrap();
        assert_eq!(torn.position, 0);
        assert_eq!(torn.sequence, Some(SequenceNumber::new(1)));
    }

    #[test_case::test_case(2 ; "mid header, unaligned")]
    #[test_case::test_case(12 ; "header incomplete")]
    #[test_case::test_case(16 ; "header only")]
    #[test_case::test_case(40 ; "mid payload")]
    #[test_case::test_case(write_size(64) - 4 ; "separator missing")]
    fn torn_cut_points_all_resolve_to_record_start(cut: u64) {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        partition.write(&[7u8; 64], SequenceNumber::new(1)).unwrap();
        partition.flush().unwrap();
        let boundary = partition.size();
        partition.write(&[9u8; 64], SequenceNumber::new(2)).unwrap();
        partition.close().unwrap();
        let header_size = partition.header_size;
        let path = partition.path().to_path_buf();
        drop(partition);

        truncate_file_to(&path, header_size + boundary + cut);

        let mut reopened = open_rw(dir.path(), PartitionOptions::default());
        let torn = reopened.check_torn_write().unwrap().unwrap();
        assert_eq!(torn.position, boundary);
        if cut >= 8 {
            assert_eq!(torn.sequence, Some(SequenceNumber::new(2)));
        } else {
            assert_eq!(torn.sequence, None);
        }
    }

    #[test]
    fn torn_header_yields_no_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        partition.write(b"good", SequenceNumber::new(1)).unwrap();
        partition.flush().unwrap();
        let boundary = partition.size();
        partition.write(b"lost", SequenceNumber::new(2)).unwrap();
        partition.close().unwrap();
        let header_size = partition.header_size;
        let path = partition.path().to_path_buf();
        drop(partition);

        // Only 4 bytes of the second record's header survive.
        truncate_file_to(&path, header_size + boundary + 4);

        let mut reopened = open_rw(dir.path(), PartitionOptions::default());
        let torn = reopened.check_torn_write().unwrap().unwrap();
        assert_eq!(torn.position, boundary);
        assert_eq!(torn.sequence, None);
    }

    // ========================================================================
    // Truncation
    // ========================================================================

    #[test]
    fn truncate_keeps_prefix_and_quarantines_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        partition.write(b"keep", SequenceNumber::new(1)).unwrap();
        partition.flush().unwrap();
        let boundary = partition.size();
        partition.write(b"drop-1", SequenceNumber::new(2)).unwrap();
        partition.write(b"drop-2", SequenceNumber::new(3)).unwrap();

        partition.truncate(boundary).unwrap();
        assert_eq!(partition.size(), boundary);

        let sequences: Vec<u32> = partition
            .read_all(0)
            .map(|r| r.unwrap().sequence.as_u32())
            .collect();
        assert_eq!(sequences, vec![1]);

        let branch = dir.path().join(format!("events-{boundary}.branch"));
        assert!(branch.exists(), "quarantine branch file must exist");
        let branch_size = std::fs::metadata(&branch).unwrap().len();
        assert_eq!(
            branch_size,
            partition.header_size + write_size(6) * 2,
            "branch holds the two dropped records"
        );
    }

    #[test]
    fn truncate_rejects_non_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        partition.write(b"data!", SequenceNumber::new(1)).unwrap();
        partition.flush().unwrap();
        assert!(matches!(
            partition.truncate(4),
            Err(StorageError::TruncateNotOnBoundary { position: 4 })
        ));
    }

    #[test]
    fn truncate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        partition.write(b"one", SequenceNumber::new(1)).unwrap();
        partition.flush().unwrap();
        let boundary = partition.size();
        partition.write(b"two", SequenceNumber::new(2)).unwrap();

        partition.truncate(boundary).unwrap();
        partition.truncate(boundary).unwrap();
        assert_eq!(partition.size(), boundary);
    }

    #[test]
    fn truncate_to_zero_empties_the_partition() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        partition.write(b"a", SequenceNumber::new(1)).unwrap();
        partition.write(b"b", SequenceNumber::new(2)).unwrap();
        partition.truncate(0).unwrap();
        assert_eq!(partition.size(), 0);
        assert_eq!(partition.read_all(0).count(), 0);
    }

    // ========================================================================
    // Reopen
    // ========================================================================

    #[test]
    fn reopen_restores_size_and_rejects_version_skew() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        partition.write(b"persisted", SequenceNumber::new(1)).unwrap();
        partition.close().unwrap();
        let expected = partition.size();
        drop(partition);

        let mut reopened = open_rw(dir.path(), PartitionOptions::default());
        assert_eq!(reopened.size(), expected);
        assert_eq!(
            &reopened.read_from(0, None).unwrap().unwrap()[..],
            b"persisted"
        );
        drop(reopened);

        // Flip the version byte pair in the magic.
        let path = dir.path().join("events");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[6..8].copy_from_slice(b"99");
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            Partition::open(dir.path(), "events", AccessMode::ReadWrite, PartitionOptions::default()),
            Err(StorageError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn read_only_mode_rejects_writes_and_follows_growth() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_rw(dir.path(), PartitionOptions::default());
        writer.write(b"first", SequenceNumber::new(1)).unwrap();
        writer.flush().unwrap();

        let mut reader = Partition::open(
            dir.path(),
            "events",
            AccessMode::ReadOnly,
            PartitionOptions::default(),
        )
        .unwrap();
        assert!(matches!(
            reader.write(b"nope", SequenceNumber::new(2)),
            Err(StorageError::ReadOnly)
        ));
        assert_eq!(&reader.read_from(0, None).unwrap().unwrap()[..], b"first");

        let second = writer.write(b"second", SequenceNumber::new(2)).unwrap();
        writer.flush().unwrap();
        // Reader has stale bounds until it refreshes.
        assert!(reader.read_from(second, None).unwrap().is_none());
        let (old, new) = reader.refresh_size().unwrap();
        assert!(new > old);
        assert_eq!(&reader.read_from(second, None).unwrap().unwrap()[..], b"second");
    }

    #[test]
    fn oversized_document_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = open_rw(dir.path(), PartitionOptions::default());
        let oversized = vec![0u8; MAX_DOCUMENT_SIZE + 1];
        assert!(matches!(
            partition.write(&oversized, SequenceNumber::new(1)),
            Err(StorageError::DocumentTooLarge { .. })
        ));
    }
}
