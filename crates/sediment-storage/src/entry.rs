//! Index entry codecs.
//!
//! An index file stores fixed-width entries; the codec decides the width and
//! the field layout. The codec name and width are pinned into the index
//! metadata at creation time and verified on reopen, so a file can never be
//! silently reinterpreted with a different layout.

use sediment_types::{PartitionId, SequenceNumber};

/// A fixed-width index entry codec.
///
/// Implementations must be `Copy` (entries are cached by value) and must
/// read back exactly what they wrote. `SIZE` is the pinned byte width;
/// `NAME` is the descriptor persisted in the index metadata.
pub trait EntryCodec: Copy + std::fmt::Debug {
    /// Descriptor recorded in the index metadata.
    const NAME: &'static str;
    /// Fixed byte width of one entry.
    const SIZE: usize;

    /// Serializes the entry into `buf` (exactly `SIZE` bytes).
    fn write_to(&self, buf: &mut [u8]);

    /// Deserializes an entry from `buf` (exactly `SIZE` bytes).
    fn read_from(buf: &[u8]) -> Self;

    /// The entry's search key: the global document sequence number.
    fn number(&self) -> u64;
}

/// The standard 16-byte index entry.
///
/// Little-endian u32 fields:
///
/// ```text
/// ┌────────┬──────────┬──────┬───────────┐
/// │ number │ position │ size │ partition │
/// │  u32   │   u32    │ u32  │    u32    │
/// └────────┴──────────┴──────┴───────────┘
/// ```
///
/// `number` is the 1-based global document sequence, `position` the byte
/// offset of the record inside its partition (excluding the partition
/// header), `size` the payload byte size, and `partition` the partition id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub number: SequenceNumber,
    pub position: u32,
    pub size: u32,
    pub partition: PartitionId,
}

impl IndexEntry {
    pub fn new(number: SequenceNumber, position: u32, size: u32, partition: PartitionId) -> Self {
        Self {
            number,
            position,
            size,
            partition,
        }
    }
}

impl EntryCodec for IndexEntry {
    const NAME: &'static str = "IndexEntry";
    const SIZE: usize = 16;

    fn write_to(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), Self::SIZE, "entry buffer size mismatch");
        buf[0..4].copy_from_slice(&self.number.as_u32().to_le_bytes());
        buf[4..8].copy_from_slice(&self.position.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.partition.as_u32().to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        debug_assert_eq!(buf.len(), Self::SIZE, "entry buffer size mismatch");
        let number = u32::from_le_bytes(buf[0..4].try_into().expect("slice is exactly 4 bytes"));
        let position = u32::from_le_bytes(buf[4..8].try_into().expect("slice is exactly 4 bytes"));
        let size = u32::from_le_bytes(buf[8..12].try_into().expect("slice is exactly 4 bytes"));
        let partition =
            u32::from_le_bytes(buf[12..16].try_into().expect("slice is exactly 4 bytes"));
        Self {
            number: SequenceNumber::new(number),
            position,
            size,
            partition: PartitionId::new(partition),
        }
    }

    fn number(&self) -> u64 {
        self.number.as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip() {
        let entry = IndexEntry::new(
            SequenceNumber::new(7),
            1024,
            333,
            PartitionId::from_name("events"),
        );
        let mut buf = [0u8; IndexEntry::SIZE];
        entry.write_to(&mut buf);
        let back = IndexEntry::read_from(&buf);
        assert_eq!(entry, back);
        assert_eq!(back.number(), 7);
    }

    #[test]
    fn entry_layout_is_little_endian() {
        let entry = IndexEntry::new(SequenceNumber::new(1), 2, 3, PartitionId::new(4));
        let mut buf = [0u8; IndexEntry::SIZE];
        entry.write_to(&mut buf);
        assert_eq!(
            buf,
            [1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0],
            "fields must be u32 LE in declaration order"
        );
    }
}
