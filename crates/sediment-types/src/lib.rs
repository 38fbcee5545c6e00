//! # sediment-types: Core types for sediment
//!
//! This crate contains the small shared types used across the sediment
//! storage engine:
//! - Entity IDs ([`SequenceNumber`], [`PartitionId`])
//! - File access ([`AccessMode`])

use std::{
    fmt::Display,
    ops::{Add, AddAssign, Sub},
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Entity IDs - All Copy (cheap 4-byte values)
// ============================================================================

/// Global 1-based sequence number of a document.
///
/// Sequence numbers are assigned by the storage layer in write order; the
/// first document has sequence 1. The value is pinned to 32 bits by the
/// on-disk record format.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SequenceNumber(u32);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn new(number: u32) -> Self {
        Self(number)
    }

    /// Returns the sequence number as a `u32`.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the sequence number as a `u64` for index arithmetic.
    pub fn as_u64(&self) -> u64 {
        u64::from(self.0)
    }

    /// Returns the next sequence number.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for SequenceNumber {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for SequenceNumber {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for SequenceNumber {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl From<u32> for SequenceNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber> for u32 {
    fn from(number: SequenceNumber) -> Self {
        number.0
    }
}

impl From<SequenceNumber> for u64 {
    fn from(number: SequenceNumber) -> Self {
        u64::from(number.0)
    }
}

/// 32-bit identifier of a partition, derived from its file name.
///
/// The id is the DJB-XOR hash of the partition file name, so that a
/// partition can be re-identified from index entries without consulting any
/// central registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PartitionId(u32);

impl PartitionId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Hashes a partition file name into its id.
    ///
    /// DJB-XOR: `h = 5381; h = (h * 33) ^ byte`, wrapping, with the final
    /// value taken as unsigned. Stable across platforms and releases; the
    /// value is persisted inside index entries.
    ///
    /// # Examples
    ///
    /// ```
    /// # use sediment_types::PartitionId;
    /// let id = PartitionId::from_name("events.part-0");
    /// assert_eq!(id, PartitionId::from_name("events.part-0"));
    /// assert_ne!(id, PartitionId::from_name("events.part-1"));
    /// ```
    pub fn from_name(name: &str) -> Self {
        let mut hash: u32 = 5381;
        for byte in name.bytes() {
            hash = hash.wrapping_mul(33) ^ u32::from(byte);
        }
        Self(hash)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<PartitionId> for u32 {
    fn from(id: PartitionId) -> Self {
        id.0
    }
}

// ============================================================================
// File access
// ============================================================================

/// How a storage file is opened.
///
/// Exactly one writer may hold [`AccessMode::ReadWrite`] per storage; any
/// number of [`AccessMode::ReadOnly`] instances may observe it concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AccessMode {
    /// Append and truncate permitted; acquires the storage lock.
    ReadWrite,
    /// Observation only; follows writer progress via file watching.
    #[default]
    ReadOnly,
}

impl AccessMode {
    /// Returns `true` for [`AccessMode::ReadWrite`].
    pub fn is_writable(self) -> bool {
        matches!(self, AccessMode::ReadWrite)
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::ReadWrite => write!(f, "read-write"),
            AccessMode::ReadOnly => write!(f, "read-only"),
        }
    }
}
