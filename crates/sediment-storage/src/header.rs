//! Shared file-header framing for partition and index files.
//!
//! Both file kinds open with the same prefix:
//!
//! ```text
//! ┌────────┬──────────────┬──────────────────────────────┐
//! │ 0..8   │ magic        │ 6-byte family + 2-byte version │
//! │ 8..12  │ length M     │ u32 BE, metadata incl. '\n'  │
//! │ 12..12+M │ metadata   │ JSON, space padded, '\n' last │
//! └────────┴──────────────┴──────────────────────────────┘
//! ```
//!
//! `12 + M` is a multiple of 16 so the first record lands on an aligned
//! offset. A magic whose family matches but whose version differs is a
//! library-version error, not a corrupt file.

use std::fs::File;
use std::path::Path;

use crate::StorageError;

/// Bytes of the magic that identify the format family (the version is the
/// remaining two bytes).
const MAGIC_FAMILY_LEN: usize = 6;

/// Fixed prefix ahead of the metadata block: magic (8) + length (4).
pub(crate) const HEADER_PREFIX_LEN: usize = 12;

/// Header total is padded to this alignment.
const HEADER_ALIGNMENT: usize = 16;

/// Upper bound on the metadata block, including the trailing newline.
pub(crate) const METADATA_MAX_LEN: usize = 4096;

/// Builds a complete file header for `metadata_json`.
///
/// The metadata is padded with spaces and terminated with a newline so that
/// the total header length is a multiple of 16.
///
/// # Errors
///
/// [`StorageError::InvalidMetadata`] when the serialized metadata exceeds
/// [`METADATA_MAX_LEN`].
pub(crate) fn build(magic: &[u8; 8], metadata_json: &str) -> Result<Vec<u8>, StorageError> {
    let unpadded = metadata_json.len() + 1; // + newline
    let total = (HEADER_PREFIX_LEN + unpadded).next_multiple_of(HEADER_ALIGNMENT);
    let metadata_len = total - HEADER_PREFIX_LEN;
    if metadata_len > METADATA_MAX_LEN {
        return Err(StorageError::InvalidMetadata {
            reason: format!("metadata of {} bytes exceeds {METADATA_MAX_LEN}", metadata_json.len()),
        });
    }

    let mut header = Vec::with_capacity(total);
    header.extend_from_slice(magic);
    header.extend_from_slice(&(metadata_len as u32).to_be_bytes());
    header.extend_from_slice(metadata_json.as_bytes());
    header.resize(total - 1, b' ');
    header.push(b'\n');

    debug_assert_eq!(header.len() % HEADER_ALIGNMENT, 0, "header must be aligned");
    Ok(header)
}

/// Reads and validates a file header, returning the metadata JSON string
/// and the total header length.
pub(crate) fn read(
    file: &File,
    magic: &[u8; 8],
    path: &Path,
) -> Result<(String, u64), StorageError> {
    let mut prefix = [0u8; HEADER_PREFIX_LEN];
    read_exact_at(file, &mut prefix, 0).map_err(|_| StorageError::InvalidMagic {
        path: path.to_path_buf(),
    })?;

    if prefix[..MAGIC_FAMILY_LEN] != magic[..MAGIC_FAMILY_LEN] {
        return Err(StorageError::InvalidMagic {
            path: path.to_path_buf(),
        });
    }
    if prefix[MAGIC_FAMILY_LEN..8] != magic[MAGIC_FAMILY_LEN..] {
        return Err(StorageError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: String::from_utf8_lossy(&prefix[..8]).into_owned(),
        });
    }

    let metadata_len = u32::from_be_bytes(
        prefix[8..12]
            .try_into()
            .expect("slice is exactly 4 bytes"),
    ) as usize;
    if metadata_len <= 2 || metadata_len > METADATA_MAX_LEN {
        return Err(StorageError::InvalidMetadata {
            reason: format!("metadata length {metadata_len} out of bounds"),
        });
    }

    let mut metadata = vec![0u8; metadata_len];
    read_exact_at(file, &mut metadata, HEADER_PREFIX_LEN as u64).map_err(|_| {
        StorageError::InvalidMetadata {
            reason: "file shorter than its declared metadata block".to_string(),
        }
    })?;
    if metadata.last() != Some(&b'\n') {
        return Err(StorageError::InvalidMetadata {
            reason: "metadata block is not newline terminated".to_string(),
        });
    }

    let json = String::from_utf8(metadata).map_err(|_| StorageError::InvalidMetadata {
        reason: "metadata block is not valid UTF-8".to_string(),
    })?;
    Ok((
        json.trim_end().to_string(),
        (HEADER_PREFIX_LEN + metadata_len) as u64,
    ))
}

/// Positional exact read (`pread`); does not move the file cursor on Unix.
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)
    }
    #[cfg(not(unix))]
    {
        use std::os::windows::fs::FileExt;
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ));
            }
            read += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MAGIC: &[u8; 8] = b"tsthdr01";

    #[test]
    fn build_pads_to_sixteen() {
        let header = build(MAGIC, "{\"a\":1}").unwrap();
        assert_eq!(header.len() % 16, 0);
        assert_eq!(&header[..8], MAGIC);
        assert_eq!(*header.last().unwrap(), b'\n');
        let len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
        assert_eq!(header.len(), HEADER_PREFIX_LEN + len);
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.dat");
        let header = build(MAGIC, "{\"epoch\":12}").unwrap();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&header)
            .unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let (json, size) = read(&file, MAGIC, &path).unwrap();
        assert_eq!(json, "{\"epoch\":12}");
        assert_eq!(size, header.len() as u64);
    }

    #[test]
    fn version_mismatch_is_distinguished_from_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.dat");
        let header = build(b"tsthdr02", "{}").unwrap();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&header)
            .unwrap();

        let file = std::fs::File::open(&path).unwrap();
        assert!(matches!(
            read(&file, MAGIC, &path),
            Err(StorageError::UnsupportedVersion { .. })
        ));

        let path2 = dir.path().join("h2.dat");
        let header = build(b"othmag01", "{}").unwrap();
        std::fs::File::create(&path2)
            .unwrap()
            .write_all(&header)
            .unwrap();
        let file = std::fs::File::open(&path2).unwrap();
        assert!(matches!(
            read(&file, MAGIC, &path2),
            Err(StorageError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn truncated_metadata_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.dat");
        let mut header = build(MAGIC, "{\"epoch\":12}").unwrap();
        header.truncate(20);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&header)
            .unwrap();

        let file = std::fs::File::open(&path).unwrap();
        assert!(matches!(
            read(&file, MAGIC, &path),
            Err(StorageError::InvalidMetadata { .. })
        ));
    }
}
