//! On-disk binary layouts for the chunk-store artifact set.
//!
//! Every header and record is read and written as explicit little-endian
//! byte sequences rather than cast through a `#[repr(C)]` struct: the
//! record layout (`u32,u32,u32,u64,u32,[u8;8]`) places a `u64` at a
//! 12-byte offset, which natural Rust struct padding would not preserve,
//! and the header sizes are fixed at exactly 20 bytes by the wire format.
//! Byte-exact manual encode/decode sidesteps both problems and is safe to
//! read directly out of an mmap region regardless of its alignment.

use std::convert::TryInto;

pub const HEADER_LEN: usize = 20;
pub const RECORD_LEN: usize = 32;

pub const VECTORS_MAGIC: [u8; 4] = *b"HMCV";
pub const RECORDS_MAGIC: [u8; 4] = *b"HMCR";
pub const CONTENT_MAGIC: [u8; 4] = *b"HMCC";

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorsHeader {
    pub version: u32,
    pub dim: u32,
    pub count: u32,
}

impl VectorsHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&VECTORS_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.dim.to_le_bytes());
        buf[12..16].copy_from_slice(&self.count.to_le_bytes());
        // bytes 16..20 reserved, left zero
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_LEN {
            return Err(FormatError::Truncated {
                what: "vectors header",
            });
        }
        if buf[0..4] != VECTORS_MAGIC {
            return Err(FormatError::BadMagic { what: "vectors" });
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(FormatError::VersionMismatch {
                what: "vectors",
                found: version,
            });
        }
        let dim = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let count = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        Ok(VectorsHeader {
            version,
            dim,
            count,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordsHeader {
    pub version: u32,
    pub count: u32,
    pub file_count: u32,
}

impl RecordsHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&RECORDS_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.file_count.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_LEN {
            return Err(FormatError::Truncated {
                what: "records header",
            });
        }
        if buf[0..4] != RECORDS_MAGIC {
            return Err(FormatError::BadMagic { what: "records" });
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(FormatError::VersionMismatch {
                what: "records",
                found: version,
            });
        }
        let count = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let file_count = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        Ok(RecordsHeader {
            version,
            count,
            file_count,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentHeader {
    pub version: u32,
    pub total_bytes: u64,
}

impl ContentHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&CONTENT_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.total_bytes.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_LEN {
            return Err(FormatError::Truncated {
                what: "content header",
            });
        }
        if buf[0..4] != CONTENT_MAGIC {
            return Err(FormatError::BadMagic { what: "content" });
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(FormatError::VersionMismatch {
                what: "content",
                found: version,
            });
        }
        let total_bytes = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        Ok(ContentHeader {
            version,
            total_bytes,
        })
    }
}

/// A single chunk record: `{u32 file_id; u32 start_line; u32 end_line;
/// u64 content_offset; u32 content_length; 8 bytes reserved}`, 32 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord {
    pub file_id: u32,
    pub start_line: u32,
    pub end_line: u32,
    pub content_offset: u64,
    pub content_length: u32,
}

impl RawRecord {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.start_line.to_le_bytes());
        buf[8..12].copy_from_slice(&self.end_line.to_le_bytes());
        buf[12..20].copy_from_slice(&self.content_offset.to_le_bytes());
        buf[20..24].copy_from_slice(&self.content_length.to_le_bytes());
        // bytes 24..32 reserved, left zero
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < RECORD_LEN {
            return Err(FormatError::Truncated { what: "record" });
        }
        Ok(RawRecord {
            file_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            start_line: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            end_line: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            content_offset: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            content_length: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("{what}: truncated, shorter than expected header/record size")]
    Truncated { what: &'static str },
    #[error("{what}: bad magic bytes")]
    BadMagic { what: &'static str },
    #[error("{what}: unsupported version {found}")]
    VersionMismatch { what: &'static str, found: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_header_round_trips() {
        let h = VectorsHeader {
            version: 1,
            dim: 384,
            count: 1000,
        };
        let buf = h.encode();
        assert_eq!(buf.len(), HEADER_LEN);
        let decoded = VectorsHeader::decode(&buf).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn records_header_round_trips() {
        let h = RecordsHeader {
            version: 1,
            count: 42,
            file_count: 3,
        };
        let decoded = RecordsHeader::decode(&h.encode()).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn content_header_round_trips_large_total() {
        let h = ContentHeader {
            version: 1,
            total_bytes: u64::MAX - 1,
        };
        let decoded = ContentHeader::decode(&h.encode()).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn record_round_trips() {
        let r = RawRecord {
            file_id: 7,
            start_line: 10,
            end_line: 25,
            content_offset: 123_456,
            content_length: 980,
        };
        let decoded = RawRecord::decode(&r.encode()).unwrap();
        assert_eq!(decoded, r);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = [0u8; HEADER_LEN];
        assert!(matches!(
            VectorsHeader::decode(&buf),
            Err(FormatError::BadMagic { .. })
        ));
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let buf = [0u8; HEADER_LEN - 1];
        assert!(matches!(
            VectorsHeader::decode(&buf),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut buf = VectorsHeader {
            version: 1,
            dim: 1,
            count: 1,
        }
        .encode();
        buf[4..8].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(
            VectorsHeader::decode(&buf),
            Err(FormatError::VersionMismatch { found: 2, .. })
        ));
    }
}
