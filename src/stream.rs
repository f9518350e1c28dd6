// Sources:
// - Microsoft Tape Format Specification Version 1.00a, section 6 (Data Streams)

//! Trailing data streams of a descriptor block (MTF_STREAM_HDR + payload).

use log::debug;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, Write};

use crate::cursor::{ByteCursor, StringEncoding};
use crate::error::{MtfError, Result};

pub const STREAM_HEADER_SIZE: u64 = 22;
pub const STREAM_ALIGNMENT: u64 = 4;

/// Standard file data.
pub const STREAM_STANDARD: &str = "STAN";
/// Directory path recorded out of line (DIRB).
pub const STREAM_PATH_NAME: &str = "PNAM";
/// File name recorded out of line (FILE).
pub const STREAM_FILE_NAME: &str = "FNAM";
/// Padding up to the next logical block; always the last stream of a DBLK.
pub const STREAM_PAD: &str = "SPAD";

// Stream file system attributes
pub const STREAM_MODIFIED_BY_READ: u16 = 0x0001;
pub const STREAM_CONTAINS_SECURITY: u16 = 0x0002;
pub const STREAM_IS_NON_PORTABLE: u16 = 0x0004;
pub const STREAM_IS_SPARSE: u16 = 0x0008;

// Stream media format attributes
pub const STREAM_CONTINUE: u16 = 0x0001;
pub const STREAM_VARIABLE: u16 = 0x0002;
pub const STREAM_VAR_END: u16 = 0x0004;
pub const STREAM_ENCRYPTED: u16 = 0x0008;
pub const STREAM_COMPRESSED: u16 = 0x0010;
pub const STREAM_CHECKSUMED: u16 = 0x0020;
pub const STREAM_EMBEDDED_LENGTH: u16 = 0x0040;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataStream {
    pub id: String,
    pub fs_attributes: u16,
    pub media_attributes: u16,
    pub length: u64,
    pub encryption_algorithm: u16,
    pub compression_algorithm: u16,
    pub checksum: u16,
    /// Absolute offset of the first payload byte in the source.
    pub data_offset: u64,
    /// Payload, when it was small enough to be kept while decoding.
    #[serde(skip)]
    pub data: Option<Vec<u8>>,
}

impl DataStream {
    pub fn is_continuation(&self) -> bool {
        self.media_attributes & STREAM_CONTINUE != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.media_attributes & STREAM_ENCRYPTED != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.media_attributes & STREAM_COMPRESSED != 0
    }

    /// Write the payload verbatim to `out`, going back to the source when it was
    /// not retained.
    pub fn copy_payload<T: Read + Seek, W: Write>(
        &self,
        cursor: &mut ByteCursor<T>,
        out: &mut W,
    ) -> Result<u64> {
        if let Some(data) = &self.data {
            out.write_all(data)?;
            return Ok(data.len() as u64);
        }
        cursor.seek(self.data_offset)?;
        cursor.copy_to(self.length, out).map_err(|e| match e {
            MtfError::TruncatedInput { .. } => MtfError::TruncatedStream {
                offset: self.data_offset,
                length: self.length,
            },
            other => other,
        })
    }
}

/// Human-friendly names of the media format attribute bits.
pub fn decode_media_attributes(flags: u16) -> Vec<&'static str> {
    let table = [
        (STREAM_CONTINUE, "CONTINUE"),
        (STREAM_VARIABLE, "VARIABLE"),
        (STREAM_VAR_END, "VAR_END"),
        (STREAM_ENCRYPTED, "ENCRYPTED"),
        (STREAM_COMPRESSED, "COMPRESSED"),
        (STREAM_CHECKSUMED, "CHECKSUMED"),
        (STREAM_EMBEDDED_LENGTH, "EMBEDDED_LENGTH"),
    ];
    table
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

pub fn decode_fs_attributes(flags: u16) -> Vec<&'static str> {
    let table = [
        (STREAM_MODIFIED_BY_READ, "MODIFIED_BY_READ"),
        (STREAM_CONTAINS_SECURITY, "CONTAINS_SECURITY"),
        (STREAM_IS_NON_PORTABLE, "NON_PORTABLE"),
        (STREAM_IS_SPARSE, "SPARSE"),
    ];
    table
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Read one stream at the cursor.
///
/// Returns `None` when not even a stream header fits before the end of the
/// source. Payloads longer than `retain_limit` are skipped and only their offset
/// is recorded. The cursor always finishes on a 4-byte boundary.
pub fn read_stream<T: Read + Seek>(
    cursor: &mut ByteCursor<T>,
    retain_limit: u64,
) -> Result<Option<DataStream>> {
    if cursor.remaining_len() < STREAM_HEADER_SIZE {
        debug!(
            "No room for a stream header at 0x{:X}, end of data.",
            cursor.position()
        );
        return Ok(None);
    }
    let header_at = cursor.position();

    let id = cursor.read_fixed_string(4, StringEncoding::Ansi)?;
    let fs_attributes = cursor.read_u16()?;
    let media_attributes = cursor.read_u16()?;
    let length = cursor.read_u64()?;
    let encryption_algorithm = cursor.read_u16()?;
    let compression_algorithm = cursor.read_u16()?;
    let checksum = cursor.read_u16()?;

    let data_offset = cursor.position();
    if length > cursor.remaining_len() {
        return Err(MtfError::TruncatedStream {
            offset: header_at,
            length,
        });
    }
    let data = if length <= retain_limit {
        Some(cursor.read_bytes(length)?)
    } else {
        cursor.skip(length)?;
        None
    };
    cursor.align_from(0, STREAM_ALIGNMENT)?;

    debug!(
        "Stream '{}' at 0x{:X}: {} bytes{}",
        id,
        header_at,
        length,
        if data.is_some() { "" } else { " (not retained)" }
    );

    Ok(Some(DataStream {
        id,
        fs_attributes,
        media_attributes,
        length,
        encryption_algorithm,
        compression_algorithm,
        checksum,
        data_offset,
        data,
    }))
}
