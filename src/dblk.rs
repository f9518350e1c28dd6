// Sources:
// - Microsoft Tape Format Specification Version 1.00a, sections 5 (DBLKs) and Appendix C
//   (OS specific data)

//! Descriptor blocks (DBLKs) with their OS specific extension records.

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::NaiveDateTime;
use log::{debug, warn};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{Cursor, Read, Seek};

use crate::cursor::{ByteCursor, StringEncoding, TapeAddress, decode_string};
use crate::error::{MtfError, Result};
use crate::stream::{
    DataStream, STREAM_PAD, decode_fs_attributes, decode_media_attributes, read_stream,
};

/// Size of MTF_DB_HDR, shared by every descriptor block.
pub const COMMON_HEADER_SIZE: u64 = 52;
/// Number of u16 words covered by the header checksum.
const CHECKSUM_WORDS: usize = 25;

pub const MTF_TAPE: u32 = u32::from_le_bytes(*b"TAPE");
pub const MTF_SSET: u32 = u32::from_le_bytes(*b"SSET");
pub const MTF_VOLB: u32 = u32::from_le_bytes(*b"VOLB");
pub const MTF_DIRB: u32 = u32::from_le_bytes(*b"DIRB");
pub const MTF_FILE: u32 = u32::from_le_bytes(*b"FILE");
pub const MTF_CFIL: u32 = u32::from_le_bytes(*b"CFIL");
pub const MTF_ESPB: u32 = u32::from_le_bytes(*b"ESPB");
pub const MTF_ESET: u32 = u32::from_le_bytes(*b"ESET");
pub const MTF_EOTM: u32 = u32::from_le_bytes(*b"EOTM");
pub const MTF_SFMB: u32 = u32::from_le_bytes(*b"SFMB");
pub const MTF_DBDB: u32 = u32::from_le_bytes(*b"DBDB");

// Block attributes, common to all DBLKs
pub const MTF_CONTINUATION: u32 = 0x0000_0001;
pub const MTF_COMPRESSION: u32 = 0x0000_0004;
pub const MTF_EOS_AT_EOM: u32 = 0x0000_0008;
// TAPE only
pub const MTF_SET_MAP_EXISTS: u32 = 0x0001_0000;
pub const MTF_FDD_ALLOWED: u32 = 0x0002_0000;
// SSET only
pub const MTF_FDD_EXISTS: u32 = 0x0001_0000;
pub const MTF_ENCRYPTION: u32 = 0x0002_0000;
// ESET only
pub const MTF_FDD_ABORTED: u32 = 0x0001_0000;
pub const MTF_END_OF_FAMILY: u32 = 0x0002_0000;
pub const MTF_ABORTED_SET: u32 = 0x0004_0000;
// EOTM only
pub const MTF_NO_ESET_PBA: u32 = 0x0001_0000;
pub const MTF_INVALID_ESET_PBA: u32 = 0x0002_0000;

// SSET attributes
pub const SSET_TRANSFER_BIT: u32 = 0x0001;
pub const SSET_COPY_BIT: u32 = 0x0002;
pub const SSET_NORMAL_BIT: u32 = 0x0004;
pub const SSET_DIFFERENTIAL_BIT: u32 = 0x0008;
pub const SSET_INCREMENTAL_BIT: u32 = 0x0010;
pub const SSET_DAILY_BIT: u32 = 0x0020;

// VOLB attributes
pub const VOLB_NO_REDIRECT_RESTORE_BIT: u32 = 0x0001;
pub const VOLB_NON_VOLUME_BIT: u32 = 0x0002;
pub const VOLB_DEV_DRIVE_BIT: u32 = 0x0004;
pub const VOLB_DEV_UNC_BIT: u32 = 0x0008;
pub const VOLB_DEV_OS_SPEC_BIT: u32 = 0x0010;
pub const VOLB_DEV_VEND_SPEC_BIT: u32 = 0x0020;

// DIRB attributes
pub const DIRB_READ_ONLY_BIT: u32 = 0x0000_0100;
pub const DIRB_HIDDEN_BIT: u32 = 0x0000_0200;
pub const DIRB_SYSTEM_BIT: u32 = 0x0000_0400;
pub const DIRB_MODIFIED_BIT: u32 = 0x0000_0800;
pub const DIRB_EMPTY_BIT: u32 = 0x0001_0000;
pub const DIRB_PATH_IN_STREAM_BIT: u32 = 0x0002_0000;
pub const DIRB_CORRUPT_BIT: u32 = 0x0004_0000;

// FILE attributes
pub const FILE_READ_ONLY_BIT: u32 = 0x0000_0100;
pub const FILE_HIDDEN_BIT: u32 = 0x0000_0200;
pub const FILE_SYSTEM_BIT: u32 = 0x0000_0400;
pub const FILE_MODIFIED_BIT: u32 = 0x0000_0800;
pub const FILE_IN_USE_BIT: u32 = 0x0001_0000;
pub const FILE_NAME_IN_STREAM_BIT: u32 = 0x0002_0000;
pub const FILE_CORRUPT_BIT: u32 = 0x0004_0000;

// CFIL attributes
pub const CFIL_LENGTH_CHANGE_BIT: u32 = 0x0001_0000;
pub const CFIL_UNREADABLE_BLK_BIT: u32 = 0x0002_0000;
pub const CFIL_DEADLOCK_BIT: u32 = 0x0004_0000;

// OS identifiers (Appendix C)
pub const OS_NETWARE: u8 = 1;
pub const OS_NETWARE_SMS: u8 = 13;
pub const OS_WINDOWS_NT: u8 = 14;
pub const OS_DOS_WINDOWS_3X: u8 = 24;
pub const OS_OS2: u8 = 25;
pub const OS_WINDOWS_95: u8 = 26;
pub const OS_MACINTOSH: u8 = 27;
pub const OS_UNIX: u8 = 28;

/// Decoding knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DecodeOptions {
    /// Reject blocks whose header checksum does not match instead of only
    /// logging the mismatch.
    pub strict_checksums: bool,
    /// Stream payloads up to this many bytes are kept in memory; larger ones
    /// are only located.
    pub retain_payload_limit: u64,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            strict_checksums: false,
            retain_payload_limit: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum BlockType {
    TapeHeader,
    StartOfDataSet,
    EndOfDataSet,
    Volume,
    Directory,
    File,
    Database,
    CorruptObject,
    EndOfPadSet,
    SoftFilemark,
    EndOfTapeMarker,
    Unknown(u32),
}

impl BlockType {
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            MTF_TAPE => BlockType::TapeHeader,
            MTF_SSET => BlockType::StartOfDataSet,
            MTF_ESET => BlockType::EndOfDataSet,
            MTF_VOLB => BlockType::Volume,
            MTF_DIRB => BlockType::Directory,
            MTF_FILE => BlockType::File,
            MTF_DBDB => BlockType::Database,
            MTF_CFIL => BlockType::CorruptObject,
            MTF_ESPB => BlockType::EndOfPadSet,
            MTF_SFMB => BlockType::SoftFilemark,
            MTF_EOTM => BlockType::EndOfTapeMarker,
            other => BlockType::Unknown(other),
        }
    }
}

/// Render a type tag the way it appears on tape ("TAPE", "SSET", ...).
pub fn tag_to_string(tag: u32) -> String {
    tag.to_le_bytes()
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// MTF_DB_HDR
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlockHeader {
    pub tag: u32,
    pub attributes: u32,
    pub offset_to_first_event: u16,
    pub os_id: u8,
    pub os_version: u8,
    pub displayable_size: u64,
    pub format_logical_address: u64,
    pub reserved_mbc: u16,
    pub control_block_id: u32,
    pub os_data_address: TapeAddress,
    pub string_encoding: StringEncoding,
    pub header_checksum: u16,
    pub checksum_valid: bool,
}

impl BlockHeader {
    /// Parse the 52-byte common header.
    pub fn from_bytes(raw: &[u8; COMMON_HEADER_SIZE as usize]) -> Result<Self> {
        let mut c = Cursor::new(&raw[..]);

        let tag = c.read_u32::<LittleEndian>()?;
        let attributes = c.read_u32::<LittleEndian>()?;
        let offset_to_first_event = c.read_u16::<LittleEndian>()?;
        let os_id = c.read_u8()?;
        let os_version = c.read_u8()?;
        let displayable_size = c.read_u64::<LittleEndian>()?;
        let format_logical_address = c.read_u64::<LittleEndian>()?;
        let reserved_mbc = c.read_u16::<LittleEndian>()?;
        let mut reserved = [0u8; 6];
        c.read_exact(&mut reserved)?;
        let control_block_id = c.read_u32::<LittleEndian>()?;
        let _reserved = c.read_u32::<LittleEndian>()?;
        let os_data_address = TapeAddress {
            size: c.read_u16::<LittleEndian>()?,
            offset: c.read_u16::<LittleEndian>()?,
        };
        let raw_encoding = c.read_u8()?;
        let _reserved = c.read_u8()?;
        let header_checksum = c.read_u16::<LittleEndian>()?;

        let string_encoding = StringEncoding::from_raw(raw_encoding).unwrap_or_else(|| {
            warn!(
                "Unknown string type {} in '{}' block, strings will be read as single byte.",
                raw_encoding,
                tag_to_string(tag)
            );
            StringEncoding::None
        });

        Ok(Self {
            tag,
            attributes,
            offset_to_first_event,
            os_id,
            os_version,
            displayable_size,
            format_logical_address,
            reserved_mbc,
            control_block_id,
            os_data_address,
            string_encoding,
            header_checksum,
            checksum_valid: header_checksum == header_checksum_of(raw),
        })
    }
}

/// XOR of the 16-bit words preceding the checksum field.
pub fn header_checksum_of(raw: &[u8]) -> u16 {
    raw.chunks_exact(2)
        .take(CHECKSUM_WORDS)
        .fold(0u16, |acc, w| acc ^ u16::from_le_bytes([w[0], w[1]]))
}

/// MTF_TAPE
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TapeHeader {
    pub media_family_id: u32,
    pub tape_attributes: u32,
    pub media_sequence_number: u16,
    pub password_encryption_algorithm: u16,
    pub soft_filemark_block_size: u16,
    pub media_based_catalog_type: u16,
    pub media_name: String,
    pub media_description: String,
    pub media_password: String,
    pub software_name: String,
    pub format_logical_block_size: u16,
    pub software_vendor_id: u16,
    pub media_date: Option<NaiveDateTime>,
    pub mtf_major_version: u8,
}

/// MTF_SSET
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StartOfDataSet {
    pub attributes: u32,
    pub password_encryption_algorithm: u16,
    pub software_compression_algorithm: u16,
    pub software_vendor_id: u16,
    pub data_set_number: u16,
    pub data_set_name: String,
    pub data_set_description: String,
    pub data_set_password: String,
    pub user_name: String,
    pub physical_block_address: u64,
    pub media_write_date: Option<NaiveDateTime>,
    pub software_major_version: u8,
    pub software_minor_version: u8,
    pub time_zone: i8,
    pub mtf_minor_version: u8,
    pub media_catalog_version: u8,
}

/// MTF_ESET
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndOfDataSet {
    pub attributes: u32,
    pub number_of_corrupt_files: u32,
    pub reserved_mbc1: u64,
    pub reserved_mbc2: u64,
    pub fdd_media_sequence_number: u16,
    pub data_set_number: u16,
    pub media_write_date: Option<NaiveDateTime>,
}

/// MTF_VOLB
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Volume {
    pub attributes: u32,
    pub device_name: String,
    pub volume_name: String,
    pub machine_name: String,
    pub media_write_date: Option<NaiveDateTime>,
}

/// MTF_DIRB. The name uses NUL as path separator and ends with one.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Directory {
    pub attributes: u32,
    pub last_modification_date: Option<NaiveDateTime>,
    pub creation_date: Option<NaiveDateTime>,
    pub backup_date: Option<NaiveDateTime>,
    pub last_access_date: Option<NaiveDateTime>,
    pub directory_id: u32,
    pub name: String,
}

/// MTF_FILE
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {
    pub attributes: u32,
    pub last_modification_date: Option<NaiveDateTime>,
    pub creation_date: Option<NaiveDateTime>,
    pub backup_date: Option<NaiveDateTime>,
    pub last_access_date: Option<NaiveDateTime>,
    pub directory_id: u32,
    pub file_id: u32,
    pub name: String,
}

/// MTF_CFIL
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorruptObject {
    pub attributes: u32,
    pub stream_offset: u64,
    pub corrupt_stream_number: u16,
}

/// MTF_EOTM
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndOfTapeMarker {
    pub last_eset_pba: u64,
}

/// MTF_SFMB
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SoftFilemark {
    pub number_of_filemark_entries: u32,
    pub filemark_entries_used: u32,
    pub previous_filemark_pbas: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum BlockBody {
    TapeHeader(TapeHeader),
    StartOfDataSet(StartOfDataSet),
    EndOfDataSet(EndOfDataSet),
    Volume(Volume),
    Directory(Directory),
    File(File),
    /// Database payloads are not decoded.
    Database,
    CorruptObject(CorruptObject),
    EndOfPadSet,
    SoftFilemark(SoftFilemark),
    EndOfTapeMarker(EndOfTapeMarker),
    /// Vendor specific or future block kind; only header and streams are known.
    Unhandled { tag: u32 },
}

/// OS specific extension of a DBLK, selected by (OS id, OS version, block type).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum OsSpecificData {
    None,
    NtDirectory { attributes: u32 },
    NtFile {
        attributes: u32,
        short_name: Option<String>,
    },
    Win95 { attributes: u32 },
    Raw {
        os_id: u8,
        os_version: u8,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DescriptorBlock {
    /// Absolute offset of the block in the source.
    pub start: u64,
    pub header: BlockHeader,
    pub body: BlockBody,
    pub os_data: OsSpecificData,
    pub streams: Vec<DataStream>,
}

impl DescriptorBlock {
    pub fn block_type(&self) -> BlockType {
        BlockType::from_tag(self.header.tag)
    }

    pub fn encoding(&self) -> StringEncoding {
        self.header.string_encoding
    }

    pub fn streams_with_id<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a DataStream> {
        self.streams.iter().filter(move |s| s.id == id)
    }

    /// Convert the block to a human-readable table string.
    pub fn to_string(&self) -> String {
        let h = &self.header;
        let mut out = String::new();

        let mut hdr = Table::new();
        hdr.add_row(row!["Descriptor Block Header"]);
        hdr.add_row(row![b -> "Type", tag_to_string(h.tag)]);
        hdr.add_row(row![b -> "Offset", format!("0x{:X}", self.start)]);
        hdr.add_row(row![b -> "Attributes", format!("0x{:08X}", h.attributes)]);
        hdr.add_row(row![b -> "OS", format!("{} (version {})", os_name(h.os_id), h.os_version)]);
        hdr.add_row(row![b -> "Displayable size", h.displayable_size]);
        hdr.add_row(row![b -> "Control block", h.control_block_id]);
        hdr.add_row(row![b -> "String type", format!("{:?}", h.string_encoding)]);
        hdr.add_row(row![
            b -> "Header checksum",
            format!("0x{:04X} ({})", h.header_checksum, if h.checksum_valid { "valid" } else { "MISMATCH" })
        ]);
        out.push_str(&hdr.to_string());

        let fields = self.body_rows();
        if !fields.is_empty() {
            let mut t = Table::new();
            t.add_row(row![format!("{:?}", self.block_type())]);
            for (k, v) in fields {
                t.add_row(row![b -> k, v]);
            }
            out.push('\n');
            out.push_str(&t.to_string());
        }

        if !self.streams.is_empty() {
            let mut t = Table::new();
            t.add_row(row!["Stream", "Length", "Media attr.", "File system attr."]);
            for s in &self.streams {
                t.add_row(row![
                    s.id,
                    s.length,
                    decode_media_attributes(s.media_attributes).join(" | "),
                    decode_fs_attributes(s.fs_attributes).join(" | ")
                ]);
            }
            out.push('\n');
            out.push_str(&t.to_string());
        }
        out
    }

    fn body_rows(&self) -> Vec<(&'static str, String)> {
        match &self.body {
            BlockBody::TapeHeader(t) => vec![
                ("Media family ID", t.media_family_id.to_string()),
                ("Media name", t.media_name.clone()),
                ("Media description", t.media_description.clone()),
                ("Media password", t.media_password.clone()),
                ("Media date", fmt_date(t.media_date)),
                ("Software", t.software_name.clone()),
                ("Vendor ID", t.software_vendor_id.to_string()),
                ("Block size", t.format_logical_block_size.to_string()),
                ("Filemark block size", t.soft_filemark_block_size.to_string()),
                ("Encryption alg.", t.password_encryption_algorithm.to_string()),
                ("MTF major version", t.mtf_major_version.to_string()),
            ],
            BlockBody::StartOfDataSet(s) => vec![
                ("Attributes", format!("0x{:08X}", s.attributes)),
                ("Dataset number", s.data_set_number.to_string()),
                ("Dataset name", s.data_set_name.clone()),
                ("Dataset description", s.data_set_description.clone()),
                ("Dataset password", s.data_set_password.clone()),
                ("User", s.user_name.clone()),
                ("Physical block address", s.physical_block_address.to_string()),
                ("Media write date", fmt_date(s.media_write_date)),
                ("Media catalog version", s.media_catalog_version.to_string()),
                ("Encryption alg.", s.password_encryption_algorithm.to_string()),
                ("Compression alg.", s.software_compression_algorithm.to_string()),
            ],
            BlockBody::EndOfDataSet(e) => vec![
                ("Attributes", format!("0x{:08X}", e.attributes)),
                ("Corrupt files", e.number_of_corrupt_files.to_string()),
                ("Dataset number", e.data_set_number.to_string()),
                ("Media write date", fmt_date(e.media_write_date)),
            ],
            BlockBody::Volume(v) => vec![
                ("Volume name", v.volume_name.clone()),
                ("Machine name", v.machine_name.clone()),
                ("Device name", v.device_name.clone()),
                ("Attributes", format!("0x{:08X}", v.attributes)),
                ("Write date", fmt_date(v.media_write_date)),
            ],
            BlockBody::Directory(d) => vec![
                ("Directory name", d.name.replace('\0', "\\")),
                ("Attributes", format!("0x{:08X}", d.attributes)),
                ("Directory ID", d.directory_id.to_string()),
                ("Creation date", fmt_date(d.creation_date)),
                ("Backup date", fmt_date(d.backup_date)),
                ("Last access date", fmt_date(d.last_access_date)),
                ("Last modification date", fmt_date(d.last_modification_date)),
            ],
            BlockBody::File(f) => vec![
                ("File name", f.name.clone()),
                ("Attributes", format!("0x{:08X}", f.attributes)),
                ("File ID", f.file_id.to_string()),
                ("Directory ID", f.directory_id.to_string()),
                ("Creation date", fmt_date(f.creation_date)),
                ("Backup date", fmt_date(f.backup_date)),
                ("Last access date", fmt_date(f.last_access_date)),
                ("Last modification date", fmt_date(f.last_modification_date)),
            ],
            BlockBody::CorruptObject(c) => vec![
                ("Attributes", format!("0x{:08X}", c.attributes)),
                ("Corrupted stream number", c.corrupt_stream_number.to_string()),
                ("Offset", c.stream_offset.to_string()),
            ],
            BlockBody::SoftFilemark(s) => vec![
                ("Number of entries", s.number_of_filemark_entries.to_string()),
                ("Entries used", s.filemark_entries_used.to_string()),
            ],
            BlockBody::EndOfTapeMarker(e) => {
                vec![("Last ESET PBA", e.last_eset_pba.to_string())]
            }
            BlockBody::Database | BlockBody::EndOfPadSet | BlockBody::Unhandled { .. } => {
                Vec::new()
            }
        }
    }

    /// Serialize to JSON (uses `serde`).
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

fn fmt_date(date: Option<NaiveDateTime>) -> String {
    date.map(|d| d.to_string()).unwrap_or_else(|| "-".into())
}

pub fn os_name(os_id: u8) -> String {
    match os_id {
        OS_NETWARE => "NetWare".into(),
        OS_NETWARE_SMS => "NetWare SMS".into(),
        OS_WINDOWS_NT => "Windows NT".into(),
        OS_DOS_WINDOWS_3X => "DOS/Windows 3.x".into(),
        OS_OS2 => "OS/2".into(),
        OS_WINDOWS_95 => "Windows 95".into(),
        OS_MACINTOSH => "Macintosh".into(),
        OS_UNIX => "UNIX".into(),
        128..=255 => format!("Vendor specific ({})", os_id),
        other => format!("Unknown ({})", other),
    }
}

/// Decode the descriptor block that starts at the cursor position, together
/// with its OS specific data and trailing streams.
pub fn decode_block<T: Read + Seek>(
    cursor: &mut ByteCursor<T>,
    options: &DecodeOptions,
) -> Result<DescriptorBlock> {
    let start = cursor.position();
    if cursor.remaining_len() < COMMON_HEADER_SIZE {
        return Err(MtfError::TruncatedBlock { offset: start });
    }
    let raw = cursor.read_array::<{ COMMON_HEADER_SIZE as usize }>()?;
    let header = BlockHeader::from_bytes(&raw)?;
    let block_type = BlockType::from_tag(header.tag);

    if !header.checksum_valid {
        if options.strict_checksums {
            return Err(MtfError::CorruptBlock {
                offset: start,
                reason: format!(
                    "header checksum 0x{:04X} does not match 0x{:04X}",
                    header.header_checksum,
                    header_checksum_of(&raw)
                ),
            });
        }
        warn!(
            "Header checksum mismatch in '{}' block at 0x{:X}.",
            tag_to_string(header.tag),
            start
        );
    }

    let body = read_body(cursor, start, block_type, header.string_encoding)
        .map_err(|e| e.mid_block(start))?;
    let os_data = read_os_data(cursor, start, &header, block_type);

    let streams = match block_type {
        // The PBA array runs up to the end of the logical block, no streams follow.
        BlockType::SoftFilemark => Vec::new(),
        _ => read_streams(cursor, start, &header, options)?,
    };

    debug!(
        "Decoded '{}' block at 0x{:X} with {} stream(s), next at 0x{:X}",
        tag_to_string(header.tag),
        start,
        streams.len(),
        cursor.position()
    );

    Ok(DescriptorBlock {
        start,
        header,
        body,
        os_data,
        streams,
    })
}

fn read_body<T: Read + Seek>(
    c: &mut ByteCursor<T>,
    start: u64,
    block_type: BlockType,
    enc: StringEncoding,
) -> Result<BlockBody> {
    Ok(match block_type {
        BlockType::TapeHeader => BlockBody::TapeHeader(TapeHeader {
            media_family_id: c.read_u32()?,
            tape_attributes: c.read_u32()?,
            media_sequence_number: c.read_u16()?,
            password_encryption_algorithm: c.read_u16()?,
            soft_filemark_block_size: c.read_u16()?,
            media_based_catalog_type: c.read_u16()?,
            media_name: c.read_tape_string(start, enc)?,
            media_description: c.read_tape_string(start, enc)?,
            media_password: c.read_tape_string(start, enc)?,
            software_name: c.read_tape_string(start, enc)?,
            format_logical_block_size: c.read_u16()?,
            software_vendor_id: c.read_u16()?,
            media_date: c.read_date()?,
            mtf_major_version: c.read_u8()?,
        }),
        BlockType::StartOfDataSet => BlockBody::StartOfDataSet(StartOfDataSet {
            attributes: c.read_u32()?,
            password_encryption_algorithm: c.read_u16()?,
            software_compression_algorithm: c.read_u16()?,
            software_vendor_id: c.read_u16()?,
            data_set_number: c.read_u16()?,
            data_set_name: c.read_tape_string(start, enc)?,
            data_set_description: c.read_tape_string(start, enc)?,
            data_set_password: c.read_tape_string(start, enc)?,
            user_name: c.read_tape_string(start, enc)?,
            physical_block_address: c.read_u64()?,
            media_write_date: c.read_date()?,
            software_major_version: c.read_u8()?,
            software_minor_version: c.read_u8()?,
            time_zone: c.read_i8()?,
            mtf_minor_version: c.read_u8()?,
            media_catalog_version: c.read_u8()?,
        }),
        BlockType::EndOfDataSet => BlockBody::EndOfDataSet(EndOfDataSet {
            attributes: c.read_u32()?,
            number_of_corrupt_files: c.read_u32()?,
            reserved_mbc1: c.read_u64()?,
            reserved_mbc2: c.read_u64()?,
            fdd_media_sequence_number: c.read_u16()?,
            data_set_number: c.read_u16()?,
            media_write_date: c.read_date()?,
        }),
        BlockType::Volume => BlockBody::Volume(Volume {
            attributes: c.read_u32()?,
            device_name: c.read_tape_string(start, enc)?,
            volume_name: c.read_tape_string(start, enc)?,
            machine_name: c.read_tape_string(start, enc)?,
            media_write_date: c.read_date()?,
        }),
        BlockType::Directory => BlockBody::Directory(Directory {
            attributes: c.read_u32()?,
            last_modification_date: c.read_date()?,
            creation_date: c.read_date()?,
            backup_date: c.read_date()?,
            last_access_date: c.read_date()?,
            directory_id: c.read_u32()?,
            name: c.read_tape_string(start, enc)?,
        }),
        BlockType::File => BlockBody::File(File {
            attributes: c.read_u32()?,
            last_modification_date: c.read_date()?,
            creation_date: c.read_date()?,
            backup_date: c.read_date()?,
            last_access_date: c.read_date()?,
            directory_id: c.read_u32()?,
            file_id: c.read_u32()?,
            name: c.read_tape_string(start, enc)?,
        }),
        BlockType::CorruptObject => {
            let attributes = c.read_u32()?;
            let _reserved = c.read_u64()?;
            BlockBody::CorruptObject(CorruptObject {
                attributes,
                stream_offset: c.read_u64()?,
                corrupt_stream_number: c.read_u16()?,
            })
        }
        BlockType::EndOfTapeMarker => BlockBody::EndOfTapeMarker(EndOfTapeMarker {
            last_eset_pba: c.read_u64()?,
        }),
        BlockType::SoftFilemark => {
            let number_of_filemark_entries = c.read_u32()?;
            let filemark_entries_used = c.read_u32()?;
            let mut previous_filemark_pbas = Vec::new();
            for i in 0..number_of_filemark_entries {
                let pba = c.read_u32()?;
                if i < filemark_entries_used {
                    previous_filemark_pbas.push(pba);
                }
            }
            BlockBody::SoftFilemark(SoftFilemark {
                number_of_filemark_entries,
                filemark_entries_used,
                previous_filemark_pbas,
            })
        }
        BlockType::Database => BlockBody::Database,
        BlockType::EndOfPadSet => BlockBody::EndOfPadSet,
        BlockType::Unknown(tag) => {
            debug!(
                "Unhandled block type '{}' at 0x{:X}, decoding header and streams only.",
                tag_to_string(tag),
                start
            );
            BlockBody::Unhandled { tag }
        }
    })
}

/// Look up the OS specific record layout. A record that can not be read is
/// reported and dropped; it never invalidates the block.
fn read_os_data<T: Read + Seek>(
    c: &mut ByteCursor<T>,
    start: u64,
    header: &BlockHeader,
    block_type: BlockType,
) -> OsSpecificData {
    let addr = header.os_data_address;
    if addr.size == 0 {
        return OsSpecificData::None;
    }
    let raw = match c.read_bytes_at(start + addr.offset as u64, addr.size as u64) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("OS specific data of block at 0x{:X} is unreadable: {}", start, e);
            return OsSpecificData::None;
        }
    };
    let word = |at: usize| -> Option<u32> {
        raw.get(at..at + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    };

    match (header.os_id, header.os_version, block_type) {
        (OS_WINDOWS_NT, 0 | 1, BlockType::Directory) if raw.len() >= 4 => {
            OsSpecificData::NtDirectory {
                attributes: word(0).unwrap_or_default(),
            }
        }
        (OS_WINDOWS_NT, 0 | 1, BlockType::File) if raw.len() >= 4 => {
            let short_name = raw.get(4..8).and_then(|b| {
                let size = u16::from_le_bytes([b[0], b[1]]) as u64;
                let offset = u16::from_le_bytes([b[2], b[3]]) as u64;
                if size == 0 {
                    return None;
                }
                c.read_bytes_at(start + offset, size)
                    .ok()
                    .map(|bytes| decode_string(&bytes, header.string_encoding))
            });
            OsSpecificData::NtFile {
                attributes: word(0).unwrap_or_default(),
                short_name,
            }
        }
        (OS_WINDOWS_NT, 0 | 1, BlockType::Volume) => OsSpecificData::None,
        (OS_WINDOWS_95, 0, BlockType::Directory | BlockType::File) if raw.len() >= 4 => {
            OsSpecificData::Win95 {
                attributes: word(0).unwrap_or_default(),
            }
        }
        (os_id, os_version, _) => OsSpecificData::Raw {
            os_id,
            os_version,
            bytes: raw,
        },
    }
}

fn read_streams<T: Read + Seek>(
    cursor: &mut ByteCursor<T>,
    start: u64,
    header: &BlockHeader,
    options: &DecodeOptions,
) -> Result<Vec<DataStream>> {
    if (header.offset_to_first_event as u64) < COMMON_HEADER_SIZE {
        return Err(MtfError::CorruptBlock {
            offset: start,
            reason: format!(
                "offset to first event ({}) points inside the block header",
                header.offset_to_first_event
            ),
        });
    }
    // First stream sits on the next 4-byte boundary.
    let first = (start + header.offset_to_first_event as u64).div_ceil(4) * 4;
    if first < cursor.position() {
        return Err(MtfError::CorruptBlock {
            offset: start,
            reason: format!(
                "offset to first event ({}) points inside the block fields ending at 0x{:X}",
                header.offset_to_first_event,
                cursor.position()
            ),
        });
    }
    cursor.seek(first)?;

    let mut streams = Vec::new();
    while let Some(stream) = read_stream(cursor, options.retain_payload_limit)? {
        let last = stream.id == STREAM_PAD;
        streams.push(stream);
        if last {
            break;
        }
    }
    Ok(streams)
}
