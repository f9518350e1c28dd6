//! Builders for small synthetic MTF images used across the unit tests.

use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::cursor::StringEncoding;
use crate::dblk::{COMMON_HEADER_SIZE, header_checksum_of};

/// One stream header, its payload and the padding up to the next 4-byte boundary.
pub(crate) fn stream_bytes(id: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = id.to_vec();
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&[0u8; 6]);
    out.extend_from_slice(payload);
    pad4(&mut out);
    out
}

pub(crate) fn encode_date(date: NaiveDateTime) -> [u8; 5] {
    let v = ((date.year() as u64) << 26)
        | ((date.month() as u64) << 22)
        | ((date.day() as u64) << 17)
        | ((date.hour() as u64) << 12)
        | ((date.minute() as u64) << 6)
        | date.second() as u64;
    let b = v.to_be_bytes();
    [b[3], b[4], b[5], b[6], b[7]]
}

fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn encode_string(s: &str, encoding: StringEncoding) -> Vec<u8> {
    match encoding {
        StringEncoding::Unicode => s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect(),
        _ => s.chars().map(|c| c as u8).collect(),
    }
}

/// Fixed-layout field of a descriptor block body. `Str` is written as a tape
/// address and its characters land in the string area after the fixed fields.
#[derive(Debug, Clone)]
pub(crate) enum Field {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    Date(Option<NaiveDateTime>),
    Str(String),
}

#[derive(Debug, Clone)]
pub(crate) struct BlockBuilder {
    tag: [u8; 4],
    attributes: u32,
    os_id: u8,
    os_version: u8,
    encoding: StringEncoding,
    fields: Vec<Field>,
    os_data: Option<Vec<u8>>,
    os_short_name: Option<String>,
    streams: Vec<([u8; 4], Vec<u8>)>,
    spad: bool,
}

impl BlockBuilder {
    pub(crate) fn new(tag: &[u8; 4]) -> Self {
        Self {
            tag: *tag,
            attributes: 0,
            os_id: 14,
            os_version: 0,
            encoding: StringEncoding::Ansi,
            fields: Vec::new(),
            os_data: None,
            os_short_name: None,
            streams: Vec::new(),
            spad: true,
        }
    }

    pub(crate) fn fields(mut self, fields: Vec<Field>) -> Self {
        self.fields = fields;
        self
    }

    pub(crate) fn encoding(mut self, encoding: StringEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub(crate) fn os(mut self, os_id: u8, os_version: u8) -> Self {
        self.os_id = os_id;
        self.os_version = os_version;
        self
    }

    pub(crate) fn os_data(mut self, raw: Vec<u8>) -> Self {
        self.os_data = Some(raw);
        self
    }

    /// Place a string in the string area and point bytes 4..8 of the OS data at it.
    pub(crate) fn os_short_name(mut self, name: &str) -> Self {
        self.os_short_name = Some(name.to_string());
        self
    }

    /// Set every date field of the body.
    pub(crate) fn date(mut self, date: NaiveDateTime) -> Self {
        for f in self.fields.iter_mut() {
            if let Field::Date(d) = f {
                *d = Some(date);
            }
        }
        self
    }

    pub(crate) fn stream(mut self, id: &[u8; 4], payload: &[u8]) -> Self {
        self.streams.push((*id, payload.to_vec()));
        self
    }

    pub(crate) fn no_spad(mut self) -> Self {
        self.spad = false;
        self
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut block = vec![0u8; COMMON_HEADER_SIZE as usize];
        let mut strings: Vec<(usize, Vec<u8>)> = Vec::new();

        for f in &self.fields {
            match f {
                Field::U8(v) => block.push(*v),
                Field::I8(v) => block.push(*v as u8),
                Field::U16(v) => block.extend_from_slice(&v.to_le_bytes()),
                Field::U32(v) => block.extend_from_slice(&v.to_le_bytes()),
                Field::U64(v) => block.extend_from_slice(&v.to_le_bytes()),
                Field::Date(d) => block.extend_from_slice(&d.map(encode_date).unwrap_or([0; 5])),
                Field::Str(s) => {
                    strings.push((block.len(), encode_string(s, self.encoding)));
                    block.extend_from_slice(&[0; 4]);
                }
            }
        }

        for (at, raw) in strings {
            let offset = block.len() as u16;
            block[at..at + 2].copy_from_slice(&(raw.len() as u16).to_le_bytes());
            block[at + 2..at + 4].copy_from_slice(&offset.to_le_bytes());
            block.extend_from_slice(&raw);
        }

        if let Some(os) = &self.os_data {
            let os_at = block.len();
            block.extend_from_slice(os);
            block[44..46].copy_from_slice(&(os.len() as u16).to_le_bytes());
            block[46..48].copy_from_slice(&(os_at as u16).to_le_bytes());
            if let Some(name) = &self.os_short_name {
                let raw = encode_string(name, self.encoding);
                let name_at = block.len() as u16;
                block[os_at + 4..os_at + 6].copy_from_slice(&(raw.len() as u16).to_le_bytes());
                block[os_at + 6..os_at + 8].copy_from_slice(&name_at.to_le_bytes());
                block.extend_from_slice(&raw);
            }
        }
        pad4(&mut block);

        block[0..4].copy_from_slice(&self.tag);
        block[4..8].copy_from_slice(&self.attributes.to_le_bytes());
        let first_event = block.len() as u16;
        block[8..10].copy_from_slice(&first_event.to_le_bytes());
        block[10] = self.os_id;
        block[11] = self.os_version;
        block[48] = self.encoding as u8;
        let checksum = header_checksum_of(&block[..50]);
        block[50..52].copy_from_slice(&checksum.to_le_bytes());

        for (id, payload) in &self.streams {
            block.extend(stream_bytes(id, payload));
        }
        if self.spad {
            block.extend(stream_bytes(b"SPAD", &[]));
        }
        block
    }
}

pub(crate) fn image(blocks: &[BlockBuilder]) -> Vec<u8> {
    blocks.iter().flat_map(|b| b.build()).collect()
}

pub(crate) fn tape(media_name: &str) -> BlockBuilder {
    BlockBuilder::new(b"TAPE").fields(vec![
        Field::U32(0x1234_5678),
        Field::U32(0),
        Field::U16(1),
        Field::U16(0),
        Field::U16(0),
        Field::U16(1),
        Field::Str(media_name.into()),
        Field::Str(String::new()),
        Field::Str(String::new()),
        Field::Str("exhume".into()),
        Field::U16(1024),
        Field::U16(0),
        Field::Date(None),
        Field::U8(1),
    ])
}

pub(crate) fn sset(number: u16, name: &str) -> BlockBuilder {
    BlockBuilder::new(b"SSET").fields(vec![
        Field::U32(0x0004),
        Field::U16(0),
        Field::U16(0),
        Field::U16(0),
        Field::U16(number),
        Field::Str(name.into()),
        Field::Str(String::new()),
        Field::Str(String::new()),
        Field::Str("operator".into()),
        Field::U64(0),
        Field::Date(None),
        Field::U8(1),
        Field::U8(0),
        Field::I8(0),
        Field::U8(0),
        Field::U8(1),
    ])
}

pub(crate) fn volb(device: &str) -> BlockBuilder {
    BlockBuilder::new(b"VOLB").fields(vec![
        Field::U32(0x0004),
        Field::Str(device.into()),
        Field::Str("DATA".into()),
        Field::Str("WORKSTATION".into()),
        Field::Date(None),
    ])
}

pub(crate) fn dirb(name: &str) -> BlockBuilder {
    dirb_with(name, 0)
}

pub(crate) fn dirb_with(name: &str, attributes: u32) -> BlockBuilder {
    BlockBuilder::new(b"DIRB").fields(vec![
        Field::U32(attributes),
        Field::Date(None),
        Field::Date(None),
        Field::Date(None),
        Field::Date(None),
        Field::U32(0),
        Field::Str(name.into()),
    ])
}

pub(crate) fn file(name: &str) -> BlockBuilder {
    file_with(name, 0)
}

pub(crate) fn file_with(name: &str, attributes: u32) -> BlockBuilder {
    BlockBuilder::new(b"FILE").fields(vec![
        Field::U32(attributes),
        Field::Date(None),
        Field::Date(None),
        Field::Date(None),
        Field::Date(None),
        Field::U32(0),
        Field::U32(0),
        Field::Str(name.into()),
    ])
}

pub(crate) fn cfil() -> BlockBuilder {
    BlockBuilder::new(b"CFIL").fields(vec![
        Field::U32(0x0002_0000),
        Field::U64(0),
        Field::U64(512),
        Field::U16(1),
    ])
}

pub(crate) fn dbdb() -> BlockBuilder {
    BlockBuilder::new(b"DBDB")
}

pub(crate) fn espb() -> BlockBuilder {
    BlockBuilder::new(b"ESPB")
}

pub(crate) fn eset() -> BlockBuilder {
    BlockBuilder::new(b"ESET").fields(vec![
        Field::U32(0),
        Field::U32(0),
        Field::U64(0),
        Field::U64(0),
        Field::U16(0),
        Field::U16(1),
        Field::Date(None),
    ])
}

pub(crate) fn eotm() -> BlockBuilder {
    BlockBuilder::new(b"EOTM").fields(vec![Field::U64(0)])
}

/// Four filemark slots, one in use.
pub(crate) fn sfmb() -> BlockBuilder {
    BlockBuilder::new(b"SFMB")
        .fields(vec![
            Field::U32(4),
            Field::U32(1),
            Field::U32(7),
            Field::U32(0),
            Field::U32(0),
            Field::U32(0),
        ])
        .no_spad()
}

/// TAPE, SFMB, SSET 1 "Daily", VOLB "C:", DIRB "Docs", FILE "a.txt" holding
/// "ABC", ESET, EOTM.
pub(crate) fn sample_image() -> Vec<u8> {
    image(&[
        tape("Media"),
        sfmb(),
        sset(1, "Daily"),
        volb("C:"),
        dirb("Docs\0"),
        file("a.txt").stream(b"STAN", b"ABC"),
        eset(),
        eotm(),
    ])
}
