//! Flat catalog of a backup image: one pass over the descriptor blocks, turned
//! into Root/Set/Volume/Folder/File/Database nodes in tape order.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{Read, Seek};
use std::path::PathBuf;
use std::sync::Arc;

use crate::cursor::{ByteCursor, decode_string};
use crate::dblk::{
    BlockBody, BlockType, DIRB_PATH_IN_STREAM_BIT, DecodeOptions, DescriptorBlock,
    FILE_NAME_IN_STREAM_BIT, decode_block,
};
use crate::error::{MtfError, Result};
use crate::stream::{STREAM_FILE_NAME, STREAM_PATH_NAME};

pub const DATABASE_PLACEHOLDER: &str = "Database - not yet implemented";

/// Node kinds ordered by depth in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum NodeType {
    Root = 0,
    Set = 1,
    Volume = 2,
    Folder = 3,
    File = 4,
    Database = 5,
}

impl NodeType {
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn from_rank(rank: i32) -> Option<Self> {
        match rank {
            0 => Some(NodeType::Root),
            1 => Some(NodeType::Set),
            2 => Some(NodeType::Volume),
            3 => Some(NodeType::Folder),
            4 => Some(NodeType::File),
            5 => Some(NodeType::Database),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogNode {
    /// Raw name; folder paths keep the NUL separators of the tape.
    pub name: String,
    pub node_type: NodeType,
    /// Offset of the descriptor block the node comes from.
    pub offset: u64,
    /// Decoded block, absent for nodes loaded from an index.
    #[serde(skip)]
    pub block: Option<Arc<DescriptorBlock>>,
}

/// Nodes are equal when their type, name and offset are; the attached block is
/// not compared.
impl PartialEq for CatalogNode {
    fn eq(&self, other: &Self) -> bool {
        self.node_type == other.node_type && self.name == other.name && self.offset == other.offset
    }
}

impl Eq for CatalogNode {}

impl CatalogNode {
    pub fn new(
        name: impl Into<String>,
        node_type: NodeType,
        offset: u64,
        block: Option<Arc<DescriptorBlock>>,
    ) -> Self {
        Self {
            name: name.into(),
            node_type,
            offset,
            block,
        }
    }

    pub fn rank(&self) -> u8 {
        self.node_type.rank()
    }

    pub fn display_name(&self) -> String {
        self.name.replace('\0', "\\")
    }

    /// Host path for the node name. Empty, `.` and `..` components and a leading
    /// drive (`C:`) are dropped so the result always stays below the directory it
    /// is joined to. Colons left inside a component become `_`.
    pub fn relative_path(&self) -> PathBuf {
        self.name
            .split(['\0', '\\', '/'])
            .enumerate()
            .filter(|(i, c)| !(*i == 0 && is_drive(c)))
            .map(|(_, c)| c)
            .filter(|c| !c.is_empty() && *c != "." && *c != "..")
            .map(|c| c.replace(':', "_"))
            .collect()
    }

    pub fn to_json(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        value["display_name"] = json!(self.display_name());
        value
    }
}

/// Lazily decodes consecutive descriptor blocks.
///
/// Iteration ends when fewer than 4 bytes remain or the next type tag is zero
/// (unused space at the end of the media). The first decode error is yielded and
/// ends the iteration.
pub struct BlockReader<'a, T: Read + Seek> {
    cursor: &'a mut ByteCursor<T>,
    options: &'a DecodeOptions,
    done: bool,
}

impl<'a, T: Read + Seek> BlockReader<'a, T> {
    pub fn new(cursor: &'a mut ByteCursor<T>, options: &'a DecodeOptions) -> Self {
        Self {
            cursor,
            options,
            done: false,
        }
    }

    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    pub fn total_len(&self) -> u64 {
        self.cursor.len()
    }
}

impl<T: Read + Seek> Iterator for BlockReader<'_, T> {
    type Item = Result<DescriptorBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cursor.remaining_len() < 4 {
            self.done = true;
            return None;
        }
        let tag = match self.cursor.peek_u32() {
            Ok(tag) => tag,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if tag == 0 {
            debug!(
                "Zero block tag at 0x{:X}, treating the rest as unused media.",
                self.cursor.position()
            );
            self.done = true;
            return None;
        }
        let block = decode_block(self.cursor, self.options);
        if block.is_err() {
            self.done = true;
        }
        Some(block)
    }
}

fn is_drive(component: &str) -> bool {
    let b = component.as_bytes();
    b.len() == 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

fn strip_name(name: &str) -> String {
    name.trim_end_matches('\0').to_string()
}

/// Names carried by a DIRB or FILE block. With the name-in-stream bit set every
/// stream with `stream_id` contributes one name and the embedded field is ignored,
/// even when no such stream exists.
pub fn resolve_names(
    block: &DescriptorBlock,
    in_stream: bool,
    stream_id: &str,
    embedded: &str,
) -> Vec<String> {
    if !in_stream {
        return vec![strip_name(embedded)];
    }
    let mut names = Vec::new();
    for s in block.streams_with_id(stream_id) {
        match &s.data {
            Some(raw) => names.push(strip_name(&decode_string(raw, block.encoding()))),
            None => warn!(
                "'{}' name stream at 0x{:X} is {} bytes long and was not kept, ignoring it.",
                stream_id, s.data_offset, s.length
            ),
        }
    }
    if names.is_empty() {
        warn!(
            "Block at 0x{:X} keeps its name in '{}' streams but has none, it adds no node.",
            block.start, stream_id
        );
    }
    names
}

/// Forget every retained payload except the name streams. File contents are
/// copied from the source through `data_offset` when extracted.
fn release_content_payloads(block: &mut DescriptorBlock) {
    for s in block.streams.iter_mut() {
        if s.id != STREAM_PATH_NAME && s.id != STREAM_FILE_NAME {
            s.data = None;
        }
    }
}

/// Catalog nodes contributed by one block.
pub fn expand_block(block: &Arc<DescriptorBlock>) -> Vec<CatalogNode> {
    let node = |name: String, node_type| {
        CatalogNode::new(name, node_type, block.start, Some(Arc::clone(block)))
    };
    match &block.body {
        BlockBody::StartOfDataSet(s) => vec![node(
            format!("Set: {} - {}", s.data_set_number, s.data_set_name),
            NodeType::Set,
        )],
        BlockBody::Volume(v) => vec![node(v.device_name.clone(), NodeType::Volume)],
        BlockBody::Directory(d) => resolve_names(
            block,
            d.attributes & DIRB_PATH_IN_STREAM_BIT != 0,
            STREAM_PATH_NAME,
            &d.name,
        )
        .into_iter()
        .map(|name| node(name, NodeType::Folder))
        .collect(),
        BlockBody::File(f) => resolve_names(
            block,
            f.attributes & FILE_NAME_IN_STREAM_BIT != 0,
            STREAM_FILE_NAME,
            &f.name,
        )
        .into_iter()
        .map(|name| node(name, NodeType::File))
        .collect(),
        BlockBody::Database => vec![node(DATABASE_PLACEHOLDER.to_string(), NodeType::Database)],
        BlockBody::TapeHeader(_) => {
            warn!(
                "Additional TAPE block at 0x{:X}, it is not added to the catalog.",
                block.start
            );
            Vec::new()
        }
        _ => Vec::new(),
    }
}

/// Build the catalog of the whole source in one forward pass.
///
/// `is_cancelled` is polled before each block and turns the result into
/// `Ok(None)`. `on_progress(total, position)` is called after each block.
pub fn build_catalog<T, P, C>(
    cursor: &mut ByteCursor<T>,
    options: &DecodeOptions,
    mut on_progress: P,
    mut is_cancelled: C,
) -> Result<Option<Vec<CatalogNode>>>
where
    T: Read + Seek,
    P: FnMut(u64, u64),
    C: FnMut() -> bool,
{
    let start = cursor.position();
    let mut reader = BlockReader::new(cursor, options);
    let total = reader.total_len();
    info!("Building catalog over 0x{:X} bytes.", total);

    if is_cancelled() {
        return Ok(None);
    }
    let tape = match reader.next() {
        Some(block) => Arc::new(block?),
        None => return Err(MtfError::TruncatedBlock { offset: start }),
    };
    let media_name = match &tape.body {
        BlockBody::TapeHeader(t) => t.media_name.clone(),
        _ => {
            return Err(MtfError::CorruptBlock {
                offset: tape.start,
                reason: format!(
                    "expected a TAPE block, found {:?}",
                    tape.block_type()
                ),
            });
        }
    };
    let mut nodes = vec![CatalogNode::new(
        media_name,
        NodeType::Root,
        tape.start,
        Some(Arc::clone(&tape)),
    )];
    on_progress(total, reader.position());

    loop {
        if is_cancelled() {
            info!("Catalog build cancelled at 0x{:X}.", reader.position());
            return Ok(None);
        }
        let block = match reader.next() {
            Some(block) => {
                let mut block = block?;
                release_content_payloads(&mut block);
                Arc::new(block)
            }
            None => break,
        };
        if block.block_type() == BlockType::SoftFilemark {
            debug!("Skipping soft filemark at 0x{:X}", block.start);
        } else {
            nodes.extend(expand_block(&block));
        }
        on_progress(total, reader.position());
    }

    info!(
        "Catalog built: {} node(s), stopped at 0x{:X}.",
        nodes.len(),
        reader.position()
    );
    Ok(Some(nodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        cfil, dbdb, dirb_with, eotm, eset, espb, file, file_with, image, sample_image, sfmb, sset, tape,
        volb,
    };
    use std::io::Cursor;
    use std::path::Path;

    fn catalog(bytes: Vec<u8>) -> Result<Option<Vec<CatalogNode>>> {
        let mut c = ByteCursor::new(Cursor::new(bytes)).unwrap();
        build_catalog(&mut c, &DecodeOptions::default(), |_, _| {}, || false)
    }

    fn summary(nodes: &[CatalogNode]) -> Vec<(NodeType, String)> {
        nodes
            .iter()
            .map(|n| (n.node_type, n.name.clone()))
            .collect()
    }

    #[test]
    fn empty_media_is_just_the_root() {
        let nodes = catalog(image(&[tape("Media"), sfmb(), eotm()]))
            .unwrap()
            .unwrap();
        assert_eq!(summary(&nodes), vec![(NodeType::Root, "Media".to_string())]);
        assert_eq!(nodes[0].offset, 0);
    }

    #[test]
    fn single_file_backup() {
        let nodes = catalog(sample_image()).unwrap().unwrap();
        assert_eq!(
            summary(&nodes),
            vec![
                (NodeType::Root, "Media".to_string()),
                (NodeType::Set, "Set: 1 - Daily".to_string()),
                (NodeType::Volume, "C:".to_string()),
                (NodeType::Folder, "Docs".to_string()),
                (NodeType::File, "a.txt".to_string()),
            ]
        );
        assert!(nodes.windows(2).all(|w| w[0].offset <= w[1].offset));
        assert!(nodes.iter().all(|n| n.block.is_some()));
    }

    #[test]
    fn names_in_streams_give_sibling_nodes() {
        let bytes = image(&[
            tape("Media"),
            sset(1, "Daily"),
            volb("C:"),
            dirb_with("unused\0", DIRB_PATH_IN_STREAM_BIT)
                .stream(b"PNAM", b"Photos\0")
                .stream(b"PNAM", b"Videos\0"),
            file_with("", FILE_NAME_IN_STREAM_BIT).stream(b"FNAM", b"clip.mp4\0"),
        ]);
        let nodes = catalog(bytes).unwrap().unwrap();
        assert_eq!(nodes[3].name, "Photos");
        assert_eq!(nodes[4].name, "Videos");
        assert_eq!(nodes[3].node_type, NodeType::Folder);
        assert_eq!(nodes[4].node_type, NodeType::Folder);
        assert!(Arc::ptr_eq(
            nodes[3].block.as_ref().unwrap(),
            nodes[4].block.as_ref().unwrap()
        ));
        assert_eq!(nodes[5].name, "clip.mp4");
    }

    #[test]
    fn database_gets_a_placeholder() {
        let bytes = image(&[tape("Media"), sset(2, "SQL"), volb("C:"), dbdb(), eotm()]);
        let nodes = catalog(bytes).unwrap().unwrap();
        assert_eq!(nodes.last().unwrap().node_type, NodeType::Database);
        assert_eq!(nodes.last().unwrap().name, DATABASE_PLACEHOLDER);
    }

    #[test]
    fn exactly_one_root() {
        let bytes = image(&[tape("Media"), sset(1, "A"), tape("Other"), sset(2, "B")]);
        let nodes = catalog(bytes).unwrap().unwrap();
        assert_eq!(
            nodes.iter().filter(|n| n.node_type == NodeType::Root).count(),
            1
        );
        assert_eq!(nodes[0].node_type, NodeType::Root);
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn first_block_must_be_a_tape_header() {
        match catalog(image(&[sset(1, "Daily"), eotm()])) {
            Err(MtfError::CorruptBlock { offset, .. }) => assert_eq!(offset, 0),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn zero_filled_tail_ends_the_scan() {
        let mut bytes = sample_image();
        let expected = catalog(bytes.clone()).unwrap().unwrap();
        bytes.extend(vec![0u8; 1024]);
        assert_eq!(catalog(bytes).unwrap().unwrap(), expected);
    }

    #[test]
    fn decode_error_aborts_the_build() {
        let mut bytes = sample_image();
        let cut = bytes.len() - 70;
        bytes.truncate(cut);
        assert!(catalog(bytes).is_err());
    }

    #[test]
    fn cancellation_yields_no_catalog() {
        let mut c = ByteCursor::new(Cursor::new(sample_image())).unwrap();
        let mut polls = 0;
        let result = build_catalog(&mut c, &DecodeOptions::default(), |_, _| {}, || {
            polls += 1;
            polls > 3
        })
        .unwrap();
        assert!(result.is_none());
        assert_eq!(polls, 4);
    }

    #[test]
    fn progress_reaches_the_end() {
        let bytes = sample_image();
        let len = bytes.len() as u64;
        let mut c = ByteCursor::new(Cursor::new(bytes)).unwrap();
        let mut seen = Vec::new();
        build_catalog(
            &mut c,
            &DecodeOptions::default(),
            |total, pos| seen.push((total, pos)),
            || false,
        )
        .unwrap()
        .unwrap();
        assert_eq!(seen.len(), 8);
        assert!(seen.windows(2).all(|w| w[0].1 < w[1].1));
        assert_eq!(*seen.last().unwrap(), (len, len));
    }

    #[test]
    fn reader_yields_every_block_in_order() {
        let mut c = ByteCursor::new(Cursor::new(sample_image())).unwrap();
        let options = DecodeOptions::default();
        let types: Vec<BlockType> = BlockReader::new(&mut c, &options)
            .map(|b| b.unwrap().block_type())
            .collect();
        assert_eq!(types.first(), Some(&BlockType::TapeHeader));
        assert_eq!(types.last(), Some(&BlockType::EndOfTapeMarker));
        assert_eq!(types.len(), 8);
    }

    #[test]
    fn relative_path_never_escapes() {
        let node = CatalogNode::new("Docs\0..\0Sub\0", NodeType::Folder, 0, None);
        assert_eq!(node.relative_path(), Path::new("Docs").join("Sub"));
        assert_eq!(node.display_name(), "Docs\\..\\Sub\\");

        let node = CatalogNode::new("C:\\Windows\\.\\win.ini", NodeType::File, 0, None);
        assert_eq!(node.relative_path(), Path::new("Windows").join("win.ini"));

        let node = CatalogNode::new("\0", NodeType::Folder, 0, None);
        assert_eq!(node.relative_path(), PathBuf::new());
    }

    #[test]
    fn relative_path_keeps_colons_past_the_drive() {
        let node = CatalogNode::new("Notes\0todo: monday.txt", NodeType::File, 0, None);
        assert_eq!(
            node.relative_path(),
            Path::new("Notes").join("todo_ monday.txt")
        );
        let node = CatalogNode::new("Logs\0C:\0x.log", NodeType::File, 0, None);
        assert_eq!(node.relative_path(), Path::new("Logs").join("C_").join("x.log"));
    }

    #[test]
    fn name_bit_without_name_streams_adds_no_node() {
        let bytes = image(&[
            tape("Media"),
            sset(1, "Daily"),
            volb("C:"),
            dirb_with("Embedded\0", DIRB_PATH_IN_STREAM_BIT),
            file_with("orphan.txt", FILE_NAME_IN_STREAM_BIT).stream(b"STAN", b"data"),
            eotm(),
        ]);
        let nodes = catalog(bytes).unwrap().unwrap();
        assert_eq!(
            nodes.iter().filter(|n| n.node_type == NodeType::Folder).count(),
            0
        );
        assert_eq!(
            nodes.iter().filter(|n| n.node_type == NodeType::File).count(),
            0
        );
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn catalog_keeps_names_but_not_contents() {
        let content = vec![0x5A; 60_000];
        let bytes = image(&[
            tape("Media"),
            sset(1, "Daily"),
            volb("C:"),
            dirb_with("unused\0", DIRB_PATH_IN_STREAM_BIT).stream(b"PNAM", b"Photos\0"),
            file("big.bin").stream(b"STAN", &content),
            eotm(),
        ]);
        let nodes = catalog(bytes).unwrap().unwrap();
        let held: usize = nodes
            .iter()
            .filter_map(|n| n.block.as_ref())
            .flat_map(|b| b.streams.iter())
            .filter_map(|s| s.data.as_ref().map(Vec::len))
            .sum();
        assert_eq!(held, "Photos\0".len());

        let file = nodes[4].block.as_ref().unwrap();
        let stan = file.streams.iter().find(|s| s.id == "STAN").unwrap();
        assert_eq!(stan.length, 60_000);
        assert!(stan.data.is_none());
    }

    #[test]
    fn node_equality_ignores_the_block() {
        let nodes = catalog(sample_image()).unwrap().unwrap();
        let bare = CatalogNode::new("a.txt", NodeType::File, nodes[4].offset, None);
        assert_eq!(nodes[4], bare);
        assert_eq!(nodes[4].to_json()["display_name"], "a.txt");
    }

    #[test]
    fn bookkeeping_blocks_add_no_nodes() {
        let bytes = image(&[
            tape("Media"),
            sset(1, "Daily"),
            cfil(),
            espb(),
            eset(),
            eotm(),
        ]);
        let nodes = catalog(bytes).unwrap().unwrap();
        assert_eq!(nodes.len(), 2);
    }
}
