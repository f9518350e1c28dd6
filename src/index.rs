//! Catalog index files: the (type, name, offset) tree of a catalog saved next to
//! the path of the backup it describes, so a later run can skip the scan.
//!
//! Layout (little-endian): `string backup_path` then the root record. A record is
//! `i32 type`, `string name`, `i64 offset`, `i32 child_count` followed by its
//! children in pre-order. Strings are a u32 count of UTF-16 code units and the
//! units themselves.

use byteorder::{LittleEndian, WriteBytesExt};
use log::{info, warn};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use crate::catalog::{CatalogNode, NodeType};
use crate::cursor::{ByteCursor, StringEncoding};
use crate::error::{MtfError, Result};
use crate::tree::{TreeNode, build_tree};

fn check_catalog(nodes: &[CatalogNode]) -> Result<()> {
    match nodes.first() {
        None => return Err(MtfError::InvalidIndex("catalog is empty".into())),
        Some(n) if n.node_type != NodeType::Root => {
            return Err(MtfError::InvalidIndex(format!(
                "catalog starts with a {:?} node instead of the root",
                n.node_type
            )));
        }
        Some(_) => {}
    }
    if let Some(i) = nodes.iter().skip(1).position(|n| n.node_type == NodeType::Root) {
        return Err(MtfError::InvalidIndex(format!(
            "second root node at index {}",
            i + 1
        )));
    }
    Ok(())
}

fn write_string<W: Write>(out: &mut W, s: &str) -> Result<()> {
    let units: Vec<u16> = s.encode_utf16().collect();
    out.write_u32::<LittleEndian>(units.len() as u32)?;
    for u in units {
        out.write_u16::<LittleEndian>(u)?;
    }
    Ok(())
}

fn write_record<W: Write>(out: &mut W, nodes: &[CatalogNode], t: &TreeNode) -> Result<()> {
    let node = &nodes[t.index];
    let offset = i64::try_from(node.offset).map_err(|_| {
        MtfError::InvalidIndex(format!("offset 0x{:X} does not fit the index", node.offset))
    })?;
    out.write_i32::<LittleEndian>(node.rank() as i32)?;
    write_string(out, &node.name)?;
    out.write_i64::<LittleEndian>(offset)?;
    out.write_i32::<LittleEndian>(t.children.len() as i32)?;
    for c in &t.children {
        write_record(out, nodes, c)?;
    }
    Ok(())
}

/// Serialize `nodes` (a complete catalog) and the backup path to `out`.
pub fn write_index<W: Write>(out: &mut W, backup_path: &str, nodes: &[CatalogNode]) -> Result<()> {
    check_catalog(nodes)?;
    write_string(out, backup_path)?;
    for t in build_tree(nodes) {
        write_record(out, nodes, &t)?;
    }
    Ok(())
}

fn read_record<T: Read + Seek>(c: &mut ByteCursor<T>) -> Result<(CatalogNode, u32)> {
    let at = c.position();
    let raw_type = c.read_u32()? as i32;
    let node_type = NodeType::from_rank(raw_type).ok_or_else(|| {
        MtfError::InvalidIndex(format!("unknown node type {} at 0x{:X}", raw_type, at))
    })?;
    let name = c.read_length_prefixed_string(StringEncoding::Unicode)?;
    let offset = c.read_i64()?;
    let child_count = c.read_u32()? as i32;
    if offset < 0 || child_count < 0 {
        return Err(MtfError::InvalidIndex(format!(
            "negative offset or child count in record at 0x{:X}",
            at
        )));
    }
    Ok((
        CatalogNode::new(name, node_type, offset as u64, None),
        child_count as u32,
    ))
}

fn read_records<T: Read + Seek>(c: &mut ByteCursor<T>) -> Result<(String, Vec<CatalogNode>)> {
    let backup_path = c.read_length_prefixed_string(StringEncoding::Unicode)?;

    // Records still expected at each open level of the tree.
    let mut pending: Vec<u32> = vec![1];
    let mut nodes = Vec::new();
    while let Some(left) = pending.last_mut() {
        if *left == 0 {
            pending.pop();
            continue;
        }
        *left -= 1;
        let (node, child_count) = read_record(c)?;
        nodes.push(node);
        if child_count > 0 {
            pending.push(child_count);
        }
    }
    check_catalog(&nodes)?;

    if c.remaining_len() > 0 {
        warn!(
            "{} trailing bytes after the catalog index are ignored.",
            c.remaining_len()
        );
    }
    Ok((backup_path, nodes))
}

/// Parse an index produced by `write_index`. Loaded nodes carry no block.
pub fn read_index<R: Read + Seek>(source: R) -> Result<(String, Vec<CatalogNode>)> {
    let mut c = ByteCursor::new(source)?;
    read_records(&mut c).map_err(|e| match e {
        MtfError::TruncatedInput { offset, .. } => {
            MtfError::InvalidIndex(format!("index is truncated at 0x{:X}", offset))
        }
        other => other,
    })
}

pub fn save(path: impl AsRef<Path>, backup_path: &str, nodes: &[CatalogNode]) -> Result<()> {
    let path = path.as_ref();
    let mut out = BufWriter::new(File::create(path)?);
    write_index(&mut out, backup_path, nodes)?;
    out.flush()?;
    info!("Saved {} catalog node(s) to {}", nodes.len(), path.display());
    Ok(())
}

pub fn load(path: impl AsRef<Path>) -> Result<(String, Vec<CatalogNode>)> {
    let path = path.as_ref();
    let (backup_path, nodes) = read_index(BufReader::new(File::open(path)?))?;
    info!(
        "Loaded {} catalog node(s) from {} (backup {})",
        nodes.len(),
        path.display(),
        backup_path
    );
    Ok((backup_path, nodes))
}

/// Only the backup path recorded in an index.
pub fn read_backup_path(path: impl AsRef<Path>) -> Result<String> {
    let mut c = ByteCursor::new(BufReader::new(File::open(path.as_ref())?))?;
    c.read_length_prefixed_string(StringEncoding::Unicode)
        .map_err(|e| match e {
            MtfError::TruncatedInput { .. } => {
                MtfError::InvalidIndex("index is too short to hold a backup path".into())
            }
            other => other,
        })
}
