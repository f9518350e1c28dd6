//! Hierarchy of a flat catalog and extraction of its volumes, folders and files.
//!
//! A node owns every following node of higher rank, up to the next node whose
//! rank is not higher. All walks work on index ranges of the flat list.

use log::{debug, info, warn};
use serde::Serialize;
use std::fs;
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use crate::catalog::{CatalogNode, NodeType};
use crate::cursor::ByteCursor;
use crate::dblk::{BlockType, DecodeOptions, decode_block};
use crate::error::{MtfError, Result};
use crate::stream::STREAM_STANDARD;

/// First index after `p` that is not part of its subtree.
pub fn subtree_end(nodes: &[CatalogNode], p: usize) -> usize {
    let rank = nodes[p].rank();
    nodes[p + 1..]
        .iter()
        .position(|n| n.rank() <= rank)
        .map_or(nodes.len(), |i| p + 1 + i)
}

/// Direct children of `p`, in catalog order.
pub fn children(nodes: &[CatalogNode], p: usize) -> Vec<usize> {
    let end = subtree_end(nodes, p);
    let mut out = Vec::new();
    let mut c = p + 1;
    while c < end {
        out.push(c);
        c = subtree_end(nodes, c);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub index: usize,
    pub children: Vec<TreeNode>,
}

fn tree_at(nodes: &[CatalogNode], p: usize) -> TreeNode {
    TreeNode {
        index: p,
        children: children(nodes, p)
            .into_iter()
            .map(|c| tree_at(nodes, c))
            .collect(),
    }
}

/// Explicit form of the hierarchy. A well-formed catalog has a single top-level
/// entry, the Root.
pub fn build_tree(nodes: &[CatalogNode]) -> Vec<TreeNode> {
    let mut roots = Vec::new();
    let mut p = 0;
    while p < nodes.len() {
        roots.push(tree_at(nodes, p));
        p = subtree_end(nodes, p);
    }
    roots
}

/// Pre-order indices of a tree; `flatten(&build_tree(nodes))` lists every index once,
/// in order.
pub fn flatten(tree: &[TreeNode]) -> Vec<usize> {
    let mut out = Vec::new();
    let mut stack: Vec<&TreeNode> = tree.iter().rev().collect();
    while let Some(t) = stack.pop() {
        out.push(t.index);
        stack.extend(t.children.iter().rev());
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractSummary {
    pub directories: u64,
    pub files: u64,
    pub bytes: u64,
}

struct Extractor<'a, R: Read + Seek, C: FnMut() -> bool> {
    nodes: &'a [CatalogNode],
    cursor: ByteCursor<R>,
    options: DecodeOptions,
    is_cancelled: C,
    summary: ExtractSummary,
}

impl<R: Read + Seek, C: FnMut() -> bool> Extractor<'_, R, C> {
    /// Returns false once cancellation was requested.
    fn visit(&mut self, p: usize, parent: &Path) -> Result<bool> {
        if (self.is_cancelled)() {
            info!("Extraction cancelled before node {}.", p);
            return Ok(false);
        }
        let nodes = self.nodes;
        let node = &nodes[p];
        match node.node_type {
            NodeType::Root | NodeType::Set => return Err(MtfError::NotExtractable(node.node_type)),
            NodeType::Database => {
                warn!(
                    "Skipping database node {} at 0x{:X}, databases can not be extracted.",
                    p, node.offset
                );
                return Ok(true);
            }
            NodeType::File => {
                self.write_file(node, parent)?;
                return Ok(true);
            }
            NodeType::Volume | NodeType::Folder => {}
        }

        let path: PathBuf = match node.node_type {
            NodeType::Folder => parent.join(node.relative_path()),
            _ => parent.to_path_buf(),
        };
        if node.node_type == NodeType::Folder {
            fs::create_dir_all(&path)?;
            self.summary.directories += 1;
            debug!("Created directory {}", path.display());
        }
        for c in children(nodes, p) {
            if !self.visit(c, &path)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn write_file(&mut self, node: &CatalogNode, parent: &Path) -> Result<()> {
        let relative = node.relative_path();
        if relative.as_os_str().is_empty() {
            warn!(
                "File at 0x{:X} has no usable name ({:?}), skipping it.",
                node.offset, node.name
            );
            return Ok(());
        }

        self.cursor.seek(node.offset)?;
        let block = decode_block(&mut self.cursor, &self.options)?;
        if block.block_type() != BlockType::File {
            return Err(MtfError::CorruptBlock {
                offset: node.offset,
                reason: format!("expected a FILE block, found {:?}", block.block_type()),
            });
        }

        let path = parent.join(relative);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut out = BufWriter::new(fs::File::create(&path)?);
        let mut written = 0u64;
        for stream in block.streams_with_id(STREAM_STANDARD) {
            if stream.is_encrypted() || stream.is_compressed() {
                warn!(
                    "Stream at 0x{:X} of {} is encrypted or compressed, it is written as stored.",
                    stream.data_offset,
                    path.display()
                );
            }
            written += stream.copy_payload(&mut self.cursor, &mut out)?;
        }
        out.flush()?;

        debug!("Wrote {} bytes to {}", written, path.display());
        self.summary.files += 1;
        self.summary.bytes += written;
        Ok(())
    }
}

/// Extract the node at `index` and everything below it into `destination`.
///
/// Volumes map to `destination` itself, folders to their path below it and files
/// to `parent/name`. Payloads are read from a source obtained once through
/// `reopen_source`. A cancelled extraction returns `Ok(None)` and keeps whatever
/// was already written.
pub fn extract<R, F, C>(
    nodes: &[CatalogNode],
    index: usize,
    destination: &Path,
    mut reopen_source: F,
    is_cancelled: C,
    options: &DecodeOptions,
) -> Result<Option<ExtractSummary>>
where
    R: Read + Seek,
    F: FnMut() -> io::Result<R>,
    C: FnMut() -> bool,
{
    let node = nodes.get(index).ok_or(MtfError::NodeOutOfRange(index))?;
    match node.node_type {
        NodeType::Root | NodeType::Set | NodeType::Database => {
            return Err(MtfError::NotExtractable(node.node_type));
        }
        NodeType::Volume | NodeType::Folder | NodeType::File => {}
    }

    info!(
        "Extracting {:?} '{}' to {}",
        node.node_type,
        node.display_name(),
        destination.display()
    );
    fs::create_dir_all(destination)?;

    let mut extractor = Extractor {
        nodes,
        cursor: ByteCursor::new(reopen_source()?)?,
        // Payloads are streamed from the source, never buffered whole.
        options: DecodeOptions {
            retain_payload_limit: 0,
            ..options.clone()
        },
        is_cancelled,
        summary: ExtractSummary::default(),
    };
    if !extractor.visit(index, destination)? {
        return Ok(None);
    }
    let summary = extractor.summary;
    info!(
        "Extracted {} file(s) and {} folder(s), {} bytes.",
        summary.files, summary.directories, summary.bytes
    );
    Ok(Some(summary))
}
