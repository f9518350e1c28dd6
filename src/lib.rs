// Sources:
// - Microsoft Tape Format Specification Version 1.00a
// - https://en.wikipedia.org/wiki/NTBackup

use log::{debug, error, info};
use std::io::{Read, Seek};

pub mod catalog;
pub mod cursor;
pub mod dblk;
pub mod error;
pub mod index;
pub mod stream;
pub mod tree;

#[cfg(test)]
mod testutil;

pub use catalog::{BlockReader, CatalogNode, NodeType, build_catalog};
pub use cursor::ByteCursor;
pub use dblk::{BlockBody, BlockType, DecodeOptions, DescriptorBlock, TapeHeader, decode_block};
pub use error::{MtfError, Result};
pub use tree::{ExtractSummary, TreeNode, build_tree, children, extract, flatten, subtree_end};

use dblk::{MTF_TAPE, tag_to_string};

/// An opened MTF backup image.
pub struct MTF<T: Read + Seek> {
    /// The TAPE block every MTF media starts with.
    pub tape: DescriptorBlock,
    cursor: ByteCursor<T>,
    options: DecodeOptions,
}

impl<T: Read + Seek> MTF<T> {
    /// Open a backup image with the default (permissive) decoding options.
    pub fn new(body: T) -> Result<Self> {
        Self::with_options(body, DecodeOptions::default())
    }

    pub fn with_options(body: T, options: DecodeOptions) -> Result<Self> {
        let mut cursor = ByteCursor::new(body)?;
        let tag = cursor.peek_u32()?;
        if tag != MTF_TAPE {
            error!("The media does not start with a TAPE block.");
            return Err(MtfError::CorruptBlock {
                offset: 0,
                reason: format!("not an MTF media, first block is '{}'", tag_to_string(tag)),
            });
        }
        let tape = decode_block(&mut cursor, &options)?;
        debug!("TAPE block decoded, next block at 0x{:X}", cursor.position());
        if let BlockBody::TapeHeader(t) = &tape.body {
            info!(
                "Opened media '{}' written by '{}' (MTF {}.x)",
                t.media_name, t.software_name, t.mtf_major_version
            );
        }
        Ok(Self {
            tape,
            cursor,
            options,
        })
    }

    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    /// Size of the image in bytes.
    pub fn len(&self) -> u64 {
        self.cursor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.is_empty()
    }

    pub fn tape_header(&self) -> Option<&TapeHeader> {
        match &self.tape.body {
            BlockBody::TapeHeader(t) => Some(t),
            _ => None,
        }
    }

    /// Scan the whole image. See [`build_catalog`].
    pub fn catalog<P, C>(&mut self, on_progress: P, is_cancelled: C) -> Result<Option<Vec<CatalogNode>>>
    where
        P: FnMut(u64, u64),
        C: FnMut() -> bool,
    {
        self.cursor.seek(0)?;
        build_catalog(&mut self.cursor, &self.options, on_progress, is_cancelled)
    }

    /// Decode the descriptor block starting at `offset`.
    pub fn block_at(&mut self, offset: u64) -> Result<DescriptorBlock> {
        self.cursor.seek(offset)?;
        decode_block(&mut self.cursor, &self.options)
    }

    /// Iterate over every descriptor block from the start of the image.
    pub fn blocks(&mut self) -> Result<BlockReader<'_, T>> {
        self.cursor.seek(0)?;
        Ok(BlockReader::new(&mut self.cursor, &self.options))
    }

    pub fn into_inner(self) -> T {
        self.cursor.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{image, sample_image, sset, volb};
    use std::io::Cursor;

    #[test]
    fn opens_a_media_and_reads_its_header() {
        let mtf = MTF::new(Cursor::new(sample_image())).unwrap();
        assert_eq!(mtf.tape_header().unwrap().media_name, "Media");
        assert_eq!(mtf.len(), sample_image().len() as u64);
    }

    #[test]
    fn refuses_a_media_without_tape_block() {
        let bytes = image(&[sset(1, "Daily"), volb("C:")]);
        assert!(matches!(
            MTF::new(Cursor::new(bytes)),
            Err(MtfError::CorruptBlock { offset: 0, .. })
        ));
        assert!(MTF::new(Cursor::new(vec![0u8; 2])).is_err());
    }

    #[test]
    fn catalog_and_block_lookup() {
        let mut mtf = MTF::new(Cursor::new(sample_image())).unwrap();
        let nodes = mtf.catalog(|_, _| {}, || false).unwrap().unwrap();
        assert_eq!(nodes.len(), 5);

        let file = mtf.block_at(nodes[4].offset).unwrap();
        assert_eq!(file.block_type(), BlockType::File);
        assert_eq!(file.streams[0].data.as_deref(), Some(&b"ABC"[..]));

        // Scanning twice gives the same catalog.
        assert_eq!(mtf.catalog(|_, _| {}, || false).unwrap().unwrap(), nodes);
        assert_eq!(mtf.blocks().unwrap().count(), 8);
    }
}
