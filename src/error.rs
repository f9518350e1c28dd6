use thiserror::Error;

use crate::catalog::NodeType;

#[derive(Debug, Error)]
pub enum MtfError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Fewer bytes remain in the source than a read requires.
    #[error("truncated input at 0x{offset:X}: needed {needed} bytes, {available} available")]
    TruncatedInput {
        offset: u64,
        needed: u64,
        available: u64,
    },

    /// Not even the fixed 52-byte common header fits before the end of the source.
    #[error("truncated descriptor block at 0x{offset:X}")]
    TruncatedBlock { offset: u64 },

    #[error("truncated data stream at 0x{offset:X}: declared length {length}")]
    TruncatedStream { offset: u64, length: u64 },

    #[error("corrupt descriptor block at 0x{offset:X}: {reason}")]
    CorruptBlock { offset: u64, reason: String },

    #[error("{0:?} nodes can not be extracted, only volume, folder or file nodes can")]
    NotExtractable(NodeType),

    #[error("catalog has no node at index {0}")]
    NodeOutOfRange(usize),

    #[error("invalid catalog index: {0}")]
    InvalidIndex(String),
}

impl MtfError {
    /// Turn a short read inside an already started block into a `CorruptBlock`.
    pub(crate) fn mid_block(self, block_start: u64) -> Self {
        match self {
            MtfError::TruncatedInput {
                offset,
                needed,
                available,
            } => MtfError::CorruptBlock {
                offset: block_start,
                reason: format!(
                    "block ends early at 0x{offset:X} ({needed} bytes needed, {available} left)"
                ),
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, MtfError>;
