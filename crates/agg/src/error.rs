use std::io;

use thiserror::Error;

/// The container violates the AGG layout. Parsing stops at the first one.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("archive is {len} bytes, too short to hold a header")]
    TooShort { len: u64 },

    #[error("{item_count} items need {required} bytes of tables, archive is only {len} bytes")]
    TableOutOfBounds {
        item_count: u16,
        required: u64,
        len: u64,
    },

    #[error("name slot {index} has no terminator")]
    UnterminatedName { index: u32 },

    #[error("entry {name:?} spans {offset}..{end}, past the end of the {len} byte archive")]
    EntryOutOfBounds {
        name: String,
        offset: u32,
        end: u64,
        len: u64,
    },
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid archive: {0}")]
    Format(#[from] FormatError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failure scoped to a single entry during extraction.
#[derive(Error, Debug)]
pub enum EntryError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("refusing to write entry with unsafe name {0:?}")]
    UnsafeName(String),

    #[error("checksum mismatch: stored {expected:08x}, computed {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}
