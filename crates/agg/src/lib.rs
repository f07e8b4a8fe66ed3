pub mod archive;
pub mod entry;
pub mod error;
pub mod extract;

pub use archive::{parse, Archive};
pub use entry::{EntryReader, ReadAt, SeekLock};
pub use error::{EntryError, FormatError, ParseError};
pub use extract::{extract_all, extract_all_with, EntryOutcome, ExtractOptions, ExtractionReport};

use std::collections::{btree_map, BTreeMap};

use serde::{Deserialize, Serialize};

/// Size of the `item_count` header.
pub const HEADER_LEN: u64 = 2;
/// Size of one FAT record: crc, offset and size.
pub const FAT_RECORD_LEN: u64 = 12;
/// Size of one filename slot in the name table.
pub const NAME_SLOT_LEN: u64 = 15;

/// One raw record of the File Allocation Table.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Default)]
pub struct FatRecord {
    /// Checksum as stored by the archive, passed through unverified
    pub crc: u32,
    pub offset: u32,
    pub size: u32,
}

impl FatRecord {
    /// First byte past the end of the entry's data.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Default)]
pub struct DirectoryEntry {
    pub name: String,
    /// Position of the record in the FAT
    pub index: u32,
    pub crc: u32,
    pub offset: u32,
    pub size: u32,
}

impl DirectoryEntry {
    pub fn record(&self) -> FatRecord {
        FatRecord {
            crc: self.crc,
            offset: self.offset,
            size: self.size,
        }
    }
}

/// Decoded table of contents of an archive, keyed by lower-cased name.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Default)]
pub struct Directory {
    pub item_count: u16,
    pub entries: BTreeMap<String, DirectoryEntry>,
}

impl Directory {
    pub fn new(item_count: u16) -> Self {
        Self {
            item_count,
            entries: BTreeMap::new(),
        }
    }

    /// Inserts `entry`, returning the entry it replaced if the name was taken.
    pub fn insert(&mut self, entry: DirectoryEntry) -> Option<DirectoryEntry> {
        self.entries.insert(entry.name.clone(), entry)
    }

    /// Looks an entry up by name, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&DirectoryEntry> {
        self.entries.get(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of FAT records hidden behind a later record with the same name.
    pub fn shadowed(&self) -> usize {
        (self.item_count as usize).saturating_sub(self.entries.len())
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, DirectoryEntry> {
        self.entries.values()
    }

    /// Sum of the sizes of all reachable entries.
    pub fn total_size(&self) -> u64 {
        self.iter().map(|e| e.size as u64).sum()
    }
}

impl<'a> IntoIterator for &'a Directory {
    type Item = &'a DirectoryEntry;
    type IntoIter = btree_map::Values<'a, String, DirectoryEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
