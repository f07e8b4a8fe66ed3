use crate::{
    entry::{EntryReader, ReadAt, SeekLock},
    error::{FormatError, ParseError},
    extract::{self, EntryOutcome, ExtractOptions, ExtractionReport},
    Directory, DirectoryEntry, FatRecord, FAT_RECORD_LEN, HEADER_LEN, NAME_SLOT_LEN,
};
use byteorder::{LittleEndian, ReadBytesExt};
use std::{
    io::{Read, Seek, SeekFrom},
    path::Path,
    sync::Arc,
};
use tracing::{debug, warn};

/// Decodes the header, FAT and name table of an AGG container.
///
/// FAT records and name slots are paired by position: the `i`th name belongs
/// to the `i`th record. Names are lower-cased, and a later record whose name
/// is already present replaces the earlier one.
pub fn parse<R: Read + Seek + ?Sized>(r: &mut R) -> Result<Directory, ParseError> {
    measure_and_read(r).map(|(_, directory)| directory)
}

/// Container length alongside its directory.
fn measure_and_read<R: Read + Seek + ?Sized>(r: &mut R) -> Result<(u64, Directory), ParseError> {
    let len = r.seek(SeekFrom::End(0))?;
    Ok((len, read_directory(r, len)?))
}

fn read_directory<R: Read + Seek + ?Sized>(r: &mut R, len: u64) -> Result<Directory, ParseError> {
    if len < HEADER_LEN {
        return Err(FormatError::TooShort { len }.into());
    }
    r.seek(SeekFrom::Start(0))?;
    let item_count = r.read_u16::<LittleEndian>()?;
    debug!(item_count, len, "read archive header");

    let count = item_count as u64;
    let required = HEADER_LEN + count * (FAT_RECORD_LEN + NAME_SLOT_LEN);
    if required > len {
        return Err(FormatError::TableOutOfBounds {
            item_count,
            required,
            len,
        }
        .into());
    }

    let mut fat = vec![0u8; (count * FAT_RECORD_LEN) as usize];
    r.read_exact(&mut fat)?;

    r.seek(SeekFrom::Start(len - count * NAME_SLOT_LEN))?;
    let mut names = vec![0u8; (count * NAME_SLOT_LEN) as usize];
    r.read_exact(&mut names)?;

    let mut fat = &fat[..];
    let mut directory = Directory::new(item_count);
    for (index, slot) in names.chunks_exact(NAME_SLOT_LEN as usize).enumerate() {
        let index = index as u32;
        let name = decode_name(slot).ok_or(FormatError::UnterminatedName { index })?;
        let record = FatRecord {
            crc: fat.read_u32::<LittleEndian>()?,
            offset: fat.read_u32::<LittleEndian>()?,
            size: fat.read_u32::<LittleEndian>()?,
        };
        if record.end() > len {
            return Err(FormatError::EntryOutOfBounds {
                name,
                offset: record.offset,
                end: record.end(),
                len,
            }
            .into());
        }

        let entry = DirectoryEntry {
            name,
            index,
            crc: record.crc,
            offset: record.offset,
            size: record.size,
        };
        if let Some(previous) = directory.insert(entry) {
            warn!(
                name = %previous.name,
                replaced = previous.index,
                by = index,
                "duplicate entry name, keeping the later record"
            );
        }
    }
    debug!(
        entries = directory.len(),
        shadowed = directory.shadowed(),
        "decoded directory"
    );
    Ok(directory)
}

/// Name stored in a slot: the bytes before the first zero, lower-cased.
/// Filler after the terminator is never looked at.
fn decode_name(slot: &[u8]) -> Option<String> {
    let end = slot.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&slot[..end]).to_ascii_lowercase())
}

/// An opened container together with its decoded directory.
pub struct Archive<I> {
    inner: Arc<I>,
    directory: Directory,
    len: u64,
}

impl<R: Read + Seek + ReadAt> Archive<R> {
    /// Opens a handle that also supports positioned reads, such as a `File`
    /// or an in-memory `Cursor`. Buffered or streaming readers go through
    /// [`Archive::open_locked`].
    pub fn open(mut r: R) -> Result<Self, ParseError> {
        let (len, directory) = measure_and_read(&mut r)?;
        Ok(Self {
            inner: Arc::new(r),
            directory,
            len,
        })
    }
}

impl<R: Read + Seek + Send> Archive<SeekLock<R>> {
    /// Opens a handle without positioned reads; extraction workers then take
    /// turns on it.
    pub fn open_locked(mut r: R) -> Result<Self, ParseError> {
        let (len, directory) = measure_and_read(&mut r)?;
        Ok(Self {
            inner: Arc::new(SeekLock::new(r)),
            directory,
            len,
        })
    }
}

impl<I: ReadAt> Archive<I> {
    pub fn entry(&self, name: &str) -> Option<EntryReader<'_, I>> {
        let entry = self.directory.get(name)?;
        Some(EntryReader::new(&*self.inner, entry))
    }

    pub fn read_entry(&self, name: &str) -> std::io::Result<Option<Vec<u8>>> {
        let Some(mut entry) = self.entry(name) else {
            return Ok(None);
        };
        let mut buf = Vec::with_capacity(entry.len() as usize);
        entry.read_to_end(&mut buf)?;
        Ok(Some(buf))
    }
}

impl<I: ReadAt + 'static> Archive<I> {
    pub fn extract_all(&self, dest: &Path, options: &ExtractOptions) -> ExtractionReport {
        extract::extract_all(self.inner.clone(), &self.directory, dest, options)
    }

    pub fn extract_all_with<F: FnMut(&EntryOutcome)>(
        &self,
        dest: &Path,
        options: &ExtractOptions,
        on_outcome: F,
    ) -> ExtractionReport {
        extract::extract_all_with(self.inner.clone(), &self.directory, dest, options, on_outcome)
    }
}

impl<I> Archive<I> {
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn into_directory(self) -> Directory {
        self.directory
    }

    /// Total length of the container in bytes.
    pub fn size(&self) -> u64 {
        self.len
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Lays out an archive of `total` bytes: header, FAT, names at the tail.
    /// Data bytes are the low byte of their offset.
    pub(crate) fn build(records: &[(&[u8; 15], FatRecord)], total: usize) -> Vec<u8> {
        let mut out: Vec<u8> = (0..total).map(|i| i as u8).collect();
        out[..2].copy_from_slice(&(records.len() as u16).to_le_bytes());
        for (i, (_, r)) in records.iter().enumerate() {
            let at = 2 + i * 12;
            out[at..at + 4].copy_from_slice(&r.crc.to_le_bytes());
            out[at + 4..at + 8].copy_from_slice(&r.offset.to_le_bytes());
            out[at + 8..at + 12].copy_from_slice(&r.size.to_le_bytes());
        }
        let names = total - records.len() * 15;
        for (i, (slot, _)) in records.iter().enumerate() {
            out[names + i * 15..names + (i + 1) * 15].copy_from_slice(*slot);
        }
        out
    }

    fn record(crc: u32, offset: u32, size: u32) -> FatRecord {
        FatRecord { crc, offset, size }
    }

    #[test]
    fn parses_single_entry_archive() {
        let data = build(
            &[(b"HERO.ICN\0ZZZZZZ", record(0x12345678, 17, 10))],
            100,
        );
        let dir = parse(&mut Cursor::new(data)).unwrap();
        assert_eq!(dir.len(), 1);
        assert_eq!(
            dir.get("hero.icn"),
            Some(&DirectoryEntry {
                name: "hero.icn".to_string(),
                index: 0,
                crc: 0x12345678,
                offset: 17,
                size: 10,
            })
        );
    }

    #[test]
    fn filler_after_terminator_is_ignored() {
        assert_eq!(decode_name(b"KNIGHT.ICN\0abcd").as_deref(), Some("knight.icn"));
        assert_eq!(decode_name(b"KNIGHT.ICN\0\0\0\0\0").as_deref(), Some("knight.icn"));
        assert_eq!(decode_name(b"ABCDEFGHIJ.BMP\0").as_deref(), Some("abcdefghij.bmp"));
        assert_eq!(decode_name(b"\0ABCDEFGHIJKLMN").as_deref(), Some(""));
        assert_eq!(decode_name(b"ABCDEFGHIJK.BMP"), None);
    }

    #[test]
    fn zero_items_is_an_empty_directory() {
        let dir = parse(&mut Cursor::new(vec![0u8, 0])).unwrap();
        assert!(dir.is_empty());
        assert_eq!(dir.item_count, 0);
    }

    #[test]
    fn too_short_for_header() {
        for data in [vec![], vec![1u8]] {
            let len = data.len() as u64;
            match parse(&mut Cursor::new(data)) {
                Err(ParseError::Format(e)) => assert_eq!(e, FormatError::TooShort { len }),
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    #[test]
    fn declared_tables_larger_than_archive() {
        let mut data = vec![0u8; 50];
        data[..2].copy_from_slice(&2u16.to_le_bytes());
        match parse(&mut Cursor::new(data)) {
            Err(ParseError::Format(e)) => assert_eq!(
                e,
                FormatError::TableOutOfBounds {
                    item_count: 2,
                    required: 56,
                    len: 50,
                }
            ),
            other => panic!("unexpected result: {other:?}"),
        }

        let mut data = vec![0xffu8; 64];
        data[..2].copy_from_slice(&u16::MAX.to_le_bytes());
        assert!(matches!(
            parse(&mut Cursor::new(data)),
            Err(ParseError::Format(FormatError::TableOutOfBounds { .. }))
        ));
    }

    #[test]
    fn exactly_sized_tables_parse() {
        let data = build(&[(b"A\0\0\0\0\0\0\0\0\0\0\0\0\0\0", record(0, 0, 0))], 29);
        let dir = parse(&mut Cursor::new(data)).unwrap();
        assert_eq!(dir.get("a").map(|e| e.size), Some(0));
    }

    #[test]
    fn unterminated_slot_rejects_archive() {
        let data = build(
            &[
                (b"GOOD.BIN\0\0\0\0\0\0\0", record(0, 60, 4)),
                (b"FIFTEENCHARS.XX", record(0, 64, 4)),
            ],
            120,
        );
        match parse(&mut Cursor::new(data)) {
            Err(ParseError::Format(e)) => {
                assert_eq!(e, FormatError::UnterminatedName { index: 1 })
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn entry_past_end_rejects_archive() {
        let data = build(&[(b"BIG.BIN\0\0\0\0\0\0\0\0", record(0, 90, 11))], 100);
        match parse(&mut Cursor::new(data)) {
            Err(ParseError::Format(e)) => assert_eq!(
                e,
                FormatError::EntryOutOfBounds {
                    name: "big.bin".to_string(),
                    offset: 90,
                    end: 101,
                    len: 100,
                }
            ),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn pairs_names_with_records_by_position() {
        let data = build(
            &[
                (b"ZETA.BIN\0\0\0\0\0\0\0", record(1, 60, 3)),
                (b"ALPHA.BIN\0\0\0\0\0\0", record(2, 63, 4)),
                (b"MID.BIN\0\0\0\0\0\0\0\0", record(3, 67, 5)),
            ],
            150,
        );
        let dir = parse(&mut Cursor::new(data)).unwrap();
        let zeta = dir.get("zeta.bin").unwrap();
        assert_eq!((zeta.index, zeta.crc, zeta.offset, zeta.size), (0, 1, 60, 3));
        let alpha = dir.get("alpha.bin").unwrap();
        assert_eq!((alpha.index, alpha.crc, alpha.offset, alpha.size), (1, 2, 63, 4));
        let mid = dir.get("mid.bin").unwrap();
        assert_eq!((mid.index, mid.crc, mid.offset, mid.size), (2, 3, 67, 5));
    }

    #[test]
    fn duplicate_names_keep_the_last_record() {
        let data = build(
            &[
                (b"Same.Bin\0first!", record(1, 60, 3)),
                (b"SAME.BIN\0second", record(2, 70, 4)),
            ],
            120,
        );
        let dir = parse(&mut Cursor::new(data)).unwrap();
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.shadowed(), 1);
        let entry = dir.get("same.bin").unwrap();
        assert_eq!((entry.index, entry.crc, entry.offset), (1, 2, 70));
    }

    #[test]
    fn archive_reads_entries_by_name() {
        let data = build(
            &[(b"HERO.ICN\0ZZZZZZ", record(0x12345678, 17, 10))],
            100,
        );
        let archive = Archive::open(Cursor::new(data)).unwrap();
        assert_eq!(archive.size(), 100);
        let bytes = archive.read_entry("Hero.icn").unwrap().unwrap();
        assert_eq!(bytes, (17u8..27).collect::<Vec<_>>());
        assert!(archive.read_entry("missing").unwrap().is_none());
    }

    #[test]
    fn locked_archive_reads_like_positioned_one() {
        let data = build(&[(b"X.BIN\0\0\0\0\0\0\0\0\0\0", record(0, 40, 8))], 80);
        let archive = Archive::open_locked(Cursor::new(data)).unwrap();
        let bytes = archive.read_entry("x.bin").unwrap().unwrap();
        assert_eq!(bytes, (40u8..48).collect::<Vec<_>>());
    }

    #[test]
    fn open_paths_agree_from_any_start_position() {
        let data = build(
            &[
                (b"ONE.BIN\0\0\0\0\0\0\0\0", record(1, 60, 3)),
                (b"TWO.BIN\0\0\0\0\0\0\0\0", record(2, 63, 4)),
            ],
            110,
        );
        let mut cursor = Cursor::new(data.clone());
        cursor.seek(SeekFrom::Start(37)).unwrap();
        let parsed = parse(&mut cursor).unwrap();

        let mut positioned = Cursor::new(data.clone());
        positioned.seek(SeekFrom::Start(99)).unwrap();
        let positioned = Archive::open(positioned).unwrap();

        let mut locked = Cursor::new(data);
        locked.seek(SeekFrom::End(-1)).unwrap();
        let locked = Archive::open_locked(locked).unwrap();

        assert_eq!(positioned.size(), 110);
        assert_eq!(locked.size(), 110);
        assert_eq!(positioned.directory(), &parsed);
        assert_eq!(locked.directory(), &parsed);
        assert_eq!(locked.read_entry("two.bin").unwrap(), Some(vec![63, 64, 65, 66]));
    }
}
