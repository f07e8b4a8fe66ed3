use std::{
    cmp,
    fs::File,
    io::{self, Cursor, ErrorKind, Read, Seek, SeekFrom},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::DirectoryEntry;

/// Positioned reads over a shared, read-only container.
///
/// Implementations must allow concurrent calls from several threads, each
/// reading at its own offset, without disturbing one another.
pub trait ReadAt: Send + Sync {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
}

impl ReadAt for File {
    #[cfg(unix)]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.seek_read(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "failed to fill whole buffer",
                    ))
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<T: AsRef<[u8]> + Send + Sync> ReadAt for Cursor<T> {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let data = self.get_ref().as_ref();
        let src = usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(buf.len())?))
            .and_then(|range| data.get(range))
            .ok_or_else(|| io::Error::new(ErrorKind::UnexpectedEof, "read past end of buffer"))?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        (**self).read_exact_at(buf, offset)
    }
}

/// Shares a plain `Read + Seek` handle by serializing every seek+read pair.
pub struct SeekLock<R> {
    inner: Mutex<R>,
}

impl<R: Read + Seek + Send> SeekLock<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

impl<R: Read + Seek + Send> ReadAt for SeekLock<R> {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.seek(SeekFrom::Start(offset))?;
        inner.read_exact(buf)
    }
}

/// Bounded view of one entry's bytes inside the container.
pub struct EntryReader<'a, S: ?Sized> {
    source: &'a S,
    off: u64,
    len: u64,
    pos: u64,
}

impl<'a, S: ReadAt + ?Sized> EntryReader<'a, S> {
    pub fn new(source: &'a S, entry: &DirectoryEntry) -> Self {
        Self {
            source,
            off: entry.offset as u64,
            len: entry.size as u64,
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl<'a, S: ReadAt + ?Sized> Seek for EntryReader<'a, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(i) => i as i128,
            SeekFrom::End(i) => self.len as i128 + i as i128,
            SeekFrom::Current(i) => self.pos as i128 + i as i128,
        };
        if target < 0 || target > self.len as i128 {
            return Err(io::Error::new(ErrorKind::InvalidInput, "Seek out of bounds"));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

impl<'a, S: ReadAt + ?Sized> Read for EntryReader<'a, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rem = self.len - self.pos;
        if rem == 0 {
            return Ok(0);
        }

        let max = cmp::min(buf.len() as u64, rem) as usize;
        self.source
            .read_exact_at(&mut buf[..max], self.off + self.pos)?;
        self.pos += max as u64;
        Ok(max)
    }
}
