use std::{
    collections::HashSet,
    fs::{self, File},
    io::{self, BufWriter, ErrorKind, Read, Write},
    num::NonZeroUsize,
    path::Path,
    sync::Arc,
    thread,
};

use threadpool::ThreadPool;
use tracing::{debug, warn};

use crate::{
    entry::{EntryReader, ReadAt},
    error::EntryError,
    Directory, DirectoryEntry,
};

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Number of extraction workers, 0 picks the available parallelism
    pub threads: usize,
    /// Compare the CRC-32 of every written entry against the stored value
    pub verify_checksums: bool,
}

impl ExtractOptions {
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }
    pub fn worker_count(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }
}

#[derive(Debug)]
pub struct EntryOutcome {
    pub name: String,
    /// Bytes written on success
    pub result: Result<u64, EntryError>,
}

impl EntryOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-entry results of one extraction run, in completion order.
#[derive(Debug, Default)]
pub struct ExtractionReport {
    pub outcomes: Vec<EntryOutcome>,
}

impl ExtractionReport {
    pub fn extracted(&self) -> impl Iterator<Item = &EntryOutcome> {
        self.outcomes.iter().filter(|o| o.is_ok())
    }
    pub fn failures(&self) -> impl Iterator<Item = (&str, &EntryError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.name.as_str(), e)))
    }
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(EntryOutcome::is_ok)
    }
    pub fn bytes_written(&self) -> u64 {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .sum()
    }
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Writes every entry of `directory` to `dest/<name>`.
///
/// `dest` must already exist. Entries are extracted concurrently and in no
/// particular order; a failing entry is recorded and the others still run.
pub fn extract_all<S: ReadAt + ?Sized + 'static>(
    source: Arc<S>,
    directory: &Directory,
    dest: &Path,
    options: &ExtractOptions,
) -> ExtractionReport {
    extract_all_with(source, directory, dest, options, |_| {})
}

/// Like [`extract_all`], calling `on_outcome` on the calling thread as each
/// entry finishes.
pub fn extract_all_with<S, F>(
    source: Arc<S>,
    directory: &Directory,
    dest: &Path,
    options: &ExtractOptions,
    mut on_outcome: F,
) -> ExtractionReport
where
    S: ReadAt + ?Sized + 'static,
    F: FnMut(&EntryOutcome),
{
    let mut report = ExtractionReport::default();
    if directory.is_empty() {
        return report;
    }

    let workers = options.worker_count().min(directory.len());
    debug!(entries = directory.len(), workers, dest = %dest.display(), "extracting");
    let pool = ThreadPool::with_name("agg-extract".to_string(), workers);
    let (tx, rx) = flume::unbounded();
    for entry in directory {
        let tx = tx.clone();
        let source = source.clone();
        let entry = entry.clone();
        let dest = dest.to_path_buf();
        let verify = options.verify_checksums;
        pool.execute(move || {
            let result = extract_entry(&*source, &entry, &dest, verify);
            let _ = tx.send(EntryOutcome {
                name: entry.name,
                result,
            });
        });
    }
    drop(tx);

    let mut finished = HashSet::with_capacity(directory.len());
    for outcome in rx.iter() {
        match &outcome.result {
            Ok(written) => debug!(name = %outcome.name, written, "extracted"),
            Err(e) => warn!(name = %outcome.name, error = %e, "failed to extract"),
        }
        on_outcome(&outcome);
        finished.insert(outcome.name.clone());
        report.outcomes.push(outcome);
    }

    // A job that panicked never reports back.
    for entry in directory {
        if !finished.contains(&entry.name) {
            let outcome = EntryOutcome {
                name: entry.name.clone(),
                result: Err(io::Error::new(ErrorKind::Other, "extraction worker panicked").into()),
            };
            warn!(name = %outcome.name, "extraction worker panicked");
            on_outcome(&outcome);
            report.outcomes.push(outcome);
        }
    }
    report
}

fn extract_entry<S: ReadAt + ?Sized>(
    source: &S,
    entry: &DirectoryEntry,
    dest: &Path,
    verify: bool,
) -> Result<u64, EntryError> {
    let path = dest.join(checked_name(&entry.name)?);
    let mut reader = ChecksumReader::new(EntryReader::new(source, entry), verify);

    let mut file = BufWriter::new(File::create(&path)?);
    let written = io::copy(&mut reader, &mut file)?;
    file.flush()?;
    drop(file);

    if let Some(actual) = reader.finish() {
        if actual != entry.crc {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "couldn't remove corrupt entry");
            }
            return Err(EntryError::ChecksumMismatch {
                expected: entry.crc,
                actual,
            });
        }
    }
    Ok(written)
}

/// Rejects names that would land outside the destination directory.
fn checked_name(name: &str) -> Result<&str, EntryError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(|c: char| matches!(c, '/' | '\\' | ':'))
    {
        return Err(EntryError::UnsafeName(name.to_string()));
    }
    Ok(name)
}

struct ChecksumReader<R> {
    inner: R,
    hasher: Option<crc32fast::Hasher>,
}

impl<R> ChecksumReader<R> {
    fn new(inner: R, enabled: bool) -> Self {
        Self {
            inner,
            hasher: enabled.then(crc32fast::Hasher::new),
        }
    }
    fn finish(self) -> Option<u32> {
        self.hasher.map(crc32fast::Hasher::finalize)
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        if let Some(hasher) = &mut self.hasher {
            hasher.update(&buf[..read]);
        }
        Ok(read)
    }
}
