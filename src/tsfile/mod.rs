//! On-disk time-series storage: append-only WAL segments, background
//! consolidation into compressed sorted archives, and the streaming
//! readers the aggregator pulls rows through (C1).
//!
//! Grounded on `original_source/skvoz/util/tsfile.py` end to end.

pub mod consolidate;
pub mod name;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use name::{decode_key, encode_key, parse_file_name, FileKind};

/// One `(timestamp, data)` row pulled out of a WAL segment or archive.
/// The unit depends on the source: `latest`/`.tsc` segments carry raw
/// millisecond timestamps, while archives carry seconds, already
/// converted by `consolidate::consolidate_uid` on the way in.
pub type TsLine = (i64, String);

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BZIP2_MAGIC: [u8; 2] = [b'B', b'Z'];

/// Opens a tsfile for reading, sniffing gzip/bzip2 magic bytes rather than
/// trial-and-erroring through codecs the way the original's `_read_file`
/// does with repeated `IOError` catches.
fn open_reader(path: &Path) -> io::Result<Box<dyn BufRead>> {
    use std::io::Seek;
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let n = io::Read::read(&mut file, &mut magic)?;
    file.seek(io::SeekFrom::Start(0))?;

    if n == 2 && magic == GZIP_MAGIC {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else if n == 2 && magic == BZIP2_MAGIC {
        Ok(Box::new(BufReader::new(BzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn split_line(line: &str) -> Option<TsLine> {
    let (ts, data) = line.split_once(' ')?;
    Some((ts.parse().ok()?, data.to_string()))
}

/// Reads one tsfile fully. Archives are already timestamp-sorted; the open
/// `latest` segment and in-flight `.tsc` files are sorted in memory after
/// reading, matching `read_file`'s `consolidated` flag.
pub fn read_file(path: &Path, consolidated: bool) -> io::Result<Vec<TsLine>> {
    let reader = open_reader(path)?;
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if let Some(parsed) = split_line(line.trim_end()) {
            lines.push(parsed);
        }
    }
    if !consolidated {
        lines.sort();
    }
    Ok(lines)
}

struct MergeEntry {
    line: TsLine,
    source: usize,
}
impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.line == other.line
    }
}
impl Eq for MergeEntry {}
impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.line.cmp(&self.line)
    }
}

/// Streams the timestamp-ascending merge of several already-sorted tsfiles,
/// the Rust analogue of `read_files`'s `heapq.merge(*readers)`. Each file's
/// lines are pulled lazily, so the whole key's history is never
/// materialized at once.
pub struct MergedReader {
    readers: Vec<Box<dyn Iterator<Item = io::Result<TsLine>>>>,
    heap: std::collections::BinaryHeap<MergeEntry>,
    started: bool,
}

fn line_iter(path: PathBuf) -> io::Result<Box<dyn Iterator<Item = io::Result<TsLine>>>> {
    let reader = open_reader(&path)?;
    Ok(Box::new(reader.lines().filter_map(|line| match line {
        Ok(l) => split_line(l.trim_end()).map(Ok),
        Err(e) => Some(Err(e)),
    })))
}

impl MergedReader {
    /// `files` pairs an absolute path with whether it is already sorted
    /// (an archive) — unsorted inputs are fully read and sorted up front,
    /// matching `read_file`'s behavior for non-archive files.
    pub fn open(files: &[(PathBuf, bool)]) -> io::Result<Self> {
        let mut readers: Vec<Box<dyn Iterator<Item = io::Result<TsLine>>>> = Vec::new();
        for (path, consolidated) in files {
            if *consolidated {
                readers.push(line_iter(path.clone())?);
            } else {
                let mut lines = read_file(path, false)?;
                lines.sort();
                readers.push(Box::new(lines.into_iter().map(Ok)));
            }
        }
        Ok(Self {
            readers,
            heap: std::collections::BinaryHeap::new(),
            started: false,
        })
    }

    fn prime(&mut self) -> io::Result<()> {
        for (idx, reader) in self.readers.iter_mut().enumerate() {
            if let Some(next) = reader.next() {
                self.heap.push(MergeEntry {
                    line: next?,
                    source: idx,
                });
            }
        }
        self.started = true;
        Ok(())
    }
}

impl Iterator for MergedReader {
    type Item = io::Result<TsLine>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            if let Err(e) = self.prime() {
                return Some(Err(e));
            }
        }
        let MergeEntry { line, source } = self.heap.pop()?;
        if let Some(next) = self.readers[source].next() {
            match next {
                Ok(next_line) => self.heap.push(MergeEntry {
                    line: next_line,
                    source,
                }),
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(line))
    }
}

/// Lists the key directory and returns `(relative_path, consolidated)` for
/// each recognized file, mirroring `find_files`.
pub fn find_files(data_path: &Path, key: &str) -> io::Result<Vec<(PathBuf, bool)>> {
    let key_dir = data_path.join(encode_key(key));
    let mut out = Vec::new();
    if !key_dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(&key_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(kind) = parse_file_name(&name) {
            out.push((key_dir.join(&*name), kind.is_archive()));
        }
    }
    Ok(out)
}

/// Drops archives whose `[min, min+span]` span falls entirely outside
/// `[start_time, end_time]`; non-archive files (the open segment, in-flight
/// consolidations) are always kept, matching `filter_files_by_time`.
pub fn filter_files_by_time(
    files: Vec<(PathBuf, bool)>,
    start_time: i64,
    end_time: i64,
) -> Vec<(PathBuf, bool)> {
    files
        .into_iter()
        .filter(|(path, consolidated)| {
            if !*consolidated {
                return true;
            }
            let name = path.file_name().unwrap().to_string_lossy();
            match parse_file_name(&name) {
                Some(FileKind::Archive { min_ts, span, .. }) => {
                    let max_ts = min_ts + span;
                    !(start_time > max_ts || end_time < min_ts)
                }
                _ => true,
            }
        })
        .collect()
}

/// Returns every decoded key under `data_path` whose name matches `rx`,
/// mirroring `find_keys`.
pub fn find_keys(data_path: &Path, rx: &Regex) -> io::Result<Vec<String>> {
    let mut out = Vec::new();
    if !data_path.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(data_path)? {
        let entry = entry?;
        let encoded = entry.file_name().to_string_lossy().to_string();
        let key = decode_key(&encoded);
        if rx.is_match(&key) {
            out.push(key);
        }
    }
    Ok(out)
}

/// Append-only writer for one series key's `latest` segment. Owned
/// exclusively by the collect queue task; rotation hands the old segment
/// off to `consolidate::consolidate` and reopens a fresh file. Mirrors
/// `Writer`.
pub struct Writer {
    path: PathBuf,
    file: File,
    written: u64,
    rotate_threshold: u64,
    chunk_threshold: u64,
    runtime: tokio::runtime::Handle,
}

impl Writer {
    pub fn open(
        data_dir: &Path,
        key: &str,
        rotate_threshold: u64,
        chunk_threshold: u64,
        runtime: tokio::runtime::Handle,
    ) -> io::Result<Self> {
        let key_dir = data_dir.join(encode_key(key));
        fs::create_dir_all(&key_dir)?;
        let path = key_dir.join("latest");
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let written = fs::metadata(&path)?.len();
        Ok(Self {
            path,
            file,
            written,
            rotate_threshold,
            chunk_threshold,
            runtime,
        })
    }

    /// Appends one `timestamp data` line, rotating into consolidation when
    /// the segment crosses the rotate threshold. Returns the consolidation
    /// task handle when a rotation happened. `timestamp_millis` is stored
    /// verbatim; the ms->sec conversion happens once, in `consolidate`, on
    /// the way into the archive.
    pub fn write(
        &mut self,
        timestamp_millis: i64,
        data: &str,
    ) -> io::Result<Option<tokio::task::JoinHandle<()>>> {
        let line = format!("{timestamp_millis} {data}\n");
        self.file.write_all(line.as_bytes())?;
        self.written += line.len() as u64;

        if self.written > self.rotate_threshold {
            return self.rotate();
        }
        Ok(None)
    }

    /// Flushes the underlying file without rotating. Used by `TimedFdCache`
    /// when evicting an idle WAL handle.
    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn rotate(&mut self) -> io::Result<Option<tokio::task::JoinHandle<()>>> {
        self.file.flush()?;
        let handle = consolidate::consolidate(&self.path, self.chunk_threshold, &self.runtime)?;
        self.file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(Some(handle))
    }

    /// Flushes and, if the segment is over threshold, rotates on close —
    /// mirroring `Writer.close`'s end-of-life consolidation check.
    pub fn close(mut self) -> io::Result<Option<tokio::task::JoinHandle<()>>> {
        self.file.flush()?;
        if self.written > self.rotate_threshold {
            return self.rotate();
        }
        Ok(None)
    }
}
