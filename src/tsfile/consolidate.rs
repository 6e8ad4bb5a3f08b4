//! External sort + k-way merge consolidation of a rotated WAL segment into
//! an immutable, gzip-compressed archive (C1).
//!
//! Grounded on `original_source/skvoz/util/tsfile.py`'s `sort`,
//! `_slice_tsfile`, `_consolidate` and `consolidate`. The original spawns a
//! bare `threading.Thread`; here the same "rename then hand off to a
//! dedicated worker" shape is expressed as a `tokio::task::spawn_blocking`,
//! since the work (sort + gzip) is CPU/disk bound, not async I/O.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};
use uuid::Uuid;

use super::name::{archive_name, build_name, building_name, parse_file_name, FileKind};

const SORT_FILE_PREFIX: &str = "ts_sort_";

/// One `<timestamp_seconds> <data>` line out of a WAL segment.
type TsLine = (i64, String);

fn split_line(line: &str) -> Option<TsLine> {
    let (ts, data) = line.split_once(' ')?;
    let ts: i64 = ts.parse().ok()?;
    Some((ts, data.to_string()))
}

fn read_raw_lines(path: &Path) -> io::Result<Vec<TsLine>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if let Some(parsed) = split_line(&line) {
            out.push(parsed);
        } else {
            warn!(%line, "dropping malformed WAL line during consolidation");
        }
    }
    Ok(out)
}

/// Splits a line stream into chunks whose approximate serialized size
/// stays under `threshold` bytes, mirroring `_slice_tsfile`.
fn slice_chunks(lines: Vec<TsLine>, threshold: u64) -> Vec<Vec<TsLine>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut size: u64 = 0;

    for line in lines {
        let line_size = line.1.len() as u64 + 12;
        if size >= threshold && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            size = 0;
        }
        size += line_size;
        current.push(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

struct HeapEntry {
    line: TsLine,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.line == other.line
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest line sorts first.
        other.line.cmp(&self.line)
    }
}

/// Merges already-sorted line readers by `(timestamp, data)`, the Rust
/// analogue of `heapq.merge(*readers)`.
fn k_way_merge(mut readers: Vec<BufReader<File>>) -> io::Result<Vec<TsLine>> {
    let mut heap = BinaryHeap::new();
    let mut bufs = vec![String::new(); readers.len()];

    for (idx, reader) in readers.iter_mut().enumerate() {
        if reader.read_line(&mut bufs[idx])? > 0 {
            if let Some(parsed) = split_line(bufs[idx].trim_end()) {
                heap.push(HeapEntry {
                    line: parsed,
                    source: idx,
                });
            }
            bufs[idx].clear();
        }
    }

    let mut merged = Vec::new();
    while let Some(HeapEntry { line, source }) = heap.pop() {
        merged.push(line);
        let reader = &mut readers[source];
        if reader.read_line(&mut bufs[source])? > 0 {
            if let Some(parsed) = split_line(bufs[source].trim_end()) {
                heap.push(HeapEntry {
                    line: parsed,
                    source,
                });
            }
            bufs[source].clear();
        }
    }
    Ok(merged)
}

/// Sorts a WAL segment by `(timestamp, data)`, spilling to temp files and
/// merging when the file is larger than `threshold` bytes. Mirrors `sort`.
fn sort_tsfile(path: &Path, threshold: u64, tmp_dir: &Path) -> io::Result<Vec<TsLine>> {
    let file_size = fs::metadata(path)?.len();
    if file_size <= threshold {
        let mut lines = read_raw_lines(path)?;
        lines.sort();
        return Ok(lines);
    }

    let lines = read_raw_lines(path)?;
    let chunks = slice_chunks(lines, threshold);
    let mut tmp_paths = Vec::new();

    for mut chunk in chunks {
        chunk.sort();
        let tmp_path = tmp_dir.join(format!("{SORT_FILE_PREFIX}{}", Uuid::new_v4().simple()));
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for (ts, data) in &chunk {
            writeln!(writer, "{ts} {data}")?;
        }
        writer.flush()?;
        tmp_paths.push(tmp_path);
    }

    let readers: io::Result<Vec<_>> = tmp_paths
        .iter()
        .map(|p| File::open(p).map(BufReader::new))
        .collect();
    let merged = k_way_merge(readers?)?;

    for tmp_path in &tmp_paths {
        let _ = fs::remove_file(tmp_path);
    }

    Ok(merged)
}

/// Consolidates a rotated `<uid>.tsc` segment into a gzip archive, mirroring
/// `_consolidate`. On any I/O failure the partial `.build` file is removed
/// and the `.tsc` input is left in place so a later pass can retry.
fn consolidate_uid(tsc_path: &Path, uid: &str, chunk_threshold: u64) -> io::Result<PathBuf> {
    let dir = tsc_path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "tsc path has no parent"))?;
    let build_path = dir.join(build_name(uid));

    let result = (|| -> io::Result<(i64, i64)> {
        let sorted = sort_tsfile(tsc_path, chunk_threshold, dir)?;
        let file = File::create(&build_path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

        // `latest`/`.tsc` segments carry millisecond timestamps (matching
        // `collect::server`'s `now_millis()` substitution); archives store
        // seconds, so translate here, once, on the way into the archive.
        let mut min_ts = None;
        let mut max_ts = None;
        for (ts, data) in &sorted {
            let ts_sec = ts / 1000;
            if min_ts.is_none() {
                min_ts = Some(ts_sec);
            }
            max_ts = Some(ts_sec);
            writeln!(encoder, "{ts_sec} {data}")?;
        }
        encoder.finish()?;

        let min_ts = min_ts.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "consolidation input was empty")
        })?;
        Ok((min_ts, max_ts.unwrap()))
    })();

    match result {
        Ok((min_ts, max_ts)) => {
            let archive_path = dir.join(archive_name(min_ts, max_ts, uid));
            fs::rename(&build_path, &archive_path)?;
            fs::remove_file(tsc_path)?;
            Ok(archive_path)
        }
        Err(err) => {
            let _ = fs::remove_file(&build_path);
            Err(err)
        }
    }
}

/// Renames a freshly rotated `latest` file to `<uid>.tsc` and hands the
/// consolidation work to a blocking task, mirroring `consolidate`'s
/// rename-then-spawn-thread shape. `runtime` is threaded through explicitly
/// because the WAL writer that calls this lives on a plain OS thread
/// (see `collect::queue`), not inside the Tokio runtime that owns the
/// blocking-task pool.
pub fn consolidate(
    path: &Path,
    chunk_threshold: u64,
    runtime: &tokio::runtime::Handle,
) -> io::Result<tokio::task::JoinHandle<()>> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no filename"))?;
    assert!(matches!(parse_file_name(name), Some(FileKind::Latest)), "{name}");

    let dir = path.parent().unwrap().to_path_buf();
    let uid = Uuid::new_v4().simple().to_string();
    let tsc_path = dir.join(building_name(&uid));
    fs::rename(path, &tsc_path)?;

    let handle = runtime.spawn_blocking(move || {
        if let Err(err) = consolidate_uid(&tsc_path, &uid, chunk_threshold) {
            error!(uid, error = %err, "consolidation failed");
        }
    });
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn write_latest(dir: &Path, lines: &[(i64, &str)]) -> PathBuf {
        let path = dir.join("latest");
        let mut f = File::create(&path).unwrap();
        for (ts, data) in lines {
            writeln!(f, "{ts} {data}").unwrap();
        }
        path
    }

    fn read_gzip_lines(path: &Path) -> Vec<String> {
        let file = File::open(path).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(file);
        let mut contents = String::new();
        decoder.read_to_string(&mut contents).unwrap();
        contents.lines().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn consolidates_small_file_in_sorted_order() {
        let dir = TempDir::new().unwrap();
        let path = write_latest(
            dir.path(),
            &[(300_000, "c"), (100_000, "a"), (200_000, "b")],
        );

        let handle = consolidate(&path, 24 << 20, &tokio::runtime::Handle::current()).unwrap();
        handle.await.unwrap();

        assert!(!path.exists());
        let archives: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(archives.len(), 1);
        let archive = dir.path().join(&archives[0]);
        assert_eq!(archive.to_str().unwrap().ends_with(".tsc"), false);

        let lines = read_gzip_lines(&archive);
        assert_eq!(lines, vec!["100 a", "200 b", "300 c"]);

        assert!(archives[0].starts_with("100.200."));
    }

    #[tokio::test]
    async fn consolidates_large_file_via_external_sort() {
        let dir = TempDir::new().unwrap();
        let lines: Vec<(i64, String)> = (0..50).rev().map(|i| (i * 1000, format!("v{i}"))).collect();
        let path = dir.path().join("latest");
        {
            let mut f = File::create(&path).unwrap();
            for (ts, data) in &lines {
                writeln!(f, "{ts} {data}").unwrap();
            }
        }

        // Force the external-sort path with a tiny chunk threshold.
        let handle = consolidate(&path, 64, &tokio::runtime::Handle::current()).unwrap();
        handle.await.unwrap();

        let archives: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(archives.len(), 1);
        let merged = read_gzip_lines(&dir.path().join(&archives[0]));
        let expected: Vec<String> = (0..50).map(|i| format!("{i} v{i}")).collect();
        assert_eq!(merged, expected);
    }
}
