//! Aggregator data sources (C10).
//!
//! Grounded on `original_source/skvoz/aggregation/server/sources.py`'s
//! `AggregatorSource`/`AggregatorFile`/`AggregatorTsFile`.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;

use crate::tsfile;

/// `(path, consolidated)` — `consolidated` files are already
/// timestamp-sorted (TSFile archives); others are read and sorted on
/// open, matching `tsfile.read_file`'s `consolidated` flag.
pub type SourceFile = (PathBuf, bool);

/// Resolves FROM aliases to concrete files and reads them back as
/// timestamp-ordered streams. Mirrors `AggregatorSource`.
pub trait Source: Send + Sync {
    /// `keys` maps alias → the raw key patterns named for it in FROM
    /// (`FromClause::keys`). Returns alias → resolved files, matching
    /// `files_from_keys`.
    fn files_from_keys(&self, keys: &HashMap<String, HashSet<String>>) -> io::Result<HashMap<String, Vec<SourceFile>>>;

    /// Drops files whose on-disk time range falls entirely outside
    /// `[start_time, end_time]`. The base behavior is a no-op, matching
    /// `AggregatorSource.filter_files_by_time`'s passthrough default.
    fn filter_files_by_time(&self, files: Vec<SourceFile>, _start_time: i64, _end_time: i64) -> Vec<SourceFile> {
        files
    }

    /// Opens the timestamp-ascending merge of `files`.
    fn read_files(&self, files: &[SourceFile]) -> io::Result<tsfile::MergedReader> {
        tsfile::MergedReader::open(files)
    }
}

/// `FROM FILES ...` — each key pattern is a glob of plain paths outside
/// the `dataDir` key-store layout, read as raw tsfile-format lines.
/// Mirrors `AggregatorFile`.
pub struct FileSource;

impl Source for FileSource {
    fn files_from_keys(&self, keys: &HashMap<String, HashSet<String>>) -> io::Result<HashMap<String, Vec<SourceFile>>> {
        let mut out = HashMap::new();
        for (alias, patterns) in keys {
            let mut files = Vec::new();
            for pattern in patterns {
                for entry in glob::glob(pattern).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))? {
                    if let Ok(path) = entry {
                        if path.exists() {
                            files.push((path, false));
                        }
                    }
                }
            }
            out.insert(alias.clone(), files);
        }
        Ok(out)
    }
}

/// `FROM KEYS ...` — each key pattern is a regex matched against encoded
/// key directories under `data_dir`. Mirrors `AggregatorTsFile`.
pub struct TsFileSource {
    data_dir: PathBuf,
}

impl TsFileSource {
    pub fn new(data_dir: PathBuf) -> Self {
        TsFileSource { data_dir }
    }
}

impl Source for TsFileSource {
    fn files_from_keys(&self, keys: &HashMap<String, HashSet<String>>) -> io::Result<HashMap<String, Vec<SourceFile>>> {
        let mut out = HashMap::new();
        for (alias, patterns) in keys {
            let mut files = Vec::new();
            for pattern in patterns {
                let rx = regex::Regex::new(pattern).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                for key in tsfile::find_keys(&self.data_dir, &rx)? {
                    files.extend(tsfile::find_files(&self.data_dir, &key)?);
                }
            }
            out.insert(alias.clone(), files);
        }
        Ok(out)
    }

    fn filter_files_by_time(&self, files: Vec<SourceFile>, start_time: i64, end_time: i64) -> Vec<SourceFile> {
        tsfile::filter_files_by_time(files, start_time, end_time)
    }
}
