//! Key-directory and on-disk filename encoding (C1).
//!
//! Grounded on `original_source/skvoz/util/tsfile.py`'s `name_encode`/
//! `name_decode` (urlsafe base64) and `RX_NAME`/`RX_CONSOLIDATED`.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;

/// Encodes a series key into its on-disk directory name.
pub fn encode_key(key: &str) -> String {
    URL_SAFE.encode(key.as_bytes())
}

/// Decodes a directory name back into a series key. Directories that
/// aren't valid base64 are passed through unchanged, matching the
/// original's fallback when `name_decode` raises.
pub fn decode_key(encoded: &str) -> String {
    URL_SAFE
        .decode(encoded.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| encoded.to_string())
}

/// What a filename inside a key directory means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    /// The open append log.
    Latest,
    /// In-flight consolidation input (`<uid>.tsc`).
    Building { uid: String },
    /// An immutable, gzip-compressed archive (`<min_ts>.<span>.<uid>`).
    Archive { min_ts: i64, span: i64, uid: String },
}

impl FileKind {
    pub fn is_archive(&self) -> bool {
        matches!(self, FileKind::Archive { .. })
    }
}

fn name_regex() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    RX.get_or_init(|| {
        Regex::new(r"^(?:(latest)|([a-z0-9]+)\.tsc|([0-9]+)\.([0-9]+)\.([a-z0-9]+))$").unwrap()
    })
}

fn consolidated_regex() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    RX.get_or_init(|| Regex::new(r"^([0-9]+)\.([0-9]+)\.([a-z0-9]+)$").unwrap())
}

/// Parses a filename inside a key directory, mirroring `RX_NAME`.
pub fn parse_file_name(name: &str) -> Option<FileKind> {
    let caps = name_regex().captures(name)?;
    if caps.get(1).is_some() {
        return Some(FileKind::Latest);
    }
    if let Some(uid) = caps.get(2) {
        return Some(FileKind::Building {
            uid: uid.as_str().to_string(),
        });
    }
    let min_ts: i64 = caps.get(3)?.as_str().parse().ok()?;
    let span: i64 = caps.get(4)?.as_str().parse().ok()?;
    let uid = caps.get(5)?.as_str().to_string();
    Some(FileKind::Archive { min_ts, span, uid })
}

/// Mirrors `RX_CONSOLIDATED.match` — true for already-archived filenames.
pub fn is_consolidated(name: &str) -> bool {
    consolidated_regex().is_match(name)
}

/// Builds the archive filename for a consolidation run.
pub fn archive_name(min_ts: i64, max_ts: i64, uid: &str) -> String {
    format!("{}.{}.{}", min_ts, max_ts - min_ts, uid)
}

pub fn building_name(uid: &str) -> String {
    format!("{uid}.tsc")
}

pub fn build_name(uid: &str) -> String {
    format!("{uid}.build")
}
