//! Hot-reloadable fan-out sink registry (C3).
//!
//! Grounded on `original_source/skvoz/collection/server/sink.py`
//! (`CollectSink`, `CollectSinks`) for the reload/match contract; the
//! checksum loop mirrors `ListConfig.checksum`'s 64 KiB block reads, swapped
//! from whole-digest SHA-1 to `sha1::Sha1`'s streaming `update`.

use regex::Regex;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;

const RELOAD_TIMEOUT: Duration = Duration::from_secs(30);
const CHECKSUM_BLOCK: usize = 64 * 1024;

/// Where a sink's fanned-out line is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    File(PathBuf),
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

/// Raw JSON shape of one sink config entry, mirroring `CollectSink.load`'s
/// input dict.
#[derive(Debug, Deserialize)]
struct RawSink {
    name: String,
    #[serde(default)]
    key: String,
    channel: String,
    address: String,
}

/// One fan-out destination. Validated at deserialize time rather than the
/// original's `load()`-time `raise Exception`, so a malformed entry in the
/// config file fails the whole reload instead of surfacing at dispatch.
#[derive(Debug, Clone)]
pub struct Sink {
    pub name: String,
    pub key_regex: Regex,
    pub channel: Channel,
}

impl Sink {
    fn from_raw(raw: RawSink) -> Result<Self, String> {
        let channel = match raw.channel.as_str() {
            "tcp" => {
                let (host, port) = raw
                    .address
                    .split_once(':')
                    .ok_or_else(|| format!("sink '{}' has invalid tcp address", raw.name))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| format!("sink '{}' has invalid tcp port", raw.name))?;
                Channel::Tcp {
                    host: host.to_string(),
                    port,
                }
            }
            "unix" => Channel::Unix(PathBuf::from(&raw.address)),
            "file" => Channel::File(PathBuf::from(&raw.address)),
            other => return Err(format!("sink '{}' has invalid channel '{other}'", raw.name)),
        };

        let key_regex = Regex::new(&raw.key)
            .map_err(|e| format!("sink '{}' has invalid key regex: {e}", raw.name))?;

        Ok(Sink {
            name: raw.name,
            key_regex,
            channel,
        })
    }

    /// Mirrors `CollectSink.match`: true when `key_regex` matches at the
    /// start of `key`. An empty pattern matches every key (`Regex::new("")`
    /// matches at position 0 of anything), the same "match all" reading
    /// spec.md §9 sanctions for an empty-key sink.
    pub fn matches(&self, key: &str) -> bool {
        self.key_regex.is_match(key)
    }
}

fn streaming_sha1(path: &Path) -> io::Result<[u8; 20]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; CHECKSUM_BLOCK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Lazily reloading sink list. Every access checks the reload clock, and a
/// changed checksum triggers a full atomic swap of the sink list. Mirrors
/// `CollectSinks`.
pub struct CollectSinks {
    sink_conf: Option<PathBuf>,
    sinks: Vec<Sink>,
    checksum: Option<[u8; 20]>,
    last_check: Option<Instant>,
}

impl CollectSinks {
    pub fn new(sink_conf: Option<PathBuf>) -> Self {
        Self {
            sink_conf,
            sinks: Vec::new(),
            checksum: None,
            last_check: None,
        }
    }

    /// Returns the current sink list, reloading from disk first if the
    /// reload window has elapsed and the file's checksum changed.
    pub fn sinks(&mut self) -> &[Sink] {
        self.reload();
        &self.sinks
    }

    fn reload(&mut self) {
        let Some(path) = self.sink_conf.clone() else {
            return;
        };

        if let Some(last) = self.last_check {
            if last.elapsed() <= RELOAD_TIMEOUT {
                return;
            }
        }

        match streaming_sha1(&path) {
            Ok(cksum) => {
                if Some(cksum) == self.checksum {
                    self.last_check = Some(Instant::now());
                    return;
                }
                match Self::parse_conf(&path) {
                    Ok(sinks) => {
                        self.sinks = sinks;
                        self.checksum = Some(cksum);
                    }
                    Err(err) => {
                        warn!(error = %err, path = %path.display(), "failed to reload sinks conf");
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to checksum sinks conf");
            }
        }
        self.last_check = Some(Instant::now());
    }

    fn parse_conf(path: &Path) -> Result<Vec<Sink>, String> {
        let data = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let raw: Vec<RawSink> = serde_json::from_str(&data).map_err(|e| e.to_string())?;
        raw.into_iter().map(Sink::from_raw).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_conf(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_and_matches_sinks() {
        let conf = write_conf(
            r#"[{"name":"a","key":"^host/","channel":"file","address":"/tmp/out"}]"#,
        );
        let mut sinks = CollectSinks::new(Some(conf.path().to_path_buf()));
        let list = sinks.sinks();
        assert_eq!(list.len(), 1);
        assert!(list[0].matches("host/cpu"));
        assert!(!list[0].matches("other/cpu"));
    }

    #[test]
    fn rejects_invalid_channel() {
        let result = Sink::from_raw(RawSink {
            name: "bad".to_string(),
            key: String::new(),
            channel: "smtp".to_string(),
            address: "x".to_string(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn parses_tcp_host_port() {
        let sink = Sink::from_raw(RawSink {
            name: "t".to_string(),
            key: "a".to_string(),
            channel: "tcp".to_string(),
            address: "127.0.0.1:9000".to_string(),
        })
        .unwrap();
        assert_eq!(
            sink.channel,
            Channel::Tcp {
                host: "127.0.0.1".to_string(),
                port: 9000
            }
        );
    }

    #[test]
    fn unchanged_checksum_keeps_previous_list() {
        let conf = write_conf(
            r#"[{"name":"a","key":"x","channel":"file","address":"/tmp/out"}]"#,
        );
        let mut sinks = CollectSinks::new(Some(conf.path().to_path_buf()));
        sinks.sinks();
        let first_checksum = sinks.checksum;

        // Force a re-check by resetting the reload clock, content unchanged.
        sinks.last_check = None;
        sinks.sinks();
        assert_eq!(sinks.checksum, first_checksum);
        assert_eq!(sinks.sinks().len(), 1);
    }
}
