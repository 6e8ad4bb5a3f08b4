//! Concurrent line-protocol ingest server (C5).
//!
//! Grounded on `original_source/skvoz/collection/server/service.py`
//! (`CollectRequestHandler`, `CollectorUnixServer`, `CollectorTcpServer`)
//! for the per-connection framing contract, and on `node-forwarder`'s
//! `http.rs`/`main.rs` for the Rust idiom: one task per accepted
//! connection, `tokio::select!` against a shutdown signal.

use anyhow::{Context, Result};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::config::BindAddress;
use super::queue::{QueueHandle, Sample};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Parses one `"<key> <ts> <value>\n"` frame, splitting on the first two
/// spaces only so `value` may itself contain spaces. Mirrors
/// `CollectRequestHandler.handle_request`.
fn parse_frame(line: &str) -> Option<Sample> {
    let (key, rest) = line.split_once(' ')?;
    let (ts, value) = rest.split_once(' ')?;
    if key.is_empty() {
        return None;
    }
    let timestamp = if ts == "-" {
        now_millis()
    } else {
        ts.parse().ok()?
    };
    Some(Sample {
        key: key.to_string(),
        timestamp,
        value: value.to_string(),
    })
}

async fn serve_lines<R>(mut reader: BufReader<R>, queue: &QueueHandle)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {
                let frame = line.trim_end_matches(['\n', '\r']);
                if frame.is_empty() {
                    continue;
                }
                match parse_frame(frame) {
                    Some(sample) => queue.put(sample),
                    None => warn!(frame, "malformed ingest frame"),
                }
            }
            Err(err) => {
                warn!(error = %err, "connection read failure");
                break;
            }
        }
    }
}

async fn run_tcp(listener: TcpListener, queue: QueueHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let queue = queue.clone();
                tokio::spawn(async move {
                    info!(%peer, "accepted collector connection");
                    let (read_half, _write_half) = stream.into_split();
                    serve_lines(BufReader::new(read_half), &queue).await;
                });
            }
            Err(err) => warn!(error = %err, "accept failure"),
        }
    }
}

#[cfg(unix)]
async fn run_unix(listener: UnixListener, queue: QueueHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let queue = queue.clone();
                tokio::spawn(async move {
                    info!("accepted collector connection");
                    let (read_half, _write_half) = stream.into_split();
                    serve_lines(BufReader::new(read_half), &queue).await;
                });
            }
            Err(err) => warn!(error = %err, "accept failure"),
        }
    }
}

/// Binds and serves the collect protocol until the process is signalled to
/// shut down. Mirrors `CollectorUnixServer`/`CollectorTcpServer` dispatch on
/// `AbstractService.run`'s bound address.
pub async fn serve(bind_address: BindAddress, queue: QueueHandle) -> Result<()> {
    match bind_address {
        BindAddress::Tcp(addr) => {
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind tcp {addr}"))?;
            info!(%addr, "collect server listening");
            run_tcp(listener, queue).await;
        }
        #[cfg(unix)]
        BindAddress::Unix(path) => {
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)
                .with_context(|| format!("failed to bind unix socket {}", path.display()))?;
            info!(path = %path.display(), "collect server listening");
            run_unix(listener, queue).await;
        }
        #[cfg(not(unix))]
        BindAddress::Unix(path) => {
            anyhow::bail!("unix sockets are not supported on this platform: {}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_frame() {
        let sample = parse_frame("host/cpu 1000 0.42").unwrap();
        assert_eq!(sample.key, "host/cpu");
        assert_eq!(sample.timestamp, 1000);
        assert_eq!(sample.value, "0.42");
    }

    #[test]
    fn value_may_contain_spaces() {
        let sample = parse_frame("host/tag 1000 a b c").unwrap();
        assert_eq!(sample.value, "a b c");
    }

    #[test]
    fn dash_timestamp_is_substituted() {
        let sample = parse_frame("host/cpu - 0.42").unwrap();
        assert!(sample.timestamp > 0);
    }

    #[test]
    fn rejects_frame_missing_value() {
        assert!(parse_frame("host/cpu 1000").is_none());
    }
}
