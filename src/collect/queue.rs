//! Bounded MPSC ingest queue with a single consumer applying WAL append
//! and sink fan-out (C4).
//!
//! Grounded on `original_source/skvoz/collection/server/queue.py`
//! (`CollectQueue`) for the WAIT_TIMEOUT-bounded consumer loop and
//! at-most-once WAL semantics, and on
//! `node-forwarder/src/spool.rs`'s `spawn_spool_thread`/`run_spool_thread`
//! for the Rust idiom: a dedicated OS thread owns all mutable state so no
//! locking is needed, and callers talk to it through a channel handle.

use std::io::{self, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;
use tracing::warn;

use crate::config::CollectorConfig;
use crate::fdcache::{CachedHandle, TimedFdCache};
use crate::sink::{Channel, CollectSinks, Sink};
use crate::tsfile::Writer;

/// One ingested row, already split from the wire protocol. Mirrors the
/// `(key, timestamp, value)` tuple `CollectQueue.put` enqueues.
#[derive(Debug, Clone)]
pub struct Sample {
    pub key: String,
    pub timestamp: i64,
    pub value: String,
}

/// Handle the async server side holds to enqueue samples onto the
/// dedicated queue thread.
#[derive(Clone)]
pub struct QueueHandle {
    tx: Sender<Sample>,
}

impl QueueHandle {
    /// Enqueues a sample. Mirrors `CollectQueue.put`: best-effort, no
    /// backpressure signal to the caller beyond a dropped sample if the
    /// consumer thread has already exited.
    pub fn put(&self, sample: Sample) {
        if self.tx.send(sample).is_err() {
            warn!("collect queue consumer is gone, dropping sample");
        }
    }
}

enum SinkHandle {
    File(std::fs::File),
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Write for SinkHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkHandle::File(f) => f.write(buf),
            SinkHandle::Tcp(t) => t.write(buf),
            #[cfg(unix)]
            SinkHandle::Unix(u) => u.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkHandle::File(f) => f.flush(),
            SinkHandle::Tcp(t) => t.flush(),
            #[cfg(unix)]
            SinkHandle::Unix(u) => u.flush(),
        }
    }
}

impl CachedHandle for SinkHandle {
    fn flush_handle(&mut self) -> io::Result<()> {
        self.flush()
    }
}

fn open_sink_handle(channel: &Channel) -> io::Result<SinkHandle> {
    match channel {
        Channel::File(path) => std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(SinkHandle::File),
        Channel::Tcp { host, port } => TcpStream::connect((host.as_str(), *port)).map(SinkHandle::Tcp),
        #[cfg(unix)]
        Channel::Unix(path) => UnixStream::connect(path).map(SinkHandle::Unix),
        #[cfg(not(unix))]
        Channel::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        )),
    }
}

fn sink_cache_key(sink: &Sink) -> String {
    match &sink.channel {
        Channel::File(path) => format!("file:{}", path.display()),
        Channel::Tcp { host, port } => format!("tcp:{host}:{port}"),
        Channel::Unix(path) => format!("unix:{}", path.display()),
    }
}

/// Spawns the dedicated consumer thread and returns a handle to enqueue
/// onto it. Mirrors `CollectorService._starting`'s
/// `threading.Thread(target=collect_queue.run).start()`.
pub fn spawn_queue_thread(config: CollectorConfig, runtime: tokio::runtime::Handle) -> QueueHandle {
    let (tx, rx) = mpsc::channel::<Sample>();
    thread::Builder::new()
        .name("collect-queue".to_string())
        .spawn(move || run_queue_thread(config, runtime, rx))
        .expect("failed to spawn collect queue thread");
    QueueHandle { tx }
}

fn run_queue_thread(
    config: CollectorConfig,
    runtime: tokio::runtime::Handle,
    rx: std::sync::mpsc::Receiver<Sample>,
) {
    let mut wal_cache: TimedFdCache<String, Writer> = TimedFdCache::new(config.queue_wait_timeout);
    let mut sink_cache: TimedFdCache<String, SinkHandle> = TimedFdCache::new(config.queue_wait_timeout);
    let mut sinks = CollectSinks::new(config.sink_conf.clone());

    loop {
        match rx.recv_timeout(config.queue_wait_timeout) {
            Ok(sample) => {
                store_wal(&config, &runtime, &mut wal_cache, &sample);
                fan_out(&mut sink_cache, &mut sinks, &sample);
            }
            Err(RecvTimeoutError::Timeout) => wal_cache.flush(),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Drain whatever is still queued before shutting the caches, mirroring
    // `CollectQueue.run`'s post-loop `while not self.queue.empty()` pass.
    while let Ok(sample) = rx.recv_timeout(Duration::from_secs(1)) {
        store_wal(&config, &runtime, &mut wal_cache, &sample);
        fan_out(&mut sink_cache, &mut sinks, &sample);
    }

    wal_cache.close();
    sink_cache.close();
}

/// WAL append via the fd cache, mirroring `CollectQueue._store_data`. A
/// failure here is logged and the sample is dropped — at-most-once
/// durability, not retried.
fn store_wal(
    config: &CollectorConfig,
    runtime: &tokio::runtime::Handle,
    cache: &mut TimedFdCache<String, Writer>,
    sample: &Sample,
) {
    let data_dir = config.data_dir.clone();
    let rotate_threshold = config.wal_rotate_bytes;
    let chunk_threshold = config.consolidation_chunk_bytes;
    let runtime = runtime.clone();

    let opened = cache.open(&sample.key, move |key| {
        Writer::open(&data_dir, key, rotate_threshold, chunk_threshold, runtime)
    });

    match opened {
        Ok(writer) => {
            if let Err(err) = writer.write(sample.timestamp, &sample.value) {
                warn!(key = %sample.key, error = %err, "WAL failure");
            }
        }
        Err(err) => {
            warn!(key = %sample.key, error = %err, "WAL open failure");
        }
    }
}

/// Fans a sample out to every sink whose key pattern matches, mirroring
/// `CollectQueue._sink_store_data`. Per-sink failures are logged and
/// skipped; a failed socket write invalidates that cache entry so the
/// next delivery reconnects.
fn fan_out(sink_cache: &mut TimedFdCache<String, SinkHandle>, sinks: &mut CollectSinks, sample: &Sample) {
    let line = format!("{} {} {}\n", sample.timestamp, sample.key, sample.value);

    for sink in sinks.sinks() {
        if !sink.matches(&sample.key) {
            continue;
        }

        let key = sink_cache_key(sink);
        let channel = sink.channel.clone();
        let result = sink_cache
            .open(&key, move |_| open_sink_handle(&channel))
            .and_then(|handle| handle.write_all(line.as_bytes()));

        if let Err(err) = result {
            warn!(sink = %sink.name, error = %err, "sink delivery failure");
            sink_cache.invalidate(&key);
        }
    }
}
