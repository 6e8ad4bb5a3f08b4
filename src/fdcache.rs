//! Bounded-by-idle-time cache of open handles keyed by path or address (C2).
//!
//! Grounded on `original_source/skvoz/collection/server/cache.py`'s
//! `TimedFdCache`, generalized over handle type the way
//! `node-forwarder/src/spool.rs`'s `SegmentWriter` owns its `std::fs::File`
//! directly rather than through a trait object. Not thread-safe: per the
//! spec invariant, the cache must be owned by a single consumer task.

use std::collections::HashMap;
use std::hash::Hash;
use std::io;
use std::time::{Duration, Instant};
use tracing::debug;

/// A handle that can be idly flushed when evicted from the cache.
pub trait CachedHandle {
    fn flush_handle(&mut self) -> io::Result<()>;
}

impl CachedHandle for std::fs::File {
    fn flush_handle(&mut self) -> io::Result<()> {
        std::io::Write::flush(self)
    }
}

impl CachedHandle for std::net::TcpStream {
    fn flush_handle(&mut self) -> io::Result<()> {
        std::io::Write::flush(self)
    }
}

#[cfg(unix)]
impl CachedHandle for std::os::unix::net::UnixStream {
    fn flush_handle(&mut self) -> io::Result<()> {
        std::io::Write::flush(self)
    }
}

impl CachedHandle for crate::tsfile::Writer {
    fn flush_handle(&mut self) -> io::Result<()> {
        self.flush()
    }
}

pub struct TimedFdCache<K, V> {
    timeout: Duration,
    flush_time: Instant,
    entries: HashMap<K, (V, Instant)>,
}

impl<K, V> TimedFdCache<K, V>
where
    K: Eq + Hash + Clone,
    V: CachedHandle,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            flush_time: Instant::now(),
            entries: HashMap::new(),
        }
    }

    /// Returns the cached handle for `key`, opening a fresh one with
    /// `opener` on a miss. Every call refreshes `last_access` and, once
    /// `timeout` has elapsed since the last flush pass, sweeps idle
    /// entries — mirroring `TimedFdCache.open`.
    pub fn open<F>(&mut self, key: &K, opener: F) -> io::Result<&mut V>
    where
        F: FnOnce(&K) -> io::Result<V>,
    {
        let now = Instant::now();
        if !self.entries.contains_key(key) {
            let handle = opener(key)?;
            self.entries.insert(key.clone(), (handle, now));
        } else {
            self.entries.get_mut(key).unwrap().1 = now;
        }

        if now.duration_since(self.flush_time) > self.timeout {
            self.flush();
        }

        Ok(&mut self.entries.get_mut(key).unwrap().0)
    }

    /// Drops any entry whose `last_access` is older than `timeout`,
    /// flushing it first. Mirrors `TimedFdCache.flush`.
    pub fn flush(&mut self) {
        let now = Instant::now();
        let timeout = self.timeout;
        let stale: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, (_, last))| now.duration_since(*last) > timeout)
            .map(|(k, _)| k.clone())
            .collect();

        for key in stale {
            if let Some((mut handle, _)) = self.entries.remove(&key) {
                let _ = handle.flush_handle();
            }
        }
        self.flush_time = now;
    }

    /// Flushes and drops every entry, for use on shutdown.
    pub fn close(&mut self) {
        debug!(count = self.entries.len(), "closing fd cache");
        for (_, (mut handle, _)) in self.entries.drain() {
            let _ = handle.flush_handle();
        }
    }

    /// Forces a handle out of the cache without flushing — used when a
    /// socket write fails so the next access reconnects.
    pub fn invalidate(&mut self, key: &K) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct CountingHandle(Rc<RefCell<u32>>);
    impl CachedHandle for CountingHandle {
        fn flush_handle(&mut self) -> io::Result<()> {
            *self.0.borrow_mut() += 1;
            Ok(())
        }
    }

    #[test]
    fn open_reuses_existing_entry() {
        let opens = Rc::new(RefCell::new(0u32));
        let mut cache: TimedFdCache<String, CountingHandle> =
            TimedFdCache::new(Duration::from_secs(60));

        let opens_clone = opens.clone();
        cache
            .open(&"a".to_string(), move |_| {
                *opens_clone.borrow_mut() += 1;
                Ok(CountingHandle(Rc::new(RefCell::new(0))))
            })
            .unwrap();
        let opens_clone = opens.clone();
        cache
            .open(&"a".to_string(), move |_| {
                *opens_clone.borrow_mut() += 1;
                Ok(CountingHandle(Rc::new(RefCell::new(0))))
            })
            .unwrap();

        assert_eq!(*opens.borrow(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn flush_evicts_only_idle_entries() {
        let mut cache: TimedFdCache<String, CountingHandle> =
            TimedFdCache::new(Duration::from_millis(0));
        let flushes = Rc::new(RefCell::new(0));
        cache
            .open(&"a".to_string(), |_| Ok(CountingHandle(flushes.clone())))
            .unwrap();

        std::thread::sleep(Duration::from_millis(5));
        cache.flush();

        assert_eq!(cache.len(), 0);
        assert_eq!(*flushes.borrow(), 1);
    }

    #[test]
    fn close_flushes_and_clears_everything() {
        let mut cache: TimedFdCache<String, CountingHandle> =
            TimedFdCache::new(Duration::from_secs(60));
        let flushes = Rc::new(RefCell::new(0));
        cache
            .open(&"a".to_string(), |_| Ok(CountingHandle(flushes.clone())))
            .unwrap();
        cache.close();

        assert_eq!(cache.len(), 0);
        assert_eq!(*flushes.borrow(), 1);
    }
}
