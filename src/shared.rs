//! Shared state for tasks that need it.
//!
//! Most coordination in this crate happens by passing values over streams. The types here cover
//! the remaining cases where several tasks need to look at the same data: a counter, a map that is
//! read far more often than written, and a pool of reusable byte buffers.

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    ops::{Deref, DerefMut},
};

use crate::sync::{Mutex, RwLock};

/// A counter that can be bumped from many threads.
#[derive(Debug, Default)]
pub struct Counter {
    value: Mutex<u64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds 1 and returns the new value.
    pub fn increment(&self) -> u64 {
        self.add(1)
    }

    /// Adds `n` and returns the new value.
    pub fn add(&self, n: u64) -> u64 {
        let mut value = self.value.lock();
        *value += n;
        *value
    }

    pub fn get(&self) -> u64 {
        *self.value.lock()
    }
}

/// A [`HashMap`] behind a readers-writer lock.
///
/// Any number of readers may look at the map concurrently; writers get exclusive access.
pub struct SharedMap<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for SharedMap<K, V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for SharedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.map.read().iter()).finish()
    }
}

impl<K: Eq + Hash, V> SharedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the one previously stored under `key`.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.map.write().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.map.write().remove(key)
    }

    /// Returns a clone of the value stored under `key`.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.map.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Runs `f` with shared access to the whole map.
    pub fn with<T>(&self, f: impl FnOnce(&HashMap<K, V>) -> T) -> T {
        f(&self.map.read())
    }

    /// Runs `f` with exclusive access to the whole map.
    pub fn with_mut<T>(&self, f: impl FnOnce(&mut HashMap<K, V>) -> T) -> T {
        f(&mut self.map.write())
    }

    pub fn into_inner(self) -> HashMap<K, V> {
        self.map.into_inner()
    }
}

/// A pool of reusable byte buffers.
///
/// [`BufferPool::get`] hands out an idle buffer if there is one, and allocates a new one otherwise.
/// Buffers come back cleared (with their capacity kept) when the [`Pooled`] handle is dropped. At
/// most `max_idle` buffers are kept around; any beyond that are freed.
pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_idle: usize,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.idle())
            .field("buffer_size", &self.buffer_size)
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

impl BufferPool {
    /// Creates a pool handing out buffers with a capacity of at least `buffer_size` bytes.
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            buffer_size,
            max_idle,
        }
    }

    pub fn get(&self) -> Pooled<'_> {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size));
        Pooled { buf, pool: self }
    }

    /// Number of idle buffers.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn put_back(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

/// A buffer borrowed from a [`BufferPool`]. Goes back to the pool on drop.
pub struct Pooled<'a> {
    buf: Vec<u8>,
    pool: &'a BufferPool,
}

impl<'a> Pooled<'a> {
    /// Takes the buffer out of the pool for good.
    pub fn detach(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

impl<'a> fmt::Debug for Pooled<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.buf.fmt(f)
    }
}

impl<'a> Deref for Pooled<'a> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl<'a> DerefMut for Pooled<'a> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl<'a> Drop for Pooled<'a> {
    fn drop(&mut self) {
        // Detached buffers leave an empty, unallocated `Vec` behind.
        if self.buf.capacity() != 0 {
            self.pool.put_back(std::mem::take(&mut self.buf));
        }
    }
}
