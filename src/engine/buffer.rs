//! Pooled buffers for the serializer and cipher paths.
//!
//! A [`BufferPool`] hands out [`PooledBuffer`]s of at least the requested capacity and
//! takes their storage back when they are released or dropped. Buffers are grouped by
//! power-of-two size classes so a returned buffer can serve any later request of its
//! class or smaller.
//!
//! A `PooledBuffer` is also a write cursor: [`tail_mut`](PooledBuffer::tail_mut) exposes
//! the unwritten space, [`advance`](PooledBuffer::advance) commits what was written into
//! it, and [`written`](PooledBuffer::written) views the committed prefix.

use std::io;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{Error, Result};

/// Smallest size class handed out by a pool.
pub const MIN_BUFFER_SIZE: usize = 256;
/// Buffers larger than this are not kept after release.
pub const MAX_POOLED_SIZE: usize = 64 * 1024 * 1024;
const MAX_RETAINED_PER_CLASS: usize = 8;

static BYTES: Lazy<BufferPool<u8>> = Lazy::new(BufferPool::new);
static CHARS: Lazy<BufferPool<u16>> = Lazy::new(BufferPool::new);

/// The process-wide byte pool.
pub fn bytes() -> &'static BufferPool<u8> {
    &BYTES
}

/// The process-wide UTF-16 code unit pool.
pub fn chars() -> &'static BufferPool<u16> {
    &CHARS
}

/// A shared pool of reusable buffers.
pub struct BufferPool<T> {
    classes: Mutex<Vec<Vec<Vec<T>>>>,
}

impl<T: Copy + Default> BufferPool<T> {
    pub fn new() -> Self {
        Self {
            classes: Mutex::new(Vec::new()),
        }
    }

    /// Rents a buffer with room for at least `capacity` elements.
    pub fn rent(&self, capacity: usize) -> PooledBuffer<'_, T> {
        PooledBuffer {
            pool: self,
            storage: Some(self.take(capacity)),
            written: 0,
        }
    }

    /// Number of idle buffers currently held by the pool.
    pub fn idle(&self) -> usize {
        self.classes.lock().iter().map(Vec::len).sum()
    }

    fn take(&self, capacity: usize) -> Vec<T> {
        let class = class_for(capacity);
        if let Some(buf) = self
            .classes
            .lock()
            .get_mut(class)
            .and_then(|bucket| bucket.pop())
        {
            return buf;
        }
        vec![T::default(); class_size(class).max(capacity)]
    }

    fn give_back(&self, buf: Vec<T>) {
        if buf.len() < MIN_BUFFER_SIZE || buf.len() > MAX_POOLED_SIZE {
            return;
        }
        // Floor class: every buffer in class `n` holds at least `class_size(n)` elements.
        let class = (buf.len() / MIN_BUFFER_SIZE).ilog2() as usize;
        let mut classes = self.classes.lock();
        if classes.len() <= class {
            classes.resize_with(class + 1, Vec::new);
        }
        let bucket = &mut classes[class];
        if bucket.len() < MAX_RETAINED_PER_CLASS {
            bucket.push(buf);
        }
    }
}

impl<T: Copy + Default> Default for BufferPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn class_for(capacity: usize) -> usize {
    let size = capacity.max(MIN_BUFFER_SIZE).next_power_of_two();
    (size / MIN_BUFFER_SIZE).trailing_zeros() as usize
}

fn class_size(class: usize) -> usize {
    MIN_BUFFER_SIZE << class
}

/// A buffer rented from a [`BufferPool`], returned to it on release or drop.
pub struct PooledBuffer<'p, T: Copy + Default> {
    pool: &'p BufferPool<T>,
    storage: Option<Vec<T>>,
    written: usize,
}

impl<'p, T: Copy + Default> PooledBuffer<'p, T> {
    /// Total elements the buffer can hold without growing.
    pub fn capacity(&self) -> usize {
        self.storage.as_ref().map_or(0, Vec::len)
    }

    /// Elements committed so far.
    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Elements still available after the committed prefix.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.written
    }

    /// The committed prefix.
    pub fn written(&self) -> &[T] {
        match &self.storage {
            Some(buf) => &buf[..self.written],
            None => &[],
        }
    }

    pub fn written_mut(&mut self) -> &mut [T] {
        let written = self.written;
        match &mut self.storage {
            Some(buf) => &mut buf[..written],
            None => &mut [],
        }
    }

    /// The unwritten tail, without growing.
    pub fn tail_mut(&mut self) -> &mut [T] {
        let written = self.written;
        match &mut self.storage {
            Some(buf) => &mut buf[written..],
            None => &mut [],
        }
    }

    /// The unwritten tail, growing the buffer first so it holds at least `min` elements.
    pub fn tail_with(&mut self, min: usize) -> &mut [T] {
        if self.remaining() < min {
            self.grow(self.written + min);
        }
        self.tail_mut()
    }

    /// Commits `count` elements written into the tail.
    pub fn advance(&mut self, count: usize) -> Result<()> {
        let available = self.remaining();
        if count > available {
            return Err(Error::OutOfRange {
                requested: count,
                available,
            });
        }
        self.written += count;
        Ok(())
    }

    /// Un-commits the last `count` elements.
    pub fn rewind(&mut self, count: usize) -> Result<()> {
        if count > self.written {
            return Err(Error::OutOfRange {
                requested: count,
                available: self.written,
            });
        }
        self.written -= count;
        Ok(())
    }

    /// Forgets everything written; capacity is kept.
    pub fn reset(&mut self) {
        self.written = 0;
    }

    /// Appends `data`, growing as needed.
    pub fn write(&mut self, data: &[T]) {
        let tail = self.tail_with(data.len());
        tail[..data.len()].copy_from_slice(data);
        self.written += data.len();
    }

    /// Copies the committed prefix out into an owned vector.
    pub fn to_vec(&self) -> Vec<T> {
        self.written().to_vec()
    }

    /// Returns the storage to the pool. Calling it more than once is harmless.
    pub fn release(&mut self) {
        self.written = 0;
        if let Some(buf) = self.storage.take() {
            self.pool.give_back(buf);
        }
    }

    fn grow(&mut self, min_capacity: usize) {
        let target = min_capacity.max(self.capacity().saturating_mul(2));
        let mut next = self.pool.take(target);
        if let Some(old) = self.storage.take() {
            next[..self.written].copy_from_slice(&old[..self.written]);
            self.pool.give_back(old);
        }
        self.storage = Some(next);
    }
}

impl<'p, T: Copy + Default> Drop for PooledBuffer<'p, T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<'p> io::Write for PooledBuffer<'p, u8> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        PooledBuffer::write(self, data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
