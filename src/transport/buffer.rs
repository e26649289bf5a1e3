//! Growable receive/staging buffer owned by a single channel.
//!
//! Capacity only ever grows, by doubling, so that a channel receiving
//! messages of increasing size reallocates a logarithmic number of times.
//! Capacity therefore always stays a power-of-two multiple of the size the
//! buffer was created with.

use crate::error::{Error, Result};
use std::io;

/// Capacity used when a channel is allocated without an explicit size.
pub const DEFAULT_CAPACITY: usize = 1;

/// Byte store with a `used` watermark.
///
/// Invariant: `used <= capacity`. Bytes past the capacity a grow added are
/// zero until written.
#[derive(Debug)]
pub struct Buffer {
    /// Backing storage; its length is the capacity.
    data: Vec<u8>,
    /// Number of bytes holding a message.
    used: usize,
    /// Capacity at construction, the base of the doubling sequence.
    initial: usize,
    /// Bytes handed out by construct/grow and not yet returned by release.
    allocated: usize,
}

impl Buffer {
    /// Create a zeroed buffer. A size of 0 selects [`DEFAULT_CAPACITY`].
    pub fn new(size: usize) -> Self {
        let size = if size == 0 { DEFAULT_CAPACITY } else { size };
        Self {
            data: vec![0u8; size],
            used: 0,
            initial: size,
            allocated: size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Bytes currently accounted to this buffer.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// The message bytes (`used` of them).
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Ensure capacity is at least `min_size`.
    ///
    /// Doubles until the request fits and zero-fills the new region. Does
    /// nothing when the buffer is already large enough.
    pub fn grow(&mut self, min_size: usize) {
        let mut size = self.capacity();
        if size >= min_size {
            return;
        }
        if size == 0 {
            size = self.initial;
        }
        while size < min_size {
            size = size.saturating_mul(2);
        }

        let added = size - self.capacity();
        self.data.resize(size, 0);
        self.allocated += added;
    }

    /// Forget the message and zero the contents. Capacity is kept.
    pub fn clear(&mut self) {
        self.used = 0;
        self.data.fill(0);
    }

    /// Grow to `len` and expose the first `len` bytes for a receive.
    pub(crate) fn prepare(&mut self, len: usize) -> &mut [u8] {
        self.grow(len);
        self.used = len;
        &mut self.data[..len]
    }

    /// Free the storage and check the allocation accounting nets to zero.
    ///
    /// Releasing twice is a no-op.
    pub fn release(&mut self) -> Result<()> {
        let freed = self.capacity();
        self.data = Vec::new();
        self.used = 0;
        self.allocated = self.allocated.saturating_sub(freed);

        if self.allocated != 0 {
            return Err(Error::BufferLeak(self.allocated));
        }
        Ok(())
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Appends to the message, growing as needed.
impl io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let end = self.used + buf.len();
        self.grow(end);
        self.data[self.used..end].copy_from_slice(buf);
        self.used = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
