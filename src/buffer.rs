//! Growable byte buffer with a hard size limit.
//!
//! Used for request URLs, header fields and in-memory request bodies.
//! Capacity doubles on growth and never exceeds `limit + 1`, so a buffer
//! can always hold exactly `limit` bytes. A write that does not fit is
//! truncated to what does and reported as [`BufferError::LimitOver`].

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Limit applied when none is given.
pub const DEFAULT_LIMIT: usize = 1024 * 1024 * 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// The write crossed the limit; only `written` bytes were stored.
    #[error("buffer limit exceeded ({written} bytes stored)")]
    LimitOver { written: usize },
}

#[derive(Debug)]
pub struct Buffer {
    data: BytesMut,
    capacity: usize,
    limit: usize,
}

impl Buffer {
    /// Creates a buffer with an initial capacity and a limit.
    ///
    /// A `limit` of zero means [`DEFAULT_LIMIT`].
    pub fn new(capacity: usize, limit: usize) -> Self {
        let limit = if limit == 0 { DEFAULT_LIMIT } else { limit };
        let capacity = capacity.clamp(1, limit + 1);
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
            limit,
        }
    }

    /// Appends `bytes`, growing as needed.
    ///
    /// When the result would exceed the limit, the bytes that fit are
    /// stored and `LimitOver` is returned.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let needed = self.data.len() + bytes.len();

        if needed >= self.capacity {
            let mut grown = self.capacity.saturating_mul(2);
            if grown <= needed {
                grown = needed + 1;
            }
            if grown > self.limit {
                grown = self.limit + 1;
            }
            self.data.reserve(grown - self.data.len());
            self.capacity = grown;
        }

        if needed >= self.capacity {
            let fits = self.capacity - self.data.len() - 1;
            self.data.extend_from_slice(&bytes[..fits]);
            return Err(BufferError::LimitOver { written: fits });
        }

        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Logical capacity, always `<= limit + 1`.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Hands the contents over as immutable bytes.
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(1024, DEFAULT_LIMIT)
    }
}
