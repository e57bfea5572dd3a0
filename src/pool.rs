//! Scratch-buffer pooling seam.
//!
//! The pool itself lives outside this crate; the frame reader only consumes
//! the interface. Implementations must be thread-safe, must hand back a
//! buffer of at least the requested length and must not block indefinitely.

use std::fmt;

/// Source of scratch buffers for frame payloads.
pub trait BufferPool: Send + Sync {
    /// Returns a buffer with `len() >= min_size`.
    fn get(&self, min_size: usize) -> Vec<u8>;

    /// Hands a buffer back. The pool may recycle or drop it.
    fn put(&self, buf: Vec<u8>);
}

/// No-op pool: every `get` allocates, every `put` drops.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unpooled;

impl BufferPool for Unpooled {
    fn get(&self, min_size: usize) -> Vec<u8> {
        vec![0; min_size]
    }

    fn put(&self, _buf: Vec<u8>) {}
}

impl fmt::Debug for dyn BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn BufferPool")
    }
}
