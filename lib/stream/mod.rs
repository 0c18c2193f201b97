//! Growable buffers that let many readers share one in-flight remote stream.
//!
//! A [`StreamingBuffer`] drains a remote byte stream (a log tail, an object download) into memory
//! and serves positional reads over whatever has arrived so far. A [`StreamCache`] keys buffers by
//! stream identity so repeated opens of the same remote stream share one pump.

use std::{io, sync::Arc};

use thiserror::Error;

/// Owning cache of shared buffers.
pub mod cache;
mod confirm;
/// The buffer itself and its pump.
pub mod buffer;

pub use buffer::{BufferOptions, PostProcess, StreamingBuffer};
pub use cache::StreamCache;

/// Failures surfaced by a [`StreamingBuffer`].
///
/// I/O errors are reference counted so one failure can be handed to every caller that shares the
/// buffer, and cached by a [`KeyedCache`](crate::cache::KeyedCache).
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The underlying stream could not be opened.
    #[error("failed to open stream: {0}")]
    Open(Arc<io::Error>),

    /// The underlying stream failed mid-read. Content buffered so far has been discarded.
    #[error("stream read failed: {0}")]
    Read(Arc<io::Error>),

    /// The pump task died without reporting a result.
    #[error("stream pump terminated unexpectedly")]
    PumpPanicked,

    /// Every reference on the buffer was released while it was being opened.
    #[error("stream was released while it was being opened")]
    Released,
}

impl StreamError {
    /// The I/O error kind that best describes this failure.
    #[must_use]
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::Open(e) | Self::Read(e) => e.kind(),
            Self::PumpPanicked => io::ErrorKind::Other,
            Self::Released => io::ErrorKind::ConnectionAborted,
        }
    }
}
