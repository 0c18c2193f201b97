//! gatefs shared library.
//!
//! The local caching and stream-buffering layer of a virtual-filesystem gateway: backend clients
//! cache listings and metadata in a [`cache::KeyedCache`] or [`cache::SingleValueCache`], and
//! expose streamed content through shared [`stream::StreamingBuffer`]s.

/// Caching primitives for gatefs.
pub mod cache;
/// Configuration settings.
pub mod config;
/// Stream buffering.
pub mod stream;
