//! Shares one [`StreamingBuffer`] between every opener of the same remote stream.
//!
//! The cache itself holds one reference on every buffer it stores, so a stream stays open while
//! its entry is cached even if no reader currently has it open. Evicting the entry (expiry,
//! [`remove`](StreamCache::remove) or [`flush`](StreamCache::flush)) releases that reference, and
//! the stream closes once the last reader has released theirs as well. A background sweep evicts
//! expired entries, so an idle stream is released within roughly two TTLs of its last open.

use std::{future::Future, io, sync::Arc, time::Duration};

use tokio::{io::AsyncRead, task::JoinHandle};
use tracing::trace;

use super::{BufferOptions, PostProcess, StreamError, StreamingBuffer};
use crate::{
    cache::{CloseOnEvict, KeyedCache},
    config::Config,
};

/// Shortest period between two sweeps for expired streams.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

type Buffers = KeyedCache<Arc<StreamingBuffer>, StreamError, CloseOnEvict>;

/// Keyed cache of live stream buffers.
pub struct StreamCache {
    buffers: Arc<Buffers>,
    ttl: Duration,
    options: BufferOptions,
    janitor: JoinHandle<()>,
}

impl StreamCache {
    /// Create a cache whose entries live for `ttl` and whose buffers use `options`.
    ///
    /// # Panics
    ///
    /// If called outside a tokio runtime, which the expiry sweep runs on.
    #[must_use]
    pub fn new(ttl: Duration, options: BufferOptions) -> Self {
        Self::with_buffers(KeyedCache::with_eviction(CloseOnEvict), ttl, options)
    }

    /// Create a cache as described by the configuration.
    ///
    /// # Panics
    ///
    /// If called outside a tokio runtime, which the expiry sweep runs on.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::with_buffers(
            KeyedCache::with_shards(config.cache.lock_shards, CloseOnEvict),
            config.stream.ttl(),
            config.stream.buffer_options(),
        )
    }

    fn with_buffers(buffers: Buffers, ttl: Duration, options: BufferOptions) -> Self {
        let buffers = Arc::new(buffers);
        let janitor = buffers.spawn_janitor(ttl.max(MIN_SWEEP_INTERVAL));
        Self {
            buffers,
            ttl,
            options,
            janitor,
        }
    }

    /// Open the stream identified by `key`, sharing a live buffer if one is cached.
    ///
    /// The returned buffer is registered to the caller, who must [`close`](StreamingBuffer::close)
    /// it when done. If no buffer is cached, `open` is used to start one; a failed open is cached
    /// for the TTL like any other failed generation.
    ///
    /// # Errors
    ///
    /// Whatever [`StreamingBuffer::stream`] reported when the cached buffer was started.
    pub async fn open<F, Fut, R>(&self, key: &str, open: F) -> Result<Arc<StreamingBuffer>, StreamError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = io::Result<R>> + Send + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.open_with(key, None, open).await
    }

    /// Like [`open`](Self::open), applying `post_process` to a newly created buffer.
    ///
    /// # Errors
    ///
    /// Whatever [`StreamingBuffer::stream`] reported when the cached buffer was started.
    pub async fn open_with<F, Fut, R>(
        &self,
        key: &str,
        post_process: Option<Arc<dyn PostProcess>>,
        open: F,
    ) -> Result<Arc<StreamingBuffer>, StreamError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = io::Result<R>> + Send + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut open = Some(open);
        loop {
            let buffer = self
                .buffers
                .get_or_update(key, self.ttl, || {
                    let buffer = Arc::new(StreamingBuffer::with_options(
                        key,
                        self.options,
                        post_process.clone(),
                    ));
                    let open = open.take();
                    async move {
                        let open = open.ok_or(StreamError::Released)?;
                        buffer.stream(open).await?;
                        Ok(buffer)
                    }
                })
                .await?;

            if buffer.retain() {
                return Ok(buffer);
            }

            // No reference is left on the cached buffer, so it is closed for good. Unlink this
            // exact entry so the next lookup starts a new stream.
            trace!(key, "Cached stream has no references left, dropping its entry.");
            self.buffers
                .remove_if(key, |stored| {
                    matches!(stored, Ok(cached) if Arc::ptr_eq(cached, &buffer))
                })
                .await;
            if open.is_none() {
                return Err(StreamError::Released);
            }
        }
    }

    /// Release the cache's reference on the buffer cached under `key`.
    pub async fn remove(&self, key: &str) -> bool {
        self.buffers.remove(key).await
    }

    /// Release the cache's reference on every cached buffer.
    pub async fn flush(&self) {
        self.buffers.flush().await;
    }

    /// Number of cached entries, including cached open failures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl Drop for StreamCache {
    fn drop(&mut self) {
        self.janitor.abort();
    }
}
