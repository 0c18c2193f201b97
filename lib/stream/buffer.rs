//! A growable in-memory buffer fed by a single pump task.
//!
//! The buffer goes through four phases:
//!
//! - `Idle`: nobody has started a pump yet, or the last open attempt failed.
//! - `Streaming`: one pump task is draining the underlying stream.
//! - `Finished`: the stream hit end-of-stream or a read error. Readers may keep draining.
//! - `Closed`: the last consumer released the buffer and the underlying stream was dropped.
//!
//! Consumers register with [`StreamingBuffer::stream`] and release with
//! [`StreamingBuffer::close`]. Only the registration that moves the count from zero to one starts
//! a pump. Only the release that moves it from one to zero tears the pump down.

use std::{
    fmt,
    future::Future,
    io,
    sync::Arc,
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{
    io::{AsyncRead, AsyncReadExt as _},
    sync::{Notify, watch},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use super::{
    StreamError,
    confirm::{ReadySignal, confirm_when_settled},
};
use crate::cache::Release;

/// Upper bound on how much a single pump iteration reads.
const MAX_READ_CHUNK: usize = 1 << 20;

/// Tunables for a [`StreamingBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOptions {
    /// Capacity reserved before the first read.
    pub initial_capacity: usize,
    /// Below this capacity the buffer triples when full. At or above it, it grows by this much.
    pub slow_growth: usize,
    /// Readiness fires once this long passes without new bytes.
    pub idle_confirm: Duration,
    /// Readiness fires at the latest this long after the stream was opened.
    pub max_confirm: Duration,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            initial_capacity: 4 * 1024,
            slow_growth: 64 * 1024 * 1024,
            idle_confirm: Duration::from_millis(100),
            max_confirm: Duration::from_secs(5),
        }
    }
}

/// Capacity to grow to once a buffer of `current` capacity is full.
///
/// The slow-growth threshold is checked against the current capacity, so the last tripling
/// before the threshold can overshoot it.
#[must_use]
pub fn grown_capacity(current: usize, options: &BufferOptions) -> usize {
    if current == 0 {
        options.initial_capacity.max(1)
    } else if current < options.slow_growth {
        current.saturating_mul(3)
    } else {
        current.saturating_add(options.slow_growth)
    }
}

/// Transform applied to the written region after every read.
///
/// `storage` holds every byte kept so far and `fresh` is the offset where this iteration's bytes
/// begin. The transform may rewrite the storage in place and returns `(visible_len, write_index)`:
/// readers see `storage[..visible_len]` and the next read appends at `write_index`. Both values
/// must satisfy `visible_len <= write_index <= storage.len()`.
pub trait PostProcess: Send + Sync {
    /// Reinterpret the freshly read region.
    fn process(&self, storage: &mut [u8], fresh: usize) -> (usize, usize);
}

impl<F> PostProcess for F
where
    F: Fn(&mut [u8], usize) -> (usize, usize) + Send + Sync,
{
    fn process(&self, storage: &mut [u8], fresh: usize) -> (usize, usize) {
        self(storage, fresh)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Streaming,
    Finished,
    Closed,
}

struct Pump {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

struct State {
    /// Written storage. `data.len()` is the write index.
    data: Vec<u8>,
    /// Length of the prefix of `data` exposed to readers.
    size: usize,
    last_update: SystemTime,
    refcount: usize,
    phase: Phase,
    error: Option<StreamError>,
    pump: Option<Pump>,
}

/// A growable buffer shared by every consumer of one remote stream.
///
/// Always handled through an [`Arc`]: the pump task keeps its own reference while it runs.
pub struct StreamingBuffer {
    name: String,
    options: BufferOptions,
    post_process: Option<Arc<dyn PostProcess>>,
    state: RwLock<State>,
}

impl fmt::Debug for StreamingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("StreamingBuffer")
            .field("name", &self.name)
            .field("size", &state.size)
            .field("refcount", &state.refcount)
            .field("phase", &state.phase)
            .finish_non_exhaustive()
    }
}

impl StreamingBuffer {
    /// Create an idle buffer with default options and no post-processing.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, BufferOptions::default(), None)
    }

    /// Create an idle buffer.
    #[must_use]
    pub fn with_options(
        name: impl Into<String>,
        options: BufferOptions,
        post_process: Option<Arc<dyn PostProcess>>,
    ) -> Self {
        Self {
            name: name.into(),
            options,
            post_process,
            state: RwLock::new(State {
                data: Vec::with_capacity(options.initial_capacity),
                size: 0,
                last_update: SystemTime::now(),
                refcount: 0,
                phase: Phase::Idle,
                error: None,
                pump: None,
            }),
        }
    }

    /// Register a consumer, starting the pump if this is the first one.
    ///
    /// A caller that is not the first returns immediately; the existing pump serves it. The first
    /// caller runs `open` on a fresh task and waits until the buffer is ready: the stream read zero
    /// bytes, went quiet for the idle window, or the maximum wait elapsed. If `open` fails, the
    /// registration is undone and the error returned, so a later call can retry.
    ///
    /// # Errors
    ///
    /// [`StreamError::Open`] if `open` fails, [`StreamError::PumpPanicked`] if the pump dies
    /// before reporting readiness.
    pub async fn stream<F, Fut, R>(self: &Arc<Self>, open: F) -> Result<(), StreamError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = io::Result<R>> + Send + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let ready = {
            let mut state = self.state.write();
            state.refcount += 1;
            if state.refcount > 1 || state.phase != Phase::Idle {
                trace!(name = %self.name, refcount = state.refcount, "Joined existing stream.");
                return Ok(());
            }

            let (signal, ready) = ReadySignal::new();
            let shutdown = Arc::new(Notify::new());
            let handle = tokio::spawn(Arc::clone(self).pump(open, signal, Arc::clone(&shutdown)));
            state.phase = Phase::Streaming;
            state.pump = Some(Pump { handle, shutdown });
            ready
        };

        ready.await.unwrap_or(Err(StreamError::PumpPanicked))
    }

    /// Register another consumer without starting a pump.
    ///
    /// Returns `false` if the buffer has no consumers left (it is idle or already closed), in
    /// which case nothing was registered.
    pub fn retain(&self) -> bool {
        let mut state = self.state.write();
        if state.refcount == 0 {
            return false;
        }
        state.refcount += 1;
        true
    }

    async fn pump<F, Fut, R>(self: Arc<Self>, open: F, signal: ReadySignal, shutdown: Arc<Notify>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = io::Result<R>>,
        R: AsyncRead + Unpin,
    {
        let opened = tokio::select! {
            biased;
            () = shutdown.notified() => {
                debug!(name = %self.name, "Released before the stream was opened.");
                signal.fire(Ok(()));
                return;
            }
            opened = open() => opened,
        };

        let reader = match opened {
            Ok(reader) => reader,
            Err(e) => {
                warn!(name = %self.name, error = %e, "Failed to open stream.");
                {
                    let mut state = self.state.write();
                    state.refcount = state.refcount.saturating_sub(1);
                    state.phase = Phase::Idle;
                    state.pump = None;
                }
                signal.fire(Err(StreamError::Open(Arc::new(e))));
                return;
            }
        };
        debug!(name = %self.name, "Opened stream.");

        let signal = Arc::new(signal);
        let (progress_tx, progress_rx) = watch::channel(0u64);
        {
            let signal = Arc::clone(&signal);
            let BufferOptions {
                idle_confirm,
                max_confirm,
                ..
            } = self.options;
            tokio::spawn(async move {
                confirm_when_settled(&signal, progress_rx, idle_confirm, max_confirm).await;
            });
        }

        self.drain(reader, &signal, &progress_tx, &shutdown).await;

        // Covers every exit path, including a release mid-stream before any timer fired.
        signal.fire(Ok(()));
    }

    /// Read until end-of-stream, a read error, or shutdown. Dropping `reader` on return closes the
    /// underlying stream.
    async fn drain<R: AsyncRead + Unpin>(
        &self,
        mut reader: R,
        signal: &ReadySignal,
        progress: &watch::Sender<u64>,
        shutdown: &Notify,
    ) {
        let mut scratch = Vec::new();
        let mut total = 0u64;

        loop {
            let spare = self.reserve();
            scratch.resize(spare.min(MAX_READ_CHUNK), 0);

            let read = tokio::select! {
                biased;
                () = shutdown.notified() => {
                    debug!(name = %self.name, "Stream released while pumping.");
                    return;
                }
                read = reader.read(&mut scratch) => read,
            };

            match read {
                Ok(0) => {
                    signal.fire(Ok(()));
                    self.finish(None);
                    debug!(name = %self.name, bytes = total, "Stream reached its end.");
                    return;
                }
                Ok(n) => {
                    self.commit(&scratch[..n]);
                    total += n as u64;
                    progress.send_replace(total);
                }
                Err(e) => {
                    warn!(name = %self.name, error = %e, "Stream read failed, discarding buffered content.");
                    self.finish(Some(StreamError::Read(Arc::new(e))));
                    return;
                }
            }
        }
    }

    /// Grow the storage if it is full. Returns the spare capacity.
    fn reserve(&self) -> usize {
        let mut state = self.state.write();
        let len = state.data.len();
        let capacity = state.data.capacity();
        if len < capacity {
            return capacity - len;
        }

        let target = grown_capacity(capacity, &self.options);
        state.data.reserve_exact(target - len);
        trace!(name = %self.name, from = capacity, to = state.data.capacity(), "Grew buffer.");
        state.data.capacity() - len
    }

    /// Append freshly read bytes, run the post-process transform and publish the new size.
    fn commit(&self, chunk: &[u8]) {
        let mut state = self.state.write();
        let fresh = state.data.len();
        state.data.extend_from_slice(chunk);

        let write_index = state.data.len();
        let (visible, write_index) = match &self.post_process {
            Some(post_process) => post_process.process(&mut state.data, fresh),
            None => (write_index, write_index),
        };
        assert!(
            visible <= write_index && write_index <= state.data.len(),
            "post-process for {} returned out-of-range indices ({visible}, {write_index}) for {} \
             written bytes",
            self.name,
            state.data.len(),
        );

        state.data.truncate(write_index);
        state.size = visible;
        state.last_update = SystemTime::now();
    }

    fn finish(&self, error: Option<StreamError>) {
        let mut state = self.state.write();
        if error.is_some() {
            state.data = Vec::new();
        }
        state.error = error;
        if state.phase == Phase::Streaming {
            state.phase = Phase::Finished;
        }
    }

    /// Copy visible bytes starting at `offset` into `buf`. Returns how many were copied.
    ///
    /// A count shorter than `buf` means the visible content ends there for now. `Ok(0)` is end of
    /// stream: no more bytes will arrive and `offset` is at or past the end.
    ///
    /// # Errors
    ///
    /// [`io::ErrorKind::WouldBlock`] if nothing is visible at `offset` yet but the stream may still
    /// grow. The read error that ended the stream, if any.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let state = self.state.read();
        if let Some(e) = &state.error {
            return Err(io::Error::new(e.kind(), e.clone()));
        }

        let visible = state.size.min(state.data.len());
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        if offset >= visible {
            return match state.phase {
                Phase::Finished | Phase::Closed => Ok(0),
                Phase::Idle | Phase::Streaming => Err(io::ErrorKind::WouldBlock.into()),
            };
        }

        let n = buf.len().min(visible - offset);
        buf[..n].copy_from_slice(&state.data[offset..offset + n]);
        Ok(n)
    }

    /// Copy of every visible byte.
    #[must_use]
    pub fn snapshot(&self) -> Bytes {
        let state = self.state.read();
        let visible = state.size.min(state.data.len());
        Bytes::copy_from_slice(&state.data[..visible])
    }

    /// Release one consumer. The last release stops the pump and drops the underlying stream
    /// before returning. Releasing a buffer with no consumers is a no-op.
    ///
    /// # Errors
    ///
    /// [`StreamError::PumpPanicked`] if the pump task panicked.
    pub async fn close(&self) -> Result<(), StreamError> {
        let pump = {
            let mut state = self.state.write();
            match state.refcount {
                0 => {
                    debug!(name = %self.name, "Close on a buffer with no consumers.");
                    return Ok(());
                }
                1 => {}
                _ => {
                    state.refcount -= 1;
                    return Ok(());
                }
            }

            state.refcount = 0;
            if state.phase != Phase::Idle {
                state.phase = Phase::Closed;
            }
            state.pump.take()
        };

        let Some(Pump { handle, shutdown }) = pump else {
            return Ok(());
        };
        shutdown.notify_one();
        match handle.await {
            Ok(()) => {
                debug!(name = %self.name, "Closed stream.");
                Ok(())
            }
            Err(e) => {
                warn!(name = %self.name, error = %e, "Stream pump terminated abnormally.");
                Err(StreamError::PumpPanicked)
            }
        }
    }

    /// Name given at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of bytes visible to readers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.state.read().size
    }

    /// Wall-clock time of the last published write.
    #[must_use]
    pub fn last_update(&self) -> SystemTime {
        self.state.read().last_update
    }

    /// Number of registered consumers.
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.state.read().refcount
    }

    /// Returns `true` once the stream ended, failed or was released; no more bytes will arrive.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.state.read().phase, Phase::Finished | Phase::Closed)
    }

    /// Returns `true` once the last consumer released a buffer that had been streamed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.read().phase == Phase::Closed
    }

    /// The read error that ended the stream, if any.
    #[must_use]
    pub fn error(&self) -> Option<StreamError> {
        self.state.read().error.clone()
    }
}

impl Release for StreamingBuffer {
    type Error = StreamError;

    fn release(&self) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.close()
    }
}
