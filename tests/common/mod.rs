#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use gatefs::stream::StreamingBuffer;
use tokio::io::{AsyncRead, DuplexStream, Empty, ReadBuf};

/// Records every `(key, value)` pair an eviction hook receives, in call order.
#[derive(Clone, Default)]
pub struct EvictionLog {
    pub evicted: Arc<Mutex<Vec<(String, Result<u32, String>)>>>,
}

impl EvictionLog {
    /// A hook closure that appends to this log.
    pub fn hook(&self) -> impl Fn(&str, Result<u32, String>) + Send + Sync + 'static {
        let evicted = Arc::clone(&self.evicted);
        move |key: &str, value: Result<u32, String>| {
            evicted.lock().unwrap().push((key.to_owned(), value));
        }
    }

    /// Keys evicted so far, in eviction order.
    pub fn keys(&self) -> Vec<String> {
        self.evicted
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// A reader that flags when it is dropped, i.e. when the underlying stream is closed.
pub struct TrackedReader {
    inner: DuplexStream,
    dropped: Arc<AtomicBool>,
}

impl TrackedReader {
    pub fn new(inner: DuplexStream) -> (Self, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner,
                dropped: Arc::clone(&dropped),
            },
            dropped,
        )
    }
}

impl AsyncRead for TrackedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

/// A reader that yields `prefix` once and then fails.
pub struct FailingReader {
    prefix: Option<Vec<u8>>,
}

impl FailingReader {
    pub fn new(prefix: &[u8]) -> Self {
        Self {
            prefix: Some(prefix.to_vec()),
        }
    }
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.prefix.take() {
            Some(prefix) => {
                buf.put_slice(&prefix);
                Poll::Ready(Ok(()))
            }
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))),
        }
    }
}

/// Deterministic content: byte `i` of a stream is `i % 251`.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Poll `cond` until it holds, or panic after five seconds.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{what} did not happen within 5 seconds");
}

/// Wait until the pump of `buffer` stopped.
pub async fn wait_until_finished(buffer: &StreamingBuffer) {
    wait_for("stream finish", || buffer.is_finished()).await;
}

/// An opener that counts its calls and yields an empty stream.
pub fn counting_opener(
    calls: &Arc<AtomicUsize>,
) -> impl FnOnce() -> std::future::Ready<io::Result<Empty>> + Send + 'static {
    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(tokio::io::empty()))
    }
}
