//! Single-fire readiness signalling for the stream pump.
//!
//! The caller that starts a pump waits until "enough" data is buffered. Whichever of these happens
//! first releases it: the stream reads zero bytes, no new bytes arrive for the idle window, or the
//! maximum wait since the open elapses. Several parties race to report readiness, so the sender is
//! kept behind a take-once slot.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::trace;

use super::StreamError;

/// Result delivered to the caller waiting on a pump.
pub(crate) type Readiness = Result<(), StreamError>;

pub(crate) struct ReadySignal {
    tx: Mutex<Option<oneshot::Sender<Readiness>>>,
}

impl ReadySignal {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Readiness>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Deliver `readiness` unless someone already did. Returns `true` if this call delivered it.
    pub(crate) fn fire(&self, readiness: Readiness) -> bool {
        let Some(tx) = self.tx.lock().take() else {
            return false;
        };
        // The waiter may have given up; nothing left to notify in that case.
        let _ = tx.send(readiness);
        true
    }

    pub(crate) fn has_fired(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// Race the idle and maximum-wait timers against pump progress, then fire `signal`.
///
/// `progress` is bumped by the pump every time new bytes land. A quiet `idle` window fires the
/// signal, as does the `max_wait` deadline. The task also ends once the pump drops its sender.
pub(crate) async fn confirm_when_settled(
    signal: &ReadySignal,
    mut progress: watch::Receiver<u64>,
    idle: Duration,
    max_wait: Duration,
) {
    let deadline = tokio::time::sleep(max_wait);
    tokio::pin!(deadline);

    loop {
        if signal.has_fired() {
            return;
        }

        tokio::select! {
            () = &mut deadline => {
                trace!(?max_wait, "Maximum confirmation wait elapsed.");
                break;
            }
            () = tokio::time::sleep(idle) => {
                trace!(?idle, "No new bytes within the idle window.");
                break;
            }
            changed = progress.changed() => {
                if changed.is_err() {
                    // The pump is gone and has already fired the signal on its way out.
                    return;
                }
            }
        }
    }

    signal.fire(Ok(()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_exactly_once() {
        let (signal, mut rx) = ReadySignal::new();
        assert!(signal.fire(Ok(())));
        assert!(!signal.fire(Err(StreamError::PumpPanicked)));
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_window_fires_without_progress() {
        let (signal, mut rx) = ReadySignal::new();
        let (_progress_tx, progress_rx) = watch::channel(0u64);

        confirm_when_settled(
            &signal,
            progress_rx,
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[tokio::test(start_paused = true)]
    async fn steady_progress_is_capped_by_max_wait() {
        let (signal, mut rx) = ReadySignal::new();
        let (progress_tx, progress_rx) = watch::channel(0u64);

        let ticker = tokio::spawn(async move {
            for n in 1.. {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if progress_tx.send(n).is_err() {
                    return;
                }
            }
        });

        let started = tokio::time::Instant::now();
        confirm_when_settled(
            &signal,
            progress_rx,
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
        .await;
        ticker.abort();

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }
}
