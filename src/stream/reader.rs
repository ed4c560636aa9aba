//! Stream readers
//!
//! A reader is the consuming side of a stream: it owns one drain task per
//! registered (media, format) cursor, runs the registered callbacks in ring
//! order, and surfaces failures on a single error channel to the session
//! that owns it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ring::RingCursor;
use super::StreamError;
use crate::error::Error;
use crate::media::Unit;

/// Callback invoked for every unit delivered to a reader registration.
///
/// Returning an error detaches the reader and forwards the error to its
/// owning session.
pub type OnUnit = Box<dyn FnMut(Arc<Unit>) -> Result<(), Error> + Send>;

static NEXT_READER_ID: AtomicU64 = AtomicU64::new(1);

/// Capacity of the per-reader error channel
const ERROR_CHANNEL_CAPACITY: usize = 8;

struct ReaderInner {
    id: u64,
    cancel: CancellationToken,
    error_tx: mpsc::Sender<Error>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a stream consumer
///
/// Cheap to clone; all clones refer to the same reader. Dropping the last
/// clone does not stop the drain tasks — use [`StreamReader::cancel`] or
/// `Stream::remove_reader`.
#[derive(Clone)]
pub struct StreamReader {
    inner: Arc<ReaderInner>,
}

impl StreamReader {
    /// Create a reader and the error channel delivered to its owner
    pub fn new() -> (Self, mpsc::Receiver<Error>) {
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        let reader = Self {
            inner: Arc::new(ReaderInner {
                id: NEXT_READER_ID.fetch_add(1, Ordering::Relaxed),
                cancel: CancellationToken::new(),
                error_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        (reader, error_rx)
    }

    /// Unique reader id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Stop all drain tasks; no callback runs after the tasks are joined
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Whether the reader has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Push an error to the owning session without blocking the drain task
    pub(crate) fn report(&self, err: Error) {
        let _ = self.inner.error_tx.try_send(err);
    }

    /// Wait until every drain task has finished
    pub(crate) async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Spawn the drain task for one cursor registration.
    ///
    /// The task delivers units in ring order to `on_unit`. Overflow is
    /// reported on the error channel and draining continues with a gap;
    /// a callback error cancels the whole reader.
    pub(crate) fn spawn_drain(&self, mut cursor: RingCursor, mut on_unit: OnUnit) {
        let reader = self.clone();

        let task = tokio::spawn(async move {
            loop {
                let pulled = tokio::select! {
                    _ = reader.inner.cancel.cancelled() => break,
                    pulled = cursor.pull() => pulled,
                };

                match pulled {
                    Ok(unit) => {
                        if let Err(err) = on_unit(unit) {
                            reader.report(err);
                            reader.inner.cancel.cancel();
                            break;
                        }
                    }
                    Err(StreamError::Overflow { skipped }) => {
                        tracing::debug!(
                            reader_id = reader.id(),
                            skipped,
                            "reader overflowed its buffer"
                        );
                        reader.report(Error::Stream(StreamError::Overflow { skipped }));
                    }
                    Err(_) => break,
                }
            }
        });

        self.inner.tasks.lock().push(task);
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("id", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
