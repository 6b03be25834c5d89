//! Background recompute worker.
//!
//! Materialization and classification are pure functions of the store and an
//! implemented-partition snapshot, so they can run off the interaction thread.
//! A single worker drains a bounded queue; every result carries the
//! fingerprint of the snapshot it was computed from so the caller can discard
//! it if the log moved on in the meantime.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::debug;

use crate::classify::{classify, Classification};
use crate::error::{ExecutionError, ProofError, ProofResult};
use crate::log::{Fingerprint, LogSnapshot};
use crate::store::LineageStore;
use crate::working::{materialize, Materialized};

/// Output of one background recompute.
#[derive(Debug, Clone)]
pub struct Recomputed {
    /// Materialized working graph.
    pub materialized: Materialized,
    /// Classification of that graph.
    pub classification: Classification,
}

impl Recomputed {
    /// Computes both stages in the calling thread.
    #[must_use]
    pub fn compute(store: &LineageStore, snapshot: &LogSnapshot, record_labels: bool) -> Self {
        let materialized = materialize(store, snapshot);
        let classification = classify(store, &materialized.working, record_labels);
        Self {
            materialized,
            classification,
        }
    }

    /// Fingerprint of the snapshot this was computed from.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.materialized.fingerprint
    }
}

enum Job {
    Recompute {
        store: Arc<LineageStore>,
        snapshot: LogSnapshot,
        record_labels: bool,
        reply: Sender<Recomputed>,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

/// Handle to a submitted recompute.
#[derive(Debug)]
pub struct RecomputeHandle {
    fingerprint: Fingerprint,
    rx: Receiver<Recomputed>,
}

impl RecomputeHandle {
    /// Fingerprint of the submitted snapshot.
    #[must_use]
    pub const fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Waits for the result.
    ///
    /// # Errors
    /// `Disconnected` if the worker exited before replying.
    pub fn join(self) -> ProofResult<Recomputed> {
        self.rx
            .recv()
            .map_err(|_| ProofError::Execution(ExecutionError::Disconnected))
    }

    /// Waits for the result with a timeout.
    ///
    /// # Errors
    /// `Timeout` if no result arrived in time, `Disconnected` if the worker
    /// exited before replying.
    pub fn join_timeout(self, timeout: Duration) -> ProofResult<Recomputed> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ProofError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => ProofError::Execution(ExecutionError::Disconnected),
        })
    }

    /// Returns the result if it is ready.
    ///
    /// # Errors
    /// `Disconnected` if the worker exited before replying.
    pub fn try_take(&self) -> ProofResult<Option<Recomputed>> {
        match self.rx.try_recv() {
            Ok(result) => Ok(Some(result)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ProofError::Execution(ExecutionError::Disconnected)),
        }
    }
}

/// Single background worker behind a bounded queue.
pub struct Recomputer {
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    queue_capacity: usize,
}

impl std::fmt::Debug for Recomputer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recomputer")
            .field("queue_capacity", &self.queue_capacity)
            .field("running", &self.worker.is_some())
            .finish()
    }
}

impl Recomputer {
    /// Spawns the worker.
    ///
    /// # Errors
    /// `ProofError::Internal` if the thread cannot be spawned.
    pub fn start(queue_capacity: usize) -> ProofResult<Self> {
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);
        let worker = thread::Builder::new()
            .name("trackproof-recompute".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Recompute {
                            store,
                            snapshot,
                            record_labels,
                            reply,
                        } => {
                            let result = Recomputed::compute(&store, &snapshot, record_labels);
                            // The caller may have dropped the handle.
                            let _ = reply.send(result);
                        }

                        #[cfg(test)]
                        Job::Sleep { duration, reply } => {
                            thread::sleep(duration);
                            let _ = reply.send(());
                        }
                    }
                }
            })
            .map_err(|e| ProofError::internal(format!("failed to spawn recompute worker: {e}")))?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            queue_capacity,
        })
    }

    /// Queues a recompute of `snapshot`.
    ///
    /// # Errors
    /// `QueueFull` if the queue is at capacity, `Disconnected` if the worker
    /// has exited.
    pub fn submit(
        &self,
        store: Arc<LineageStore>,
        snapshot: LogSnapshot,
        record_labels: bool,
    ) -> ProofResult<RecomputeHandle> {
        let fingerprint = snapshot.fingerprint();
        let (reply, rx) = bounded(1);
        self.try_send(Job::Recompute {
            store,
            snapshot,
            record_labels,
            reply,
        })?;
        debug!(fingerprint = %fingerprint, "recompute queued");
        Ok(RecomputeHandle { fingerprint, rx })
    }

    /// Queue bound.
    #[must_use]
    pub const fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    fn try_send(&self, job: Job) -> ProofResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(ProofError::Execution(ExecutionError::Disconnected))?;
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ProofError::Execution(ExecutionError::QueueFull {
                capacity: self.queue_capacity,
            })),
            Err(TrySendError::Disconnected(_)) => Err(ProofError::Execution(ExecutionError::Disconnected)),
        }
    }

    /// Stops accepting work, drains the queue and joins the worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    #[cfg(test)]
    fn submit_sleep(&self, duration: Duration) -> ProofResult<Receiver<()>> {
        let (reply, rx) = bounded(1);
        self.try_send(Job::Sleep { duration, reply })?;
        Ok(rx)
    }
}

impl Drop for Recomputer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::Correction;
    use crate::graph::LineageGraph;
    use crate::log::CorrectionLog;
    use crate::table::TrackTable;
    use crate::vertex::{Position, TrackId, Vertex};
    use crate::volume::{ArrayLike, Volume};

    fn store() -> Arc<LineageStore> {
        let image: Arc<dyn ArrayLike> = Arc::new(Volume::<u8>::zeros(vec![4, 1, 2, 2]));
        let table = TrackTable::from_vertices((0..3).map(|t| Vertex::new(TrackId(1), t, 0.0, 0.0, 0.0)));
        Arc::new(LineageStore::load(table, image, None, Some(LineageGraph::new())).unwrap())
    }

    #[test]
    fn test_result_matches_inline_compute() {
        let s = store();
        let mut log = CorrectionLog::new();
        let id = log
            .propose_correction(Correction::NewVertex {
                track: TrackId(1),
                position: Position::new(3, 0.0, 0.0, 0.0),
            })
            .unwrap();
        log.mark_implemented(id).unwrap();

        let worker = Recomputer::start(2).unwrap();
        let handle = worker.submit(Arc::clone(&s), log.snapshot(), true).unwrap();
        assert_eq!(handle.fingerprint(), log.fingerprint());
        let result = handle.join_timeout(Duration::from_secs(5)).unwrap();

        let inline = Recomputed::compute(&s, &log.snapshot(), true);
        assert_eq!(result.materialized.working, inline.materialized.working);
        assert_eq!(result.classification, inline.classification);
        assert_eq!(result.fingerprint(), log.fingerprint());
        worker.shutdown();
    }

    #[test]
    fn test_queue_full_is_reported() {
        let worker = Recomputer::start(1).unwrap();
        let busy = worker.submit_sleep(Duration::from_millis(300)).unwrap();
        // Give the worker time to pick up the sleep job.
        thread::sleep(Duration::from_millis(50));
        let _queued = worker.submit_sleep(Duration::from_millis(1)).unwrap();

        let err = worker.submit(store(), LogSnapshot::empty(), false).unwrap_err();
        assert!(matches!(
            err,
            ProofError::Execution(ExecutionError::QueueFull { capacity: 1 })
        ));
        busy.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_join_timeout() {
        let worker = Recomputer::start(2).unwrap();
        let _busy = worker.submit_sleep(Duration::from_millis(300)).unwrap();
        let handle = worker.submit(store(), LogSnapshot::empty(), false).unwrap();
        let err = handle.join_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, ProofError::Execution(ExecutionError::Timeout { .. })));
    }
}
