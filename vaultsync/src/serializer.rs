//! Per-user write serializer
//!
//! Every mutation of a user space runs through that user's lane: a bounded
//! FIFO channel drained by one worker task, so at most one write per uid is
//! executing at any instant. Lanes for different users are independent
//! tasks and never wait on each other.
//!
//! Lanes are created on first use and retired after sitting idle. Shutdown
//! closes every lane, waits for queued work up to a deadline and reports
//! whatever was still queued when it expired.

use crate::config::{EngineConfig, QueueFullPolicy};
use crate::error::{EngineError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type QueuedWrite = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Lane {
    tx: mpsc::Sender<QueuedWrite>,
    queued: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

struct Inner {
    lanes: Mutex<HashMap<i64, Lane>>,
    capacity: usize,
    policy: QueueFullPolicy,
    default_timeout: Duration,
    idle_timeout: Duration,
    closing: AtomicBool,
}

/// Funnels writes for each uid through a single ordered queue
#[derive(Clone)]
pub struct WriteSerializer {
    inner: Arc<Inner>,
}

impl WriteSerializer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                lanes: Mutex::new(HashMap::new()),
                capacity: config.write_queue_capacity.max(1),
                policy: config.queue_full_policy,
                default_timeout: config.write_timeout(),
                idle_timeout: config.queue_idle_timeout(),
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// Run `f` in the lane of `uid` with the configured write timeout.
    pub async fn execute<F, Fut, T>(&self, uid: i64, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.execute_with_timeout(uid, self.inner.default_timeout, f)
            .await
    }

    /// Run `f` in the lane of `uid`, giving up after `timeout`.
    ///
    /// The timeout covers queueing and execution. A write that has not started
    /// when the caller gives up is skipped; one that has started runs to
    /// completion.
    pub async fn execute_with_timeout<F, Fut, T>(
        &self,
        uid: i64,
        timeout: Duration,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if uid <= 0 {
            return Err(EngineError::InvalidInput(format!("invalid uid: {}", uid)));
        }

        let (reply, result) = oneshot::channel::<Result<T>>();
        let task: QueuedWrite = Box::pin(async move {
            if reply.is_closed() {
                tracing::debug!("Skipping write for user {}, caller gave up", uid);
                return;
            }

            let handle = tokio::spawn(async move {
                let outcome = f().await;
                let _ = reply.send(outcome);
            });

            if let Err(e) = handle.await {
                tracing::error!("Write for user {} panicked: {}", uid, e);
            }
        });

        let (tx, queued) = self.lane(uid)?;
        let inner = Arc::clone(&self.inner);

        let submit_and_wait = async move {
            let mut pending = PendingSlot::claim(queued);
            let sent = match inner.policy {
                QueueFullPolicy::Reject => tx.try_send(task).map_err(|e| match e {
                    TrySendError::Full(_) => EngineError::QueueFull { uid },
                    TrySendError::Closed(_) => EngineError::ShuttingDown,
                }),
                QueueFullPolicy::Block => tx
                    .send(task)
                    .await
                    .map_err(|_| EngineError::ShuttingDown),
            };
            drop(tx);

            sent?;
            // The lane worker owns the decrement from here on
            pending.hand_off();

            match result.await {
                Ok(outcome) => outcome,
                Err(_) if inner.closing.load(Ordering::SeqCst) => Err(EngineError::ShuttingDown),
                Err(_) => Err(EngineError::WriteAborted(
                    "write ended without a result".to_string(),
                )),
            }
        };

        match tokio::time::timeout(timeout, submit_and_wait).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!("Write for user {} timed out after {:?}", uid, timeout);
                Err(EngineError::WriteTimeout { uid })
            }
        }
    }

    /// Writes queued for `uid` and not yet started
    pub fn queue_depth(&self, uid: i64) -> usize {
        match self.inner.lanes.lock() {
            Ok(lanes) => lanes
                .get(&uid)
                .map(|lane| lane.queued.load(Ordering::SeqCst))
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Sender for the lane of `uid`, starting the lane if needed.
    fn lane(&self, uid: i64) -> Result<(mpsc::Sender<QueuedWrite>, Arc<AtomicUsize>)> {
        let mut lanes = self
            .inner
            .lanes
            .lock()
            .map_err(|_| EngineError::Generic("write lanes poisoned".to_string()))?;

        // Checked under the lock so no lane is created after shutdown took them
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        let lane = lanes.entry(uid).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.inner.capacity);
            let queued = Arc::new(AtomicUsize::new(0));
            let handle = tokio::spawn(run_lane(
                Arc::clone(&self.inner),
                uid,
                rx,
                Arc::clone(&queued),
            ));
            tracing::debug!("Started write lane for user {}", uid);
            Lane { tx, queued, handle }
        });

        Ok((lane.tx.clone(), Arc::clone(&lane.queued)))
    }

    /// Stop accepting writes and drain every lane within `deadline`.
    ///
    /// Writes still queued when the deadline passes are dropped, their callers
    /// receive `ShuttingDown`, and the count is returned as
    /// `ShutdownIncomplete`. Writes already running finish on their own.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let lanes: Vec<(i64, Lane)> = {
            let mut lanes = self
                .inner
                .lanes
                .lock()
                .map_err(|_| EngineError::Generic("write lanes poisoned".to_string()))?;
            self.inner.closing.store(true, Ordering::SeqCst);
            lanes.drain().collect()
        };

        tracing::info!("Draining {} write lanes", lanes.len());

        let mut workers: Vec<(JoinHandle<()>, Arc<AtomicUsize>)> = lanes
            .into_iter()
            .map(|(_, lane)| {
                drop(lane.tx);
                (lane.handle, lane.queued)
            })
            .collect();

        let drain = async {
            for (handle, _) in workers.iter_mut() {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(deadline, drain).await.is_ok() {
            tracing::info!("Write lanes drained");
            return Ok(());
        }

        let abandoned: usize = workers
            .iter()
            .map(|(_, queued)| queued.load(Ordering::SeqCst))
            .sum();
        for (handle, _) in &workers {
            handle.abort();
        }

        tracing::warn!(
            "Write drain deadline of {:?} exceeded, abandoned {} queued writes",
            deadline,
            abandoned
        );
        Err(EngineError::ShutdownIncomplete { abandoned })
    }
}

/// One slot in a lane's queued count, released on drop unless the write
/// reached the channel.
struct PendingSlot {
    queued: Arc<AtomicUsize>,
    armed: bool,
}

impl PendingSlot {
    fn claim(queued: Arc<AtomicUsize>) -> Self {
        queued.fetch_add(1, Ordering::SeqCst);
        Self {
            queued,
            armed: true,
        }
    }

    fn hand_off(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if self.armed {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

async fn run_lane(
    inner: Arc<Inner>,
    uid: i64,
    mut rx: mpsc::Receiver<QueuedWrite>,
    queued: Arc<AtomicUsize>,
) {
    loop {
        let task = match tokio::time::timeout(inner.idle_timeout, rx.recv()).await {
            Ok(Some(task)) => task,
            Ok(None) => break,
            Err(_) => {
                let Ok(mut lanes) = inner.lanes.lock() else {
                    break;
                };
                match rx.try_recv() {
                    Ok(task) => task,
                    Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {
                        // Only the lane's own sender left means no caller is mid-submit
                        let idle = lanes
                            .get(&uid)
                            .map_or(true, |lane| lane.tx.strong_count() == 1);
                        if idle {
                            lanes.remove(&uid);
                            tracing::debug!("Retired idle write lane for user {}", uid);
                            break;
                        }
                        continue;
                    }
                }
            }
        };

        queued.fetch_sub(1, Ordering::SeqCst);
        task.await;
    }
}
