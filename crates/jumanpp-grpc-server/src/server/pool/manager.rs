//! Event dispatch for in-flight calls.
//!
//! The [`Dispatcher`] owns every live call in an arena keyed by [`CallId`] and
//! routes completion [`Event`]s to them through two queues:
//!
//! - the I/O queue, drained by a few Tokio tasks, for accept/read/write
//!   completions that never block;
//! - the compute queue, drained by dedicated OS threads, for analyzer
//!   acquisition and analysis, which may occupy a thread for a long time.
//!
//! Keeping them apart means a burst of long analyses never delays accepting or
//! writing on other calls. A call is disposed as soon as one of its
//! transitions reports [`Progress::Done`]; events still in flight for it are
//! dropped, which releases any analyzer lease they carry.

use super::{
    event::{Call, CallId, Event, Progress, Queue, WorkRequest},
    worker::{compute_loop, io_loop},
};
use core::{future::Future, time::Duration};
use jumanpp_grpc_core::{Error, Result};
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    calls: Mutex<HashMap<CallId, Arc<dyn Call>>>,
    next_call: AtomicU64,
    accepting: AtomicBool,
    io: mpsc::UnboundedSender<WorkRequest>,
    compute: mpsc::UnboundedSender<WorkRequest>,
    io_workers: usize,
    compute_workers: usize,
    runtime: Handle,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl Dispatcher {
    /// Spawns the I/O workers on the current Tokio runtime and the compute
    /// workers as named OS threads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if called outside a Tokio runtime or a
    /// compute thread cannot be spawned.
    pub fn start(
        io_workers: usize,
        compute_workers: usize,
        shutdown_timeout: Duration,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::internal(format!("dispatcher needs a Tokio runtime: {e}")))?;

        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let (compute_tx, compute_rx) = mpsc::unbounded_channel();

        let dispatcher = Self {
            inner: Arc::new(Inner {
                calls: Mutex::new(HashMap::new()),
                next_call: AtomicU64::new(0),
                accepting: AtomicBool::new(true),
                io: io_tx,
                compute: compute_tx,
                io_workers,
                compute_workers,
                runtime: runtime.clone(),
                shutdown_token: CancellationToken::new(),
                shutdown_timeout,
            }),
        };

        // Workers share one receiver per queue; whoever is free takes the
        // next event.
        let io_rx = Arc::new(tokio::sync::Mutex::new(io_rx));
        for worker_id in 0..io_workers {
            runtime.spawn(io_loop(worker_id, Arc::clone(&io_rx), dispatcher.clone()));
        }

        let compute_rx = Arc::new(Mutex::new(compute_rx));
        for worker_id in 0..compute_workers {
            let rx = Arc::clone(&compute_rx);
            let d = dispatcher.clone();
            std::thread::Builder::new()
                .name(format!("jumanpp-compute-{worker_id}"))
                .spawn(move || compute_loop(worker_id, rx, d))
                .map_err(|e| Error::internal(format!("failed to spawn compute worker: {e}")))?;
        }

        Ok(dispatcher)
    }

    /// Registers a new call and delivers its [`Tag::Start`](super::Tag::Start)
    /// event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] once shutdown has begun.
    pub fn accept(&self, call: Arc<dyn Call>) -> Result<CallId> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(Error::ServiceShutdown);
        }

        let id = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "tracing")]
        tracing::trace!("Accepted {} call {id}", call.name());
        self.inner.calls.lock().insert(id, call);
        if let Err(e) = self.send(Queue::Io, Event::new(id, super::Tag::Start)) {
            self.inner.calls.lock().remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Queues an event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] once the queue's workers are gone.
    pub fn send(&self, queue: Queue, event: Event) -> Result<()> {
        let tx = match queue {
            Queue::Io => &self.inner.io,
            Queue::Compute => &self.inner.compute,
        };
        tx.send(WorkRequest::Event(event))
            .map_err(|_| Error::ChannelError {
                context: format!("{queue:?} queue closed"),
            })
    }

    /// Queues an event. If the queue is gone the event is dropped.
    pub fn post(&self, queue: Queue, event: Event) {
        if let Err(_e) = self.send(queue, event) {
            #[cfg(feature = "tracing")]
            tracing::warn!("{_e}, dropping event");
        }
    }

    /// Runs a future on the runtime the dispatcher was started on.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.runtime.spawn(fut);
    }

    /// A token cancelled when the dispatcher shuts down, for a single call's
    /// background I/O.
    pub fn call_token(&self) -> CancellationToken {
        self.inner.shutdown_token.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        !self.inner.accepting.load(Ordering::Acquire)
    }

    /// Number of calls not yet disposed.
    pub fn inflight(&self) -> usize {
        self.inner.calls.lock().len()
    }

    /// Hands `event` to its call and disposes the call once it is done.
    pub(super) fn dispatch(&self, event: Event) {
        let call = self.inner.calls.lock().get(&event.call).cloned();
        let Some(call) = call else {
            #[cfg(feature = "tracing")]
            tracing::trace!(
                "Dropping {} event for disposed call {}",
                event.tag.name(),
                event.call
            );
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(
            "{} call {}: {} (ok = {})",
            call.name(),
            event.call,
            event.tag.name(),
            event.ok
        );

        if call.proceed(event.call, event.tag, event.ok, self) == Progress::Done {
            self.inner.calls.lock().remove(&event.call);
        }
    }

    /// Gracefully shuts down the dispatcher.
    ///
    /// - Refuses new calls.
    /// - Waits up to `shutdown_timeout` for in-flight calls to finish.
    /// - Cancels the background I/O of whatever is left.
    /// - Sends a [`WorkRequest::Shutdown`] to each worker and waits (up to 3
    ///   seconds per worker) for acknowledgements.
    pub async fn shutdown(&self) -> Result<()> {
        // === Phase 0: Stop accepting new calls ===
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new requests");
        self.inner.accepting.store(false, Ordering::Release);

        // === Phase 1: Wait for in-flight calls to drain ===
        #[cfg(feature = "tracing")]
        tracing::info!("Draining in-flight calls ({} active)", self.inflight());
        let drain_result = timeout(self.inner.shutdown_timeout, async {
            while self.inflight() > 0 {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        match drain_result {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("All in-flight calls drained successfully");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Graceful drain timed out ({} calls still active)",
                    self.inflight()
                );
            }
        }

        // === Phase 2: Cancel any remaining work ===
        #[cfg(feature = "tracing")]
        tracing::debug!("Cancelling remaining work via shutdown token");
        self.inner.shutdown_token.cancel();

        // === Phase 3: Notify workers to shut down ===
        #[cfg(feature = "tracing")]
        tracing::debug!("Notifying all workers to shut down");
        let queues = [
            (Queue::Io, &self.inner.io, self.inner.io_workers),
            (Queue::Compute, &self.inner.compute, self.inner.compute_workers),
        ];
        let mut shutdown_handles = Vec::new();

        for (queue, tx, workers) in queues {
            for i in 0..workers {
                let (response, rx) = oneshot::channel();
                if tx.send(WorkRequest::Shutdown { response }).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Failed to send shutdown to {queue:?} worker {i}");
                } else {
                    shutdown_handles.push((queue, i, rx));
                }
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Waiting for up to 3s per worker for shutdown acknowledgements");

        let timeout_futures =
            shutdown_handles
                .into_iter()
                .map(|(_queue, _i, rx)| async move {
                    match timeout(Duration::from_secs(3), rx).await {
                        Ok(Ok(())) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!("{_queue:?} worker {_i} shutdown acknowledged");
                        }
                        Ok(Err(_e)) => {
                            #[cfg(feature = "tracing")]
                            tracing::error!("{_queue:?} worker {_i} returned error: {_e}");
                        }
                        Err(_) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!("{_queue:?} worker {_i} shutdown timed out");
                        }
                    }
                });

        futures::future::join_all(timeout_futures).await;

        // Anything still registered can no longer make progress.
        let abandoned = core::mem::take(&mut *self.inner.calls.lock());
        drop(abandoned);

        #[cfg(feature = "tracing")]
        tracing::info!("Dispatcher shutdown complete");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::pool::Tag;

    /// Counts its events and finishes on the second one.
    struct TwoStep {
        seen: AtomicU64,
        done: Mutex<Option<oneshot::Sender<Vec<&'static str>>>>,
        tags: Mutex<Vec<&'static str>>,
    }

    impl Call for TwoStep {
        fn name(&self) -> &'static str {
            "two_step"
        }

        fn proceed(&self, id: CallId, tag: Tag, _ok: bool, dispatcher: &Dispatcher) -> Progress {
            self.tags.lock().push(tag.name());
            if self.seen.fetch_add(1, Ordering::SeqCst) == 0 {
                dispatcher.post(Queue::Compute, Event::new(id, Tag::Compute));
                return Progress::Pending;
            }
            if let Some(tx) = self.done.lock().take() {
                let _ = tx.send(self.tags.lock().clone());
            }
            Progress::Done
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn routes_events_and_disposes_finished_calls() {
        let dispatcher = Dispatcher::start(1, 2, Duration::from_secs(1)).unwrap();
        let (tx, rx) = oneshot::channel();
        let call = Arc::new(TwoStep {
            seen: AtomicU64::new(0),
            done: Mutex::new(Some(tx)),
            tags: Mutex::new(Vec::new()),
        });

        let id = dispatcher.accept(call).unwrap();
        assert_eq!(rx.await.unwrap(), vec!["start", "compute"]);

        // Disposal happens right after the final transition returns.
        timeout(Duration::from_secs(1), async {
            while dispatcher.inflight() > 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Late events for a disposed call are ignored.
        dispatcher.post(Queue::Io, Event::new(id, Tag::OutputReady));
        dispatcher.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refuses_calls_after_shutdown() {
        let dispatcher = Dispatcher::start(1, 1, Duration::from_millis(100)).unwrap();
        dispatcher.shutdown().await.unwrap();
        assert!(dispatcher.is_shutting_down());

        let call = Arc::new(TwoStep {
            seen: AtomicU64::new(0),
            done: Mutex::new(None),
            tags: Mutex::new(Vec::new()),
        });
        assert!(matches!(
            dispatcher.accept(call),
            Err(Error::ServiceShutdown)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_fails_once_workers_are_gone() {
        let dispatcher = Dispatcher::start(1, 1, Duration::from_millis(100)).unwrap();
        assert!(dispatcher.send(Queue::Io, Event::new(0, Tag::Start)).is_ok());
        dispatcher.shutdown().await.unwrap();

        // Workers drop their receivers right after acknowledging.
        let closed = timeout(Duration::from_secs(1), async {
            loop {
                for queue in [Queue::Io, Queue::Compute] {
                    if let Err(e) = dispatcher.send(queue, Event::new(0, Tag::Start)) {
                        return e;
                    }
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(closed, Error::ChannelError { .. }));
    }
}
